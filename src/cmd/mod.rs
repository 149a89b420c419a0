pub mod analyze;
pub mod serve;
pub mod storage;
