use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

pub const DEFAULT_ANALYZER_ADDR: &str = "0.0.0.0:5050";
pub const DEFAULT_STORAGE_ADDR: &str = "0.0.0.0:4040";
pub const DEFAULT_DATABASE: &str = "./database.sqlite3";
pub const DEFAULT_STORE_DIR: &str = "./layer-store";
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Settings shared by everything that runs analysis tasks.
#[derive(Debug, Clone, Args)]
pub struct AnalysisArgs {
    /// Local image storage (one OCI layout per image and tag)
    #[arg(long, env = "LAYER_SIZES_STORE_DIR", default_value = DEFAULT_STORE_DIR)]
    pub store_dir: PathBuf,

    /// Scratch space for extracted images [default: <tmp>/layer-sizes]
    #[arg(long, env = "LAYER_SIZES_SCRATCH_DIR")]
    pub scratch_dir: Option<PathBuf>,

    /// Seconds a task may take before it is abandoned
    #[arg(long, env = "LAYER_SIZES_TASK_TIMEOUT", default_value_t = DEFAULT_TASK_TIMEOUT_SECS)]
    pub task_timeout: u64,
}

impl AnalysisArgs {
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("layer-sizes"))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout)
    }
}

impl Default for AnalysisArgs {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            scratch_dir: None,
            task_timeout: DEFAULT_TASK_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct AnalyzerConfig {
    /// Address the task API listens on
    #[arg(long, env = "LAYER_SIZES_ADDR", default_value = DEFAULT_ANALYZER_ADDR)]
    pub addr: SocketAddr,

    /// Number of tasks processed concurrently
    #[arg(long, env = "LAYER_SIZES_WORKERS", default_value_t = 1)]
    pub workers: usize,

    #[command(flatten)]
    pub analysis: AnalysisArgs,
}

#[derive(Debug, Clone, Args)]
pub struct StorageConfig {
    /// Address the history API listens on
    #[arg(long, env = "LAYER_SIZES_STORAGE_ADDR", default_value = DEFAULT_STORAGE_ADDR)]
    pub addr: SocketAddr,

    /// SQLite database holding image histories
    #[arg(long, env = "LAYER_SIZES_DATABASE", default_value = DEFAULT_DATABASE)]
    pub database: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct AnalyzeConfig {
    /// Image reference: `name[:tag]`, `docker://...`, `oci:<dir>[:tag]` or
    /// `containers-storage:name[:tag]`
    pub image: String,

    /// Output as JSON (optionally to a file)
    #[arg(long, num_args = 0..=1, default_missing_value = "-")]
    pub json: Option<String>,

    /// Record the result in this history database
    #[arg(long, value_name = "DATABASE")]
    pub save: Option<PathBuf>,

    /// Image name to record under [default: the image's own name]
    #[arg(long, requires = "save")]
    pub name: Option<String>,

    /// Directories listed per layer in the text summary
    #[arg(long, default_value_t = 5)]
    pub top: usize,

    /// Directory whose children are listed in the text summary
    #[arg(long, default_value = "/")]
    pub dir: String,

    #[command(flatten)]
    pub analysis: AnalysisArgs,
}
