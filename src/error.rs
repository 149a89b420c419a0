/// Errors produced while analyzing images or persisting their history.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid image reference {reference:?}: {reason}")]
    ReferenceParse { reference: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("deadline exceeded")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("failed to decode manifest: {0}")]
    ManifestDecode(#[source] serde_json::Error),

    #[error("invalid media type {found:?}, expected {expected:?}")]
    MediaTypeMismatch { expected: String, found: String },

    #[error("invalid digest: {0:?}")]
    DigestFormat(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("expected exactly one image named {name:?}, found {count}")]
    Ambiguous { name: String, count: usize },

    #[error("too many pending tasks, try again later")]
    QueueFull,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn reference(reference: &str, reason: impl Into<String>) -> Self {
        Error::ReferenceParse {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }

    /// Cancellation and deadline expiry abandon a task instead of failing it.
    pub fn is_abandon(&self) -> bool {
        matches!(self, Error::Timeout | Error::Cancelled)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
