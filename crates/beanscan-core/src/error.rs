use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frontend error: {0}")]
    Frontend(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Cache corrupted: {0}")]
    CacheCorrupted(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl ScanError {
    /// Cancellation is a control signal, callers should not report it as a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ScanError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
