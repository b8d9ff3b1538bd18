//! Error types for hifimetal.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Main error type for core operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A metric sink rejected a record.
    #[error("Metric sink error: {0}")]
    Sink(String),

    /// Cross-process metric reduction failed.
    #[error("Reduction error: {0}")]
    Reduce(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
