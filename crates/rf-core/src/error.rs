//! Error types shared by the reader pipeline and the track compositor

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum RfError {
    /// Invalid output format, or an operation called before its setup step
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    /// Reader not started, or suspended
    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Reader is closed")]
    Closed,

    #[error("Codec error: {0}")]
    Codec(String),

    /// A pipeline thread terminated on an unrecoverable error
    #[error("Fatal pipeline error: {0}")]
    Fatal(String),

    #[error("Thread error: {0}")]
    Thread(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RfError {
    fn from(e: serde_json::Error) -> Self {
        RfError::Serialization(e.to_string())
    }
}

/// Result type alias
pub type RfResult<T> = Result<T, RfError>;
