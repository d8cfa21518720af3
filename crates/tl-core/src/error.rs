//! Error types for the timeline engine

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum TlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("Peak file error: {0}")]
    PeakFormat(String),

    #[error("Peak data not available yet")]
    PeakUnavailable,

    #[error("Source error: {0}")]
    Source(String),

    #[error("Recording error: {0}")]
    Recording(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("Buffer underrun")]
    BufferUnderrun,

    #[error("Buffer overrun")]
    BufferOverrun,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("State error: {0}")]
    State(String),
}

impl From<serde_json::Error> for TlError {
    fn from(e: serde_json::Error) -> Self {
        TlError::Serialization(e.to_string())
    }
}

/// Result type alias
pub type TlResult<T> = Result<T, TlError>;
