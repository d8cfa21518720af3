//! File I/O error types

use thiserror::Error;
use tl_core::TlError;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid file: {0}")]
    InvalidFile(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Write error: {0}")]
    WriteError(String),

    #[error("WAV error: {0}")]
    WavError(String),
}

pub type FileResult<T> = Result<T, FileError>;

impl From<hound::Error> for FileError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(e) => FileError::Io(e),
            other => FileError::WavError(other.to_string()),
        }
    }
}

impl From<FileError> for TlError {
    fn from(err: FileError) -> Self {
        match err {
            FileError::Io(e) => TlError::Io(e),
            FileError::WriteError(msg) => TlError::Recording(msg),
            other => TlError::Decode(other.to_string()),
        }
    }
}
