use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PeerdropError>;

#[derive(Error, Debug)]
pub enum PeerdropError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed transfer header: {0}")]
    MalformedHeader(String),

    #[error("Integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}
