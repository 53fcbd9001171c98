use std::path::PathBuf;

use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
    #[error("Service error: {0}")]
    Service(String),
    #[error("Corrupt row file {}: {reason}", path.display())]
    CorruptRows { path: PathBuf, reason: String },
    #[error("Chunk {index} is incomplete: {completed} of {expected} rows answered")]
    IncompleteChunk {
        index: usize,
        completed: usize,
        expected: usize,
    },
    #[error("Batch processing error: {0}")]
    Processing(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("Internal service error: {0}")]
    InternalError(String),
}
