use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Vector store error: {0}")]
    VectorStore(#[from] surrealdb::Error),
    #[error("Tracking store error: {0}")]
    Tracking(#[from] rusqlite::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Permission denied: {0}")]
    Permission(String),
    #[error("LLM parsing error: {0}")]
    LlmParsing(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Processing error: {0}")]
    Processing(String),
    #[error("Deadline exceeded: {0}")]
    Timeout(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}
