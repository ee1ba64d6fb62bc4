use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Missing or invalid field: {0}")]
    Validation(String),

    #[error("Not allowed")]
    Forbidden,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Judge unavailable: {0}")]
    JudgeUnavailable(String),

    #[error("Push delivery error: {0}")]
    Push(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Storage(e.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
