use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuiverError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Backend request error: {0}")]
    Backend(#[from] reqwest::Error),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Function execution timed out")]
    Timeout,

    #[error("Failed to load function: {0}")]
    Load(String),

    #[error("Function not found: {0}")]
    NotFound(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, QuiverError>;
