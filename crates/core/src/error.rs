use thiserror::Error;

pub type AdweaveResult<T> = Result<T, AdweaveError>;

#[derive(Error, Debug)]
pub enum AdweaveError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("NATS messaging error: {0}")]
    Nats(String),

    #[error("Entity store error: {0}")]
    Store(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Stage handler invocation error: {0}")]
    Invoke(String),

    #[error("Stage handler timed out after {0}s")]
    InvokeTimeout(u64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
