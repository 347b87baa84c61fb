use thiserror::Error;

/// Errors from repository operations (used by trait definitions in autoflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors from task queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("queue storage error: {0}")]
    Storage(String),

    #[error("invalid job payload: {0}")]
    InvalidPayload(String),
}

impl From<RepositoryError> for QueueError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound => QueueError::NotFound("entity not found".to_string()),
            other => QueueError::Storage(other.to_string()),
        }
    }
}
