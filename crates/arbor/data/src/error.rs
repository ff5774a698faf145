use thiserror::Error;

/// Result type for data operations.
pub type DataResult<T> = Result<T, DataError>;

/// Data-layer errors.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    #[error("database already exists: {0}")]
    DatabaseExists(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("connection to {0} is closed")]
    Disconnected(String),

    #[error("transaction {0} is no longer active")]
    TransactionClosed(String),

    #[error("backend error: {0}")]
    Backend(String),
}
