use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    StringError(String),

    #[error("SQL Error")]
    SqlError(#[from] sqlx::error::Error),

    #[error("Database Configuration Error: {0}")]
    ConfigError(String),

    #[error("Connection pool closed")]
    PoolClosed,

    #[error("timed out")]
    TimeoutError,
}
