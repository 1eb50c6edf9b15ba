use thiserror::Error;

/// The stable error taxonomy returned by every [`crate::Queue`] operation. Callers are expected
/// to match on these variants rather than on message text; anything that doesn't fit a named
/// failure mode is wrapped opaquely in [`Error::Database`].
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Database(#[from] taskq_database::Error),

    /// The cancellation signal passed to a blocking call (currently only `Dequeue`) fired
    /// before the call could complete.
    #[error("operation canceled")]
    ContextCanceled,

    /// The referenced task id does not exist.
    #[error("task does not exist")]
    NotExist,

    /// The task exists but is not in the `running` state required for the requested transition.
    #[error("task is not running")]
    NotRunning,

    /// The task was canceled and can no longer be worked on.
    #[error("task was canceled")]
    Canceled,

    /// An update expected to affect exactly one row affected zero.
    #[error("update affected no rows")]
    RowsNotAffected,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Error {
        Error::Database(taskq_database::Error::from(e))
    }
}
