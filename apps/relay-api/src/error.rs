use thiserror::Error;

/// Application-level error type for the realtime core.
///
/// `LockNotObtained` is deliberately absent: losing a job-lock race is an
/// expected outcome, modeled as a boolean, not an error.
#[derive(Debug, Error)]
pub enum Error {
    /// No valid authentication frame arrived within the handshake window.
    #[error("authentication frame not received in time")]
    AuthTimeout,

    /// The authentication frame carried an invalid or expired credential.
    #[error("invalid credential: {0}")]
    AuthInvalid(String),

    /// A sender tried to publish into a group they do not belong to.
    #[error("sender is not a member of the group")]
    NotAMember,

    /// Fatal to the single send; reported to the sender, no fan-out attempted.
    #[error("persist failed: {0}")]
    Persist(#[from] diesel::result::Error),

    #[error("database unavailable: {0}")]
    Pool(#[from] diesel_async::pooled_connection::deadpool::PoolError),

    /// Shared cache/broker failure.
    #[error("coordination store: {0}")]
    Store(String),

    /// Push provider failure, isolated to its batch.
    #[error("push provider: {0}")]
    Provider(String),

    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("job {job}: {message}")]
    JobExecution { job: &'static str, message: String },
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Store(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Provider(err.to_string())
    }
}
