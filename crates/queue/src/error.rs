//! Store error types.

use thiserror::Error;

use feedsync_core::{FeedError, JobId, JobStatus, SourceId};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity, pool exhaustion or I/O. The next periodic pass is the retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("source not found: {0}")]
    SourceNotFound(SourceId),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job {job} cannot move from {from} to {to}")]
    InvalidTransition {
        job: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {job} is not held by this worker")]
    NotHolder { job: JobId },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Whether retrying later (without any change) may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
                StoreError::Unavailable(e.to_string())
            }
            sqlx::Error::Io(ref io) => StoreError::Unavailable(io.to_string()),
            sqlx::Error::Tls(ref tls) => StoreError::Unavailable(tls.to_string()),
            sqlx::Error::Database(ref db_err) => {
                let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
                if code.starts_with("23") {
                    // integrity constraint violation class
                    StoreError::ConstraintViolation(db_err.message().to_string())
                } else if code == "57014" || code.starts_with("08") {
                    // query_canceled (statement_timeout) / connection exception
                    StoreError::Unavailable(db_err.message().to_string())
                } else {
                    StoreError::Database(e)
                }
            }
            other => StoreError::Database(other),
        }
    }
}

impl From<FeedError> for StoreError {
    fn from(e: FeedError) -> Self {
        match e {
            FeedError::InvalidInterval(_) => StoreError::ConstraintViolation(e.to_string()),
            other => StoreError::Decode(other.to_string()),
        }
    }
}
