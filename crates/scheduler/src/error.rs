use std::time::Duration;

use thiserror::Error;

use feedsync_queue::StoreError;

/// Failure of a scheduling or reaping pass. A failed pass created or
/// changed nothing; the next tick is the retry.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("pass exceeded its {0:?} budget")]
    Timeout(Duration),
}

impl SchedulerError {
    pub fn is_transient(&self) -> bool {
        match self {
            SchedulerError::Store(e) => e.is_transient(),
            SchedulerError::Timeout(_) => true,
        }
    }
}

/// Failure of the worker's own bookkeeping. Collector failures are recorded
/// on the job and never surface here.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a collector could not fetch a source. Recorded as the job's
/// `error_detail`.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("feed returned HTTP {status}")]
    Status { status: u16 },

    #[error("collection timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_transient() {
        assert!(SchedulerError::Timeout(Duration::from_secs(30)).is_transient());
        assert_eq!(
            SchedulerError::Timeout(Duration::from_secs(30)).to_string(),
            "pass exceeded its 30s budget"
        );
    }

    #[test]
    fn constraint_violation_is_not_transient() {
        let err = SchedulerError::from(StoreError::ConstraintViolation("dup".into()));
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "constraint violation: dup");
    }
}
