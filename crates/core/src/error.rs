use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("interval_minutes must be greater than zero (got {0})")]
    InvalidInterval(i64),

    #[error("unknown job status: {0}")]
    UnknownJobStatus(String),

    #[error("unknown collection status: {0}")]
    UnknownCollectionStatus(String),

    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}
