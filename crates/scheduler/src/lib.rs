//! Job scheduling, stale-job reaping and the worker runtime for feedsync.

pub mod cadence;
pub mod collector;
pub mod error;
pub mod reaper;
pub mod scheduler;
pub mod service;
pub mod worker;

pub use cadence::Cadence;
pub use collector::{CollectionReport, FeedCollector, HttpFeedCollector};
pub use error::{CollectError, SchedulerError, WorkerError};
pub use reaper::{ReapReport, Reaper};
pub use scheduler::{PassSummary, Scheduler};
pub use service::Service;
pub use worker::{DrainReport, JobOutcome, Worker};
