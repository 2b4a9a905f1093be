//! Store traits shared by the scheduler, the reaper and the workers.
//!
//! Every operation whose write depends on a prior read (schedule, claim,
//! reap, terminal transitions) is a single atomic call on the store, never a
//! read followed by a separate write in the caller.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use feedsync_core::{
    Job, JobFilter, JobId, NewSource, ScheduledJob, Source, SourceId, WorkerId,
};

use crate::error::StoreError;

/// Per-source configuration and the success watermark.
#[async_trait]
pub trait SourceRegistry: Send + Sync {
    /// Register a new source. Duplicate names and a zero interval are
    /// rejected with [`StoreError::ConstraintViolation`].
    async fn register_source(&self, req: NewSource, now: DateTime<Utc>) -> Result<Source, StoreError>;

    async fn get_source(&self, id: SourceId) -> Result<Option<Source>, StoreError>;

    /// All sources, ordered by id.
    async fn list_sources(&self) -> Result<Vec<Source>, StoreError>;

    async fn set_active(&self, id: SourceId, active: bool, now: DateTime<Utc>) -> Result<Source, StoreError>;

    async fn set_interval(&self, id: SourceId, minutes: u32, now: DateTime<Utc>) -> Result<Source, StoreError>;

    /// Advance `last_collected_at`. Called by the worker only after the job
    /// reached `SUCCEEDED`.
    async fn record_successful_collection(
        &self,
        id: SourceId,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Mark the last attempt as failed. Leaves `last_collected_at` alone so
    /// the source stays due.
    async fn record_failed_collection(
        &self,
        id: SourceId,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Job rows and their state machine.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert one PENDING job for every active, due source that has no
    /// PENDING/PROCESSING job, as one atomic unit. Either every eligible
    /// source gets a job or, on error, none does.
    async fn schedule_due_sources(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError>;

    /// Atomically take the oldest PENDING job (optionally for one source)
    /// and flip it to PROCESSING on behalf of `worker`.
    async fn claim_next_pending(
        &self,
        worker: WorkerId,
        source: Option<SourceId>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Claim a specific job; fails unless it is still PENDING.
    async fn mark_processing(&self, id: JobId, worker: WorkerId, now: DateTime<Utc>) -> Result<Job, StoreError>;

    /// PROCESSING -> SUCCEEDED, only by the holder.
    async fn mark_succeeded(&self, id: JobId, worker: WorkerId, now: DateTime<Utc>) -> Result<Job, StoreError>;

    /// PROCESSING -> FAILED, only by the holder. `detail` is truncated.
    async fn mark_failed(
        &self,
        id: JobId,
        worker: WorkerId,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// Fail every PROCESSING job whose `started_at` is older than
    /// `now - max_processing`. Returns the jobs that were flipped.
    async fn reap_stale(&self, max_processing: Duration, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Jobs matching `filter`, newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;
}

/// A complete backing store: both relations behind one handle.
pub trait FeedStore: SourceRegistry + JobQueue {}

impl<T: SourceRegistry + JobQueue> FeedStore for T {}

/// Check that `job` may move to `to` on behalf of `worker`.
///
/// `worker` is `None` for the claim itself (PENDING jobs have no holder).
pub(crate) fn check_transition(
    job: &Job,
    to: feedsync_core::JobStatus,
    worker: Option<WorkerId>,
) -> Result<(), StoreError> {
    if !job.status.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            job: job.id,
            from: job.status,
            to,
        });
    }
    if let Some(worker) = worker {
        if job.claimed_by != Some(worker) {
            return Err(StoreError::NotHolder { job: job.id });
        }
    }
    Ok(())
}
