//! Worker runtime: claim a PENDING job, collect its source, finish the job.
//!
//! The success watermark (`last_collected_at`) is written only after the job
//! reached SUCCEEDED under this worker's claim. If the reaper got there first
//! the outcome is [`JobOutcome::Superseded`] and nothing is recorded.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use feedsync_core::{Job, JobId, SourceId, WorkerId};
use feedsync_queue::{FeedStore, JobQueue, SourceRegistry, StoreError};

use crate::collector::{CollectionReport, FeedCollector};
use crate::error::{CollectError, WorkerError};

/// How one claimed job ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded { job: Job, report: CollectionReport },
    Failed { job: Job, detail: String },
    /// The job left PROCESSING under someone else (the reaper) before we finished.
    Superseded { job_id: JobId, source_id: SourceId },
}

impl JobOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            JobOutcome::Succeeded { job, .. } | JobOutcome::Failed { job, .. } => job.id,
            JobOutcome::Superseded { job_id, .. } => *job_id,
        }
    }
}

/// Tally of one drain.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub superseded: u32,
}

impl DrainReport {
    fn record(&mut self, outcome: &JobOutcome) {
        self.processed += 1;
        match outcome {
            JobOutcome::Succeeded { .. } => self.succeeded += 1,
            JobOutcome::Failed { .. } => self.failed += 1,
            JobOutcome::Superseded { .. } => self.superseded += 1,
        }
    }
}

pub struct Worker {
    id: WorkerId,
    store: Arc<dyn FeedStore>,
    collector: Arc<dyn FeedCollector>,
    collect_timeout: Duration,
}

impl Worker {
    pub fn new(store: Arc<dyn FeedStore>, collector: Arc<dyn FeedCollector>, collect_timeout: Duration) -> Self {
        Self {
            id: WorkerId::new(),
            store,
            collector,
            collect_timeout,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Claim and process one job. `Ok(None)` means nothing was pending.
    #[instrument(skip(self), fields(worker = %self.id))]
    pub async fn process_next(&self, source: Option<SourceId>) -> Result<Option<JobOutcome>, WorkerError> {
        let Some(job) = self.store.claim_next_pending(self.id, source, Utc::now()).await? else {
            return Ok(None);
        };
        info!(job_id = %job.id, source_id = %job.source_id, "job claimed");
        self.run(job).await.map(Some)
    }

    /// Process jobs until none is pending or `max_jobs` were handled,
    /// pausing between consecutive jobs.
    #[instrument(skip(self), fields(worker = %self.id))]
    pub async fn drain(
        &self,
        source: Option<SourceId>,
        max_jobs: u32,
        pause: Duration,
    ) -> Result<DrainReport, WorkerError> {
        let mut report = DrainReport::default();
        while report.processed < max_jobs {
            if report.processed > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            match self.process_next(source).await? {
                Some(outcome) => report.record(&outcome),
                None => break,
            }
        }
        if report.processed > 0 {
            info!(
                processed = report.processed,
                succeeded = report.succeeded,
                failed = report.failed,
                superseded = report.superseded,
                "drain finished"
            );
        }
        Ok(report)
    }

    async fn run(&self, job: Job) -> Result<JobOutcome, WorkerError> {
        let source = match self.store.get_source(job.source_id).await? {
            Some(source) => source,
            None => {
                let detail = format!("source {} no longer exists", job.source_id);
                return self.finish_failed(job, detail, false).await;
            }
        };

        let result = match tokio::time::timeout(self.collect_timeout, self.collector.collect(&source)).await {
            Ok(result) => result,
            Err(_) => Err(CollectError::Timeout(self.collect_timeout)),
        };

        match result {
            Ok(report) => self.finish_succeeded(job, report).await,
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    source_id = %job.source_id,
                    collector = self.collector.name(),
                    error = %e,
                    "collection failed"
                );
                self.finish_failed(job, e.to_string(), true).await
            }
        }
    }

    async fn finish_succeeded(&self, job: Job, report: CollectionReport) -> Result<JobOutcome, WorkerError> {
        let finished_at = Utc::now();
        match self.store.mark_succeeded(job.id, self.id, finished_at).await {
            Ok(done) => {
                if let Err(e) = self
                    .store
                    .record_successful_collection(done.source_id, finished_at)
                    .await
                {
                    // job stays SUCCEEDED; the source stays due and is collected again
                    error!(
                        job_id = %done.id,
                        source_id = %done.source_id,
                        error = %e,
                        "job succeeded but the source watermark was not advanced"
                    );
                    return Err(e.into());
                }
                info!(
                    job_id = %done.id,
                    source_id = %done.source_id,
                    bytes = report.bytes,
                    "job succeeded"
                );
                Ok(JobOutcome::Succeeded { job: done, report })
            }
            Err(e) => superseded_or(job, e),
        }
    }

    async fn finish_failed(
        &self,
        job: Job,
        detail: String,
        record_on_source: bool,
    ) -> Result<JobOutcome, WorkerError> {
        let now = Utc::now();
        match self.store.mark_failed(job.id, self.id, &detail, now).await {
            Ok(failed) => {
                if record_on_source {
                    self.store
                        .record_failed_collection(failed.source_id, &detail, now)
                        .await?;
                }
                error!(
                    job_id = %failed.id,
                    source_id = %failed.source_id,
                    error = %detail,
                    "job failed"
                );
                Ok(JobOutcome::Failed { job: failed, detail })
            }
            Err(e) => superseded_or(job, e),
        }
    }
}

/// A rejected terminal mark means the job is no longer ours.
fn superseded_or(job: Job, err: StoreError) -> Result<JobOutcome, WorkerError> {
    match err {
        StoreError::InvalidTransition { .. } | StoreError::NotHolder { .. } => {
            warn!(
                job_id = %job.id,
                source_id = %job.source_id,
                error = %err,
                "job was finished elsewhere; result discarded"
            );
            Ok(JobOutcome::Superseded {
                job_id: job.id,
                source_id: job.source_id,
            })
        }
        other => Err(other.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use feedsync_core::{CollectionStatus, JobStatus, NewSource, Source};
    use feedsync_queue::{InMemoryStore, JobQueue, SourceRegistry};

    struct FixedCollector {
        fail_with: Option<String>,
        calls: AtomicUsize,
    }

    impl FixedCollector {
        fn ok() -> Arc<Self> {
            Arc::new(Self { fail_with: None, calls: AtomicUsize::new(0) })
        }

        fn failing(msg: &str) -> Arc<Self> {
            Arc::new(Self { fail_with: Some(msg.to_string()), calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl FeedCollector for FixedCollector {
        async fn collect(&self, _source: &Source) -> Result<CollectionReport, CollectError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(msg) => Err(CollectError::Other(msg.clone())),
                None => Ok(CollectionReport { bytes: 128, http_status: Some(200) }),
            }
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    struct SlowCollector;

    #[async_trait]
    impl FeedCollector for SlowCollector {
        async fn collect(&self, _source: &Source) -> Result<CollectionReport, CollectError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(CollectionReport::default())
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    async fn seeded(n: usize) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        for i in 0..n {
            store
                .register_source(NewSource::new(format!("s{i}"), format!("https://s{i}.example/rss")), Utc::now())
                .await
                .unwrap();
        }
        store.schedule_due_sources(Utc::now()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn success_records_watermark() {
        let store = seeded(1).await;
        let worker = Worker::new(store.clone(), FixedCollector::ok(), Duration::from_secs(5));

        let outcome = worker.process_next(None).await.unwrap().unwrap();
        let JobOutcome::Succeeded { job, report } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.claimed_by, Some(worker.id()));
        assert_eq!(report.bytes, 128);

        let source = store.get_source(job.source_id).await.unwrap().unwrap();
        assert_eq!(source.last_collected_at, job.finished_at);
        assert_eq!(source.collection_status, CollectionStatus::Ok);

        assert!(worker.process_next(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_records_error_and_keeps_watermark() {
        let store = seeded(1).await;
        let worker = Worker::new(store.clone(), FixedCollector::failing("connection refused"), Duration::from_secs(5));

        let outcome = worker.process_next(None).await.unwrap().unwrap();
        let JobOutcome::Failed { job, detail } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(detail, "connection refused");
        assert_eq!(job.error_detail.as_deref(), Some("connection refused"));

        let source = store.get_source(job.source_id).await.unwrap().unwrap();
        assert!(source.last_collected_at.is_none());
        assert_eq!(source.collection_status, CollectionStatus::Error);
        assert_eq!(source.last_error.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn collect_timeout_fails_job() {
        let store = seeded(1).await;
        let worker = Worker::new(store.clone(), Arc::new(SlowCollector), Duration::from_millis(20));

        let outcome = worker.process_next(None).await.unwrap().unwrap();
        let JobOutcome::Failed { detail, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(detail.starts_with("collection timed out"), "{detail}");
    }

    #[tokio::test]
    async fn drain_respects_max_jobs() {
        let store = seeded(5).await;
        let collector = FixedCollector::ok();
        let worker = Worker::new(store.clone(), collector.clone(), Duration::from_secs(5));

        let report = worker.drain(None, 3, Duration::ZERO).await.unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.succeeded, 3);
        assert_eq!(collector.calls.load(Ordering::SeqCst), 3);

        let rest = worker.drain(None, 50, Duration::ZERO).await.unwrap();
        assert_eq!(rest.processed, 2);
        assert_eq!(worker.drain(None, 50, Duration::ZERO).await.unwrap(), DrainReport::default());
    }

    #[tokio::test]
    async fn drain_with_source_filter() {
        let store = seeded(3).await;
        let worker = Worker::new(store.clone(), FixedCollector::ok(), Duration::from_secs(5));

        let report = worker.drain(Some(SourceId(2)), 50, Duration::ZERO).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(store.active_job_count(SourceId(1)), 1);
        assert_eq!(store.active_job_count(SourceId(2)), 0);
    }

    #[tokio::test]
    async fn reaped_job_is_superseded() {
        let store = seeded(1).await;
        let worker = Worker::new(store.clone(), FixedCollector::ok(), Duration::from_secs(5));
        let job = store.claim_next_pending(worker.id(), None, Utc::now()).await.unwrap().unwrap();

        store
            .reap_stale(chrono::Duration::zero(), Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();

        let outcome = worker.run(job.clone()).await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Superseded { job_id: job.id, source_id: job.source_id }
        );
        let source = store.get_source(job.source_id).await.unwrap().unwrap();
        assert!(source.last_collected_at.is_none());
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let outcome = JobOutcome::Superseded { job_id: JobId(3), source_id: SourceId(1) };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "superseded");
        assert_eq!(json["job_id"], 3);
        assert_eq!(outcome.job_id(), JobId(3));
    }
}
