//! In-memory store used by tests and local runs.
//!
//! Both relations live behind a single mutex, so every trait operation is
//! one critical section: the select and the write of `schedule_due_sources`,
//! `claim_next_pending` and `reap_stale` cannot interleave with any other call.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;

use feedsync_core::{
    truncate_chars, validate_interval, CollectionStatus, Job, JobFilter, JobId, JobStatus,
    NewSource, ScheduledJob, Source, SourceId, WorkerId, JOB_ERROR_MAX_CHARS, SOURCE_ERROR_MAX_CHARS,
    STALE_JOB_DETAIL,
};

use crate::error::StoreError;
use crate::store::{check_transition, JobQueue, SourceRegistry};

#[derive(Debug, Default)]
struct State {
    sources: IndexMap<SourceId, Source>,
    /// Insertion order equals id order.
    jobs: IndexMap<JobId, Job>,
    next_source_id: i64,
    next_job_id: i64,
}

impl State {
    fn has_active_job(&self, source_id: SourceId) -> bool {
        self.jobs
            .values()
            .any(|j| j.source_id == source_id && j.status.is_active())
    }

    fn source_mut(&mut self, id: SourceId) -> Result<&mut Source, StoreError> {
        self.sources.get_mut(&id).ok_or(StoreError::SourceNotFound(id))
    }

    fn job_mut(&mut self, id: JobId) -> Result<&mut Job, StoreError> {
        self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))
    }
}

/// Mutex-guarded store holding sources and jobs in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))
    }

    /// Number of jobs in PENDING or PROCESSING for `source_id`.
    pub fn active_job_count(&self, source_id: SourceId) -> usize {
        self.lock()
            .map(|state| {
                state
                    .jobs
                    .values()
                    .filter(|j| j.source_id == source_id && j.status.is_active())
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn job_count(&self) -> usize {
        self.lock().map(|state| state.jobs.len()).unwrap_or(0)
    }
}

#[async_trait]
impl SourceRegistry for InMemoryStore {
    async fn register_source(&self, req: NewSource, now: DateTime<Utc>) -> Result<Source, StoreError> {
        let interval_minutes = req.resolved_interval()?;
        let mut state = self.lock()?;

        if state.sources.values().any(|s| s.name == req.name) {
            return Err(StoreError::ConstraintViolation(format!(
                "a source named '{}' already exists",
                req.name
            )));
        }

        state.next_source_id += 1;
        let source = Source {
            id: SourceId(state.next_source_id),
            active: req.resolved_active(),
            name: req.name,
            feed_url: req.feed_url,
            interval_minutes,
            last_collected_at: None,
            collection_status: CollectionStatus::Never,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        state.sources.insert(source.id, source.clone());
        Ok(source)
    }

    async fn get_source(&self, id: SourceId) -> Result<Option<Source>, StoreError> {
        Ok(self.lock()?.sources.get(&id).cloned())
    }

    async fn list_sources(&self) -> Result<Vec<Source>, StoreError> {
        let mut sources: Vec<Source> = self.lock()?.sources.values().cloned().collect();
        sources.sort_by_key(|s| s.id);
        Ok(sources)
    }

    async fn set_active(&self, id: SourceId, active: bool, now: DateTime<Utc>) -> Result<Source, StoreError> {
        let mut state = self.lock()?;
        let source = state.source_mut(id)?;
        source.active = active;
        source.updated_at = now;
        Ok(source.clone())
    }

    async fn set_interval(&self, id: SourceId, minutes: u32, now: DateTime<Utc>) -> Result<Source, StoreError> {
        let minutes = validate_interval(minutes)?;
        let mut state = self.lock()?;
        let source = state.source_mut(id)?;
        source.interval_minutes = minutes;
        source.updated_at = now;
        Ok(source.clone())
    }

    async fn record_successful_collection(
        &self,
        id: SourceId,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let source = state.source_mut(id)?;
        source.last_collected_at = Some(completed_at);
        source.collection_status = CollectionStatus::Ok;
        source.last_error = None;
        source.updated_at = completed_at;
        Ok(())
    }

    async fn record_failed_collection(
        &self,
        id: SourceId,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let source = state.source_mut(id)?;
        source.collection_status = CollectionStatus::Error;
        source.last_error = Some(truncate_chars(detail, SOURCE_ERROR_MAX_CHARS));
        source.updated_at = now;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for InMemoryStore {
    async fn schedule_due_sources(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError> {
        let mut state = self.lock()?;

        let eligible: Vec<SourceId> = state
            .sources
            .values()
            .filter(|s| s.is_due(now))
            .map(|s| s.id)
            .filter(|id| !state.has_active_job(*id))
            .collect();

        let mut scheduled = Vec::with_capacity(eligible.len());
        for source_id in eligible {
            state.next_job_id += 1;
            let job = Job {
                id: JobId(state.next_job_id),
                source_id,
                status: JobStatus::Pending,
                created_at: now,
                started_at: None,
                finished_at: None,
                error_detail: None,
                claimed_by: None,
            };
            scheduled.push(ScheduledJob { job_id: job.id, source_id });
            state.jobs.insert(job.id, job);
        }
        Ok(scheduled)
    }

    async fn claim_next_pending(
        &self,
        worker: WorkerId,
        source: Option<SourceId>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut state = self.lock()?;
        let candidate = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .filter(|j| source.map_or(true, |id| j.source_id == id))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let job = state.job_mut(id)?;
        job.status = JobStatus::Processing;
        job.started_at = Some(now);
        job.claimed_by = Some(worker);
        Ok(Some(job.clone()))
    }

    async fn mark_processing(&self, id: JobId, worker: WorkerId, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let mut state = self.lock()?;
        let job = state.job_mut(id)?;
        check_transition(job, JobStatus::Processing, None)?;
        job.status = JobStatus::Processing;
        job.started_at = Some(now);
        job.claimed_by = Some(worker);
        Ok(job.clone())
    }

    async fn mark_succeeded(&self, id: JobId, worker: WorkerId, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let mut state = self.lock()?;
        let job = state.job_mut(id)?;
        check_transition(job, JobStatus::Succeeded, Some(worker))?;
        job.status = JobStatus::Succeeded;
        job.finished_at = Some(now);
        Ok(job.clone())
    }

    async fn mark_failed(
        &self,
        id: JobId,
        worker: WorkerId,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut state = self.lock()?;
        let job = state.job_mut(id)?;
        check_transition(job, JobStatus::Failed, Some(worker))?;
        job.status = JobStatus::Failed;
        job.finished_at = Some(now);
        job.error_detail = Some(truncate_chars(detail, JOB_ERROR_MAX_CHARS));
        Ok(job.clone())
    }

    async fn reap_stale(&self, max_processing: Duration, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let mut state = self.lock()?;
        let mut reaped = Vec::new();
        for job in state.jobs.values_mut() {
            if job.is_stale(max_processing, now) {
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
                job.error_detail = Some(STALE_JOB_DETAIL.to_string());
                reaped.push(job.clone());
            }
        }
        Ok(reaped)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let state = self.lock()?;
        let limit = filter.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(state
            .jobs
            .values()
            .rev()
            .filter(|j| filter.matches(j))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn store_with(sources: &[NewSource]) -> (InMemoryStore, Vec<Source>) {
        let store = InMemoryStore::new();
        let mut out = Vec::new();
        for req in sources {
            out.push(store.register_source(req.clone(), Utc::now()).await.unwrap());
        }
        (store, out)
    }

    #[tokio::test]
    async fn register_assigns_ids_and_defaults() {
        let (store, sources) = store_with(&[
            NewSource::new("a", "https://a.example/rss"),
            NewSource::new("b", "https://b.example/rss").with_interval(15).inactive(),
        ])
        .await;

        assert_eq!(sources[0].id, SourceId(1));
        assert_eq!(sources[0].interval_minutes, 240);
        assert!(sources[0].active);
        assert_eq!(sources[0].collection_status, CollectionStatus::Never);
        assert_eq!(sources[1].id, SourceId(2));
        assert!(!sources[1].active);
        assert_eq!(store.list_sources().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn register_rejects_duplicates_and_zero_interval() {
        let (store, _) = store_with(&[NewSource::new("a", "u")]).await;

        let dup = store.register_source(NewSource::new("a", "v"), Utc::now()).await;
        assert!(matches!(dup, Err(StoreError::ConstraintViolation(_))));

        let zero = store
            .register_source(NewSource::new("z", "u").with_interval(0), Utc::now())
            .await;
        assert!(matches!(zero, Err(StoreError::ConstraintViolation(_))));

        let zero = store.set_interval(SourceId(1), 0, Utc::now()).await;
        assert!(matches!(zero, Err(StoreError::ConstraintViolation(_))));
    }

    #[tokio::test]
    async fn schedule_creates_one_pending_job_per_due_source() {
        let (store, sources) = store_with(&[
            NewSource::new("a", "u1"),
            NewSource::new("b", "u2"),
            NewSource::new("off", "u3").inactive(),
        ])
        .await;
        let now = Utc::now();

        let created = store.schedule_due_sources(now).await.unwrap();
        assert_eq!(created.len(), 2);
        assert!(created.iter().all(|j| j.source_id != sources[2].id));

        let job = store.get_job(created[0].job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.created_at, now);
        assert!(job.started_at.is_none());

        assert!(store.schedule_due_sources(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_takes_oldest_pending_first() {
        let (store, sources) = store_with(&[NewSource::new("a", "u1"), NewSource::new("b", "u2")]).await;
        let t0 = Utc::now();
        store.schedule_due_sources(t0).await.unwrap();
        let worker = WorkerId::new();

        let first = store.claim_next_pending(worker, None, t0).await.unwrap().unwrap();
        assert_eq!(first.source_id, sources[0].id);
        assert_eq!(first.status, JobStatus::Processing);
        assert_eq!(first.claimed_by, Some(worker));
        assert_eq!(first.started_at, Some(t0));

        let second = store
            .claim_next_pending(worker, Some(sources[1].id), t0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.source_id, sources[1].id);

        assert!(store.claim_next_pending(worker, None, t0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let (store, _) = store_with(&[NewSource::new("a", "u1")]).await;
        let store = Arc::new(store);
        store.schedule_due_sources(Utc::now()).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.claim_next_pending(WorkerId::new(), None, Utc::now()).await.unwrap()
                })
            })
            .collect();

        let claimed: Vec<Job> = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter_map(|r| r.unwrap())
            .collect();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn terminal_transitions_require_holder_and_processing() {
        let (store, _) = store_with(&[NewSource::new("a", "u1")]).await;
        let now = Utc::now();
        let created = store.schedule_due_sources(now).await.unwrap();
        let id = created[0].job_id;
        let holder = WorkerId::new();
        let intruder = WorkerId::new();

        // PENDING cannot finish
        let early = store.mark_succeeded(id, holder, now).await;
        assert!(matches!(
            early,
            Err(StoreError::InvalidTransition { from: JobStatus::Pending, to: JobStatus::Succeeded, .. })
        ));

        store.mark_processing(id, holder, now).await.unwrap();
        assert!(matches!(
            store.mark_processing(id, intruder, now).await,
            Err(StoreError::InvalidTransition { from: JobStatus::Processing, .. })
        ));
        assert!(matches!(
            store.mark_failed(id, intruder, "nope", now).await,
            Err(StoreError::NotHolder { .. })
        ));

        let done = store.mark_succeeded(id, holder, now).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.finished_at, Some(now));
        assert!(done.error_detail.is_none());

        assert!(matches!(
            store.mark_failed(id, holder, "late", now).await,
            Err(StoreError::InvalidTransition { from: JobStatus::Succeeded, .. })
        ));
        assert!(matches!(
            store.mark_succeeded(JobId(999), holder, now).await,
            Err(StoreError::JobNotFound(JobId(999)))
        ));
    }

    #[tokio::test]
    async fn mark_failed_truncates_detail() {
        let (store, _) = store_with(&[NewSource::new("a", "u1")]).await;
        let now = Utc::now();
        store.schedule_due_sources(now).await.unwrap();
        let worker = WorkerId::new();
        let job = store.claim_next_pending(worker, None, now).await.unwrap().unwrap();

        let failed = store.mark_failed(job.id, worker, &"e".repeat(5000), now).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_detail.unwrap().len(), JOB_ERROR_MAX_CHARS);
    }

    #[tokio::test]
    async fn reap_fails_only_stale_processing_jobs() {
        let (store, sources) = store_with(&[
            NewSource::new("old", "u1"),
            NewSource::new("fresh", "u2"),
            NewSource::new("waiting", "u3"),
        ])
        .await;
        let t0 = Utc::now();
        store.schedule_due_sources(t0).await.unwrap();
        let worker = WorkerId::new();
        store.claim_next_pending(worker, Some(sources[0].id), t0).await.unwrap();
        store
            .claim_next_pending(worker, Some(sources[1].id), t0 + Duration::minutes(50))
            .await
            .unwrap();

        let now = t0 + Duration::minutes(60);
        let reaped = store.reap_stale(Duration::minutes(30), now).await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].source_id, sources[0].id);
        assert_eq!(reaped[0].status, JobStatus::Failed);
        assert_eq!(reaped[0].error_detail.as_deref(), Some(STALE_JOB_DETAIL));
        assert_eq!(reaped[0].finished_at, Some(now));

        assert_eq!(store.active_job_count(sources[0].id), 0);
        assert_eq!(store.active_job_count(sources[1].id), 1);
        assert_eq!(store.active_job_count(sources[2].id), 1);

        // second run finds nothing new
        assert!(store.reap_stale(Duration::minutes(30), now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn collection_records_update_watermark_and_status() {
        let (store, sources) = store_with(&[NewSource::new("a", "u1")]).await;
        let id = sources[0].id;
        let t = Utc::now();

        store.record_failed_collection(id, "timeout", t).await.unwrap();
        let s = store.get_source(id).await.unwrap().unwrap();
        assert_eq!(s.collection_status, CollectionStatus::Error);
        assert_eq!(s.last_error.as_deref(), Some("timeout"));
        assert!(s.last_collected_at.is_none());

        store.record_successful_collection(id, t).await.unwrap();
        let s = store.get_source(id).await.unwrap().unwrap();
        assert_eq!(s.collection_status, CollectionStatus::Ok);
        assert!(s.last_error.is_none());
        assert_eq!(s.last_collected_at, Some(t));

        assert!(matches!(
            store.record_successful_collection(SourceId(77), t).await,
            Err(StoreError::SourceNotFound(SourceId(77)))
        ));
    }

    #[tokio::test]
    async fn list_jobs_newest_first_with_filter() {
        let (store, sources) = store_with(&[NewSource::new("a", "u1"), NewSource::new("b", "u2")]).await;
        let now = Utc::now();
        store.schedule_due_sources(now).await.unwrap();

        let all = store.list_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(all.iter().map(|j| j.id).collect::<Vec<_>>(), vec![JobId(2), JobId(1)]);

        let only_b = store.list_jobs(&JobFilter::for_source(sources[1].id)).await.unwrap();
        assert_eq!(only_b.len(), 1);

        let limited = store.list_jobs(&JobFilter::default().with_limit(1)).await.unwrap();
        assert_eq!(limited[0].id, JobId(2));

        let failed = store
            .list_jobs(&JobFilter::default().with_status(JobStatus::Failed))
            .await
            .unwrap();
        assert!(failed.is_empty());
    }
}
