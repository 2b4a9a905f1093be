//! Stale-job reaper.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use feedsync_core::Job;
use feedsync_queue::{FeedStore, JobQueue};

use crate::error::SchedulerError;

/// Fails PROCESSING jobs that outlived `stale_after`, freeing their sources
/// for the next scheduling pass.
pub struct Reaper {
    store: Arc<dyn FeedStore>,
    stale_after: chrono::Duration,
    timeout: Duration,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReapReport {
    pub reaped: Vec<Job>,
}

impl ReapReport {
    pub fn count(&self) -> usize {
        self.reaped.len()
    }
}

impl Reaper {
    pub fn new(store: Arc<dyn FeedStore>, stale_after: chrono::Duration, timeout: Duration) -> Self {
        Self {
            store,
            stale_after,
            timeout,
        }
    }

    pub fn stale_after(&self) -> chrono::Duration {
        self.stale_after
    }

    pub async fn run(&self) -> Result<ReapReport, SchedulerError> {
        self.run_at(Utc::now()).await
    }

    #[instrument(skip(self, now), fields(now = %now, stale_after_minutes = self.stale_after.num_minutes()))]
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<ReapReport, SchedulerError> {
        let reaped = tokio::time::timeout(self.timeout, self.store.reap_stale(self.stale_after, now))
            .await
            .map_err(|_| SchedulerError::Timeout(self.timeout))??;

        for job in &reaped {
            warn!(
                job_id = %job.id,
                source_id = %job.source_id,
                started_at = ?job.started_at,
                "stale job failed by reaper"
            );
        }
        if !reaped.is_empty() {
            info!(reaped = reaped.len(), "reaper pass finished");
        }
        Ok(ReapReport { reaped })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedsync_core::{JobStatus, NewSource, WorkerId};
    use feedsync_queue::{InMemoryStore, JobQueue, SourceRegistry};

    #[tokio::test]
    async fn reaps_and_frees_source() {
        let store = Arc::new(InMemoryStore::new());
        let t0 = Utc::now();
        let source = store.register_source(NewSource::new("a", "u"), t0).await.unwrap();
        store.schedule_due_sources(t0).await.unwrap();
        store.claim_next_pending(WorkerId::new(), None, t0).await.unwrap();

        let reaper = Reaper::new(store.clone(), chrono::Duration::minutes(30), Duration::from_secs(5));

        let early = reaper.run_at(t0 + chrono::Duration::minutes(10)).await.unwrap();
        assert_eq!(early.count(), 0);

        let report = reaper.run_at(t0 + chrono::Duration::minutes(45)).await.unwrap();
        assert_eq!(report.count(), 1);
        assert_eq!(report.reaped[0].status, JobStatus::Failed);
        assert_eq!(store.active_job_count(source.id), 0);

        let next = store
            .schedule_due_sources(t0 + chrono::Duration::minutes(46))
            .await
            .unwrap();
        assert_eq!(next.len(), 1);
    }
}
