//! Scheduling pass: one PENDING job per active, due source without an active job.
//!
//! The pass itself is a single store call. It is safe to run on any cadence
//! and from any number of tasks at once; running it twice in a row without
//! worker activity creates jobs only the first time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use feedsync_core::{ScheduledBatch, ScheduledJob};
use feedsync_queue::{FeedStore, JobQueue};

use crate::error::SchedulerError;

pub struct Scheduler {
    store: Arc<dyn FeedStore>,
    pass_timeout: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn FeedStore>, pass_timeout: Duration) -> Self {
        Self { store, pass_timeout }
    }

    pub async fn run_pass(&self) -> Result<ScheduledBatch, SchedulerError> {
        self.run_pass_at(Utc::now()).await
    }

    /// Run one pass as of `now`. A timed-out or failed pass reports an error;
    /// the due sources simply stay due for the next one.
    #[instrument(skip(self, now), fields(now = %now))]
    pub async fn run_pass_at(&self, now: DateTime<Utc>) -> Result<ScheduledBatch, SchedulerError> {
        let jobs = tokio::time::timeout(self.pass_timeout, self.store.schedule_due_sources(now))
            .await
            .map_err(|_| SchedulerError::Timeout(self.pass_timeout))??;

        for job in &jobs {
            info!(job_id = %job.job_id, source_id = %job.source_id, "job scheduled");
        }
        info!(created = jobs.len(), "scheduling pass finished");
        Ok(ScheduledBatch::new(now, jobs))
    }

    /// Entry point for the periodic trigger: never fails, always reports.
    pub async fn trigger(&self) -> PassSummary {
        match self.run_pass().await {
            Ok(batch) => PassSummary::from_batch(batch),
            Err(e) => {
                warn!(error = %e, transient = e.is_transient(), "scheduling pass failed");
                PassSummary::failed(&e)
            }
        }
    }
}

/// What the trigger receives back from one pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassSummary {
    pub success: bool,
    pub created: usize,
    pub jobs: Vec<ScheduledJob>,
    pub message: String,
}

impl PassSummary {
    pub fn from_batch(batch: ScheduledBatch) -> Self {
        let created = batch.len();
        Self {
            success: true,
            created,
            jobs: batch.jobs,
            message: format!("{created} job(s) created"),
        }
    }

    pub fn failed(err: &SchedulerError) -> Self {
        Self {
            success: false,
            created: 0,
            jobs: Vec::new(),
            message: err.to_string(),
        }
    }
}
