use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FeedError;
use crate::source::SourceId;

/// `error_detail` written by the reaper when a job overstays in PROCESSING.
pub const STALE_JOB_DETAIL: &str = "stale/timeout";

/// Maximum stored length of a job's `error_detail`.
pub const JOB_ERROR_MAX_CHARS: usize = 1000;

/// Store-assigned job identifier, increasing in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a worker instance; recorded on the jobs it claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle: `PENDING -> PROCESSING -> {SUCCEEDED, FAILED}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Succeeded,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Active jobs block scheduling of their source.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }

    /// The only permitted edges of the state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Succeeded)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(FeedError::UnknownJobStatus(other.to_string())),
        }
    }
}

/// One scheduled collection attempt for a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub source_id: SourceId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
    pub claimed_by: Option<WorkerId>,
}

impl Job {
    /// True when the job has been PROCESSING for longer than `max_processing`.
    pub fn is_stale(&self, max_processing: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self
                .started_at
                .map(|started| started < now - max_processing)
                .unwrap_or(false)
    }
}

/// A job created by a scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub job_id: JobId,
    pub source_id: SourceId,
}

/// Result of one scheduling pass. Carries no ordering guarantee.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduledBatch {
    pub scheduled_at: Option<DateTime<Utc>>,
    pub jobs: Vec<ScheduledJob>,
}

impl ScheduledBatch {
    pub fn new(scheduled_at: DateTime<Utc>, jobs: Vec<ScheduledJob>) -> Self {
        Self {
            scheduled_at: Some(scheduled_at),
            jobs,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains_source(&self, source_id: SourceId) -> bool {
        self.jobs.iter().any(|j| j.source_id == source_id)
    }
}

/// Filter for listing jobs (newest first).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub source_id: Option<SourceId>,
    pub status: Option<JobStatus>,
    pub limit: Option<u32>,
}

impl JobFilter {
    pub fn for_source(source_id: SourceId) -> Self {
        Self {
            source_id: Some(source_id),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.source_id.map_or(true, |id| job.source_id == id)
            && self.status.map_or(true, |s| job.status == s)
    }
}

/// Truncate `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(status: JobStatus, started_at: Option<DateTime<Utc>>) -> Job {
        Job {
            id: JobId(7),
            source_id: SourceId(3),
            status,
            created_at: Utc::now(),
            started_at,
            finished_at: None,
            error_detail: None,
            claimed_by: None,
        }
    }

    #[test]
    fn transition_table() {
        use JobStatus::*;
        let allowed = [(Pending, Processing), (Processing, Succeeded), (Processing, Failed)];
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [JobStatus::Succeeded, JobStatus::Failed] {
            assert!(terminal.is_terminal());
            assert!(JobStatus::ALL.iter().all(|s| !terminal.can_transition_to(*s)));
        }
    }

    #[test]
    fn active_states() {
        assert!(JobStatus::Pending.is_active());
        assert!(JobStatus::Processing.is_active());
        assert!(!JobStatus::Succeeded.is_active());
        assert!(!JobStatus::Failed.is_active());
    }

    #[test]
    fn status_serde_uses_wire_names() {
        for status in JobStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!(matches!(
            "DONE".parse::<JobStatus>(),
            Err(FeedError::UnknownJobStatus(s)) if s == "DONE"
        ));
    }

    #[test]
    fn stale_only_when_processing_past_threshold() {
        let now = Utc::now();
        let threshold = Duration::minutes(30);
        assert!(job(JobStatus::Processing, Some(now - Duration::minutes(31))).is_stale(threshold, now));
        assert!(!job(JobStatus::Processing, Some(now - Duration::minutes(29))).is_stale(threshold, now));
        assert!(!job(JobStatus::Pending, None).is_stale(threshold, now));
        assert!(!job(JobStatus::Failed, Some(now - Duration::hours(5))).is_stale(threshold, now));
    }

    #[test]
    fn filter_matches() {
        let j = job(JobStatus::Pending, None);
        assert!(JobFilter::default().matches(&j));
        assert!(JobFilter::for_source(SourceId(3)).matches(&j));
        assert!(!JobFilter::for_source(SourceId(4)).matches(&j));
        assert!(!JobFilter::default().with_status(JobStatus::Failed).matches(&j));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("ação", 2), "aç");
        assert_eq!(truncate_chars("short", 100), "short");
        assert_eq!(truncate_chars(&"x".repeat(1500), JOB_ERROR_MAX_CHARS).len(), 1000);
    }

    #[test]
    fn batch_helpers() {
        let batch = ScheduledBatch::new(
            Utc::now(),
            vec![ScheduledJob { job_id: JobId(1), source_id: SourceId(9) }],
        );
        assert_eq!(batch.len(), 1);
        assert!(batch.contains_source(SourceId(9)));
        assert!(!batch.contains_source(SourceId(8)));
        assert!(ScheduledBatch::default().is_empty());
    }
}
