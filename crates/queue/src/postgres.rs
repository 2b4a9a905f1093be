//! PostgreSQL-backed store for `feed_sources` and `feed_jobs`.
//!
//! Each read-then-write operation is one SQL statement:
//!
//! - scheduling is a single `INSERT ... SELECT` guarded by `NOT EXISTS` and the
//!   partial unique index `feed_jobs_one_active_per_source`, so concurrent
//!   passes can never create a second active job for a source;
//! - claiming uses `FOR UPDATE SKIP LOCKED` on the oldest PENDING row;
//! - terminal transitions are conditional `UPDATE`s. When no row matches, a
//!   follow-up read only decides which error to report.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tracing::{debug, error, info};
use uuid::Uuid;

use feedsync_core::config::PostgresConfig;
use feedsync_core::{
    truncate_chars, validate_interval, CollectionStatus, Job, JobFilter, JobId, JobStatus,
    NewSource, ScheduledJob, Source, SourceId, WorkerId, JOB_ERROR_MAX_CHARS, SOURCE_ERROR_MAX_CHARS,
    STALE_JOB_DETAIL,
};

use crate::error::StoreError;
use crate::store::{check_transition, JobQueue, SourceRegistry};

const SOURCE_COLUMNS: &str = "id, name, feed_url, active, interval_minutes, last_collected_at, \
     collection_status, last_error, created_at, updated_at";

const JOB_COLUMNS: &str =
    "id, source_id, status, created_at, started_at, finished_at, error_detail, claimed_by";

/// Open a connection pool with a server-side `statement_timeout`.
pub async fn connect(config: &PostgresConfig) -> Result<PgPool, StoreError> {
    let options = PgConnectOptions::from_str(&config.connection_string())?.options([(
        "statement_timeout",
        format!("{}s", config.statement_timeout_secs),
    )]);

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.statement_timeout())
        .connect_with(options)
        .await?;

    info!(
        host = %config.host,
        database = %config.database,
        max_connections = config.max_connections,
        "PostgreSQL connected"
    );
    Ok(pool)
}

// ── Row mapping ──────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct SourceRow {
    id: i64,
    name: String,
    feed_url: String,
    active: bool,
    interval_minutes: i32,
    last_collected_at: Option<DateTime<Utc>>,
    collection_status: String,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SourceRow> for Source {
    type Error = StoreError;

    fn try_from(row: SourceRow) -> Result<Self, Self::Error> {
        let interval_minutes = u32::try_from(row.interval_minutes).map_err(|_| {
            StoreError::Decode(format!(
                "source {} has negative interval_minutes {}",
                row.id, row.interval_minutes
            ))
        })?;
        Ok(Source {
            id: SourceId(row.id),
            name: row.name,
            feed_url: row.feed_url,
            active: row.active,
            interval_minutes,
            last_collected_at: row.last_collected_at,
            collection_status: CollectionStatus::from_str(&row.collection_status)?,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    source_id: i64,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error_detail: Option<String>,
    claimed_by: Option<Uuid>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId(row.id),
            source_id: SourceId(row.source_id),
            status: JobStatus::from_str(&row.status)?,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            error_detail: row.error_detail,
            claimed_by: row.claimed_by.map(WorkerId),
        })
    }
}

fn interval_to_db(minutes: u32) -> Result<i32, StoreError> {
    i32::try_from(minutes)
        .map_err(|_| StoreError::ConstraintViolation(format!("interval_minutes {minutes} is too large")))
}

/// Map a unique violation on `feed_sources.name` to a readable error.
fn map_duplicate_name(e: sqlx::Error, name: &str) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.code().as_deref() == Some("23505") {
            return StoreError::ConstraintViolation(format!("a source named '{name}' already exists"));
        }
    }
    error!("feed source store database error: {}", e);
    StoreError::from(e)
}

// ── Store ────────────────────────────────────────────────────

/// Store backed by a `PgPool`. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        Ok(Self::new(connect(config).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("Database migrations applied successfully");
        Ok(())
    }

    async fn fetch_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM feed_jobs WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    /// Explain why a conditional transition matched no row.
    async fn diagnose_transition(
        &self,
        id: JobId,
        to: JobStatus,
        worker: Option<WorkerId>,
    ) -> StoreError {
        match self.fetch_job(id).await {
            Ok(None) => StoreError::JobNotFound(id),
            Ok(Some(job)) => match check_transition(&job, to, worker) {
                Err(e) => e,
                // The row changed between the UPDATE and this read.
                Ok(()) => StoreError::InvalidTransition {
                    job: id,
                    from: job.status,
                    to,
                },
            },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl SourceRegistry for PgStore {
    async fn register_source(&self, req: NewSource, now: DateTime<Utc>) -> Result<Source, StoreError> {
        let interval = interval_to_db(req.resolved_interval()?)?;
        let row = sqlx::query_as::<_, SourceRow>(&format!(
            "INSERT INTO feed_sources (name, feed_url, active, interval_minutes, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $5)
             RETURNING {SOURCE_COLUMNS}"
        ))
        .bind(&req.name)
        .bind(&req.feed_url)
        .bind(req.resolved_active())
        .bind(interval)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_duplicate_name(e, &req.name))?;

        Source::try_from(row)
    }

    async fn get_source(&self, id: SourceId) -> Result<Option<Source>, StoreError> {
        let row = sqlx::query_as::<_, SourceRow>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM feed_sources WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Source::try_from).transpose()
    }

    async fn list_sources(&self) -> Result<Vec<Source>, StoreError> {
        let rows = sqlx::query_as::<_, SourceRow>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM feed_sources ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Source::try_from).collect()
    }

    async fn set_active(&self, id: SourceId, active: bool, now: DateTime<Utc>) -> Result<Source, StoreError> {
        let row = sqlx::query_as::<_, SourceRow>(&format!(
            "UPDATE feed_sources SET active = $2, updated_at = $3 WHERE id = $1 RETURNING {SOURCE_COLUMNS}"
        ))
        .bind(id.0)
        .bind(active)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Source::try_from)
            .transpose()?
            .ok_or(StoreError::SourceNotFound(id))
    }

    async fn set_interval(&self, id: SourceId, minutes: u32, now: DateTime<Utc>) -> Result<Source, StoreError> {
        let minutes = interval_to_db(validate_interval(minutes)?)?;
        let row = sqlx::query_as::<_, SourceRow>(&format!(
            "UPDATE feed_sources SET interval_minutes = $2, updated_at = $3 WHERE id = $1 RETURNING {SOURCE_COLUMNS}"
        ))
        .bind(id.0)
        .bind(minutes)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Source::try_from)
            .transpose()?
            .ok_or(StoreError::SourceNotFound(id))
    }

    async fn record_successful_collection(
        &self,
        id: SourceId,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE feed_sources
             SET last_collected_at = $2, collection_status = 'OK', last_error = NULL, updated_at = $2
             WHERE id = $1",
        )
        .bind(id.0)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::SourceNotFound(id));
        }
        Ok(())
    }

    async fn record_failed_collection(
        &self,
        id: SourceId,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE feed_sources
             SET collection_status = 'ERROR', last_error = $2, updated_at = $3
             WHERE id = $1",
        )
        .bind(id.0)
        .bind(truncate_chars(detail, SOURCE_ERROR_MAX_CHARS))
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::SourceNotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PgStore {
    async fn schedule_due_sources(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "INSERT INTO feed_jobs (source_id, status, created_at)
             SELECT s.id, 'PENDING', $1
             FROM feed_sources s
             WHERE s.active
               AND (s.last_collected_at IS NULL
                    OR s.last_collected_at + make_interval(mins => s.interval_minutes) <= $1)
               AND NOT EXISTS (
                   SELECT 1 FROM feed_jobs j
                   WHERE j.source_id = s.id AND j.status IN ('PENDING', 'PROCESSING')
               )
             ORDER BY s.id
             ON CONFLICT (source_id) WHERE status IN ('PENDING', 'PROCESSING') DO NOTHING
             RETURNING id, source_id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        debug!(created = rows.len(), "schedule statement finished");
        Ok(rows
            .into_iter()
            .map(|(job_id, source_id)| ScheduledJob {
                job_id: JobId(job_id),
                source_id: SourceId(source_id),
            })
            .collect())
    }

    async fn claim_next_pending(
        &self,
        worker: WorkerId,
        source: Option<SourceId>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "UPDATE feed_jobs
             SET status = 'PROCESSING', started_at = $1, claimed_by = $2
             WHERE id = (
                 SELECT id FROM feed_jobs
                 WHERE status = 'PENDING' AND ($3::BIGINT IS NULL OR source_id = $3)
                 ORDER BY created_at, id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             AND status = 'PENDING'
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(now)
        .bind(worker.0)
        .bind(source.map(|s| s.0))
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn mark_processing(&self, id: JobId, worker: WorkerId, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "UPDATE feed_jobs
             SET status = 'PROCESSING', started_at = $2, claimed_by = $3
             WHERE id = $1 AND status = 'PENDING'
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(id.0)
        .bind(now)
        .bind(worker.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Job::try_from(row),
            None => Err(self.diagnose_transition(id, JobStatus::Processing, None).await),
        }
    }

    async fn mark_succeeded(&self, id: JobId, worker: WorkerId, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "UPDATE feed_jobs
             SET status = 'SUCCEEDED', finished_at = $2
             WHERE id = $1 AND status = 'PROCESSING' AND claimed_by = $3
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(id.0)
        .bind(now)
        .bind(worker.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Job::try_from(row),
            None => Err(self.diagnose_transition(id, JobStatus::Succeeded, Some(worker)).await),
        }
    }

    async fn mark_failed(
        &self,
        id: JobId,
        worker: WorkerId,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "UPDATE feed_jobs
             SET status = 'FAILED', finished_at = $2, error_detail = $4
             WHERE id = $1 AND status = 'PROCESSING' AND claimed_by = $3
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(id.0)
        .bind(now)
        .bind(worker.0)
        .bind(truncate_chars(detail, JOB_ERROR_MAX_CHARS))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Job::try_from(row),
            None => Err(self.diagnose_transition(id, JobStatus::Failed, Some(worker)).await),
        }
    }

    async fn reap_stale(&self, max_processing: Duration, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let cutoff = now - max_processing;
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "UPDATE feed_jobs
             SET status = 'FAILED', finished_at = $1, error_detail = $3
             WHERE status = 'PROCESSING' AND started_at < $2
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(now)
        .bind(cutoff)
        .bind(STALE_JOB_DETAIL)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.fetch_job(id).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM feed_jobs
             WHERE ($1::BIGINT IS NULL OR source_id = $1)
               AND ($2::TEXT IS NULL OR status = $2)
             ORDER BY created_at DESC, id DESC
             LIMIT $3"
        ))
        .bind(filter.source_id.map(|s| s.0))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit.map(i64::from))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }
}
