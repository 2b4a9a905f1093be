use std::env;
use std::str::FromStr;
use std::time::Duration;

use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key).as_deref() {
        Some("true") | Some("1") | Some("yes") => true,
        Some("false") | Some("0") | Some("no") => false,
        _ => default,
    }
}

/// Parse a cron expression, auto-prepending "0 " for 5-field expressions.
///
/// The `cron` crate requires 6 fields (sec min hr dom mon dow); operators
/// usually write the classic 5-field form (min hr dom mon dow).
pub fn parse_cron(expr: &str) -> Result<Schedule, FeedError> {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    let normalized = if parts.len() == 5 {
        format!("0 {}", expr.trim())
    } else {
        expr.trim().to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| FeedError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub postgres: PostgresConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `FEEDSYNC_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("FEEDSYNC_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            postgres: PostgresConfig::from_env_profiled(p),
            scheduler: SchedulerConfig::from_env_profiled(p),
            worker: WorkerConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<(), FeedError> {
        self.scheduler.validate()?;
        self.worker.validate()?;
        if self.postgres.max_connections == 0 {
            return Err(FeedError::Config("PG_MAX_CONNECTIONS must be at least 1".into()));
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  postgres:   host={}, db={}, pool={}", self.postgres.host, self.postgres.database, self.postgres.max_connections);
        tracing::info!(
            "  scheduler:  cron='{}', timeout={}s, on_start={}",
            self.scheduler.schedule_cron, self.scheduler.pass_timeout_secs, self.scheduler.run_on_start
        );
        tracing::info!(
            "  reaper:     cron='{}', stale_after={}min",
            self.scheduler.reap_cron, self.scheduler.stale_after_minutes
        );
        tracing::info!(
            "  worker:     concurrency={}, cron='{}', max_jobs={}",
            self.worker.concurrency, self.worker.drain_cron, self.worker.max_jobs_per_drain
        );
    }

    /// Return a redacted view safe for printing (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "postgres": {
                "host": self.postgres.host,
                "port": self.postgres.port,
                "database": self.postgres.database,
                "url_override": self.postgres.url.is_some(),
                "max_connections": self.postgres.max_connections,
            },
            "scheduler": self.scheduler,
            "worker": self.worker,
        })
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Full connection URL; when set, the individual fields are ignored.
    #[serde(skip_serializing)]
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
    /// Server-side cap on a single statement.
    pub statement_timeout_secs: u64,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_opt(p, "DATABASE_URL"),
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "feedsync"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 10),
            statement_timeout_secs: profiled_env_u64(p, "PG_STATEMENT_TIMEOUT_SECS", 30),
        }
    }

    pub fn connection_string(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }
}

// ── Scheduler + reaper ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cadence of the scheduling trigger.
    pub schedule_cron: String,
    pub pass_timeout_secs: u64,
    /// Run one pass at startup instead of waiting for the first tick.
    pub run_on_start: bool,
    pub reap_cron: String,
    /// PROCESSING jobs older than this are failed as stale.
    pub stale_after_minutes: u32,
    pub reap_timeout_secs: u64,
}

impl SchedulerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            schedule_cron: profiled_env_or(p, "SCHEDULE_CRON", "0 0 * * * *"),
            pass_timeout_secs: profiled_env_u64(p, "SCHEDULE_PASS_TIMEOUT_SECS", 30),
            run_on_start: profiled_env_bool(p, "SCHEDULE_ON_START", true),
            reap_cron: profiled_env_or(p, "REAP_CRON", "0 */5 * * * *"),
            stale_after_minutes: profiled_env_u32(p, "REAP_STALE_AFTER_MINUTES", 30),
            reap_timeout_secs: profiled_env_u64(p, "REAP_TIMEOUT_SECS", 30),
        }
    }

    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_secs)
    }

    pub fn reap_timeout(&self) -> Duration {
        Duration::from_secs(self.reap_timeout_secs)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.stale_after_minutes))
    }

    fn validate(&self) -> Result<(), FeedError> {
        parse_cron(&self.schedule_cron)?;
        parse_cron(&self.reap_cron)?;
        if self.pass_timeout_secs == 0 || self.reap_timeout_secs == 0 {
            return Err(FeedError::Config("scheduler timeouts must be at least 1s".into()));
        }
        if self.stale_after_minutes == 0 {
            return Err(FeedError::Config("REAP_STALE_AFTER_MINUTES must be at least 1".into()));
        }
        Ok(())
    }
}

// ── Worker ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub concurrency: u32,
    /// Cadence of the periodic drain (passes that create jobs also wake the pool).
    pub drain_cron: String,
    pub max_jobs_per_drain: u32,
    /// Pause between two jobs of the same drain.
    pub pause_ms: u64,
    pub collect_timeout_secs: u64,
    pub user_agent: String,
}

impl WorkerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            concurrency: profiled_env_u32(p, "WORKER_CONCURRENCY", 2),
            drain_cron: profiled_env_or(p, "WORKER_CRON", "0 */15 * * * *"),
            max_jobs_per_drain: profiled_env_u32(p, "WORKER_MAX_JOBS_PER_DRAIN", 50),
            pause_ms: profiled_env_u64(p, "WORKER_PAUSE_MS", 1000),
            collect_timeout_secs: profiled_env_u64(p, "WORKER_COLLECT_TIMEOUT_SECS", 120),
            user_agent: profiled_env_or(p, "WORKER_USER_AGENT", "feedsync/0.1"),
        }
    }

    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }

    pub fn collect_timeout(&self) -> Duration {
        Duration::from_secs(self.collect_timeout_secs)
    }

    fn validate(&self) -> Result<(), FeedError> {
        parse_cron(&self.drain_cron)?;
        if self.concurrency == 0 {
            return Err(FeedError::Config("WORKER_CONCURRENCY must be at least 1".into()));
        }
        if self.collect_timeout_secs == 0 {
            return Err(FeedError::Config("WORKER_COLLECT_TIMEOUT_SECS must be at least 1".into()));
        }
        Ok(())
    }
}
