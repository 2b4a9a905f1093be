use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// Polling interval applied when a source is registered without one.
pub const DEFAULT_INTERVAL_MINUTES: u32 = 240;

/// Maximum stored length of a source's `last_error`.
pub const SOURCE_ERROR_MAX_CHARS: usize = 500;

/// Store-assigned identifier of a feed source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub i64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of the most recent collection attempt, as written by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectionStatus {
    /// No collection has finished yet.
    Never,
    Ok,
    Error,
}

impl CollectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionStatus::Never => "NEVER",
            CollectionStatus::Ok => "OK",
            CollectionStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionStatus {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEVER" => Ok(CollectionStatus::Never),
            "OK" => Ok(CollectionStatus::Ok),
            "ERROR" => Ok(CollectionStatus::Error),
            other => Err(FeedError::UnknownCollectionStatus(other.to_string())),
        }
    }
}

/// One configured feed origin.
///
/// `last_collected_at` is the success watermark: only the worker writes it,
/// and only after the job that collected the source reached `SUCCEEDED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    pub feed_url: String,
    pub active: bool,
    pub interval_minutes: u32,
    pub last_collected_at: Option<DateTime<Utc>>,
    pub collection_status: CollectionStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    /// Earliest instant at which the source becomes due again.
    ///
    /// `None` means the source was never collected and is due right away.
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.last_collected_at
            .map(|last| last + Duration::minutes(i64::from(self.interval_minutes)))
    }

    /// Due predicate evaluated at `now`. Inactive sources are never due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.active {
            return false;
        }
        match self.next_due_at() {
            None => true,
            Some(due_at) => due_at <= now,
        }
    }
}

/// Registration request for a new source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSource {
    pub name: String,
    pub feed_url: String,
    /// Defaults to [`DEFAULT_INTERVAL_MINUTES`] if not provided.
    pub interval_minutes: Option<u32>,
    /// Defaults to `true` if not provided.
    pub active: Option<bool>,
}

impl NewSource {
    pub fn new(name: impl Into<String>, feed_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            feed_url: feed_url.into(),
            interval_minutes: None,
            active: None,
        }
    }

    pub fn with_interval(mut self, minutes: u32) -> Self {
        self.interval_minutes = Some(minutes);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = Some(false);
        self
    }

    /// Interval to persist, after applying the default and the positivity check.
    pub fn resolved_interval(&self) -> Result<u32, FeedError> {
        let minutes = self.interval_minutes.unwrap_or(DEFAULT_INTERVAL_MINUTES);
        validate_interval(minutes)
    }

    pub fn resolved_active(&self) -> bool {
        self.active.unwrap_or(true)
    }
}

/// Reject a zero polling interval.
pub fn validate_interval(minutes: u32) -> Result<u32, FeedError> {
    if minutes == 0 {
        return Err(FeedError::InvalidInterval(0));
    }
    Ok(minutes)
}
