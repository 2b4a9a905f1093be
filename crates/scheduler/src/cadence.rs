//! Cron cadence for the service loops.

use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use feedsync_core::config::parse_cron;
use feedsync_core::FeedError;

/// A parsed cron expression (5 or 6 fields) driving one periodic loop.
#[derive(Debug, Clone)]
pub struct Cadence {
    expr: String,
    schedule: Schedule,
}

impl Cadence {
    pub fn parse(expr: &str) -> Result<Self, FeedError> {
        Ok(Self {
            expr: expr.trim().to_string(),
            schedule: parse_cron(expr)?,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }

    /// How long to sleep from `now` until the next fire time.
    pub fn until_next(&self, now: DateTime<Utc>) -> Option<Duration> {
        let next = self.next_after(now)?;
        Some((next - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Sleep until the next fire time. Returns `false` if the expression
    /// never fires again.
    pub async fn tick(&self) -> bool {
        match self.until_next(Utc::now()) {
            Some(wait) => {
                tokio::time::sleep(wait).await;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn hourly_fires_at_minute_zero() {
        let cadence = Cadence::parse("0 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 10, 17, 42).unwrap();
        let next = cadence.next_after(now).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (11, 0, 0));
        assert_eq!(cadence.until_next(now), Some(Duration::from_secs(42 * 60 + 18)));
    }

    #[test]
    fn six_field_every_five_minutes() {
        let cadence = Cadence::parse("0 */5 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(
            cadence.next_after(now),
            Some(Utc.with_ymd_and_hms(2025, 5, 1, 10, 5, 0).unwrap())
        );
        assert_eq!(cadence.expr(), "0 */5 * * * *");
    }

    #[test]
    fn invalid_expression_is_rejected() {
        assert!(matches!(
            Cadence::parse("every hour"),
            Err(FeedError::InvalidCron { .. })
        ));
    }
}
