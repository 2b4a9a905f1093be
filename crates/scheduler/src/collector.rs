//! Feed collectors: the fetch step a worker runs for each claimed job.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use feedsync_core::Source;

use crate::error::CollectError;

/// What a successful collection produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectionReport {
    pub bytes: usize,
    pub http_status: Option<u16>,
}

/// Fetches (and optionally parses and stores) one source.
#[async_trait]
pub trait FeedCollector: Send + Sync {
    async fn collect(&self, source: &Source) -> Result<CollectionReport, CollectError>;

    /// Human-readable name for logs.
    fn name(&self) -> &str;
}

/// Issues a GET to the source's `feed_url`; any non-2xx answer is a failure.
pub struct HttpFeedCollector {
    client: reqwest::Client,
}

impl HttpFeedCollector {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, CollectError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedCollector for HttpFeedCollector {
    async fn collect(&self, source: &Source) -> Result<CollectionReport, CollectError> {
        let response = self.client.get(&source.feed_url).send().await?;
        let status = response.status();

        if !status.is_success() {
            warn!(
                source_id = %source.id,
                url = %source.feed_url,
                %status,
                "feed returned non-2xx status"
            );
            return Err(CollectError::Status { status: status.as_u16() });
        }

        let body = response.bytes().await?;
        debug!(
            source_id = %source.id,
            url = %source.feed_url,
            bytes = body.len(),
            "feed fetched"
        );
        Ok(CollectionReport {
            bytes: body.len(),
            http_status: Some(status.as_u16()),
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}
