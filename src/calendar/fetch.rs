use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::limits::MAX_FEED_BYTES;

use super::CalendarError;

/// Source of remote calendar documents.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, CalendarError>;
}

/// Fetches feeds over HTTP(S).
pub struct HttpFeedFetcher {
    client: Client,
}

impl HttpFeedFetcher {
    pub fn new(timeout: Duration) -> Result<Self, CalendarError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("innkeep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CalendarError::Unreachable(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, url: &str) -> Result<String, CalendarError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CalendarError::Unreachable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CalendarError::Unreachable(format!("HTTP {status}")));
        }
        if response
            .content_length()
            .is_some_and(|len| len as usize > MAX_FEED_BYTES)
        {
            return Err(CalendarError::Malformed("feed too large".into()));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| CalendarError::Unreachable(e.to_string()))?;
        if body.len() > MAX_FEED_BYTES {
            return Err(CalendarError::Malformed("feed too large".into()));
        }
        String::from_utf8(body.to_vec()).map_err(|_| CalendarError::Malformed("feed is not UTF-8".into()))
    }
}
