use std::time::Duration;

use async_trait::async_trait;

use transit_common::error::AppError;

/// Source of raw vehicle snapshots.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<String, AppError>;
}

/// HTTP client for the upstream vehicle feed.
#[derive(Clone)]
pub struct SnapshotClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

impl SnapshotClient {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Unable to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            url: url.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl SnapshotSource for SnapshotClient {
    /// GET the current snapshot as raw text.
    ///
    /// Network failures, timeouts and non-2xx responses are all
    /// `UpstreamUnavailable`.
    async fn fetch_snapshot(&self) -> Result<String, AppError> {
        let response = self
            .http
            .get(&self.url)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::UpstreamUnavailable(format!("HTTP error: {}", status)));
        }

        response
            .text()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.without_url().to_string()))
    }
}
