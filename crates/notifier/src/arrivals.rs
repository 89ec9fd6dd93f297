use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use transit_common::error::AppError;

/// One predicted arrival at a stop.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Arrival {
    pub id: String,
    pub trip: String,
    pub route: String,
    pub headsign: String,
    pub direction: String,
    pub vehicle: String,
    pub estimated: String,
    /// Scheduled time at the stop, e.g. `3:04 PM`
    pub stop_time: String,
    pub date: String,
    pub canceled: String,
}

/// Arrival predictions for one stop, soonest first.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Arrivals {
    pub stop: String,
    pub timestamp: String,
    pub arrivals: Vec<Arrival>,
}

/// Source of live arrivals, looked up when a stop notification is sent.
#[async_trait]
pub trait ArrivalsSource: Send + Sync {
    async fn arrivals(&self, stop_id: &str) -> Result<Arrivals, AppError>;
}

/// HTTP client for the upstream arrivals feed.
pub struct ArrivalsClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

impl ArrivalsClient {
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
impl ArrivalsSource for ArrivalsClient {
    async fn arrivals(&self, stop_id: &str) -> Result<Arrivals, AppError> {
        let response = self
            .http
            .get(&self.url)
            .query(&[("key", self.api_key.as_str()), ("stop", stop_id)])
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::UpstreamUnavailable(format!("HTTP error: {}", status)));
        }

        response
            .json::<Arrivals>()
            .await
            .map_err(|e| AppError::MalformedUpstreamPayload(e.without_url().to_string()))
    }
}
