use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use transit_common::error::AppError;
use transit_common::types::{ChannelMessage, Vehicle};

/// Receiver of vehicle change notices.
#[async_trait]
pub trait ChangeSink: Send {
    /// Publish one `vehicleUpdate` message carrying `rows`.
    ///
    /// Returns the number of subscribers that received it.
    async fn publish_change_notice(&mut self, rows: &[Vehicle]) -> Result<i64, AppError>;
}

/// Publishes vehicle change notices on a fan-out channel.
#[derive(Clone)]
pub struct ChangePublisher {
    redis: ConnectionManager,
    channel: String,
}

impl ChangePublisher {
    pub fn new(redis: ConnectionManager, channel: impl Into<String>) -> Self {
        Self {
            redis,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl ChangeSink for ChangePublisher {
    async fn publish_change_notice(&mut self, rows: &[Vehicle]) -> Result<i64, AppError> {
        let message = serde_json::to_string(&ChannelMessage::VehicleUpdate(rows.to_vec()))?;
        let receivers: i64 = self.redis.publish(&self.channel, message).await?;

        tracing::debug!(channel = %self.channel, rows = rows.len(), receivers, "Published change notice");
        Ok(receivers)
    }
}
