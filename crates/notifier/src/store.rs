use async_trait::async_trait;
use sqlx::PgPool;

use transit_common::error::AppError;

/// Notification row access needed at delivery time.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Whether the row already records a successful send.
    async fn is_sent(&self, id: i64) -> Result<bool, AppError>;

    /// Record the send. Returns the number of rows affected.
    async fn mark_sent(&self, id: i64) -> Result<u64, AppError>;
}

/// Postgres-backed notification store.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn is_sent(&self, id: i64) -> Result<bool, AppError> {
        let sent: Option<bool> = sqlx::query_scalar(
            "SELECT notification_sent IS NOT NULL FROM notification WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sent.unwrap_or(false))
    }

    async fn mark_sent(&self, id: i64) -> Result<u64, AppError> {
        // A redelivered message keeps the first send time.
        let result = sqlx::query(
            "UPDATE notification SET notification_sent = COALESCE(notification_sent, NOW()) WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
