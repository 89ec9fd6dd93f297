//! Pending-notification producer.
//!
//! Polls for notifications whose fire time has passed and appends one delivery
//! message per row. A notification enqueued in an earlier pass is left alone
//! until its re-enqueue cooldown lapses, so a row that is still unsent after
//! that (a failed or lost delivery) gets another attempt. Each row gets a
//! bounded number of attempts; a subscription that keeps rejecting pushes
//! stops producing new stream entries once it runs out.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use transit_common::error::AppError;
use transit_common::stream::JobQueue;
use transit_common::types::{NOTIFICATION_JOB_TYPE, Notification};

/// Redis key recording that notification `id` was recently enqueued.
pub fn enqueued_key(id: i64) -> String {
    format!("notification:enqueued:{}", id)
}

/// Latest fire time that counts as due at `now`.
pub fn due_cutoff(now: DateTime<Utc>, grace: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(grace)
        .ok()
        .and_then(|grace| now.checked_sub_signed(grace))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Unsent notifications scheduled before `cutoff`, oldest first.
pub async fn fetch_due(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<Vec<Notification>, AppError> {
    let rows = sqlx::query_as::<_, Notification>(
        r#"
        SELECT id, subscription, notification_data, notification_date, notification_sent
        FROM notification
        WHERE notification_sent IS NULL
          AND notification_date < $1
        ORDER BY notification_date
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Shortest lifetime of a per-notification enqueue counter.
const ENQUEUE_COUNT_MIN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Redis key counting how often notification `id` has been enqueued.
pub fn enqueue_count_key(id: i64) -> String {
    format!("notification:enqueues:{}", id)
}

/// Appends delivery jobs for due notifications, at most once per cooldown and
/// at most `max_enqueues` times per notification.
pub struct NotificationEnqueuer<Q> {
    queue: Q,
    stream: String,
    cooldown: Duration,
    max_enqueues: u64,
}

impl<Q: JobQueue> NotificationEnqueuer<Q> {
    pub fn new(queue: Q, stream: impl Into<String>, cooldown: Duration, max_enqueues: u64) -> Self {
        Self {
            queue,
            stream: stream.into(),
            cooldown,
            max_enqueues,
        }
    }

    /// Mark `id` as enqueued. Returns `false` if an earlier pass already did.
    async fn claim(&mut self, id: i64) -> Result<bool, AppError> {
        self.queue.set_if_absent(&enqueued_key(id), self.cooldown).await
    }

    async fn unclaim(&mut self, id: i64) -> Result<(), AppError> {
        self.queue.remove(&enqueued_key(id)).await
    }

    /// Count one more enqueue of `id`. Returns `false` once the cap is passed.
    async fn within_cap(&mut self, id: i64) -> Result<bool, AppError> {
        let ttl = self.cooldown.saturating_mul(2).max(ENQUEUE_COUNT_MIN_TTL);
        let count = self.queue.increment(&enqueue_count_key(id), ttl).await?;

        if count <= self.max_enqueues {
            return Ok(true);
        }
        if count == self.max_enqueues + 1 {
            tracing::warn!(
                notification_id = id,
                max_enqueues = self.max_enqueues,
                "Notification still unsent after every allowed enqueue, giving up"
            );
        }
        Ok(false)
    }

    /// Enqueue every notification in `due` that is neither cooling down nor
    /// over its cap. Returns how many were appended.
    pub async fn enqueue_due(&mut self, due: &[Notification]) -> Result<usize, AppError> {
        let mut enqueued = 0;
        let mut suppressed = 0;
        let mut exhausted = 0;

        for notification in due {
            if !self.claim(notification.id).await? {
                suppressed += 1;
                continue;
            }
            if !self.within_cap(notification.id).await? {
                exhausted += 1;
                continue;
            }

            let data = serde_json::to_string(notification)?;
            if let Err(e) = self
                .queue
                .append(&self.stream, NOTIFICATION_JOB_TYPE, Some(&data))
                .await
            {
                self.unclaim(notification.id).await?;
                return Err(e);
            }
            enqueued += 1;
        }

        if !due.is_empty() {
            tracing::info!(
                due = due.len(),
                enqueued,
                suppressed,
                exhausted,
                "Pending notifications polled"
            );
        }
        Ok(enqueued)
    }
}

pub struct PendingNotificationProducer<Q> {
    pool: PgPool,
    enqueuer: NotificationEnqueuer<Q>,
    poll_interval: Duration,
    grace: Duration,
}

impl<Q: JobQueue> PendingNotificationProducer<Q> {
    pub fn new(
        pool: PgPool,
        enqueuer: NotificationEnqueuer<Q>,
        poll_interval: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            pool,
            enqueuer,
            poll_interval,
            grace,
        }
    }

    /// Run one pass. Returns how many notifications were enqueued.
    pub async fn poll_once(&mut self) -> Result<usize, AppError> {
        let cutoff = due_cutoff(Utc::now(), self.grace);
        let due = fetch_due(&self.pool, cutoff).await?;
        self.enqueuer.enqueue_due(&due).await
    }

    /// Poll every interval until `token` is cancelled.
    pub async fn run(mut self, token: CancellationToken) {
        tracing::info!(
            stream = %self.enqueuer.stream,
            interval_ms = self.poll_interval.as_millis() as u64,
            grace_secs = self.grace.as_secs(),
            "Pending-notification producer started"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::error!(error = %e, "Pending-notification poll failed");
                    }
                }
            }
        }

        tracing::info!("Pending-notification producer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryQueue;
    use chrono::TimeZone;
    use sqlx::types::Json;
    use transit_common::inflight::MarkerStore;
    use transit_common::types::NotificationData;

    #[test]
    fn test_due_cutoff_subtracts_grace() {
        let now = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        let cutoff = due_cutoff(now, Duration::from_secs(60));
        assert_eq!(cutoff, Utc.with_ymd_and_hms(2024, 6, 10, 11, 59, 0).unwrap());
    }

    #[test]
    fn test_due_cutoff_saturates() {
        let now = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        assert_eq!(due_cutoff(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_enqueued_key() {
        assert_eq!(enqueued_key(42), "notification:enqueued:42");
        assert_eq!(enqueue_count_key(42), "notification:enqueues:42");
    }

    fn notification(id: i64) -> Notification {
        Notification {
            id,
            subscription: Json(serde_json::json!({
                "endpoint": "https://push.example.com/send/abc",
                "keys": {"p256dh": "key", "auth": "auth"}
            })),
            notification_data: Json(NotificationData::Stop { stop_id: "1234".to_string() }),
            notification_date: Utc.with_ymd_and_hms(2024, 6, 10, 11, 55, 0).unwrap(),
            notification_sent: None,
        }
    }

    fn enqueuer(queue: &MemoryQueue, max_enqueues: u64) -> NotificationEnqueuer<MemoryQueue> {
        NotificationEnqueuer::new(queue.clone(), "notification", Duration::from_secs(300), max_enqueues)
    }

    fn enqueued_ids(queue: &MemoryQueue) -> Vec<i64> {
        queue
            .appended()
            .iter()
            .map(|entry| {
                assert_eq!(entry.stream, "notification");
                assert_eq!(entry.job_type, NOTIFICATION_JOB_TYPE);
                let data = entry.data.as_deref().expect("notification payload");
                serde_json::from_str::<Notification>(data).unwrap().id
            })
            .collect()
    }

    /// Let the cooldown on `id` lapse.
    async fn cool_down(queue: &MemoryQueue, id: i64) {
        queue.clone().remove(&enqueued_key(id)).await.unwrap();
    }

    #[tokio::test]
    async fn test_each_due_row_is_enqueued_once_across_passes() {
        let queue = MemoryQueue::default();
        let mut enqueuer = enqueuer(&queue, 5);
        let due = vec![notification(1), notification(2)];

        assert_eq!(enqueuer.enqueue_due(&due).await.unwrap(), 2);
        assert_eq!(enqueuer.enqueue_due(&due).await.unwrap(), 0);

        assert_eq!(enqueued_ids(&queue), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_duplicate_row_within_a_pass_is_enqueued_once() {
        let queue = MemoryQueue::default();
        let mut enqueuer = enqueuer(&queue, 5);

        let enqueued = enqueuer
            .enqueue_due(&[notification(3), notification(3)])
            .await
            .unwrap();

        assert_eq!(enqueued, 1);
        assert_eq!(enqueued_ids(&queue), vec![3]);
    }

    #[tokio::test]
    async fn test_failed_append_unclaims_row_for_next_pass() {
        let queue = MemoryQueue::default();
        let mut enqueuer = enqueuer(&queue, 5);
        let due = vec![notification(4)];

        queue.fail_appends(true);
        assert!(matches!(enqueuer.enqueue_due(&due).await, Err(AppError::Internal(_))));
        assert!(!queue.markers.contains(&enqueued_key(4)));

        queue.fail_appends(false);
        assert_eq!(enqueuer.enqueue_due(&due).await.unwrap(), 1);
        assert_eq!(enqueued_ids(&queue), vec![4]);
    }

    #[tokio::test]
    async fn test_row_is_reenqueued_after_cooldown_until_cap() {
        let queue = MemoryQueue::default();
        let mut enqueuer = enqueuer(&queue, 2);
        let due = vec![notification(5)];

        for _ in 0..4 {
            enqueuer.enqueue_due(&due).await.unwrap();
            cool_down(&queue, 5).await;
        }

        assert_eq!(enqueued_ids(&queue), vec![5, 5]);
    }

    #[tokio::test]
    async fn test_exhausted_row_does_not_block_others() {
        let queue = MemoryQueue::default();
        let mut enqueuer = enqueuer(&queue, 1);

        enqueuer.enqueue_due(&[notification(6)]).await.unwrap();
        cool_down(&queue, 6).await;
        let enqueued = enqueuer
            .enqueue_due(&[notification(6), notification(7)])
            .await
            .unwrap();

        assert_eq!(enqueued, 1);
        assert_eq!(enqueued_ids(&queue), vec![6, 7]);
    }
}
