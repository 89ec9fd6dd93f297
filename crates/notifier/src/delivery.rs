//! Notification delivery handler.
//!
//! Per message: decode -> build payload -> push -> mark sent. The consumer
//! acknowledges the log entry only when this handler returns `Ok`, so the
//! order is always push, then store update, then ack. A crash between push and
//! ack can resend the same notification later; it is never dropped silently.

use async_trait::async_trait;

use transit_common::consumer::JobHandler;
use transit_common::error::AppError;
use transit_common::stream::StreamMessage;
use transit_common::types::{NOTIFICATION_JOB_TYPE, Notification};

use crate::arrivals::ArrivalsSource;
use crate::payload::build_payload;
use crate::push::PushGateway;
use crate::store::NotificationStore;

/// Sends due notifications read from the notification stream.
pub struct DeliveryHandler<P, S, A> {
    push: P,
    store: S,
    arrivals: A,
    icon: String,
}

impl<P, S, A> DeliveryHandler<P, S, A>
where
    P: PushGateway,
    S: NotificationStore,
    A: ArrivalsSource,
{
    pub fn new(push: P, store: S, arrivals: A, icon: impl Into<String>) -> Self {
        Self {
            push,
            store,
            arrivals,
            icon: icon.into(),
        }
    }

    /// Deliver one notification and record it as sent.
    pub async fn deliver(&self, notification: &Notification) -> Result<(), AppError> {
        if self.store.is_sent(notification.id).await? {
            tracing::info!(notification_id = notification.id, "Notification already sent, skipping");
            return Ok(());
        }

        let payload = build_payload(&notification.notification_data, &self.arrivals, &self.icon).await?;

        let result = self.push.send(&notification.subscription, &payload).await?;
        if !result.is_created() {
            return Err(AppError::PushDeliveryFailed {
                status: result.status,
                body: result.body,
            });
        }

        let affected = self.store.mark_sent(notification.id).await?;
        if affected == 0 {
            tracing::error!(
                notification_id = notification.id,
                "Push sent but notification row was not updated; row and stream have diverged"
            );
            return Err(AppError::NotificationRowMissing(notification.id));
        }

        tracing::info!(notification_id = notification.id, status = result.status, "Notification delivered");
        Ok(())
    }
}

#[async_trait]
impl<P, S, A> JobHandler for DeliveryHandler<P, S, A>
where
    P: PushGateway,
    S: NotificationStore,
    A: ArrivalsSource,
{
    async fn handle(&mut self, message: &StreamMessage) -> Result<(), AppError> {
        if message.job_type != NOTIFICATION_JOB_TYPE {
            tracing::warn!(
                message_id = %message.id,
                job_type = %message.job_type,
                "Skipping job of unknown type"
            );
            return Ok(());
        }

        let notification: Notification = message.payload()?;
        tracing::debug!(message_id = %message.id, notification_id = notification.id, "Claimed notification");
        self.deliver(&notification).await
    }
}
