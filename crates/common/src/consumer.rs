//! Cooperative consumer-group loop shared by the workers.
//!
//! Messages are handled strictly one at a time. A message is acknowledged only
//! after its handler returns `Ok`; a failed message stays claimed under this
//! consumer's name and the loop moves on after a backoff sleep.
//!
//! On start the consumer first drains its own pending entries (cursor `0`),
//! so messages claimed before a crash are retried by the restarted process.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::StreamConfig;
use crate::error::AppError;
use crate::stream::{BACKLOG_START, MessageLog, NEW_ENTRIES, StreamMessage};

const GROUP_CREATE_ATTEMPTS: u32 = 5;
const GROUP_CREATE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Processes one message from the log.
#[async_trait]
pub trait JobHandler: Send {
    async fn handle(&mut self, message: &StreamMessage) -> Result<(), AppError>;
}

/// What happened to a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled and released.
    Acknowledged,
    /// Could never succeed; released without being handled.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Cursor {
    /// Re-reading our own pending entries after the given id.
    Backlog(String),
    New,
}

impl Cursor {
    fn as_str(&self) -> &str {
        match self {
            Cursor::Backlog(id) => id,
            Cursor::New => NEW_ENTRIES,
        }
    }
}

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub acknowledged: u64,
    pub discarded: u64,
    pub failed: u64,
}

/// Consumer-group loop over a [`MessageLog`].
pub struct Consumer<L: MessageLog> {
    log: L,
    cursor: Cursor,
    batch_size: usize,
    block: Duration,
    backoff: Duration,
    stats: ConsumerStats,
}

impl<L: MessageLog> Consumer<L> {
    pub fn new(log: L, config: &StreamConfig) -> Self {
        Self::with_settings(log, config.batch_size, config.block, config.backoff)
    }

    pub fn with_settings(log: L, batch_size: usize, block: Duration, backoff: Duration) -> Self {
        Self {
            log,
            cursor: Cursor::Backlog(BACKLOG_START.to_string()),
            batch_size: batch_size.max(1),
            block,
            backoff,
            stats: ConsumerStats::default(),
        }
    }

    /// Create the consumer group, retrying a few times before giving up.
    pub async fn ensure_group(&mut self) -> Result<(), AppError> {
        let mut attempt = 1;
        loop {
            match self.log.ensure_group().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < GROUP_CREATE_ATTEMPTS => {
                    tracing::warn!(attempt, error = %e, "Failed to create consumer group, retrying");
                    tokio::time::sleep(GROUP_CREATE_RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read the next batch. Returns empty on timeout or cancellation.
    pub async fn poll_next(
        &mut self,
        token: &CancellationToken,
    ) -> Result<Vec<StreamMessage>, AppError> {
        let batch = tokio::select! {
            _ = token.cancelled() => return Ok(Vec::new()),
            read = self.log.read(self.cursor.as_str(), self.batch_size, self.block) => read?,
        };

        if let Cursor::Backlog(_) = self.cursor {
            match batch.last() {
                Some(last) => {
                    tracing::info!(count = batch.len(), "Reprocessing pending messages");
                    self.cursor = Cursor::Backlog(last.id.clone());
                }
                None => {
                    tracing::debug!("Pending backlog drained, reading new messages");
                    self.cursor = Cursor::New;
                }
            }
        }

        Ok(batch)
    }

    /// Handle one message and acknowledge it if the handler succeeded.
    ///
    /// Retryable failures are returned without acknowledging.
    pub async fn dispatch<H: JobHandler>(
        &mut self,
        handler: &mut H,
        message: &StreamMessage,
    ) -> Result<Disposition, AppError> {
        match handler.handle(message).await {
            Ok(()) => {
                self.log.ack(&message.id).await?;
                self.stats.acknowledged += 1;
                Ok(Disposition::Acknowledged)
            }
            Err(e) if e.is_permanent() => {
                tracing::error!(
                    message_id = %message.id,
                    job_type = %message.job_type,
                    error = %e,
                    "Discarding message that can never be processed"
                );
                self.log.ack(&message.id).await?;
                self.stats.discarded += 1;
                Ok(Disposition::Discarded)
            }
            Err(e) => {
                self.stats.failed += 1;
                Err(e)
            }
        }
    }

    /// Run until `token` is cancelled. The message in flight at cancellation
    /// time is finished before the loop exits.
    pub async fn run<H: JobHandler>(
        mut self,
        handler: &mut H,
        token: CancellationToken,
    ) -> Result<ConsumerStats, AppError> {
        self.ensure_group().await?;

        while !token.is_cancelled() {
            let batch = match self.poll_next(&token).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read from stream");
                    self.pause(&token).await;
                    continue;
                }
            };

            for message in &batch {
                match self.dispatch(handler, message).await {
                    Ok(disposition) => {
                        tracing::debug!(message_id = %message.id, ?disposition, "Message done");
                    }
                    Err(e) => {
                        tracing::error!(
                            message_id = %message.id,
                            job_type = %message.job_type,
                            error = %e,
                            "Error processing message, leaving it claimed"
                        );
                        self.pause(&token).await;
                    }
                }

                if token.is_cancelled() {
                    break;
                }
            }
        }

        tracing::info!(
            acknowledged = self.stats.acknowledged,
            discarded = self.stats.discarded,
            failed = self.stats.failed,
            "Consumer loop stopped"
        );

        Ok(self.stats)
    }

    async fn pause(&self, token: &CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(self.backoff) => {}
        }
    }
}
