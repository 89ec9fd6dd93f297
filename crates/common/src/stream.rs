//! Durable append-only job log on Redis Streams.
//!
//! Producers append `{jobType, data?}` entries with `XADD`; consumers read them
//! through a named consumer group with `XREADGROUP`, and every entry stays in
//! the consumer's pending list until it is explicitly `XACK`ed.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamMaxlen, StreamReadOptions, StreamReadReply};

use crate::error::AppError;
use crate::inflight::MarkerStore;

/// Field holding the job type tag.
pub const JOB_TYPE_FIELD: &str = "jobType";
/// Field holding the optional JSON payload.
pub const DATA_FIELD: &str = "data";

/// Cursor that reads only entries never delivered to any consumer.
pub const NEW_ENTRIES: &str = ">";
/// Cursor that reads this consumer's own pending entries from the start.
pub const BACKLOG_START: &str = "0";

/// One entry read from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Id assigned by the log, e.g. `1718000000000-0`
    pub id: String,
    pub job_type: String,
    pub data: Option<String>,
}

impl StreamMessage {
    fn from_stream_id(entry: &StreamId) -> Self {
        Self {
            id: entry.id.clone(),
            job_type: entry.get(JOB_TYPE_FIELD).unwrap_or_default(),
            data: entry.get(DATA_FIELD),
        }
    }

    /// Deserialize the JSON payload.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, AppError> {
        let data = self
            .data
            .as_deref()
            .ok_or_else(|| AppError::Decode(format!("message {} has no data field", self.id)))?;
        Ok(serde_json::from_str(data)?)
    }
}

/// Consumer side of a durable log.
#[async_trait]
pub trait MessageLog: Send {
    /// Create the consumer group, treating "already exists" as success.
    async fn ensure_group(&mut self) -> Result<(), AppError>;

    /// Blocking read of up to `count` entries after `cursor`.
    ///
    /// Returns an empty batch when `block` elapses with nothing to read.
    async fn read(
        &mut self,
        cursor: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, AppError>;

    /// Release the claim on an entry.
    async fn ack(&mut self, id: &str) -> Result<(), AppError>;
}

/// Consumer-group handle on one Redis stream.
pub struct RedisStream {
    conn: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
}

impl RedisStream {
    pub fn new(
        conn: ConnectionManager,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }
}

#[async_trait]
impl MessageLog for RedisStream {
    async fn ensure_group(&mut self) -> Result<(), AppError> {
        let created: Result<(), redis::RedisError> = self
            .conn
            .xgroup_create_mkstream(&self.stream, &self.group, "$")
            .await;

        match created {
            Ok(()) => {
                tracing::info!(stream = %self.stream, group = %self.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                tracing::debug!(stream = %self.stream, group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read(
        &mut self,
        cursor: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, AppError> {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.stream], &[cursor], &options)
            .await?;

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .iter()
                    .flat_map(|key| key.ids.iter().map(StreamMessage::from_stream_id))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ack(&mut self, id: &str) -> Result<(), AppError> {
        let acked: i64 = self.conn.xack(&self.stream, &self.group, &[id]).await?;
        if acked == 0 {
            tracing::warn!(stream = %self.stream, message_id = id, "XACK released nothing");
        }
        Ok(())
    }
}

/// Producer side of a durable log.
///
/// Producers also hold the expiring markers that decide whether a job should
/// be appended at all.
#[async_trait]
pub trait JobQueue: MarkerStore {
    /// Append one job entry to `stream` and return its id.
    async fn append(
        &mut self,
        stream: &str,
        job_type: &str,
        data: Option<&str>,
    ) -> Result<String, AppError>;
}

/// Redis Streams producer.
#[derive(Clone)]
pub struct StreamProducer {
    conn: ConnectionManager,
    max_len: usize,
}

impl StreamProducer {
    pub fn new(conn: ConnectionManager, max_len: usize) -> Self {
        Self { conn, max_len }
    }
}

#[async_trait]
impl MarkerStore for StreamProducer {
    async fn set_if_absent(&mut self, key: &str, ttl: Duration) -> Result<bool, AppError> {
        self.conn.set_if_absent(key, ttl).await
    }

    async fn remove(&mut self, key: &str) -> Result<(), AppError> {
        self.conn.remove(key).await
    }

    async fn increment(&mut self, key: &str, ttl: Duration) -> Result<u64, AppError> {
        self.conn.increment(key, ttl).await
    }
}

#[async_trait]
impl JobQueue for StreamProducer {
    async fn append(
        &mut self,
        stream: &str,
        job_type: &str,
        data: Option<&str>,
    ) -> Result<String, AppError> {
        let mut fields = vec![(JOB_TYPE_FIELD, job_type)];
        if let Some(data) = data {
            fields.push((DATA_FIELD, data));
        }

        let id: String = self
            .conn
            .xadd_maxlen(stream, StreamMaxlen::Approx(self.max_len), "*", fields.as_slice())
            .await?;

        tracing::debug!(stream, job_type, message_id = %id, "Appended job");
        Ok(id)
    }
}
