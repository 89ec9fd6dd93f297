//! Per-job-name in-flight markers.
//!
//! A recurring job is only enqueued when no earlier run of the same name is
//! still queued or executing. The scheduler takes the marker with
//! `SET NX EX` before appending the job; the worker deletes it once the run is
//! over. The TTL bounds how long a crashed worker can block the schedule.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::error::AppError;

/// Shortest TTL applied to a marker.
const MIN_TTL: Duration = Duration::from_secs(60);

/// Expiring keys used as markers and counters.
#[async_trait]
pub trait MarkerStore: Send {
    /// Set `key` unless it exists. Returns `false` if it was already set.
    async fn set_if_absent(&mut self, key: &str, ttl: Duration) -> Result<bool, AppError>;

    async fn remove(&mut self, key: &str) -> Result<(), AppError>;

    /// Increment the counter at `key` and push its expiry out to `ttl`.
    async fn increment(&mut self, key: &str, ttl: Duration) -> Result<u64, AppError>;
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl MarkerStore for ConnectionManager {
    async fn set_if_absent(&mut self, key: &str, ttl: Duration) -> Result<bool, AppError> {
        // SET key "1" NX EX ttl -> Some("OK") when set, None when already held
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(self)
            .await?;

        Ok(result.is_some())
    }

    async fn remove(&mut self, key: &str) -> Result<(), AppError> {
        self.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn increment(&mut self, key: &str, ttl: Duration) -> Result<u64, AppError> {
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .expire(key, i64::try_from(ttl_secs(ttl)).unwrap_or(i64::MAX))
            .ignore()
            .query_async(self)
            .await?;

        Ok(count)
    }
}

/// Process-local [`MarkerStore`]. Expiry is not modelled; keys live until removed.
#[derive(Debug, Clone, Default)]
pub struct MemoryMarkers {
    keys: Arc<Mutex<HashMap<String, u64>>>,
}

impl MemoryMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        // A poisoned map is still a valid map
        self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MarkerStore for MemoryMarkers {
    async fn set_if_absent(&mut self, key: &str, _ttl: Duration) -> Result<bool, AppError> {
        let mut keys = self.lock();
        if keys.contains_key(key) {
            return Ok(false);
        }
        keys.insert(key.to_string(), 1);
        Ok(true)
    }

    async fn remove(&mut self, key: &str) -> Result<(), AppError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn increment(&mut self, key: &str, _ttl: Duration) -> Result<u64, AppError> {
        let mut keys = self.lock();
        let count = keys.entry(key.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }
}

/// Redis key of the marker for `job_name`.
pub fn inflight_key(job_name: &str) -> String {
    format!("job:inflight:{}", job_name)
}

/// Marker TTL for a job repeating every `interval`.
pub fn inflight_ttl(interval: Duration) -> Duration {
    interval.saturating_mul(6).max(MIN_TTL)
}

/// Take the marker. Returns `false` if a previous run still holds it.
pub async fn try_acquire<M: MarkerStore + ?Sized>(
    markers: &mut M,
    job_name: &str,
    ttl: Duration,
) -> Result<bool, AppError> {
    markers.set_if_absent(&inflight_key(job_name), ttl).await
}

/// Drop the marker so the next tick can enqueue again.
pub async fn release<M: MarkerStore + ?Sized>(markers: &mut M, job_name: &str) -> Result<(), AppError> {
    markers.remove(&inflight_key(job_name)).await
}
