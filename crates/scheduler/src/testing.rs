//! In-memory [`JobQueue`] shared by the scheduler tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use transit_common::error::AppError;
use transit_common::inflight::{MarkerStore, MemoryMarkers};
use transit_common::stream::JobQueue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appended {
    pub stream: String,
    pub job_type: String,
    pub data: Option<String>,
}

/// Records appends and keeps markers in a [`MemoryMarkers`]. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    pub markers: MemoryMarkers,
    appended: Arc<Mutex<Vec<Appended>>>,
    fail_appends: Arc<AtomicBool>,
}

impl MemoryQueue {
    pub fn appended(&self) -> Vec<Appended> {
        self.appended.lock().unwrap().clone()
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MarkerStore for MemoryQueue {
    async fn set_if_absent(&mut self, key: &str, ttl: Duration) -> Result<bool, AppError> {
        self.markers.set_if_absent(key, ttl).await
    }

    async fn remove(&mut self, key: &str) -> Result<(), AppError> {
        self.markers.remove(key).await
    }

    async fn increment(&mut self, key: &str, ttl: Duration) -> Result<u64, AppError> {
        self.markers.increment(key, ttl).await
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn append(
        &mut self,
        stream: &str,
        job_type: &str,
        data: Option<&str>,
    ) -> Result<String, AppError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(AppError::Internal("stream unavailable".to_string()));
        }

        let mut appended = self.appended.lock().unwrap();
        appended.push(Appended {
            stream: stream.to_string(),
            job_type: job_type.to_string(),
            data: data.map(str::to_string),
        });
        Ok(format!("{}-0", appended.len()))
    }
}
