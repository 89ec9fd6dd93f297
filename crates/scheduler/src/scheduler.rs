//! Recurring job registrations on top of the stream log.
//!
//! Each recurring job is a spawned task ticking on its own interval. A tick
//! appends a job only after taking the job's in-flight marker, so at most one
//! run per job name is queued or executing at a time.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use transit_common::error::AppError;
use transit_common::inflight;
use transit_common::stream::JobQueue;

/// A running recurring registration.
struct Registration {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Recurring registrations keyed by job name.
#[derive(Default)]
struct Registrations {
    entries: HashMap<String, Registration>,
}

impl Registrations {
    /// Install `registration`, returning the one it replaces.
    fn insert(&mut self, name: &str, registration: Registration) -> Option<Registration> {
        self.entries.insert(name.to_string(), registration)
    }

    fn remove(&mut self, name: &str) -> Option<Registration> {
        self.entries.remove(name)
    }

    fn drain(&mut self) -> Vec<(String, Registration)> {
        self.entries.drain().collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

async fn stop(name: &str, registration: Registration) {
    registration.token.cancel();
    if let Err(e) = registration.handle.await {
        tracing::warn!(job = name, error = %e, "Recurring job task did not stop cleanly");
    }
}

/// Enqueues one-shot and recurring jobs.
pub struct JobScheduler<Q> {
    queue: Q,
    registrations: Registrations,
}

impl<Q: JobQueue + Clone + 'static> JobScheduler<Q> {
    pub fn new(queue: Q) -> Self {
        Self {
            queue,
            registrations: Registrations::default(),
        }
    }

    /// Append a single job to `stream`.
    pub async fn enqueue<T: Serialize>(
        &mut self,
        stream: &str,
        job_type: &str,
        payload: Option<&T>,
    ) -> Result<String, AppError> {
        let data = payload.map(serde_json::to_string).transpose()?;
        self.queue.append(stream, job_type, data.as_deref()).await
    }

    /// Replace any registration under `job_name` with a fresh one.
    ///
    /// The job is enqueued once immediately, then every `interval`.
    pub async fn schedule_recurring(
        &mut self,
        job_name: &str,
        stream: &str,
        interval: Duration,
    ) -> Result<(), AppError> {
        self.clear_recurring(job_name).await;

        let job = RecurringJob {
            job_name: job_name.to_string(),
            stream: stream.to_string(),
            interval,
            marker_ttl: inflight::inflight_ttl(interval),
        };

        job.enqueue_if_idle(&mut self.queue).await?;

        let token = CancellationToken::new();
        let handle = tokio::spawn(job.run(self.queue.clone(), token.clone()));
        self.registrations.insert(job_name, Registration { token, handle });

        tracing::info!(
            job = job_name,
            stream,
            interval_ms = interval.as_millis() as u64,
            "Recurring job scheduled"
        );
        Ok(())
    }

    /// Stop the recurring registration under `job_name`, if any.
    pub async fn clear_recurring(&mut self, job_name: &str) -> bool {
        match self.registrations.remove(job_name) {
            Some(registration) => {
                stop(job_name, registration).await;
                tracing::info!(job = job_name, "Recurring job cleared");
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, job_name: &str) -> bool {
        self.registrations.contains(job_name)
    }

    pub fn scheduled_count(&self) -> usize {
        self.registrations.len()
    }

    /// Cancel every registration and wait for its task.
    pub async fn shutdown(&mut self) {
        for (name, registration) in self.registrations.drain() {
            stop(&name, registration).await;
        }
        tracing::info!("Scheduler stopped");
    }
}

/// Task state of one recurring registration.
struct RecurringJob {
    job_name: String,
    stream: String,
    interval: Duration,
    marker_ttl: Duration,
}

impl RecurringJob {
    /// Append the job unless an earlier run still holds the in-flight marker.
    async fn enqueue_if_idle<Q: JobQueue>(&self, queue: &mut Q) -> Result<bool, AppError> {
        if !inflight::try_acquire(queue, &self.job_name, self.marker_ttl).await? {
            tracing::debug!(job = %self.job_name, "Previous run still in flight, skipping tick");
            return Ok(false);
        }

        if let Err(e) = queue.append(&self.stream, &self.job_name, None).await {
            // Without the job nothing would release the marker
            inflight::release(queue, &self.job_name).await?;
            return Err(e);
        }

        Ok(true)
    }

    async fn run<Q: JobQueue>(self, mut queue: Q, token: CancellationToken) {
        let start = Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.enqueue_if_idle(&mut queue).await {
                        tracing::error!(job = %self.job_name, error = %e, "Failed to enqueue recurring job");
                    }
                }
            }
        }

        tracing::debug!(job = %self.job_name, "Recurring job task exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryQueue;

    const INTERVAL: Duration = Duration::from_secs(10);

    async fn worker_finished(queue: &MemoryQueue, job_name: &str) {
        inflight::release(&mut queue.clone(), job_name).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_job_runs_immediately_then_every_interval() {
        let queue = MemoryQueue::default();
        let mut scheduler = JobScheduler::new(queue.clone());

        scheduler.schedule_recurring("busApi", "busApi", INTERVAL).await.unwrap();
        let appended = queue.appended();
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].stream, "busApi");
        assert_eq!(appended[0].job_type, "busApi");
        assert_eq!(appended[0].data, None);
        assert!(queue.markers.contains("job:inflight:busApi"));

        worker_finished(&queue, "busApi").await;
        tokio::time::sleep(INTERVAL / 2).await;
        assert_eq!(queue.appended().len(), 1);

        tokio::time::sleep(INTERVAL / 2 + Duration::from_millis(1)).await;
        assert_eq!(queue.appended().len(), 2);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_is_skipped_while_previous_run_holds_marker() {
        let queue = MemoryQueue::default();
        let mut scheduler = JobScheduler::new(queue.clone());

        scheduler.schedule_recurring("busApi", "busApi", INTERVAL).await.unwrap();
        tokio::time::sleep(INTERVAL * 3 + Duration::from_millis(1)).await;
        assert_eq!(queue.appended().len(), 1);

        worker_finished(&queue, "busApi").await;
        tokio::time::sleep(INTERVAL).await;
        assert_eq!(queue.appended().len(), 2);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_job_stops_enqueueing() {
        let queue = MemoryQueue::default();
        let mut scheduler = JobScheduler::new(queue.clone());

        scheduler.schedule_recurring("busApi", "busApi", INTERVAL).await.unwrap();
        assert!(scheduler.is_scheduled("busApi"));
        assert!(scheduler.clear_recurring("busApi").await);
        assert!(!scheduler.clear_recurring("busApi").await);

        worker_finished(&queue, "busApi").await;
        tokio::time::sleep(INTERVAL * 2).await;
        assert_eq!(queue.appended().len(), 1);
        assert_eq!(scheduler.scheduled_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_initial_append_releases_marker() {
        let queue = MemoryQueue::default();
        queue.fail_appends(true);
        let mut scheduler = JobScheduler::new(queue.clone());

        let result = scheduler.schedule_recurring("busApi", "busApi", INTERVAL).await;

        assert!(matches!(result, Err(AppError::Internal(_))));
        assert!(!queue.markers.contains("job:inflight:busApi"));
        assert!(!scheduler.is_scheduled("busApi"));
    }

    #[tokio::test]
    async fn test_enqueue_serializes_payload() {
        let queue = MemoryQueue::default();
        let mut scheduler = JobScheduler::new(queue.clone());

        scheduler
            .enqueue("notification", "notification", Some(&serde_json::json!({"id": 7})))
            .await
            .unwrap();
        scheduler.enqueue::<()>("busApi", "busApi", None).await.unwrap();

        let appended = queue.appended();
        assert_eq!(appended[0].data.as_deref(), Some(r#"{"id":7}"#));
        assert_eq!(appended[1].data, None);
    }

    fn idle_registration() -> (Registration, CancellationToken) {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        (Registration { token: token.clone(), handle }, token)
    }

    #[tokio::test]
    async fn test_reinsert_replaces_previous_registration() {
        let mut registrations = Registrations::default();
        let (first, first_token) = idle_registration();
        let (second, second_token) = idle_registration();

        assert!(registrations.insert("busApi", first).is_none());
        let replaced = registrations.insert("busApi", second).expect("previous registration");
        stop("busApi", replaced).await;

        assert_eq!(registrations.len(), 1);
        assert!(first_token.is_cancelled());
        assert!(!second_token.is_cancelled());
    }

    #[tokio::test]
    async fn test_remove_unknown_name_is_none() {
        let mut registrations = Registrations::default();
        let (registration, _) = idle_registration();
        registrations.insert("busApi", registration);

        assert!(registrations.remove("other").is_none());
        assert!(registrations.contains("busApi"));
    }

    #[tokio::test]
    async fn test_drain_stops_every_task() {
        let mut registrations = Registrations::default();
        let (a, a_token) = idle_registration();
        let (b, b_token) = idle_registration();
        registrations.insert("a", a);
        registrations.insert("b", b);

        for (name, registration) in registrations.drain() {
            stop(&name, registration).await;
        }

        assert_eq!(registrations.len(), 0);
        assert!(a_token.is_cancelled());
        assert!(b_token.is_cancelled());
    }
}
