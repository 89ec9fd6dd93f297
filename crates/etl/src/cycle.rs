//! One full ETL cycle and the stream handler that runs it.
//!
//! fetch -> repair -> parse -> dedupe -> map -> upsert -> publish.
//! Any failure ends the cycle and is reported as a failed [`JobResult`]; the
//! next scheduled tick is the retry.

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;

use transit_common::consumer::JobHandler;
use transit_common::error::AppError;
use transit_common::inflight::{self, MarkerStore};
use transit_common::stream::StreamMessage;
use transit_common::types::{JobResult, Vehicle};

use crate::dedupe::resolve_duplicates;
use crate::fetch::SnapshotSource;
use crate::markup::{parse_snapshot, repair_markup};
use crate::publish::ChangeSink;
use crate::store::VehicleRepository;
use crate::transform::to_vehicle_record;

/// What a successful cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub reported: usize,
    pub written: usize,
    pub unchanged: usize,
}

/// Turn one raw snapshot into deduplicated vehicle records.
pub fn transform_snapshot(raw: &str, timezone: Tz) -> Result<Vec<Vehicle>, AppError> {
    let clean = repair_markup(raw);
    let records = parse_snapshot(&clean)?.into_vehicles()?;
    let reported = records.len();
    let records = resolve_duplicates(records)?;

    if records.len() != reported {
        tracing::info!(reported, kept = records.len(), "Dropped duplicate vehicle reports");
    }

    let now = Utc::now();
    Ok(records
        .iter()
        .map(|record| to_vehicle_record(record, timezone, now))
        .collect())
}

/// Telemetry ETL worker state: clients opened once and reused every cycle.
pub struct EtlWorker<S, R, P> {
    client: S,
    store: R,
    publisher: P,
    timezone: Tz,
}

impl<S, R, P> EtlWorker<S, R, P>
where
    S: SnapshotSource,
    R: VehicleRepository,
    P: ChangeSink,
{
    pub fn new(client: S, store: R, publisher: P, timezone: Tz) -> Self {
        Self {
            client,
            store,
            publisher,
            timezone,
        }
    }

    /// Run one cycle and report the outcome instead of propagating it.
    pub async fn run_cycle(&mut self) -> JobResult {
        let started = Instant::now();

        match self.execute().await {
            Ok(report) => JobResult::success(
                format!(
                    "{} successful upserts ({} unchanged)",
                    report.written, report.unchanged
                ),
                started.elapsed(),
            ),
            Err(e) => {
                if let AppError::UpstreamReportedError(_) = e {
                    tracing::error!(error = %e, "Upstream rejected the vehicle request");
                }
                JobResult::failed(format!("Error: {}", e), started.elapsed())
            }
        }
    }

    async fn execute(&mut self) -> Result<CycleReport, AppError> {
        let raw = self.client.fetch_snapshot().await?;
        let vehicles = transform_snapshot(&raw, self.timezone)?;
        let summary = self.store.upsert_all(&vehicles).await?;

        if !summary.written.is_empty() {
            self.publisher.publish_change_notice(&summary.written).await?;
        }

        Ok(CycleReport {
            reported: vehicles.len(),
            written: summary.written.len(),
            unchanged: summary.unchanged,
        })
    }
}

/// Runs an ETL cycle for each scheduled job message.
///
/// The in-flight marker taken by the scheduler is released after every run,
/// whatever its outcome.
pub struct EtlJobHandler<S, R, P, M> {
    worker: EtlWorker<S, R, P>,
    job_name: String,
    markers: M,
}

impl<S, R, P, M> EtlJobHandler<S, R, P, M> {
    pub fn new(worker: EtlWorker<S, R, P>, job_name: impl Into<String>, markers: M) -> Self {
        Self {
            worker,
            job_name: job_name.into(),
            markers,
        }
    }
}

#[async_trait]
impl<S, R, P, M> JobHandler for EtlJobHandler<S, R, P, M>
where
    S: SnapshotSource,
    R: VehicleRepository,
    P: ChangeSink,
    M: MarkerStore,
{
    async fn handle(&mut self, message: &StreamMessage) -> Result<(), AppError> {
        if message.job_type != self.job_name {
            tracing::warn!(
                message_id = %message.id,
                job_type = %message.job_type,
                expected = %self.job_name,
                "Skipping job of unknown type"
            );
            return Ok(());
        }

        tracing::info!(message_id = %message.id, "Starting job");
        let result = self.worker.run_cycle().await;

        if result.is_success() {
            tracing::info!(
                message_id = %message.id,
                status = %result.status,
                message = %result.message,
                duration = %result.duration,
                "Job done"
            );
        } else {
            tracing::error!(
                message_id = %message.id,
                status = %result.status,
                message = %result.message,
                duration = %result.duration,
                "Job failed"
            );
        }

        if let Err(e) = inflight::release(&mut self.markers, &self.job_name).await {
            tracing::warn!(error = %e, job = %self.job_name, "Unable to release in-flight marker");
        }

        Ok(())
    }
}
