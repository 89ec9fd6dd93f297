use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

/// Canonical per-vehicle record, one row per bus number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub bus_number: String,
    pub trip_id: Option<i64>,
    pub driver: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Schedule deviation reported upstream (ahead/behind)
    pub adherence: Option<i32>,
    /// Time of the most recent upstream report accepted for this bus
    pub heartbeat: DateTime<Utc>,
    pub route_name: Option<String>,
    pub headsign: Option<String>,
}

/// What a notification is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NotificationData {
    Stop {
        #[serde(rename = "stopId")]
        stop_id: String,
    },
    Bus {
        #[serde(rename = "busId")]
        bus_id: String,
    },
}

/// A user-requested, time-scheduled push alert.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: i64,
    /// Opaque push-endpoint descriptor supplied by the browser
    pub subscription: Json<serde_json::Value>,
    pub notification_data: Json<NotificationData>,
    pub notification_date: DateTime<Utc>,
    /// `None` while pending
    pub notification_sent: Option<DateTime<Utc>>,
}

/// Job type tag for notification delivery messages.
pub const NOTIFICATION_JOB_TYPE: &str = "notification";

/// Human-readable push payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub icon: String,
}

/// Messages published on the vehicle fan-out channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ChannelMessage {
    #[serde(rename = "vehicleUpdate")]
    VehicleUpdate(Vec<Vehicle>),
}

/// Outcome of one scheduled job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Success,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Structured result of a job, reported instead of propagating the failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    pub message: String,
    /// Elapsed wall time, e.g. `"0.412 seconds"`
    pub duration: String,
}

impl JobResult {
    pub fn success(message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status: JobStatus::Success,
            message: message.into(),
            duration: format_duration(elapsed),
        }
    }

    pub fn failed(message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status: JobStatus::Failed,
            message: message.into(),
            duration: format_duration(elapsed),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }
}

fn format_duration(elapsed: Duration) -> String {
    format!("{:.3} seconds", elapsed.as_secs_f64())
}
