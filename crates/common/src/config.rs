use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::error::AppError;

/// Connection settings shared by every worker process.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 10)
    pub db_max_connections: u32,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            redis_url: var_or("REDIS_URL", "redis://localhost:6379"),
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", 10)?,
        })
    }
}

/// Consumer-group settings for one durable stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub stream_name: String,
    pub consumer_group: String,
    /// Stable consumer identity; restarts with the same name pick up their own backlog.
    pub consumer_name: String,
    pub block: Duration,
    pub batch_size: usize,
    /// Sleep after a message fails before the next poll.
    pub backoff: Duration,
}

impl StreamConfig {
    /// Load stream settings. `default_stream` and `default_group` apply when
    /// `REDIS_STREAM_NAME` / `REDIS_CONSUMER_GROUP_NAME` are unset.
    pub fn from_env(default_stream: &str, default_group: &str) -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        Ok(Self {
            stream_name: var_or("REDIS_STREAM_NAME", default_stream),
            consumer_group: var_or("REDIS_CONSUMER_GROUP_NAME", default_group),
            consumer_name: std::env::var("REDIS_CONSUMER_NAME")
                .or_else(|_| std::env::var("HOSTNAME"))
                .unwrap_or_else(|_| format!("{}-worker", default_group)),
            block: Duration::from_millis(parse_or("REDIS_BLOCK_MS", 2500)?),
            batch_size: parse_or("REDIS_BATCH_SIZE", 1)?,
            backoff: Duration::from_millis(parse_or("WORKER_BACKOFF_MS", 1000)?),
        })
    }
}

/// Telemetry ETL worker configuration.
#[derive(Debug, Clone)]
pub struct EtlConfig {
    pub app: AppConfig,
    pub stream: StreamConfig,

    /// Upstream vehicle feed (XML)
    pub vehicle_api_url: String,

    /// Upstream API key, sent as `?key=`
    pub api_key: String,

    /// Fan-out channel for vehicle change notices
    pub publish_channel: String,

    /// Job type tag this worker runs
    pub job_name: String,

    /// Transit agency time zone used to read upstream local timestamps
    pub agency_timezone: Tz,

    pub http_timeout: Duration,
}

impl EtlConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self {
            app: AppConfig::from_env()?,
            stream: StreamConfig::from_env("busApi", "etl")?,
            vehicle_api_url: var_or("VEHICLE_API_URL", "http://api.thebus.org/vehicle/"),
            api_key: required("API_KEY")?,
            publish_channel: var_or("REDIS_VEHICLE_PUBLISH_CHANNEL", "vehicleUpsert"),
            job_name: var_or("ETL_JOB_NAME", "busApi"),
            agency_timezone: parse_timezone(&var_or("AGENCY_TIMEZONE", "Pacific/Honolulu"))?,
            http_timeout: Duration::from_secs(parse_or("HTTP_TIMEOUT_SECS", 10)?),
        })
    }
}

/// Notification delivery worker configuration.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub app: AppConfig,
    pub stream: StreamConfig,

    /// Upstream arrivals feed (JSON)
    pub arrivals_api_url: String,
    pub api_key: String,

    pub vapid_public_key: String,
    pub vapid_private_key: String,
    /// Contact address placed in the VAPID `sub` claim
    pub vapid_email: String,

    pub icon: String,
    pub http_timeout: Duration,
}

impl NotifierConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self {
            app: AppConfig::from_env()?,
            stream: StreamConfig::from_env("notification", "notifier")?,
            arrivals_api_url: var_or("ARRIVALS_API_URL", "http://api.thebus.org/arrivalsJSON/"),
            api_key: required("API_KEY")?,
            vapid_public_key: required("VAPID_PUBLIC_KEY")?,
            vapid_private_key: required("VAPID_PRIVATE_KEY")?,
            vapid_email: required("VAPID_EMAIL")?,
            icon: var_or("NOTIFICATION_ICON", "/assets/icons/bus-icon.png"),
            http_timeout: Duration::from_secs(parse_or("HTTP_TIMEOUT_SECS", 10)?),
        })
    }
}

/// Smallest grace buffer accepted when selecting due notifications.
pub const MIN_NOTIFICATION_GRACE_SECS: u64 = 60;

/// Scheduler / pending-notification producer configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub app: AppConfig,

    pub etl_stream: String,
    pub etl_job_name: String,
    pub etl_interval: Duration,

    pub notification_stream: String,
    pub notification_poll_interval: Duration,
    pub notification_grace: Duration,
    /// How long an enqueued-but-unsent notification is left alone before it is enqueued again
    pub notification_reenqueue_cooldown: Duration,
    /// Enqueues allowed per notification before the producer gives up on it
    pub notification_max_enqueues: u64,

    /// Approximate cap applied with `XADD MAXLEN ~`
    pub stream_max_len: usize,
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let grace_secs: u64 = parse_or("NOTIFICATION_GRACE_SECS", MIN_NOTIFICATION_GRACE_SECS)?;
        if grace_secs < MIN_NOTIFICATION_GRACE_SECS {
            return Err(AppError::Config(format!(
                "NOTIFICATION_GRACE_SECS must be at least {}",
                MIN_NOTIFICATION_GRACE_SECS
            )));
        }

        Ok(Self {
            app: AppConfig::from_env()?,
            etl_stream: var_or("REDIS_STREAM_API_NAME", "busApi"),
            etl_job_name: var_or("ETL_JOB_NAME", "busApi"),
            etl_interval: positive_interval(
                "ETL_INTERVAL_MS",
                Duration::from_millis(parse_or("ETL_INTERVAL_MS", 10_000)?),
            )?,
            notification_stream: var_or("REDIS_STREAM_NOTIFICATION_NAME", "notification"),
            notification_poll_interval: positive_interval(
                "NOTIFICATION_POLL_INTERVAL_MS",
                Duration::from_millis(parse_or("NOTIFICATION_POLL_INTERVAL_MS", 60_000)?),
            )?,
            notification_grace: Duration::from_secs(grace_secs),
            notification_reenqueue_cooldown: Duration::from_secs(parse_or(
                "NOTIFICATION_REENQUEUE_COOLDOWN_SECS",
                300,
            )?),
            notification_max_enqueues: parse_or("NOTIFICATION_MAX_ENQUEUES", 5)?,
            stream_max_len: parse_or("STREAM_MAX_LEN", 10_000)?,
        })
    }
}

/// Tick intervals must be non-zero; `tokio::time::interval` panics otherwise.
fn positive_interval(name: &str, interval: Duration) -> Result<Duration, AppError> {
    if interval.is_zero() {
        return Err(AppError::Config(format!("{} must be greater than zero", name)));
    }
    Ok(interval)
}

fn required(name: &str) -> Result<String, AppError> {
    std::env::var(name)
        .map_err(|_| AppError::Config(format!("{} environment variable is required", name)))
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match std::env::var(name) {
        Ok(raw) => parse_value(name, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> Result<T, AppError> {
    raw.trim().parse().map_err(|_| {
        AppError::Config(format!(
            "{} must be a valid {}",
            name,
            std::any::type_name::<T>()
        ))
    })
}

/// Parse an IANA time zone name such as `Pacific/Honolulu`.
pub fn parse_timezone(name: &str) -> Result<Tz, AppError> {
    name.parse::<Tz>()
        .map_err(|_| AppError::Config(format!("unknown time zone: {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_accepts_padded_numbers() {
        let value: u64 = parse_value("ETL_INTERVAL_MS", " 2000 ").unwrap();
        assert_eq!(value, 2000);
    }

    #[test]
    fn test_parse_value_rejects_garbage() {
        let err = parse_value::<u32>("DB_MAX_CONNECTIONS", "many").unwrap_err();
        assert!(matches!(err, AppError::Config(msg) if msg.contains("DB_MAX_CONNECTIONS")));
    }

    #[test]
    fn test_positive_interval_rejects_zero() {
        let err = positive_interval("ETL_INTERVAL_MS", Duration::ZERO).unwrap_err();
        assert!(matches!(err, AppError::Config(msg) if msg.contains("ETL_INTERVAL_MS")));
        assert_eq!(
            positive_interval("ETL_INTERVAL_MS", Duration::from_millis(1)).unwrap(),
            Duration::from_millis(1)
        );
    }

    #[test]
    fn test_parse_timezone() {
        assert_eq!(parse_timezone("Pacific/Honolulu").unwrap(), chrono_tz::Pacific::Honolulu);
        assert!(parse_timezone("Mars/Olympus_Mons").is_err());
    }
}
