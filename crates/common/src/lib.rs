//! Shared building blocks for the transit telemetry workers: configuration,
//! error taxonomy, domain types, Postgres/Redis handles and the durable
//! stream consumer loop.

pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod inflight;
pub mod redis_pool;
pub mod shutdown;
pub mod stream;
pub mod types;

/// Install the JSON tracing subscriber used by every binary.
///
/// `default_filter` applies when `RUST_LOG` is unset.
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .json()
        .init();
}
