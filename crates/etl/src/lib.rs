//! Telemetry ETL worker: turns one noisy upstream vehicle snapshot per cycle
//! into deduplicated, upserted vehicle rows and a change notice.

pub mod cycle;
pub mod dedupe;
pub mod fetch;
pub mod markup;
pub mod publish;
pub mod store;
pub mod transform;
