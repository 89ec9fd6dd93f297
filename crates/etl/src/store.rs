use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use transit_common::error::AppError;
use transit_common::types::Vehicle;

/// Result of one bulk upsert.
#[derive(Debug, Clone, Default)]
pub struct UpsertSummary {
    /// Rows inserted or changed by this call, as stored.
    pub written: Vec<Vehicle>,
    /// Rows whose mutable fields already matched the stored values.
    pub unchanged: usize,
}

/// Vehicle persistence used by the ETL cycle.
#[async_trait]
pub trait VehicleRepository: Send + Sync {
    /// Insert or update every vehicle in one statement.
    ///
    /// Only the mutable fields are overwritten, never the bus number. Rows whose
    /// mutable fields are identical to the stored values are left untouched
    /// (including `updated_at`) and counted as unchanged. Bus numbers must be
    /// unique within `vehicles`.
    async fn upsert_all(&self, vehicles: &[Vehicle]) -> Result<UpsertSummary, AppError>;
}

/// Persists vehicle records keyed by bus number.
#[derive(Clone)]
pub struct VehicleStore {
    pool: PgPool,
}

impl VehicleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch one stored vehicle.
    pub async fn get(&self, bus_number: &str) -> Result<Option<Vehicle>, AppError> {
        let vehicle = sqlx::query_as(
            r#"
            SELECT bus_number, trip_id, driver, latitude, longitude, adherence, heartbeat, route_name, headsign
            FROM vehicle
            WHERE bus_number = $1
            "#,
        )
        .bind(bus_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(vehicle)
    }
}

#[async_trait]
impl VehicleRepository for VehicleStore {
    async fn upsert_all(&self, vehicles: &[Vehicle]) -> Result<UpsertSummary, AppError> {
        if vehicles.is_empty() {
            return Ok(UpsertSummary::default());
        }

        let bus_numbers: Vec<&str> = vehicles.iter().map(|v| v.bus_number.as_str()).collect();
        let trip_ids: Vec<Option<i64>> = vehicles.iter().map(|v| v.trip_id).collect();
        let drivers: Vec<Option<&str>> = vehicles.iter().map(|v| v.driver.as_deref()).collect();
        let latitudes: Vec<Option<f64>> = vehicles.iter().map(|v| v.latitude).collect();
        let longitudes: Vec<Option<f64>> = vehicles.iter().map(|v| v.longitude).collect();
        let adherences: Vec<Option<i32>> = vehicles.iter().map(|v| v.adherence).collect();
        let heartbeats: Vec<DateTime<Utc>> = vehicles.iter().map(|v| v.heartbeat).collect();
        let route_names: Vec<Option<&str>> =
            vehicles.iter().map(|v| v.route_name.as_deref()).collect();
        let headsigns: Vec<Option<&str>> = vehicles.iter().map(|v| v.headsign.as_deref()).collect();

        let written: Vec<Vehicle> = sqlx::query_as(
            r#"
            INSERT INTO vehicle AS v
                (bus_number, trip_id, driver, latitude, longitude, adherence, heartbeat, route_name, headsign)
            SELECT * FROM UNNEST(
                $1::text[], $2::bigint[], $3::text[], $4::float8[], $5::float8[],
                $6::int4[], $7::timestamptz[], $8::text[], $9::text[]
            )
            ON CONFLICT (bus_number) DO UPDATE SET
                trip_id = EXCLUDED.trip_id,
                driver = EXCLUDED.driver,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                adherence = EXCLUDED.adherence,
                heartbeat = EXCLUDED.heartbeat,
                route_name = EXCLUDED.route_name,
                headsign = EXCLUDED.headsign,
                updated_at = NOW()
            WHERE (v.trip_id, v.driver, v.latitude, v.longitude, v.adherence, v.heartbeat, v.route_name, v.headsign)
                IS DISTINCT FROM
                (EXCLUDED.trip_id, EXCLUDED.driver, EXCLUDED.latitude, EXCLUDED.longitude,
                 EXCLUDED.adherence, EXCLUDED.heartbeat, EXCLUDED.route_name, EXCLUDED.headsign)
            RETURNING bus_number, trip_id, driver, latitude, longitude, adherence, heartbeat, route_name, headsign
            "#,
        )
        .bind(&bus_numbers)
        .bind(&trip_ids)
        .bind(&drivers)
        .bind(&latitudes)
        .bind(&longitudes)
        .bind(&adherences)
        .bind(&heartbeats)
        .bind(&route_names)
        .bind(&headsigns)
        .fetch_all(&self.pool)
        .await?;

        let unchanged = vehicles.len() - written.len();
        tracing::debug!(written = written.len(), unchanged, "Upserted vehicles");

        Ok(UpsertSummary { written, unchanged })
    }
}
