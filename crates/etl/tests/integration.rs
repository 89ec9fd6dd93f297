//! Integration tests for the vehicle upsert path.
//!
//! These tests require a running PostgreSQL database and the `DATABASE_URL`
//! environment variable to be set. Run with:
//!
//! ```bash
//! DATABASE_URL="postgresql://..." cargo test -p transit-etl --test integration -- --ignored --nocapture
//! ```

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Pacific::Honolulu;
use sqlx::PgPool;

use transit_common::types::Vehicle;
use transit_etl::cycle::transform_snapshot;
use transit_etl::store::{VehicleRepository, VehicleStore};

fn make_vehicle(bus_number: &str, trip_id: Option<i64>, heartbeat: DateTime<Utc>) -> Vehicle {
    Vehicle {
        bus_number: bus_number.to_string(),
        trip_id,
        driver: Some("4285".to_string()),
        latitude: Some(21.3),
        longitude: Some(-157.8),
        adherence: Some(0),
        heartbeat,
        route_name: Some("A".to_string()),
        headsign: Some("WAIKIKI".to_string()),
    }
}

async fn updated_at(pool: &PgPool, bus_number: &str) -> DateTime<Utc> {
    let row: (DateTime<Utc>,) = sqlx::query_as("SELECT updated_at FROM vehicle WHERE bus_number = $1")
        .bind(bus_number)
        .fetch_one(pool)
        .await
        .unwrap();
    row.0
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore] // Requires DATABASE_URL; run explicitly with --ignored
async fn test_upsert_inserts_then_skips_identical_rows(pool: PgPool) {
    let store = VehicleStore::new(pool.clone());
    let heartbeat = Utc.with_ymd_and_hms(2024, 6, 11, 1, 0, 0).unwrap();
    let vehicles = vec![
        make_vehicle("101", Some(1), heartbeat),
        make_vehicle("102", None, heartbeat),
    ];

    let first = store.upsert_all(&vehicles).await.unwrap();
    assert_eq!(first.written.len(), 2);
    assert_eq!(first.unchanged, 0);
    let marker = updated_at(&pool, "101").await;

    let second = store.upsert_all(&vehicles).await.unwrap();
    assert!(second.written.is_empty(), "Identical rows should not be rewritten");
    assert_eq!(second.unchanged, vehicles.len());
    assert_eq!(updated_at(&pool, "101").await, marker);
    assert_eq!(store.get("101").await.unwrap(), Some(vehicles[0].clone()));
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore]
async fn test_upsert_overwrites_only_changed_rows(pool: PgPool) {
    let store = VehicleStore::new(pool.clone());
    let heartbeat = Utc.with_ymd_and_hms(2024, 6, 11, 1, 0, 0).unwrap();
    store
        .upsert_all(&[
            make_vehicle("101", Some(1), heartbeat),
            make_vehicle("102", Some(2), heartbeat),
        ])
        .await
        .unwrap();

    let mut moved = make_vehicle("101", Some(1), heartbeat + chrono::Duration::seconds(10));
    moved.latitude = Some(21.31);
    let summary = store
        .upsert_all(&[moved.clone(), make_vehicle("102", Some(2), heartbeat)])
        .await
        .unwrap();

    assert_eq!(summary.written, vec![moved.clone()]);
    assert_eq!(summary.unchanged, 1);

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM vehicle")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count.0, 2);
    assert_eq!(store.get("101").await.unwrap(), Some(moved));
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore]
async fn test_duplicate_bus_snapshot_writes_latest_heartbeat(pool: PgPool) {
    let store = VehicleStore::new(pool.clone());
    let raw = r#"<vehicles>
        <vehicle><number>101</number><trip>1</trip><last_message>6/10/2024 3:00:00 PM</last_message></vehicle>
        <vehicle><number>102</number><trip>5</trip><last_message>6/10/2024 3:00:01 PM</last_message></vehicle>
        <vehicle><number>101</number><trip>2</trip><last_message>6/10/2024 3:00:05 PM</last_message></vehicle>
    </vehicles>"#;

    let vehicles = transform_snapshot(raw, Honolulu).unwrap();
    let summary = store.upsert_all(&vehicles).await.unwrap();
    assert_eq!(summary.written.len(), 2);

    let expected = Honolulu
        .with_ymd_and_hms(2024, 6, 10, 15, 0, 5)
        .unwrap()
        .with_timezone(&Utc);
    let stored = store.get("101").await.unwrap().unwrap();
    assert_eq!(stored.heartbeat, expected);
    assert_eq!(stored.trip_id, Some(2));
}
