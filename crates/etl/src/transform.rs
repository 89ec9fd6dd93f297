use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;

use transit_common::types::Vehicle;

use crate::dedupe::{TRIP_SEPARATOR, parse_report_time};
use crate::markup::RawVehicle;

/// Upstream sentinel meaning "not on a trip".
pub const NO_TRIP: &str = "null_trip";

/// Normalize a raw trip field to a single trip id.
///
/// Accepts a bare numeric id, the `null_trip` sentinel, or a comma-joined list
/// produced by duplicate resolution (the first id wins). Anything else is
/// logged and mapped to `None`; upstream format drift must never fail a cycle.
pub fn normalize_trip_id(field: Option<&str>) -> Option<i64> {
    let raw = field.map(str::trim).filter(|raw| !raw.is_empty())?;

    if raw == NO_TRIP {
        return None;
    }

    if let Ok(id) = raw.parse::<i64>() {
        return Some(id);
    }

    if raw.contains(TRIP_SEPARATOR) {
        let first = raw
            .split(TRIP_SEPARATOR)
            .map(str::trim)
            .filter(|part| *part != NO_TRIP)
            .find_map(|part| part.parse::<i64>().ok());
        tracing::debug!(trips = raw, canonical = ?first, "Vehicle reported on multiple trips");
        if first.is_none() {
            tracing::warn!(trip = raw, "Unexpected trip list format");
        }
        return first;
    }

    tracing::warn!(trip = raw, "Unexpected trip format");
    None
}

/// Map a deduplicated raw record onto the stored vehicle shape.
///
/// Numeric strings are coerced (empty or invalid values become `None`), and the
/// local report time is read in the agency time zone. An unparseable report
/// time falls back to `now` instead of rejecting the record.
pub fn to_vehicle_record(raw: &RawVehicle, timezone: Tz, now: DateTime<Utc>) -> Vehicle {
    let heartbeat = raw
        .last_message
        .as_deref()
        .and_then(parse_report_time)
        .and_then(|local| timezone.from_local_datetime(&local).earliest())
        .map(|time| time.with_timezone(&Utc))
        .unwrap_or_else(|| {
            tracing::debug!(
                bus_number = raw.bus_number().unwrap_or_default(),
                last_message = ?raw.last_message,
                "Unparseable report time, using now"
            );
            now
        });

    Vehicle {
        bus_number: raw.bus_number().unwrap_or_default().to_string(),
        trip_id: normalize_trip_id(raw.trip.as_deref()),
        driver: text(&raw.driver),
        latitude: number(&raw.latitude),
        longitude: number(&raw.longitude),
        adherence: number(&raw.adherence),
        heartbeat,
        route_name: text(&raw.route_short_name),
        headsign: text(&raw.headsign),
    }
}

fn text(field: &Option<String>) -> Option<String> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn number<T: std::str::FromStr>(field: &Option<String>) -> Option<T> {
    field.as_deref().and_then(|value| value.trim().parse().ok())
}
