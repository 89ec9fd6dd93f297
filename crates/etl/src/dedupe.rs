//! Resolve multiple reports for the same bus number within one snapshot.
//!
//! The upstream sometimes lists a bus more than once, usually when it is
//! assigned to several trips at once. For every bus number the records with the
//! latest report time win. Ties are merged into the first winner encountered,
//! joining the trip ids in encounter order. Everything else is dropped.

use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDateTime;

use transit_common::error::AppError;

use crate::markup::RawVehicle;

/// Upstream report time format (`M/d/yyyy h:mm:ss a`).
pub const REPORT_TIME_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p";

/// Separator used when merging trip ids of tied records.
pub const TRIP_SEPARATOR: &str = ",";

/// Parse an upstream local report time.
pub fn parse_report_time(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), REPORT_TIME_FORMAT).ok()
}

/// Indices (into the snapshot) of the records reported for one bus number,
/// in encounter order.
pub type Group = Vec<usize>;

/// Group record indices by bus number.
///
/// Fails if any record lacks a bus number: grouping is meaningless without it
/// and it signals a corrupted snapshot.
pub fn group_by_bus_number(records: &[RawVehicle]) -> Result<HashMap<&str, Group>, AppError> {
    let mut groups: HashMap<&str, Group> = HashMap::new();

    for (index, record) in records.iter().enumerate() {
        let bus_number = record.bus_number().ok_or_else(|| {
            AppError::DuplicateResolution(format!(
                "record {} has no bus number (trip {:?}, last message {:?})",
                index, record.trip, record.last_message
            ))
        })?;
        groups.entry(bus_number).or_default().push(index);
    }

    Ok(groups)
}

/// Winner/loser split of one group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    /// Records sharing the single latest report time, in encounter order.
    pub winners: Vec<usize>,
    /// Older records and records whose time could not be parsed.
    pub losers: Vec<usize>,
}

/// Split a group into the records with the latest report time and the rest.
///
/// When no record in the group has a parseable time, the first record is the
/// only winner so the bus is not dropped from the snapshot entirely.
pub fn partition_latest(records: &[RawVehicle], group: &[usize]) -> Partition {
    let times: Vec<(usize, Option<NaiveDateTime>)> = group
        .iter()
        .map(|&index| {
            let time = records[index]
                .last_message
                .as_deref()
                .and_then(parse_report_time);
            (index, time)
        })
        .collect();

    let Some(latest) = times.iter().filter_map(|(_, time)| *time).max() else {
        return Partition {
            winners: group.first().copied().into_iter().collect(),
            losers: group.iter().skip(1).copied().collect(),
        };
    };

    let (winners, losers): (Vec<_>, Vec<_>) = times
        .into_iter()
        .partition(|(_, time)| *time == Some(latest));

    Partition {
        winners: winners.into_iter().map(|(index, _)| index).collect(),
        losers: losers.into_iter().map(|(index, _)| index).collect(),
    }
}

/// Deduplicate a snapshot so that each bus number appears exactly once.
///
/// Output keeps the snapshot order of the surviving records, so the result does
/// not depend on how groups are iterated.
pub fn resolve_duplicates(records: Vec<RawVehicle>) -> Result<Vec<RawVehicle>, AppError> {
    let groups = group_by_bus_number(&records)?;

    let mut keep: BTreeSet<usize> = BTreeSet::new();
    let mut merged_trips: HashMap<usize, String> = HashMap::new();

    for (bus_number, group) in &groups {
        if group.len() == 1 {
            keep.insert(group[0]);
            continue;
        }

        let partition = partition_latest(&records, group);
        let Some(&first) = partition.winners.first() else {
            continue;
        };
        keep.insert(first);

        if partition.winners.len() > 1 {
            let trips = partition
                .winners
                .iter()
                .filter_map(|&index| records[index].trip.as_deref())
                .map(str::trim)
                .filter(|trip| !trip.is_empty())
                .collect::<Vec<_>>()
                .join(TRIP_SEPARATOR);
            merged_trips.insert(first, trips);
        }

        tracing::debug!(
            bus_number,
            reports = group.len(),
            winners = partition.winners.len(),
            dropped = group.len() - 1,
            "Resolved duplicate bus reports"
        );
    }

    Ok(records
        .into_iter()
        .enumerate()
        .filter(|(index, _)| keep.contains(index))
        .map(|(index, mut record)| {
            if let Some(trips) = merged_trips.remove(&index) {
                record.trip = Some(trips);
            }
            record
        })
        .collect())
}
