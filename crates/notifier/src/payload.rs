use transit_common::error::AppError;
use transit_common::types::{NotificationData, PushPayload};

use crate::arrivals::{Arrivals, ArrivalsSource};

pub const PAYLOAD_TITLE: &str = "Bus Arrivals";

/// Number of arrivals listed in a stop notification.
const ARRIVALS_SHOWN: usize = 3;

/// Summarize the soonest arrivals, one `headsign - stopTime` line each.
pub fn format_arrivals(arrivals: &Arrivals) -> String {
    let shown = arrivals.arrivals.len().min(ARRIVALS_SHOWN);
    let mut body = format!("First {}\n", shown);
    for arrival in arrivals.arrivals.iter().take(shown) {
        body.push_str(&format!("{} - {}\n", arrival.headsign, arrival.stop_time));
    }
    body
}

/// Build the push payload for a notification.
///
/// Stop notifications look up live arrivals. Bus notifications carry an empty
/// body for now.
pub async fn build_payload(
    data: &NotificationData,
    arrivals: &dyn ArrivalsSource,
    icon: &str,
) -> Result<PushPayload, AppError> {
    let body = match data {
        NotificationData::Stop { stop_id } => {
            let stop_id = stop_id.trim();
            if stop_id.is_empty() {
                return Err(AppError::Validation("Stop ID is not defined".to_string()));
            }
            format_arrivals(&arrivals.arrivals(stop_id).await?)
        }
        NotificationData::Bus { bus_id } => {
            // TODO: describe the tracked bus once the bus alert copy is settled.
            tracing::debug!(bus_id = %bus_id, "Bus notification payload is not implemented, sending empty body");
            String::new()
        }
    };

    Ok(PushPayload {
        title: PAYLOAD_TITLE.to_string(),
        body,
        icon: icon.to_string(),
    })
}
