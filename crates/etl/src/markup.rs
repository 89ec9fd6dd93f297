//! Repair and parse the upstream vehicle XML snapshot.
//!
//! The feed is a single document whose root holds one `<vehicle>` element per
//! reporting vehicle, or an `<errorMessage>` element when the upstream refuses
//! the request. Tag names are matched case-insensitively and attributes on a
//! `<vehicle>` element are flattened onto the record alongside its children.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use transit_common::error::AppError;

/// Element (lowercased) carrying an upstream error message.
const ERROR_TAG: &str = "errormessage";
const VEHICLE_TAG: &str = "vehicle";

/// One `<vehicle>` element, fields kept as the raw upstream strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawVehicle {
    pub number: Option<String>,
    pub trip: Option<String>,
    pub driver: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub adherence: Option<String>,
    /// Local report time, `M/d/yyyy h:mm:ss a`
    pub last_message: Option<String>,
    pub route_short_name: Option<String>,
    pub headsign: Option<String>,
}

impl RawVehicle {
    /// Bus number with surrounding whitespace removed, if present and non-empty.
    pub fn bus_number(&self) -> Option<&str> {
        self.number
            .as_deref()
            .map(str::trim)
            .filter(|number| !number.is_empty())
    }

    fn set_field(&mut self, name: &str, value: String) {
        let slot = match name {
            "number" => &mut self.number,
            "trip" => &mut self.trip,
            "driver" => &mut self.driver,
            "latitude" => &mut self.latitude,
            "longitude" => &mut self.longitude,
            "adherence" => &mut self.adherence,
            "last_message" => &mut self.last_message,
            "route_short_name" => &mut self.route_short_name,
            "headsign" => &mut self.headsign,
            _ => return,
        };
        *slot = Some(value);
    }
}

/// Result of parsing a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedSnapshot {
    Vehicles(Vec<RawVehicle>),
    /// The upstream answered with an explicit error instead of data.
    UpstreamError(String),
}

impl ParsedSnapshot {
    pub fn into_vehicles(self) -> Result<Vec<RawVehicle>, AppError> {
        match self {
            ParsedSnapshot::Vehicles(vehicles) => Ok(vehicles),
            ParsedSnapshot::UpstreamError(message) => Err(AppError::UpstreamReportedError(message)),
        }
    }
}

/// Escape every `&` in the raw feed.
///
/// The upstream emits bare ampersands (e.g. in headsigns), which makes the
/// document invalid. Every `&` is rewritten, so an already escaped `&amp;`
/// becomes `&amp;amp;`.
pub fn repair_markup(raw: &str) -> String {
    raw.replace('&', "&amp;")
}

/// Parse a repaired snapshot into raw vehicle records.
pub fn parse_snapshot(xml: &str) -> Result<ParsedSnapshot, AppError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut depth = 0usize;
    let mut saw_root = false;
    let mut vehicles = Vec::new();
    let mut current: Option<RawVehicle> = None;
    let mut field: Option<String> = None;
    let mut text = String::new();
    let mut error_message: Option<String> = None;

    loop {
        let event = reader.read_event().map_err(|e| {
            AppError::MalformedUpstreamPayload(format!(
                "Unable to parse XML at byte {}: {}",
                reader.buffer_position(),
                e
            ))
        })?;

        match event {
            Event::Start(e) => {
                depth += 1;
                let name = tag_name(&e);
                match depth {
                    1 => {
                        saw_root = true;
                        if name == ERROR_TAG {
                            field = Some(name);
                            text.clear();
                        }
                    }
                    2 if name == VEHICLE_TAG => {
                        let mut vehicle = RawVehicle::default();
                        merge_attributes(&e, &mut vehicle)?;
                        current = Some(vehicle);
                    }
                    2 => {
                        field = Some(name);
                        text.clear();
                    }
                    3 if current.is_some() => {
                        field = Some(name);
                        text.clear();
                    }
                    _ => {}
                }
            }
            Event::Empty(e) => {
                let name = tag_name(&e);
                match depth + 1 {
                    1 => saw_root = true,
                    2 if name == VEHICLE_TAG => {
                        let mut vehicle = RawVehicle::default();
                        merge_attributes(&e, &mut vehicle)?;
                        vehicles.push(vehicle);
                    }
                    3 => {
                        if let Some(vehicle) = current.as_mut() {
                            vehicle.set_field(&name, String::new());
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(t) => {
                if field.is_some() {
                    let unescaped = t.unescape().map_err(|e| {
                        AppError::MalformedUpstreamPayload(format!("Invalid text node: {}", e))
                    })?;
                    text.push_str(&unescaped);
                }
            }
            Event::CData(c) => {
                if field.is_some() {
                    text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(_) => {
                match depth {
                    1 | 2 if current.is_none() => {
                        if field.take().as_deref() == Some(ERROR_TAG) {
                            error_message = Some(text.trim().to_string());
                        }
                    }
                    2 => {
                        if let Some(vehicle) = current.take() {
                            vehicles.push(vehicle);
                        }
                    }
                    3 => {
                        if let (Some(vehicle), Some(name)) = (current.as_mut(), field.take()) {
                            vehicle.set_field(&name, text.trim().to_string());
                        }
                    }
                    _ => {}
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(message) = error_message {
        return Ok(ParsedSnapshot::UpstreamError(message));
    }

    if !saw_root {
        return Err(AppError::MalformedUpstreamPayload(
            "Empty document retrieved".to_string(),
        ));
    }

    if vehicles.is_empty() {
        return Err(AppError::MalformedUpstreamPayload(
            "Invalid API format, vehicle not found".to_string(),
        ));
    }

    Ok(ParsedSnapshot::Vehicles(vehicles))
}

fn tag_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).to_lowercase()
}

fn merge_attributes(e: &BytesStart<'_>, vehicle: &mut RawVehicle) -> Result<(), AppError> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| {
            AppError::MalformedUpstreamPayload(format!("Invalid vehicle attribute: {}", e))
        })?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_lowercase();
        let value = attr.unescape_value().map_err(|e| {
            AppError::MalformedUpstreamPayload(format!("Invalid attribute value: {}", e))
        })?;
        vehicle.set_field(&key, value.trim().to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<vehicles>
  <timestamp>6/10/2024 3:04:05 PM</timestamp>
  <vehicle>
    <number>020</number>
    <trip>2925390</trip>
    <driver>4285</driver>
    <latitude>21.3827</latitude>
    <longitude>-157.9344</longitude>
    <adherence>-1</adherence>
    <last_message>6/10/2024 3:03:51 PM</last_message>
    <route_short_name>A</route_short_name>
    <headsign>ALA MOANA & WAIKIKI</headsign>
  </vehicle>
  <Vehicle>
    <Number>101</Number>
    <Trip>null_trip</Trip>
    <Driver/>
    <Last_Message>6/10/2024 3:02:00 PM</Last_Message>
  </Vehicle>
</vehicles>"#;

    #[test]
    fn test_repair_markup_escapes_bare_ampersands() {
        assert_eq!(repair_markup("A & B"), "A &amp; B");
        assert_eq!(repair_markup("no entities"), "no entities");
    }

    #[test]
    fn test_repair_markup_double_escapes_existing_entities() {
        // Known quirk: an already escaped entity is escaped again.
        assert_eq!(repair_markup("A &amp; B"), "A &amp;amp; B");
    }

    #[test]
    fn test_unrepaired_snapshot_fails_to_parse() {
        let err = parse_snapshot(SNAPSHOT).unwrap_err();
        assert!(matches!(err, AppError::MalformedUpstreamPayload(_)));
    }

    #[test]
    fn test_parse_snapshot_normalizes_tags() {
        let parsed = parse_snapshot(&repair_markup(SNAPSHOT)).unwrap();
        let ParsedSnapshot::Vehicles(vehicles) = parsed else {
            panic!("expected vehicles, got {:?}", parsed);
        };

        assert_eq!(vehicles.len(), 2);
        assert_eq!(vehicles[0].bus_number(), Some("020"));
        assert_eq!(vehicles[0].trip.as_deref(), Some("2925390"));
        assert_eq!(vehicles[0].headsign.as_deref(), Some("ALA MOANA & WAIKIKI"));
        assert_eq!(vehicles[0].route_short_name.as_deref(), Some("A"));

        assert_eq!(vehicles[1].bus_number(), Some("101"));
        assert_eq!(vehicles[1].trip.as_deref(), Some("null_trip"));
        assert_eq!(vehicles[1].driver.as_deref(), Some(""));
        assert_eq!(vehicles[1].last_message.as_deref(), Some("6/10/2024 3:02:00 PM"));
        assert_eq!(vehicles[1].latitude, None);
    }

    #[test]
    fn test_parse_snapshot_flattens_attributes() {
        let xml = r#"<vehicles><vehicle number="303" trip="77"><driver>9</driver></vehicle><vehicle number="304"/></vehicles>"#;
        let vehicles = parse_snapshot(xml).unwrap().into_vehicles().unwrap();

        assert_eq!(vehicles.len(), 2);
        assert_eq!(vehicles[0].bus_number(), Some("303"));
        assert_eq!(vehicles[0].trip.as_deref(), Some("77"));
        assert_eq!(vehicles[0].driver.as_deref(), Some("9"));
        assert_eq!(vehicles[1].bus_number(), Some("304"));
    }

    #[test]
    fn test_parse_snapshot_reports_upstream_error() {
        let xml = "<vehicles><errorMessage>Invalid API key</errorMessage></vehicles>";
        let parsed = parse_snapshot(xml).unwrap();
        assert_eq!(parsed, ParsedSnapshot::UpstreamError("Invalid API key".to_string()));

        let err = parsed.into_vehicles().unwrap_err();
        assert!(matches!(err, AppError::UpstreamReportedError(msg) if msg == "Invalid API key"));
    }

    #[test]
    fn test_parse_snapshot_without_vehicles_is_malformed() {
        let err = parse_snapshot("<vehicles><timestamp>now</timestamp></vehicles>").unwrap_err();
        assert!(matches!(err, AppError::MalformedUpstreamPayload(msg) if msg.contains("vehicle not found")));

        let err = parse_snapshot("").unwrap_err();
        assert!(matches!(err, AppError::MalformedUpstreamPayload(_)));
    }
}
