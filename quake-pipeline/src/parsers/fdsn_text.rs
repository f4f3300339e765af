//! FDSN `format=text` parser
//!
//! Pipe-delimited rows with a `#` (or `EventID`) header; reusable for any
//! FDSN-compliant service (GFZ GEOFON, IPGP, GeoNet, ...). Fixed column
//! order:
//!
//! `EventID|Time|Latitude|Longitude|Depth/km|Author|Catalog|Contributor|`
//! `ContributorID|MagType|Magnitude|MagAuthor|EventLocationName`

use super::{normalize_longitude, parse_iso8601, ParseError};
use chrono::{DateTime, Utc};
use quake_common::models::{EventStatus, NormalizedEvent};

const COL_EVENT_ID: usize = 0;
const COL_TIME: usize = 1;
const COL_LAT: usize = 2;
const COL_LON: usize = 3;
const COL_DEPTH: usize = 4;
const COL_AUTHOR: usize = 5;
const COL_MAG_TYPE: usize = 9;
const COL_MAG: usize = 10;
const COL_LOCATION: usize = 12;

pub(super) fn parse_fdsn_text(
    text: &str,
    source: &str,
    fetched_at: DateTime<Utc>,
) -> (Vec<NormalizedEvent>, Vec<ParseError>) {
    let mut events = Vec::new();
    let mut errors = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("EventID") {
            continue;
        }
        match parse_line(trimmed, source, fetched_at) {
            Ok(event) => events.push(event),
            Err((source_event_id, detail)) => errors.push(ParseError::MalformedEvent {
                source_tag: source.to_string(),
                source_event_id,
                detail,
                raw: line.to_string(),
            }),
        }
    }

    (events, errors)
}

type LineError = (Option<String>, String);

fn parse_line(
    line: &str,
    source: &str,
    fetched_at: DateTime<Utc>,
) -> Result<NormalizedEvent, LineError> {
    let cols: Vec<&str> = line.split('|').map(str::trim).collect();
    if cols.len() <= COL_LON {
        return Err((None, format!("expected pipe-delimited row, got {} columns", cols.len())));
    }

    let source_event_id = cols[COL_EVENT_ID].to_string();
    if source_event_id.is_empty() {
        return Err((None, "empty EventID column".to_string()));
    }
    let err = |detail: String| (Some(source_event_id.clone()), detail);

    let origin_time_utc = parse_iso8601(cols[COL_TIME])
        .ok_or_else(|| err(format!("invalid Time column: {:?}", cols[COL_TIME])))?;

    let latitude: f64 = cols[COL_LAT]
        .parse()
        .map_err(|_| err(format!("invalid Latitude column: {:?}", cols[COL_LAT])))?;
    let longitude: f64 = cols[COL_LON]
        .parse()
        .map_err(|_| err(format!("invalid Longitude column: {:?}", cols[COL_LON])))?;

    // Empty depth and magnitude cells occur in sparse catalogs; they default
    // rather than dead-letter the row.
    let depth_km = parse_optional_f64(&cols, COL_DEPTH)
        .map_err(|raw| err(format!("invalid Depth/km column: {:?}", raw)))?
        .unwrap_or(0.0);
    let magnitude_value = parse_optional_f64(&cols, COL_MAG)
        .map_err(|raw| err(format!("invalid Magnitude column: {:?}", raw)))?
        .unwrap_or(0.0);

    let magnitude_type = cols
        .get(COL_MAG_TYPE)
        .filter(|s| !s.is_empty())
        .unwrap_or(&"ml")
        .to_lowercase();

    let author = cols
        .get(COL_AUTHOR)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    let place = cols
        .get(COL_LOCATION)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    Ok(NormalizedEvent {
        source: source.to_string(),
        source_event_id,
        origin_time_utc,
        latitude,
        longitude: normalize_longitude(longitude),
        depth_km,
        magnitude_value,
        magnitude_type,
        // The text format carries no review flag
        status: EventStatus::Automatic,
        region: place.clone(),
        place,
        lat_error_km: None,
        lon_error_km: None,
        depth_error_km: None,
        mag_error: None,
        time_error_sec: None,
        num_phases: None,
        azimuthal_gap: None,
        author,
        url: None,
        fetched_at,
        updated_at: None,
    })
}

fn parse_optional_f64<'a>(cols: &[&'a str], idx: usize) -> Result<Option<f64>, &'a str> {
    match cols.get(idx) {
        None => Ok(None),
        Some(&"") => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| *raw),
    }
}
