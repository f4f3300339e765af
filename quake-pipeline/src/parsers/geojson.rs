//! GeoJSON feed parser (USGS and EMSC/SeismicPortal flavors)
//!
//! Both agencies serve a FeatureCollection with coordinates ordered
//! `[lon, lat, depth_km]`; they differ in property names, identifier
//! location, and timestamp encoding (USGS: epoch milliseconds, EMSC:
//! ISO-8601 strings).

use super::{normalize_longitude, parse_iso8601, ParseError};
use chrono::{DateTime, Utc};
use quake_common::models::{EventStatus, NormalizedEvent};
use quake_common::time;
use serde_json::Value;

/// Property-name dialect of the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Flavor {
    Usgs,
    Emsc,
}

pub(super) fn parse_geojson(
    flavor: Flavor,
    text: &str,
    source: &str,
    fetched_at: DateTime<Utc>,
) -> (Vec<NormalizedEvent>, Vec<ParseError>) {
    let root: Value = match serde_json::from_str(text) {
        Ok(root) => root,
        Err(e) => {
            return (
                Vec::new(),
                vec![ParseError::MalformedPayload {
                    source_tag: source.to_string(),
                    detail: format!("invalid JSON: {}", e),
                    raw: text.to_string(),
                }],
            )
        }
    };

    let features = match root.get("features").and_then(Value::as_array) {
        Some(features) => features,
        // FDSN services answer an empty window with an empty collection;
        // an object without features carries no events.
        None => return (Vec::new(), Vec::new()),
    };

    let mut events = Vec::new();
    let mut errors = Vec::new();
    for feature in features {
        match parse_feature(flavor, feature, source, fetched_at) {
            Ok(event) => events.push(event),
            Err((source_event_id, detail)) => errors.push(ParseError::MalformedEvent {
                source_tag: source.to_string(),
                source_event_id,
                detail,
                raw: feature.to_string(),
            }),
        }
    }
    (events, errors)
}

type FeatureError = (Option<String>, String);

fn parse_feature(
    flavor: Flavor,
    feature: &Value,
    source: &str,
    fetched_at: DateTime<Utc>,
) -> Result<NormalizedEvent, FeatureError> {
    let props = feature
        .get("properties")
        .and_then(Value::as_object)
        .ok_or((None, "missing properties".to_string()))?;

    let source_event_id = match flavor {
        Flavor::Usgs => feature
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string),
        // EMSC identifies events by "unid"; older payloads carry "source_id"
        Flavor::Emsc => props
            .get("unid")
            .and_then(Value::as_str)
            .or_else(|| props.get("source_id").and_then(Value::as_str))
            .or_else(|| feature.get("id").and_then(Value::as_str))
            .map(str::to_string),
    }
    .filter(|id| !id.is_empty())
    .ok_or((None, "missing event id".to_string()))?;

    let err = |detail: &str| (Some(source_event_id.clone()), detail.to_string());

    let coords = feature
        .get("geometry")
        .and_then(|g| g.get("coordinates"))
        .and_then(Value::as_array)
        .ok_or_else(|| err("missing geometry coordinates"))?;
    if coords.len() < 3 {
        return Err(err("coordinates missing depth"));
    }
    let longitude = coords[0]
        .as_f64()
        .ok_or_else(|| err("longitude is not a number"))?;
    let latitude = coords[1]
        .as_f64()
        .ok_or_else(|| err("latitude is not a number"))?;
    let depth_km = coords[2]
        .as_f64()
        .ok_or_else(|| err("depth is not a number"))?;

    let origin_time_utc = parse_timestamp(props.get("time"))
        .ok_or_else(|| err("missing or invalid origin time"))?;

    let magnitude_value = props
        .get("mag")
        .and_then(Value::as_f64)
        .ok_or_else(|| err("missing magnitude"))?;

    let magnitude_type = match flavor {
        Flavor::Usgs => props.get("magType"),
        Flavor::Emsc => props.get("magtype").or_else(|| props.get("magType")),
    }
    .and_then(Value::as_str)
    .filter(|s| !s.is_empty())
    .unwrap_or("ml")
    .to_lowercase();

    let status = match props
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_lowercase)
        .as_deref()
    {
        Some("reviewed") => EventStatus::Reviewed,
        Some("manual") => EventStatus::Manual,
        _ => EventStatus::Automatic,
    };

    let updated_at = match flavor {
        Flavor::Usgs => props
            .get("updated")
            .and_then(Value::as_i64)
            .and_then(time::from_epoch_millis),
        Flavor::Emsc => parse_timestamp(props.get("lastupdate").or_else(|| props.get("updated"))),
    };

    let (place, region) = match flavor {
        Flavor::Usgs => {
            let place = opt_string(props.get("place"));
            let region = place.as_deref().and_then(extract_region);
            (place, region)
        }
        Flavor::Emsc => {
            let flynn = opt_string(props.get("flynn_region"));
            let place = flynn.clone().or_else(|| opt_string(props.get("place")));
            (place, flynn)
        }
    };

    let author = match flavor {
        Flavor::Usgs => opt_string(props.get("net")),
        Flavor::Emsc => opt_string(props.get("auth")).or_else(|| opt_string(props.get("net"))),
    };

    let horizontal_error = props.get("horizontalError").and_then(Value::as_f64);

    Ok(NormalizedEvent {
        source: source.to_string(),
        source_event_id,
        origin_time_utc,
        latitude,
        longitude: normalize_longitude(longitude),
        depth_km,
        magnitude_value,
        magnitude_type,
        status,
        place,
        region,
        lat_error_km: horizontal_error,
        lon_error_km: horizontal_error,
        depth_error_km: props.get("depthError").and_then(Value::as_f64),
        mag_error: props.get("magError").and_then(Value::as_f64),
        time_error_sec: props.get("timeError").and_then(Value::as_f64),
        num_phases: props
            .get("nph")
            .and_then(Value::as_u64)
            .map(|n| n as u32),
        azimuthal_gap: props.get("gap").and_then(Value::as_f64),
        author,
        url: opt_string(props.get("url")),
        fetched_at,
        updated_at,
    })
}

/// Accept both epoch-millisecond numbers and ISO-8601 strings
fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::Number(n) => time::from_epoch_millis(n.as_i64()?),
        Value::String(s) => parse_iso8601(s),
        _ => None,
    }
}

fn opt_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// USGS `place` strings end with ", <region>"; an undelimited place is its
/// own region
fn extract_region(place: &str) -> Option<String> {
    match place.rsplit_once(", ") {
        Some((_, region)) => Some(region.to_string()),
        None => Some(place.to_string()),
    }
}
