//! QuakeML 1.2 parser
//!
//! Namespace-qualified XML used by ISC and other FDSN services. Resolution
//! rules:
//! - event identity comes from `publicID`, with known URN prefixes stripped;
//! - the origin is the one referenced by `preferredOriginID`, falling back
//!   to the first origin in document order;
//! - the magnitude is the one referenced by `preferredMagnitudeID`; absent
//!   that, magnitude-type preference (`mw > mww > mb > ml > md > other`)
//!   decides, then station count, then document order;
//! - QuakeML depths are metres and are converted to km;
//! - `evaluationStatus` of reviewed/confirmed/final overrides the status
//!   derived from `evaluationMode`.

use super::{normalize_longitude, parse_iso8601, ParseError};
use chrono::{DateTime, Utc};
use quake_common::models::{EventStatus, NormalizedEvent};
use roxmltree::{Document, Node};

pub(super) fn parse_quakeml(
    text: &str,
    source: &str,
    fetched_at: DateTime<Utc>,
) -> (Vec<NormalizedEvent>, Vec<ParseError>) {
    if text.trim().is_empty() {
        return (Vec::new(), Vec::new());
    }

    let doc = match Document::parse(text) {
        Ok(doc) => doc,
        Err(e) => {
            return (
                Vec::new(),
                vec![ParseError::MalformedPayload {
                    source_tag: source.to_string(),
                    detail: format!("invalid XML: {}", e),
                    raw: text.to_string(),
                }],
            )
        }
    };

    let mut events = Vec::new();
    let mut errors = Vec::new();
    for node in doc
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "event")
    {
        match parse_event(node, source, fetched_at) {
            Ok(event) => events.push(event),
            Err((source_event_id, detail)) => errors.push(ParseError::MalformedEvent {
                source_tag: source.to_string(),
                source_event_id,
                detail,
                raw: text[node.range()].to_string(),
            }),
        }
    }
    (events, errors)
}

type EventError = (Option<String>, String);

fn parse_event(
    event: Node,
    source: &str,
    fetched_at: DateTime<Utc>,
) -> Result<NormalizedEvent, EventError> {
    let public_id = event
        .attribute("publicID")
        .ok_or((None, "event missing publicID".to_string()))?;
    let source_event_id = strip_public_id(public_id);
    let err = |detail: String| (Some(source_event_id.clone()), detail);

    let origins: Vec<Node> = elements(event, "origin").collect();
    let magnitudes: Vec<Node> = elements(event, "magnitude").collect();

    let origin = child_text(event, "preferredOriginID")
        .and_then(|id| find_by_public_id(&origins, &id))
        .or_else(|| origins.first().copied())
        .ok_or_else(|| err("no origin element".to_string()))?;

    let magnitude = child_text(event, "preferredMagnitudeID")
        .and_then(|id| find_by_public_id(&magnitudes, &id))
        .or_else(|| select_magnitude(&magnitudes))
        .ok_or_else(|| err("no magnitude element".to_string()))?;

    let origin_time_utc = value_text(origin, "time")
        .as_deref()
        .and_then(parse_iso8601)
        .ok_or_else(|| err("missing or invalid origin time".to_string()))?;
    let latitude = parse_value(origin, "latitude")
        .ok_or_else(|| err("missing origin latitude".to_string()))?;
    let longitude = parse_value(origin, "longitude")
        .ok_or_else(|| err("missing origin longitude".to_string()))?;
    // QuakeML reports depth in metres
    let depth_km = parse_value(origin, "depth")
        .ok_or_else(|| err("missing origin depth".to_string()))?
        / 1000.0;

    let magnitude_value = parse_value(magnitude, "mag")
        .ok_or_else(|| err("missing magnitude value".to_string()))?;
    let magnitude_type = child_text(magnitude, "type")
        .map(|t| t.to_lowercase())
        .unwrap_or_else(|| "ml".to_string());

    let mut status = match child_text(origin, "evaluationMode").as_deref() {
        Some("manual") => EventStatus::Manual,
        _ => EventStatus::Automatic,
    };
    if matches!(
        child_text(origin, "evaluationStatus").as_deref(),
        Some("reviewed") | Some("confirmed") | Some("final")
    ) {
        status = EventStatus::Reviewed;
    }

    let quality = element(origin, "quality");
    let num_phases = quality
        .and_then(|q| child_text(q, "usedPhaseCount"))
        .and_then(|s| s.parse().ok());
    let azimuthal_gap = quality
        .and_then(|q| child_text(q, "azimuthalGap"))
        .and_then(|s| s.parse().ok());

    let time_error_sec = element(origin, "time")
        .and_then(|t| child_text(t, "uncertainty"))
        .and_then(|s| s.parse().ok());
    let depth_error_km = element(origin, "depth")
        .and_then(|d| child_text(d, "uncertainty"))
        .and_then(|s| s.parse::<f64>().ok())
        .map(|m| m / 1000.0);
    let mag_error = element(magnitude, "mag")
        .and_then(|m| child_text(m, "uncertainty"))
        .and_then(|s| s.parse().ok());

    let place = element(event, "description").and_then(|d| child_text(d, "text"));

    let author = element(origin, "creationInfo")
        .and_then(|c| child_text(c, "author"))
        .or_else(|| {
            element(event, "creationInfo").and_then(|c| {
                child_text(c, "agencyID").or_else(|| child_text(c, "author"))
            })
        });
    let updated_at = element(event, "creationInfo")
        .or_else(|| element(origin, "creationInfo"))
        .and_then(|c| child_text(c, "creationTime"))
        .as_deref()
        .and_then(parse_iso8601);

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
        region: None,
        lat_error_km: None,
        lon_error_km: None,
        depth_error_km,
        mag_error,
        time_error_sec,
        num_phases,
        azimuthal_gap,
        author,
        url: None,
        fetched_at,
        updated_at,
    })
}

/// Strip known URN prefixes from a QuakeML publicID.
///
/// `smi:ISC/evid=600123456` → `600123456`,
/// `quakeml:us.anss.org/event/us7000abcd` → `us7000abcd`.
fn strip_public_id(raw: &str) -> String {
    let tail = raw.rsplit('/').next().unwrap_or(raw);
    let tail = tail.rsplit('=').next().unwrap_or(tail);
    if tail.is_empty() {
        raw.to_string()
    } else {
        tail.to_string()
    }
}

/// Fallback magnitude choice when `preferredMagnitudeID` is absent:
/// magnitude-type preference, then station count, then document order.
fn select_magnitude<'a, 'd>(magnitudes: &[Node<'a, 'd>]) -> Option<Node<'a, 'd>> {
    magnitudes
        .iter()
        .enumerate()
        .min_by_key(|(idx, node)| {
            let rank = child_text(**node, "type")
                .map(|t| type_rank(&t.to_lowercase()))
                .unwrap_or(u8::MAX);
            let stations: i64 = child_text(**node, "stationCount")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            (rank, std::cmp::Reverse(stations), *idx)
        })
        .map(|(_, node)| *node)
}

fn type_rank(mag_type: &str) -> u8 {
    match mag_type {
        "mw" => 0,
        "mww" => 1,
        "mb" => 2,
        "ml" => 3,
        "md" => 4,
        _ => 5,
    }
}

fn elements<'a, 'd>(node: Node<'a, 'd>, name: &'static str) -> impl Iterator<Item = Node<'a, 'd>> {
    node.children()
        .filter(move |c| c.is_element() && c.tag_name().name() == name)
}

fn element<'a, 'd>(node: Node<'a, 'd>, name: &'static str) -> Option<Node<'a, 'd>> {
    elements(node, name).next()
}

fn child_text(node: Node, name: &'static str) -> Option<String> {
    element(node, name)
        .and_then(|c| c.text())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Text of a `<name><value>` pair
fn value_text(node: Node, name: &'static str) -> Option<String> {
    element(node, name).and_then(|n| child_text(n, "value"))
}

fn parse_value(node: Node, name: &'static str) -> Option<f64> {
    value_text(node, name).and_then(|s| s.parse().ok())
}

fn find_by_public_id<'a, 'd>(nodes: &[Node<'a, 'd>], id: &str) -> Option<Node<'a, 'd>> {
    nodes
        .iter()
        .find(|n| n.attribute("publicID") == Some(id))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quake_common::time;

    const ISC_PAYLOAD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<q:quakeml xmlns:q="http://quakeml.org/xmlns/quakeml/1.2" xmlns="http://quakeml.org/xmlns/bed/1.2">
  <eventParameters publicID="smi:ISC/bulletin">
    <event publicID="smi:ISC/evid=600123456">
      <preferredOriginID>smi:ISC/orig=2</preferredOriginID>
      <description><text>Crete, Greece region</text></description>
      <creationInfo>
        <agencyID>ISC</agencyID>
        <creationTime>2024-01-02T08:00:00Z</creationTime>
      </creationInfo>
      <origin publicID="smi:ISC/orig=1">
        <time><value>2024-01-01T00:00:01.000Z</value></time>
        <latitude><value>34.90</value></latitude>
        <longitude><value>24.90</value></longitude>
        <depth><value>12000</value></depth>
      </origin>
      <origin publicID="smi:ISC/orig=2">
        <time><value>2024-01-01T00:00:00.500Z</value><uncertainty>0.4</uncertainty></time>
        <latitude><value>35.02</value></latitude>
        <longitude><value>25.01</value></longitude>
        <depth><value>10500</value><uncertainty>1800</uncertainty></depth>
        <evaluationMode>manual</evaluationMode>
        <evaluationStatus>reviewed</evaluationStatus>
        <quality>
          <usedPhaseCount>55</usedPhaseCount>
          <azimuthalGap>80</azimuthalGap>
        </quality>
      </origin>
      <magnitude publicID="smi:ISC/mag=1">
        <mag><value>5.0</value><uncertainty>0.1</uncertainty></mag>
        <type>mb</type>
        <stationCount>30</stationCount>
      </magnitude>
      <magnitude publicID="smi:ISC/mag=2">
        <mag><value>5.3</value></mag>
        <type>MW</type>
        <stationCount>20</stationCount>
      </magnitude>
    </event>
  </eventParameters>
</q:quakeml>"#;

    fn fetched_at() -> DateTime<Utc> {
        time::from_epoch_millis(1_704_153_600_000).unwrap()
    }

    #[test]
    fn test_preferred_origin_resolution() {
        let (events, errors) = parse_quakeml(ISC_PAYLOAD, "isc", fetched_at());
        assert!(errors.is_empty(), "{:?}", errors);
        assert_eq!(events.len(), 1);

        let event = &events[0];
        assert_eq!(event.event_uid(), "isc:600123456");
        // Origin 2 is preferred, not the first in document order
        assert_eq!(event.latitude, 35.02);
        assert_eq!(event.origin_time_utc.timestamp_millis(), 1_704_067_200_500);
        // Depth converted from metres
        assert_eq!(event.depth_km, 10.5);
        assert_eq!(event.depth_error_km, Some(1.8));
        assert_eq!(event.time_error_sec, Some(0.4));
        assert_eq!(event.num_phases, Some(55));
        assert_eq!(event.azimuthal_gap, Some(80.0));
        assert_eq!(event.place.as_deref(), Some("Crete, Greece region"));
        assert_eq!(event.author.as_deref(), Some("ISC"));
    }

    #[test]
    fn test_evaluation_status_overrides_mode() {
        let (events, _) = parse_quakeml(ISC_PAYLOAD, "isc", fetched_at());
        // evaluationMode is manual, but evaluationStatus reviewed wins
        assert_eq!(events[0].status, EventStatus::Reviewed);
    }

    #[test]
    fn test_magnitude_type_preference_beats_station_count() {
        // No preferredMagnitudeID: mb has more stations (30 vs 20) but mw
        // outranks mb in the type preference order.
        let (events, _) = parse_quakeml(ISC_PAYLOAD, "isc", fetched_at());
        assert_eq!(events[0].magnitude_type, "mw");
        assert_eq!(events[0].magnitude_value, 5.3);
    }

    #[test]
    fn test_preferred_magnitude_id_wins_when_present() {
        let payload = ISC_PAYLOAD.replace(
            "<preferredOriginID>",
            "<preferredMagnitudeID>smi:ISC/mag=1</preferredMagnitudeID><preferredOriginID>",
        );
        let (events, errors) = parse_quakeml(&payload, "isc", fetched_at());
        assert!(errors.is_empty(), "{:?}", errors);
        assert_eq!(events[0].magnitude_type, "mb");
        assert_eq!(events[0].magnitude_value, 5.0);
        assert_eq!(events[0].mag_error, Some(0.1));
    }

    #[test]
    fn test_strip_public_id_known_prefixes() {
        assert_eq!(strip_public_id("smi:ISC/evid=600123456"), "600123456");
        assert_eq!(
            strip_public_id("quakeml:us.anss.org/event/us7000abcd"),
            "us7000abcd"
        );
        assert_eq!(strip_public_id("bare-id"), "bare-id");
    }

    #[test]
    fn test_event_without_origin_is_per_event_error() {
        let payload = r#"<quakeml xmlns="http://quakeml.org/xmlns/bed/1.2">
  <eventParameters>
    <event publicID="smi:ISC/evid=1"><magnitude><mag><value>4.0</value></mag></magnitude></event>
    <event publicID="smi:ISC/evid=2">
      <origin publicID="o"><time><value>2024-01-01T00:00:00Z</value></time>
        <latitude><value>1.0</value></latitude>
        <longitude><value>2.0</value></longitude>
        <depth><value>5000</value></depth>
      </origin>
      <magnitude><mag><value>4.5</value></mag><type>ml</type></magnitude>
    </event>
  </eventParameters>
</quakeml>"#;
        let (events, errors) = parse_quakeml(payload, "isc", fetched_at());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source_event_id, "2");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].source_event_id(), Some("1"));
        assert!(errors[0].raw_payload().contains("evid=1"));
    }

    #[test]
    fn test_invalid_xml_is_whole_payload_error() {
        let (events, errors) = parse_quakeml("<quakeml><unclosed", "isc", fetched_at());
        assert!(events.is_empty());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_whole_payload());
    }

    #[test]
    fn test_empty_payload_yields_nothing() {
        let (events, errors) = parse_quakeml("", "isc", fetched_at());
        assert!(events.is_empty());
        assert!(errors.is_empty());
    }
}
