//! Format-specific parsers producing canonical records
//!
//! One parser per wire format, dispatched through [`parse`]. Parsers are
//! pure: no I/O, deterministic output. A payload with K events may yield
//! M ≤ K canonical records plus per-event errors carrying the offending
//! sub-document; a whole-payload failure yields zero events and a single
//! error.

mod fdsn_text;
mod geojson;
mod quakeml;

use crate::sources::SourceFormat;
use chrono::{DateTime, NaiveDateTime, Utc};
use quake_common::models::NormalizedEvent;
use quake_common::time;
use thiserror::Error;

/// Parse failure, either for a whole payload or a single embedded event
#[derive(Debug, Clone, Error)]
pub enum ParseError {
    /// The payload as a whole could not be decoded; fails the source's run
    #[error("[{source_tag}] malformed payload: {detail}")]
    MalformedPayload {
        source_tag: String,
        detail: String,
        /// Offending payload bytes
        raw: String,
    },

    /// One embedded event could not be converted; becomes a dead letter
    #[error("[{source_tag}] malformed event: {detail}")]
    MalformedEvent {
        source_tag: String,
        source_event_id: Option<String>,
        detail: String,
        /// Offending sub-document bytes
        raw: String,
    },

    /// A format tag no parser is registered for
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
}

impl ParseError {
    /// True for the whole-payload variant that fails the source's run
    pub fn is_whole_payload(&self) -> bool {
        matches!(self, ParseError::MalformedPayload { .. })
    }

    /// Offending bytes for the dead-letter sink
    pub fn raw_payload(&self) -> &str {
        match self {
            ParseError::MalformedPayload { raw, .. } => raw,
            ParseError::MalformedEvent { raw, .. } => raw,
            ParseError::UnsupportedFormat(_) => "",
        }
    }

    pub fn source_event_id(&self) -> Option<&str> {
        match self {
            ParseError::MalformedEvent {
                source_event_id, ..
            } => source_event_id.as_deref(),
            _ => None,
        }
    }
}

/// Parse a raw payload into canonical records.
///
/// Pure and deterministic: repeated calls on the same bytes yield
/// byte-identical canonical fields.
pub fn parse(
    format: SourceFormat,
    bytes: &[u8],
    source: &str,
    fetched_at: DateTime<Utc>,
) -> (Vec<NormalizedEvent>, Vec<ParseError>) {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            return (
                Vec::new(),
                vec![ParseError::MalformedPayload {
                    source_tag: source.to_string(),
                    detail: format!("payload is not valid UTF-8: {}", e),
                    raw: String::from_utf8_lossy(bytes).into_owned(),
                }],
            )
        }
    };

    match format {
        SourceFormat::GeojsonUsgs => {
            geojson::parse_geojson(geojson::Flavor::Usgs, text, source, fetched_at)
        }
        SourceFormat::GeojsonEmsc => {
            geojson::parse_geojson(geojson::Flavor::Emsc, text, source, fetched_at)
        }
        SourceFormat::FdsnText => fdsn_text::parse_fdsn_text(text, source, fetched_at),
        SourceFormat::Quakeml => quakeml::parse_quakeml(text, source, fetched_at),
    }
}

/// Wrap a longitude into [-180, 180]
pub(crate) fn normalize_longitude(lon: f64) -> f64 {
    if lon > 180.0 {
        lon - 360.0
    } else if lon < -180.0 {
        lon + 360.0
    } else {
        lon
    }
}

/// Parse an ISO-8601 timestamp, with or without timezone suffix, to UTC.
///
/// Naive timestamps (common in FDSN text) are taken as UTC. Output is
/// truncated to millisecond precision.
pub(crate) fn parse_iso8601(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(time::truncate_to_millis(ts.with_timezone(&Utc)));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(time::truncate_to_millis(naive.and_utc()));
        }
    }
    None
}
