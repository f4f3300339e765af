//! Canonical data model for the event-fusion pipeline
//!
//! Every source-specific wire format is normalized into [`NormalizedEvent`];
//! clustering fuses overlapping reports into [`UnifiedEvent`] rows linked back
//! to their source events through [`CrosswalkRow`]. Records the pipeline could
//! not convert or validate are retained as [`DeadLetterEntry`] rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Review state of an origin solution as reported by the source agency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Produced by an automatic location system, unreviewed
    Automatic,
    /// Reviewed (or confirmed/finalized) by an analyst
    Reviewed,
    /// Manually located by an analyst
    Manual,
}

impl EventStatus {
    /// Lowercase wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Automatic => "automatic",
            EventStatus::Reviewed => "reviewed",
            EventStatus::Manual => "manual",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable provenance wrapper around one payload fetched from a source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub source: String,
    pub source_event_id: String,
    /// Original response body, unmodified
    pub raw_bytes: String,
    pub fetched_at: DateTime<Utc>,
}

/// Canonical earthquake event from any source, fully normalized
///
/// Identity is `event_uid()` = `"{source}:{source_event_id}"`, globally unique
/// across the system. Parsers are pure: re-parsing the same payload yields
/// byte-identical canonical fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub source: String,
    pub source_event_id: String,

    /// Origin time, always UTC, millisecond precision
    pub origin_time_utc: DateTime<Utc>,
    /// WGS84 degrees, [-90, 90]
    pub latitude: f64,
    /// WGS84 degrees, [-180, 180]
    pub longitude: f64,
    /// Kilometers below sea level; shallow events may be slightly negative
    pub depth_km: f64,

    pub magnitude_value: f64,
    /// Lowercase: "mw", "ml", "mb", "ms", "md", ...
    pub magnitude_type: String,
    pub status: EventStatus,

    pub place: Option<String>,
    pub region: Option<String>,

    // Uncertainty (all nullable)
    pub lat_error_km: Option<f64>,
    pub lon_error_km: Option<f64>,
    pub depth_error_km: Option<f64>,
    pub mag_error: Option<f64>,
    pub time_error_sec: Option<f64>,

    // Solution quality
    pub num_phases: Option<u32>,
    pub azimuthal_gap: Option<f64>,

    // Provenance
    pub author: Option<String>,
    pub url: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl NormalizedEvent {
    /// Globally unique event identity: `"{source}:{source_event_id}"`
    pub fn event_uid(&self) -> String {
        format!("{}:{}", self.source, self.source_event_id)
    }

    /// Canonical JSON serialization (round-trips byte-identically)
    pub fn to_canonical_json(&self) -> String {
        // Struct serialization order is fixed, so this is deterministic.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Inverse of [`Self::to_canonical_json`]
    pub fn from_canonical_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// One row of the append-only raw log: canonical fields plus provenance
///
/// This is the inbound record shape for the external store; `read_window`
/// returns the canonical part after applying the newest-update-wins merge
/// rule per `event_uid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEventRecord {
    pub event_uid: String,
    #[serde(flatten)]
    pub event: NormalizedEvent,
    pub ingested_at: DateTime<Utc>,
    /// Canonical JSON of the event as parsed
    pub raw_payload: String,
}

impl RawEventRecord {
    pub fn new(event: NormalizedEvent, ingested_at: DateTime<Utc>) -> Self {
        Self {
            event_uid: event.event_uid(),
            raw_payload: event.to_canonical_json(),
            event,
            ingested_at,
        }
    }

    /// Build a raw-log row from a parsed event and its provenance envelope
    pub fn from_envelope(
        event: NormalizedEvent,
        envelope: &RawEnvelope,
        ingested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_uid: event.event_uid(),
            raw_payload: envelope.raw_bytes.clone(),
            event,
            ingested_at,
        }
    }
}

/// Deduplicated best-estimate earthquake event fused from 1..N source reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedEvent {
    /// Stable identity minted on first creation of the cluster
    pub unified_event_id: Uuid,

    pub origin_time_utc: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub depth_km: f64,
    pub magnitude_value: f64,
    pub magnitude_type: String,
    pub place: Option<String>,
    pub region: Option<String>,
    pub status: EventStatus,

    /// Count of distinct source agencies in the cluster
    pub num_sources: u32,
    pub preferred_source: String,
    pub preferred_event_uid: String,
    /// Sorted distinct `event_uid`s of all cluster members
    pub source_event_uids: Vec<String>,

    /// Population standard deviation of member magnitudes (0 for singletons)
    pub magnitude_std: f64,
    /// Maximum pairwise great-circle distance between members (0 for singletons)
    pub location_spread_km: f64,
    /// distinct_sources / cluster_size, in [0, 1]
    pub source_agreement_score: f64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Many-to-one mapping from source-level events to unified events
///
/// Primary key is `(event_uid, unified_event_id)`. Exactly one row per
/// unified event carries `is_preferred = true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrosswalkRow {
    pub event_uid: String,
    pub unified_event_id: Uuid,
    /// Similarity of this member against the preferred representative
    pub match_score: f64,
    pub is_preferred: bool,
    pub created_at: DateTime<Utc>,
}

/// A record the pipeline could not convert or validate, kept for inspection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub source: String,
    pub source_event_id: Option<String>,
    /// Offending bytes (whole payload or sub-document), possibly truncated
    pub raw_payload: String,
    pub error_messages: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Terminal status of one pipeline invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Failed,
}

/// Telemetry row for one batch or fusion invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub sources_fetched: Vec<String>,
    pub raw_events_count: u64,
    pub unified_events_count: u64,
    pub dead_letter_count: u64,
    pub error_message: Option<String>,
    pub duration_seconds: f64,
}
