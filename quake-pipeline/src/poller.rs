//! Per-source poll cycle: fetch, parse, validate, persist
//!
//! One source's failure never blocks the others; everything a cycle learns
//! is reported in its [`SourcePollOutcome`] and rolled up into the batch's
//! pipeline-run row by the caller. Parse and validation failures become
//! dead letters; fetch failures surface as the source's error after the
//! transport's retry budget is spent.

use crate::parsers;
use crate::sources::SourceSpec;
use crate::transport::{FetchQuery, TransportClient};
use crate::validator;
use chrono::{DateTime, Utc};
use quake_common::models::{DeadLetterEntry, RawEnvelope, RawEventRecord};
use quake_common::store::EventStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Truncation limit for whole-payload dead letters
const WHOLE_PAYLOAD_LIMIT: usize = 10_000;
/// Truncation limit for per-event dead letters
const EVENT_PAYLOAD_LIMIT: usize = 5_000;

/// Counters and error state of one poll cycle for one source
#[derive(Debug, Clone, Default)]
pub struct SourcePollOutcome {
    pub source: String,
    /// A payload was fetched (the cycle may still have partial failures)
    pub fetch_ok: bool,
    /// Events the parser produced
    pub parsed: usize,
    /// Events appended to the raw log
    pub stored: usize,
    pub dead_lettered: usize,
    pub error: Option<String>,
}

/// Suppresses re-appending events already stored in a previous cycle.
///
/// An event is appended again only when its source `updated_at` moved
/// forward, which is what lets newer revisions win the store's merge rule.
#[derive(Debug, Default)]
pub struct SeenCache {
    entries: HashMap<String, Option<DateTime<Utc>>>,
}

impl SeenCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_stale(&self, event_uid: &str, updated_at: Option<DateTime<Utc>>) -> bool {
        match self.entries.get(event_uid) {
            Some(previous) => updated_at <= *previous,
            None => false,
        }
    }

    fn record(&mut self, event_uid: String, updated_at: Option<DateTime<Utc>>) {
        self.entries.insert(event_uid, updated_at);
    }
}

/// Drives fetch → parse → validate → persist for single sources
pub struct Poller {
    transport: Arc<TransportClient>,
    store: Arc<dyn EventStore>,
}

impl Poller {
    pub fn new(transport: Arc<TransportClient>, store: Arc<dyn EventStore>) -> Self {
        Self { transport, store }
    }

    /// Run one poll cycle for one source. Never panics or propagates; the
    /// outcome carries any error so sibling sources keep running.
    pub async fn poll_source(
        &self,
        spec: &SourceSpec,
        query: &FetchQuery,
        seen: &mut SeenCache,
        now: DateTime<Utc>,
    ) -> SourcePollOutcome {
        let mut outcome = SourcePollOutcome {
            source: spec.tag.to_string(),
            ..Default::default()
        };

        let bytes = match self.transport.fetch(spec.tag, query).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(source = spec.tag, error = %e, "fetch failed");
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };
        outcome.fetch_ok = true;

        let (events, parse_errors) = parsers::parse(spec.format, &bytes, spec.tag, now);
        outcome.parsed = events.len();
        debug!(
            source = spec.tag,
            events = events.len(),
            errors = parse_errors.len(),
            "payload parsed"
        );

        for parse_error in &parse_errors {
            if parse_error.is_whole_payload() {
                outcome.error = Some(parse_error.to_string());
            }
            let limit = if parse_error.is_whole_payload() {
                WHOLE_PAYLOAD_LIMIT
            } else {
                EVENT_PAYLOAD_LIMIT
            };
            let entry = DeadLetterEntry {
                source: spec.tag.to_string(),
                source_event_id: parse_error.source_event_id().map(str::to_string),
                raw_payload: truncate(parse_error.raw_payload(), limit),
                error_messages: vec![parse_error.to_string()],
                created_at: now,
            };
            if let Err(e) = self.store.append_dead_letter(&entry).await {
                error!(source = spec.tag, error = %e, "dead-letter append failed");
                outcome.error = Some(e.to_string());
                return outcome;
            }
            outcome.dead_lettered += 1;
        }

        for event in events {
            let issues = validator::validate(&event, now);
            if !issues.is_empty() {
                let entry = DeadLetterEntry {
                    source: spec.tag.to_string(),
                    source_event_id: Some(event.source_event_id.clone()),
                    raw_payload: truncate(&event.to_canonical_json(), EVENT_PAYLOAD_LIMIT),
                    error_messages: issues.iter().map(|i| i.to_string()).collect(),
                    created_at: now,
                };
                if let Err(e) = self.store.append_dead_letter(&entry).await {
                    error!(source = spec.tag, error = %e, "dead-letter append failed");
                    outcome.error = Some(e.to_string());
                    return outcome;
                }
                outcome.dead_lettered += 1;
                continue;
            }

            let event_uid = event.event_uid();
            if seen.is_stale(&event_uid, event.updated_at) {
                continue;
            }

            let envelope = RawEnvelope {
                source: spec.tag.to_string(),
                source_event_id: event.source_event_id.clone(),
                raw_bytes: event.to_canonical_json(),
                fetched_at: now,
            };
            let updated_at = event.updated_at;
            let record = RawEventRecord::from_envelope(event, &envelope, now);
            if let Err(e) = self.store.append_raw(&record).await {
                error!(source = spec.tag, error = %e, "raw append failed");
                outcome.error = Some(e.to_string());
                return outcome;
            }
            seen.record(event_uid, updated_at);
            outcome.stored += 1;
        }

        info!(
            source = spec.tag,
            parsed = outcome.parsed,
            stored = outcome.stored,
            dead_lettered = outcome.dead_lettered,
            "poll cycle complete"
        );
        outcome
    }
}

fn truncate(raw: &str, limit: usize) -> String {
    if raw.len() <= limit {
        return raw.to_string();
    }
    let mut end = limit;
    while end > 0 && !raw.is_char_boundary(end) {
        end -= 1;
    }
    raw[..end].to_string()
}
