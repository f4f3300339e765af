//! Store contracts for the external sinks
//!
//! The core never talks to a broker or database directly; all persistence
//! goes through [`EventStore`], injected at construction. Adapters for real
//! stores live outside this workspace. [`MemoryStore`] implements the
//! contract in memory for tests and examples.

use crate::models::{
    CrosswalkRow, DeadLetterEntry, NormalizedEvent, PipelineRun, RawEventRecord, UnifiedEvent,
};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// External sink operations required by the pipeline core
///
/// Upserts replace on conflict: unified rows by `unified_event_id`,
/// crosswalk rows by `(event_uid, unified_event_id)`. Appends never replace.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one row to the raw log (append-only provenance)
    async fn append_raw(&self, record: &RawEventRecord) -> Result<()>;

    /// Replace-on-conflict write of a unified event
    async fn upsert_unified(&self, event: &UnifiedEvent) -> Result<()>;

    /// Replace-on-conflict write of a crosswalk row
    async fn upsert_crosswalk(&self, row: &CrosswalkRow) -> Result<()>;

    /// Append a dead-letter entry
    async fn append_dead_letter(&self, entry: &DeadLetterEntry) -> Result<()>;

    /// Append a pipeline-run telemetry row
    async fn append_run(&self, run: &PipelineRun) -> Result<()>;

    /// Read normalized events with `origin_time_utc >= since`, one per
    /// `event_uid` (newest `updated_at`, then newest `fetched_at`, wins),
    /// ordered by `(origin_time_utc, event_uid)`
    async fn read_window(&self, since: DateTime<Utc>) -> Result<Vec<NormalizedEvent>>;

    /// Read crosswalk rows whose `event_uid` is in the given set
    async fn read_existing_crosswalk(&self, event_uids: &[String]) -> Result<Vec<CrosswalkRow>>;
}

#[derive(Default)]
struct MemoryStoreInner {
    raw: Vec<RawEventRecord>,
    unified: HashMap<Uuid, UnifiedEvent>,
    crosswalk: HashMap<(String, Uuid), CrosswalkRow>,
    dead_letters: Vec<DeadLetterEntry>,
    runs: Vec<PipelineRun>,
}

/// In-memory [`EventStore`] for tests and examples
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of unified rows, ordered by id for stable comparison
    pub async fn unified_snapshot(&self) -> Vec<UnifiedEvent> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner.unified.values().cloned().collect();
        rows.sort_by(|a, b| a.unified_event_id.cmp(&b.unified_event_id));
        rows
    }

    /// Snapshot of crosswalk rows, ordered by key for stable comparison
    pub async fn crosswalk_snapshot(&self) -> Vec<CrosswalkRow> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner.crosswalk.values().cloned().collect();
        rows.sort_by(|a, b| {
            (&a.event_uid, a.unified_event_id).cmp(&(&b.event_uid, b.unified_event_id))
        });
        rows
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.inner.lock().await.dead_letters.clone()
    }

    pub async fn runs(&self) -> Vec<PipelineRun> {
        self.inner.lock().await.runs.clone()
    }

    pub async fn raw_count(&self) -> usize {
        self.inner.lock().await.raw.len()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append_raw(&self, record: &RawEventRecord) -> Result<()> {
        self.inner.lock().await.raw.push(record.clone());
        Ok(())
    }

    async fn upsert_unified(&self, event: &UnifiedEvent) -> Result<()> {
        self.inner
            .lock()
            .await
            .unified
            .insert(event.unified_event_id, event.clone());
        Ok(())
    }

    async fn upsert_crosswalk(&self, row: &CrosswalkRow) -> Result<()> {
        self.inner
            .lock()
            .await
            .crosswalk
            .insert((row.event_uid.clone(), row.unified_event_id), row.clone());
        Ok(())
    }

    async fn append_dead_letter(&self, entry: &DeadLetterEntry) -> Result<()> {
        self.inner.lock().await.dead_letters.push(entry.clone());
        Ok(())
    }

    async fn append_run(&self, run: &PipelineRun) -> Result<()> {
        self.inner.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn read_window(&self, since: DateTime<Utc>) -> Result<Vec<NormalizedEvent>> {
        let inner = self.inner.lock().await;

        // Newest update per event_uid wins; ties fall back to fetch time.
        let mut latest: HashMap<String, &RawEventRecord> = HashMap::new();
        for record in &inner.raw {
            if record.event.origin_time_utc < since {
                continue;
            }
            let replace = match latest.get(&record.event_uid) {
                Some(existing) => is_newer(record, existing),
                None => true,
            };
            if replace {
                latest.insert(record.event_uid.clone(), record);
            }
        }

        let mut events: Vec<_> = latest.into_values().map(|r| r.event.clone()).collect();
        events.sort_by(|a, b| {
            (a.origin_time_utc, a.event_uid()).cmp(&(b.origin_time_utc, b.event_uid()))
        });
        Ok(events)
    }

    async fn read_existing_crosswalk(&self, event_uids: &[String]) -> Result<Vec<CrosswalkRow>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .crosswalk
            .values()
            .filter(|row| event_uids.contains(&row.event_uid))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (&a.event_uid, a.unified_event_id).cmp(&(&b.event_uid, b.unified_event_id))
        });
        Ok(rows)
    }
}

fn is_newer(candidate: &RawEventRecord, existing: &RawEventRecord) -> bool {
    let candidate_key = (
        candidate.event.updated_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
        candidate.event.fetched_at,
    );
    let existing_key = (
        existing.event.updated_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
        existing.event.fetched_at,
    );
    candidate_key > existing_key
}
