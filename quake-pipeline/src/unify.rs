//! Per-cluster unification: preferred representative, stable identity,
//! quality metrics, and crosswalk emission
//!
//! Identity continuity is recovered from the existing crosswalk at the
//! start of each run: a cluster sharing members with a previously written
//! unified event keeps that `unified_event_id` (largest member overlap
//! wins, ties by smallest id); otherwise a fresh UUID is minted. All
//! quality metrics are functions of cluster membership only, so they are
//! recomputable on every run.

use crate::cluster::Cluster;
use crate::geo::{self, haversine_km};
use crate::score::match_score;
use chrono::{DateTime, Utc};
use quake_common::config::ScoringWeights;
use quake_common::models::{CrosswalkRow, NormalizedEvent, UnifiedEvent};
use quake_common::{IntegrityError, Result};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Unified and crosswalk rows produced by one fusion pass
#[derive(Debug, Clone, Default)]
pub struct FusionOutput {
    pub unified: Vec<UnifiedEvent>,
    pub crosswalk: Vec<CrosswalkRow>,
}

/// Fuse each cluster into one unified event plus its crosswalk rows.
///
/// `existing_crosswalk` must only contain rows for the window's event uids;
/// anything else indicates external-store corruption and fails the run, as
/// does a duplicate `event_uid` inside the window.
pub fn unify(
    events: &[NormalizedEvent],
    clusters: &[Cluster],
    existing_crosswalk: &[CrosswalkRow],
    weights: &ScoringWeights,
    now: DateTime<Utc>,
) -> Result<FusionOutput> {
    let mut seen_uids = HashSet::new();
    for event in events {
        if !seen_uids.insert(event.event_uid()) {
            return Err(IntegrityError::DuplicateUid(event.event_uid()).into());
        }
    }
    for row in existing_crosswalk {
        if !seen_uids.contains(&row.event_uid) {
            return Err(IntegrityError::CrosswalkOrphan(row.event_uid.clone()).into());
        }
    }

    // event_uid -> previously assigned unified ids (with row creation time)
    let mut assignments: HashMap<&str, Vec<&CrosswalkRow>> = HashMap::new();
    for row in existing_crosswalk {
        assignments.entry(&row.event_uid).or_default().push(row);
    }

    let mut output = FusionOutput::default();
    for cluster in clusters {
        let members: Vec<&NormalizedEvent> =
            cluster.members.iter().map(|&idx| &events[idx]).collect();
        if members.is_empty() {
            continue;
        }

        let (lat, lon) = geo::centroid(&members);
        let region = geo::classify(lat, lon);
        let preferred = members[geo::select_preferred(&members, region)];

        let member_uids: Vec<String> = members.iter().map(|m| m.event_uid()).collect();
        let (unified_event_id, created_at) =
            resolve_identity(&member_uids, &assignments, now);

        let mut source_event_uids = member_uids.clone();
        source_event_uids.sort();
        source_event_uids.dedup();

        let distinct_sources: HashSet<&str> =
            members.iter().map(|m| m.source.as_str()).collect();

        output.unified.push(UnifiedEvent {
            unified_event_id,
            origin_time_utc: preferred.origin_time_utc,
            latitude: preferred.latitude,
            longitude: preferred.longitude,
            depth_km: preferred.depth_km,
            magnitude_value: preferred.magnitude_value,
            magnitude_type: preferred.magnitude_type.clone(),
            place: preferred.place.clone(),
            region: preferred.region.clone(),
            status: preferred.status,
            num_sources: distinct_sources.len() as u32,
            preferred_source: preferred.source.clone(),
            preferred_event_uid: preferred.event_uid(),
            source_event_uids,
            magnitude_std: magnitude_std(&members),
            location_spread_km: location_spread_km(&members),
            source_agreement_score: distinct_sources.len() as f64 / members.len() as f64,
            created_at,
            updated_at: now,
        });

        for &member in &members {
            let is_preferred = member.event_uid() == preferred.event_uid();
            output.crosswalk.push(CrosswalkRow {
                event_uid: member.event_uid(),
                unified_event_id,
                match_score: if is_preferred {
                    1.0
                } else {
                    match_score(member, preferred, weights)
                },
                is_preferred,
                created_at: now,
            });
        }
    }

    Ok(output)
}

/// Reuse the unified id with the largest member overlap; mint a fresh UUID
/// for clusters with no prior assignment. For a reused id, `created_at` is
/// the earliest crosswalk row that referenced it.
fn resolve_identity(
    member_uids: &[String],
    assignments: &HashMap<&str, Vec<&CrosswalkRow>>,
    now: DateTime<Utc>,
) -> (Uuid, DateTime<Utc>) {
    let mut candidates: HashMap<Uuid, (usize, DateTime<Utc>)> = HashMap::new();
    for uid in member_uids {
        if let Some(rows) = assignments.get(uid.as_str()) {
            for row in rows {
                let entry = candidates
                    .entry(row.unified_event_id)
                    .or_insert((0, row.created_at));
                entry.0 += 1;
                entry.1 = entry.1.min(row.created_at);
            }
        }
    }

    candidates
        .into_iter()
        .min_by_key(|(id, (count, _))| (std::cmp::Reverse(*count), *id))
        .map(|(id, (_, created))| (id, created))
        .unwrap_or_else(|| (Uuid::new_v4(), now))
}

/// Population standard deviation of member magnitudes
fn magnitude_std(members: &[&NormalizedEvent]) -> f64 {
    if members.len() < 2 {
        return 0.0;
    }
    let n = members.len() as f64;
    let mean = members.iter().map(|m| m.magnitude_value).sum::<f64>() / n;
    let variance = members
        .iter()
        .map(|m| (m.magnitude_value - mean).powi(2))
        .sum::<f64>()
        / n;
    variance.sqrt()
}

/// Maximum pairwise great-circle distance between member locations
fn location_spread_km(members: &[&NormalizedEvent]) -> f64 {
    let mut max = 0.0f64;
    for (i, a) in members.iter().enumerate() {
        for b in &members[i + 1..] {
            max = max.max(haversine_km(a.latitude, a.longitude, b.latitude, b.longitude));
        }
    }
    max
}
