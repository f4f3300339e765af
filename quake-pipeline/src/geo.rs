//! Geographic utilities and region-aware source priority
//!
//! Great-circle distance, the boxed region classifier, and the per-region
//! agency priority tables used to pick a cluster's preferred representative.

use quake_common::models::{EventStatus, NormalizedEvent};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;

/// Mean Earth radius, km
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Great-circle distance between two points in kilometers (haversine)
///
/// Inputs are WGS84 decimal degrees.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (rlat1, rlon1) = (lat1.to_radians(), lon1.to_radians());
    let (rlat2, rlon2) = (lat2.to_radians(), lon2.to_radians());

    let dlat = rlat2 - rlat1;
    let dlon = rlon2 - rlon1;

    let a = (dlat / 2.0).sin().powi(2) + rlat1.cos() * rlat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Coarse geographic region used to select the agency priority table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Americas,
    Europe,
    Africa,
    AsiaPacific,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Americas => "americas",
            Region::Europe => "europe",
            Region::Africa => "africa",
            Region::AsiaPacific => "asia_pacific",
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a coordinate into a region by boxed longitude/latitude ranges.
///
/// Asia-Pacific wraps the antimeridian (lon > 45 or lon < -170) and absorbs
/// the residual slivers the other boxes leave uncovered.
pub fn classify(lat: f64, lon: f64) -> Region {
    if (-170.0..=-30.0).contains(&lon) {
        Region::Americas
    } else if (-30.0..=45.0).contains(&lon) && lat >= 30.0 {
        Region::Europe
    } else if (-20.0..=55.0).contains(&lon) && lat < 30.0 {
        Region::Africa
    } else {
        Region::AsiaPacific
    }
}

/// Agency order per region, highest priority first
fn priority_table(region: Region) -> &'static [&'static str] {
    match region {
        Region::Americas => &["usgs", "emsc", "gfz", "isc", "ipgp", "geonet"],
        Region::Europe => &["emsc", "gfz", "usgs", "isc", "ipgp", "geonet"],
        Region::Africa => &["isc", "emsc", "ipgp", "usgs", "gfz", "geonet"],
        Region::AsiaPacific => &["isc", "usgs", "geonet", "emsc", "gfz", "ipgp"],
    }
}

/// Priority rank of a source within a region; unknown sources rank last
pub fn region_rank(region: Region, source: &str) -> usize {
    let table = priority_table(region);
    table
        .iter()
        .position(|&tag| tag == source)
        .unwrap_or(table.len())
}

/// Mean latitude/longitude of a set of events
pub fn centroid(events: &[&NormalizedEvent]) -> (f64, f64) {
    if events.is_empty() {
        return (0.0, 0.0);
    }
    let n = events.len() as f64;
    let lat = events.iter().map(|e| e.latitude).sum::<f64>() / n;
    let lon = events.iter().map(|e| e.longitude).sum::<f64>() / n;
    (lat, lon)
}

/// Select the preferred representative among cluster members.
///
/// Order: reviewed before anything else, then region priority rank, then
/// newest `updated_at`, then `event_uid` as the final deterministic
/// tie-breaker. Returns the index into `members`.
pub fn select_preferred(members: &[&NormalizedEvent], region: Region) -> usize {
    let mut best = 0;
    let mut best_key = preference_key(members[0], region);
    for (idx, member) in members.iter().enumerate().skip(1) {
        let key = preference_key(member, region);
        if key < best_key {
            best = idx;
            best_key = key;
        }
    }
    best
}

type PreferenceKey = (bool, usize, Reverse<DateTime<Utc>>, String);

fn preference_key(event: &NormalizedEvent, region: Region) -> PreferenceKey {
    (
        event.status != EventStatus::Reviewed,
        region_rank(region, &event.source),
        Reverse(event.updated_at.unwrap_or(DateTime::<Utc>::MIN_UTC)),
        event.event_uid(),
    )
}
