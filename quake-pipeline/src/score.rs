//! Pairwise match scorer
//!
//! Weighted similarity in [0, 1] used for crosswalk scoring and the
//! cluster-consistency filter. Symmetric and bounded; `score(a, a) = 1`.

use crate::geo::haversine_km;
use quake_common::config::ScoringWeights;
use quake_common::models::NormalizedEvent;

/// Time-similarity denominator, seconds
const TIME_SCALE_S: f64 = 60.0;
/// Distance-similarity denominator, km
const DISTANCE_SCALE_KM: f64 = 100.0;
/// Magnitude-similarity denominator
const MAGNITUDE_SCALE: f64 = 2.0;

/// Weighted similarity between two canonical events
pub fn match_score(a: &NormalizedEvent, b: &NormalizedEvent, weights: &ScoringWeights) -> f64 {
    let dt_s = (a.origin_time_utc - b.origin_time_utc)
        .num_milliseconds()
        .abs() as f64
        / 1000.0;
    let dist_km = haversine_km(a.latitude, a.longitude, b.latitude, b.longitude);
    let dmag = (a.magnitude_value - b.magnitude_value).abs();

    weights.time * similarity(dt_s, TIME_SCALE_S)
        + weights.distance * similarity(dist_km, DISTANCE_SCALE_KM)
        + weights.magnitude * similarity(dmag, MAGNITUDE_SCALE)
}

fn similarity(delta: f64, scale: f64) -> f64 {
    (1.0 - delta / scale).max(0.0)
}
