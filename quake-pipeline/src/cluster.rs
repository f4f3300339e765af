//! Density-based spatial-temporal clustering
//!
//! Groups the events of one sliding window into clusters that represent the
//! same physical earthquake:
//! 1. spatial grouping by great-circle neighborhood chaining (minimum
//!    cluster size 1, so every event is at least its own cluster);
//! 2. time/magnitude sub-partitioning against the running median of the
//!    open sub-cluster;
//! 3. a consistency filter that ejects members scoring below the match
//!    threshold against the cluster centroid.
//!
//! The assignment is total and deterministic: input is re-sorted by
//! `(origin_time_utc, event_uid)` before grouping, so re-running on the same
//! window yields identical clusters. The naive pairwise neighbor scan is
//! adequate for windows up to ~5,000 events.

use crate::geo::haversine_km;
use crate::score::match_score;
use quake_common::config::{PipelineConfig, ScoringWeights};
use quake_common::models::{EventStatus, NormalizedEvent};
use tracing::warn;

/// Window size beyond which the naive neighbor scan may miss its deadline
const NAIVE_SCAN_LIMIT: usize = 5_000;

/// Clustering thresholds
#[derive(Debug, Clone)]
pub struct ClusterParams {
    /// Spatial neighborhood radius, km
    pub eps_km: f64,
    /// Maximum origin-time difference against the running median, seconds
    pub dt_s: f64,
    /// Maximum magnitude difference against the running median
    pub dmag: f64,
    /// Minimum member-vs-centroid score for clusters of size >= 2
    pub match_threshold: f64,
}

impl From<&PipelineConfig> for ClusterParams {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            eps_km: config.cluster.eps_km,
            dt_s: config.cluster.dt_s,
            dmag: config.cluster.dmag,
            match_threshold: config.matching.threshold,
        }
    }
}

/// One cluster: indices into the input slice, ordered by
/// `(origin_time_utc, event_uid)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub members: Vec<usize>,
}

/// Cluster a window of events. The result is a total assignment: every
/// input index appears in exactly one cluster.
pub fn cluster_window(
    events: &[NormalizedEvent],
    params: &ClusterParams,
    weights: &ScoringWeights,
) -> Vec<Cluster> {
    if events.is_empty() {
        return Vec::new();
    }
    if events.len() > NAIVE_SCAN_LIMIT {
        warn!(
            window_size = events.len(),
            limit = NAIVE_SCAN_LIMIT,
            "window exceeds the naive clustering limit; pass may run long"
        );
    }

    let order = sorted_order(events);
    let components = spatial_components(events, &order, params.eps_km);

    let mut clusters = Vec::new();
    for component in components {
        for sub in sub_partition(events, &component, params) {
            let (kept, ejected) = consistency_filter(events, sub, params, weights);
            if !kept.is_empty() {
                clusters.push(Cluster { members: kept });
            }
            for idx in ejected {
                clusters.push(Cluster { members: vec![idx] });
            }
        }
    }

    clusters.sort_by(|a, b| {
        let ka = &events[a.members[0]];
        let kb = &events[b.members[0]];
        (ka.origin_time_utc, ka.event_uid()).cmp(&(kb.origin_time_utc, kb.event_uid()))
    });
    clusters
}

fn sorted_order(events: &[NormalizedEvent]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..events.len()).collect();
    order.sort_by(|&a, &b| {
        (events[a].origin_time_utc, events[a].event_uid())
            .cmp(&(events[b].origin_time_utc, events[b].event_uid()))
    });
    order
}

/// Neighborhood-chained spatial components (single-linkage over eps_km)
fn spatial_components(
    events: &[NormalizedEvent],
    order: &[usize],
    eps_km: f64,
) -> Vec<Vec<usize>> {
    let mut dsu = DisjointSet::new(events.len());
    for (i, &a) in order.iter().enumerate() {
        for &b in &order[i + 1..] {
            let distance = haversine_km(
                events[a].latitude,
                events[a].longitude,
                events[b].latitude,
                events[b].longitude,
            );
            if distance <= eps_km {
                dsu.union(a, b);
            }
        }
    }

    // Components in first-appearance order, members time-ordered
    let mut components: Vec<Vec<usize>> = Vec::new();
    let mut component_of = vec![usize::MAX; events.len()];
    for &idx in order {
        let root = dsu.find(idx);
        if component_of[root] == usize::MAX {
            component_of[root] = components.len();
            components.push(Vec::new());
        }
        components[component_of[root]].push(idx);
    }
    components
}

/// Split a time-ordered component whenever the next event violates the
/// time or magnitude bound against the running median of the open
/// sub-cluster.
fn sub_partition(
    events: &[NormalizedEvent],
    component: &[usize],
    params: &ClusterParams,
) -> Vec<Vec<usize>> {
    let mut subs: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();

    for &idx in component {
        if current.is_empty() {
            current.push(idx);
            continue;
        }
        let median_time_ms = median(current.iter().map(|&i| {
            events[i].origin_time_utc.timestamp_millis() as f64
        }));
        let median_mag = median(current.iter().map(|&i| events[i].magnitude_value));

        let dt_s =
            (events[idx].origin_time_utc.timestamp_millis() as f64 - median_time_ms).abs() / 1000.0;
        let dmag = (events[idx].magnitude_value - median_mag).abs();

        if dt_s > params.dt_s || dmag > params.dmag {
            subs.push(std::mem::take(&mut current));
        }
        current.push(idx);
    }
    if !current.is_empty() {
        subs.push(current);
    }
    subs
}

/// Eject members of clusters of size >= 2 that score below the threshold
/// against the cluster centroid. Returns (kept, ejected).
fn consistency_filter(
    events: &[NormalizedEvent],
    members: Vec<usize>,
    params: &ClusterParams,
    weights: &ScoringWeights,
) -> (Vec<usize>, Vec<usize>) {
    if members.len() < 2 {
        return (members, Vec::new());
    }

    let centroid = centroid_event(events, &members);
    let (kept, ejected) = members
        .into_iter()
        .partition(|&idx| match_score(&events[idx], &centroid, weights) >= params.match_threshold);
    (kept, ejected)
}

/// Synthetic event at the cluster's mean time, location, and magnitude,
/// used only as the scoring reference point
fn centroid_event(events: &[NormalizedEvent], members: &[usize]) -> NormalizedEvent {
    let n = members.len() as f64;
    let mean_ms = members
        .iter()
        .map(|&i| events[i].origin_time_utc.timestamp_millis() as f64)
        .sum::<f64>()
        / n;
    let first = &events[members[0]];

    NormalizedEvent {
        source: String::new(),
        source_event_id: String::new(),
        origin_time_utc: quake_common::time::from_epoch_millis(mean_ms.round() as i64)
            .unwrap_or(first.origin_time_utc),
        latitude: members.iter().map(|&i| events[i].latitude).sum::<f64>() / n,
        longitude: members.iter().map(|&i| events[i].longitude).sum::<f64>() / n,
        depth_km: 0.0,
        magnitude_value: members
            .iter()
            .map(|&i| events[i].magnitude_value)
            .sum::<f64>()
            / n,
        magnitude_type: String::new(),
        status: EventStatus::Automatic,
        place: None,
        region: None,
        lat_error_km: None,
        lon_error_km: None,
        depth_error_km: None,
        mag_error: None,
        time_error_sec: None,
        num_phases: None,
        azimuthal_gap: None,
        author: None,
        url: None,
        fetched_at: first.fetched_at,
        updated_at: None,
    }
}

fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut values: Vec<f64> = values.collect();
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n == 0 {
        0.0
    } else if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            let root = self.find(self.parent[x]);
            self.parent[x] = root;
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller root wins to keep merges order-independent
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quake_common::time;

    const T0: i64 = 1_704_067_200_000;
    /// km per degree of latitude
    const KM_PER_DEG: f64 = 111.19493;

    fn event(id: &str, offset_s: i64, lat: f64, lon: f64, mag: f64) -> NormalizedEvent {
        NormalizedEvent {
            source: "usgs".into(),
            source_event_id: id.into(),
            origin_time_utc: time::from_epoch_millis(T0 + offset_s * 1000).unwrap(),
            latitude: lat,
            longitude: lon,
            depth_km: 10.0,
            magnitude_value: mag,
            magnitude_type: "mw".into(),
            status: EventStatus::Automatic,
            place: None,
            region: None,
            lat_error_km: None,
            lon_error_km: None,
            depth_error_km: None,
            mag_error: None,
            time_error_sec: None,
            num_phases: None,
            azimuthal_gap: None,
            author: None,
            url: None,
            fetched_at: time::from_epoch_millis(T0).unwrap(),
            updated_at: None,
        }
    }

    fn params() -> ClusterParams {
        ClusterParams::from(&PipelineConfig::default())
    }

    fn run(events: &[NormalizedEvent]) -> Vec<Vec<usize>> {
        cluster_window(events, &params(), &ScoringWeights::default())
            .into_iter()
            .map(|c| c.members)
            .collect()
    }

    #[test]
    fn test_every_event_is_assigned() {
        let events = vec![
            event("a", 0, 35.0, 25.0, 5.0),
            event("b", 500, -10.0, 120.0, 4.0),
            event("c", 1000, 60.0, -150.0, 3.0),
        ];
        let clusters = run(&events);
        let total: usize = clusters.iter().map(|c| c.len()).sum();
        assert_eq!(total, 3);
        assert_eq!(clusters.len(), 3);
    }

    #[test]
    fn test_events_within_eps_cluster() {
        // ~99.6 km apart in latitude
        let events = vec![
            event("a", 0, 0.0, 0.0, 5.0),
            event("b", 5, 99.6 / KM_PER_DEG, 0.0, 5.0),
        ];
        let clusters = run(&events);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 2);
    }

    #[test]
    fn test_events_beyond_eps_split() {
        let events = vec![
            event("a", 0, 0.0, 0.0, 5.0),
            event("b", 5, 100.5 / KM_PER_DEG, 0.0, 5.0),
        ];
        let clusters = run(&events);
        assert_eq!(clusters.len(), 2);
    }

    #[test]
    fn test_density_chaining_through_middle_member() {
        // a-b and b-c are each within 100 km; a-c is not. Chaining keeps
        // all three together.
        let events = vec![
            event("a", 0, 0.0, 0.0, 5.0),
            event("b", 2, 90.0 / KM_PER_DEG, 0.0, 5.0),
            event("c", 4, 180.0 / KM_PER_DEG, 0.0, 5.0),
        ];
        let clusters = run(&events);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 3);
    }

    #[test]
    fn test_time_bound_splits_at_thirty_seconds() {
        let near = vec![
            event("a", 0, 35.0, 25.0, 5.0),
            event("b", 30, 35.0, 25.0, 5.0),
        ];
        assert_eq!(run(&near).len(), 1);

        let far = vec![
            event("a", 0, 35.0, 25.0, 5.0),
            event("b", 31, 35.0, 25.0, 5.0),
        ];
        assert_eq!(run(&far).len(), 2);
    }

    #[test]
    fn test_aftershock_magnitude_gap_splits() {
        // Same location, 45 s apart, magnitudes 5.0 and 4.2: both the time
        // and magnitude bounds force a split.
        let events = vec![
            event("main", 0, 35.0, 25.0, 5.0),
            event("after", 45, 35.0, 25.0, 4.2),
        ];
        let clusters = run(&events);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0], vec![0]);
        assert_eq!(clusters[1], vec![1]);
    }

    #[test]
    fn test_magnitude_gap_alone_splits() {
        let events = vec![
            event("a", 0, 35.0, 25.0, 5.0),
            event("b", 5, 35.0, 25.0, 4.4),
        ];
        assert_eq!(run(&events).len(), 2);
    }

    #[test]
    fn test_consistency_filter_ejects_outlier() {
        // c satisfies the pairwise bounds but scores ~0.59 against the
        // cluster centroid and is ejected as a singleton.
        let events = vec![
            event("a", 0, 0.0, 0.0, 5.0),
            event("b", 0, 0.0, 0.0, 5.0),
            event("c", 28, 95.0 / KM_PER_DEG, 0.0, 5.45),
        ];
        let clusters = run(&events);
        assert_eq!(clusters.len(), 2);
        let sizes: Vec<usize> = clusters.iter().map(|c| c.len()).collect();
        assert!(sizes.contains(&2) && sizes.contains(&1));
        let singleton = clusters.iter().find(|c| c.len() == 1).unwrap();
        assert_eq!(events[singleton[0]].source_event_id, "c");
    }

    #[test]
    fn test_clustering_is_deterministic_under_input_order() {
        let mut events = vec![
            event("a", 0, 35.0, 25.0, 5.2),
            event("b", 10, 35.05, 25.03, 5.1),
            event("c", 300, 35.0, 25.0, 5.0),
        ];
        let first: Vec<Vec<String>> = run(&events)
            .iter()
            .map(|c| c.iter().map(|&i| events[i].event_uid()).collect())
            .collect();

        events.reverse();
        let second: Vec<Vec<String>> = run(&events)
            .iter()
            .map(|c| c.iter().map(|&i| events[i].event_uid()).collect())
            .collect();

        assert_eq!(first, second);
    }
}
