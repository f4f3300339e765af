//! Batch and worker drivers for the pipeline core
//!
//! Both modes share the same stages. Batch mode polls every enabled source
//! concurrently, runs one fusion pass, appends a single pipeline-run row,
//! and returns. Worker mode runs one poll loop per source on its own
//! cadence plus a fusion loop, all stopping cooperatively on cancellation.
//!
//! A fusion pass computes every unified and crosswalk row before writing
//! anything; a read or integrity failure therefore aborts the pass with no
//! writes, leaving the previous unified state intact.

use crate::cluster::{cluster_window, ClusterParams};
use crate::poller::{Poller, SeenCache, SourcePollOutcome};
use crate::sources::{SourceRegistry, SourceSpec};
use crate::transport::{FetchQuery, TransportClient};
use crate::unify::unify;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use quake_common::config::PipelineConfig;
use quake_common::models::{PipelineRun, RunStatus};
use quake_common::store::EventStore;
use quake_common::{time, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Counters from one fusion pass
#[derive(Debug, Clone, Default)]
pub struct FusionSummary {
    pub window_size: usize,
    pub cluster_count: usize,
    pub unified_written: usize,
    pub crosswalk_written: usize,
}

/// Run clustering and unification once over the current window.
///
/// The window slides on the maximum observed `origin_time_utc`, not the
/// wall clock, so replays are deterministic; `now` only anchors the store
/// read and the output timestamps.
pub async fn run_fusion_once(
    store: &dyn EventStore,
    config: &PipelineConfig,
    now: DateTime<Utc>,
) -> Result<FusionSummary> {
    let window = ChronoDuration::hours(config.window.hours as i64);
    let mut events = store.read_window(now - window).await?;

    if let Some(max_origin) = events.iter().map(|e| e.origin_time_utc).max() {
        let window_start = max_origin - window;
        events.retain(|e| e.origin_time_utc >= window_start);
    }
    if events.is_empty() {
        info!("fusion pass: empty window, nothing to do");
        return Ok(FusionSummary::default());
    }

    let event_uids: Vec<String> = events.iter().map(|e| e.event_uid()).collect();
    let existing = store.read_existing_crosswalk(&event_uids).await?;

    let clusters = cluster_window(
        &events,
        &ClusterParams::from(config),
        &config.scoring.weights,
    );
    let output = unify(
        &events,
        &clusters,
        &existing,
        &config.scoring.weights,
        now,
    )?;

    for unified in &output.unified {
        store.upsert_unified(unified).await?;
    }
    for row in &output.crosswalk {
        store.upsert_crosswalk(row).await?;
    }

    let multi_source = output.unified.iter().filter(|u| u.num_sources > 1).count();
    info!(
        window_size = events.len(),
        clusters = clusters.len(),
        unified = output.unified.len(),
        multi_source,
        "fusion pass complete"
    );

    Ok(FusionSummary {
        window_size: events.len(),
        cluster_count: clusters.len(),
        unified_written: output.unified.len(),
        crosswalk_written: output.crosswalk.len(),
    })
}

/// One-shot batch invocation: poll all enabled sources concurrently, fuse
/// once, append a single pipeline-run row, and return it.
///
/// Partial source failure is status `ok` with the errors recorded; all
/// sources failing, or a fusion failure, is status `failed`.
pub async fn run_batch(
    store: Arc<dyn EventStore>,
    transport: Arc<TransportClient>,
    registry: &SourceRegistry,
    config: &PipelineConfig,
) -> Result<PipelineRun> {
    let run_id = Uuid::new_v4();
    let started_at = time::now();
    let specs: Vec<SourceSpec> = registry.enabled(config)?.into_iter().cloned().collect();
    info!(%run_id, sources = specs.len(), "batch run starting");

    let poller = Arc::new(Poller::new(transport, store.clone()));
    let mut tasks = JoinSet::new();
    for spec in specs {
        let poller = poller.clone();
        let interval = config.poll_interval_for(spec.tag, spec.min_poll_interval.as_secs());
        let min_magnitude = config.fetch.min_magnitude;
        tasks.spawn(async move {
            let now = time::now();
            let query = FetchQuery {
                start: now - ChronoDuration::seconds(lookback_secs(interval)),
                end: now,
                min_magnitude,
            };
            let mut seen = SeenCache::new();
            poller.poll_source(&spec, &query, &mut seen, now).await
        });
    }

    let mut outcomes: Vec<SourcePollOutcome> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => warn!(error = %e, "poll task aborted"),
        }
    }
    outcomes.sort_by(|a, b| a.source.cmp(&b.source));

    let sources_fetched: Vec<String> = outcomes
        .iter()
        .filter(|o| o.fetch_ok)
        .map(|o| o.source.clone())
        .collect();
    let raw_events_count: u64 = outcomes.iter().map(|o| o.stored as u64).sum();
    let dead_letter_count: u64 = outcomes.iter().map(|o| o.dead_lettered as u64).sum();
    let mut errors: Vec<String> = outcomes
        .iter()
        .filter_map(|o| o.error.as_ref().map(|e| format!("{}: {}", o.source, e)))
        .collect();

    let (status, unified_events_count) = if sources_fetched.is_empty() {
        error!(%run_id, "all sources failed, skipping fusion");
        (RunStatus::Failed, 0)
    } else {
        match run_fusion_once(store.as_ref(), config, time::now()).await {
            Ok(summary) => (RunStatus::Ok, summary.unified_written as u64),
            Err(e) => {
                error!(%run_id, error = %e, "fusion pass failed");
                errors.push(format!("fusion: {}", e));
                (RunStatus::Failed, 0)
            }
        }
    };

    let finished_at = time::now();
    let run = PipelineRun {
        run_id,
        started_at,
        finished_at,
        status,
        sources_fetched,
        raw_events_count,
        unified_events_count,
        dead_letter_count,
        error_message: if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        },
        duration_seconds: (finished_at - started_at).num_milliseconds() as f64 / 1000.0,
    };
    store.append_run(&run).await?;

    info!(
        %run_id,
        status = ?run.status,
        raw = run.raw_events_count,
        unified = run.unified_events_count,
        dead = run.dead_letter_count,
        "batch run complete"
    );
    Ok(run)
}

/// Long-lived worker mode: one poll loop per enabled source plus a fusion
/// loop on its own cadence. Returns once every loop has observed the
/// cancellation token and stopped.
pub async fn run_worker(
    store: Arc<dyn EventStore>,
    transport: Arc<TransportClient>,
    registry: &SourceRegistry,
    config: Arc<PipelineConfig>,
    cancel: CancellationToken,
) -> Result<()> {
    let specs: Vec<SourceSpec> = registry.enabled(&config)?.into_iter().cloned().collect();
    let poller = Arc::new(Poller::new(transport, store.clone()));

    let mut tasks = JoinSet::new();
    for spec in specs {
        let poller = poller.clone();
        let config = config.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { poll_loop(poller, spec, config, cancel).await });
    }
    {
        let store = store.clone();
        let config = config.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { fusion_loop(store, config, cancel).await });
    }

    while tasks.join_next().await.is_some() {}
    info!("worker stopped");
    Ok(())
}

async fn poll_loop(
    poller: Arc<Poller>,
    spec: SourceSpec,
    config: Arc<PipelineConfig>,
    cancel: CancellationToken,
) {
    let interval_s = config
        .poll_interval_for(spec.tag, spec.min_poll_interval.as_secs())
        .max(1);
    let lookback = ChronoDuration::seconds(lookback_secs(interval_s));
    let mut seen = SeenCache::new();
    info!(source = spec.tag, interval_s, "poller started");

    loop {
        let now = time::now();
        let query = FetchQuery {
            start: now - lookback,
            end: now,
            min_magnitude: config.fetch.min_magnitude,
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = poller.poll_source(&spec, &query, &mut seen, now) => {
                if let Some(e) = &outcome.error {
                    warn!(source = %outcome.source, error = %e, "poll cycle error");
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(interval_s)) => {}
        }
    }
    info!(source = spec.tag, "poller stopped");
}

async fn fusion_loop(
    store: Arc<dyn EventStore>,
    config: Arc<PipelineConfig>,
    cancel: CancellationToken,
) {
    let interval = Duration::from_secs(config.fusion.interval_secs.max(1));
    info!(interval_s = interval.as_secs(), "fusion loop started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        // A cancelled batch skips unification entirely
        if cancel.is_cancelled() {
            break;
        }

        let run_id = Uuid::new_v4();
        let started_at = time::now();
        let (status, summary, error_message) =
            match run_fusion_once(store.as_ref(), &config, started_at).await {
                Ok(summary) => (RunStatus::Ok, summary, None),
                Err(e) => {
                    // Worker mode surfaces fusion failures as a logged alert
                    error!(%run_id, error = %e, "fusion cycle failed");
                    (RunStatus::Failed, FusionSummary::default(), Some(e.to_string()))
                }
            };

        let finished_at = time::now();
        let run = PipelineRun {
            run_id,
            started_at,
            finished_at,
            status,
            sources_fetched: Vec::new(),
            raw_events_count: 0,
            unified_events_count: summary.unified_written as u64,
            dead_letter_count: 0,
            error_message,
            duration_seconds: (finished_at - started_at).num_milliseconds() as f64 / 1000.0,
        };
        if let Err(e) = store.append_run(&run).await {
            error!(%run_id, error = %e, "pipeline-run append failed");
        }
    }
    info!("fusion loop stopped");
}

/// Poll further back than the cadence so late-arriving events between
/// cycles are not missed
fn lookback_secs(interval_s: u64) -> i64 {
    (interval_s * 3).max(600) as i64
}
