//! End-to-end pipeline scenarios: mock agency endpoints through fetch,
//! normalization, clustering, and unification into the in-memory store

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use chrono::SecondsFormat;
use quake_common::config::PipelineConfig;
use quake_common::models::{EventStatus, RawEventRecord, RunStatus};
use quake_common::store::{EventStore, MemoryStore};
use quake_common::time;
use quake_pipeline::runner::{run_batch, run_fusion_once, run_worker};
use quake_pipeline::sources::{SourceFormat, SourceRegistry, SourceSpec};
use quake_pipeline::transport::TransportClient;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn serve(router: Router) -> SocketAddr {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn spec(tag: &'static str, format: SourceFormat, addr: SocketAddr) -> SourceSpec {
    SourceSpec {
        tag,
        base_url: format!("http://{}/fdsnws/event/1/query", addr),
        format,
        min_poll_interval: Duration::from_secs(1),
        timeout: Duration::from_secs(5),
        max_retries: 1,
        global_priority_rank: 0,
        supported_regions: &[],
    }
}

fn config_for(tags: &[&str]) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.sources.enabled = tags.iter().map(|t| t.to_string()).collect();
    config.retry.base_ms = 10;
    config.retry.cap_ms = 50;
    config
}

fn usgs_payload(t_ms: i64) -> String {
    format!(
        r#"{{"type":"FeatureCollection","features":[{{
            "type":"Feature","id":"us1",
            "properties":{{"mag":5.2,"magType":"mw","time":{t_ms},
                "place":"25 km SW of Chania, Greece","status":"reviewed","net":"us"}},
            "geometry":{{"type":"Point","coordinates":[25.0,35.0,10.0]}}
        }}]}}"#
    )
}

fn emsc_payload(t_ms: i64) -> String {
    let iso = time::from_epoch_millis(t_ms + 10_000)
        .unwrap()
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    format!(
        r#"{{"type":"FeatureCollection","features":[{{
            "type":"Feature","id":"em1",
            "properties":{{"unid":"em1","mag":5.1,"magtype":"mw","time":"{iso}",
                "flynn_region":"CRETE, GREECE","status":"automatic","auth":"EMSC"}},
            "geometry":{{"type":"Point","coordinates":[25.03,35.05,12.0]}}
        }}]}}"#
    )
}

/// Two agencies reporting the same quake fuse into one unified event with
/// the reviewed USGS solution preferred over EMSC's regional rank.
#[tokio::test]
async fn test_two_agencies_same_quake() {
    let t_ms = time::now().timestamp_millis() - 120_000;

    let usgs_addr = serve(Router::new().route(
        "/fdsnws/event/1/query",
        get(move || async move { usgs_payload(t_ms) }),
    ))
    .await;
    let emsc_addr = serve(Router::new().route(
        "/fdsnws/event/1/query",
        get(move || async move { emsc_payload(t_ms) }),
    ))
    .await;

    let registry = SourceRegistry::new(vec![
        spec("usgs", SourceFormat::GeojsonUsgs, usgs_addr),
        spec("emsc", SourceFormat::GeojsonEmsc, emsc_addr),
    ]);
    let config = config_for(&["usgs", "emsc"]);
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(TransportClient::new(&registry, &config).unwrap());

    let run = run_batch(store.clone(), transport, &registry, &config)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Ok);
    assert_eq!(run.raw_events_count, 2);
    assert_eq!(run.dead_letter_count, 0);
    assert_eq!(run.unified_events_count, 1);
    assert_eq!(run.sources_fetched, vec!["emsc", "usgs"]);

    let unified = store.unified_snapshot().await;
    assert_eq!(unified.len(), 1);
    let event = &unified[0];
    assert_eq!(event.num_sources, 2);
    assert_eq!(event.preferred_source, "usgs");
    assert_eq!(event.preferred_event_uid, "usgs:us1");
    assert_eq!(event.status, EventStatus::Reviewed);
    assert_eq!(event.magnitude_value, 5.2);
    assert!((event.magnitude_std - 0.05).abs() < 1e-9);
    assert_eq!(event.source_agreement_score, 1.0);
    assert_eq!(
        event.source_event_uids,
        vec!["emsc:em1".to_string(), "usgs:us1".to_string()]
    );

    let crosswalk = store.crosswalk_snapshot().await;
    assert_eq!(crosswalk.len(), 2);
    let preferred: Vec<_> = crosswalk.iter().filter(|r| r.is_preferred).collect();
    assert_eq!(preferred.len(), 1);
    assert_eq!(preferred[0].event_uid, "usgs:us1");
    assert_eq!(preferred[0].match_score, 1.0);
}

/// A feature with a null magnitude is dead-lettered; sibling features in
/// the same payload still flow through.
#[tokio::test]
async fn test_null_magnitude_dead_letters() {
    let t_ms = time::now().timestamp_millis() - 120_000;
    let payload = format!(
        r#"{{"type":"FeatureCollection","features":[
            {{"type":"Feature","id":"us-ok",
              "properties":{{"mag":4.1,"magType":"ml","time":{t_ms},"status":"automatic"}},
              "geometry":{{"type":"Point","coordinates":[25.0,35.0,8.0]}}}},
            {{"type":"Feature","id":"us-null-mag",
              "properties":{{"mag":null,"magType":"ml","time":{t_ms},"status":"automatic"}},
              "geometry":{{"type":"Point","coordinates":[25.1,35.1,9.0]}}}}
        ]}}"#
    );

    let addr = serve(Router::new().route(
        "/fdsnws/event/1/query",
        get(move || {
            let payload = payload.clone();
            async move { payload }
        }),
    ))
    .await;

    let registry = SourceRegistry::new(vec![spec("usgs", SourceFormat::GeojsonUsgs, addr)]);
    let config = config_for(&["usgs"]);
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(TransportClient::new(&registry, &config).unwrap());

    let run = run_batch(store.clone(), transport, &registry, &config)
        .await
        .unwrap();

    // Partial success is still an ok run, with counters
    assert_eq!(run.status, RunStatus::Ok);
    assert_eq!(run.raw_events_count, 1);
    assert_eq!(run.dead_letter_count, 1);

    let dead = store.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].source_event_id.as_deref(), Some("us-null-mag"));
    assert!(dead[0].error_messages[0].contains("missing magnitude"));
    assert!(dead[0].raw_payload.contains("us-null-mag"));

    // The dead-lettered feature does not reach unified output
    let unified = store.unified_snapshot().await;
    assert_eq!(unified.len(), 1);
    assert_eq!(unified[0].preferred_event_uid, "usgs:us-ok");
}

/// Every attempt exhausted on 503: no rows written, run recorded as failed.
#[tokio::test]
async fn test_retry_exhaustion_fails_run() {
    let addr = serve(Router::new().route(
        "/fdsnws/event/1/query",
        get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
    ))
    .await;

    let registry = SourceRegistry::new(vec![spec("usgs", SourceFormat::GeojsonUsgs, addr)]);
    let config = config_for(&["usgs"]);
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(TransportClient::new(&registry, &config).unwrap());

    let run = run_batch(store.clone(), transport, &registry, &config)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.raw_events_count, 0);
    assert!(run.sources_fetched.is_empty());
    assert!(run.error_message.unwrap().contains("503"));

    assert_eq!(store.raw_count().await, 0);
    assert!(store.unified_snapshot().await.is_empty());

    let runs = store.runs().await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
}

/// An enabled tag the registry does not know is fatal before any poller
/// spawns; validate() cannot see the registry, so this is where the check
/// lands.
#[tokio::test]
async fn test_unknown_enabled_tag_fails_batch_startup() {
    let registry = SourceRegistry::builtin();
    let config = config_for(&["usgs", "nowhere"]);
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(TransportClient::new(&registry, &config).unwrap());

    let err = run_batch(store.clone(), transport, &registry, &config)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown source tag"), "{}", err);

    // Nothing ran: no rows, no telemetry
    assert_eq!(store.raw_count().await, 0);
    assert!(store.runs().await.is_empty());
}

/// Re-running fusion on an unchanged window produces byte-identical rows:
/// identity is recovered from the seeded crosswalk and nothing churns.
#[tokio::test]
async fn test_fusion_rerun_produces_zero_diffs() {
    let store = MemoryStore::new();
    let t_ms = time::now().timestamp_millis() - 3_600_000;
    let ingested = time::now();

    for (source, id, offset_s, lat, lon, mag, status) in [
        ("usgs", "us1", 0, 35.0, 25.0, 5.2, EventStatus::Reviewed),
        ("emsc", "em1", 10, 35.05, 25.03, 5.1, EventStatus::Automatic),
        ("gfz", "gfz1", 900, -18.0, -178.0, 6.0, EventStatus::Automatic),
    ] {
        let event = quake_common::models::NormalizedEvent {
            source: source.into(),
            source_event_id: id.into(),
            origin_time_utc: time::from_epoch_millis(t_ms + offset_s * 1000).unwrap(),
            latitude: lat,
            longitude: lon,
            depth_km: 10.0,
            magnitude_value: mag,
            magnitude_type: "mw".into(),
            status,
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
            fetched_at: ingested,
            updated_at: None,
        };
        store
            .append_raw(&RawEventRecord::new(event, ingested))
            .await
            .unwrap();
    }

    let config = PipelineConfig::default();
    let now = time::now();

    let first = run_fusion_once(&store, &config, now).await.unwrap();
    assert_eq!(first.window_size, 3);
    assert_eq!(first.unified_written, 2);
    let unified_first = store.unified_snapshot().await;
    let crosswalk_first = store.crosswalk_snapshot().await;

    let second = run_fusion_once(&store, &config, now).await.unwrap();
    assert_eq!(second.unified_written, 2);
    assert_eq!(store.unified_snapshot().await, unified_first);
    assert_eq!(store.crosswalk_snapshot().await, crosswalk_first);
}

/// Worker mode stops promptly on cancellation.
#[tokio::test]
async fn test_worker_cancellation_is_prompt() {
    let t_ms = time::now().timestamp_millis() - 120_000;
    let addr = serve(Router::new().route(
        "/fdsnws/event/1/query",
        get(move || async move { usgs_payload(t_ms) }),
    ))
    .await;

    let registry = SourceRegistry::new(vec![spec("usgs", SourceFormat::GeojsonUsgs, addr)]);
    let mut config = config_for(&["usgs"]);
    config.fusion.interval_secs = 1;

    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(TransportClient::new(&registry, &config).unwrap());
    let cancel = CancellationToken::new();

    let worker = {
        let store = store.clone();
        let cancel = cancel.clone();
        let config = Arc::new(config);
        tokio::spawn(async move {
            run_worker(store, transport, &registry, config, cancel).await
        })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker did not stop after cancellation")
        .unwrap()
        .unwrap();

    // The first poll cycle ran before cancellation
    assert_eq!(store.raw_count().await, 1);
}
