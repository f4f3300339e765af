//! Configuration loading and graceful-degradation tests
//!
//! Tests that manipulate QUAKE_* environment variables are marked #[serial]
//! to prevent races between parallel test threads.

use quake_common::config::PipelineConfig;
use serial_test::serial;
use std::io::Write;

#[test]
#[serial]
fn test_load_without_path_uses_defaults() {
    let config = PipelineConfig::load(None).unwrap();
    assert_eq!(config, PipelineConfig::default());
}

#[test]
#[serial]
fn test_missing_file_falls_back_to_defaults() {
    let config =
        PipelineConfig::load(Some(std::path::Path::new("/nonexistent/quake.toml"))).unwrap();
    assert_eq!(config, PipelineConfig::default());
}

#[test]
#[serial]
fn test_toml_overrides_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[sources]
enabled = ["usgs", "isc"]

[poll.interval]
usgs = 45

[window]
hours = 6

[cluster]
eps_km = 80.0
dt_s = 20.0
dmag = 0.4

[match]
threshold = 0.7

[scoring.weights]
time = 0.5
distance = 0.3
magnitude = 0.2

[retry]
max_attempts = 5
base_ms = 500
cap_ms = 10000

[timeout]
ms = 8000

[fusion]
interval_secs = 120

[fetch]
min_magnitude = 2.5
"#
    )
    .unwrap();

    let config = PipelineConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.sources.enabled, vec!["usgs", "isc"]);
    assert_eq!(config.poll_interval_for("usgs", 60), 45);
    assert_eq!(config.window.hours, 6);
    assert_eq!(config.cluster.eps_km, 80.0);
    assert_eq!(config.matching.threshold, 0.7);
    assert_eq!(config.scoring.weights.time, 0.5);
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.timeout.ms, 8000);
    assert_eq!(config.fusion.interval_secs, 120);
    assert_eq!(config.fetch.min_magnitude, 2.5);
}

#[test]
#[serial]
fn test_partial_toml_keeps_other_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "[window]\nhours = 12\n").unwrap();

    let config = PipelineConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.window.hours, 12);
    assert_eq!(config.cluster.eps_km, 100.0);
    assert_eq!(config.matching.threshold, 0.6);
}

#[test]
fn test_malformed_toml_is_fatal() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "[window\nhours = ").unwrap();
    assert!(PipelineConfig::load(Some(file.path())).is_err());
}

#[test]
fn test_bad_weights_in_toml_are_fatal() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "[scoring.weights]\ntime = 0.9\ndistance = 0.9\nmagnitude = 0.2\n"
    )
    .unwrap();
    let err = PipelineConfig::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("sum to 1"), "{}", err);
}

#[test]
#[serial]
fn test_env_overrides_toml() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "[window]\nhours = 12\n").unwrap();

    std::env::set_var("QUAKE_WINDOW_HOURS", "48");
    std::env::set_var("QUAKE_SOURCES_ENABLED", "usgs, emsc");
    let result = PipelineConfig::load(Some(file.path()));
    std::env::remove_var("QUAKE_WINDOW_HOURS");
    std::env::remove_var("QUAKE_SOURCES_ENABLED");

    let config = result.unwrap();
    assert_eq!(config.window.hours, 48);
    assert_eq!(config.sources.enabled, vec!["usgs", "emsc"]);
}

#[test]
#[serial]
fn test_invalid_env_value_is_fatal() {
    std::env::set_var("QUAKE_WINDOW_HOURS", "soon");
    let result = PipelineConfig::load(None);
    std::env::remove_var("QUAKE_WINDOW_HOURS");
    assert!(result.is_err());
}
