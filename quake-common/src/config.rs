//! Configuration loading for the pipeline
//!
//! Resolution priority: environment variables > TOML file > built-in
//! defaults. A missing config file is not fatal (defaults apply); an invalid
//! one is, as are out-of-range values caught by [`PipelineConfig::validate`].

use crate::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Environment variable prefix for overrides
const ENV_PREFIX: &str = "QUAKE_";

/// Top-level pipeline configuration
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub sources: SourcesConfig,
    pub poll: PollConfig,
    pub window: WindowConfig,
    pub cluster: ClusterConfig,
    #[serde(rename = "match")]
    pub matching: MatchConfig,
    pub scoring: ScoringConfig,
    pub retry: RetryConfig,
    pub timeout: TimeoutConfig,
    pub fusion: FusionConfig,
    pub fetch: FetchConfig,
}

/// Which of the known source tags are polled
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourcesConfig {
    pub enabled: Vec<String>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            enabled: vec!["usgs".into(), "emsc".into(), "gfz".into()],
        }
    }
}

/// Per-source minimum poll interval overrides, seconds
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollConfig {
    pub interval: HashMap<String, u64>,
}

/// Clustering window width
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    pub hours: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self { hours: 24 }
    }
}

/// Spatial/temporal clustering parameters
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Neighborhood radius for spatial grouping, km
    pub eps_km: f64,
    /// Maximum origin-time difference within one cluster, seconds
    pub dt_s: f64,
    /// Maximum magnitude difference within one cluster
    pub dmag: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            eps_km: 100.0,
            dt_s: 30.0,
            dmag: 0.5,
        }
    }
}

/// Cluster-consistency threshold
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MatchConfig {
    pub threshold: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self { threshold: 0.6 }
    }
}

/// Match-score component weights, must sum to 1
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoringWeights,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
        }
    }
}

/// Weighted similarity components for the match scorer
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringWeights {
    pub time: f64,
    pub distance: f64,
    pub magnitude: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            time: 0.4,
            distance: 0.4,
            magnitude: 0.2,
        }
    }
}

/// Transport retry policy
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the initial attempt
    pub max_attempts: u32,
    /// Initial backoff, doubled per retry
    pub base_ms: u64,
    /// Backoff ceiling
    pub cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_ms: 1000,
            cap_ms: 30_000,
        }
    }
}

/// Per-source total fetch deadline
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { ms: 15_000 }
    }
}

/// Worker-mode fusion cadence
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FusionConfig {
    pub interval_secs: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

/// Upstream fetch filters
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    pub min_magnitude: f64,
}

impl PipelineConfig {
    /// Load configuration: built-in defaults, then TOML, then environment.
    ///
    /// A missing TOML file logs a warning and falls back to defaults; a
    /// malformed one is a startup failure.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)?;
                let config: PipelineConfig = toml::from_str(&content)
                    .map_err(|e| Error::Config(format!("parse {}: {}", path.display(), e)))?;
                info!("Configuration loaded from {}", path.display());
                config
            }
            Some(path) => {
                warn!(
                    "Config file {} not found, using defaults",
                    path.display()
                );
                PipelineConfig::default()
            }
            None => PipelineConfig::default(),
        };

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `QUAKE_*` environment overrides
    fn apply_env(&mut self) -> Result<()> {
        if let Some(enabled) = env_var("SOURCES_ENABLED") {
            self.sources.enabled = enabled
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(hours) = env_var("WINDOW_HOURS") {
            self.window.hours = parse_env("WINDOW_HOURS", &hours)?;
        }
        if let Some(threshold) = env_var("MATCH_THRESHOLD") {
            self.matching.threshold = parse_env("MATCH_THRESHOLD", &threshold)?;
        }
        if let Some(ms) = env_var("TIMEOUT_MS") {
            self.timeout.ms = parse_env("TIMEOUT_MS", &ms)?;
        }
        if let Some(attempts) = env_var("RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env("RETRY_MAX_ATTEMPTS", &attempts)?;
        }
        if let Some(secs) = env_var("FUSION_INTERVAL_SECS") {
            self.fusion.interval_secs = parse_env("FUSION_INTERVAL_SECS", &secs)?;
        }
        Ok(())
    }

    /// Validate ranges; any failure is fatal at startup
    pub fn validate(&self) -> Result<()> {
        if self.sources.enabled.is_empty() {
            return Err(Error::Config("sources.enabled is empty".into()));
        }
        let w = &self.scoring.weights;
        if w.time < 0.0 || w.distance < 0.0 || w.magnitude < 0.0 {
            return Err(Error::Config("scoring weights must be non-negative".into()));
        }
        let sum = w.time + w.distance + w.magnitude;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(Error::Config(format!(
                "scoring weights must sum to 1, got {}",
                sum
            )));
        }
        if self.cluster.eps_km <= 0.0 || self.cluster.dt_s <= 0.0 || self.cluster.dmag <= 0.0 {
            return Err(Error::Config("cluster parameters must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.matching.threshold) {
            return Err(Error::Config(format!(
                "match.threshold {} outside [0, 1]",
                self.matching.threshold
            )));
        }
        if self.retry.base_ms == 0 || self.retry.cap_ms < self.retry.base_ms {
            return Err(Error::Config(
                "retry.base_ms must be positive and <= retry.cap_ms".into(),
            ));
        }
        if self.timeout.ms == 0 {
            return Err(Error::Config("timeout.ms must be positive".into()));
        }
        if self.window.hours == 0 {
            return Err(Error::Config("window.hours must be positive".into()));
        }
        Ok(())
    }

    /// Effective poll interval for a source, seconds
    pub fn poll_interval_for(&self, tag: &str, registry_default: u64) -> u64 {
        self.poll
            .interval
            .get(tag)
            .copied()
            .unwrap_or(registry_default)
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, suffix)).ok()
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::Config(format!("invalid {}{}: {:?}", ENV_PREFIX, name, raw)))
}
