//! HTTP transport with per-source rate limiting and retry
//!
//! A single shared `reqwest` client plus one token bucket per source, the
//! only shared mutable state in the core. Retries use exponential backoff
//! with jitter; every attempt logs its latency and outcome. The per-source
//! deadline is a hard ceiling: when it expires the fetch returns
//! [`FetchError::Timeout`] without further retries.

use crate::sources::{SourceRegistry, SourceSpec};
use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use quake_common::config::{PipelineConfig, RetryConfig};
use quake_common::Result;
use rand::Rng;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Fetch failure kinds; retry policy is decided per kind
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {0} from upstream")]
    Http4xx(u16),

    #[error("HTTP {0} from upstream")]
    Http5xx(u16),

    #[error("rate limited by upstream (HTTP 429)")]
    RateLimited,

    #[error("unknown source tag: {0}")]
    UnknownSource(String),
}

impl FetchError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_) | FetchError::Http5xx(_) | FetchError::RateLimited
        )
    }
}

/// Time window and filters for one event-service query
#[derive(Debug, Clone)]
pub struct FetchQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub min_magnitude: f64,
}

impl FetchQuery {
    const TIME_FORMAT: &'static str = "%Y-%m-%dT%H:%M:%S";

    fn to_params(&self, spec: &SourceSpec) -> Vec<(&'static str, String)> {
        vec![
            ("format", spec.format.query_param().to_string()),
            ("starttime", self.start.format(Self::TIME_FORMAT).to_string()),
            ("endtime", self.end.format(Self::TIME_FORMAT).to_string()),
            ("minmagnitude", self.min_magnitude.to_string()),
            ("orderby", "time".to_string()),
        ]
    }
}

/// Shared HTTP client with per-source token buckets
pub struct TransportClient {
    http: reqwest::Client,
    limiters: HashMap<&'static str, DirectLimiter>,
    specs: HashMap<&'static str, SourceSpec>,
    retry: RetryConfig,
}

impl TransportClient {
    /// Build the client and one token bucket per known source.
    ///
    /// The bucket's refill period is the source's effective poll interval
    /// (registry default, overridable per source in the configuration).
    pub fn new(registry: &SourceRegistry, config: &PipelineConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout.ms))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("quake-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| quake_common::Error::Internal(format!("HTTP client build failed: {}", e)))?;

        let mut limiters = HashMap::new();
        let mut specs = HashMap::new();
        for spec in registry.all() {
            let interval = config
                .poll_interval_for(spec.tag, spec.min_poll_interval.as_secs())
                .max(1);
            let quota = Quota::with_period(Duration::from_secs(interval)).ok_or_else(|| {
                quake_common::Error::Config(format!("invalid poll interval for {}", spec.tag))
            })?;
            limiters.insert(spec.tag, RateLimiter::direct(quota));
            specs.insert(spec.tag, spec.clone());
        }

        Ok(Self {
            http,
            limiters,
            specs,
            retry: config.retry.clone(),
        })
    }

    /// Fetch one payload from a source, honoring its rate limit, retry
    /// budget, and total deadline.
    pub async fn fetch(&self, tag: &str, query: &FetchQuery) -> std::result::Result<Vec<u8>, FetchError> {
        let spec = self
            .specs
            .get(tag)
            .ok_or_else(|| FetchError::UnknownSource(tag.to_string()))?;

        // One token per logical fetch; retries within it are paced by
        // backoff, not the bucket.
        if let Some(limiter) = self.limiters.get(tag) {
            limiter.until_ready().await;
        }

        let deadline = Instant::now() + spec.timeout;
        match tokio::time::timeout_at(deadline, self.fetch_with_retry(spec, query)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(source = tag, timeout_ms = spec.timeout.as_millis() as u64, "fetch deadline exceeded");
                Err(FetchError::Timeout(spec.timeout))
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        spec: &SourceSpec,
        query: &FetchQuery,
    ) -> std::result::Result<Vec<u8>, FetchError> {
        let max_attempts = self.retry.max_attempts.min(spec.max_retries) + 1;
        let mut last_error = FetchError::Network("no attempt made".to_string());

        for attempt in 1..=max_attempts {
            match self.attempt(spec, query, attempt).await {
                Ok(bytes) => return Ok(bytes),
                Err(error) => {
                    if !error.is_retryable() || attempt == max_attempts {
                        return Err(error);
                    }
                    let delay = self.backoff_delay(attempt);
                    debug!(
                        source = spec.tag,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after backoff"
                    );
                    last_error = error;
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(last_error)
    }

    async fn attempt(
        &self,
        spec: &SourceSpec,
        query: &FetchQuery,
        attempt: u32,
    ) -> std::result::Result<Vec<u8>, FetchError> {
        let started = Instant::now();
        let result = self
            .http
            .get(&spec.base_url)
            .query(&query.to_params(spec))
            .send()
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(source = spec.tag, attempt, latency_ms, error = %e, "fetch attempt failed");
                return Err(FetchError::Network(e.to_string()));
            }
        };

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            // FDSN services answer an empty window with 204
            info!(source = spec.tag, attempt, latency_ms, status = 204, "fetch ok (no content)");
            return Ok(spec.format.empty_payload().to_vec());
        }
        if status.is_success() {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| FetchError::Network(e.to_string()))?;
            info!(
                source = spec.tag,
                attempt,
                latency_ms,
                status = status.as_u16(),
                bytes = bytes.len(),
                "fetch ok"
            );
            return Ok(bytes.to_vec());
        }

        warn!(
            source = spec.tag,
            attempt,
            latency_ms,
            status = status.as_u16(),
            "fetch attempt failed"
        );
        Err(match status.as_u16() {
            429 => FetchError::RateLimited,
            code if status.is_server_error() => FetchError::Http5xx(code),
            code => FetchError::Http4xx(code),
        })
    }

    /// Exponential backoff starting at `base_ms`, doubling per attempt,
    /// capped at `cap_ms`, with ±20% jitter
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.retry.base_ms.saturating_mul(1u64 << (attempt - 1).min(30));
        let capped = base.min(self.retry.cap_ms) as f64;
        let jittered = capped * rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_millis(jittered as u64)
    }
}
