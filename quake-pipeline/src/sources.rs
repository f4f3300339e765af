//! Source registry for seismological agencies
//!
//! A read-only table of the known agencies: endpoint, wire format, rate
//! limits, and priority weights. Loaded once at startup; no mutation path.

use crate::geo::Region;
use quake_common::config::PipelineConfig;
use quake_common::{Error, Result};
use std::time::Duration;

/// Wire format served by a source's event endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceFormat {
    /// GeoJSON FeatureCollection, USGS property names, epoch-ms times
    GeojsonUsgs,
    /// GeoJSON FeatureCollection, EMSC/SeismicPortal property names, ISO times
    GeojsonEmsc,
    /// Pipe-delimited FDSN `format=text` response
    FdsnText,
    /// QuakeML 1.2 XML
    Quakeml,
}

impl SourceFormat {
    /// Tag used in configuration and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::GeojsonUsgs => "geojson_usgs",
            SourceFormat::GeojsonEmsc => "geojson_emsc",
            SourceFormat::FdsnText => "fdsn_text",
            SourceFormat::Quakeml => "quakeml",
        }
    }

    /// FDSN `format=` query parameter value for this wire format
    pub fn query_param(&self) -> &'static str {
        match self {
            SourceFormat::GeojsonUsgs => "geojson",
            SourceFormat::GeojsonEmsc => "json",
            SourceFormat::FdsnText => "text",
            SourceFormat::Quakeml => "xml",
        }
    }

    /// Body an FDSN service semantically returns for HTTP 204 No Content
    pub fn empty_payload(&self) -> &'static [u8] {
        match self {
            SourceFormat::GeojsonUsgs | SourceFormat::GeojsonEmsc => {
                br#"{"type":"FeatureCollection","features":[]}"#
            }
            SourceFormat::FdsnText | SourceFormat::Quakeml => b"",
        }
    }
}

impl std::fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static descriptor of one agency
#[derive(Debug, Clone)]
pub struct SourceSpec {
    /// Lowercase tag, e.g. "usgs"
    pub tag: &'static str,
    /// FDSN event-query endpoint
    pub base_url: String,
    pub format: SourceFormat,
    /// Token-bucket refill period and default poll cadence
    pub min_poll_interval: Duration,
    /// Total fetch deadline
    pub timeout: Duration,
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Tie-breaker rank when no region table applies (lower = higher priority)
    pub global_priority_rank: u32,
    /// Regions this agency has authoritative coverage for
    pub supported_regions: &'static [Region],
}

/// Read-only registry of all known sources, keyed by tag
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    specs: Vec<SourceSpec>,
}

impl SourceRegistry {
    /// Registry over an explicit spec table (custom mirrors, tests)
    pub fn new(specs: Vec<SourceSpec>) -> Self {
        Self { specs }
    }

    /// The built-in agency table
    pub fn builtin() -> Self {
        use Region::*;
        let specs = vec![
            SourceSpec {
                tag: "usgs",
                base_url: "https://earthquake.usgs.gov/fdsnws/event/1/query".into(),
                format: SourceFormat::GeojsonUsgs,
                min_poll_interval: Duration::from_secs(60),
                timeout: Duration::from_secs(15),
                max_retries: 3,
                global_priority_rank: 0,
                supported_regions: &[Americas, Europe, Africa, AsiaPacific],
            },
            SourceSpec {
                tag: "emsc",
                base_url: "https://seismicportal.eu/fdsnws/event/1/query".into(),
                format: SourceFormat::GeojsonEmsc,
                min_poll_interval: Duration::from_secs(120),
                timeout: Duration::from_secs(20),
                max_retries: 3,
                global_priority_rank: 1,
                supported_regions: &[Europe, Africa, Americas],
            },
            SourceSpec {
                tag: "gfz",
                base_url: "https://geofon.gfz.de/fdsnws/event/1/query".into(),
                format: SourceFormat::FdsnText,
                min_poll_interval: Duration::from_secs(180),
                timeout: Duration::from_secs(20),
                max_retries: 3,
                global_priority_rank: 2,
                supported_regions: &[Europe, Americas, AsiaPacific],
            },
            SourceSpec {
                tag: "isc",
                base_url: "https://www.isc.ac.uk/fdsnws/event/1/query".into(),
                format: SourceFormat::Quakeml,
                min_poll_interval: Duration::from_secs(300),
                timeout: Duration::from_secs(30),
                max_retries: 3,
                global_priority_rank: 3,
                supported_regions: &[Africa, AsiaPacific, Europe],
            },
            SourceSpec {
                tag: "ipgp",
                base_url: "https://datacenter.ipgp.fr/fdsnws/event/1/query".into(),
                format: SourceFormat::FdsnText,
                min_poll_interval: Duration::from_secs(300),
                timeout: Duration::from_secs(20),
                max_retries: 3,
                global_priority_rank: 4,
                supported_regions: &[Europe, Africa],
            },
            SourceSpec {
                tag: "geonet",
                base_url: "https://service.geonet.org.nz/fdsnws/event/1/query".into(),
                format: SourceFormat::FdsnText,
                min_poll_interval: Duration::from_secs(120),
                timeout: Duration::from_secs(20),
                max_retries: 3,
                global_priority_rank: 5,
                supported_regions: &[AsiaPacific],
            },
        ];
        Self { specs }
    }

    pub fn get(&self, tag: &str) -> Option<&SourceSpec> {
        self.specs.iter().find(|s| s.tag == tag)
    }

    pub fn all(&self) -> &[SourceSpec] {
        &self.specs
    }

    /// Specs enabled by the configuration, in registry order.
    ///
    /// An unknown tag in `sources.enabled` is a configuration error.
    pub fn enabled<'a>(&'a self, config: &PipelineConfig) -> Result<Vec<&'a SourceSpec>> {
        for tag in &config.sources.enabled {
            if self.get(tag).is_none() {
                return Err(Error::Config(format!("unknown source tag: {}", tag)));
            }
        }
        Ok(self
            .specs
            .iter()
            .filter(|s| config.sources.enabled.iter().any(|t| t == s.tag))
            .collect())
    }
}
