//! Sanity checks on canonical records before they enter the raw log
//!
//! Records failing any check are routed to the dead-letter sink with the
//! original bytes preserved; valid records flow onward unchanged.

use chrono::{DateTime, Duration, Utc};
use quake_common::models::NormalizedEvent;

pub const LAT_RANGE: (f64, f64) = (-90.0, 90.0);
pub const LON_RANGE: (f64, f64) = (-180.0, 180.0);
pub const DEPTH_RANGE_KM: (f64, f64) = (-5.0, 1000.0);
pub const MAGNITUDE_RANGE: (f64, f64) = (-2.0, 11.0);

/// Maximum tolerated clock skew into the future
const MAX_FUTURE_DAYS: i64 = 1;
/// Historical catalogs reach back a couple of centuries at most
const MAX_PAST_DAYS: i64 = 73_050; // 200 years

/// One validation failure, rendered as a human-readable message
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationIssue {
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    MissingField {
        field: &'static str,
    },
    BadTimestamp {
        detail: String,
    },
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationIssue::OutOfRange {
                field,
                value,
                min,
                max,
            } => write!(f, "{} {} out of range [{}, {}]", field, value, min, max),
            ValidationIssue::MissingField { field } => write!(f, "{} is missing or empty", field),
            ValidationIssue::BadTimestamp { detail } => write!(f, "origin_time_utc {}", detail),
        }
    }
}

/// Validate a canonical record. Empty result = valid.
///
/// `now` is injected so batch replays and tests are deterministic.
pub fn validate(event: &NormalizedEvent, now: DateTime<Utc>) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    check_range(&mut issues, "latitude", event.latitude, LAT_RANGE);
    check_range(&mut issues, "longitude", event.longitude, LON_RANGE);
    check_range(&mut issues, "depth_km", event.depth_km, DEPTH_RANGE_KM);
    check_range(
        &mut issues,
        "magnitude_value",
        event.magnitude_value,
        MAGNITUDE_RANGE,
    );

    if event.source.trim().is_empty() {
        issues.push(ValidationIssue::MissingField { field: "source" });
    }
    if event.source_event_id.trim().is_empty() {
        issues.push(ValidationIssue::MissingField {
            field: "source_event_id",
        });
    }
    if event.magnitude_type.trim().is_empty() {
        issues.push(ValidationIssue::MissingField {
            field: "magnitude_type",
        });
    }

    if event.origin_time_utc > now + Duration::days(MAX_FUTURE_DAYS) {
        issues.push(ValidationIssue::BadTimestamp {
            detail: format!("{} is more than 1 day in the future", event.origin_time_utc),
        });
    } else if event.origin_time_utc < now - Duration::days(MAX_PAST_DAYS) {
        issues.push(ValidationIssue::BadTimestamp {
            detail: format!(
                "{} is more than 200 years in the past",
                event.origin_time_utc
            ),
        });
    }

    issues
}

fn check_range(
    issues: &mut Vec<ValidationIssue>,
    field: &'static str,
    value: f64,
    (min, max): (f64, f64),
) {
    if !value.is_finite() || value < min || value > max {
        issues.push(ValidationIssue::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
}
