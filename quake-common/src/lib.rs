//! # Quake Common Library
//!
//! Shared code for the quake event-fusion pipeline:
//! - Canonical data model (normalized, unified, crosswalk, dead-letter rows)
//! - Error types
//! - Configuration loading
//! - Store (sink) contracts and the in-memory store used by tests
//! - Timestamp utilities

pub mod config;
pub mod error;
pub mod models;
pub mod store;
pub mod time;

pub use error::{Error, IntegrityError, Result};
