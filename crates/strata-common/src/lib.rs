//! Strata Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration, data model and
//! counters used across all Strata components.

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use metrics::IndexerMetrics;
pub use types::*;
