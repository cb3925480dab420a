//! Taskmon Exporter - Task queue metrics exporter
//!
//! Folds task lifecycle events into counters and a runtime histogram,
//! periodically persists them as Prometheus exposition text and serves the
//! stored snapshot to scrapers.

pub mod config;
pub mod event;
pub mod exporter;
pub mod flush;
pub mod metrics;
pub mod store;
pub mod util;

pub use config::Config;
pub use exporter::{Exporter, ExporterSettings, LifecycleError, Phase};

/// Exporter version for display
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
