//! Task metrics
//!
//! Aggregate state mutated by the ingestor, its Prometheus text encoding,
//! the scrape endpoint serving stored snapshots, and the exporter's own
//! telemetry.

mod api;
mod encoder;
mod state;
pub mod telemetry;

pub use api::{join_scrape_server, route, serve_scrapes, start_scrape_server, BasicAuth, Response};
pub use encoder::{format_float, ExpositionEncoder};
pub use state::*;
pub use telemetry::init_telemetry;
