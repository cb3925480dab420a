//! Utility modules

mod backoff;
mod tracing_setup;

pub use backoff::Backoff;
pub use tracing_setup::init_tracing;
