//! Task event ingestion
//!
//! Event model, sources and the ingestion loop that folds events into the
//! shared metrics state.

mod ingestor;
mod model;
mod source;

pub use ingestor::{Applied, EventIngestor, IngestorConfig};
pub use model::{EventKind, Malformed, RawEvent, TaskEvent};
pub use source::{read_json_event, ChannelSource, EventSource, SourceError, TcpJsonSource};
