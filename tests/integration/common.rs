//! Shared helpers

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use taskmon_exporter::event::IngestorConfig;
use taskmon_exporter::metrics::{ExpositionEncoder, MetricsState};
use taskmon_exporter::store::{MemoryStore, SnapshotStore};
use taskmon_exporter::{Exporter, ExporterSettings};

pub fn settings(interval: Duration, tick: Duration) -> ExporterSettings {
    ExporterSettings {
        flush_interval: interval,
        tick,
        join_timeout: Duration::from_secs(1),
        ingest: IngestorConfig::default(),
    }
}

pub async fn exporter_with(store: Arc<dyn SnapshotStore>, settings: ExporterSettings) -> Exporter {
    Exporter::new(
        settings,
        Arc::new(MetricsState::default()),
        store,
        ExpositionEncoder::default(),
    )
    .await
}

pub async fn memory_exporter(interval: Duration) -> (Exporter, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let exporter = exporter_with(store.clone(), settings(interval, Duration::from_millis(10))).await;
    (exporter, store)
}

/// Parse exposition text into `series -> value`, skipping comments
pub fn parse_exposition(text: &str) -> HashMap<String, f64> {
    text.lines()
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            let (series, value) = line.rsplit_once(' ').expect("sample line");
            let value = match value {
                "+Inf" => f64::INFINITY,
                v => v.parse().expect("numeric sample"),
            };
            (series.to_string(), value)
        })
        .collect()
}

pub fn stored(store: &MemoryStore) -> HashMap<String, f64> {
    let blob = store.current().expect("snapshot stored");
    parse_exposition(std::str::from_utf8(&blob).expect("utf-8 snapshot"))
}
