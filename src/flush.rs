//! Snapshot flushing
//!
//! [`Flusher`] turns the dirty state into one store write. [`FlushScheduler`]
//! drives it on a fixed interval, so any number of mutations inside one
//! interval cost a single write and a clean state costs none.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::metrics::{telemetry, ExpositionEncoder, MetricsState};
use crate::store::{SnapshotStore, StoreError};

/// Outcome of a flush attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing changed since the last successful write
    Clean,
    /// Snapshot of this many bytes was written
    Written(usize),
}

/// Writes encoded snapshots of the shared state to the store
///
/// All writes go through one guard, so two flushes never overlap.
pub struct Flusher {
    state: Arc<MetricsState>,
    store: Arc<dyn SnapshotStore>,
    encoder: ExpositionEncoder,
    guard: Mutex<()>,
}

impl Flusher {
    pub fn new(state: Arc<MetricsState>, store: Arc<dyn SnapshotStore>, encoder: ExpositionEncoder) -> Self {
        Self {
            state,
            store,
            encoder,
            guard: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Persist a snapshot if the state is dirty
    ///
    /// On failure the dirty flag is raised again so the mutations are
    /// picked up by a later attempt.
    pub async fn flush_if_dirty(&self) -> Result<FlushOutcome, StoreError> {
        let _guard = self.guard.lock().await;

        let Some(snapshot) = self.state.take_dirty_snapshot() else {
            return Ok(FlushOutcome::Clean);
        };
        let blob = Bytes::from(self.encoder.encode(&snapshot));
        let size = blob.len();

        let started = Instant::now();
        match self.store.put(blob).await {
            Ok(()) => {
                telemetry::flush_succeeded(started.elapsed());
                debug!(
                    bytes = size,
                    received = snapshot.received,
                    succeeded = snapshot.succeeded,
                    failed = snapshot.failed,
                    "Snapshot persisted"
                );
                Ok(FlushOutcome::Written(size))
            }
            Err(e) => {
                self.state.mark_dirty();
                telemetry::flush_failed();
                Err(e)
            }
        }
    }

    /// Check for a snapshot left by an earlier process
    ///
    /// An existing snapshot is only reported; counters always start from
    /// zero. When none exists the current (all-zero) state is written so
    /// scrapers see every metric family right away.
    pub async fn probe(&self) {
        let store = self.store.describe();
        match self.store.get().await {
            Ok(Some(existing)) => {
                info!(%store, bytes = existing.len(), "Found existing snapshot; starting from zero");
            }
            Ok(None) => {
                self.state.mark_dirty();
                match self.flush_if_dirty().await {
                    Ok(_) => info!(%store, "Stored initial snapshot"),
                    Err(e) => warn!(%store, error = %e, "Failed to store initial snapshot"),
                }
            }
            Err(e) => warn!(%store, error = %e, "Snapshot store unreachable at start-up"),
        }
    }
}

/// Default wake-up tick for a flush interval
pub fn default_tick(interval: Duration) -> Duration {
    (interval / 2)
        .min(Duration::from_millis(100))
        .max(Duration::from_millis(1))
}

/// Interval-driven, dirty-gated flush loop
pub struct FlushScheduler {
    flusher: Arc<Flusher>,
    interval: Duration,
    tick: Duration,
}

impl FlushScheduler {
    pub fn new(flusher: Arc<Flusher>, interval: Duration, tick: Duration) -> Self {
        Self {
            flusher,
            interval,
            tick: tick.max(Duration::from_millis(1)),
        }
    }

    /// Run until the stop signal fires
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            tick_ms = self.tick.as_millis() as u64,
            store = %self.flusher.store().describe(),
            "Flush scheduler started"
        );

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_flush = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            if last_flush.elapsed() < self.interval {
                continue;
            }

            match self.flusher.flush_if_dirty().await {
                Ok(_) => last_flush = Instant::now(),
                Err(e) => {
                    warn!(error = %e, "Snapshot flush failed; will retry");
                }
            }
        }

        info!("Flush scheduler stopped");
    }
}
