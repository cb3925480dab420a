//! Exporter lifecycle
//!
//! Owns the shared state, runs the ingestor and the flush scheduler as two
//! independent tasks and performs the final flush on stop.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::event::{EventIngestor, EventSource, IngestorConfig};
use crate::flush::{FlushOutcome, FlushScheduler, Flusher};
use crate::metrics::{ExpositionEncoder, MetricsState};
use crate::store::SnapshotStore;

/// Lifecycle phase of an [`Exporter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Created => "created",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("exporter cannot start while {0}")]
    InvalidPhase(Phase),
}

/// Timing knobs for the two loops
#[derive(Debug, Clone)]
pub struct ExporterSettings {
    pub flush_interval: Duration,
    pub tick: Duration,
    /// Upper bound `stop` waits for each loop
    pub join_timeout: Duration,
    pub ingest: IngestorConfig,
}

impl ExporterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            flush_interval: config.flush.interval(),
            tick: config.flush.tick(),
            join_timeout: config.flush.join_timeout(),
            ingest: config.source.ingestor(),
        }
    }
}

impl Default for ExporterSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Task event exporter
pub struct Exporter {
    settings: ExporterSettings,
    state: Arc<MetricsState>,
    flusher: Arc<Flusher>,
    phase: Mutex<Phase>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Exporter {
    /// Create an exporter in the `Created` phase
    ///
    /// Probes the store for an earlier snapshot and writes the all-zero
    /// state when there is none.
    pub async fn new(
        settings: ExporterSettings,
        state: Arc<MetricsState>,
        store: Arc<dyn SnapshotStore>,
        encoder: ExpositionEncoder,
    ) -> Self {
        let flusher = Arc::new(Flusher::new(state.clone(), store, encoder));
        flusher.probe().await;

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            settings,
            state,
            flusher,
            phase: Mutex::new(Phase::Created),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> &Arc<MetricsState> {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    /// Launch ingestion from `source` and the flush loop
    ///
    /// Returns as soon as both tasks are spawned.
    pub fn start<S>(&self, source: S) -> Result<(), LifecycleError>
    where
        S: EventSource + 'static,
    {
        let mut phase = self.phase.lock();
        if *phase != Phase::Created {
            return Err(LifecycleError::InvalidPhase(*phase));
        }

        let origin = source.describe();
        let ingestor = EventIngestor::new(source, self.state.clone(), self.settings.ingest.clone());
        let scheduler = FlushScheduler::new(
            self.flusher.clone(),
            self.settings.flush_interval,
            self.settings.tick,
        );

        let mut tasks = self.tasks.lock();
        tasks.push(("ingestor", tokio::spawn(ingestor.run(self.shutdown_tx.subscribe()))));
        tasks.push(("scheduler", tokio::spawn(scheduler.run(self.shutdown_tx.subscribe()))));

        *phase = Phase::Running;
        info!(
            source = %origin,
            interval_ms = self.settings.flush_interval.as_millis() as u64,
            "Exporter started"
        );
        Ok(())
    }

    /// Stop both loops and persist whatever they left unflushed
    ///
    /// Safe to call any number of times; only the first call does work.
    pub async fn stop(&self) {
        {
            let mut phase = self.phase.lock();
            match *phase {
                Phase::Stopping | Phase::Stopped => return,
                Phase::Created | Phase::Running => *phase = Phase::Stopping,
            }
        }

        info!("Stopping exporter");
        self.shutdown_tx.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (name, handle) in tasks {
            // A task that misses the deadline is detached, not cancelled.
            match tokio::time::timeout(self.settings.join_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(task = name, error = %e, "Exporter task failed"),
                Err(_) => warn!(
                    task = name,
                    timeout_ms = self.settings.join_timeout.as_millis() as u64,
                    "Task did not stop in time; abandoning it"
                ),
            }
        }

        match self.flusher.flush_if_dirty().await {
            Ok(FlushOutcome::Written(bytes)) => info!(bytes, "Final snapshot persisted"),
            Ok(FlushOutcome::Clean) => {}
            Err(e) => error!(error = %e, "Final snapshot flush failed"),
        }

        *self.phase.lock() = Phase::Stopped;
        info!("Exporter stopped");
    }
}
