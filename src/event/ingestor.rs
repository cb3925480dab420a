//! Event ingestion loop
//!
//! Pulls events from the source in delivery order and applies each one to
//! the shared [`MetricsState`]. Every mutation has been published by the
//! time [`EventIngestor::apply`] returns.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::model::{EventKind, RawEvent, TaskEvent};
use super::source::EventSource;
use crate::metrics::{telemetry, CounterKind, MetricsState, RunState, UNKNOWN_TASK};
use crate::util::Backoff;

/// Ingestor settings
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    /// Reconnect after the source drops the connection
    pub reconnect: bool,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Maximum number of task ids remembered for name lookup
    pub name_cache_capacity: usize,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            reconnect: true,
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(30),
            name_cache_capacity: 10_000,
        }
    }
}

/// Result of applying a single event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// State was mutated
    Counted,
    /// Well-formed event of a kind we do not track
    Ignored,
    /// Malformed event, state untouched
    Dropped,
}

/// Task names announced by `task-received`, keyed by task id
///
/// Bounded; the oldest ids are forgotten first.
#[derive(Debug)]
struct NameRegistry {
    names: HashMap<String, String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl NameRegistry {
    fn new(capacity: usize) -> Self {
        Self {
            names: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn remember(&mut self, id: &str, name: &str) {
        if self.capacity == 0 {
            return;
        }
        if self.names.insert(id.to_string(), name.to_string()).is_none() {
            self.order.push_back(id.to_string());
        }
        while self.names.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.names.remove(&oldest);
                }
                None => break,
            }
        }
        // Ids already forgotten by `take` linger in `order`; keep it bounded.
        if self.order.len() > self.capacity.saturating_mul(2) {
            let names = &self.names;
            self.order.retain(|id| names.contains_key(id));
        }
    }

    fn take(&mut self, id: &str) -> Option<String> {
        self.names.remove(id)
    }

    fn len(&self) -> usize {
        self.names.len()
    }
}

/// Applies task events from one source to the shared state
pub struct EventIngestor<S> {
    source: S,
    state: Arc<MetricsState>,
    config: IngestorConfig,
    names: NameRegistry,
}

impl<S: EventSource> EventIngestor<S> {
    pub fn new(source: S, state: Arc<MetricsState>, config: IngestorConfig) -> Self {
        let names = NameRegistry::new(config.name_cache_capacity);
        Self {
            source,
            state,
            config,
            names,
        }
    }

    /// Classify one raw event and apply it
    pub fn apply(&mut self, raw: RawEvent) -> Applied {
        let event = match TaskEvent::try_from(raw) {
            Ok(event) => event,
            Err(reason) => {
                debug!(%reason, "Dropping malformed event");
                telemetry::event_dropped("malformed");
                return Applied::Dropped;
            }
        };

        match event.kind {
            EventKind::Received => {
                if let Some(name) = &event.task_name {
                    self.names.remember(&event.id, name);
                }
                self.state.increment_counter(CounterKind::Received);
                telemetry::event_applied("received");
            }
            EventKind::Succeeded => {
                self.state.increment_counter(CounterKind::Succeeded);
                self.record_runtime(&event, RunState::Success);
                telemetry::event_applied("succeeded");
            }
            EventKind::Failed => {
                self.state.increment_counter(CounterKind::Failed);
                self.record_runtime(&event, RunState::Failure);
                telemetry::event_applied("failed");
            }
            EventKind::Unknown(ref kind) => {
                debug!(task_id = %event.id, %kind, "Ignoring untracked event kind");
                telemetry::event_dropped("unrecognized");
                return Applied::Ignored;
            }
        }

        Applied::Counted
    }

    fn record_runtime(&mut self, event: &TaskEvent, state: RunState) {
        let remembered = self.names.take(&event.id);
        let Some(seconds) = event.runtime_seconds else {
            return;
        };

        let task_name = event
            .task_name
            .as_deref()
            .or(remembered.as_deref())
            .unwrap_or(UNKNOWN_TASK);

        if let Err(e) = self.state.observe_runtime(task_name, state, seconds) {
            warn!(task_id = %event.id, task_name, error = %e, "Rejected runtime observation");
            telemetry::event_dropped("invalid_runtime");
        }
    }

    /// Run until the stop signal fires or the source ends
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let origin = self.source.describe();
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);
        let mut connected = false;

        info!(source = %origin, "Event ingestor started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !connected {
                let attempt = tokio::select! {
                    result = self.source.connect() => result,
                    _ = shutdown.changed() => break,
                };
                match attempt {
                    Ok(()) => connected = true,
                    Err(e) => {
                        if !self.config.reconnect {
                            error!(source = %origin, error = %e, "Event source unavailable; ingestion stopped");
                            break;
                        }
                        let delay = backoff.next_delay();
                        warn!(source = %origin, error = %e, retry_in_ms = delay.as_millis() as u64, "Event source unavailable");
                        if wait_or_shutdown(delay, &mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            // Prefer a ready event over the stop signal so nothing already
            // delivered is left unapplied.
            let next = tokio::select! {
                biased;
                result = self.source.next_event() => result,
                _ = shutdown.changed() => break,
            };

            match next {
                Ok(Some(raw)) => {
                    backoff.reset();
                    self.apply(raw);
                }
                Ok(None) => {
                    info!(source = %origin, "Event source exhausted");
                    break;
                }
                Err(e) => {
                    connected = false;
                    if !self.config.reconnect {
                        error!(source = %origin, error = %e, "Event source lost; ingestion stopped");
                        break;
                    }
                    telemetry::source_reconnect();
                    let delay = backoff.next_delay();
                    warn!(source = %origin, error = %e, retry_in_ms = delay.as_millis() as u64, "Reconnecting to event source");
                    if wait_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        if *shutdown.borrow() {
            self.drain_ready(connected, &origin).await;
        }

        info!(source = %origin, pending_names = self.names.len(), "Event ingestor stopped");
    }

    /// Apply every event the source can hand over without waiting
    ///
    /// Runs once the stop signal is seen, so events delivered before
    /// `stop` are covered by the final flush.
    async fn drain_ready(&mut self, connected: bool, origin: &str) {
        if !connected {
            match tokio::time::timeout(Duration::ZERO, self.source.connect()).await {
                Ok(Ok(())) => {}
                _ => return,
            }
        }

        // The coop budget can make a ready source look empty, so drain in
        // batches and yield between them until a batch comes back empty.
        let mut drained = 0u64;
        loop {
            let mut batch = 0u64;
            while let Ok(Ok(Some(raw))) =
                tokio::time::timeout(Duration::ZERO, self.source.next_event()).await
            {
                self.apply(raw);
                batch += 1;
            }
            if batch == 0 {
                break;
            }
            drained += batch;
            tokio::task::yield_now().await;
        }
        if drained > 0 {
            debug!(source = %origin, drained, "Applied buffered events on stop");
        }
    }
}

/// Sleep for `delay`; returns true if the stop signal fired first
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
        _ = shutdown.changed() => true,
    }
}
