//! Aggregate task metrics
//!
//! Counters and the runtime histogram live behind a single lock together
//! with the dirty marker, so every mutation and every snapshot is applied
//! as one indivisible step.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Default runtime bucket bounds in seconds (`+Inf` is appended implicitly)
pub const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

/// Label used when an event does not carry a task name
pub const UNKNOWN_TASK: &str = "unknown";

/// Task lifecycle counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    Received,
    Succeeded,
    Failed,
}

impl CounterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterKind::Received => "received",
            CounterKind::Succeeded => "succeeded",
            CounterKind::Failed => "failed",
        }
    }
}

/// Terminal state label of a runtime observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RunState {
    Success,
    Failure,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Success => "success",
            RunState::Failure => "failure",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected histogram observation
#[derive(Debug, Error, PartialEq)]
pub enum ObserveError {
    #[error("runtime must be a non-negative number of seconds, got {0}")]
    InvalidRuntime(f64),
}

/// Histogram series key: one series per task name and terminal state
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    pub task_name: String,
    pub state: RunState,
}

/// Cumulative-bucket histogram
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    bounds: Arc<[f64]>,
    buckets: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(bounds: Arc<[f64]>) -> Self {
        let buckets = vec![0; bounds.len()];
        Self {
            bounds,
            buckets,
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        for (bound, bucket) in self.bounds.iter().zip(self.buckets.iter_mut()) {
            if value <= *bound {
                *bucket += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }

    /// Upper bounds in ascending order, the last one is `+Inf`
    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    /// Cumulative counts, parallel to [`Histogram::bounds`]
    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Immutable copy of the aggregate at one instant
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub runtime: BTreeMap<SeriesKey, Histogram>,
}

impl MetricsSnapshot {
    pub fn counter(&self, kind: CounterKind) -> u64 {
        match kind {
            CounterKind::Received => self.received,
            CounterKind::Succeeded => self.succeeded,
            CounterKind::Failed => self.failed,
        }
    }

    /// Histogram for one series, if anything was observed for it
    pub fn runtime_for(&self, task_name: &str, state: RunState) -> Option<&Histogram> {
        self.runtime.get(&SeriesKey {
            task_name: task_name.to_string(),
            state,
        })
    }
}

#[derive(Debug, Default)]
struct Inner {
    received: u64,
    succeeded: u64,
    failed: u64,
    runtime: BTreeMap<SeriesKey, Histogram>,
    dirty: bool,
}

impl Inner {
    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received,
            succeeded: self.succeeded,
            failed: self.failed,
            runtime: self.runtime.clone(),
        }
    }
}

/// Shared task metrics
///
/// One instance per process, shared through an `Arc` by the ingestor
/// (mutations) and the flush scheduler (snapshots).
#[derive(Debug)]
pub struct MetricsState {
    inner: Mutex<Inner>,
    bounds: Arc<[f64]>,
}

impl Default for MetricsState {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKETS)
    }
}

impl MetricsState {
    /// Create an all-zero state with the given finite bucket bounds
    pub fn new(buckets: &[f64]) -> Self {
        let mut bounds: Vec<f64> = buckets.iter().copied().filter(|b| b.is_finite()).collect();
        bounds.push(f64::INFINITY);

        Self {
            inner: Mutex::new(Inner::default()),
            bounds: bounds.into(),
        }
    }

    /// Bucket bounds shared by every histogram series
    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    #[inline]
    pub fn increment_counter(&self, kind: CounterKind) {
        let mut inner = self.inner.lock();
        let counter = match kind {
            CounterKind::Received => &mut inner.received,
            CounterKind::Succeeded => &mut inner.succeeded,
            CounterKind::Failed => &mut inner.failed,
        };
        *counter = counter.saturating_add(1);
        inner.dirty = true;
    }

    /// Record a runtime observation for one series
    pub fn observe_runtime(
        &self,
        task_name: &str,
        state: RunState,
        seconds: f64,
    ) -> Result<(), ObserveError> {
        if seconds.is_nan() || seconds < 0.0 {
            return Err(ObserveError::InvalidRuntime(seconds));
        }

        let key = SeriesKey {
            task_name: task_name.to_string(),
            state,
        };
        let mut inner = self.inner.lock();
        inner
            .runtime
            .entry(key)
            .or_insert_with(|| Histogram::new(self.bounds.clone()))
            .observe(seconds);
        inner.dirty = true;
        Ok(())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().snapshot()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    /// Atomically read and clear the dirty flag
    pub fn take_dirty_and_clear(&self) -> bool {
        std::mem::take(&mut self.inner.lock().dirty)
    }

    /// Clear the dirty flag and snapshot in one step; `None` when clean
    pub fn take_dirty_snapshot(&self) -> Option<MetricsSnapshot> {
        let mut inner = self.inner.lock();
        if !std::mem::take(&mut inner.dirty) {
            return None;
        }
        Some(inner.snapshot())
    }

    /// Re-raise the dirty flag after a failed persist
    pub fn mark_dirty(&self) {
        self.inner.lock().dirty = true;
    }
}
