//! Self-telemetry exporter
//!
//! The exporter's own health counters go through the `metrics` facade and
//! are served by the Prometheus recorder on a separate endpoint. Without an
//! installed recorder every call here is a no-op.

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;

use crate::config::TelemetryConfig;

const EVENTS_TOTAL: &str = "taskmon_events_total";
const EVENTS_DROPPED_TOTAL: &str = "taskmon_events_dropped_total";
const FLUSHES_TOTAL: &str = "taskmon_flushes_total";
const FLUSH_FAILURES_TOTAL: &str = "taskmon_flush_failures_total";
const FLUSH_DURATION_SECONDS: &str = "taskmon_flush_duration_seconds";
const SOURCE_RECONNECTS_TOTAL: &str = "taskmon_source_reconnects_total";

/// Install the Prometheus recorder and its HTTP listener
pub fn init_telemetry(config: &TelemetryConfig) -> Result<()> {
    describe_counter!(EVENTS_TOTAL, "Task events applied to the aggregate");
    describe_counter!(EVENTS_DROPPED_TOTAL, "Task events dropped before aggregation");
    describe_counter!(FLUSHES_TOTAL, "Snapshots written to the store");
    describe_counter!(FLUSH_FAILURES_TOTAL, "Snapshot writes that failed");
    describe_histogram!(FLUSH_DURATION_SECONDS, "Time spent writing one snapshot");
    describe_counter!(SOURCE_RECONNECTS_TOTAL, "Event source reconnect attempts");

    PrometheusBuilder::new()
        .with_http_listener(config.bind_addr)
        .install()?;

    Ok(())
}

#[inline]
pub(crate) fn event_applied(kind: &'static str) {
    counter!(EVENTS_TOTAL, "kind" => kind).increment(1);
}

#[inline]
pub(crate) fn event_dropped(reason: &'static str) {
    counter!(EVENTS_DROPPED_TOTAL, "reason" => reason).increment(1);
}

pub(crate) fn flush_succeeded(elapsed: Duration) {
    counter!(FLUSHES_TOTAL).increment(1);
    histogram!(FLUSH_DURATION_SECONDS).record(elapsed.as_secs_f64());
}

pub(crate) fn flush_failed() {
    counter!(FLUSH_FAILURES_TOTAL).increment(1);
}

pub(crate) fn source_reconnect() {
    counter!(SOURCE_RECONNECTS_TOTAL).increment(1);
}
