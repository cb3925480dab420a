//! Prometheus text exposition
//!
//! Renders a [`MetricsSnapshot`] into the text format served to scrapers.
//! The output is byte-stable for a given snapshot: counters come first in a
//! fixed order, histogram series follow in key order.

use std::fmt::Write;

use super::state::{CounterKind, MetricsSnapshot};

const COUNTERS: [(CounterKind, &str, &str); 3] = [
    (
        CounterKind::Received,
        "task_received_total",
        "Number of received tasks",
    ),
    (
        CounterKind::Succeeded,
        "task_succeeded_total",
        "Number of succeeded tasks",
    ),
    (
        CounterKind::Failed,
        "task_failed_total",
        "Number of failed tasks",
    ),
];

const RUNTIME: &str = "task_runtime_seconds";
const RUNTIME_HELP: &str = "Histogram of task runtime in seconds";

/// Exposition text encoder with a metric-name namespace
#[derive(Debug, Clone)]
pub struct ExpositionEncoder {
    namespace: String,
}

impl Default for ExpositionEncoder {
    fn default() -> Self {
        Self::new("celery")
    }
}

impl ExpositionEncoder {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Fully qualified metric name
    pub fn metric_name(&self, base: &str) -> String {
        if self.namespace.is_empty() {
            base.to_string()
        } else {
            format!("{}_{}", self.namespace, base)
        }
    }

    /// Render a snapshot as exposition text
    pub fn encode(&self, snapshot: &MetricsSnapshot) -> String {
        let mut out = String::with_capacity(512 + snapshot.runtime.len() * 1024);

        for (kind, base, help) in COUNTERS {
            let name = self.metric_name(base);
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", snapshot.counter(kind));
        }

        let name = self.metric_name(RUNTIME);
        let _ = writeln!(out, "# HELP {name} {RUNTIME_HELP}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (key, histogram) in &snapshot.runtime {
            let labels = format!(
                "task_name=\"{}\",state=\"{}\"",
                escape_label(&key.task_name),
                key.state
            );
            for (bound, count) in histogram.bounds().iter().zip(histogram.buckets()) {
                let _ = writeln!(
                    out,
                    "{name}_bucket{{{labels},le=\"{}\"}} {count}",
                    format_float(*bound)
                );
            }
            let _ = writeln!(out, "{name}_sum{{{labels}}} {}", format_float(histogram.sum()));
            let _ = writeln!(out, "{name}_count{{{labels}}} {}", histogram.count());
        }

        out
    }
}

/// Format a float the way Prometheus clients do: `+Inf`, `1.0`, `0.005`
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else if value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

fn escape_label(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}
