//! Task lifecycle events

use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Event kind, classified from the queue's `type` field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Received,
    Succeeded,
    Failed,
    Unknown(String),
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "task-received" => EventKind::Received,
            "task-succeeded" => EventKind::Succeeded,
            "task-failed" => EventKind::Failed,
            other => EventKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Received => "task-received",
            EventKind::Succeeded => "task-succeeded",
            EventKind::Failed => "task-failed",
            EventKind::Unknown(other) => other,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event as delivered on the wire; every field may be missing
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub runtime: Option<f64>,
}

impl RawEvent {
    pub fn new(event_type: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            uuid: Some(uuid.into()),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_runtime(mut self, seconds: f64) -> Self {
        self.runtime = Some(seconds);
        self
    }
}

/// Why an event could not be classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Malformed {
    #[error("missing event type")]
    MissingType,
    #[error("missing task id")]
    MissingId,
}

/// Classified task event
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub kind: EventKind,
    pub id: String,
    pub task_name: Option<String>,
    pub runtime_seconds: Option<f64>,
}

impl TryFrom<RawEvent> for TaskEvent {
    type Error = Malformed;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let event_type = raw.event_type.ok_or(Malformed::MissingType)?;
        let id = raw
            .uuid
            .filter(|id| !id.is_empty())
            .ok_or(Malformed::MissingId)?;

        Ok(TaskEvent {
            kind: EventKind::from_type(&event_type),
            id,
            task_name: raw.name.filter(|name| !name.is_empty()),
            runtime_seconds: raw.runtime,
        })
    }
}
