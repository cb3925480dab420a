//! Event sources
//!
//! A source yields raw events one at a time. `Ok(None)` is a clean end of
//! stream and stops ingestion; an error means the connection was lost and
//! the ingestor may reconnect.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::model::RawEvent;
use crate::metrics::telemetry;

/// Event source failures
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to connect to event source {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connection to event source timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("event source closed the connection")]
    Disconnected,

    #[error("event source I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Stream of raw task events
#[async_trait]
pub trait EventSource: Send {
    /// (Re)establish the connection; sources without one succeed trivially
    async fn connect(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Wait for the next event
    async fn next_event(&mut self) -> Result<Option<RawEvent>, SourceError>;

    /// Human-readable origin for logs
    fn describe(&self) -> String;
}

/// In-process source fed through an mpsc channel
pub struct ChannelSource {
    rx: mpsc::Receiver<RawEvent>,
}

impl ChannelSource {
    /// Create a bounded channel and the source draining it
    pub fn channel(capacity: usize) -> (mpsc::Sender<RawEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn next_event(&mut self) -> Result<Option<RawEvent>, SourceError> {
        Ok(self.rx.recv().await)
    }

    fn describe(&self) -> String {
        "channel".to_string()
    }
}

/// Read the next decodable JSON event from a line-oriented stream
///
/// Blank and undecodable lines are skipped. End of input is reported as
/// [`SourceError::Disconnected`].
pub async fn read_json_event<R>(reader: &mut R, line: &mut String) -> Result<RawEvent, SourceError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        line.clear();
        if reader.read_line(line).await? == 0 {
            return Err(SourceError::Disconnected);
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<RawEvent>(trimmed) {
            Ok(event) => return Ok(event),
            Err(e) => {
                debug!(error = %e, "Skipping undecodable event line");
                telemetry::event_dropped("undecodable");
            }
        }
    }
}

/// Newline-delimited JSON events over TCP
pub struct TcpJsonSource {
    addr: String,
    connect_timeout: Duration,
    reader: Option<BufReader<TcpStream>>,
    line: String,
}

impl TcpJsonSource {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            reader: None,
            line: String::with_capacity(512),
        }
    }
}

#[async_trait]
impl EventSource for TcpJsonSource {
    async fn connect(&mut self) -> Result<(), SourceError> {
        self.reader = None;

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| SourceError::ConnectTimeout(self.connect_timeout))?
            .map_err(|source| SourceError::Connect {
                addr: self.addr.clone(),
                source,
            })?;

        info!(addr = %self.addr, "Connected to event source");
        self.reader = Some(BufReader::new(stream));
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<RawEvent>, SourceError> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(SourceError::Disconnected);
        };

        match read_json_event(reader, &mut self.line).await {
            Ok(event) => Ok(Some(event)),
            Err(e) => {
                warn!(addr = %self.addr, error = %e, "Lost event source connection");
                self.reader = None;
                Err(e)
            }
        }
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}
