//! Snapshot stores
//!
//! A store holds the latest exposition blob under one fixed key. Writers
//! replace the whole blob; readers see either the previous blob or the new
//! one, never a mix.

mod file;
mod memory;
mod resp;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use resp::{RespStore, Reply};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{StoreBackend, StoreConfig};

/// Snapshot store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("store protocol error: {0}")]
    Protocol(String),

    #[error("store rejected command: {0}")]
    Rejected(String),
}

/// Key→blob store for the latest snapshot
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replace the stored snapshot
    async fn put(&self, blob: Bytes) -> Result<(), StoreError>;

    /// Fetch the stored snapshot, `None` if nothing was written yet
    async fn get(&self) -> Result<Option<Bytes>, StoreError>;

    /// Human-readable location for logs
    fn describe(&self) -> String;
}

/// Build the configured store backend
pub fn from_config(config: &StoreConfig) -> Result<Arc<dyn SnapshotStore>> {
    let store: Arc<dyn SnapshotStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::File => {
            let path = config
                .path
                .clone()
                .context("store.path is required for the file backend")?;
            Arc::new(FileStore::new(path))
        }
        StoreBackend::Resp => Arc::new(RespStore::new(
            config.addr.clone(),
            config.key.clone(),
            config.db,
            config.timeout(),
        )),
    };
    Ok(store)
}

/// Store handle for readers such as the scrape endpoint
///
/// Backends with their own connection get a fresh instance, so a slow read
/// never holds the writer's connection. The in-process backend has no
/// connection and must be shared to see the writer's blob.
pub fn reader_for(config: &StoreConfig, writer: &Arc<dyn SnapshotStore>) -> Result<Arc<dyn SnapshotStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(writer.clone()),
        StoreBackend::File | StoreBackend::Resp => from_config(config),
    }
}
