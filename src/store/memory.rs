//! In-process snapshot store

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{SnapshotStore, StoreError};

/// Snapshot held in memory, for a scrape endpoint running in the same process
#[derive(Debug, Default)]
pub struct MemoryStore {
    blob: RwLock<Option<Bytes>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    /// Current blob without going through the async interface
    pub fn current(&self) -> Option<Bytes> {
        self.blob.read().clone()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn put(&self, blob: Bytes) -> Result<(), StoreError> {
        *self.blob.write() = Some(blob);
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn get(&self) -> Result<Option<Bytes>, StoreError> {
        Ok(self.current())
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}
