//! File-backed snapshot store
//!
//! Each write goes to a temporary file in the target directory and is then
//! renamed over the target, so readers never see a partial blob.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use super::{SnapshotStore, StoreError};

/// Snapshot stored as a single file
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_atomic(path: &Path, blob: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(blob)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl SnapshotStore for FileStore {
    async fn put(&self, blob: Bytes) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &blob))
            .await
            .map_err(|e| StoreError::Io(io::Error::new(io::ErrorKind::Other, e)))??;
        Ok(())
    }

    async fn get(&self) -> Result<Option<Bytes>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(contents) => Ok(Some(Bytes::from(contents))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }
}
