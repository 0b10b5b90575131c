//! Pluggable object-store access for the cloud sink.
//!
//! The sink opens a fresh handle per write and closes it immediately, so a
//! backend never has to keep a long-lived connection healthy across the
//! lifetime of the sink. The crate ships a local-filesystem backend (the
//! `experimental-nodelocal` scheme) and an in-memory backend for tests;
//! real cloud backends implement the same pair of traits.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use crate::error::{SinkError, SinkResult};

/// One short-lived write handle.
#[async_trait]
pub trait ExportStorage: Send + Sync {
    /// Write a complete object under `name`, replacing any previous object
    /// with that name.
    async fn write_file(&mut self, name: &str, contents: Bytes) -> SinkResult<()>;

    /// Release the handle.
    async fn close(&mut self) -> SinkResult<()>;
}

/// Constructs [`ExportStorage`] handles; held by the sink for its lifetime.
pub trait ExportStorageFactory: Send + Sync {
    fn open(&self) -> SinkResult<Box<dyn ExportStorage>>;
}

// ----------------------------------------------------------------------------
// Local filesystem
// ----------------------------------------------------------------------------

/// Filesystem-backed storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ExportStorageFactory for LocalStorage {
    fn open(&self) -> SinkResult<Box<dyn ExportStorage>> {
        Ok(Box::new(LocalStorageHandle {
            root: self.root.clone(),
        }))
    }
}

struct LocalStorageHandle {
    root: PathBuf,
}

#[async_trait]
impl ExportStorage for LocalStorageHandle {
    async fn write_file(&mut self, name: &str, contents: Bytes) -> SinkResult<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(name);
        trace!(path = %path.display(), bytes = contents.len(), "writing export file");
        tokio::fs::write(path, &contents).await?;
        Ok(())
    }

    async fn close(&mut self) -> SinkResult<()> {
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// In-memory (tests)
// ----------------------------------------------------------------------------

/// In-memory storage shared by every handle the factory opens. Keeps both the
/// name-ordered contents and the write order, so tests can assert the
/// resolved-marker barrier.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<String, Bytes>,
    write_log: Vec<String>,
    fail_writes: bool,
}

impl MemoryStorage {
    /// Files sorted by name, the order a consumer lists them in.
    pub fn files(&self) -> Vec<(String, Bytes)> {
        let state = self.inner.lock().expect("memory storage mutex poisoned");
        state
            .files
            .iter()
            .map(|(name, contents)| (name.clone(), contents.clone()))
            .collect()
    }

    /// Every write in the order it happened, including overwrites.
    pub fn write_log(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("memory storage mutex poisoned")
            .write_log
            .clone()
    }

    pub fn contents(&self, name: &str) -> Option<Bytes> {
        self.inner
            .lock()
            .expect("memory storage mutex poisoned")
            .files
            .get(name)
            .cloned()
    }

    /// Make every subsequent write fail, to exercise flush abort paths.
    pub fn fail_writes(&self, fail: bool) {
        self.inner
            .lock()
            .expect("memory storage mutex poisoned")
            .fail_writes = fail;
    }
}

impl ExportStorageFactory for MemoryStorage {
    fn open(&self) -> SinkResult<Box<dyn ExportStorage>> {
        Ok(Box::new(MemoryStorageHandle {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemoryStorageHandle {
    inner: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl ExportStorage for MemoryStorageHandle {
    async fn write_file(&mut self, name: &str, contents: Bytes) -> SinkResult<()> {
        let mut state = self.inner.lock().expect("memory storage mutex poisoned");
        if state.fail_writes {
            return Err(SinkError::Storage(std::io::Error::other(
                "simulated storage write failure",
            )));
        }
        state.files.insert(name.to_owned(), contents);
        state.write_log.push(name.to_owned());
        Ok(())
    }

    async fn close(&mut self) -> SinkResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_storage_round_trips_files() {
        let dir = tempfile::tempdir().unwrap();
        let factory = LocalStorage::new(dir.path());
        let mut handle = factory.open().unwrap();
        handle
            .write_file("a.ndjson", Bytes::from_static(b"{\"x\":1}\n"))
            .await
            .unwrap();
        handle.close().await.unwrap();

        let written = std::fs::read(dir.path().join("a.ndjson")).unwrap();
        assert_eq!(written, b"{\"x\":1}\n");
    }

    #[tokio::test]
    async fn memory_storage_records_write_order() {
        let storage = MemoryStorage::default();
        let mut handle = storage.open().unwrap();
        handle
            .write_file("b", Bytes::from_static(b"2"))
            .await
            .unwrap();
        handle
            .write_file("a", Bytes::from_static(b"1"))
            .await
            .unwrap();
        handle.close().await.unwrap();

        // Listing is name-ordered, the log is write-ordered.
        let names: Vec<String> = storage.files().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(storage.write_log(), ["b", "a"]);
    }

    #[tokio::test]
    async fn memory_storage_can_simulate_failures() {
        let storage = MemoryStorage::default();
        storage.fail_writes(true);
        let mut handle = storage.open().unwrap();
        let err = handle
            .write_file("a", Bytes::from_static(b"1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Storage(_)));
        assert!(storage.files().is_empty());
    }
}
