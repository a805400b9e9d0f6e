use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, io};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::debug;

use super::Watermark;
use crate::datapoint::Entity;
use crate::error::{Error, Result};

/// Where watermarks survive restarts. Keyed by entity, the value is the `(low, high)` pair.
/// Object safe so it can be handed around as `Arc<dyn WatermarkBackend>`.
#[async_trait]
pub trait WatermarkBackend: Send + Sync {
    /// Everything persisted so far.
    async fn load(&self) -> Result<HashMap<Entity, Watermark>>;

    /// Inserts or replaces the given entries, leaving the others untouched.
    async fn store(&self, entries: Vec<(Entity, Watermark)>) -> Result<()>;

    fn name(&self) -> &str;
}

/// Keeps the watermarks in memory only. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    entries: Arc<RwLock<HashMap<Entity, Watermark>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashMap<Entity, Watermark> {
        self.entries.read().clone()
    }
}

#[async_trait]
impl WatermarkBackend for InMemoryBackend {
    async fn load(&self) -> Result<HashMap<Entity, Watermark>> {
        Ok(self.snapshot())
    }

    async fn store(&self, entries: Vec<(Entity, Watermark)>) -> Result<()> {
        self.entries.write().extend(entries);
        Ok(())
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

/// A single JSON document on the local file system, `{"<entity>": {"low": .., "high": ..}}`.
/// Every store rewrites the whole document through a temp file and a rename, so a crash leaves
/// either the old or the new version behind. File I/O runs on the blocking pool.
#[derive(Debug)]
pub struct LocalFileBackend {
    path: PathBuf,
    name: String,
    cache: Mutex<Option<HashMap<Entity, Watermark>>>,
}

impl LocalFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: format!("local-file:{}", path.display()),
            path,
            cache: Mutex::new(None),
        }
    }

    fn read(path: &Path) -> Result<HashMap<Entity, Watermark>> {
        match fs::read(path) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
                Error::Watermark(format!("Failed to parse {}: {e}", path.display()))
            }),
            // first run
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(Error::Watermark(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    fn write(path: &Path, entries: &HashMap<Entity, Watermark>) -> Result<()> {
        let raw = serde_json::to_vec_pretty(entries)
            .map_err(|e| Error::Watermark(format!("Failed to serialize watermarks: {e}")))?;

        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, raw).map_err(|e| {
            Error::Watermark(format!("Failed to write {}: {e}", tmp_path.display()))
        })?;
        fs::rename(&tmp_path, path).map_err(|e| {
            Error::Watermark(format!(
                "Failed to move {} to {}: {e}",
                tmp_path.display(),
                path.display()
            ))
        })
    }

    async fn read_blocking(&self) -> Result<HashMap<Entity, Watermark>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::read(&path)).await?
    }
}

#[async_trait]
impl WatermarkBackend for LocalFileBackend {
    async fn load(&self) -> Result<HashMap<Entity, Watermark>> {
        let mut cache = self.cache.lock().await;
        let entries = self.read_blocking().await?;
        *cache = Some(entries.clone());
        Ok(entries)
    }

    async fn store(&self, entries: Vec<(Entity, Watermark)>) -> Result<()> {
        // one store at a time, the temp file is shared
        let mut cache = self.cache.lock().await;
        let mut current = match cache.take() {
            Some(current) => current,
            None => self.read_blocking().await?,
        };
        current.extend(entries);

        let path = self.path.clone();
        let (current, written) = tokio::task::spawn_blocking(move || {
            let written = Self::write(&path, &current);
            (current, written)
        })
        .await?;
        let count = current.len();
        *cache = Some(current);
        written?;

        debug!(path = %self.path.display(), entities = count, "Wrote watermark file");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
