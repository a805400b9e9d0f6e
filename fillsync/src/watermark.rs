//! Per-entity low/high watermarks marking how far synchronization has reached in each direction.
//!
//! The low watermark only moves back in time (backfill) and the high watermark only moves forward
//! (frontfill, streaming). Changes are tracked as dirty and written to a [WatermarkBackend] either
//! on demand ([WatermarkStore::persist]) or periodically ([WatermarkStore::spawn_persister]).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::datapoint::{Entity, Timestamp};
use crate::error::Result;

/// Persistence backends for the watermarks.
pub mod backend;

pub use backend::{InMemoryBackend, LocalFileBackend, WatermarkBackend};

/// Progress markers of one entity. `None` means nothing has been synchronized in that direction
/// yet, which is different from a watermark at epoch zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub low: Option<Timestamp>,
    pub high: Option<Timestamp>,
}

impl Watermark {
    pub fn new(low: Option<Timestamp>, high: Option<Timestamp>) -> Self {
        Self { low, high }
    }

    pub fn is_empty(&self) -> bool {
        self.low.is_none() && self.high.is_none()
    }
}

#[derive(Debug, Default)]
struct Entry {
    watermark: Watermark,
    dirty: bool,
}

struct Inner {
    entries: RwLock<HashMap<Entity, Arc<Mutex<Entry>>>>,
    backend: Arc<dyn WatermarkBackend>,
}

/// Shared, cloneable handle to the watermarks. Each entity has its own lock, so updates to
/// different entities never contend beyond the brief map lookup.
#[derive(Clone)]
pub struct WatermarkStore {
    inner: Arc<Inner>,
}

impl WatermarkStore {
    /// Empty store writing to `backend`, nothing is read from it.
    pub fn new(backend: Arc<dyn WatermarkBackend>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                backend,
            }),
        }
    }

    /// Restores the watermarks previously persisted to `backend`.
    pub async fn load(backend: Arc<dyn WatermarkBackend>) -> Result<Self> {
        let persisted = backend.load().await?;
        info!(backend = backend.name(), entities = persisted.len(), "Loaded watermarks");

        let entries = persisted
            .into_iter()
            .map(|(entity, watermark)| {
                let entry = Entry {
                    watermark,
                    dirty: false,
                };
                (entity, Arc::new(Mutex::new(entry)))
            })
            .collect();

        Ok(Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(entries),
                backend,
            }),
        })
    }

    pub fn get(&self, entity: &str) -> Watermark {
        self.inner
            .entries
            .read()
            .get(entity)
            .map(|entry| entry.lock().watermark)
            .unwrap_or_default()
    }

    /// Widens the watermark of `entity`: `low` only if it is older than the current low, `high`
    /// only if it is newer than the current high. A proposal that would narrow is ignored, as is a
    /// first bound that would end up on the wrong side of the other, already established one.
    /// Returns whether anything changed.
    pub fn expand(&self, entity: &str, low: Option<Timestamp>, high: Option<Timestamp>) -> bool {
        if low.is_none() && high.is_none() {
            return false;
        }

        let entry = self.entry(entity);
        let mut entry = entry.lock();
        let current = entry.watermark;

        let mut low = match (current.low, low) {
            (Some(cur), Some(proposed)) => Some(cur.min(proposed)),
            (cur, proposed) => cur.or(proposed),
        };
        let mut high = match (current.high, high) {
            (Some(cur), Some(proposed)) => Some(cur.max(proposed)),
            (cur, proposed) => cur.or(proposed),
        };

        if let (Some(l), Some(h)) = (low, high)
            && l > h
        {
            warn!(entity, ?current, low = l, high = h, "Rejecting watermark bound that would invert the range");
            if current.low.is_none() {
                low = None;
            }
            if current.high.is_none() {
                high = None;
            }
        }

        let updated = Watermark::new(low, high);
        if updated == current {
            return false;
        }
        debug!(entity, ?current, ?updated, "Expanded watermark");
        entry.watermark = updated;
        entry.dirty = true;
        true
    }

    /// All entities with a watermark.
    pub fn entities(&self) -> Vec<Entity> {
        self.inner.entries.read().keys().cloned().collect()
    }

    /// Writes every watermark changed since the last successful persist to the backend.
    pub async fn persist(&self) -> Result<usize> {
        let dirty: Vec<(Entity, Arc<Mutex<Entry>>)> = self
            .inner
            .entries
            .read()
            .iter()
            .map(|(entity, entry)| (entity.clone(), Arc::clone(entry)))
            .collect();

        let changed: Vec<(Entity, Watermark)> = dirty
            .into_iter()
            .filter_map(|(entity, entry)| {
                let mut entry = entry.lock();
                if !entry.dirty {
                    return None;
                }
                entry.dirty = false;
                Some((entity, entry.watermark))
            })
            .collect();

        if changed.is_empty() {
            return Ok(0);
        }

        let count = changed.len();
        if let Err(e) = self.inner.backend.store(changed.clone()).await {
            // put them back so the next persist picks them up again
            for (entity, _) in changed {
                self.entry(&entity).lock().dirty = true;
            }
            return Err(e);
        }
        debug!(count, backend = self.inner.backend.name(), "Persisted watermarks");
        Ok(count)
    }

    /// Persists every `interval` until `cancel` fires, then once more. Failures of the periodic
    /// persist are logged and retried at the next tick, the result of the final one is returned.
    pub fn spawn_persister(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<()>> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.persist().await {
                            error!(?e, "Failed to persist watermarks, will retry on next tick");
                        }
                    }
                    _ = cancel.cancelled() => {
                        info!("Cancellation received, persisting watermarks one last time");
                        store.persist().await?;
                        return Ok(());
                    }
                }
            }
        })
    }

    fn entry(&self, entity: &str) -> Arc<Mutex<Entry>> {
        if let Some(entry) = self.inner.entries.read().get(entity) {
            return Arc::clone(entry);
        }
        let mut entries = self.inner.entries.write();
        Arc::clone(entries.entry(entity.to_string()).or_default())
    }
}
