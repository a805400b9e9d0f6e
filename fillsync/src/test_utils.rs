//! In-memory fakes for the external collaborators, with failure injection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::{RetryConfig, SinkConfig};
use crate::datapoint::{Batch, DataPoint, Entity, SourceData, Timestamp};
use crate::error::{Error, FetchError, Result};
use crate::shared::SyncContext;
use crate::sink::{BatchSink, BatchSinkBuilder, PointWriter};
use crate::source::SourceClient;
use crate::watermark::{InMemoryBackend, Watermark, WatermarkBackend, WatermarkStore};
use crate::window::Window;

pub(crate) const HOUR: Timestamp = 3_600_000;

/// Takes one from a failure countdown. `usize::MAX` never runs out.
fn take_failure(remaining: &mut usize) -> bool {
    match *remaining {
        0 => false,
        usize::MAX => true,
        _ => {
            *remaining -= 1;
            true
        }
    }
}

#[derive(Debug)]
pub(crate) struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub(crate) fn new(now: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        self.now
            .fetch_add(i64::try_from(by.as_millis()).unwrap(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Source answering from in-memory series. Querying an entity also returns the series paired with
/// it, the way a counter comes back together with its good-count.
#[derive(Debug, Default)]
pub(crate) struct SimpleSource {
    series: Mutex<HashMap<Entity, Vec<DataPoint>>>,
    related: Mutex<HashMap<Entity, Vec<Entity>>>,
    /// Fail the next N queries for an entity with the given error.
    failures: Mutex<HashMap<Entity, (FetchError, usize)>>,
    windows: Mutex<Vec<(Entity, Window)>>,
    latest_calls: AtomicUsize,
}

impl SimpleSource {
    pub(crate) fn insert(&self, entity: &str, points: Vec<DataPoint>) {
        let mut series = self.series.lock();
        let existing = series.entry(entity.to_string()).or_default();
        existing.extend(points);
        existing.sort_by_key(|p| p.timestamp);
    }

    pub(crate) fn pair(&self, entity: &str, related: &str) {
        self.related
            .lock()
            .entry(entity.to_string())
            .or_default()
            .push(related.to_string());
    }

    pub(crate) fn fail_entity(&self, entity: &str, error: FetchError, count: usize) {
        self.failures
            .lock()
            .insert(entity.to_string(), (error, count));
    }

    /// Windows queried for `entity`, in query order.
    pub(crate) fn windows(&self, entity: &str) -> Vec<Window> {
        self.windows
            .lock()
            .iter()
            .filter(|(e, _)| e == entity)
            .map(|(_, w)| *w)
            .collect()
    }

    pub(crate) fn latest_calls(&self) -> usize {
        self.latest_calls.load(Ordering::SeqCst)
    }

    fn injected_failure(&self, entity: &str) -> Option<FetchError> {
        let mut failures = self.failures.lock();
        let (error, remaining) = failures.get_mut(entity)?;
        take_failure(remaining).then(|| error.clone())
    }

    fn keys(&self, entity: &str) -> Vec<Entity> {
        let mut keys = vec![entity.to_string()];
        if let Some(related) = self.related.lock().get(entity) {
            keys.extend(related.iter().cloned());
        }
        keys
    }
}

impl SourceClient for SimpleSource {
    async fn query_window(
        &self,
        entity: &str,
        window: Window,
    ) -> std::result::Result<SourceData, FetchError> {
        self.windows.lock().push((entity.to_string(), window));
        if let Some(error) = self.injected_failure(entity) {
            return Err(error);
        }

        let series = self.series.lock();
        Ok(self
            .keys(entity)
            .into_iter()
            .map(|key| {
                let points = series
                    .get(&key)
                    .map(|points| {
                        points
                            .iter()
                            .filter(|p| window.contains(p.timestamp))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                (key, points)
            })
            .collect())
    }

    async fn query_latest(
        &self,
        entities: &[Entity],
        elements: &[String],
    ) -> std::result::Result<SourceData, FetchError> {
        self.latest_calls.fetch_add(1, Ordering::SeqCst);
        for entity in entities {
            if let Some(error) = self.injected_failure(entity) {
                return Err(error);
            }
        }

        let series = self.series.lock();
        let mut data = SourceData::new();
        for entity in entities {
            for element in elements {
                let key = format!("{entity}:{element}");
                if let Some(newest) = series.get(&key).and_then(|points| points.last()) {
                    data.insert(key, vec![newest.clone()]);
                }
            }
        }
        Ok(data)
    }
}

/// Writer keeping every written batch in memory. Clones share the record.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingWriter {
    batches: Arc<Mutex<Vec<Batch>>>,
    fail_next_writes: Arc<Mutex<usize>>,
    attempts: Arc<AtomicUsize>,
}

impl RecordingWriter {
    /// Fails the first `count` writes, `usize::MAX` for a destination that never comes back.
    pub(crate) fn failing(count: usize) -> Self {
        let writer = Self::default();
        *writer.fail_next_writes.lock() = count;
        writer
    }

    pub(crate) fn batches(&self) -> Vec<Batch> {
        self.batches.lock().clone()
    }

    pub(crate) fn point_count(&self) -> usize {
        self.batches.lock().iter().map(Batch::len).sum()
    }

    /// Points written for `entity` across all batches.
    pub(crate) fn points(&self, entity: &str) -> Vec<DataPoint> {
        self.batches
            .lock()
            .iter()
            .filter_map(|b| b.points(entity))
            .flat_map(|points| points.iter().cloned())
            .collect()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl PointWriter for RecordingWriter {
    async fn write(&mut self, batch: &Batch) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if take_failure(&mut self.fail_next_writes.lock()) {
            return Err(Error::Sink("destination unavailable".to_string()));
        }
        self.batches.lock().push(batch.clone());
        Ok(())
    }
}

/// Backend failing the first N stores, then keeping everything in memory.
#[derive(Debug, Default)]
pub(crate) struct FailingBackend {
    inner: InMemoryBackend,
    fail_next_stores: Mutex<usize>,
}

impl FailingBackend {
    pub(crate) fn new(fail_next_stores: usize) -> Self {
        Self {
            inner: InMemoryBackend::new(),
            fail_next_stores: Mutex::new(fail_next_stores),
        }
    }

    pub(crate) fn stored(&self) -> HashMap<Entity, Watermark> {
        self.inner.snapshot()
    }
}

#[async_trait]
impl WatermarkBackend for FailingBackend {
    async fn load(&self) -> Result<HashMap<Entity, Watermark>> {
        self.inner.load().await
    }

    async fn store(&self, entries: Vec<(Entity, Watermark)>) -> Result<()> {
        if take_failure(&mut self.fail_next_stores.lock()) {
            return Err(Error::Watermark("bucket unavailable".to_string()));
        }
        self.inner.store(entries).await
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Retries that finish within a few paused-time milliseconds: three calls per fetch at most.
pub(crate) fn quick_retry() -> RetryConfig {
    RetryConfig {
        max_retry_attempts: 2,
        initial_retry_interval_in_ms: 10,
        max_retry_interval_in_ms: 10,
        retry_factor: 1.0,
        retry_jitter: 0.0,
    }
}

/// Everything a phase needs, wired to the fakes above. Must be built inside a runtime.
pub(crate) struct Harness {
    pub(crate) source: Arc<SimpleSource>,
    pub(crate) store: WatermarkStore,
    pub(crate) sink: BatchSink,
    pub(crate) writer: RecordingWriter,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) cancel: CancellationToken,
}

impl Harness {
    pub(crate) fn new(now: Timestamp) -> Self {
        let writer = RecordingWriter::default();
        let sink = BatchSinkBuilder::new(
            writer.clone(),
            SinkConfig {
                max_queue_size: 1000,
                max_flush_interval: Duration::from_secs(1),
            },
        )
        .retry_config(quick_retry())
        .build();

        Self {
            source: Arc::new(SimpleSource::default()),
            store: WatermarkStore::new(Arc::new(InMemoryBackend::new())),
            sink,
            writer,
            clock: Arc::new(ManualClock::new(now)),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn ctx(&self) -> SyncContext<SimpleSource> {
        SyncContext::new(
            Arc::clone(&self.source),
            self.store.clone(),
            self.sink.clone(),
            Arc::clone(&self.clock) as Arc<dyn Clock>,
            self.cancel.clone(),
        )
        .with_fetch_retry(quick_retry())
    }
}
