//! Plumbing shared by the fill phases: the collaborators every phase works against and the
//! bounded per-entity worker pool.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::clock::Clock;
use crate::config::RetryConfig;
use crate::datapoint::{Entity, SourceData, Timestamp};
use crate::error::{Error, FetchError, Result};
use crate::retry::fetch_with_retry;
use crate::sink::BatchSink;
use crate::source::SourceClient;
use crate::watermark::WatermarkStore;
use crate::window::Window;

/// Everything a phase needs. Cheap to clone, every clone talks to the same source, store, sink
/// and cancellation token.
pub struct SyncContext<S> {
    pub(crate) source: Arc<S>,
    pub(crate) store: WatermarkStore,
    pub(crate) sink: BatchSink,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) cancel: CancellationToken,
    pub(crate) fetch_retry: RetryConfig,
}

impl<S> Clone for SyncContext<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            store: self.store.clone(),
            sink: self.sink.clone(),
            clock: Arc::clone(&self.clock),
            cancel: self.cancel.clone(),
            fetch_retry: self.fetch_retry.clone(),
        }
    }
}

/// What [SyncContext::submit] handed to the sink.
#[derive(Debug, Default)]
pub(crate) struct Submitted {
    /// Every returned key with its newest timestamp, `None` if the key came back without points.
    pub(crate) keys: Vec<(Entity, Option<Timestamp>)>,
    pub(crate) points: usize,
}

impl<S> SyncContext<S>
where
    S: SourceClient + Send + Sync + 'static,
{
    pub fn new(
        source: Arc<S>,
        store: WatermarkStore,
        sink: BatchSink,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            store,
            sink,
            clock,
            cancel,
            fetch_retry: RetryConfig::fetch_default(),
        }
    }

    pub fn with_fetch_retry(mut self, fetch_retry: RetryConfig) -> Self {
        self.fetch_retry = fetch_retry;
        self
    }

    pub(crate) async fn fetch_window(
        &self,
        entity: &str,
        window: Window,
    ) -> std::result::Result<SourceData, FetchError> {
        let source = &*self.source;
        fetch_with_retry(&self.fetch_retry, &self.cancel, entity, || {
            source.query_window(entity, window)
        })
        .await
    }

    pub(crate) async fn fetch_latest(
        &self,
        entity: &str,
        elements: &[String],
    ) -> std::result::Result<SourceData, FetchError> {
        let source = &*self.source;
        let entities = [entity.to_string()];
        fetch_with_retry(&self.fetch_retry, &self.cancel, entity, || {
            source.query_latest(&entities, elements)
        })
        .await
    }

    /// Hands every returned key to the sink. An error here means the sink is gone for good.
    pub(crate) async fn submit(&self, data: SourceData) -> Result<Submitted> {
        let mut submitted = Submitted::default();
        for (key, points) in data {
            let newest = points.iter().map(|p| p.timestamp).max();
            submitted.points += points.len();
            self.sink.submit(key.clone(), points).await?;
            submitted.keys.push((key, newest));
        }
        Ok(submitted)
    }

    /// Submits `data` and then widens the watermarks of the queried entity and of every returned
    /// key to `[low, high]`. Returns the number of points submitted.
    pub(crate) async fn deliver(
        &self,
        queried: &str,
        data: SourceData,
        low: Option<Timestamp>,
        high: Option<Timestamp>,
    ) -> Result<usize> {
        let submitted = self.submit(data).await?;
        self.store.expand(queried, low, high);
        for (key, _) in &submitted.keys {
            if key != queried {
                self.store.expand(key, low, high);
            }
        }
        Ok(submitted.points)
    }
}

/// Runs `task` for every entity with at most `parallelism` running at once, sleeping `pacing`
/// between consecutive dispatches. Every dispatched task runs to completion, cancellation only
/// shortens the pacing sleeps. Results come back in completion order.
pub(crate) async fn fan_out<T, F, Fut>(
    entities: impl IntoIterator<Item = Entity>,
    parallelism: usize,
    pacing: Duration,
    cancel: &CancellationToken,
    task: F,
) -> Result<Vec<(Entity, T)>>
where
    F: Fn(Entity) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut tasks = JoinSet::new();

    for (i, entity) in entities.into_iter().enumerate() {
        if i > 0 && !pacing.is_zero() && !cancel.is_cancelled() {
            tokio::select! {
                _ = tokio::time::sleep(pacing) => {}
                _ = cancel.cancelled() => {}
            }
        }

        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .map_err(|e| Error::Task(format!("worker pool closed: {e}")))?;
        let work = task(entity.clone());
        tasks.spawn(
            async move {
                let _permit = permit;
                (entity, work.await)
            }
            .instrument(Span::current()),
        );
    }

    let mut results = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        results.push(joined?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_bounds_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let entities: Vec<Entity> = (0..10).map(|i| format!("e{i}")).collect();

        let results = fan_out(entities, 3, Duration::ZERO, &CancellationToken::new(), |e| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                e.len()
            }
        })
        .await
        .unwrap();

        assert_eq!(results.len(), 10);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_paces_dispatches() {
        let begin = Instant::now();
        let entities: Vec<Entity> = (0..4).map(|i| format!("e{i}")).collect();
        let results = fan_out(
            entities,
            10,
            Duration::from_millis(1500),
            &CancellationToken::new(),
            move |_| async move { begin.elapsed().as_millis() },
        )
        .await
        .unwrap();

        let mut started: Vec<u128> = results.into_iter().map(|(_, t)| t).collect();
        started.sort_unstable();
        assert_eq!(started, vec![0, 1500, 3000, 4500]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_skips_pacing_once_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let begin = Instant::now();
        let results = fan_out(
            vec!["a".to_string(), "b".to_string()],
            1,
            Duration::from_secs(60),
            &cancel,
            |e| async move { e },
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 2);
        assert!(begin.elapsed() < Duration::from_secs(1));
    }
}
