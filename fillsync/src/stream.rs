//! Perpetual polling of the newest data for every entity.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::config::{StreamConfig, StreamMode, duration_ms};
use crate::datapoint::{Entity, Timestamp};
use crate::error::{Error, Result};
use crate::shared::{SyncContext, fan_out};
use crate::source::SourceClient;
use crate::throttle::ThrottleLoop;
use crate::window::Window;

/// Outcome of polling one entity once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Poll {
    Delivered(usize),
    /// Transient failure outlasted the retries, polled again next iteration.
    Deferred,
    /// Permanent failure, no longer polled in this run.
    Abandoned,
}

pub struct Streamer<S> {
    ctx: SyncContext<S>,
    config: StreamConfig,
    span: Span,
}

impl<S> Streamer<S>
where
    S: SourceClient + Send + Sync + 'static,
{
    pub fn new(ctx: SyncContext<S>, config: StreamConfig) -> Self {
        Self {
            ctx,
            config,
            span: info_span!("stream"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Polls `entities` every `target_interval` until the shared token is cancelled or every
    /// entity has been abandoned. Only a sink failure is an error.
    pub async fn run(&self, entities: &[Entity]) -> Result<()> {
        self.run_inner(entities).instrument(self.span.clone()).await
    }

    async fn run_inner(&self, entities: &[Entity]) -> Result<()> {
        info!(entities = entities.len(), mode = ?self.config.mode, "Starting stream");
        let abandoned: Mutex<HashSet<Entity>> = Mutex::new(HashSet::new());
        let abandoned = &abandoned;
        let mode = Arc::new(self.config.mode.clone());

        ThrottleLoop::new(self.config.target_interval, self.ctx.cancel.clone())
            .with_span(Span::current())
            .run(move |iteration| {
                let mode = Arc::clone(&mode);
                async move {
                    let active: Vec<Entity> = {
                        let abandoned = abandoned.lock();
                        entities
                            .iter()
                            .filter(|e| !abandoned.contains(*e))
                            .cloned()
                            .collect()
                    };
                    if active.is_empty() {
                        warn!(iteration, "Every entity was abandoned, stopping stream");
                        return Ok::<_, Error>(ControlFlow::Break(()));
                    }

                    let now = self.ctx.clock.now();
                    let ctx = self.ctx.clone();
                    let results = fan_out(
                        active,
                        self.config.parallelism,
                        self.config.pacing,
                        &self.ctx.cancel,
                        move |entity| {
                            let ctx = ctx.clone();
                            let mode = Arc::clone(&mode);
                            async move { poll(&ctx, &entity, now, &mode).await }
                        },
                    )
                    .await?;

                    let mut points = 0;
                    for (entity, outcome) in results {
                        match outcome? {
                            Poll::Delivered(n) => points += n,
                            Poll::Deferred => {}
                            Poll::Abandoned => {
                                abandoned.lock().insert(entity);
                            }
                        }
                    }
                    debug!(iteration, points, "Stream iteration done");
                    Ok(ControlFlow::Continue(()))
                }
            })
            .await
    }
}

async fn poll<S>(
    ctx: &SyncContext<S>,
    entity: &str,
    now: Timestamp,
    mode: &StreamMode,
) -> Result<Poll>
where
    S: SourceClient + Send + Sync + 'static,
{
    let fetched = match mode {
        StreamMode::TrailingWindow { lookback } => {
            let window = Window::new(now.saturating_sub(duration_ms(*lookback)), now);
            match ctx.fetch_window(entity, window).await {
                Ok(data) => {
                    let high = contiguous_high(ctx, entity, window);
                    let points = ctx.deliver(entity, data, None, high).await?;
                    Ok(points)
                }
                Err(e) => Err(e),
            }
        }
        StreamMode::Latest { elements } => match ctx.fetch_latest(entity, elements).await {
            Ok(data) => {
                let submitted = ctx.submit(data).await?;
                for (key, newest) in &submitted.keys {
                    ctx.store.expand(key, None, *newest);
                }
                Ok(submitted.points)
            }
            Err(e) => Err(e),
        },
    };

    match fetched {
        Ok(points) => Ok(Poll::Delivered(points)),
        Err(e) if e.is_transient() => {
            warn!(entity, error = %e, "Stream poll failed, retrying next iteration");
            Ok(Poll::Deferred)
        }
        Err(e) => {
            error!(entity, error = %e, "Stream poll failed permanently, abandoning entity");
            Ok(Poll::Abandoned)
        }
    }
}

/// The high watermark a trailing window may claim: only one touching the synced range, or the
/// first one for an entity. Anything else would hide the unfetched gap `[high, window.start)`
/// from the next frontfill.
fn contiguous_high<S>(ctx: &SyncContext<S>, entity: &str, window: Window) -> Option<Timestamp> {
    match ctx.store.get(entity).high {
        Some(high) if high < window.start => {
            debug!(entity, high, %window, "Gap before the trailing window, keeping the high watermark");
            None
        }
        _ => Some(window.end),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapoint::DataPoint;
    use crate::error::FetchError;
    use crate::test_utils::{HOUR, Harness};
    use crate::watermark::Watermark;
    use std::time::Duration;

    const NOW: Timestamp = 10 * HOUR;
    const MINUTE: Timestamp = 60_000;

    fn config(mode: StreamMode) -> StreamConfig {
        StreamConfig {
            enabled: true,
            mode,
            target_interval: Duration::from_secs(60),
            parallelism: 2,
            pacing: Duration::ZERO,
        }
    }

    fn trailing() -> StreamMode {
        StreamMode::TrailingWindow {
            lookback: Duration::from_secs(10 * 60),
        }
    }

    fn cancel_after(harness: &Harness, after: Duration) {
        let cancel = harness.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            cancel.cancel();
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_window_advances_high() {
        let harness = Harness::new(NOW);
        harness.source.insert(
            "A",
            vec![
                DataPoint::new(NOW - 15 * MINUTE, 1.0),
                DataPoint::new(NOW - 5 * MINUTE, 2.0),
            ],
        );
        cancel_after(&harness, Duration::from_secs(30));

        Streamer::new(harness.ctx(), config(trailing()))
            .run(&["A".to_string()])
            .await
            .unwrap();

        assert_eq!(
            harness.source.windows("A"),
            vec![Window::new(NOW - 10 * MINUTE, NOW)]
        );
        assert_eq!(harness.store.get("A"), Watermark::new(None, Some(NOW)));
        harness.sink.flush().await.unwrap();
        assert_eq!(harness.writer.points("A"), vec![DataPoint::new(NOW - 5 * MINUTE, 2.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_before_window_keeps_high() {
        let harness = Harness::new(NOW);
        harness.store.expand("A", Some(NOW - 3 * HOUR), Some(NOW - 2 * HOUR));
        harness.store.expand("B", None, Some(NOW - 10 * MINUTE));
        harness.source.insert("A", vec![DataPoint::new(NOW - MINUTE, 1.0)]);
        cancel_after(&harness, Duration::from_secs(30));

        Streamer::new(harness.ctx(), config(trailing()))
            .run(&["A".to_string(), "B".to_string()])
            .await
            .unwrap();

        // points are still uploaded, the watermark waits for the next frontfill
        assert_eq!(
            harness.store.get("A"),
            Watermark::new(Some(NOW - 3 * HOUR), Some(NOW - 2 * HOUR))
        );
        assert_eq!(harness.store.get("B").high, Some(NOW));
        harness.sink.flush().await.unwrap();
        assert_eq!(harness.writer.points("A").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_every_interval_with_fresh_now() {
        let harness = Harness::new(NOW);
        let clock = Arc::clone(&harness.clock);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            clock.advance(Duration::from_secs(60));
        });
        cancel_after(&harness, Duration::from_secs(90));

        Streamer::new(harness.ctx(), config(trailing()))
            .run(&["A".to_string()])
            .await
            .unwrap();

        let windows = harness.source.windows("A");
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].end, NOW + MINUTE);
        assert_eq!(harness.store.get("A").high, Some(NOW + MINUTE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_mode_tracks_newest_per_key() {
        let harness = Harness::new(NOW);
        harness.source.insert(
            "station:air_temperature",
            vec![
                DataPoint::new(NOW - 20 * MINUTE, 11.5),
                DataPoint::new(NOW - 2 * MINUTE, 12.0),
            ],
        );
        harness.source.insert(
            "station:wind_speed",
            vec![DataPoint::new(NOW - 4 * MINUTE, 3.2)],
        );
        cancel_after(&harness, Duration::from_secs(30));

        let mode = StreamMode::Latest {
            elements: vec!["air_temperature".to_string(), "wind_speed".to_string()],
        };
        Streamer::new(harness.ctx(), config(mode))
            .run(&["station".to_string()])
            .await
            .unwrap();

        assert_eq!(harness.source.latest_calls(), 1);
        assert_eq!(
            harness.store.get("station:air_temperature").high,
            Some(NOW - 2 * MINUTE)
        );
        assert_eq!(
            harness.store.get("station:wind_speed").high,
            Some(NOW - 4 * MINUTE)
        );
        harness.sink.flush().await.unwrap();
        assert_eq!(harness.writer.point_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retried_next_iteration_permanent_abandoned() {
        let harness = Harness::new(NOW);
        // outlasts the in-iteration retries of the first poll only
        harness
            .source
            .fail_entity("flaky", FetchError::Transient("503".to_string()), 3);
        harness.source.fail_entity(
            "gone",
            FetchError::Permanent("404".to_string()),
            usize::MAX,
        );
        cancel_after(&harness, Duration::from_secs(150));

        Streamer::new(harness.ctx(), config(trailing()))
            .run(&["flaky".to_string(), "gone".to_string()])
            .await
            .unwrap();

        // three iterations: 3 failed calls, then one call each in iterations two and three
        assert_eq!(harness.source.windows("flaky").len(), 5);
        assert_eq!(harness.source.windows("gone").len(), 1);
        assert_eq!(harness.store.get("flaky").high, Some(NOW));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_every_entity_is_abandoned() {
        let harness = Harness::new(NOW);
        harness.source.fail_entity(
            "gone",
            FetchError::Permanent("404".to_string()),
            usize::MAX,
        );

        Streamer::new(harness.ctx(), config(trailing()))
            .run(&["gone".to_string()])
            .await
            .unwrap();
        assert!(!harness.cancel.is_cancelled());
    }
}
