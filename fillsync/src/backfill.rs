//! Walks every entity backward from its low watermark, one bounded step per cycle, until the
//! configured horizon is reached.

use std::ops::ControlFlow;

use parking_lot::Mutex;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::config::BackfillConfig;
use crate::datapoint::{Entity, Timestamp};
use crate::error::{Error, Result};
use crate::shared::{SyncContext, fan_out};
use crate::source::SourceClient;
use crate::throttle::ThrottleLoop;
use crate::window::{Direction, plan};

/// Outcome of one backfill step for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Moved back one step, more to go.
    Advanced,
    /// Low watermark is at the horizon.
    Reached,
    /// Transient failure outlasted the retries, try again next cycle.
    Deferred,
    /// Permanent failure, skip for the rest of the run.
    Abandoned,
}

impl Step {
    fn keeps_entity(self) -> bool {
        matches!(self, Step::Advanced | Step::Deferred)
    }
}

/// How a backfill run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillSummary {
    pub iterations: u64,
    /// Every entity reached the horizon or was abandoned, as opposed to being cancelled.
    pub completed: bool,
    pub abandoned: Vec<Entity>,
}

#[derive(Debug, Default)]
struct Progress {
    active: Vec<Entity>,
    abandoned: Vec<Entity>,
    iterations: u64,
}

pub struct Backfiller<S> {
    ctx: SyncContext<S>,
    config: BackfillConfig,
    span: Span,
}

impl<S> Backfiller<S>
where
    S: SourceClient + Send + Sync + 'static,
{
    pub fn new(ctx: SyncContext<S>, config: BackfillConfig) -> Self {
        Self {
            ctx,
            config,
            span: info_span!("backfill"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Backfills `entities` down to the horizon. Returns early, with `completed == false`, once
    /// the shared token is cancelled. Only a sink failure is an error.
    pub async fn run(&self, entities: &[Entity]) -> Result<BackfillSummary> {
        self.run_inner(entities).instrument(self.span.clone()).await
    }

    async fn run_inner(&self, entities: &[Entity]) -> Result<BackfillSummary> {
        let now = self.ctx.clock.now();
        let horizon = self.config.horizon.resolve(now);
        info!(entities = entities.len(), now, horizon, "Starting backfill");

        let progress = Mutex::new(Progress {
            active: entities.to_vec(),
            ..Default::default()
        });
        let progress = &progress;

        ThrottleLoop::new(self.config.target_interval, self.ctx.cancel.clone())
            .with_span(Span::current())
            .run(move |iteration| async move {
                let active = progress.lock().active.clone();
                if active.is_empty() {
                    return Ok::<_, Error>(ControlFlow::Break(()));
                }
                debug!(iteration, active = active.len(), "Backfill cycle");

                let ctx = self.ctx.clone();
                let step = self.config.step;
                let results = fan_out(
                    active,
                    self.config.parallelism,
                    self.config.pacing,
                    &self.ctx.cancel,
                    move |entity| {
                        let ctx = ctx.clone();
                        async move { step_back(&ctx, &entity, now, horizon, step).await }
                    },
                )
                .await?;

                let mut progress = progress.lock();
                progress.iterations = iteration;
                // the next active set is a pure filter over this cycle's outcomes
                let mut next = Vec::with_capacity(results.len());
                for (entity, outcome) in results {
                    match outcome? {
                        outcome if outcome.keeps_entity() => next.push(entity),
                        Step::Abandoned => progress.abandoned.push(entity),
                        _ => {}
                    }
                }
                progress.active = next;

                if progress.active.is_empty() {
                    Ok(ControlFlow::Break(()))
                } else {
                    Ok(ControlFlow::Continue(()))
                }
            })
            .await?;

        let Progress {
            active,
            abandoned,
            iterations,
        } = std::mem::take(&mut *progress.lock());
        let completed = active.is_empty();
        let summary = BackfillSummary {
            iterations,
            completed,
            abandoned,
        };

        if !completed {
            info!(iterations, remaining = active.len(), "Backfill cancelled before reaching the horizon");
            return Ok(summary);
        }

        info!(iterations, abandoned = summary.abandoned.len(), horizon, "Backfill reached the horizon");
        if self.config.stop_on_complete {
            // pending batches get a chance to be flushed before everything winds down
            tokio::select! {
                _ = tokio::time::sleep(self.config.completion_grace) => {}
                _ = self.ctx.cancel.cancelled() => {}
            }
            info!("Backfill complete, signalling shutdown");
            self.ctx.cancel.cancel();
        }
        Ok(summary)
    }
}

/// Fetches the newest step below the entity's low watermark (or below `now` on a first run) and
/// widens the watermarks of every key the source returned.
async fn step_back<S>(
    ctx: &SyncContext<S>,
    entity: &str,
    now: Timestamp,
    horizon: Timestamp,
    step: std::time::Duration,
) -> Result<Step>
where
    S: SourceClient + Send + Sync + 'static,
{
    let end = ctx.store.get(entity).low.unwrap_or(now);
    let Some(window) = plan(horizon, end, step, Direction::Backward).next() else {
        debug!(entity, end, horizon, "Already at the horizon");
        return Ok(Step::Reached);
    };

    match ctx.fetch_window(entity, window).await {
        Ok(data) => {
            let points = ctx
                .deliver(entity, data, Some(window.start), Some(window.end))
                .await?;
            debug!(entity, %window, points, "Backfilled window");
            if window.start <= horizon {
                info!(entity, horizon, "Entity reached the backfill horizon");
                Ok(Step::Reached)
            } else {
                Ok(Step::Advanced)
            }
        }
        Err(e) if e.is_transient() => {
            warn!(entity, %window, error = %e, "Backfill step failed, retrying next cycle");
            Ok(Step::Deferred)
        }
        Err(e) => {
            error!(entity, %window, error = %e, "Backfill step failed permanently, abandoning entity");
            Ok(Step::Abandoned)
        }
    }
}
