//! Closes the gap between each entity's high watermark and "now", once, before streaming starts.

use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::config::FrontfillConfig;
use crate::datapoint::{Entity, Timestamp};
use crate::error::Result;
use crate::shared::{SyncContext, fan_out};
use crate::source::SourceClient;
use crate::window::{Direction, plan};

pub struct Frontfiller<S> {
    ctx: SyncContext<S>,
    config: FrontfillConfig,
    span: Span,
}

impl<S> Frontfiller<S>
where
    S: SourceClient + Send + Sync + 'static,
{
    pub fn new(ctx: SyncContext<S>, config: FrontfillConfig) -> Self {
        Self {
            ctx,
            config,
            span: info_span!("frontfill"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Fills `[high, now)` for every entity that already has a high watermark and returns how many
    /// points were submitted. Entities without one are skipped. A gap that cannot be fetched is
    /// left for the next run, only a sink failure is an error.
    pub async fn run(&self, entities: &[Entity]) -> Result<usize> {
        self.run_inner(entities).instrument(self.span.clone()).await
    }

    async fn run_inner(&self, entities: &[Entity]) -> Result<usize> {
        let now = self.ctx.clock.now();
        let (candidates, skipped): (Vec<Entity>, Vec<Entity>) = entities
            .iter()
            .cloned()
            .partition(|entity| self.ctx.store.get(entity).high.is_some());
        if !skipped.is_empty() {
            debug!(?skipped, "No high watermark yet, nothing to frontfill from");
        }
        info!(entities = candidates.len(), now, "Starting frontfill");

        let ctx = self.ctx.clone();
        let max_span = self.config.max_span;
        let results = fan_out(
            candidates,
            self.config.parallelism,
            self.config.pacing,
            &self.ctx.cancel,
            move |entity| {
                let ctx = ctx.clone();
                async move { fill_gap(&ctx, &entity, now, max_span).await }
            },
        )
        .await?;

        let mut submitted = 0;
        for (_, points) in results {
            submitted += points?;
        }
        info!(points = submitted, "Frontfill done");
        Ok(submitted)
    }
}

/// Walks `[high, now)` oldest first, moving the high watermark up window by window.
async fn fill_gap<S>(
    ctx: &SyncContext<S>,
    entity: &str,
    now: Timestamp,
    max_span: std::time::Duration,
) -> Result<usize>
where
    S: SourceClient + Send + Sync + 'static,
{
    let Some(high) = ctx.store.get(entity).high else {
        return Ok(0);
    };

    let mut submitted = 0;
    for window in plan(high, now, max_span, Direction::Forward) {
        if ctx.cancel.is_cancelled() {
            info!(entity, "Cancellation received, leaving the rest of the gap for the next run");
            break;
        }
        match ctx.fetch_window(entity, window).await {
            Ok(data) => {
                submitted += ctx.deliver(entity, data, None, Some(window.end)).await?;
            }
            Err(e) => {
                warn!(entity, %window, error = %e, "Frontfill failed, leaving the gap for the next run");
                break;
            }
        }
    }
    debug!(entity, points = submitted, "Frontfilled entity");
    Ok(submitted)
}
