//! Keeps a destination time-series store in sync with a polling-only source that answers bounded
//! windowed history queries and "latest value" queries.
//!
//! Three phases share one source, one batching sink and one set of per-entity watermarks:
//! - [Frontfiller] closes the gap between the last synchronized point and now, once at startup.
//! - [Streamer] then keeps polling the newest data.
//! - [Backfiller] runs next to it, walking back in time until the configured horizon is reached.
//!
//! [run] wires everything together and drives it until the shared cancellation token fires.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span};

pub use self::error::{Error, FetchError, Result};

mod error;

mod backfill;
mod frontfill;
mod retry;
mod shared;
mod stream;
mod throttle;

pub mod clock;
pub mod config;
pub mod datapoint;
pub mod setup_tracing;
pub mod sink;
pub mod source;
pub mod watermark;
pub mod window;

#[cfg(test)]
mod test_utils;

pub use backfill::{BackfillSummary, Backfiller};
pub use clock::{Clock, SystemClock};
pub use config::Settings;
pub use datapoint::{Batch, DataPoint, Entity, SourceData, Timestamp, Value};
pub use frontfill::Frontfiller;
pub use shared::SyncContext;
pub use sink::{BatchSink, BatchSinkBuilder, PointWriter};
pub use source::SourceClient;
pub use stream::Streamer;
pub use throttle::ThrottleLoop;
pub use watermark::{Watermark, WatermarkBackend, WatermarkStore};

/// Runs the whole synchronization for `entities`: restores the watermarks from `backend`,
/// frontfills, then streams and backfills concurrently until `cancel` fires (or backfill signals
/// completion). On the way out the sink is drained before the watermarks are persisted one last
/// time.
///
/// Fetch failures never end the run. A sink that stays unavailable does, as does a failure of the
/// final watermark persist.
pub async fn run<S, W>(
    settings: Settings,
    entities: Vec<Entity>,
    source: S,
    writer: W,
    backend: Arc<dyn WatermarkBackend>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) -> Result<()>
where
    S: SourceClient + Send + Sync + 'static,
    W: PointWriter + 'static,
{
    settings.validate()?;
    info!(entities = entities.len(), "Starting synchronization");

    let store = WatermarkStore::load(backend).await?;
    let sink = BatchSinkBuilder::new(writer, settings.sink.clone())
        .retry_config(settings.sink_retry.clone())
        .cancel_on_failure(cancel.clone())
        .span(info_span!("sink"))
        .build();

    // separate token, the last persist has to come after the sink is drained
    let persister_cancel = CancellationToken::new();
    let persister =
        store.spawn_persister(settings.state.persist_interval, persister_cancel.clone());

    let ctx = SyncContext::new(Arc::new(source), store, sink.clone(), clock, cancel)
        .with_fetch_retry(settings.fetch_retry.clone());
    let phases = run_phases(&settings, ctx, entities).await;
    if let Err(e) = &phases {
        error!(?e, "Synchronization failed");
    }

    let drained = sink.shutdown().await;
    persister_cancel.cancel();
    let persisted = persister.await?;
    info!("Synchronization stopped");

    phases.and(drained).and(persisted)
}

/// Frontfill first, then stream and backfill side by side. A failing phase cancels the other.
async fn run_phases<S>(settings: &Settings, ctx: SyncContext<S>, entities: Vec<Entity>) -> Result<()>
where
    S: SourceClient + Send + Sync + 'static,
{
    if settings.frontfill.enabled {
        Frontfiller::new(ctx.clone(), settings.frontfill.clone())
            .run(&entities)
            .await?;
    }

    let entities = Arc::new(entities);
    let mut phases = JoinSet::new();

    if settings.stream.enabled {
        let streamer = Streamer::new(ctx.clone(), settings.stream.clone());
        let entities = Arc::clone(&entities);
        phases.spawn(async move { streamer.run(&entities).await });
    }

    if settings.backfill.enabled {
        let backfiller = Backfiller::new(ctx.clone(), settings.backfill.clone());
        let entities = Arc::clone(&entities);
        phases.spawn(async move {
            let summary = backfiller.run(&entities).await?;
            info!(?summary, "Backfill finished");
            Ok(())
        });
    }

    let mut result = Ok(());
    while let Some(joined) = phases.join_next().await {
        if let Err(e) = joined.map_err(Error::from).and_then(|phase| phase) {
            error!(?e, "Phase failed, cancelling the others");
            ctx.cancel.cancel();
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    result
}
