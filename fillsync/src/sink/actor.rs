use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Receiver;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{FlushCallback, PointWriter};
use crate::config::RetryConfig;
use crate::datapoint::{Batch, DataPoint, Entity};
use crate::error::{Error, Result};
use crate::retry::Exponential;

/// Messages the [SinkActor] understands.
pub(super) enum SinkActorMessage {
    Submit {
        entity: Entity,
        points: Vec<DataPoint>,
        permit: OwnedSemaphorePermit,
    },
    Flush {
        respond_to: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<Result<()>>,
    },
}

/// Owns the buffer. Everything that touches it goes through the actor's mailbox, so enqueue and
/// flush never interleave.
pub(super) struct SinkActor<W> {
    actor_messages: Receiver<SinkActorMessage>,
    writer: W,
    buffer: Batch,
    held_permits: Vec<OwnedSemaphorePermit>,
    permits: Arc<Semaphore>,
    max_queue_size: usize,
    max_flush_interval: Duration,
    retry_config: RetryConfig,
    on_flush: Option<FlushCallback>,
    cancel_on_failure: Option<CancellationToken>,
}

impl<W> SinkActor<W>
where
    W: PointWriter,
{
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        actor_messages: Receiver<SinkActorMessage>,
        writer: W,
        permits: Arc<Semaphore>,
        max_queue_size: usize,
        max_flush_interval: Duration,
        retry_config: RetryConfig,
        on_flush: Option<FlushCallback>,
        cancel_on_failure: Option<CancellationToken>,
    ) -> Self {
        Self {
            actor_messages,
            writer,
            buffer: Batch::default(),
            held_permits: Vec::new(),
            permits,
            max_queue_size,
            max_flush_interval,
            retry_config,
            on_flush,
            cancel_on_failure,
        }
    }

    /// Runs until shut down, every handle is dropped, or a write fails for good.
    pub(super) async fn run(mut self) -> Result<()> {
        let result = self.process().await;
        if let Err(e) = &result {
            error!(?e, "Sink is unavailable, stopping");
            if let Some(cancel) = &self.cancel_on_failure {
                cancel.cancel();
            }
        }
        result
    }

    async fn process(&mut self) -> Result<()> {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.max_flush_interval,
            self.max_flush_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = self.actor_messages.recv() => {
                    let Some(message) = message else {
                        info!("All sink handles dropped, flushing remaining points");
                        return self.flush().await;
                    };
                    match message {
                        SinkActorMessage::Submit { entity, points, permit } => {
                            self.buffer.push(entity, points);
                            self.held_permits.push(permit);
                            if self.buffer.len() >= self.max_queue_size {
                                self.flush().await?;
                                ticker.reset();
                            }
                        }
                        SinkActorMessage::Flush { respond_to } => {
                            let result = self.flush().await;
                            let _ = respond_to.send(result.clone());
                            result?;
                            ticker.reset();
                        }
                        SinkActorMessage::Shutdown { respond_to } => {
                            let result = self.flush().await;
                            let _ = respond_to.send(result.clone());
                            return result;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.flush().await?;
                }
            }
        }
    }

    /// On a fatal write failure the permits are closed, so blocked and future submitters fail
    /// instead of waiting for space that never frees up.
    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = self.buffer.take();
        // released only once the points are written
        let permits = std::mem::take(&mut self.held_permits);

        if let Err(e) = self.write_with_retry(&batch).await {
            self.permits.close();
            return Err(e);
        }
        if let Some(on_flush) = &self.on_flush {
            on_flush(&batch);
        }
        drop(permits);
        Ok(())
    }

    async fn write_with_retry(&mut self, batch: &Batch) -> Result<()> {
        let mut backoff = Exponential::from(&self.retry_config);
        let mut retry_attempt = 0u16;
        loop {
            let err = match self.writer.write(batch).await {
                Ok(()) => {
                    debug!(points = batch.len(), "Flushed batch");
                    return Ok(());
                }
                Err(e) => e,
            };

            match backoff.next() {
                Some(delay) => {
                    retry_attempt += 1;
                    warn!(?retry_attempt, ?delay, error = %err, points = batch.len(), "Retrying batch write");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(Error::Sink(format!(
                        "write of {} points failed after {retry_attempt} retries: {err}",
                        batch.len()
                    )));
                }
            }
        }
    }
}
