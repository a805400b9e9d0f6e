//! Batching upload queue in front of the destination store.
//!
//! Submitted points are buffered by a single actor task and written through a [PointWriter] once
//! either `max_queue_size` points are buffered or `max_flush_interval` has passed, whichever comes
//! first. Submitters hold a point permit per buffered point, so when `max_queue_size` points are
//! waiting to be written the next submit blocks instead of dropping anything.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, info_span};

use crate::config::{RetryConfig, SinkConfig};
use crate::datapoint::{Batch, DataPoint, Entity};
use crate::error::{Error, Result};

mod actor;

use actor::{SinkActor, SinkActorMessage};

const ACTOR_CHANNEL_SIZE: usize = 500;

/// The destination write path.
#[trait_variant::make(PointWriter: Send)]
pub trait LocalPointWriter {
    /// Writes every point of the batch. An error means nothing may be assumed written, the batch
    /// is retried as a whole.
    async fn write(&mut self, batch: &Batch) -> Result<()>;
}

/// Called with every batch after it was written.
pub type FlushCallback = Arc<dyn Fn(&Batch) + Send + Sync>;

/// Builds a [BatchSink] and starts its actor.
pub struct BatchSinkBuilder<W> {
    writer: W,
    config: SinkConfig,
    retry_config: RetryConfig,
    on_flush: Option<FlushCallback>,
    cancel_on_failure: Option<CancellationToken>,
    span: Option<Span>,
}

impl<W> BatchSinkBuilder<W>
where
    W: PointWriter + 'static,
{
    pub fn new(writer: W, config: SinkConfig) -> Self {
        Self {
            writer,
            config,
            retry_config: RetryConfig::sink_default(),
            on_flush: None,
            cancel_on_failure: None,
            span: None,
        }
    }

    pub fn retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    pub fn on_flush(mut self, on_flush: FlushCallback) -> Self {
        self.on_flush = Some(on_flush);
        self
    }

    /// Cancels `cancel` when a write fails for good, so the phases stop feeding a dead sink.
    pub fn cancel_on_failure(mut self, cancel: CancellationToken) -> Self {
        self.cancel_on_failure = Some(cancel);
        self
    }

    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Spawns the actor, hence must be called within a tokio runtime.
    pub fn build(self) -> BatchSink {
        let max_queue_size = self.config.max_queue_size.clamp(1, Semaphore::MAX_PERMITS);
        let permits = Arc::new(Semaphore::new(max_queue_size));
        let (sender, receiver) = mpsc::channel(ACTOR_CHANNEL_SIZE);

        let actor = SinkActor::new(
            receiver,
            self.writer,
            Arc::clone(&permits),
            max_queue_size,
            self.config.max_flush_interval,
            self.retry_config,
            self.on_flush,
            self.cancel_on_failure,
        );
        let span = self.span.unwrap_or_else(|| info_span!("sink"));
        let task = tokio::spawn(actor.run().instrument(span));

        BatchSink {
            sender,
            permits,
            max_queue_size,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

/// Cloneable handle to the sink actor.
#[derive(Clone)]
pub struct BatchSink {
    sender: mpsc::Sender<SinkActorMessage>,
    permits: Arc<Semaphore>,
    max_queue_size: usize,
    task: Arc<Mutex<Option<JoinHandle<Result<()>>>>>,
}

impl BatchSink {
    /// Hands `points` to the sink, waiting while the buffer is full. Once this returns `Ok` the
    /// points are accepted and will be written unless the sink fails for good.
    pub async fn submit(&self, entity: Entity, points: Vec<DataPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        // a submission larger than the whole buffer takes every permit
        let wanted = u32::try_from(points.len().min(self.max_queue_size)).unwrap_or(u32::MAX);
        let permit = Arc::clone(&self.permits)
            .acquire_many_owned(wanted)
            .await
            .map_err(|_| Error::Sink("sink is no longer accepting points".to_string()))?;

        self.sender
            .send(SinkActorMessage::Submit {
                entity,
                points,
                permit,
            })
            .await
            .map_err(|_| Error::Sink("sink actor is gone".to_string()))
    }

    /// Writes whatever is buffered right now and waits for it.
    pub async fn flush(&self) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(SinkActorMessage::Flush { respond_to })
            .await
            .map_err(|_| Error::Sink("sink actor is gone".to_string()))?;
        response
            .await
            .map_err(|_| Error::Sink("sink actor dropped the flush request".to_string()))?
    }

    /// Flushes everything submitted before this call and stops the actor. Returns the outcome of
    /// the actor, including a fatal write failure that happened earlier.
    pub async fn shutdown(&self) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        if self
            .sender
            .send(SinkActorMessage::Shutdown { respond_to })
            .await
            .is_ok()
        {
            let _ = response.await;
        }

        let task = self.task.lock().take();
        match task {
            Some(task) => task.await?,
            None => Ok(()),
        }
    }
}
