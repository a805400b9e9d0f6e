use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

/// Runs a unit of work at most once per `target_interval`.
///
/// The loop holds no policy: errors from the work unit are returned to the caller as they are,
/// retries belong to the work itself. Cancellation is checked before each iteration and while
/// waiting, never in the middle of one.
#[derive(Debug, Clone)]
pub struct ThrottleLoop {
    target_interval: Duration,
    cancel: CancellationToken,
    span: Span,
}

impl ThrottleLoop {
    pub fn new(target_interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            target_interval,
            cancel,
            span: info_span!("throttle_loop"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Calls `work` with the 1-based iteration number until it breaks, fails, or the token is
    /// cancelled. An iteration that overruns the target is followed immediately by the next one.
    pub async fn run<F, Fut, E>(&self, mut work: F) -> Result<(), E>
    where
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = Result<ControlFlow<()>, E>>,
    {
        async move {
            let mut iteration = 0u64;
            loop {
                if self.cancel.is_cancelled() {
                    info!(iteration, "Cancellation received, stopping loop");
                    return Ok(());
                }

                iteration += 1;
                let started = Instant::now();
                if work(iteration).await?.is_break() {
                    debug!(iteration, "Work is done, stopping loop");
                    return Ok(());
                }

                let elapsed = started.elapsed();
                let Some(wait) = self.target_interval.checked_sub(elapsed) else {
                    warn!(
                        iteration,
                        ?elapsed,
                        target_interval = ?self.target_interval,
                        "Iteration overran its target interval, starting the next one now"
                    );
                    continue;
                };

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.cancel.cancelled() => {
                        info!(iteration, "Cancellation received while waiting, stopping loop");
                        return Ok(());
                    }
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }
}
