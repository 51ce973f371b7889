//! Requests for a runner and the future callers await

use super::runner::RunnerHandle;
use crate::error::{Result, SchedulerError};
use crate::model::Model;
use crate::options::{KeepAlive, RunnerOptions};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};

/// One in-flight ask for a runner, consumed by the decision loop
pub(crate) struct LlmRequest {
    pub id: u64,
    pub model: Arc<Model>,
    pub options: RunnerOptions,
    pub keep_alive: Option<KeepAlive>,
    pub ctx: CancellationToken,
    pub reply: oneshot::Sender<Result<RunnerHandle>>,
    pub enqueued_at: Instant,
}

impl LlmRequest {
    /// Resolve the request. If the caller is gone the handle is dropped,
    /// which returns its reference to the loop.
    pub fn resolve(self, result: Result<RunnerHandle>) {
        let _ = self.reply.send(result);
    }

    pub fn is_cancelled(&self) -> bool {
        self.ctx.is_cancelled() || self.reply.is_closed()
    }
}

/// Future returned by `Scheduler::get_runner`; resolves exactly once
pub struct PendingRunner {
    rx: oneshot::Receiver<Result<RunnerHandle>>,
    _watch: Option<DropGuard>,
}

impl PendingRunner {
    pub(crate) fn new(rx: oneshot::Receiver<Result<RunnerHandle>>, watch: DropGuard) -> Self {
        Self { rx, _watch: Some(watch) }
    }

    /// Already resolved with an error
    pub(crate) fn failed(err: SchedulerError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self { rx, _watch: None }
    }
}

impl Future for PendingRunner {
    type Output = Result<RunnerHandle>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The loop dropped the request without answering: it is gone
            Poll::Ready(Err(_)) => Poll::Ready(Err(SchedulerError::ShuttingDown)),
            Poll::Pending => Poll::Pending,
        }
    }
}
