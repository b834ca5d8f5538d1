//! Dispatcher / executor (C13).
//!
//! A single scheduling interface with two conceptual implementations
//! (§4.13): an in-process bounded worker pool (implemented here) and an
//! external-queue adapter (declared as a trait only — the queue itself is
//! operator-exposed through admin endpoints explicitly out of scope for
//! this core). Both must honour graceful shutdown: stop accepting new
//! work, drain in-flight jobs within a bounded time, refuse new submissions
//! with the same outcome a full queue would produce.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Semaphore};

pub type BoxedJob = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Either genuinely shutting down, or the bounded queue is full — both
    /// surface identically to the HTTP layer as `503` (§4.13).
    #[error("dispatcher is shutting down or at capacity")]
    Unavailable,
}

/// Scheduling interface the HTTP ingress layer submits jobs through.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn submit(&self, job: BoxedJob) -> Result<(), DispatchError>;
    fn is_shutting_down(&self) -> bool;
}

/// Bounded in-process worker pool. Concurrency is capped by a semaphore
/// with `max_concurrency` permits; submissions beyond that are rejected
/// rather than queued unboundedly, and shutdown is implemented by flipping
/// a flag and then trying to reacquire every permit within a grace period.
pub struct InProcessDispatcher {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl InProcessDispatcher {
    pub fn new(max_concurrency: usize) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.shutdown_rx.clone(),
        }
    }

    /// Stops accepting new work, then waits up to `grace` for in-flight
    /// jobs to finish (detected by reacquiring every permit). Returns
    /// `true` if the drain completed cleanly within the deadline.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let _ = self.shutdown_tx.send(true);
        let semaphore = Arc::clone(&self.semaphore);
        let permits_needed = self.max_concurrency as u32;
        tokio::time::timeout(grace, async move {
            let _ = semaphore.acquire_many(permits_needed).await;
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl Dispatcher for InProcessDispatcher {
    async fn submit(&self, job: BoxedJob) -> Result<(), DispatchError> {
        if *self.shutdown_rx.borrow() {
            return Err(DispatchError::Unavailable);
        }
        let permit = Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map_err(|_| DispatchError::Unavailable)?;
        tokio::spawn(async move {
            job.await;
            drop(permit);
        });
        Ok(())
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

/// Adapter interface for a durable external queue (e.g. a stream with a
/// consumer group and a dead-letter stream after `max_attempts`). The queue
/// itself, and its operator-facing admin surface, are out of scope here
/// (§4.13); this trait only pins the contract a future implementation must
/// satisfy to slot in behind the same [`Dispatcher`] interface.
#[async_trait]
pub trait ExternalQueueAdapter: Send + Sync {
    async fn enqueue(&self, ticket_id: i64, delivery_id: Option<String>) -> Result<(), DispatchError>;
}

/// Cooperative cancellation signal handed to the orchestrator so a job
/// in flight during shutdown unwinds through the same cleanup path as an
/// error (§5, "forced cancellation").
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once shutdown has been signalled. Intended for use inside
    /// `tokio::select!` alongside the job's own work.
    pub async fn cancelled(&mut self) {
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.receiver.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    #[tokio::test]
    async fn submit_runs_job_and_releases_permit() {
        let dispatcher = InProcessDispatcher::new(2);
        let counter = StdArc::new(AtomicUsize::new(0));
        let counter_clone = StdArc::clone(&counter);
        dispatcher
            .submit(Box::pin(async move {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn submit_rejects_beyond_max_concurrency() {
        let dispatcher = InProcessDispatcher::new(1);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let rx = StdArc::new(tokio::sync::Mutex::new(Some(rx)));
        dispatcher
            .submit(Box::pin(async move {
                let rx = rx.lock().await.take().unwrap();
                let _ = rx.await;
            }))
            .await
            .unwrap();

        let second = dispatcher.submit(Box::pin(async {})).await;
        assert_eq!(second, Err(DispatchError::Unavailable));
        let _ = tx.send(());
    }

    #[tokio::test]
    async fn submit_rejects_after_shutdown_signalled() {
        let dispatcher = InProcessDispatcher::new(4);
        let _ = dispatcher.shutdown_tx.send(true);
        let result = dispatcher.submit(Box::pin(async {})).await;
        assert_eq!(result, Err(DispatchError::Unavailable));
    }

    #[tokio::test]
    async fn shutdown_drains_within_grace_period() {
        let dispatcher = InProcessDispatcher::new(1);
        dispatcher
            .submit(Box::pin(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }))
            .await
            .unwrap();
        let drained = dispatcher.shutdown(Duration::from_millis(200)).await;
        assert!(drained);
    }

    #[tokio::test]
    async fn shutdown_signal_resolves_after_shutdown_is_sent() {
        let dispatcher = InProcessDispatcher::new(1);
        let mut signal = dispatcher.shutdown_signal();
        let handle = tokio::spawn(async move {
            signal.cancelled().await;
        });
        dispatcher.shutdown(Duration::from_millis(50)).await;
        handle.await.unwrap();
    }
}
