//! Delayed retry tasks
//!
//! Each retry is a task that sleeps for its backoff delay and then runs. The
//! tasks are tracked so shutdown can wait for every pending retry, and a
//! cancelled job stops both new and still-sleeping retries.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RetryScheduler {
    tracker: TaskTracker,
    cancel: CancellationToken,
    waiting: Arc<AtomicUsize>,
}

impl RetryScheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel,
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Retries still sleeping
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Retries sleeping or running
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Run `task` after `delay`; returns `false` if the job was cancelled
    pub fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let cancel = self.cancel.clone();
        let waiting = Arc::clone(&self.waiting);
        waiting.fetch_add(1, Ordering::SeqCst);
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    waiting.fetch_sub(1, Ordering::SeqCst);
                    debug!("Retry dropped after cancellation");
                }
                _ = tokio::time::sleep(delay) => {
                    waiting.fetch_sub(1, Ordering::SeqCst);
                    task.await;
                }
            }
        });
        true
    }

    /// Wait until every scheduled retry, including retries they schedule, finished
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_chained_retries() {
        let scheduler = RetryScheduler::new(CancellationToken::new());
        let runs = Arc::new(AtomicU32::new(0));

        let inner_runs = Arc::clone(&runs);
        let inner_scheduler = scheduler.clone();
        scheduler.schedule(
            Duration::from_secs(1),
            Box::pin(async move {
                inner_runs.fetch_add(1, Ordering::SeqCst);
                let again = Arc::clone(&inner_runs);
                inner_scheduler.schedule(
                    Duration::from_secs(2),
                    Box::pin(async move {
                        again.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }),
        );
        assert_eq!(scheduler.waiting(), 1);

        scheduler.drain().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_new_and_sleeping_retries() {
        let cancel = CancellationToken::new();
        let scheduler = RetryScheduler::new(cancel.clone());
        let runs = Arc::new(AtomicU32::new(0));

        let counted = Arc::clone(&runs);
        assert!(scheduler.schedule(
            Duration::from_secs(30),
            Box::pin(async move {
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        ));
        cancel.cancel();
        assert!(!scheduler.schedule(Duration::ZERO, Box::pin(async {})));

        scheduler.drain().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.waiting(), 0);
    }
}
