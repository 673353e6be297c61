//! Processing slot pool
//!
//! The only counter set shared by every row worker. All five counters live
//! behind one mutex so a reservation or release updates them together.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

const MIN_ACQUIRE_BACKOFF: Duration = Duration::from_millis(10);
const MAX_ACQUIRE_BACKOFF: Duration = Duration::from_millis(500);

/// Point-in-time copy of the slot counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SlotCounters {
    pub pending: usize,
    pub processing: usize,
    pub completed: u64,
    pub failed: u64,
    pub max_concurrent: usize,
}

/// Bounded pool of concurrent row-processing slots
#[derive(Debug)]
pub struct SlotPool {
    counters: Mutex<SlotCounters>,
    released: Notify,
}

impl SlotPool {
    pub fn new(max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            counters: Mutex::new(SlotCounters {
                max_concurrent: max_concurrent.max(1),
                ..SlotCounters::default()
            }),
            released: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SlotCounters> {
        self.counters.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn counters(&self) -> SlotCounters {
        *self.lock()
    }

    pub fn max_concurrent(&self) -> usize {
        self.lock().max_concurrent
    }

    pub fn has_free_slot(&self) -> bool {
        let c = self.lock();
        c.processing < c.max_concurrent
    }

    /// Resize the pool; only the resource monitor calls this
    pub(crate) fn set_max_concurrent(&self, max_concurrent: usize) {
        let grew = {
            let mut c = self.lock();
            let grew = max_concurrent > c.max_concurrent;
            c.max_concurrent = max_concurrent.max(1);
            grew
        };
        if grew {
            self.released.notify_waiters();
        }
    }

    /// Register rows that will ask for a slot
    pub fn enqueue(&self, rows: usize) {
        self.lock().pending += rows;
    }

    /// Reserve a slot without waiting
    pub fn try_reserve(self: &Arc<Self>) -> Option<SlotPermit> {
        let mut c = self.lock();
        if c.processing >= c.max_concurrent {
            return None;
        }
        c.pending = c.pending.saturating_sub(1);
        c.processing += 1;
        Some(SlotPermit {
            pool: Arc::clone(self),
            succeeded: false,
        })
    }

    /// Wait until a slot frees up
    ///
    /// Woken by releases, with a bounded polling fallback in case the pool
    /// was resized between the check and the wait.
    pub async fn acquire(self: &Arc<Self>) -> SlotPermit {
        let mut backoff = MIN_ACQUIRE_BACKOFF;
        loop {
            let notified = self.released.notified();
            if let Some(permit) = self.try_reserve() {
                return permit;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(backoff) => {
                    backoff = (backoff * 2).min(MAX_ACQUIRE_BACKOFF);
                }
            }
        }
    }

    fn release(&self, succeeded: bool) {
        {
            let mut c = self.lock();
            c.processing = c.processing.saturating_sub(1);
            if succeeded {
                c.completed += 1;
            } else {
                c.failed += 1;
            }
        }
        self.released.notify_waiters();
    }
}

/// A reserved slot; releasing it records the outcome
///
/// Dropping a permit without calling [`SlotPermit::succeed`] counts as a failure.
#[derive(Debug)]
pub struct SlotPermit {
    pool: Arc<SlotPool>,
    succeeded: bool,
}

impl SlotPermit {
    pub fn succeed(mut self) {
        self.succeeded = true;
    }

    pub fn fail(self) {}
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.pool.release(self.succeeded);
    }
}
