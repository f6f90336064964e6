//! Cross-collector dispatch: wait for any ready batch
//!
//! All collectors of a context share one ready queue guarded by a single
//! mutex and condition variable. A consumer blocks in [`ReadyQueue::wait`]
//! until some collector posts a filled slot; batches from one collector come
//! out in the order they became ready, batches from different collectors in
//! arbitrary order. Every blocking wait re-checks the shared done flag at the
//! poll interval so `stop` releases consumers promptly.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::time::{ Duration, Instant };

use parking_lot::{ Condvar, Mutex };
use tracing::debug;

use crate::batch::{ BatchSlot, SlotState };
use crate::constants::DONE_POLL_INTERVAL;

/// Identifier of one collector (one consumer name shard) within a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectorId(pub usize);

impl fmt::Display for CollectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collector#{}", self.0)
    }
}

/// A batch slot posted for consumption
pub struct Ready {
    /// The collector that filled the slot
    pub collector: CollectorId,
    /// The filled slot, in `Ready` state until a consumer claims it
    pub slot: Arc<BatchSlot>,
}

/// The shared wait point between collectors and consumers
pub struct ReadyQueue {
    queue: Mutex<VecDeque<Ready>>,
    cv: Condvar,
    done: Arc<AtomicBool>,
}

impl ReadyQueue {
    /// Create a queue tied to the context's done flag
    pub fn new(done: Arc<AtomicBool>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            done,
        }
    }

    /// Post a filled slot; called by collector threads
    pub fn post(&self, collector: CollectorId, slot: Arc<BatchSlot>) {
        debug_assert_eq!(slot.state(), SlotState::Ready);
        debug!(%collector, rows = slot.rows(), "batch ready");
        self.queue.lock().push_back(Ready { collector, slot });
        self.cv.notify_one();
    }

    /// Block until any collector has a ready batch.
    ///
    /// `None` timeout waits indefinitely; otherwise the wait is bounded and
    /// returns `None` on expiry. Also returns `None` once the done flag is
    /// set. The returned slot has been moved to `InFlight` and belongs to the
    /// caller until stepped.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<Ready> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut queue = self.queue.lock();
        loop {
            if let Some(ready) = queue.pop_front() {
                ready.slot
                    .transition(SlotState::Ready, SlotState::InFlight)
                    .expect("queued slot must be in Ready state");
                return Some(ready);
            }
            if self.done.load(Ordering::Acquire) {
                return None;
            }
            let step = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    (deadline - now).min(DONE_POLL_INTERVAL)
                }
                None => DONE_POLL_INTERVAL,
            };
            self.cv.wait_for(&mut queue, step);
        }
    }

    /// Batches currently queued
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether no batch is queued
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Wake every blocked waiter; called on stop
    pub fn close(&self) {
        self.cv.notify_all();
    }
}
