use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::error;

use crate::error::{ReplayError, Result};
use crate::interceptor::PacketHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldEntry {
    pub handle: PacketHandle,
    pub fingerprint: u32,
    pub enqueue_order: u64,
    /// Local clock reading when the packet was parked.
    pub held_at_ms: i64,
}

/// Verdict of the drain predicate on the entry at the head of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Due {
    Release,
    /// Not due before this local-clock deadline.
    Wait(i64),
    /// The entry cannot be judged this pass; leave it and everything behind it.
    Halt,
}

#[derive(Debug, Default)]
pub struct Drain {
    pub released: Vec<HeldEntry>,
    /// Deadline of the entry the pass stopped at, if it was merely early.
    pub next_deadline: Option<i64>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<HeldEntry>,
    next_order: u64,
}

// ==========================================
// Shared hold queue (producer: interception, consumer: releaser)
// ==========================================
#[derive(Debug)]
pub struct HoldQueue {
    inner: Mutex<Inner>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl Default for HoldQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl HoldQueue {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            inner: Mutex::new(Inner::default()),
            wake_tx,
            wake_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends at the tail and nudges the releaser. Returns the entry's
    /// enqueue order.
    pub fn push_tail(&self, handle: PacketHandle, fingerprint: u32, now_ms: i64) -> Result<u64> {
        let order = {
            let mut inner = self.lock();
            if inner.entries.try_reserve(1).is_err() {
                error!(?handle, "cannot grow hold queue");
                return Err(ReplayError::ResourceExhaustion("hold queue"));
            }
            let order = inner.next_order;
            inner.next_order += 1;
            inner.entries.push_back(HeldEntry {
                handle,
                fingerprint,
                enqueue_order: order,
                held_at_ms: now_ms,
            });
            order
        };
        self.wake();
        Ok(order)
    }

    /// Removes the due prefix of the queue, stopping at the first entry that
    /// is not due. Later entries are never released past an earlier one.
    pub fn scan_and_remove_due<F>(&self, mut due: F) -> Drain
    where
        F: FnMut(&HeldEntry) -> Due,
    {
        let mut drain = Drain::default();
        let mut inner = self.lock();
        while let Some(head) = inner.entries.front() {
            match due(head) {
                Due::Release => {
                    if let Some(entry) = inner.entries.pop_front() {
                        drain.released.push(entry);
                    }
                }
                Due::Wait(deadline) => {
                    drain.next_deadline = Some(deadline);
                    break;
                }
                Due::Halt => break,
            }
        }
        drain
    }

    /// Empties the queue in arrival order.
    pub fn flush(&self) -> Vec<HeldEntry> {
        self.lock().entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes a sleeping releaser. A pending wake is never doubled.
    pub fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    pub(crate) fn wake_receiver(&self) -> Receiver<()> {
        self.wake_rx.clone()
    }
}
