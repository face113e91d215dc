//! Per-worker ready queue: one FIFO per priority tier.
//!
//! The backing is selectable at runtime: a locked `VecDeque` triple, or a
//! lock-free intrusive MPSC (stub-based or Nemesis) where producers
//! enqueue without the lock and only consumers serialize. Stealers use
//! [`ReadyQueue::try_dequeue`], which probes a length counter first and
//! may fail spuriously when the consumer lock is contended.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use lepton_core::queue::{NemesisQueue, StubQueue};
use parking_lot::Mutex;

use crate::task::{Priority, Task, TaskRef};

/// Backing store selection for ready queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyQueueKind {
    /// `VecDeque` per priority, all operations under one lock.
    Locked,
    /// Stub-based intrusive MPSC per priority.
    Stub,
    /// Nemesis intrusive MPSC per priority.
    Nemesis,
}

enum PrioQueue {
    Locked(UnsafeCell<VecDeque<TaskRef>>),
    Stub(StubQueue),
    Nemesis(NemesisQueue),
}

// SAFETY: the Locked variant's cell is only touched under `lock`; the
// MPSC variants are internally synchronized.
unsafe impl Send for PrioQueue {}
unsafe impl Sync for PrioQueue {}

pub(crate) struct ReadyQueue {
    lock: Mutex<()>, // consumer side (and producers in Locked mode)
    len: AtomicUsize,
    prios: [PrioQueue; Priority::COUNT],
}

impl ReadyQueue {
    pub(crate) fn new(kind: ReadyQueueKind) -> Self {
        let mk = || match kind {
            ReadyQueueKind::Locked => PrioQueue::Locked(UnsafeCell::new(VecDeque::new())),
            ReadyQueueKind::Stub => PrioQueue::Stub(StubQueue::new()),
            ReadyQueueKind::Nemesis => PrioQueue::Nemesis(NemesisQueue::new()),
        };
        Self {
            lock: Mutex::new(()),
            len: AtomicUsize::new(0),
            prios: [mk(), mk(), mk()],
        }
    }

    /// Appends a task at the tail of its priority tier.
    pub(crate) fn enqueue(&self, t: TaskRef) {
        // SAFETY: t is a live task handed over by its resumer.
        let pri = unsafe { t.as_ref() }.priority() as usize;
        match &self.prios[pri] {
            PrioQueue::Locked(q) => {
                let _g = self.lock.lock();
                // SAFETY: cell accessed under the lock.
                unsafe { (*q.get()).push_back(t) };
            }
            PrioQueue::Stub(q) => {
                // SAFETY: a ready task is in exactly this queue.
                unsafe { q.push(t.as_ref().as_link()) };
            }
            PrioQueue::Nemesis(q) => {
                // SAFETY: as above.
                unsafe {
                    q.push(t.as_ref().as_link());
                }
            }
        }
        self.len.fetch_add(1, Ordering::Release);
    }

    fn pop_locked(&self) -> Option<TaskRef> {
        for q in &self.prios {
            let t = match q {
                // SAFETY: caller holds `lock`.
                PrioQueue::Locked(q) => unsafe { (*q.get()).pop_front() },
                // SAFETY: caller holds `lock` (single consumer).
                PrioQueue::Stub(q) => unsafe { q.pop() }
                    // SAFETY: only task links enter this queue.
                    .map(|l| unsafe { Task::from_link(l) }),
                // SAFETY: as above.
                PrioQueue::Nemesis(q) => unsafe { q.pop() }
                    // SAFETY: as above.
                    .map(|l| unsafe { Task::from_link(l) }),
            };
            if let Some(t) = t {
                self.len.fetch_sub(1, Ordering::Release);
                return Some(t);
            }
        }
        None
    }

    /// Removes the highest-priority ready task (owner side).
    pub(crate) fn dequeue(&self) -> Option<TaskRef> {
        let _g = self.lock.lock();
        self.pop_locked()
    }

    /// Nonblocking steal-side dequeue: probes, then tries the consumer
    /// lock. May fail spuriously under contention.
    pub(crate) fn try_dequeue(&self) -> Option<TaskRef> {
        if !self.probe() {
            return None;
        }
        let _g = self.lock.try_lock()?;
        self.pop_locked()
    }

    /// Advisory emptiness probe.
    fn probe(&self) -> bool {
        self.len.load(Ordering::Acquire) > 0
    }
}
