//! Idle management: tracking workers with nothing to run and waking them
//! when work appears.
//!
//! Two interchangeable designs, selected at bootstrap:
//!
//! - [`CounterIdle`]: a signed counter of ready-tasks-minus-waiters. A
//!   producer that drives the counter up from a negative value either
//!   hands the task straight to a parked worker (handover slot) or parks
//!   the task in a pending queue; either way the task is *not* on a ready
//!   queue and the producer is told so.
//! - [`SpinWaitIdle`]: separate spinning/waiting populations. Workers spin
//!   through the ring before joining the waiting set; a producer wakes one
//!   waiter whenever the spinning population would otherwise drop to zero.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicIsize, Ordering};

use parking_lot::Mutex;

use crate::stats::{self, StatBlock};
use crate::task::TaskRef;

use super::worker::Worker;

/// Idle-manager variant selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleManagerKind {
    /// Ready-task counter with direct handover.
    Counter,
    /// Spinning/waiting population counters.
    SpinWait,
}

pub(crate) enum IdleManager {
    Counter(CounterIdle),
    SpinWait(SpinWaitIdle),
}

impl IdleManager {
    pub(crate) fn new(kind: IdleManagerKind) -> Self {
        match kind {
            IdleManagerKind::Counter => IdleManager::Counter(CounterIdle::new()),
            IdleManagerKind::SpinWait => IdleManager::SpinWait(SpinWaitIdle::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Counter-based manager
// ---------------------------------------------------------------------------

struct CounterInner {
    waiting: Vec<&'static Worker>,
    pending: VecDeque<TaskRef>,
}

// SAFETY: TaskRefs held here are parked tasks in flight between a
// producer and a woken worker.
unsafe impl Send for CounterInner {}

pub(crate) struct CounterIdle {
    counter: AtomicIsize, // > 0: ready tasks available; < 0: waiters
    inner: Mutex<CounterInner>,
    stats: &'static StatBlock,
}

const STAT_READY: usize = 0;
const STAT_BLOCKED: usize = 1;

impl CounterIdle {
    fn new() -> Self {
        Self {
            counter: AtomicIsize::new(0),
            inner: Mutex::new(CounterInner {
                waiting: Vec::new(),
                pending: VecDeque::new(),
            }),
            stats: stats::register("idle-manager".into(), &["ready", "blocked"]),
        }
    }

    /// Claims one ready task if the counter says some exist, without ever
    /// parking. Used by the nonblocking schedule path.
    pub(crate) fn try_get_ready(&self) -> bool {
        let mut c = self.counter.load(Ordering::Relaxed);
        loop {
            if c <= 0 {
                return false;
            }
            match self.counter.compare_exchange_weak(
                c,
                c - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(cur) => c = cur,
            }
        }
    }

    /// Claims a ready task or parks the worker. `None` means "a task is on
    /// some ready queue, go find it"; `Some` is a direct handover.
    pub(crate) fn get_ready(&self, worker: &'static Worker) -> Option<TaskRef> {
        let count = self.counter.fetch_sub(1, Ordering::SeqCst);
        if count > 0 {
            self.stats.counter(STAT_READY).add(count as u64);
            return None;
        }
        self.stats.counter(STAT_BLOCKED).add((1 - count) as u64);
        let mut inner = self.inner.lock();
        if let Some(t) = inner.pending.pop_front() {
            return Some(t);
        }
        // Final pinned check under the manager lock: add_ready_pinned
        // serializes on the same lock, so a pinned task cannot slip in
        // between this check and the park.
        if let Some(t) = worker.pop_pinned() {
            self.counter.fetch_add(1, Ordering::SeqCst); // undo the park
            return Some(t);
        }
        inner.waiting.push(worker);
        drop(inner);
        worker.halt()
    }

    /// Accounts a newly ready task. Returns true when the manager took
    /// ownership of it (handover or pending queue) — the caller must then
    /// *not* enqueue it on a ready queue.
    pub(crate) fn add_ready(&self, t: TaskRef) -> bool {
        if self.counter.fetch_add(1, Ordering::SeqCst) + 1 > 0 {
            return false;
        }
        let mut inner = self.inner.lock();
        match inner.waiting.pop() {
            Some(w) => {
                drop(inner);
                w.wake(Some(t));
            }
            None => inner.pending.push_back(t),
        }
        true
    }

    /// Routes a pinned task: handed straight to its parked home worker, or
    /// placed on the home's private queue (the home is awake and checks it
    /// before parking). Pinned tasks stay outside the ready counter; the
    /// home-wake restores the count its park consumed.
    pub(crate) fn add_ready_pinned(&self, t: TaskRef, home: &'static Worker) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.waiting.iter().position(|w| std::ptr::eq(*w, home)) {
            inner.waiting.remove(pos);
            drop(inner);
            self.counter.fetch_add(1, Ordering::SeqCst);
            home.wake(Some(t));
        } else {
            home.push_pinned(t);
        }
    }
}

// ---------------------------------------------------------------------------
// Spin/wait manager
// ---------------------------------------------------------------------------

pub(crate) struct SpinWaitIdle {
    spinning: AtomicIsize,
    waiting: AtomicIsize,
    procs: Mutex<Vec<&'static Worker>>,
}

impl SpinWaitIdle {
    fn new() -> Self {
        Self {
            spinning: AtomicIsize::new(0),
            waiting: AtomicIsize::new(0),
            procs: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn inc_spinning(&self) {
        self.spinning.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dec_spinning(&self) {
        self.spinning.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn inc_waiting(&self) {
        self.waiting.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dec_waiting(&self) {
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }

    /// Leaves the spinning population with work in hand; if that empties
    /// it, promote a waiter so someone keeps watching the queues.
    pub(crate) fn unblock_spin(&self) {
        if self.spinning.fetch_sub(1, Ordering::SeqCst) - 1 == 0 {
            self.unblock();
        }
    }

    /// Parks the worker until a producer wakes it. Returns a task instead
    /// of parking when a pinned task arrived in the meantime: the pinned
    /// enqueue and this check serialize on the procs lock, so the park
    /// cannot miss it.
    pub(crate) fn block(&self, worker: &'static Worker) -> Option<TaskRef> {
        let mut procs = self.procs.lock();
        if let Some(t) = worker.pop_pinned() {
            return Some(t);
        }
        procs.push(worker);
        drop(procs);
        worker.halt();
        None
    }

    /// Wakes one waiting worker if any are (or are about to be) parked.
    pub(crate) fn unblock(&self) {
        while self.waiting.load(Ordering::SeqCst) > 0 {
            match self.procs.try_lock() {
                None => std::hint::spin_loop(),
                Some(mut procs) => match procs.pop() {
                    Some(w) => {
                        drop(procs);
                        self.dec_waiting();
                        w.wake(None);
                        return;
                    }
                    None => {
                        // Waiter counted but not yet listed; let it finish.
                        drop(procs);
                        std::hint::spin_loop();
                    }
                },
            }
        }
    }

    /// Wake targeted at a pinned task's home worker: if the home is
    /// parked, wake exactly it; an awake home needs no wake (it checks its
    /// private queue before parking, under the same lock).
    pub(crate) fn unblock_home(&self, home: &'static Worker) {
        let mut procs = self.procs.lock();
        if let Some(pos) = procs.iter().position(|w| std::ptr::eq(*w, home)) {
            procs.remove(pos);
            drop(procs);
            self.dec_waiting();
            home.wake(None);
        }
    }
}
