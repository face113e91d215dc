//! Worker: a kernel thread running the scheduling loop.
//!
//! The loop is strict: local dequeue, then (if configured) a worker-local
//! poll, then a steal sweep over the cluster ring; after enough fruitless
//! spins the worker reports to the idle manager and ultimately parks on
//! its halt channel. A waker can hand a task directly through the
//! handover slot, bypassing the ready queues entirely.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::debug::trace_cat;
use crate::io::poller::WorkerPoller;
use crate::oslock::OsSemaphore;
use crate::stats::{self, StatBlock};
use crate::task::{self, Task, TaskRef};

use super::cluster::Cluster;
use super::idle::IdleManager;
use super::ready_queue::ReadyQueue;

const HALT_SPIN_MAX: usize = 64;
const IDLE_SPIN_MAX: usize = 1024;

/// How a parked worker sleeps: an OS semaphore, or a blocking poll on its
/// worker-local readiness source.
pub(crate) enum HaltChannel {
    Sem(OsSemaphore),
    Poller(WorkerPoller),
}

impl HaltChannel {
    fn try_p(&self) -> bool {
        match self {
            HaltChannel::Sem(s) => s.try_p(),
            HaltChannel::Poller(p) => p.try_suspend(),
        }
    }

    fn p(&self) {
        match self {
            HaltChannel::Sem(s) => s.p(),
            HaltChannel::Poller(p) => p.suspend(),
        }
    }

    fn v(&self) {
        match self {
            HaltChannel::Sem(s) => s.v(),
            HaltChannel::Poller(p) => p.resume(),
        }
    }
}

// Stat counter indices.
const STAT_CREATE: usize = 0;
const STAT_START: usize = 1;
const STAT_DEQ: usize = 2;
const STAT_STEAL: usize = 3;
const STAT_HANDOVER: usize = 4;
const STAT_IDLE: usize = 5;
const STAT_WAKE: usize = 6;

/// A kernel thread bound to one cluster.
pub struct Worker {
    ready: ReadyQueue,
    // Pinned tasks live in a private queue that stealers never see, so a
    // task with affinity executes on this worker only.
    pinned: ReadyQueue,
    halt: HaltChannel,
    handover: AtomicPtr<Task>,
    idle_task: AtomicPtr<Task>,
    cluster: &'static Cluster,
    index: usize,
    pub(crate) cpu: Option<usize>,
    stats: &'static StatBlock,
}

impl Worker {
    pub(crate) fn new(cluster: &'static Cluster, index: usize, cpu: Option<usize>) -> Worker {
        let cfg = cluster.scope().config();
        let halt = if cfg.worker_poller {
            HaltChannel::Poller(WorkerPoller::new(cluster.scope()))
        } else {
            HaltChannel::Sem(OsSemaphore::new(0))
        };
        Worker {
            ready: ReadyQueue::new(cfg.ready_queue),
            pinned: ReadyQueue::new(super::ready_queue::ReadyQueueKind::Locked),
            halt,
            handover: AtomicPtr::new(ptr::null_mut()),
            idle_task: AtomicPtr::new(ptr::null_mut()),
            cluster,
            index,
            cpu,
            stats: stats::register(
                format!("worker#{index}"),
                &["create", "start", "deq", "steal", "handover", "idle", "wake"],
            ),
        }
    }

    /// The cluster this worker belongs to.
    pub fn cluster(&self) -> &'static Cluster {
        self.cluster
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn stats_create(&self) {
        self.stats.counter(STAT_CREATE).count();
    }

    pub(crate) fn stats_start(&self) {
        self.stats.counter(STAT_START).count();
    }

    pub(crate) fn set_idle_task(&self, t: TaskRef) {
        self.idle_task.store(t.as_ptr(), Ordering::Release);
    }

    fn idle_task(&self) -> TaskRef {
        let p = self.idle_task.load(Ordering::Acquire);
        debug_assert!(!p.is_null());
        // SAFETY: set once during worker registration, never cleared.
        unsafe { TaskRef::new_unchecked(p) }
    }

    // -- queue plumbing ----------------------------------------------------

    fn enqueue_task(&self, t: TaskRef) {
        trace_cat!(SCHEDULING, "task {:p} queued on worker#{}", t, self.index);
        self.ready.enqueue(t);
    }

    /// Appends a pinned task to the private (non-stealable) queue.
    pub(crate) fn push_pinned(&self, t: TaskRef) {
        trace_cat!(SCHEDULING, "task {:p} pinned on worker#{}", t, self.index);
        self.pinned.enqueue(t);
    }

    pub(crate) fn pop_pinned(&self) -> Option<TaskRef> {
        self.pinned.dequeue()
    }

    /// Re-enqueue after a yield: no idle-manager involvement (the worker
    /// is running and will keep scheduling).
    pub(crate) fn enqueue_yield(&self, t: TaskRef) {
        // SAFETY: t is a live task handed over by the switch hook.
        if unsafe { t.as_ref() }.affinity() {
            self.push_pinned(t);
        } else {
            self.enqueue_task(t);
        }
    }

    /// Enqueue a resumed task, waking an idle worker if needed. Pinned
    /// tasks take the home-targeted path so only this worker ever runs
    /// them.
    pub(crate) fn enqueue_resume(&'static self, t: TaskRef) {
        // SAFETY: t is a live, parked task owned by the resumer.
        let is_pinned = unsafe { t.as_ref() }.affinity();
        match self.cluster.idle_manager() {
            IdleManager::SpinWait(im) => {
                if is_pinned {
                    self.push_pinned(t);
                    im.unblock_home(self);
                } else {
                    self.enqueue_task(t);
                    im.unblock();
                }
            }
            IdleManager::Counter(im) => {
                if is_pinned {
                    im.add_ready_pinned(t, self);
                } else if !im.add_ready(t) {
                    self.enqueue_task(t);
                }
            }
        }
    }

    // -- halt / wake -------------------------------------------------------

    /// Parks this worker's thread; returns a handed-over task if the waker
    /// supplied one.
    pub(crate) fn halt(&self) -> Option<TaskRef> {
        for _ in 0..HALT_SPIN_MAX {
            if self.halt.try_p() {
                return self.take_handover();
            }
            std::hint::spin_loop();
        }
        self.stats.counter(STAT_IDLE).count();
        self.halt.p();
        self.take_handover()
    }

    /// Wakes a parked worker, optionally handing it a task directly.
    pub(crate) fn wake(&self, t: Option<TaskRef>) {
        self.stats.counter(STAT_WAKE).count();
        self.handover.store(
            t.map_or(ptr::null_mut(), |t| t.as_ptr()),
            Ordering::Release,
        );
        self.halt.v();
    }

    fn take_handover(&self) -> Option<TaskRef> {
        TaskRef::new(self.handover.swap(ptr::null_mut(), Ordering::AcqRel))
    }

    // -- task search -------------------------------------------------------

    fn search_local(&self) -> Option<TaskRef> {
        let t = self.pinned.dequeue().or_else(|| self.ready.dequeue());
        if t.is_some() {
            self.stats.counter(STAT_DEQ).count();
        }
        t
    }

    fn search_steal(&'static self) -> Option<TaskRef> {
        let ring = self.cluster.ring_snapshot();
        let n = ring.len();
        for i in 1..n {
            let victim = ring[(self.index + i) % n];
            if ptr::eq(victim, self) {
                continue;
            }
            if let Some(t) = victim.ready.try_dequeue() {
                // Only unpinned tasks are stealable; adopt the stray.
                // SAFETY: a dequeued task is live and parked/ready.
                unsafe { t.as_ref() }.check_affinity(self);
                self.stats.counter(STAT_STEAL).count();
                trace_cat!(
                    SCHEDULING,
                    "worker#{} stole {:p} from worker#{}",
                    self.index,
                    t,
                    victim.index
                );
                return Some(t);
            }
        }
        None
    }

    fn poll_local(&self) -> bool {
        match &self.halt {
            HaltChannel::Poller(p) => p.poll() > 0,
            HaltChannel::Sem(_) => false,
        }
    }

    fn search_all(&'static self) -> Option<TaskRef> {
        if let Some(t) = self.search_local() {
            return Some(t);
        }
        if self.poll_local() {
            if let Some(t) = self.search_local() {
                return Some(t);
            }
        }
        self.search_steal()
    }

    /// The worker-local readiness source, when configured.
    pub(crate) fn local_poller(&'static self) -> Option<&'static WorkerPoller> {
        match &self.halt {
            HaltChannel::Poller(p) => Some(p),
            HaltChannel::Sem(_) => None,
        }
    }

    // -- schedule entry points --------------------------------------------

    pub(crate) fn try_schedule_local(&self) -> Option<TaskRef> {
        self.search_local()
    }

    pub(crate) fn try_schedule_global(&'static self) -> Option<TaskRef> {
        self.search_all()
    }

    /// Finds a task without ever parking the worker.
    pub(crate) fn schedule_nonblocking(&'static self) -> Option<TaskRef> {
        match self.cluster.idle_manager() {
            IdleManager::SpinWait(_) => self.search_all(),
            IdleManager::Counter(im) => {
                // Pinned tasks are outside the counter's accounting.
                if let Some(t) = self.pop_pinned() {
                    return Some(t);
                }
                if !im.try_get_ready() {
                    return None;
                }
                // The counter guarantees a task exists somewhere.
                Some(self.schedule_blocking())
            }
        }
    }

    fn schedule_blocking(&'static self) -> TaskRef {
        loop {
            if let Some(t) = self.search_all() {
                return t;
            }
            std::hint::spin_loop();
        }
    }

    /// Next task for a suspending/terminating context: a ready task, or
    /// the idle loop.
    pub(crate) fn schedule_full(&'static self) -> TaskRef {
        self.schedule_nonblocking().unwrap_or_else(|| self.idle_task())
    }

    fn schedule_idle(&'static self) -> TaskRef {
        match self.cluster.idle_manager() {
            IdleManager::SpinWait(im) => loop {
                im.inc_spinning();
                for _ in 1..IDLE_SPIN_MAX {
                    if let Some(t) = self.search_all() {
                        im.unblock_spin();
                        return t;
                    }
                }
                im.dec_spinning();
                im.inc_waiting();
                if let Some(t) = self.search_all() {
                    im.dec_waiting();
                    return t;
                }
                if let Some(t) = im.block(self) {
                    // Park refused: a pinned task slipped in.
                    im.dec_waiting();
                    return t;
                }
            },
            IdleManager::Counter(im) => {
                for _ in 1..IDLE_SPIN_MAX {
                    if let Some(t) = self.schedule_nonblocking() {
                        return t;
                    }
                }
                match im.get_ready(self) {
                    Some(t) => {
                        // SAFETY: handover tasks are live and parked.
                        unsafe { t.as_ref() }.check_affinity(self);
                        self.stats.counter(STAT_HANDOVER).count();
                        t
                    }
                    None => self.schedule_blocking(),
                }
            }
        }
    }

    /// The idle loop. The calling context must be this worker's idle task
    /// (installed as current). Never returns.
    pub(crate) fn run_idle_loop(&'static self, init: Option<TaskRef>) -> ! {
        if let Some(t) = init {
            task::idle_switch_to(t);
        }
        loop {
            let next = self.schedule_idle();
            task::idle_switch_to(next);
        }
    }
}
