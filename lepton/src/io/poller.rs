//! Poller deployments: threaded, fiber, master (with timer), and the
//! optional worker-local poller.
//!
//! All variants share [`BasePoller`]: an epoll instance plus the dispatch
//! path that turns a readiness event into a `V` on the right per-FD
//! semaphore (which races with, and possibly resumes, the parked task).

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::debug::{fatal, syscall_check, trace_cat};
use crate::scope::EventScope;
use crate::sched::cluster::{Cluster, PollerKind};
use crate::stats::{self, StatBlock};
use crate::task::{self, TaskBuilder};

use super::epoll::{Direction, EpollSource, Op, Variant, direction_bits};

pub(crate) const MAX_POLL: usize = 256;

const STAT_REGS: usize = 0;
const STAT_EVENTS_BLOCKING: usize = 1;
const STAT_EVENTS_NONBLOCKING: usize = 2;

/// Epoll instance + dispatch into the owning scope's FD table.
pub(crate) struct BasePoller {
    src: EpollSource,
    scope: &'static EventScope,
    stats: &'static StatBlock,
}

impl BasePoller {
    pub(crate) fn new(scope: &'static EventScope, label: &str) -> Self {
        Self {
            src: EpollSource::new(),
            scope,
            stats: stats::register(
                label.to_string(),
                &["regs", "events_blocking", "events_nonblocking"],
            ),
        }
    }

    pub(crate) fn poll_fd(&self) -> RawFd {
        self.src.fd()
    }

    pub(crate) fn setup_fd(&self, fd: RawFd, op: Op, dir: Direction, var: Variant) {
        if op != Op::Remove {
            self.stats.counter(STAT_REGS).count();
        }
        self.src.setup_fd(fd, op, dir, var);
    }

    /// One poll + dispatch round. Returns the number of events handled.
    pub(crate) fn poll_and_dispatch(&self, blocking: bool) -> usize {
        // SAFETY: epoll_event is plain data; the kernel fills it.
        let mut events: [libc::epoll_event; MAX_POLL] = unsafe { std::mem::zeroed() };
        let n = self.src.poll(&mut events, blocking);
        let stat = if blocking {
            STAT_EVENTS_BLOCKING
        } else {
            STAT_EVENTS_NONBLOCKING
        };
        self.stats.counter(stat).add(n as u64);
        for ev in &events[..n] {
            self.dispatch(ev);
        }
        n
    }

    fn dispatch(&self, ev: &libc::epoll_event) {
        let fd = ev.u64 as RawFd;
        let input_mask =
            direction_bits(Direction::Input) | (libc::EPOLLHUP | libc::EPOLLERR) as u32;
        if ev.events & input_mask != 0 {
            self.scope.unblock_fd(fd, Direction::Input);
            return;
        }
        if ev.events & (libc::EPOLLOUT as u32 | libc::EPOLLERR as u32) != 0 {
            self.scope.unblock_fd(fd, Direction::Output);
        }
    }

    pub(crate) fn close_fds(&self) {
        self.src.close();
    }
}

fn spawn_poll_thread(name: String, body: impl FnOnce() + Send + 'static) {
    if let Err(e) = std::thread::Builder::new().name(name).spawn(body) {
        fatal!("poller thread creation failed: {e}");
    }
}

/// Dedicated kernel thread looping blocking-poll → dispatch.
pub(crate) struct PollerThread {
    base: &'static BasePoller,
}

impl PollerThread {
    pub(crate) fn new(scope: &'static EventScope, label: &str) -> Self {
        Self {
            base: Box::leak(Box::new(BasePoller::new(scope, label))),
        }
    }

    pub(crate) fn base(&self) -> &'static BasePoller {
        self.base
    }

    pub(crate) fn start(&self) {
        let base = self.base;
        spawn_poll_thread("lepton-poller".into(), move || {
            loop {
                base.poll_and_dispatch(true);
            }
        });
    }
}

/// Poller that runs as a task: nonblocking polls interleaved with yields;
/// after an empty round it parks by registering its own epoll FD (oneshot)
/// with the master poller and doing a P on that FD's input semaphore.
pub(crate) struct PollerFibre {
    base: &'static BasePoller,
    started: AtomicBool,
}

const FIBRE_SPIN_MAX: usize = 1;

impl PollerFibre {
    pub(crate) fn new(scope: &'static EventScope, label: &str) -> Self {
        Self {
            base: Box::leak(Box::new(BasePoller::new(scope, label))),
            started: AtomicBool::new(false),
        }
    }

    pub(crate) fn base(&self) -> &'static BasePoller {
        self.base
    }

    pub(crate) fn start(&self, cluster: &'static Cluster) {
        if self.started.swap(true, Ordering::SeqCst) {
            fatal!("poller fibre started twice");
        }
        let base = self.base;
        TaskBuilder::new()
            .cluster(cluster)
            .spawn(move || Self::poll_loop(base))
            .detach();
    }

    fn poll_loop(base: &'static BasePoller) -> ! {
        let scope = base.scope;
        scope.register_poll_fd(base.poll_fd());
        let mut spin = 1usize;
        loop {
            let n = base.poll_and_dispatch(false);
            if n > 0 {
                spin = 1;
                task::yield_global();
            } else if spin >= FIBRE_SPIN_MAX {
                spin = 1;
                scope.block_poll_fd(base.poll_fd());
            } else {
                spin += 1;
                task::yield_global();
            }
        }
    }
}

/// A cluster's input/output poller, deployment chosen at construction.
pub(crate) enum ClusterPoller {
    Thread(PollerThread),
    Fiber(PollerFibre),
}

impl ClusterPoller {
    pub(crate) fn new(kind: PollerKind, scope: &'static EventScope, label: &str) -> Self {
        match kind {
            PollerKind::Thread => ClusterPoller::Thread(PollerThread::new(scope, label)),
            PollerKind::Fiber => ClusterPoller::Fiber(PollerFibre::new(scope, label)),
        }
    }

    pub(crate) fn base(&self) -> &'static BasePoller {
        match self {
            ClusterPoller::Thread(p) => p.base(),
            ClusterPoller::Fiber(p) => p.base(),
        }
    }

    pub(crate) fn start(&self, cluster: &'static Cluster) {
        match self {
            ClusterPoller::Thread(p) => p.start(),
            ClusterPoller::Fiber(p) => p.start(cluster),
        }
    }

    pub(crate) fn close_fds(&self) {
        self.base().close_fds();
    }
}

/// Scope-owned poller thread that also drives the timer queue through a
/// timerfd registered with itself.
pub(crate) struct MasterPoller {
    base: &'static BasePoller,
    timer_fd: RawFd,
}

impl MasterPoller {
    pub(crate) fn base(&self) -> &'static BasePoller {
        self.base
    }

    pub(crate) fn new(scope: &'static EventScope) -> Self {
        let base: &'static BasePoller = Box::leak(Box::new(BasePoller::new(scope, "master")));
        // SAFETY: plain syscall.
        let timer_fd = syscall_check!(
            unsafe {
                libc::timerfd_create(
                    libc::CLOCK_MONOTONIC,
                    libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
                )
            },
            "timerfd_create"
        );
        base.setup_fd(timer_fd, Op::Create, Direction::Input, Variant::Level);
        let this = Self { base, timer_fd };
        this.start();
        this
    }

    fn start(&self) {
        let base = self.base;
        let timer_fd = self.timer_fd;
        spawn_poll_thread("lepton-master".into(), move || {
            let scope = base.scope;
            loop {
                Self::pre_poll(scope, timer_fd);
                base.poll_and_dispatch(true);
            }
        });
    }

    // Timerfd readiness is consumed through the FD table like any other
    // event, so the expiry walk runs at most once per arm.
    fn pre_poll(scope: &'static EventScope, timer_fd: RawFd) {
        if scope.try_consume_input(timer_fd) {
            let mut count: u64 = 0;
            // SAFETY: reading 8 bytes into a local.
            let n = unsafe {
                libc::read(
                    timer_fd,
                    (&mut count as *mut u64).cast(),
                    std::mem::size_of::<u64>(),
                )
            };
            if n == std::mem::size_of::<u64>() as isize {
                scope.timer_queue().check_expiry(scope);
            }
        }
    }

    /// Arms the timer for an absolute monotonic deadline.
    pub(crate) fn set_timer(&self, deadline: crate::timer::Time) {
        trace_cat!(POLLING, "master timer armed");
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: deadline.to_timespec(),
        };
        // SAFETY: spec outlives the call.
        syscall_check!(
            unsafe {
                libc::timerfd_settime(
                    self.timer_fd,
                    libc::TFD_TIMER_ABSTIME,
                    &spec,
                    std::ptr::null_mut(),
                )
            },
            "timerfd_settime"
        );
    }

    /// Fork-child cleanup: the poller thread is gone; release descriptors.
    pub(crate) fn close_fds(&self) {
        self.base.close_fds();
        // SAFETY: closing our own descriptor.
        unsafe { libc::close(self.timer_fd) };
    }
}

/// Worker-local poller doubling as the worker's halt channel: parking
/// becomes a blocking poll, waking is an eventfd write.
pub(crate) struct WorkerPoller {
    base: BasePoller,
    halt_fd: RawFd,
}

impl WorkerPoller {
    pub(crate) fn new(scope: &'static EventScope) -> Self {
        let base = BasePoller::new(scope, "w-poller");
        // SAFETY: plain syscall.
        let halt_fd = syscall_check!(
            unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) },
            "eventfd"
        );
        base.setup_fd(halt_fd, Op::Create, Direction::Input, Variant::Level);
        Self { base, halt_fd }
    }

    pub(crate) fn base(&self) -> &BasePoller {
        &self.base
    }

    /// Opportunistic nonblocking poll from the scheduling loop.
    pub(crate) fn poll(&self) -> usize {
        self.base.poll_and_dispatch(false)
    }

    fn consume_halt(&self) -> bool {
        if !self.base.scope.try_consume_input(self.halt_fd) {
            return false;
        }
        let mut count: u64 = 0;
        // SAFETY: reading 8 bytes into a local.
        unsafe {
            libc::read(
                self.halt_fd,
                (&mut count as *mut u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        true
    }

    /// Nonblocking park attempt.
    pub(crate) fn try_suspend(&self) -> bool {
        self.base.poll_and_dispatch(false);
        self.consume_halt()
    }

    /// Parks until woken, dispatching readiness the whole time.
    pub(crate) fn suspend(&self) {
        loop {
            self.base.poll_and_dispatch(true);
            if self.consume_halt() {
                return;
            }
        }
    }

    /// Wakes the parked worker.
    pub(crate) fn resume(&self) {
        let val: u64 = 1;
        // SAFETY: writing 8 bytes from a local.
        let n = unsafe {
            libc::write(
                self.halt_fd,
                (&val as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            fatal!("worker wake eventfd write failed");
        }
    }
}
