//! Event scope: the top-level container owning the FD→waiter table, the
//! master poller, the timer queue, and the main cluster.
//!
//! The FD table is a fixed array sized from `RLIMIT_NOFILE` (POSIX hands
//! out lowest-numbered FDs, so direct indexing works). Each slot carries
//! two binary semaphores — one per direction — that the pollers `V` on
//! readiness and the I/O wrappers `P` on `EAGAIN`.
//!
//! Scopes live for the whole process; `bootstrap` and `clone_scope` hand
//! out `&'static` references and nothing ever tears a scope down.

use std::io;
use std::os::fd::RawFd;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::config::RuntimeConfig;
use crate::debug::{fatal, syscall_check, trace_cat};
use crate::io::epoll::{Direction, Op, Variant};
use crate::io::poller::{BasePoller, MasterPoller};
use crate::sched::cluster::Cluster;
use crate::stats::{self, StatBlock};
use crate::sync::Semaphore;
use crate::task::{self, JoinHandle, Task, TaskBuilder};
use crate::timer::{Time, TimerQueue};

struct FdSlot {
    sync: [Semaphore; 2],
    poller: [AtomicPtr<BasePoller>; 2],
    blocking: AtomicBool,
    use_uring: AtomicBool,
}

impl FdSlot {
    fn new() -> Self {
        Self {
            sync: [Semaphore::new_binary(false), Semaphore::new_binary(false)],
            poller: [
                AtomicPtr::new(std::ptr::null_mut()),
                AtomicPtr::new(std::ptr::null_mut()),
            ],
            blocking: AtomicBool::new(false),
            use_uring: AtomicBool::new(false),
        }
    }

    fn clear(&self) {
        self.sync[0].reset(0);
        self.sync[1].reset(0);
        self.poller[0].store(std::ptr::null_mut(), Ordering::Release);
        self.poller[1].store(std::ptr::null_mut(), Ordering::Release);
        self.blocking.store(false, Ordering::Release);
        self.use_uring.store(false, Ordering::Release);
    }
}

const STAT_CALLS: usize = 0;
const STAT_FAILS: usize = 1;
const STAT_RESETS: usize = 2;
const STAT_CLICONN: usize = 3;
const STAT_SRVCONN: usize = 4;

/// Result of [`fork`](crate::fork).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkResult {
    /// In the parent; carries the child's PID.
    Parent(libc::pid_t),
    /// In the child, on a re-initialized runtime.
    Child,
}

/// Top-level runtime container.
pub struct EventScope {
    config: RuntimeConfig,
    parent: Option<&'static EventScope>,
    fd_table: OnceLock<Box<[FdSlot]>>,
    master: RwLock<Option<MasterPoller>>,
    timer: TimerQueue,
    main_cluster: OnceLock<&'static Cluster>,
    disk_cluster: Mutex<Option<&'static Cluster>>,
    main_task: AtomicPtr<Task>,
    main_join: Mutex<Option<JoinHandle<()>>>,
    stats: &'static StatBlock,
}

impl EventScope {
    fn new(config: RuntimeConfig, parent: Option<&'static EventScope>) -> Self {
        Self {
            config,
            parent,
            fd_table: OnceLock::new(),
            master: RwLock::new(None),
            timer: TimerQueue::new(),
            main_cluster: OnceLock::new(),
            disk_cluster: Mutex::new(None),
            main_task: AtomicPtr::new(std::ptr::null_mut()),
            main_join: Mutex::new(None),
            stats: stats::register(
                "scope".into(),
                &["calls", "fails", "resets", "cliconn", "srvconn"],
            ),
        }
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The scope's main cluster.
    pub fn main_cluster(&self) -> &'static Cluster {
        self.main_cluster
            .get()
            .copied()
            .unwrap_or_else(|| fatal!("scope has no cluster yet"))
    }

    pub(crate) fn timer_queue(&self) -> &TimerQueue {
        &self.timer
    }

    /// Arms the scope's master timer for an absolute deadline.
    pub(crate) fn set_master_timer(&self, deadline: Time) {
        match self.master.read().as_ref() {
            Some(m) => m.set_timer(deadline),
            None => fatal!("timer armed before the master poller exists"),
        }
    }

    // -- bootstrap ---------------------------------------------------------

    /// Creates the process's root scope on the calling thread: the caller
    /// becomes the first worker and keeps running as the main task.
    pub(crate) fn bootstrap(config: RuntimeConfig) -> &'static EventScope {
        static BOOTED: AtomicBool = AtomicBool::new(false);
        if BOOTED.swap(true, Ordering::SeqCst) {
            fatal!("runtime initialized twice");
        }
        crate::debug::install_mask(&config.debug);
        if let Some(sig) = config.stats_signal {
            stats::install_stats_signal(sig);
        }
        if let Some(totals) = config.print_stats {
            stats::enable_print_at_exit(totals);
        }
        crate::stack::page_size();

        let workers = config.worker_count.max(1);
        let pollers = config.poller_count.max(1);
        let cpu0 = config.cpu_set.first().copied();
        let scope: &'static EventScope = Box::leak(Box::new(EventScope::new(config, None)));
        scope.init_sync();
        let cluster: &'static Cluster = Box::leak(Box::new(Cluster::new(scope, pollers)));
        scope
            .main_cluster
            .set(cluster)
            .unwrap_or_else(|_| fatal!("cluster attached twice"));
        let main_task = cluster.register_worker(cpu0);
        scope.main_task.store(main_task.as_ptr(), Ordering::Release);
        if workers > 1 {
            cluster.add_workers(workers - 1);
        }
        scope.start();
        trace_cat!(BASIC, "scope bootstrapped: {workers} workers, {pollers} pollers");
        scope
    }

    fn init_sync(&self) {
        let mut rl = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: rl is a valid out-parameter.
        syscall_check!(
            unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) },
            "getrlimit"
        );
        // Firm up the current limit so the table can never be outgrown.
        rl.rlim_max = rl.rlim_cur;
        // SAFETY: shrinking the hard limit to the soft limit.
        syscall_check!(
            unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rl) },
            "setrlimit"
        );
        let count = rl.rlim_max as usize;
        let table: Box<[FdSlot]> = (0..count).map(|_| FdSlot::new()).collect();
        if self.fd_table.set(table).is_err() {
            fatal!("FD table initialized twice");
        }
    }

    fn start(&'static self) {
        *self.master.write() = Some(MasterPoller::new(self));
        self.main_cluster().start_polling();
    }

    // -- FD table ----------------------------------------------------------

    fn table(&self) -> &[FdSlot] {
        match self.fd_table.get() {
            Some(t) => t,
            None => fatal!("FD table not initialized"),
        }
    }

    fn slot(&self, fd: RawFd) -> &FdSlot {
        let table = self.table();
        if fd < 0 || fd as usize >= table.len() {
            fatal!("file descriptor {fd} out of table range");
        }
        &table[fd as usize]
    }

    /// Number of FD slots (the firmed RLIMIT_NOFILE).
    pub fn fd_count(&self) -> usize {
        self.table().len()
    }

    /// Readiness dispatch: release the parked waiter for `fd`/`dir`.
    pub(crate) fn unblock_fd(&self, fd: RawFd, dir: Direction) {
        let Some(table) = self.fd_table.get() else {
            return; // readiness before the table exists is for nobody
        };
        if fd < 0 || fd as usize >= table.len() {
            return;
        }
        table[fd as usize].sync[dir as usize].v();
    }

    /// Nonblocking claim of an input-readiness token (master poller's
    /// timerfd, worker poller's halt eventfd).
    pub(crate) fn try_consume_input(&self, fd: RawFd) -> bool {
        let Some(table) = self.fd_table.get() else {
            return false;
        };
        if fd < 0 || fd as usize >= table.len() {
            return false;
        }
        table[fd as usize].sync[Direction::Input as usize]
            .try_p()
            .success()
    }

    /// Fiber-poller parking support: initial oneshot registration of a
    /// poller's epoll FD with the master poller.
    pub(crate) fn register_poll_fd(&self, fd: RawFd) {
        match self.master.read().as_ref() {
            Some(m) => m.base().setup_fd(fd, Op::Create, Direction::Input, Variant::Oneshot),
            None => fatal!("poller fibre started before the master poller"),
        }
    }

    /// Parks the calling poller fibre until its epoll FD is readable.
    pub(crate) fn block_poll_fd(&self, fd: RawFd) {
        match self.master.read().as_ref() {
            Some(m) => m.base().setup_fd(fd, Op::Modify, Direction::Input, Variant::Oneshot),
            None => fatal!("poller fibre parked before the master poller"),
        }
        self.slot(fd).sync[Direction::Input as usize].p();
    }

    // -- blocking I/O core -------------------------------------------------

    fn attempt(&self, attempt: &mut impl FnMut() -> isize) -> Option<io::Result<isize>> {
        self.stats.counter(STAT_CALLS).count();
        let r = attempt();
        if r >= 0 {
            return Some(Ok(r));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ECONNRESET) {
            self.stats.counter(STAT_RESETS).count();
        }
        if err.kind() == io::ErrorKind::WouldBlock {
            self.stats.counter(STAT_FAILS).count();
            None
        } else {
            Some(Err(err))
        }
    }

    fn choose_poller(&self, fd: RawFd, dir: Direction, accept: bool) -> &'static BasePoller {
        let cluster = task::current_cluster();
        if dir == Direction::Output {
            return cluster.output_poller(fd as usize);
        }
        if !accept {
            if let Some(wp) = task::current_worker().local_poller() {
                return wp.base();
            }
        }
        cluster.input_poller(fd as usize)
    }

    /// The EAGAIN loop shared by every blocking wrapper: register with a
    /// poller in the right variant, P on the per-FD semaphore, retry.
    fn sync_io(
        &self,
        fd: RawFd,
        dir: Direction,
        accept: bool,
        mut attempt: impl FnMut() -> isize,
    ) -> io::Result<isize> {
        let read_like = dir == Direction::Input && !accept;
        if read_like && self.config.yield_before_read {
            task::yield_now();
        }
        if let Some(r) = self.attempt(&mut attempt) {
            return r;
        }

        let variant = if read_like {
            Variant::Level
        } else {
            Variant::Oneshot
        };
        let slot = self.slot(fd);
        let di = dir as usize;

        let mut registered = slot.poller[di].load(Ordering::Acquire);
        if registered.is_null() {
            let p = self.choose_poller(fd, dir, accept);
            let praw = p as *const BasePoller as *mut BasePoller;
            match slot.poller[di].compare_exchange(
                std::ptr::null_mut(),
                praw,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    p.setup_fd(fd, Op::Create, dir, variant);
                    registered = praw;
                }
                Err(other) => {
                    // Another task registered first; rearm if oneshot.
                    registered = other;
                    if variant == Variant::Oneshot {
                        // SAFETY: pollers are process-lifetime.
                        unsafe { &*registered }.setup_fd(fd, Op::Modify, dir, variant);
                    }
                }
            }
        } else if variant == Variant::Oneshot {
            // SAFETY: pollers are process-lifetime.
            unsafe { &*registered }.setup_fd(fd, Op::Modify, dir, variant);
        }

        loop {
            if variant == Variant::Level {
                slot.sync[di].wait();
            } else {
                slot.sync[di].p();
            }
            if let Some(r) = self.attempt(&mut attempt) {
                return r;
            }
            if variant == Variant::Oneshot {
                // SAFETY: pollers are process-lifetime.
                unsafe { &*registered }.setup_fd(fd, Op::Modify, dir, variant);
            }
        }
    }

    fn blocking(&self, fd: RawFd) -> bool {
        self.slot(fd).blocking.load(Ordering::Acquire)
    }

    fn run_io(
        &self,
        fd: RawFd,
        dir: Direction,
        mut attempt: impl FnMut() -> isize,
    ) -> io::Result<isize> {
        if !self.blocking(fd) {
            let r = attempt();
            return if r >= 0 {
                Ok(r)
            } else {
                Err(io::Error::last_os_error())
            };
        }
        self.sync_io(fd, dir, false, attempt)
    }

    // -- FD lifecycle wrappers ----------------------------------------------

    /// `socket(2)`; the FD is non-blocking at the OS level, with task-level
    /// blocking unless `SOCK_NONBLOCK` was requested.
    pub fn socket(&self, domain: i32, ty: i32, protocol: i32) -> io::Result<RawFd> {
        // SAFETY: plain syscall.
        let fd = unsafe { libc::socket(domain, ty | libc::SOCK_NONBLOCK, protocol) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let slot = self.slot(fd);
        slot.blocking
            .store(ty & libc::SOCK_NONBLOCK == 0, Ordering::Release);
        slot.use_uring.store(false, Ordering::Release);
        Ok(fd)
    }

    /// `pipe2(2)` with the same blocking-flag treatment as sockets.
    pub fn pipe(&self, flags: i32) -> io::Result<(RawFd, RawFd)> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds is a valid out-parameter.
        let r = unsafe { libc::pipe2(fds.as_mut_ptr(), flags | libc::O_NONBLOCK) };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        let blocking = flags & libc::O_NONBLOCK == 0;
        for fd in fds {
            let slot = self.slot(fd);
            slot.blocking.store(blocking, Ordering::Release);
            slot.use_uring.store(false, Ordering::Release);
        }
        Ok((fds[0], fds[1]))
    }

    /// `close(2)`; clears the slot first.
    pub fn close(&self, fd: RawFd) -> io::Result<()> {
        self.slot(fd).clear();
        // SAFETY: plain syscall.
        if unsafe { libc::close(fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// `dup(2)`; the new FD inherits the slot state.
    pub fn dup(&self, fd: RawFd) -> io::Result<RawFd> {
        // SAFETY: plain syscall.
        let nfd = unsafe { libc::dup(fd) };
        if nfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let src = self.slot(fd);
        let dst = self.slot(nfd);
        dst.blocking
            .store(src.blocking.load(Ordering::Acquire), Ordering::Release);
        dst.use_uring
            .store(src.use_uring.load(Ordering::Acquire), Ordering::Release);
        Ok(nfd)
    }

    /// `fcntl(F_SETFL)`; tracks the application's blocking intent while
    /// keeping the descriptor non-blocking at the OS level.
    pub fn set_flags(&self, fd: RawFd, flags: i32) -> io::Result<()> {
        // SAFETY: plain syscall.
        let r = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        self.slot(fd)
            .blocking
            .store(flags & libc::O_NONBLOCK == 0, Ordering::Release);
        Ok(())
    }

    /// `listen(2)` (no task-level behavior).
    pub fn listen(&self, fd: RawFd, backlog: i32) -> io::Result<()> {
        // SAFETY: plain syscall.
        if unsafe { libc::listen(fd, backlog) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// `accept4(2)`; the accepted FD derives its blocking mode from
    /// `flags` and inherits the uring preference.
    ///
    /// # Safety
    /// `addr`/`addrlen` must be valid or null, as for the raw syscall.
    pub unsafe fn accept4(
        &self,
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        flags: i32,
    ) -> io::Result<RawFd> {
        let os_flags = flags | libc::SOCK_NONBLOCK;
        let ret = if self.blocking(fd) {
            self.sync_io(fd, Direction::Input, true, || {
                // SAFETY: forwarded caller contract.
                unsafe { libc::accept4(fd, addr, addrlen, os_flags) as isize }
            })?
        } else {
            // SAFETY: forwarded caller contract.
            let r = unsafe { libc::accept4(fd, addr, addrlen, os_flags) };
            if r < 0 {
                return Err(io::Error::last_os_error());
            }
            r as isize
        };
        let nfd = ret as RawFd;
        let parent = self.slot(fd);
        let child = self.slot(nfd);
        child
            .blocking
            .store(flags & libc::SOCK_NONBLOCK == 0, Ordering::Release);
        child.use_uring.store(
            parent.use_uring.load(Ordering::Acquire),
            Ordering::Release,
        );
        self.stats.counter(STAT_SRVCONN).count();
        Ok(nfd)
    }

    // Wait for an in-progress connect/bind and collect SO_ERROR.
    fn check_async_completion(&self, fd: RawFd) -> io::Result<()> {
        let slot = self.slot(fd);
        let di = Direction::Output as usize;
        let registered = slot.poller[di].load(Ordering::Acquire);
        if registered.is_null() {
            let p = self.choose_poller(fd, Direction::Output, false);
            slot.poller[di].store(
                p as *const BasePoller as *mut BasePoller,
                Ordering::Release,
            );
            p.setup_fd(fd, Op::Create, Direction::Output, Variant::Oneshot);
        } else {
            // SAFETY: pollers are process-lifetime.
            unsafe { &*registered }.setup_fd(fd, Op::Modify, Direction::Output, Variant::Oneshot);
        }
        slot.sync[di].p();
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: err/len are valid out-parameters.
        syscall_check!(
            unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    (&mut err as *mut libc::c_int).cast(),
                    &mut len,
                )
            },
            "getsockopt(SO_ERROR)"
        );
        if err != 0 {
            return Err(io::Error::from_raw_os_error(err));
        }
        Ok(())
    }

    /// `connect(2)`; an `EINPROGRESS` result is awaited through the
    /// output-readiness path and resolved via `SO_ERROR`.
    ///
    /// # Safety
    /// `addr` must point to a valid address of length `addrlen`.
    pub unsafe fn connect(
        &self,
        fd: RawFd,
        addr: *const libc::sockaddr,
        addrlen: libc::socklen_t,
    ) -> io::Result<()> {
        // SAFETY: forwarded caller contract.
        let r = unsafe { libc::connect(fd, addr, addrlen) };
        if r == 0 {
            self.stats.counter(STAT_CLICONN).count();
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if !self.blocking(fd) || err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }
        self.check_async_completion(fd)?;
        self.stats.counter(STAT_CLICONN).count();
        Ok(())
    }

    /// `bind(2)` with the same `EINPROGRESS` treatment as connect.
    ///
    /// # Safety
    /// `addr` must point to a valid address of length `addrlen`.
    pub unsafe fn bind(
        &self,
        fd: RawFd,
        addr: *const libc::sockaddr,
        addrlen: libc::socklen_t,
    ) -> io::Result<()> {
        // SAFETY: forwarded caller contract.
        let r = unsafe { libc::bind(fd, addr, addrlen) };
        if r == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if !self.blocking(fd) || err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }
        self.check_async_completion(fd)
    }

    // -- data-path wrappers --------------------------------------------------

    /// `read(2)`.
    pub fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let (ptr, len) = (buf.as_mut_ptr(), buf.len());
        self.run_io(fd, Direction::Input, move || {
            // SAFETY: buf outlives every attempt.
            unsafe { libc::read(fd, ptr.cast(), len) }
        })
        .map(|n| n as usize)
    }

    /// `pread(2)`.
    pub fn pread(&self, fd: RawFd, buf: &mut [u8], offset: i64) -> io::Result<usize> {
        let (ptr, len) = (buf.as_mut_ptr(), buf.len());
        self.run_io(fd, Direction::Input, move || {
            // SAFETY: buf outlives every attempt.
            unsafe { libc::pread(fd, ptr.cast(), len, offset) }
        })
        .map(|n| n as usize)
    }

    /// `readv(2)`.
    pub fn readv(&self, fd: RawFd, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
        let (ptr, len) = (bufs.as_mut_ptr(), bufs.len());
        self.run_io(fd, Direction::Input, move || {
            // SAFETY: IoSliceMut is ABI-compatible with iovec.
            unsafe { libc::readv(fd, ptr.cast(), len as i32) }
        })
        .map(|n| n as usize)
    }

    /// `preadv(2)`.
    pub fn preadv(
        &self,
        fd: RawFd,
        bufs: &mut [io::IoSliceMut<'_>],
        offset: i64,
    ) -> io::Result<usize> {
        let (ptr, len) = (bufs.as_mut_ptr(), bufs.len());
        self.run_io(fd, Direction::Input, move || {
            // SAFETY: IoSliceMut is ABI-compatible with iovec.
            unsafe { libc::preadv(fd, ptr.cast(), len as i32, offset) }
        })
        .map(|n| n as usize)
    }

    /// `recv(2)`.
    pub fn recv(&self, fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<usize> {
        let (ptr, len) = (buf.as_mut_ptr(), buf.len());
        self.run_io(fd, Direction::Input, move || {
            // SAFETY: buf outlives every attempt.
            unsafe { libc::recv(fd, ptr.cast(), len, flags) }
        })
        .map(|n| n as usize)
    }

    /// `recvfrom(2)`; returns the byte count and fills `addr`.
    pub fn recvfrom(
        &self,
        fd: RawFd,
        buf: &mut [u8],
        flags: i32,
    ) -> io::Result<(usize, libc::sockaddr_storage, libc::socklen_t)> {
        let mut addr: libc::sockaddr_storage = // SAFETY: plain data.
            unsafe { std::mem::zeroed() };
        let mut alen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let (ptr, len) = (buf.as_mut_ptr(), buf.len());
        let addrp = &mut addr as *mut libc::sockaddr_storage;
        let alenp = &mut alen as *mut libc::socklen_t;
        let n = self.run_io(fd, Direction::Input, move || {
            // SAFETY: all pointers outlive every attempt.
            unsafe { libc::recvfrom(fd, ptr.cast(), len, flags, addrp.cast(), alenp) }
        })?;
        Ok((n as usize, addr, alen))
    }

    /// `recvmsg(2)`.
    ///
    /// # Safety
    /// `msg` must be a fully valid message header for the duration.
    pub unsafe fn recvmsg(&self, fd: RawFd, msg: *mut libc::msghdr, flags: i32) -> io::Result<usize> {
        self.run_io(fd, Direction::Input, move || {
            // SAFETY: forwarded caller contract.
            unsafe { libc::recvmsg(fd, msg, flags) }
        })
        .map(|n| n as usize)
    }

    /// `write(2)`.
    pub fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        let (ptr, len) = (buf.as_ptr(), buf.len());
        self.run_io(fd, Direction::Output, move || {
            // SAFETY: buf outlives every attempt.
            unsafe { libc::write(fd, ptr.cast(), len) }
        })
        .map(|n| n as usize)
    }

    /// `pwrite(2)`.
    pub fn pwrite(&self, fd: RawFd, buf: &[u8], offset: i64) -> io::Result<usize> {
        let (ptr, len) = (buf.as_ptr(), buf.len());
        self.run_io(fd, Direction::Output, move || {
            // SAFETY: buf outlives every attempt.
            unsafe { libc::pwrite(fd, ptr.cast(), len, offset) }
        })
        .map(|n| n as usize)
    }

    /// `writev(2)`.
    pub fn writev(&self, fd: RawFd, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        let (ptr, len) = (bufs.as_ptr(), bufs.len());
        self.run_io(fd, Direction::Output, move || {
            // SAFETY: IoSlice is ABI-compatible with iovec.
            unsafe { libc::writev(fd, ptr.cast(), len as i32) }
        })
        .map(|n| n as usize)
    }

    /// `pwritev(2)`.
    pub fn pwritev(&self, fd: RawFd, bufs: &[io::IoSlice<'_>], offset: i64) -> io::Result<usize> {
        let (ptr, len) = (bufs.as_ptr(), bufs.len());
        self.run_io(fd, Direction::Output, move || {
            // SAFETY: IoSlice is ABI-compatible with iovec.
            unsafe { libc::pwritev(fd, ptr.cast(), len as i32, offset) }
        })
        .map(|n| n as usize)
    }

    /// `send(2)`.
    pub fn send(&self, fd: RawFd, buf: &[u8], flags: i32) -> io::Result<usize> {
        let (ptr, len) = (buf.as_ptr(), buf.len());
        self.run_io(fd, Direction::Output, move || {
            // SAFETY: buf outlives every attempt.
            unsafe { libc::send(fd, ptr.cast(), len, flags) }
        })
        .map(|n| n as usize)
    }

    /// `sendto(2)`.
    ///
    /// # Safety
    /// `addr` must point to a valid address of length `addrlen`.
    pub unsafe fn sendto(
        &self,
        fd: RawFd,
        buf: &[u8],
        flags: i32,
        addr: *const libc::sockaddr,
        addrlen: libc::socklen_t,
    ) -> io::Result<usize> {
        let (ptr, len) = (buf.as_ptr(), buf.len());
        self.run_io(fd, Direction::Output, move || {
            // SAFETY: forwarded caller contract.
            unsafe { libc::sendto(fd, ptr.cast(), len, flags, addr, addrlen) }
        })
        .map(|n| n as usize)
    }

    /// `sendmsg(2)`.
    ///
    /// # Safety
    /// `msg` must be a fully valid message header for the duration.
    pub unsafe fn sendmsg(
        &self,
        fd: RawFd,
        msg: *const libc::msghdr,
        flags: i32,
    ) -> io::Result<usize> {
        self.run_io(fd, Direction::Output, move || {
            // SAFETY: forwarded caller contract.
            unsafe { libc::sendmsg(fd, msg, flags) }
        })
        .map(|n| n as usize)
    }

    /// `sendfile(2)` (out_fd governs the blocking behavior).
    pub fn sendfile(
        &self,
        out_fd: RawFd,
        in_fd: RawFd,
        offset: Option<&mut i64>,
        count: usize,
    ) -> io::Result<usize> {
        let offp = offset.map_or(std::ptr::null_mut(), |o| o as *mut i64);
        self.run_io(out_fd, Direction::Output, move || {
            // SAFETY: offp is null or points at the caller's offset.
            unsafe { libc::sendfile(out_fd, in_fd, offp, count) }
        })
        .map(|n| n as usize)
    }

    /// Task-blocking `epoll_wait(2)`: a zero timeout stays nonblocking, a
    /// positive one is a deadline, negative waits indefinitely.
    pub fn epoll_wait(
        &self,
        epfd: RawFd,
        events: &mut [libc::epoll_event],
        timeout_ms: i32,
    ) -> io::Result<usize> {
        let raw = |events: &mut [libc::epoll_event]| {
            // SAFETY: buffer valid for its length.
            unsafe {
                libc::epoll_wait(epfd, events.as_mut_ptr(), events.len() as i32, 0)
            }
        };
        self.stats.counter(STAT_CALLS).count();
        let n = raw(events);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n != 0 || timeout_ms == 0 {
            return Ok(n as usize);
        }
        self.stats.counter(STAT_FAILS).count();

        let slot = self.slot(epfd);
        let di = Direction::Input as usize;
        let registered = slot.poller[di].load(Ordering::Acquire);
        if registered.is_null() {
            let p = self.choose_poller(epfd, Direction::Input, false);
            slot.poller[di].store(
                p as *const BasePoller as *mut BasePoller,
                Ordering::Release,
            );
            p.setup_fd(epfd, Op::Create, Direction::Input, Variant::Oneshot);
        } else {
            // SAFETY: pollers are process-lifetime.
            unsafe { &*registered }.setup_fd(epfd, Op::Modify, Direction::Input, Variant::Oneshot);
        }
        let deadline = (timeout_ms > 0)
            .then(|| Time::after(std::time::Duration::from_millis(timeout_ms as u64)));
        loop {
            match deadline {
                Some(d) => {
                    if !slot.sync[di].p_deadline(d).success() {
                        return Ok(0);
                    }
                }
                None => {
                    slot.sync[di].p();
                }
            }
            self.stats.counter(STAT_CALLS).count();
            let n = raw(events);
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            if n != 0 {
                return Ok(n as usize);
            }
            self.stats.counter(STAT_FAILS).count();
            let reg = slot.poller[di].load(Ordering::Acquire);
            // SAFETY: pollers are process-lifetime.
            unsafe { &*reg }.setup_fd(epfd, Op::Modify, Direction::Input, Variant::Oneshot);
        }
    }

    // -- disk cluster --------------------------------------------------------

    /// Creates the dedicated cluster for non-pollable (direct) I/O.
    pub fn add_disk_cluster(&'static self, workers: usize) -> &'static Cluster {
        let mut disk = self.disk_cluster.lock();
        if disk.is_some() {
            fatal!("disk cluster already exists");
        }
        let cluster: &'static Cluster = Box::leak(Box::new(Cluster::new(self, 1)));
        cluster.start_polling();
        cluster.add_workers(workers.max(1));
        *disk = Some(cluster);
        cluster
    }

    /// Runs `f` on the disk cluster: migrate there, execute the (possibly
    /// thread-blocking) operation synchronously, migrate back.
    pub fn direct_io<T>(&self, f: impl FnOnce() -> T) -> T {
        let disk = match *self.disk_cluster.lock() {
            Some(c) => c,
            None => fatal!("direct_io without a disk cluster"),
        };
        let home = task::migrate(disk);
        let result = f();
        task::migrate_to_worker(home);
        result
    }

    // -- fork ----------------------------------------------------------------

    pub(crate) fn pre_fork(&self) {
        let cur = task::current() as *const Task as *mut Task;
        if self.main_task.load(Ordering::Acquire) != cur {
            fatal!("fork is only allowed from the main task");
        }
        if !self.timer.is_empty() {
            fatal!("fork with pending timers");
        }
        if self.disk_cluster.lock().is_some() {
            fatal!("fork with a disk cluster");
        }
        self.main_cluster().pre_fork();
        for (fd, slot) in self.table().iter().enumerate() {
            if slot.sync[0].has_waiters()
                || slot.sync[1].has_waiters()
                || !slot.poller[0].load(Ordering::Acquire).is_null()
                || !slot.poller[1].load(Ordering::Acquire).is_null()
            {
                fatal!("fork with I/O in flight on fd {fd}");
            }
        }
    }

    pub(crate) fn post_fork(&'static self) {
        {
            let mut master = self.master.write();
            if let Some(old) = master.take() {
                old.close_fds();
            }
            *master = Some(MasterPoller::new(self));
        }
        self.main_cluster().post_fork();
    }

    // -- clone ---------------------------------------------------------------

    /// Creates a scope cloned from this one: a single fresh worker whose
    /// file-descriptor table is unshared from the process
    /// (`unshare(CLONE_FILES)`), with per-FD flags copied over, and
    /// `main_fn` running as the new scope's main task.
    pub fn clone_scope(
        &'static self,
        main_fn: impl FnOnce() + Send + 'static,
        poller_count: usize,
    ) -> &'static EventScope {
        let child: &'static EventScope =
            Box::leak(Box::new(EventScope::new(self.config.clone(), Some(self))));
        let cluster: &'static Cluster =
            Box::leak(Box::new(Cluster::new(child, poller_count.max(1))));
        child
            .main_cluster
            .set(cluster)
            .unwrap_or_else(|_| fatal!("cluster attached twice"));
        cluster.add_worker_init(Some(Box::new(move || {
            child.init_sync();
            let parent = child.parent.unwrap_or_else(|| fatal!("clone without parent"));
            let n = child.fd_count().min(parent.fd_count());
            let (ct, pt) = (child.table(), parent.table());
            for i in 0..n {
                ct[i]
                    .blocking
                    .store(pt[i].blocking.load(Ordering::Acquire), Ordering::Release);
                ct[i]
                    .use_uring
                    .store(pt[i].use_uring.load(Ordering::Acquire), Ordering::Release);
            }
            // SAFETY: detaching this worker thread's FD table.
            syscall_check!(unsafe { libc::unshare(libc::CLONE_FILES) }, "unshare");
            child.start();
        })));
        let handle = TaskBuilder::new().cluster(cluster).spawn(main_fn);
        child
            .main_task
            .store(handle.task_ref().as_ptr(), Ordering::Release);
        *child.main_join.lock() = Some(handle);
        child
    }

    /// Waits for a cloned scope's main task.
    pub fn join_main(&self) {
        let handle = self.main_join.lock().take();
        match handle {
            Some(h) => {
                if h.join().is_err() {
                    fatal!("cloned scope's main task panicked");
                }
            }
            None => fatal!("scope has no joinable main task"),
        }
    }
}

/// Forks the process (single-worker scopes only). The child returns with a
/// fully re-initialized runtime and zeroed statistics.
pub fn fork() -> io::Result<ForkResult> {
    let scope = task::current_scope();
    scope.pre_fork();
    // SAFETY: pre_fork verified the single-threaded-runtime restrictions.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    if pid == 0 {
        stats::reset_all();
        scope.post_fork();
        trace_cat!(BASIC, "runtime re-initialized in fork child");
        Ok(ForkResult::Child)
    } else {
        Ok(ForkResult::Parent(pid))
    }
}
