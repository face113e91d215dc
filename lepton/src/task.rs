//! Tasks: independent execution contexts with their own stacks.
//!
//! A [`Task`] is the unit of scheduling. It owns a stack (or borrows the OS
//! thread's stack for main/idle duty), a saved stack pointer, the
//! park-state machine driving suspend/resume, and a join point. Tasks are
//! reference counted by two parties at most: the runner (released by the
//! terminate hook) and the [`JoinHandle`] (released by join or detach).
//!
//! Context switches come in five flavors distinguished by their
//! *post-switch hook*, which runs on the next task's stack with the
//! previous task as argument:
//!
//! - Idle: nothing (switching away from the idle loop).
//! - Yield: re-enqueue the previous task at the tail of its priority.
//! - Resume: re-enqueue through the idle manager (used by migration).
//! - Suspend: commit the park-state decrement; if a resumer raced in
//!   first, immediately re-enqueue.
//! - Terminate: free the previous task's stack, post its join point, drop
//!   the runner reference.

use std::cell::{Cell, UnsafeCell};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::time::Duration;

use lepton_core::link::QueueLink;
use lepton_core::park::{ParkState, RaceToken, ResumeOutcome, SuspendOutcome};
use parking_lot::Mutex;

use crate::arch::{self, FpControl, PostSwitch};
use crate::debug::{fatal, trace_cat};
use crate::scope::EventScope;
use crate::sched::cluster::Cluster;
use crate::sched::worker::Worker;
use crate::stack::{DEFAULT_GUARD_SIZE, DEFAULT_STACK_SIZE, StackSpan};
use crate::sync::syncpoint::SyncPoint;

/// Scheduling priority tier. Lower ordinal runs first.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Runtime-internal urgent work (pause fibres).
    Critical = 0,
    /// Regular tasks.
    Normal = 1,
    /// Housekeeping.
    Background = 2,
}

impl Priority {
    /// Number of priority tiers.
    pub const COUNT: usize = 3;

    pub(crate) fn from_usize(v: usize) -> Self {
        match v {
            0 => Self::Critical,
            2 => Self::Background,
            _ => Self::Normal,
        }
    }
}

/// Shorthand for a raw task reference travelling through queues.
pub(crate) type TaskRef = NonNull<Task>;

const MAX_LOCAL_KEYS: usize = 64;

/// An independent execution context.
///
/// The `link` field must stay first: ready queues move tasks by their
/// embedded link and cast back (`#[repr(C)]` first-member contract).
#[repr(C)]
pub struct Task {
    link: QueueLink,
    sp: Cell<usize>, // saved stack pointer; 0 while the stack is in use
    park: ParkState,
    worker: AtomicPtr<Worker>,
    priority: AtomicUsize,
    affinity: AtomicBool,
    stack: UnsafeCell<Option<StackSpan>>,
    fp: UnsafeCell<FpControl>,
    entry: UnsafeCell<Option<Box<dyn FnOnce() + Send + 'static>>>,
    locals: UnsafeCell<Vec<*mut ()>>,
    done: SyncPoint,
    refs: AtomicUsize,
}

// SAFETY: tasks migrate between worker threads but are only ever *run* by
// one worker at a time; the interior cells are touched by the owning
// worker or under the documented suspend/resume protocol.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    fn new_raw(worker: &'static Worker, refs: usize) -> Task {
        worker.stats_create();
        Task {
            link: QueueLink::new(),
            sp: Cell::new(0),
            park: ParkState::new_running(),
            worker: AtomicPtr::new(worker as *const Worker as *mut Worker),
            priority: AtomicUsize::new(Priority::Normal as usize),
            affinity: AtomicBool::new(false),
            stack: UnsafeCell::new(None),
            fp: UnsafeCell::new(FpControl::default()),
            entry: UnsafeCell::new(None),
            locals: UnsafeCell::new(Vec::new()),
            done: SyncPoint::new(),
            refs: AtomicUsize::new(refs),
        }
    }

    /// Allocates a task with its own stack, primed to run `entry` on first
    /// switch-in. The task is *not* enqueued.
    pub(crate) fn allocate(
        worker: &'static Worker,
        stack_size: usize,
        guard_size: usize,
        priority: Priority,
        affinity: bool,
        entry: Box<dyn FnOnce() + Send + 'static>,
        refs: usize,
    ) -> TaskRef {
        let mut t = Self::new_raw(worker, refs);
        t.priority = AtomicUsize::new(priority as usize);
        t.affinity = AtomicBool::new(affinity);
        let (span, top) = StackSpan::alloc(stack_size, guard_size);
        t.stack = UnsafeCell::new(Some(span));
        t.entry = UnsafeCell::new(Some(entry));
        let boxed = Box::into_raw(Box::new(t));
        // SAFETY: the stack was just mapped; `top` bounds a writable frame.
        let sp = unsafe { arch::stack_init(top, boxed) };
        // SAFETY: freshly boxed, not shared yet.
        unsafe { (*boxed).sp.set(sp) };
        // SAFETY: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(boxed) }
    }

    /// Allocates a task that runs on the current OS thread's own stack
    /// (main task of a registered worker, idle loop of an added worker).
    /// It is created in the Running state with no stack span.
    pub(crate) fn allocate_borrowed(worker: &'static Worker) -> TaskRef {
        let boxed = Box::into_raw(Box::new(Self::new_raw(worker, 1)));
        // SAFETY: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(boxed) }
    }

    /// Drops one reference; frees the task at zero.
    pub(crate) fn release(t: TaskRef) {
        // SAFETY: caller holds one of the counted references.
        if unsafe { t.as_ref() }.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            // SAFETY: last reference; nothing can reach the task anymore.
            drop(unsafe { Box::from_raw(t.as_ptr()) });
        }
    }

    pub(crate) fn park(&self) -> &ParkState {
        &self.park
    }

    pub(crate) fn done(&self) -> &SyncPoint {
        &self.done
    }

    /// The worker this task resumes on.
    pub(crate) fn worker(&self) -> &'static Worker {
        let p = self.worker.load(Ordering::Acquire);
        debug_assert!(!p.is_null());
        // SAFETY: workers live for the process.
        unsafe { &*p }
    }

    pub(crate) fn set_worker(&self, w: &'static Worker) {
        self.worker
            .store(w as *const Worker as *mut Worker, Ordering::Release);
    }

    /// Priority tier used by the ready queues.
    pub fn priority(&self) -> Priority {
        Priority::from_usize(self.priority.load(Ordering::Relaxed))
    }

    /// Changes the priority tier (effective at the next enqueue).
    pub fn set_priority(&self, p: Priority) {
        self.priority.store(p as usize, Ordering::Relaxed);
    }

    /// True if the task is pinned to its bound worker across stealing.
    pub fn affinity(&self) -> bool {
        self.affinity.load(Ordering::Relaxed)
    }

    /// Pins (or unpins) the task to its bound worker.
    pub fn set_affinity(&self, a: bool) {
        self.affinity.store(a, Ordering::Relaxed);
    }

    /// Work-stealing affinity check: a pinned task keeps its binding (the
    /// stealer only borrows it); an unpinned task is adopted by the
    /// stealer. Returns true when pinned.
    pub(crate) fn check_affinity(&self, new_worker: &'static Worker) -> bool {
        if self.affinity() {
            return true;
        }
        self.set_worker(new_worker);
        false
    }

    /// One source's attempt to become this task's resumer.
    pub(crate) fn race_resume(&self, token: RaceToken) -> bool {
        self.park.race_resume(token)
    }

    /// Makes a parked task runnable (or records an early resume).
    pub(crate) fn resume(&self) {
        match self.park.commit_resume() {
            ResumeOutcome::Enqueue => self.resume_internal(),
            ResumeOutcome::RacedEarly => {}
        }
    }

    fn resume_internal(&self) {
        self.worker().enqueue_resume(NonNull::from(self));
    }

    pub(crate) fn as_link(&self) -> NonNull<QueueLink> {
        NonNull::from(&self.link)
    }

    /// Recovers a task reference from its embedded queue link.
    ///
    /// # Safety
    /// `link` must be the `link` field of a live [`Task`].
    pub(crate) unsafe fn from_link(link: NonNull<QueueLink>) -> TaskRef {
        // The link is the first field of a #[repr(C)] struct.
        link.cast()
    }

    // -- task-local storage ------------------------------------------------

    fn locals_mut(&self) -> &mut Vec<*mut ()> {
        // SAFETY: only the task itself touches its storage vector, and a
        // task runs on one worker at a time.
        unsafe { &mut *self.locals.get() }
    }

    fn run_local_destructors(&self) {
        let table = key_table().lock().clone();
        let values = self.locals_mut();
        for (idx, slot) in table.iter().enumerate() {
            if !slot.used {
                continue;
            }
            let Some(dtor) = slot.dtor else { continue };
            if let Some(v) = values.get(idx).copied() {
                if !v.is_null() {
                    // SAFETY: the key's creator vouches for the destructor
                    // matching the stored pointer.
                    unsafe { dtor(v) };
                }
            }
        }
        values.clear();
    }
}

// ---------------------------------------------------------------------------
// Per-thread scheduling context
// ---------------------------------------------------------------------------

thread_local! {
    static CURRENT_TASK: Cell<*mut Task> = const { Cell::new(ptr::null_mut()) };
    static CURRENT_WORKER: Cell<*const Worker> = const { Cell::new(ptr::null()) };
}

/// Installs the scheduling context on the calling OS thread.
pub(crate) fn install_context(worker: &'static Worker, task: TaskRef) {
    CURRENT_WORKER.set(worker);
    CURRENT_TASK.set(task.as_ptr());
}

fn set_current_task(t: *mut Task) {
    CURRENT_TASK.set(t);
}

/// The currently running task. Fatal when called off a runtime worker.
pub(crate) fn current() -> &'static Task {
    let p = CURRENT_TASK.get();
    if p.is_null() {
        fatal!("not running on a lepton worker");
    }
    // SAFETY: the current task is alive while it runs.
    unsafe { &*p }
}

/// The worker owning the calling OS thread. Fatal off-runtime.
pub fn current_worker() -> &'static Worker {
    let p = CURRENT_WORKER.get();
    if p.is_null() {
        fatal!("not running on a lepton worker");
    }
    // SAFETY: workers live for the process.
    unsafe { &*p }
}

/// The cluster of the calling worker.
pub(crate) fn current_cluster() -> &'static Cluster {
    current_worker().cluster()
}

/// The event scope of the calling worker.
pub(crate) fn current_scope() -> &'static EventScope {
    current_worker().cluster().scope()
}

/// True if the calling thread is a runtime worker.
pub fn on_runtime() -> bool {
    !CURRENT_WORKER.get().is_null()
}

// ---------------------------------------------------------------------------
// Context switching
// ---------------------------------------------------------------------------

fn switch_impl(curr: &Task, next: TaskRef, code: char, hook: PostSwitch) {
    debug_assert!(!ptr::eq(curr, next.as_ptr()));
    // SAFETY: next is alive; its sp was stored by its last switch-out (or
    // stack_init) and is consumed exactly once here.
    let next_ref = unsafe { next.as_ref() };
    let next_sp = next_ref.sp.get();
    debug_assert_ne!(next_sp, 0, "switch into a running task");
    trace_cat!(
        SCHEDULING,
        "switch <{code}> {:p} -> {:p}",
        curr,
        next.as_ptr()
    );

    // SAFETY: fp belongs to the running task; no alias while running.
    unsafe { (*curr.fp.get()).save() };
    set_current_task(next.as_ptr());

    // SAFETY: both stacks are valid; the hook contract is upheld by the
    // callers in this module.
    unsafe {
        arch::lepton_stack_switch(
            curr as *const Task as *mut Task,
            hook,
            curr.sp.as_ptr(),
            next_sp,
        );
    }

    // Back on `curr`'s stack: someone switched into us again.
    curr.sp.set(0);
    // SAFETY: as above.
    unsafe { (*curr.fp.get()).restore() };
}

unsafe extern "C" fn post_idle(_prev: *mut Task) {}

unsafe extern "C" fn post_yield(prev: *mut Task) {
    // SAFETY: prev was the running task an instant ago.
    let t = unsafe { &*prev };
    t.worker().enqueue_yield(NonNull::from(t));
}

unsafe extern "C" fn post_resume(prev: *mut Task) {
    // SAFETY: as post_yield.
    let t = unsafe { &*prev };
    t.resume_internal();
}

unsafe extern "C" fn post_suspend(prev: *mut Task) {
    // SAFETY: as post_yield.
    let t = unsafe { &*prev };
    match t.park.commit_suspend() {
        SuspendOutcome::SwitchOut => {}
        SuspendOutcome::ResumedEarly => t.resume_internal(),
    }
}

unsafe extern "C" fn post_terminate(prev: *mut Task) {
    // SAFETY: prev has switched off its stack for good.
    let t = unsafe { &*prev };
    // SAFETY: the stack is no longer in use; drop unmaps it.
    unsafe { (*t.stack.get()).take() };
    t.done.post();
    // SAFETY: the runner reference is still counted.
    Task::release(unsafe { NonNull::new_unchecked(prev) });
}

/// Yields to the next locally ready task. Returns false if the local queue
/// was empty (no switch happened).
pub fn yield_now() -> bool {
    let w = current_worker();
    match w.try_schedule_local() {
        Some(next) => {
            switch_impl(current(), next, 'Y', post_yield);
            true
        }
        None => false,
    }
}

/// Yields to any ready task, stealing if necessary. Returns false if no
/// task was found anywhere.
pub(crate) fn yield_global() -> bool {
    let w = current_worker();
    match w.try_schedule_global() {
        Some(next) => {
            switch_impl(current(), next, 'Y', post_yield);
            true
        }
        None => false,
    }
}

/// Switch used by the idle loop to run a task.
pub(crate) fn idle_switch_to(next: TaskRef) {
    switch_impl(current(), next, 'I', post_idle);
}

/// Suspends the current task until a resume arrives; returns the winning
/// race token. A short spin window catches resumes that land just before
/// the switch.
pub(crate) fn suspend_current() -> RaceToken {
    let cur = current();
    const SPIN_END: usize = 0;
    let mut spin = 1usize;
    loop {
        if let Some(tok) = cur.park.try_skip_suspend() {
            return tok;
        }
        if spin > SPIN_END {
            break;
        }
        for _ in 0..spin {
            std::hint::spin_loop();
        }
        spin += spin;
    }
    let next = current_worker().schedule_full();
    switch_impl(cur, next, 'S', post_suspend);
    cur.park.resume_info()
}

/// Re-enqueues the current task through the resume path (used by
/// cross-cluster migration).
pub(crate) fn yield_resume() {
    let cur = current();
    let next = current_worker().schedule_full();
    switch_impl(cur, next, 'R', post_resume);
}

/// Ends the current task. Never returns.
pub(crate) fn terminate_current() -> ! {
    let cur = current();
    let next = current_worker().schedule_full();
    switch_impl(cur, next, 'T', post_terminate);
    fatal!("terminated task resumed");
}

/// Entry trampoline: the first switch into a fresh task lands here (via
/// the architecture shim).
#[unsafe(no_mangle)]
extern "C" fn lepton_task_entry(task: *mut Task) -> ! {
    // SAFETY: called exactly once, on the task's own fresh stack.
    let t = unsafe { &*task };
    t.sp.set(0);
    current_worker().stats_start();
    // SAFETY: the entry closure is installed before the task can run and
    // taken exactly once.
    let entry = match unsafe { (*t.entry.get()).take() } {
        Some(f) => f,
        None => fatal!("task started without an entry routine"),
    };
    entry();
    t.run_local_destructors();
    terminate_current()
}

// ---------------------------------------------------------------------------
// Spawning and joining
// ---------------------------------------------------------------------------

struct Packet<T> {
    cell: UnsafeCell<Option<std::thread::Result<T>>>,
}

// SAFETY: the cell is written once by the task and read once by the
// joiner, ordered by the join point.
unsafe impl<T: Send> Send for Packet<T> {}
unsafe impl<T: Send> Sync for Packet<T> {}

/// Owned handle to a spawned task.
///
/// Dropping the handle detaches the task. [`join`](JoinHandle::join)
/// consumes the handle, so joining a detached task cannot be expressed.
pub struct JoinHandle<T> {
    task: TaskRef,
    packet: Arc<Packet<T>>,
    joined: bool,
}

// SAFETY: the handle only exposes synchronized operations.
unsafe impl<T: Send> Send for JoinHandle<T> {}

impl<T> JoinHandle<T> {
    /// Waits for the task to finish and returns its result; a panic that
    /// escaped the task's entry is transferred as the error.
    pub fn join(mut self) -> std::thread::Result<T> {
        // SAFETY: the handle keeps the task alive.
        let task = unsafe { self.task.as_ref() };
        if !task.done().wait() {
            fatal!("join on a detached task");
        }
        // SAFETY: the task has posted; it no longer touches the packet.
        let result = match unsafe { (*self.packet.cell.get()).take() } {
            Some(r) => r,
            None => fatal!("task finished without a result"),
        };
        self.joined = true;
        Task::release(self.task);
        result
    }

    /// Explicitly detaches the task (equivalent to dropping the handle).
    pub fn detach(self) {}

    pub(crate) fn task_ref(&self) -> TaskRef {
        self.task
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if self.joined {
            return;
        }
        // SAFETY: the handle reference is still counted.
        unsafe { self.task.as_ref() }.done().detach();
        Task::release(self.task);
    }
}

/// Configuration for spawning a task.
pub struct TaskBuilder {
    cluster: Option<&'static Cluster>,
    worker: Option<&'static Worker>,
    stack_size: usize,
    guard_size: usize,
    priority: Priority,
    affinity: bool,
}

impl TaskBuilder {
    /// Creates a builder with the defaults (current cluster, 64 KiB stack,
    /// one guard page, normal priority, no affinity).
    pub fn new() -> Self {
        Self {
            cluster: None,
            worker: None,
            stack_size: DEFAULT_STACK_SIZE,
            guard_size: DEFAULT_GUARD_SIZE,
            priority: Priority::Normal,
            affinity: false,
        }
    }

    /// Places the task in the given cluster (round-robin worker choice).
    pub fn cluster(mut self, c: &'static Cluster) -> Self {
        self.cluster = Some(c);
        self
    }

    /// Places the task on a specific worker.
    pub fn worker(mut self, w: &'static Worker) -> Self {
        self.worker = Some(w);
        self
    }

    /// Usable stack size (rounded up to pages).
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Guard region size (rounded up to pages; 0 disables the guard).
    pub fn guard_size(mut self, bytes: usize) -> Self {
        self.guard_size = bytes;
        self
    }

    /// Priority tier.
    pub fn priority(mut self, p: Priority) -> Self {
        self.priority = p;
        self
    }

    /// Pins the task to the worker it is placed on.
    pub fn affinity(mut self, pinned: bool) -> Self {
        self.affinity = pinned;
        self
    }

    fn place(&self) -> &'static Worker {
        if let Some(w) = self.worker {
            return w;
        }
        match self.cluster {
            Some(c) => c.placement(),
            None => current_cluster().placement(),
        }
    }

    fn create<F, T>(self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let packet = Arc::new(Packet {
            cell: UnsafeCell::new(None),
        });
        let their_packet = packet.clone();
        let entry = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(f));
            // SAFETY: single writer; the joiner reads only after the join
            // point posts.
            unsafe { *their_packet.cell.get() = Some(result) };
        });
        let worker = self.place();
        let task = Task::allocate(
            worker,
            self.stack_size,
            self.guard_size,
            self.priority,
            self.affinity,
            entry,
            2, // runner + handle
        );
        JoinHandle {
            task,
            packet,
            joined: false,
        }
    }

    /// Spawns the task and makes it runnable.
    pub fn spawn<F, T>(self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.create(f);
        // SAFETY: the handle keeps the task alive.
        unsafe { handle.task.as_ref() }.resume_internal();
        handle
    }

    /// Spawns the task without enqueueing it; the caller arranges the
    /// first switch (worker bootstrap).
    pub(crate) fn spawn_parked<F, T>(self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.create(f)
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns a task with default settings on the current cluster.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    TaskBuilder::new().spawn(f)
}

/// Raw handle for runtime-internal tasks (idle fibres, poller fibres):
/// own stack, one reference, not enqueued.
pub(crate) fn allocate_system(
    worker: &'static Worker,
    affinity: bool,
    entry: Box<dyn FnOnce() + Send + 'static>,
) -> TaskRef {
    Task::allocate(
        worker,
        DEFAULT_STACK_SIZE,
        DEFAULT_GUARD_SIZE,
        Priority::Normal,
        affinity,
        entry,
        1,
    )
}

// ---------------------------------------------------------------------------
// Migration
// ---------------------------------------------------------------------------

/// Moves the current task to a worker chosen round-robin from `cluster`.
/// Returns the worker it was bound to before.
pub fn migrate(cluster: &'static Cluster) -> &'static Worker {
    migrate_to_worker(cluster.placement())
}

/// Moves the current task to a specific worker.
pub fn migrate_to_worker(target: &'static Worker) -> &'static Worker {
    let cur = current();
    let old = cur.worker();
    cur.set_worker(target);
    if ptr::eq(old.cluster(), target.cluster()) && yield_global() {
        return old;
    }
    yield_resume();
    old
}

// ---------------------------------------------------------------------------
// Task-local storage (pthread-key style)
// ---------------------------------------------------------------------------

/// Destructor invoked for a non-null stored value at task exit.
pub type KeyDestructor = unsafe fn(*mut ());

/// A task-local storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalKey(usize);

#[derive(Clone, Copy, Default)]
struct KeySlot {
    used: bool,
    dtor: Option<KeyDestructor>,
}

fn key_table() -> &'static Mutex<Vec<KeySlot>> {
    static TABLE: std::sync::OnceLock<Mutex<Vec<KeySlot>>> = std::sync::OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(Vec::new()))
}

/// Creates a storage key, optionally with a destructor run at task exit.
pub fn key_create(dtor: Option<KeyDestructor>) -> LocalKey {
    let mut table = key_table().lock();
    for (i, slot) in table.iter_mut().enumerate() {
        if !slot.used {
            *slot = KeySlot { used: true, dtor };
            return LocalKey(i);
        }
    }
    if table.len() >= MAX_LOCAL_KEYS {
        fatal!("out of task-local storage keys");
    }
    table.push(KeySlot { used: true, dtor });
    LocalKey(table.len() - 1)
}

/// Deletes a storage key. Existing values are not destructed.
pub fn key_delete(key: LocalKey) {
    let mut table = key_table().lock();
    if key.0 >= table.len() || !table[key.0].used {
        fatal!("key_delete on unused key {}", key.0);
    }
    table[key.0] = KeySlot::default();
}

/// Stores a value under `key` for the current task.
///
/// # Safety
/// If the key has a destructor, `value` must remain valid for it until the
/// task exits or the value is replaced.
pub unsafe fn set_specific(key: LocalKey, value: *mut ()) {
    let t = current();
    let values = t.locals_mut();
    if values.len() <= key.0 {
        values.resize(key.0 + 1, ptr::null_mut());
    }
    values[key.0] = value;
}

/// Reads the current task's value for `key` (null if unset).
pub fn get_specific(key: LocalKey) -> *mut () {
    let t = current();
    t.locals_mut().get(key.0).copied().unwrap_or(ptr::null_mut())
}

/// Suspends the current task for at least `dur`.
pub fn sleep(dur: Duration) {
    let cur = current();
    let scope = current_scope();
    cur.park().prepare_resume_race();
    let deadline = crate::timer::Time::after(dur);
    let winner = scope.timer_queue().block_timeout(cur, deadline, scope);
    debug_assert_eq!(winner, scope.timer_queue().token());
}
