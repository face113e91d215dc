//! Cluster: a scheduling scope — a ring of workers sharing ready queues
//! via stealing, a set of I/O pollers, and an idle manager.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::debug::{fatal, syscall_check, trace_cat};
use crate::io::poller::{BasePoller, ClusterPoller};
use crate::oslock::OsSemaphore;
use crate::scope::EventScope;
use crate::stats::{self, StatBlock};
use crate::task::{self, JoinHandle, Priority, Task, TaskBuilder, TaskRef};

use super::idle::IdleManager;
use super::worker::Worker;

/// Poller deployment for a cluster's input/output pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerKind {
    /// Dedicated kernel thread per poller.
    Thread,
    /// Poller runs as a task inside the cluster.
    Fiber,
}

// Raw pointers are not Send; these wrappers move them into worker threads.
struct SendTask(TaskRef);
// SAFETY: tasks are Send by design; this restores what the raw pointer lost.
unsafe impl Send for SendTask {}

struct Pollers {
    input: Vec<&'static ClusterPoller>,
    output: Vec<&'static ClusterPoller>,
}

/// A scheduling domain: ring of workers plus pollers.
pub struct Cluster {
    scope: &'static EventScope,
    ring: Mutex<Vec<&'static Worker>>,
    // Lock-free snapshot for steal sweeps and placement: pause() holds the
    // ring lock for its whole critical section, and stealers must keep
    // running underneath it.
    ring_snap: AtomicPtr<Vec<&'static Worker>>,
    place: AtomicUsize,
    idle: IdleManager,
    input_count: usize,
    output_count: usize,
    pollers: Mutex<Pollers>,
    pause_sem: OsSemaphore,
    pause_confirm: OsSemaphore,
    stats: &'static StatBlock,
}

const STAT_PAUSE: usize = 0;

const WORKER_THREAD_STACK: usize = 256 * 1024;

impl Cluster {
    /// Creates a cluster (pollers are built by `start_polling`).
    pub(crate) fn new(scope: &'static EventScope, poller_count: usize) -> Cluster {
        if poller_count == 0 {
            fatal!("cluster needs at least one poller");
        }
        Cluster {
            scope,
            ring: Mutex::new(Vec::new()),
            ring_snap: AtomicPtr::new(ptr::null_mut()),
            place: AtomicUsize::new(0),
            idle: IdleManager::new(scope.config().idle_manager),
            input_count: poller_count,
            output_count: 1,
            pollers: Mutex::new(Pollers {
                input: Vec::new(),
                output: Vec::new(),
            }),
            pause_sem: OsSemaphore::new(0),
            pause_confirm: OsSemaphore::new(0),
            stats: stats::register("cluster".into(), &["pause"]),
        }
    }

    /// The owning event scope.
    pub fn scope(&self) -> &'static EventScope {
        self.scope
    }

    pub(crate) fn idle_manager(&self) -> &IdleManager {
        &self.idle
    }

    /// Current worker ring (append-only; snapshots stay valid forever).
    pub(crate) fn ring_snapshot(&self) -> &'static [&'static Worker] {
        let p = self.ring_snap.load(Ordering::Acquire);
        if p.is_null() {
            return &[];
        }
        // SAFETY: snapshots are leaked, never freed.
        unsafe { (*p).as_slice() }
    }

    // Creates and registers a worker under one ring-lock hold, so the
    // worker's index always matches its ring position.
    fn new_worker(&'static self, cpu_from_config: bool, cpu: Option<usize>) -> &'static Worker {
        let mut ring = self.ring.lock();
        let index = ring.len();
        let cpu = if cpu_from_config {
            self.scope.config().cpu_set.get(index).copied()
        } else {
            cpu
        };
        let worker: &'static Worker = Box::leak(Box::new(Worker::new(self, index, cpu)));
        ring.push(worker);
        let snap = Box::into_raw(Box::new(ring.clone()));
        self.ring_snap.store(snap, Ordering::Release);
        worker
    }

    /// Round-robin placement over the ring.
    pub(crate) fn placement(&self) -> &'static Worker {
        let ring = self.ring_snapshot();
        if ring.is_empty() {
            fatal!("placement on a cluster with no workers");
        }
        ring[self.place.fetch_add(1, Ordering::Relaxed) % ring.len()]
    }

    /// Number of workers in the ring.
    pub fn worker_count(&self) -> usize {
        self.ring.lock().len()
    }

    // -- worker creation ---------------------------------------------------

    /// Registers the calling OS thread as this cluster's first worker and
    /// returns its main task (which keeps running on the caller's stack).
    pub(crate) fn register_worker(&'static self, cpu: Option<usize>) -> TaskRef {
        let worker = self.new_worker(false, cpu);
        if let Some(cpu) = worker.cpu {
            apply_cpu_affinity(cpu);
        }
        let main_task = Task::allocate_borrowed(worker);
        // The caller's thread must keep running its own stack: pin the
        // main task so it always resumes here.
        // SAFETY: freshly allocated, not shared yet.
        unsafe { main_task.as_ref() }.set_affinity(true);
        task::install_context(worker, main_task);
        // The idle loop gets its own stack; first entered when the main
        // task suspends.
        let idle = task::allocate_system(
            worker,
            true,
            Box::new(move || worker.run_idle_loop(None)),
        );
        worker.set_idle_task(idle);
        trace_cat!(THREADS, "registered worker#{}", worker.index());
        main_task
    }

    /// Creates one new worker on a fresh kernel thread.
    pub fn add_worker(&'static self) {
        self.add_worker_init(None);
    }

    /// Creates `count` new workers.
    pub fn add_workers(&'static self, count: usize) {
        for _ in 0..count {
            self.add_worker();
        }
    }

    /// Creates a worker; `init` (if any) runs as a dedicated task on the
    /// new worker before anything else, and this call returns only after
    /// it finished.
    pub(crate) fn add_worker_init(&'static self, init: Option<Box<dyn FnOnce() + Send>>) {
        let worker = self.new_worker(true, None);

        // The init task is switched to directly by the new worker's idle
        // loop; it is never enqueued.
        let init_handle: JoinHandle<()> = TaskBuilder::new()
            .worker(worker)
            .affinity(true)
            .spawn_parked(move || {
                if let Some(f) = init {
                    f();
                }
            });
        let init_task = SendTask(init_handle.task_ref());

        let spawned = std::thread::Builder::new()
            .name(format!("lepton-worker{}", worker.index()))
            .stack_size(WORKER_THREAD_STACK)
            .spawn(move || {
                let init_task = init_task;
                if let Some(cpu) = worker.cpu {
                    apply_cpu_affinity(cpu);
                }
                // The idle loop borrows this thread's stack.
                let idle = Task::allocate_borrowed(worker);
                worker.set_idle_task(idle);
                task::install_context(worker, idle);
                trace_cat!(THREADS, "worker#{} online", worker.index());
                worker.run_idle_loop(Some(init_task.0));
            });
        if let Err(e) = spawned {
            fatal!("worker thread creation failed: {e}");
        }
        // Synchronize with init completion (and with the argument pack's
        // lifetime), then let the init task go.
        match init_handle.join() {
            Ok(()) => {}
            Err(_) => fatal!("worker init routine panicked"),
        }
    }

    // -- pollers -----------------------------------------------------------

    /// Builds and starts this cluster's pollers. Called at bootstrap and
    /// again after fork (the old pollers are gone by then).
    pub(crate) fn start_polling(&'static self) {
        let kind = self.scope.config().cluster_poller;
        let mut pollers = self.pollers.lock();
        if !pollers.input.is_empty() || !pollers.output.is_empty() {
            fatal!("cluster pollers already started");
        }
        for _ in 0..self.output_count {
            let p: &'static ClusterPoller =
                Box::leak(Box::new(ClusterPoller::new(kind, self.scope, "o-poller")));
            p.start(self);
            pollers.output.push(p);
        }
        for _ in 0..self.input_count {
            let p: &'static ClusterPoller =
                Box::leak(Box::new(ClusterPoller::new(kind, self.scope, "i-poller")));
            p.start(self);
            pollers.input.push(p);
        }
    }

    pub(crate) fn input_poller(&self, hint: usize) -> &'static BasePoller {
        let pollers = self.pollers.lock();
        pollers.input[hint % pollers.input.len()].base()
    }

    pub(crate) fn output_poller(&self, hint: usize) -> &'static BasePoller {
        let pollers = self.pollers.lock();
        pollers.output[hint % pollers.output.len()].base()
    }

    // -- stop-the-world ----------------------------------------------------

    /// Pauses every other worker in the cluster. Each gets a top-priority
    /// pinned fibre that confirms and then blocks its worker thread; the
    /// call returns once all have confirmed. Dropping the guard resumes
    /// them.
    pub fn pause(&'static self) -> ClusterPause<'_> {
        let ring = self.ring.lock();
        self.stats.counter(STAT_PAUSE).add(ring.len() as u64);
        let me = task::current_worker();
        let mut fibres = Vec::new();
        for &w in ring.iter().filter(|w| !ptr::eq(**w, me)) {
            let cluster: &'static Cluster = self;
            let h = TaskBuilder::new()
                .worker(w)
                .priority(Priority::Critical)
                .affinity(true)
                .spawn(move || {
                    cluster.pause_confirm.v();
                    cluster.pause_sem.p();
                });
            fibres.push(h);
        }
        for _ in 0..fibres.len() {
            self.pause_confirm.p();
        }
        ClusterPause {
            cluster: self,
            _ring: ring,
            fibres,
        }
    }

    // -- fork --------------------------------------------------------------

    pub(crate) fn pre_fork(&self) {
        let ring = self.ring.lock();
        if ring.len() != 1 {
            fatal!("fork requires a single-worker cluster (have {})", ring.len());
        }
    }

    /// Child-side rebuild: the poller threads/fibres did not survive the
    /// fork; drop their descriptors and start fresh ones.
    pub(crate) fn post_fork(&'static self) {
        {
            let mut pollers = self.pollers.lock();
            for p in pollers.input.drain(..) {
                p.close_fds();
            }
            for p in pollers.output.drain(..) {
                p.close_fds();
            }
        }
        self.start_polling();
    }
}

/// Guard returned by [`Cluster::pause`]; dropping it resumes the cluster.
pub struct ClusterPause<'a> {
    cluster: &'static Cluster,
    _ring: MutexGuard<'a, Vec<&'static Worker>>,
    fibres: Vec<JoinHandle<()>>,
}

impl Drop for ClusterPause<'_> {
    fn drop(&mut self) {
        for _ in 0..self.fibres.len() {
            self.cluster.pause_sem.v();
        }
        for h in self.fibres.drain(..) {
            let _ = h.join();
        }
    }
}

fn apply_cpu_affinity(cpu: usize) {
    // SAFETY: cpu_set_t is plain data; the libc macros initialize it.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        syscall_check!(
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set),
            "sched_setaffinity"
        );
    }
}
