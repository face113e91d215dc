//! lepton: an M:N user-level threading runtime.
//!
//! Many lightweight *tasks*, each with its own stack, run cooperatively on
//! a pool of kernel-thread *workers* organized into *clusters* that share
//! epoll-backed pollers; an *event scope* owns the FD→waiter table and a
//! timer queue. Blocking — on a primitive, a timeout, or an I/O wrapper —
//! parks only the calling task; the worker immediately schedules other
//! work, stealing from its ring neighbours when its own queues run dry.
//!
//! ```no_run
//! let _scope = lepton::init(1, 2);
//! let h = lepton::spawn(|| {
//!     lepton::yield_now();
//!     21 * 2
//! });
//! assert_eq!(h.join().unwrap(), 42);
//! ```
//!
//! Scheduling is strictly cooperative: a running task gives up its worker
//! only at a yield, a blocking operation, or termination.

#![warn(missing_docs)]

mod arch;
mod config;
mod debug;
pub mod io;
mod oslock;
mod scope;
mod sched;
mod stack;
mod stats;
pub mod sync;
pub mod task;
mod timer;

pub use config::RuntimeConfig;
pub use scope::{EventScope, ForkResult, fork};
pub use sched::cluster::{Cluster, ClusterPause, PollerKind};
pub use sched::idle::IdleManagerKind;
pub use sched::ready_queue::ReadyQueueKind;
pub use sched::worker::Worker;
pub use stack::{DEFAULT_GUARD_SIZE, DEFAULT_STACK_SIZE};
pub use task::{
    JoinHandle, LocalKey, Priority, TaskBuilder, migrate, migrate_to_worker, sleep, spawn,
    yield_now,
};
pub use timer::Time;

/// Boots the default runtime: the calling thread becomes the first worker
/// and keeps running as the main task. Environment options (see
/// [`RuntimeConfig::from_env`]) are applied on top of the given counts.
pub fn init(poller_count: usize, worker_count: usize) -> &'static EventScope {
    RuntimeConfig::new(poller_count, worker_count)
        .from_env()
        .bootstrap()
}
