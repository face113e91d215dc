//! Blocking synchronization primitives whose waiters are tasks.
//!
//! Everything here is built from two pieces: the suspend/resume race
//! protocol (see `lepton_core::park`) and [`waitlist::WaitList`], a FIFO
//! queue of parked tasks integrated with that race. A timed wait simply
//! enters the race with two sources — the primitive's wait list and the
//! scope's timer queue — and exactly one of them resumes the task.

mod barrier;
mod condvar;
mod mutex;
mod rwlock;
mod semaphore;
pub(crate) mod syncpoint;
pub(crate) mod waitlist;

pub use barrier::{Barrier, FastBarrier};
pub use condvar::Condition;
pub use mutex::{FastMutex, Mutex, RecursiveMutex};
pub use rwlock::RwLock;
pub use semaphore::{Semaphore, SemaphoreResult};

use lepton_core::park::RaceToken;

use crate::task;
use crate::timer::Time;

/// Parks the current task (already enqueued on a wait list and race-
/// prepared) until some source resumes it. Returns true iff the source
/// identified by `token` won the race.
///
/// With a deadline, the timer queue joins the race; the caller still owns
/// the wait-list cleanup on loss.
pub(crate) fn wait_for_token(token: RaceToken, deadline: Option<Time>) -> bool {
    let winner = match deadline {
        None => task::suspend_current(),
        Some(d) => {
            let cur = task::current();
            let scope = task::current_scope();
            scope.timer_queue().block_timeout(cur, d, scope)
        }
    };
    winner == token
}
