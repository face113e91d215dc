//! Join point: the Running/Posted/Detached flag behind task join.

use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::debug::fatal;
use crate::task::{self, TaskRef};

#[derive(Clone, Copy)]
enum State {
    Running,
    Waiting(TaskRef),
    Posted,
    Detached,
}

/// One-shot completion flag with at most one waiter.
///
/// `post` and `detach` are mutually exclusive except that detaching an
/// already-posted point is a no-op (the result is discarded).
pub(crate) struct SyncPoint {
    state: Mutex<State>,
}

// SAFETY: the raw task pointer is only stored while the waiter is parked.
unsafe impl Send for SyncPoint {}
unsafe impl Sync for SyncPoint {}

impl SyncPoint {
    pub(crate) const fn new() -> Self {
        Self {
            state: Mutex::new(State::Running),
        }
    }

    /// Blocks the current task until the point is posted or detached.
    /// Returns true for posted.
    pub(crate) fn wait(&self) -> bool {
        let cur = task::current();
        let mut st = self.state.lock();
        if matches!(*st, State::Running) {
            *st = State::Waiting(NonNull::from(cur));
            drop(st);
            task::suspend_current();
            st = self.state.lock();
        }
        match *st {
            State::Posted => true,
            State::Detached => false,
            _ => fatal!("join point woke in an invalid state"),
        }
    }

    /// Marks completion; resumes the waiter if one is parked.
    pub(crate) fn post(&self) {
        let mut st = self.state.lock();
        match *st {
            State::Running => *st = State::Posted,
            State::Waiting(t) => {
                *st = State::Posted;
                drop(st);
                // SAFETY: the waiter is parked in wait() above.
                unsafe { t.as_ref() }.resume();
            }
            State::Posted => fatal!("double post on join point"),
            State::Detached => {} // finished task already detached
        }
    }

    /// Abandons the join. A point that already posted is left as-is.
    pub(crate) fn detach(&self) {
        let mut st = self.state.lock();
        match *st {
            State::Running => *st = State::Detached,
            State::Posted => {}
            State::Waiting(_) => fatal!("detach while a joiner is waiting"),
            State::Detached => fatal!("double detach of join point"),
        }
    }
}
