//! FIFO queue of parked tasks with race-integrated wakeup.
//!
//! A `WaitList` never owns a lock; each primitive embeds one inside its
//! own mutex-protected state. The list's address doubles as the race
//! token, so an awoken task can tell whether the list (and not, say, a
//! timeout) was the source that resumed it.
//!
//! `unblock` walks from the front and skips entries whose race was already
//! won by another source (e.g. a timed-out waiter that has not yet cleaned
//! up its entry); the loser side removes its own entry under the
//! primitive's lock.

use std::collections::VecDeque;
use std::ptr::NonNull;

use lepton_core::park::RaceToken;

use crate::task::{Task, TaskRef};

pub(crate) struct WaitList {
    q: VecDeque<TaskRef>,
}

// SAFETY: `TaskRef` points at a `Task`, which is itself `Send + Sync`
// (see `task.rs`); `WaitList` only stores and walks these pointers under
// its owning primitive's lock.
unsafe impl Send for WaitList {}
unsafe impl Sync for WaitList {}

impl WaitList {
    pub(crate) const fn new() -> Self {
        Self { q: VecDeque::new() }
    }

    /// The race token identifying this list as a resume source.
    pub(crate) fn token(&self) -> RaceToken {
        self as *const WaitList as RaceToken
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    /// Appends a race-prepared task.
    pub(crate) fn push(&mut self, t: TaskRef) {
        self.q.push_back(t);
    }

    /// Wins the race for the first eligible waiter and removes it. The
    /// caller resumes the returned task (usually after dropping the
    /// primitive's lock).
    pub(crate) fn unblock(&mut self) -> Option<&'static Task> {
        let token = self.token();
        for i in 0..self.q.len() {
            let t = self.q[i];
            // SAFETY: a queued waiter is parked and alive; it cannot exit
            // before it is resumed or removes itself under the lock.
            let task = unsafe { &*t.as_ptr() };
            if task.race_resume(token) {
                self.q.remove(i);
                return Some(task);
            }
        }
        None
    }

    /// Removes a specific task (loser-side cleanup after a lost race).
    pub(crate) fn remove(&mut self, task: &Task) {
        if let Some(pos) = self
            .q
            .iter()
            .position(|t| std::ptr::eq(t.as_ptr(), task))
        {
            self.q.remove(pos);
        }
    }

    /// Enqueue helper for `&Task`.
    pub(crate) fn push_task(&mut self, task: &Task) {
        self.push(NonNull::from(task));
    }
}
