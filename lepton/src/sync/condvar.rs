//! Condition variable used together with an external [`Mutex`].

use parking_lot::Mutex as PlMutex;

use crate::sync::Mutex;
use crate::sync::wait_for_token;
use crate::sync::waitlist::WaitList;
use crate::task;
use crate::timer::Time;

/// Condition variable. Waiters hold a [`Mutex`] that is released while
/// parked and reacquired before the wait returns.
pub struct Condition {
    waiters: PlMutex<WaitList>,
}

impl Condition {
    /// Creates a condition with no waiters.
    pub fn new() -> Self {
        Self {
            waiters: PlMutex::new(WaitList::new()),
        }
    }

    fn wait_internal(&self, lock: &Mutex, deadline: Option<Time>) -> bool {
        if let Some(d) = deadline {
            if d <= Time::now() {
                return false;
            }
        }
        let cur = task::current();
        let mut w = self.waiters.lock();
        cur.park().prepare_resume_race();
        w.push_task(cur);
        let token = w.token();
        drop(w);
        lock.release();
        let signaled = wait_for_token(token, deadline);
        if !signaled {
            self.waiters.lock().remove(cur);
        }
        lock.acquire();
        signaled
    }

    /// Releases `lock`, parks until signaled, reacquires `lock`.
    pub fn wait(&self, lock: &Mutex) {
        self.wait_internal(lock, None);
    }

    /// Timed wait; false if the deadline won. The lock is reacquired in
    /// both cases.
    pub fn wait_deadline(&self, lock: &Mutex, deadline: Time) -> bool {
        self.wait_internal(lock, Some(deadline))
    }

    /// Wakes the longest-parked waiter, if any.
    pub fn signal(&self) {
        let next = self.waiters.lock().unblock();
        if let Some(t) = next {
            t.resume();
        }
    }

    /// Wakes every parked waiter.
    pub fn broadcast(&self) {
        loop {
            let next = self.waiters.lock().unblock();
            match next {
                Some(t) => t.resume(),
                None => break,
            }
        }
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}
