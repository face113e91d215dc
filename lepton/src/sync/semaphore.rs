//! Counting and binary semaphores with baton passing.
//!
//! `V` never increments past a waiter: it hands the "token" directly to
//! the first eligible parked task, so the counter stays accurate while
//! waiters are queued. The binary flavor additionally treats a `V` on an
//! already-open semaphore as a no-op and offers the `wait` operation used
//! for level-triggered FD readiness (zero the count, then always park, so
//! stale state is never consumed).

use std::sync::atomic::{AtomicIsize, Ordering};

use lepton_core::queue::NemesisQueue;
use parking_lot::Mutex as PlMutex;

use crate::debug::fatal;
use crate::sync::waitlist::WaitList;
use crate::sync::wait_for_token;
use crate::task::{self, Task};
use crate::timer::Time;

/// Outcome of a `P` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreResult {
    /// The deadline passed (or a try failed) before a token arrived.
    Timeout,
    /// Parked and later handed a token by a `V` (baton).
    Success,
    /// A token was available immediately; no parking happened.
    WasOpen,
}

impl SemaphoreResult {
    /// True unless the operation timed out.
    pub fn success(self) -> bool {
        !matches!(self, SemaphoreResult::Timeout)
    }
}

struct Inner {
    counter: isize,
    waiters: WaitList,
}

/// Blocking semaphore whose waiters are tasks.
pub struct Semaphore {
    inner: PlMutex<Inner>,
    binary: bool,
}

impl Semaphore {
    /// Counting semaphore with an initial token count.
    pub fn new(count: isize) -> Self {
        Self {
            inner: PlMutex::new(Inner {
                counter: count,
                waiters: WaitList::new(),
            }),
            binary: false,
        }
    }

    /// Binary semaphore (count clamped to {0, 1}).
    pub fn new_binary(open: bool) -> Self {
        Self {
            inner: PlMutex::new(Inner {
                counter: open as isize,
                waiters: WaitList::new(),
            }),
            binary: true,
        }
    }

    fn p_locked(
        &self,
        mut inner: parking_lot::MutexGuard<'_, Inner>,
        wait: bool,
        deadline: Option<Time>,
    ) -> SemaphoreResult {
        if inner.counter >= 1 {
            inner.counter -= 1;
            return SemaphoreResult::WasOpen;
        }
        if !wait {
            return SemaphoreResult::Timeout;
        }
        if let Some(d) = deadline {
            if d <= Time::now() {
                return SemaphoreResult::Timeout;
            }
        }
        let cur = task::current();
        cur.park().prepare_resume_race();
        inner.waiters.push_task(cur);
        let token = inner.waiters.token();
        drop(inner);
        if wait_for_token(token, deadline) {
            SemaphoreResult::Success
        } else {
            self.inner.lock().waiters.remove(cur);
            SemaphoreResult::Timeout
        }
    }

    /// Acquires a token, parking until one is available.
    pub fn p(&self) -> SemaphoreResult {
        self.p_locked(self.inner.lock(), true, None)
    }

    /// Non-blocking acquire attempt.
    pub fn try_p(&self) -> SemaphoreResult {
        self.p_locked(self.inner.lock(), false, None)
    }

    /// Acquire with an absolute deadline.
    pub fn p_deadline(&self, deadline: Time) -> SemaphoreResult {
        self.p_locked(self.inner.lock(), true, Some(deadline))
    }

    /// Level-triggered flavor: discard any stored token and park until the
    /// next `V`. Binary only.
    pub fn wait(&self) -> SemaphoreResult {
        let mut inner = self.inner.lock();
        if !self.binary {
            fatal!("wait() on a counting semaphore");
        }
        debug_assert!(inner.counter >= 0);
        inner.counter = 0;
        self.p_locked(inner, true, None)
    }

    /// Releases a token: baton-passes to a waiter, or banks the token.
    pub fn v(&self) {
        if let Some(next) = self.v_handoff() {
            next.resume();
        }
    }

    /// Like [`v`](Self::v) but returns the woken task unresumed, for
    /// callers that hand it off specially.
    pub(crate) fn v_handoff(&self) -> Option<&'static Task> {
        let mut inner = self.inner.lock();
        if let Some(next) = inner.waiters.unblock() {
            return Some(next);
        }
        if self.binary {
            inner.counter = 1;
        } else {
            inner.counter += 1;
        }
        None
    }

    /// Current token count (unsynchronized snapshot).
    pub fn value(&self) -> isize {
        self.inner.lock().counter
    }

    pub(crate) fn has_waiters(&self) -> bool {
        !self.inner.lock().waiters.is_empty()
    }

    /// Reinitializes the count. Waiters must have drained (baton passing
    /// cannot be serialized with a pending handoff).
    pub fn reset(&self, count: isize) {
        let mut inner = self.inner.lock();
        if !inner.waiters.is_empty() {
            fatal!("semaphore reset with parked waiters");
        }
        inner.counter = if self.binary { count.clamp(0, 1) } else { count };
    }
}

/// Benaphore-fronted semaphore: an atomic counter keeps the uncontended
/// path lock-free; contended tasks park in an intrusive MPSC queue. No
/// deadline support; used by [`FastMutex`](crate::sync::FastMutex).
pub(crate) struct FastSemaphore {
    counter: AtomicIsize,
    pop_lock: PlMutex<()>,
    queue: NemesisQueue,
}

impl FastSemaphore {
    pub(crate) fn new(count: isize) -> Self {
        Self {
            counter: AtomicIsize::new(count),
            pop_lock: PlMutex::new(()),
            queue: NemesisQueue::new(),
        }
    }

    /// Acquire; parks on the slow path.
    pub(crate) fn p(&self) {
        if self.counter.fetch_sub(1, Ordering::SeqCst) > 0 {
            return;
        }
        let cur = task::current();
        // SAFETY: the current task is alive and joins exactly this queue.
        unsafe {
            self.queue.push(cur.as_link());
        }
        task::suspend_current();
    }

    // Binary benaphore V: true means no waiter needs a handoff.
    fn v_counter(&self) -> bool {
        let mut expect = 0isize;
        loop {
            match self.counter.compare_exchange(
                expect,
                expect + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    if expect == 0 {
                        return true;
                    }
                    debug_assert!(expect < 0);
                    return false;
                }
                Err(cur) => {
                    if cur == 1 {
                        return true; // spurious V on an open semaphore
                    }
                    debug_assert!(cur < 1);
                    expect = cur;
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Release; returns a waiter to resume when one was owed a token. May
    /// briefly spin (and yield) until the counted waiter finishes pushing.
    pub(crate) fn v_handoff(&self) -> Option<&'static Task> {
        if self.v_counter() {
            return None;
        }
        loop {
            for _ in 0..128 {
                let popped = {
                    let _g = self.pop_lock.lock();
                    // SAFETY: consumers serialize on pop_lock.
                    unsafe { self.queue.pop() }
                };
                if let Some(link) = popped {
                    // SAFETY: only tasks are pushed into this queue.
                    let t = unsafe { Task::from_link(link) };
                    // SAFETY: the waiter parks until resumed.
                    return Some(unsafe { &*t.as_ptr() });
                }
                std::hint::spin_loop();
            }
            // Let the pusher run if it shares this worker.
            task::yield_now();
        }
    }
}
