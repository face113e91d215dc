//! Task mutexes: fair FIFO, fast-path, and recursive variants.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex as PlMutex;

use crate::debug::fatal;
use crate::sync::semaphore::FastSemaphore;
use crate::sync::wait_for_token;
use crate::sync::waitlist::WaitList;
use crate::task::{self, Task};
use crate::timer::Time;

struct Inner {
    owner: *mut Task,
    waiters: WaitList,
}

// SAFETY: the raw owner pointer is only compared, never dereferenced.
unsafe impl Send for Inner {}

/// Fair blocking mutex: release baton-passes ownership to the first
/// waiter, so handoff order is strict FIFO.
pub struct Mutex {
    inner: PlMutex<Inner>,
}

impl Mutex {
    /// Creates an unlocked mutex.
    pub fn new() -> Self {
        Self {
            inner: PlMutex::new(Inner {
                owner: ptr::null_mut(),
                waiters: WaitList::new(),
            }),
        }
    }

    fn acquire_internal(&self, wait: bool, deadline: Option<Time>) -> bool {
        let cur = task::current();
        let curp = cur as *const Task as *mut Task;
        let mut inner = self.inner.lock();
        if inner.owner == curp {
            fatal!("recursive acquire of a non-recursive mutex");
        }
        if inner.owner.is_null() {
            inner.owner = curp;
            return true;
        }
        if !wait {
            return false;
        }
        if let Some(d) = deadline {
            if d <= Time::now() {
                return false;
            }
        }
        cur.park().prepare_resume_race();
        inner.waiters.push_task(cur);
        let token = inner.waiters.token();
        drop(inner);
        if wait_for_token(token, deadline) {
            // Baton passing: release() made us the owner before resuming.
            true
        } else {
            self.inner.lock().waiters.remove(cur);
            false
        }
    }

    /// Acquires the mutex, parking while it is held.
    pub fn acquire(&self) {
        let ok = self.acquire_internal(true, None);
        debug_assert!(ok);
    }

    /// Non-blocking acquisition attempt.
    pub fn try_acquire(&self) -> bool {
        self.acquire_internal(false, None)
    }

    /// Acquisition with an absolute deadline; false on timeout (the
    /// caller's queue entry is cleaned up).
    pub fn acquire_deadline(&self, deadline: Time) -> bool {
        self.acquire_internal(true, Some(deadline))
    }

    /// Releases the mutex, handing it to the longest-waiting task.
    pub fn release(&self) {
        let cur = task::current();
        let curp = cur as *const Task as *mut Task;
        let mut inner = self.inner.lock();
        if inner.owner != curp {
            fatal!("release of a mutex not held by the caller");
        }
        match inner.waiters.unblock() {
            Some(next) => {
                inner.owner = next as *const Task as *mut Task;
                drop(inner);
                next.resume();
            }
            None => inner.owner = ptr::null_mut(),
        }
    }

    pub(crate) fn held_by_current(&self) -> bool {
        let curp = task::current() as *const Task as *mut Task;
        self.inner.lock().owner == curp
    }

    /// True while some task owns the mutex (unsynchronized snapshot).
    pub fn is_locked(&self) -> bool {
        !self.inner.lock().owner.is_null()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

const FAST_SPIN_START: usize = 4;
const FAST_SPIN_END: usize = 1024;
const FAST_SPIN_ROUNDS: usize = 16;

/// Throughput-oriented mutex: spin ladder in front of a benaphore-backed
/// semaphore. No FIFO guarantee and no deadline support.
pub struct FastMutex {
    owner: AtomicPtr<Task>,
    sem: FastSemaphore,
}

impl FastMutex {
    /// Creates an unlocked fast mutex.
    pub fn new() -> Self {
        Self {
            owner: AtomicPtr::new(ptr::null_mut()),
            sem: FastSemaphore::new(1),
        }
    }

    fn try_once(&self, curp: *mut Task) -> bool {
        self.owner
            .compare_exchange(ptr::null_mut(), curp, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquires the mutex (spin, then park).
    pub fn acquire(&self) {
        let cur = task::current();
        let curp = cur as *const Task as *mut Task;
        if self.owner.load(Ordering::Relaxed) == curp {
            fatal!("recursive acquire of a fast mutex");
        }
        if self.try_once(curp) {
            return;
        }
        let mut rounds = 0;
        let mut spin = FAST_SPIN_START;
        loop {
            if self.try_once(curp) {
                return;
            }
            if rounds >= FAST_SPIN_ROUNDS {
                break;
            }
            for _ in 0..spin {
                std::hint::spin_loop();
            }
            if spin < FAST_SPIN_END {
                spin += spin;
            } else {
                rounds += 1;
            }
        }
        loop {
            self.sem.p();
            if self.try_once(curp) {
                return;
            }
        }
    }

    /// Non-blocking acquisition attempt.
    pub fn try_acquire(&self) -> bool {
        let curp = task::current() as *const Task as *mut Task;
        self.try_once(curp)
    }

    /// Releases the mutex.
    pub fn release(&self) {
        let curp = task::current() as *const Task as *mut Task;
        if self.owner.load(Ordering::Relaxed) != curp {
            fatal!("release of a fast mutex not held by the caller");
        }
        self.owner.store(ptr::null_mut(), Ordering::Release);
        if let Some(next) = self.sem.v_handoff() {
            next.resume();
        }
    }
}

impl Default for FastMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner-recursive wrapper around [`Mutex`].
pub struct RecursiveMutex {
    base: Mutex,
    depth: AtomicUsize, // mutated by the owner only
}

impl RecursiveMutex {
    /// Creates an unlocked recursive mutex.
    pub fn new() -> Self {
        Self {
            base: Mutex::new(),
            depth: AtomicUsize::new(0),
        }
    }

    /// Acquires; re-acquisition by the owner increments the depth.
    /// Returns the new depth.
    pub fn acquire(&self) -> usize {
        if self.base.held_by_current() {
            return self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        }
        self.base.acquire();
        self.depth.store(1, Ordering::Relaxed);
        1
    }

    /// Non-blocking acquire; 0 on failure, else the new depth.
    pub fn try_acquire(&self) -> usize {
        if self.base.held_by_current() {
            return self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        }
        if self.base.try_acquire() {
            self.depth.store(1, Ordering::Relaxed);
            1
        } else {
            0
        }
    }

    /// Releases one level; the mutex is unlocked at depth 0. Returns the
    /// remaining depth.
    pub fn release(&self) -> usize {
        let d = self.depth.load(Ordering::Relaxed);
        if d == 0 {
            fatal!("release of an unheld recursive mutex");
        }
        if d > 1 {
            self.depth.store(d - 1, Ordering::Relaxed);
            return d - 1;
        }
        self.depth.store(0, Ordering::Relaxed);
        self.base.release();
        0
    }
}

impl Default for RecursiveMutex {
    fn default() -> Self {
        Self::new()
    }
}
