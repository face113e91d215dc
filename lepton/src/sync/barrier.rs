//! Barriers: a locked FIFO variant and a lock-light MPSC variant.

use std::ptr;
use std::sync::atomic::{AtomicIsize, Ordering};

use lepton_core::park::RaceToken;
use lepton_core::queue::NemesisQueue;
use parking_lot::Mutex as PlMutex;

use crate::debug::fatal;
use crate::sync::wait_for_token;
use crate::sync::waitlist::WaitList;
use crate::task::{self, Task};

struct Inner {
    target: usize,
    count: usize,
    waiters: WaitList,
}

/// Locked barrier: the Nth arrival releases everyone and resets. The
/// releasing participant receives `true` (the distinguished return).
pub struct Barrier {
    inner: PlMutex<Inner>,
}

impl Barrier {
    /// Creates a barrier for `target` participants.
    pub fn new(target: usize) -> Self {
        if target == 0 {
            fatal!("barrier target must be positive");
        }
        Self {
            inner: PlMutex::new(Inner {
                target,
                count: 0,
                waiters: WaitList::new(),
            }),
        }
    }

    /// Arrives at the barrier, parking until the group is complete.
    pub fn wait(&self) -> bool {
        let cur = task::current();
        let mut inner = self.inner.lock();
        inner.count += 1;
        if inner.count == inner.target {
            let mut woken = Vec::with_capacity(inner.target - 1);
            while inner.count > 0 {
                if let Some(t) = inner.waiters.unblock() {
                    woken.push(t);
                }
                inner.count -= 1;
            }
            drop(inner);
            for t in woken {
                t.resume();
            }
            true
        } else {
            cur.park().prepare_resume_race();
            inner.waiters.push_task(cur);
            let token = inner.waiters.token();
            drop(inner);
            let won = wait_for_token(token, None);
            debug_assert!(won);
            false
        }
    }
}

/// MPSC-queue barrier. Arrival order in the queue and the counter may
/// disagree, so a releasing participant can end up parking while one of
/// the tasks it released carries the distinguished return code for its
/// group (it is handed the releaser's address through the resume race).
pub struct FastBarrier {
    target: isize,
    counter: AtomicIsize,
    pop_lock: PlMutex<()>,
    queue: NemesisQueue,
}

impl FastBarrier {
    /// Creates a barrier for `target` participants.
    pub fn new(target: usize) -> Self {
        if target == 0 {
            fatal!("barrier target must be positive");
        }
        Self {
            target: target as isize,
            counter: AtomicIsize::new(0),
            pop_lock: PlMutex::new(()),
            queue: NemesisQueue::new(),
        }
    }

    /// Arrives at the barrier. Exactly one participant per release group
    /// returns `true`.
    pub fn wait(&self) -> bool {
        let cur = task::current();
        cur.park().prepare_resume_race();
        // SAFETY: the current task stays alive; it parks until popped and
        // resumed by a releaser (possibly itself).
        unsafe {
            self.queue.push(cur.as_link());
        }
        let mut park = (self.counter.fetch_add(1, Ordering::Relaxed) + 1) % self.target != 0;
        if !park {
            self.counter.fetch_sub(self.target, Ordering::Relaxed);
            park = true;
            let _g = self.pop_lock.lock();
            for i in 0..self.target {
                let next: &Task = loop {
                    // SAFETY: consumers serialize on pop_lock.
                    if let Some(link) = unsafe { self.queue.pop() } {
                        // SAFETY: only tasks enter this queue.
                        break unsafe { &*Task::from_link(link).as_ptr() };
                    }
                    std::hint::spin_loop();
                };
                if ptr::eq(next, cur) {
                    park = false; // released our own slot
                } else {
                    if i == self.target - 1 && park {
                        // Delegate the distinguished return to the last
                        // waiter of this group.
                        next.race_resume(cur as *const Task as RaceToken);
                    }
                    next.resume();
                }
            }
        }
        if park {
            !task::suspend_current().is_null()
        } else {
            true
        }
    }
}
