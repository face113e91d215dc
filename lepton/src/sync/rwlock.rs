//! Blocking reader-writer lock.
//!
//! State: −1 = writer, 0 = open, >0 = reader count. New readers are turned
//! away while a writer is queued, and the last reader's release hands the
//! lock to a waiting writer; a writer's release wakes the next writer if
//! one is queued, otherwise it admits the queued readers (the first one
//! barges the rest in behind it).

use parking_lot::Mutex as PlMutex;

use crate::debug::fatal;
use crate::sync::wait_for_token;
use crate::sync::waitlist::WaitList;
use crate::task::{self, Task};
use crate::timer::Time;

struct Inner {
    state: isize,
    readers: WaitList,
    writers: WaitList,
}

/// Blocking reader-writer lock.
pub struct RwLock {
    inner: PlMutex<Inner>,
}

impl RwLock {
    /// Creates an open lock.
    pub fn new() -> Self {
        Self {
            inner: PlMutex::new(Inner {
                state: 0,
                readers: WaitList::new(),
                writers: WaitList::new(),
            }),
        }
    }

    fn read_internal(&self, wait: bool, deadline: Option<Time>) -> bool {
        let cur = task::current();
        let mut inner = self.inner.lock();
        if inner.state >= 0 && inner.writers.is_empty() {
            inner.state += 1;
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
        inner.readers.push_task(cur);
        let token = inner.readers.token();
        drop(inner);
        if !wait_for_token(token, deadline) {
            self.inner.lock().readers.remove(cur);
            return false;
        }
        // The releaser already counted us; wake the next queued reader so
        // the whole group barges in after the writer.
        let next = {
            let mut inner = self.inner.lock();
            match inner.readers.unblock() {
                Some(t) => {
                    inner.state += 1;
                    Some(t)
                }
                None => None,
            }
        };
        if let Some(t) = next {
            t.resume();
        }
        true
    }

    fn write_internal(&self, wait: bool, deadline: Option<Time>) -> bool {
        let cur = task::current();
        let mut inner = self.inner.lock();
        if inner.state == 0 {
            inner.state -= 1;
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
        inner.writers.push_task(cur);
        let token = inner.writers.token();
        drop(inner);
        if wait_for_token(token, deadline) {
            // Releaser set state = −1 on our behalf.
            true
        } else {
            self.inner.lock().writers.remove(cur);
            false
        }
    }

    /// Acquires shared access.
    pub fn acquire_read(&self) {
        let ok = self.read_internal(true, None);
        debug_assert!(ok);
    }

    /// Non-blocking shared acquisition.
    pub fn try_acquire_read(&self) -> bool {
        self.read_internal(false, None)
    }

    /// Shared acquisition with an absolute deadline.
    pub fn acquire_read_deadline(&self, deadline: Time) -> bool {
        self.read_internal(true, Some(deadline))
    }

    /// Acquires exclusive access.
    pub fn acquire_write(&self) {
        let ok = self.write_internal(true, None);
        debug_assert!(ok);
    }

    /// Non-blocking exclusive acquisition.
    pub fn try_acquire_write(&self) -> bool {
        self.write_internal(false, None)
    }

    /// Exclusive acquisition with an absolute deadline.
    pub fn acquire_write_deadline(&self, deadline: Time) -> bool {
        self.write_internal(true, Some(deadline))
    }

    /// Releases either side; a queued writer is preferred on both paths.
    pub fn release(&self) {
        let next: Option<&'static Task>;
        {
            let mut inner = self.inner.lock();
            if inner.state == 0 {
                fatal!("release of an open rwlock");
            }
            if inner.state > 0 {
                // Reader leaves; the last one hands off to a writer first.
                inner.state -= 1;
                if inner.state > 0 {
                    next = None;
                } else {
                    match inner.writers.unblock() {
                        Some(t) => {
                            inner.state -= 1;
                            next = Some(t);
                        }
                        None => match inner.readers.unblock() {
                            Some(t) => {
                                inner.state += 1;
                                next = Some(t);
                            }
                            None => next = None,
                        },
                    }
                }
            } else {
                // Writer leaves; hands off to the next writer, else the
                // queued readers get their turn (the first barges the rest
                // in behind it).
                debug_assert_eq!(inner.state, -1);
                inner.state += 1;
                match inner.writers.unblock() {
                    Some(t) => {
                        inner.state -= 1;
                        next = Some(t);
                    }
                    None => match inner.readers.unblock() {
                        Some(t) => {
                            inner.state += 1;
                            next = Some(t);
                        }
                        None => next = None,
                    },
                }
            }
        }
        if let Some(t) = next {
            t.resume();
        }
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}
