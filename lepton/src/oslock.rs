//! OS-level blocking primitives for worker threads.
//!
//! These block the *kernel thread*, not a task: the halt path of an idle
//! worker and the stop-the-world pause both need real thread parking.

use parking_lot::{Condvar, Mutex};

/// Counting semaphore that parks the calling OS thread.
pub(crate) struct OsSemaphore {
    count: Mutex<isize>,
    cond: Condvar,
}

impl OsSemaphore {
    pub(crate) fn new(count: isize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Non-blocking P.
    pub(crate) fn try_p(&self) -> bool {
        let mut c = self.count.lock();
        if *c > 0 {
            *c -= 1;
            true
        } else {
            false
        }
    }

    /// Blocking P; parks the calling thread until a token is available.
    pub(crate) fn p(&self) {
        let mut c = self.count.lock();
        while *c < 1 {
            self.cond.wait(&mut c);
        }
        *c -= 1;
    }

    /// V; wakes one parked thread if any.
    pub(crate) fn v(&self) {
        let mut c = self.count.lock();
        *c += 1;
        drop(c);
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn try_p_counts_down() {
        let s = OsSemaphore::new(2);
        assert!(s.try_p());
        assert!(s.try_p());
        assert!(!s.try_p());
        s.v();
        assert!(s.try_p());
    }

    #[test]
    fn v_wakes_parked_thread() {
        let s = Arc::new(OsSemaphore::new(0));
        let s2 = s.clone();
        let h = thread::spawn(move || {
            s2.p();
        });
        thread::sleep(Duration::from_millis(20));
        s.v();
        h.join().unwrap();
    }
}
