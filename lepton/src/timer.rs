//! Timer queue: absolute deadlines mapped to parked tasks.
//!
//! One queue per event scope. Deadlines are monotonic-clock instants; the
//! scope's master poller owns a timerfd armed for the earliest deadline
//! and calls [`TimerQueue::check_expiry`] when it fires. Expiry competes
//! through the resume race with whatever else the task is blocked on; the
//! queue's own address is the winning token for "timed out".

use std::collections::BTreeMap;
use std::ops::Add;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lepton_core::park::RaceToken;
use parking_lot::Mutex;

use crate::debug::syscall_check;
use crate::scope::EventScope;
use crate::stats::{self, StatBlock};
use crate::task::{self, Task, TaskRef};

/// An absolute instant on the monotonic clock, nanosecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Time {
    secs: i64,
    nanos: u32,
}

const NANOS_PER_SEC: u32 = 1_000_000_000;

impl Time {
    /// Reads the current monotonic time.
    pub fn now() -> Time {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: ts is a valid out-parameter.
        syscall_check!(
            unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) },
            "clock_gettime"
        );
        Time {
            secs: ts.tv_sec,
            nanos: ts.tv_nsec as u32,
        }
    }

    /// The instant `dur` from now.
    pub fn after(dur: Duration) -> Time {
        Time::now() + dur
    }

    pub(crate) fn to_timespec(self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.secs,
            tv_nsec: self.nanos as libc::c_long,
        }
    }
}

impl Add<Duration> for Time {
    type Output = Time;

    fn add(self, dur: Duration) -> Time {
        let mut secs = self.secs + dur.as_secs() as i64;
        let mut nanos = self.nanos + dur.subsec_nanos();
        if nanos >= NANOS_PER_SEC {
            nanos -= NANOS_PER_SEC;
            secs += 1;
        }
        Time { secs, nanos }
    }
}

/// Queue node, allocated on the blocked task's stack. `expired` is the
/// loser-side flag: set by the expiry walk when some other source won the
/// race, telling the task's cleanup that the map entry is already gone.
pub(crate) struct TimerNode {
    task: TaskRef,
    expired: AtomicBool,
}

struct TqInner {
    map: BTreeMap<(Time, u64), NonNull<TimerNode>>,
    seq: u64,
}

// SAFETY: node pointers are owned by parked tasks that outlive their map
// entry (see block_timeout).
unsafe impl Send for TqInner {}

/// Sorted multimap of deadlines to parked tasks.
pub(crate) struct TimerQueue {
    inner: Mutex<TqInner>,
    stats: &'static StatBlock,
}

const STAT_EVENTS: usize = 0;

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(TqInner {
                map: BTreeMap::new(),
                seq: 0,
            }),
            stats: stats::register("timer".into(), &["events"]),
        }
    }

    /// The race token meaning "the timer expired".
    pub(crate) fn token(&self) -> RaceToken {
        self as *const TimerQueue as RaceToken
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    /// Parks `task` until `deadline` or until another race source resumes
    /// it first. The caller has already called `prepare_resume_race` and
    /// registered with its other sources. Returns the winning token (this
    /// queue's token means timeout).
    pub(crate) fn block_timeout(
        &self,
        task: &Task,
        deadline: Time,
        scope: &'static EventScope,
    ) -> RaceToken {
        let node = TimerNode {
            task: NonNull::from(task),
            expired: AtomicBool::new(false),
        };
        let key = {
            let mut inner = self.inner.lock();
            inner.seq += 1;
            let key = (deadline, inner.seq);
            inner.map.insert(key, NonNull::from(&node));
            if inner.map.first_key_value().map(|(k, _)| *k) == Some(key) {
                scope.set_master_timer(deadline);
            }
            key
        };

        let winner = task::suspend_current();
        if winner == self.token() {
            return winner; // expiry walk removed the entry
        }
        // Another source won; remove our entry unless the expiry walk
        // already took it (and marked the node).
        if !node.expired.load(Ordering::Relaxed) {
            let mut inner = self.inner.lock();
            if !node.expired.load(Ordering::Relaxed) {
                inner.map.remove(&key);
            }
        }
        winner
    }

    /// Resumes every task whose deadline has passed; called by the master
    /// poller when the timerfd fires. Re-arms the timer for the new head.
    pub(crate) fn check_expiry(&self, scope: &'static EventScope) {
        let now = Time::now();
        let mut fired = 0u64;
        let mut inner = self.inner.lock();
        loop {
            let Some((&key, &node_ptr)) = inner.map.first_key_value() else {
                break;
            };
            if key.0 > now {
                scope.set_master_timer(key.0);
                break;
            }
            inner.map.remove(&key);
            // SAFETY: the node lives on its task's stack; the task cannot
            // leave block_timeout while we hold the lock and the node is
            // unmarked.
            let node = unsafe { node_ptr.as_ref() };
            let task = node.task;
            // SAFETY: as above.
            if unsafe { task.as_ref() }.race_resume(self.token()) {
                // SAFETY: we won the race and own the resume.
                unsafe { task.as_ref() }.resume();
            } else {
                // Loser: the winner's side owns the task; the mark must be
                // the last access to the node.
                node.expired.store(true, Ordering::Relaxed);
            }
            fired += 1;
        }
        drop(inner);
        self.stats.counter(STAT_EVENTS).add(fired);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_ordering_and_addition() {
        let t = Time {
            secs: 10,
            nanos: 999_999_999,
        };
        let u = t + Duration::from_nanos(1);
        assert_eq!(u, Time { secs: 11, nanos: 0 });
        assert!(u > t);
        let v = t + Duration::from_millis(1500);
        assert_eq!(
            v,
            Time {
                secs: 12,
                nanos: 499_999_999
            }
        );
    }

    #[test]
    fn now_is_monotonic() {
        let a = Time::now();
        let b = Time::now();
        assert!(b >= a);
        assert!(Time::after(Duration::from_secs(1)) > b);
    }
}
