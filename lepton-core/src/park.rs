//! Park-state machine: the run-state word and the resume-race slot.
//!
//! Every blocking operation in the runtime funnels through this pair:
//!
//! - The *run-state word* holds one of Parked (0), Running (1), or
//!   ResumedEarly (2). Resume adds 1, suspend subtracts 1. The interesting
//!   transition is Running → ResumedEarly: a resumer got in before the
//!   suspending side completed its context switch, so the suspend must be
//!   skipped (or undone by the switch-off hook).
//! - The *race slot* selects exactly one winner when a task blocks on
//!   several sources at once (a wait queue and a timeout, say). Each source
//!   CASes its token into the slot; the first one wins the right to resume
//!   the task, losers abandon their attempt and leave their queue entry for
//!   the winner's side to clean up.
//!
//! The state transitions that matter are sequentially consistent; see the
//! ordering notes on each method.

use core::sync::atomic::{AtomicIsize, AtomicPtr, Ordering};

/// Opaque token identifying the winning resume source.
///
/// By convention this is the address of the source's queue, so the awoken
/// task can tell which source fired.
pub type RaceToken = *mut ();

/// Token stored by [`ParkState::cancel_running_race`] to block all further
/// resume attempts. Never a valid source address.
pub const POISON_TOKEN: RaceToken = 1 as RaceToken;

const PARKED: isize = 0;
const RUNNING: isize = 1;
const RESUMED_EARLY: isize = 2;

/// What the suspending side must do after committing a suspend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendOutcome {
    /// Running → Parked: perform the context switch.
    SwitchOut,
    /// ResumedEarly → Running: a resumer raced ahead, keep running.
    ResumedEarly,
}

/// What the resuming side must do after committing a resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Parked → Running: the task must be enqueued on its worker.
    Enqueue,
    /// Running → ResumedEarly: the suspend side will observe this and
    /// continue (or re-resume from its switch-off hook).
    RacedEarly,
}

/// Run-state word plus resume-race slot for one task.
pub struct ParkState {
    state: AtomicIsize,
    resume_info: AtomicPtr<()>,
}

impl ParkState {
    /// Creates the state for a task that is currently running.
    pub const fn new_running() -> Self {
        Self {
            state: AtomicIsize::new(RUNNING),
            resume_info: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Clears the race slot. Must be called by the task itself, while
    /// Running, before inserting itself into any source's queue.
    pub fn prepare_resume_race(&self) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed), RUNNING);
        self.resume_info.store(core::ptr::null_mut(), Ordering::SeqCst);
    }

    /// One source's attempt to win the resume race. Returns `true` exactly
    /// once per [`prepare_resume_race`] cycle; the winner must then resume
    /// the task.
    pub fn race_resume(&self, token: RaceToken) -> bool {
        self.resume_info
            .compare_exchange(
                core::ptr::null_mut(),
                token,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Poisons the race slot so no further `race_resume` can succeed.
    /// Returns the previously stored token (null if the race was still
    /// open). Used by fast paths that abandon a prepared race while still
    /// Running.
    pub fn cancel_running_race(&self) -> RaceToken {
        self.resume_info.swap(POISON_TOKEN, Ordering::SeqCst)
    }

    /// Reverts ResumedEarly → Running without a suspend, when a fast path
    /// consumed the pending resume.
    pub fn cancel_early_resume(&self) {
        self.state.store(RUNNING, Ordering::SeqCst);
    }

    /// Spin-window step of suspend: if a resumer already moved the task to
    /// ResumedEarly, revert to Running and return the winning token without
    /// a context switch.
    pub fn try_skip_suspend(&self) -> Option<RaceToken> {
        if self
            .state
            .compare_exchange(RESUMED_EARLY, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Some(self.resume_info.load(Ordering::SeqCst))
        } else {
            None
        }
    }

    /// Commits the suspend by subtracting 1 from the run state.
    ///
    /// Called from the *switch-off hook*, i.e. already on the next task's
    /// stack, so that a racing resumer observing Parked can safely enqueue.
    pub fn commit_suspend(&self) -> SuspendOutcome {
        let prev = self.state.fetch_sub(1, Ordering::SeqCst);
        match prev {
            RUNNING => SuspendOutcome::SwitchOut,
            RESUMED_EARLY => SuspendOutcome::ResumedEarly,
            _ => unreachable!("suspend from state {prev}"),
        }
    }

    /// Commits a resume by adding 1 to the run state.
    pub fn commit_resume(&self) -> ResumeOutcome {
        let prev = self.state.fetch_add(1, Ordering::SeqCst);
        match prev {
            PARKED => ResumeOutcome::Enqueue,
            RUNNING => ResumeOutcome::RacedEarly,
            _ => unreachable!("resume from state {prev}"),
        }
    }

    /// Reads the token stored by the race winner. Valid on the task's own
    /// return path from suspend.
    pub fn resume_info(&self) -> RaceToken {
        self.resume_info.load(Ordering::SeqCst)
    }

    /// True while the task is in the Running state. Advisory (relaxed).
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Relaxed) == RUNNING
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn race_single_winner() {
        let ps = ParkState::new_running();
        ps.prepare_resume_race();
        let a = 0x10 as RaceToken;
        let b = 0x20 as RaceToken;
        assert!(ps.race_resume(a));
        assert!(!ps.race_resume(b));
        assert_eq!(ps.resume_info(), a);
    }

    #[test]
    fn prepare_reopens_race() {
        let ps = ParkState::new_running();
        ps.prepare_resume_race();
        assert!(ps.race_resume(0x10 as RaceToken));
        ps.prepare_resume_race();
        assert!(ps.race_resume(0x20 as RaceToken));
        assert_eq!(ps.resume_info(), 0x20 as RaceToken);
    }

    #[test]
    fn poison_blocks_resume() {
        let ps = ParkState::new_running();
        ps.prepare_resume_race();
        assert!(ps.cancel_running_race().is_null());
        assert!(!ps.race_resume(0x10 as RaceToken));
    }

    #[test]
    fn poison_reports_earlier_winner() {
        let ps = ParkState::new_running();
        ps.prepare_resume_race();
        assert!(ps.race_resume(0x10 as RaceToken));
        assert_eq!(ps.cancel_running_race(), 0x10 as RaceToken);
    }

    #[test]
    fn suspend_resume_normal_order() {
        let ps = ParkState::new_running();
        // Task parks first, resume arrives later.
        assert_eq!(ps.commit_suspend(), SuspendOutcome::SwitchOut);
        assert_eq!(ps.commit_resume(), ResumeOutcome::Enqueue);
    }

    #[test]
    fn resume_races_ahead_of_suspend() {
        let ps = ParkState::new_running();
        // Resume lands while the task is still Running.
        assert_eq!(ps.commit_resume(), ResumeOutcome::RacedEarly);
        // The suspend side then observes ResumedEarly and keeps running.
        assert_eq!(ps.commit_suspend(), SuspendOutcome::ResumedEarly);
    }

    #[test]
    fn spin_window_catches_early_resume() {
        let ps = ParkState::new_running();
        ps.prepare_resume_race();
        assert!(ps.race_resume(0x30 as RaceToken));
        assert_eq!(ps.commit_resume(), ResumeOutcome::RacedEarly);
        // try_skip_suspend consumes the early resume without a switch.
        assert_eq!(ps.try_skip_suspend(), Some(0x30 as RaceToken));
        assert!(ps.is_running());
        // And the window does not fire spuriously.
        assert_eq!(ps.try_skip_suspend(), None);
    }

    #[test]
    fn cancel_early_resume_restores_running() {
        let ps = ParkState::new_running();
        assert_eq!(ps.commit_resume(), ResumeOutcome::RacedEarly);
        ps.cancel_early_resume();
        assert!(ps.is_running());
    }

    // At-most-one-resume under contention: many threads race for the slot,
    // exactly one wins per cycle.
    #[test]
    fn concurrent_racers_single_winner() {
        const RACERS: usize = 8;
        const ROUNDS: usize = 200;

        let ps = Arc::new(ParkState::new_running());
        let wins = Arc::new(AtomicUsize::new(0));

        for _ in 0..ROUNDS {
            ps.prepare_resume_race();
            wins.store(0, Ordering::SeqCst);
            let handles: Vec<_> = (0..RACERS)
                .map(|i| {
                    let ps = ps.clone();
                    let wins = wins.clone();
                    thread::spawn(move || {
                        let token = ((i + 1) * 0x100) as RaceToken;
                        if ps.race_resume(token) {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(wins.load(Ordering::SeqCst), 1);
            assert!(!ps.resume_info().is_null());
        }
    }
}
