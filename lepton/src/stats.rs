//! Runtime statistics.
//!
//! Every long-lived component registers a counter block at creation. The
//! registry lives for the process; `FibrePrintStats` dumps it at exit and
//! `FibreStatsSignal` installs a handler that zeroes every counter. All
//! counters are relaxed atomics: they are advisory and never synchronize
//! anything.

use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::debug::syscall_check;

/// A single event counter.
#[derive(Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub(crate) fn count(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// One registered block of named counters.
pub(crate) struct StatBlock {
    label: String,
    counters: Vec<(&'static str, Counter)>,
}

impl StatBlock {
    /// Reads a counter by the index it was registered with.
    pub(crate) fn counter(&self, idx: usize) -> &Counter {
        &self.counters[idx].1
    }
}

struct Registry {
    blocks: Mutex<Vec<&'static StatBlock>>,
    // Lock-free snapshot for the signal handler.
    snapshot: AtomicPtr<Vec<&'static StatBlock>>,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        blocks: Mutex::new(Vec::new()),
        snapshot: AtomicPtr::new(std::ptr::null_mut()),
    })
}

/// Registers a new counter block and returns it with process lifetime.
pub(crate) fn register(label: String, names: &[&'static str]) -> &'static StatBlock {
    let block = Box::leak(Box::new(StatBlock {
        label,
        counters: names.iter().map(|n| (*n, Counter::default())).collect(),
    }));
    let reg = registry();
    let mut blocks = reg.blocks.lock();
    blocks.push(block);
    // Refresh the handler snapshot; the old one is leaked on purpose
    // (registration is rare and the handler may hold a stale pointer).
    let snap = Box::into_raw(Box::new(blocks.clone()));
    reg.snapshot.store(snap, Ordering::Release);
    block
}

/// Zeroes every registered counter. Async-signal-safe: touches only the
/// snapshot pointer and atomics.
pub(crate) fn reset_all() {
    let snap = registry().snapshot.load(Ordering::Acquire);
    if snap.is_null() {
        return;
    }
    // SAFETY: snapshots are never freed.
    for block in unsafe { &*snap } {
        for (_, c) in &block.counters {
            c.reset();
        }
    }
}

/// Renders all counters; with `totals`, appends a per-counter-name sum.
pub(crate) fn render(totals: bool) -> String {
    let mut out = String::new();
    let blocks = registry().blocks.lock();
    let mut sums: Vec<(&'static str, u64)> = Vec::new();
    for block in blocks.iter() {
        let _ = write!(out, "{}:", block.label);
        for (name, c) in &block.counters {
            let _ = write!(out, " {name}={}", c.get());
            if totals {
                match sums.iter_mut().find(|(n, _)| *n == *name) {
                    Some((_, s)) => *s += c.get(),
                    None => sums.push((name, c.get())),
                }
            }
        }
        out.push('\n');
    }
    if totals {
        let _ = write!(out, "totals:");
        for (name, s) in sums {
            let _ = write!(out, " {name}={s}");
        }
        out.push('\n');
    }
    out
}

static PRINT_AT_EXIT: AtomicBool = AtomicBool::new(false);
static PRINT_TOTALS: AtomicBool = AtomicBool::new(false);

extern "C" fn exit_hook() {
    if PRINT_AT_EXIT.load(Ordering::Relaxed) {
        eprint!("{}", render(PRINT_TOTALS.load(Ordering::Relaxed)));
    }
}

/// Arranges for a statistics dump at process exit.
pub(crate) fn enable_print_at_exit(totals: bool) {
    unsafe extern "C" {
        fn atexit(cb: extern "C" fn()) -> libc::c_int;
    }
    PRINT_AT_EXIT.store(true, Ordering::Relaxed);
    PRINT_TOTALS.store(totals, Ordering::Relaxed);
    // SAFETY: registering a plain extern "C" handler.
    syscall_check!(unsafe { atexit(exit_hook) }, "atexit");
}

extern "C" fn stats_signal_handler(_sig: libc::c_int) {
    reset_all();
}

/// Installs the counter-zeroing signal handler (`FibreStatsSignal`).
pub(crate) fn install_stats_signal(signum: libc::c_int) {
    // SAFETY: sa is fully initialized below before use.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = stats_signal_handler as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        syscall_check!(
            libc::sigaction(signum, &sa, std::ptr::null_mut()),
            "sigaction"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test: the registry (and reset_all) are process-global.
    #[test]
    fn register_render_reset() {
        let b = register("test-block".into(), &["alpha", "beta"]);
        b.counter(0).count();
        b.counter(0).count();
        b.counter(1).add(5);
        assert_eq!(b.counter(0).get(), 2);
        assert_eq!(b.counter(1).get(), 5);
        let out = render(false);
        assert!(out.contains("test-block: alpha=2 beta=5"));

        reset_all();
        assert_eq!(b.counter(0).get(), 0);
        assert_eq!(b.counter(1).get(), 0);
    }
}
