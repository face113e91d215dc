//! Multi-worker scenarios: stealing, affinity, migration, and the
//! stop-the-world pause.

use std::collections::HashSet;
use std::ptr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lepton::sync::{FastBarrier, FastMutex};
use lepton::{RuntimeConfig, TaskBuilder, Worker};

fn worker_id(w: &'static Worker) -> usize {
    w as *const Worker as usize
}

#[test]
fn multi_worker_suite() {
    let _ = env_logger::builder().is_test(true).try_init();
    let scope = RuntimeConfig::new(1, 2).bootstrap();

    work_stealing_distribution();
    affinity_pins_tasks();
    migration_reaches_other_workers();
    disk_cluster_direct_io(scope);
    pause_quiesces_other_workers(scope);
    fast_mutex_contention();
    fast_barrier_groups();
}

// S4: 100 unpinned tasks created on one worker spread across both via
// stealing; every task runs on exactly one worker.
fn work_stealing_distribution() {
    let home = lepton::task::current_worker();
    let ran_on: Arc<StdMutex<Vec<usize>>> = Arc::new(StdMutex::new(Vec::new()));
    let handles: Vec<_> = (0..100)
        .map(|_| {
            let ran_on = ran_on.clone();
            TaskBuilder::new()
                .worker(home)
                .affinity(false)
                .spawn(move || {
                    let me = worker_id(lepton::task::current_worker());
                    let start = Instant::now();
                    while start.elapsed() < Duration::from_millis(1) {
                        std::hint::spin_loop();
                    }
                    ran_on.lock().unwrap().push(me);
                })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let ran_on = ran_on.lock().unwrap();
    assert_eq!(ran_on.len(), 100);
    let stolen = ran_on
        .iter()
        .filter(|&&w| w != worker_id(home))
        .count();
    assert!(
        stolen >= 25,
        "expected the idle worker to steal a fair share, got {stolen}/100"
    );
}

// Invariant 5: a pinned task only ever executes on its home worker, even
// with an aggressive thief next door.
fn affinity_pins_tasks() {
    let home = lepton::task::current_worker();
    let violations = Arc::new(AtomicU64::new(0));
    let handles: Vec<_> = (0..20)
        .map(|_| {
            let violations = violations.clone();
            TaskBuilder::new()
                .worker(home)
                .affinity(true)
                .spawn(move || {
                    for _ in 0..10 {
                        if !ptr::eq(lepton::task::current_worker(), home) {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        lepton::yield_now();
                    }
                })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(violations.load(Ordering::SeqCst), 0);
}

// Round-robin migration must cycle the task across the whole ring.
fn migration_reaches_other_workers() {
    let h = lepton::spawn(|| {
        let cluster = lepton::task::current_worker().cluster();
        let mut seen = HashSet::new();
        for _ in 0..4 {
            seen.insert(worker_id(lepton::task::current_worker()));
            let previous = lepton::migrate(cluster);
            // The return value names the worker we left.
            assert!(seen.contains(&worker_id(previous)));
        }
        seen.insert(worker_id(lepton::task::current_worker()));
        seen.len()
    });
    assert!(h.join().unwrap() >= 2);
}

// Direct I/O migrates to the disk cluster and back.
fn disk_cluster_direct_io(scope: &'static lepton::EventScope) {
    let disk = scope.add_disk_cluster(1);
    let h = lepton::spawn(move || {
        let home = lepton::task::current_worker();
        let disk_worker = lepton::io::direct_io(|| lepton::task::current_worker());
        assert!(ptr::eq(disk_worker.cluster(), disk));
        assert!(!ptr::eq(disk_worker.cluster(), home.cluster()));
        // Back home after the call.
        ptr::eq(lepton::task::current_worker(), home)
    });
    assert!(h.join().unwrap());
}

// A paused cluster runs nothing on the other workers until resumed.
fn pause_quiesces_other_workers(scope: &'static lepton::EventScope) {
    let cluster = scope.main_cluster();
    let me = lepton::task::current_worker();
    let other = {
        // Find a worker that is not ours by cycling placements.
        let mut other = None;
        for _ in 0..8 {
            let w = lepton::spawn(|| lepton::task::current_worker());
            let w = w.join().unwrap();
            if !ptr::eq(w, me) {
                other = Some(w);
                break;
            }
        }
        other.expect("two-worker cluster must place somewhere else")
    };

    let guard = cluster.pause();
    let ran = Arc::new(AtomicBool::new(false));
    let ran2 = ran.clone();
    let h = TaskBuilder::new()
        .worker(other)
        .affinity(true)
        .spawn(move || ran2.store(true, Ordering::SeqCst));
    // The target worker is parked inside the pause fibre; give it time to
    // (wrongly) run the task if pause were broken.
    std::thread::sleep(Duration::from_millis(30));
    assert!(!ran.load(Ordering::SeqCst), "task ran during pause");
    drop(guard);
    h.join().unwrap();
    assert!(ran.load(Ordering::SeqCst));
}

fn fast_mutex_contention() {
    let m = Arc::new(FastMutex::new());
    let counter = Arc::new(AtomicU64::new(0));
    let inside = Arc::new(AtomicBool::new(false));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let (m, counter, inside) = (m.clone(), counter.clone(), inside.clone());
            lepton::spawn(move || {
                for _ in 0..1000 {
                    m.acquire();
                    assert!(!inside.swap(true, Ordering::SeqCst), "mutual exclusion broken");
                    counter.fetch_add(1, Ordering::Relaxed);
                    inside.store(false, Ordering::SeqCst);
                    m.release();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), 4000);
}

fn fast_barrier_groups() {
    const ROUNDS: usize = 25;
    let bar = Arc::new(FastBarrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let bar = bar.clone();
            lepton::spawn(move || {
                let mut trues = 0usize;
                for _ in 0..ROUNDS {
                    if bar.wait() {
                        trues += 1;
                    }
                }
                trues
            })
        })
        .collect();
    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, ROUNDS, "one distinguished return per release group");
}
