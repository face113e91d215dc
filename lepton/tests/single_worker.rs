//! Single-worker scenarios: with one worker every interleaving is
//! deterministic, so ordering properties can be asserted exactly.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use lepton::sync::{Barrier, Condition, Mutex, RecursiveMutex, RwLock, Semaphore, SemaphoreResult};
use lepton::{RuntimeConfig, Time};

#[test]
fn single_worker_suite() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _scope = RuntimeConfig::new(1, 1).bootstrap();

    yield_round_robin();
    semaphore_baton_v_first();
    semaphore_baton_p_first();
    mutex_fifo_handoff();
    mutex_timed_acquire_times_out();
    semaphore_timed_race_both_ways();
    pipe_wrapper_blocks_task_not_worker();
    nonblocking_fd_transparency();
    condition_signal_and_broadcast();
    condition_timed_wait();
    rwlock_alternation();
    barrier_distinguished_releaser();
    join_returns_value_and_panic();
    recursive_mutex_depth();
    task_local_destructors();
    sleep_lower_bound();
}

// S1: three tasks yielding on one worker interleave in strict round-robin.
fn yield_round_robin() {
    let trace: Arc<StdMutex<Vec<(usize, char)>>> = Arc::new(StdMutex::new(Vec::new()));
    let mk = |name: char| {
        let trace = trace.clone();
        lepton::spawn(move || {
            for i in 0..3 {
                trace.lock().unwrap().push((i, name));
                lepton::yield_now();
            }
        })
    };
    let a = mk('A');
    let b = mk('B');
    let c = mk('C');
    a.join().unwrap();
    b.join().unwrap();
    c.join().unwrap();
    let got = trace.lock().unwrap().clone();
    let expect = vec![
        (0, 'A'),
        (0, 'B'),
        (0, 'C'),
        (1, 'A'),
        (1, 'B'),
        (1, 'C'),
        (2, 'A'),
        (2, 'B'),
        (2, 'C'),
    ];
    assert_eq!(got, expect);
}

// S2, V first: all three tokens are banked, P never parks.
fn semaphore_baton_v_first() {
    let sem = Arc::new(Semaphore::new(0));
    {
        let sem = sem.clone();
        lepton::spawn(move || {
            sem.v();
            sem.v();
            sem.v();
        })
        .join()
        .unwrap();
    }
    let sem2 = sem.clone();
    let p = lepton::spawn(move || {
        let mut results = Vec::new();
        for _ in 0..3 {
            results.push(sem2.p());
        }
        results
    });
    let results = p.join().unwrap();
    assert_eq!(results, vec![SemaphoreResult::WasOpen; 3]);
    assert_eq!(sem.value(), 0);
}

// S2, P first: each P parks and is batoned a token by the matching V.
fn semaphore_baton_p_first() {
    let sem = Arc::new(Semaphore::new(0));
    let sem2 = sem.clone();
    let p = lepton::spawn(move || {
        let mut results = Vec::new();
        for _ in 0..3 {
            results.push(sem2.p());
        }
        results
    });
    // Let P park, then release tokens one at a time.
    while lepton::yield_now() {}
    for _ in 0..3 {
        sem.v();
        while lepton::yield_now() {}
    }
    let results = p.join().unwrap();
    assert_eq!(results, vec![SemaphoreResult::Success; 3]);
    assert_eq!(sem.value(), 0);
}

// Invariant 3: a held mutex hands off to blocked acquirers in FIFO order.
fn mutex_fifo_handoff() {
    let m = Arc::new(Mutex::new());
    let order: Arc<StdMutex<Vec<usize>>> = Arc::new(StdMutex::new(Vec::new()));
    m.acquire();
    let handles: Vec<_> = (1..=3)
        .map(|id| {
            let m = m.clone();
            let order = order.clone();
            lepton::spawn(move || {
                m.acquire();
                order.lock().unwrap().push(id);
                m.release();
            })
        })
        .collect();
    // Drain the worker until all three are parked on the mutex, in the
    // order they were spawned (FIFO ready queue, one worker).
    while lepton::yield_now() {}
    m.release();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    assert!(!m.is_locked());
}

// S3: a timed acquire on a held mutex returns timeout and leaves no queue
// residue behind.
fn mutex_timed_acquire_times_out() {
    let m = Arc::new(Mutex::new());
    m.acquire();
    let m2 = m.clone();
    let b = lepton::spawn(move || m2.acquire_deadline(Time::after(Duration::from_millis(10))));
    let start = Instant::now();
    lepton::sleep(Duration::from_millis(100));
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(!b.join().unwrap(), "timed acquire must report timeout");
    m.release();
    assert!(!m.is_locked());
    // A fresh acquirer gets the lock straight away: no stale waiter.
    let m3 = m.clone();
    lepton::spawn(move || {
        assert!(m3.try_acquire());
        m3.release();
    })
    .join()
    .unwrap();
}

// Invariant 6: of semaphore-vs-timer, exactly one side wins.
fn semaphore_timed_race_both_ways() {
    // (a) The semaphore wins: a V arrives well before the deadline.
    let sem = Arc::new(Semaphore::new(0));
    let sem2 = sem.clone();
    let p = lepton::spawn(move || sem2.p_deadline(Time::after(Duration::from_millis(200))));
    while lepton::yield_now() {}
    sem.v();
    assert_eq!(p.join().unwrap(), SemaphoreResult::Success);
    // Sleep past the old deadline: the cancelled timer must not fire into
    // anything.
    lepton::sleep(Duration::from_millis(250));

    // (b) The timer wins: the waiter is gone from the queue afterwards,
    // so a later V banks the token instead of passing a baton.
    let sem2 = sem.clone();
    let p = lepton::spawn(move || sem2.p_deadline(Time::after(Duration::from_millis(10))));
    assert_eq!(p.join().unwrap(), SemaphoreResult::Timeout);
    sem.v();
    assert_eq!(sem.value(), 1);
    assert_eq!(sem.try_p(), SemaphoreResult::WasOpen);
}

// S5: a read on an empty pipe parks only the task; the same worker keeps
// running and performs the write that releases it.
fn pipe_wrapper_blocks_task_not_worker() {
    let (rd, wr) = lepton::io::pipe(0).unwrap();
    let start = Instant::now();
    let reader = lepton::spawn(move || {
        let mut buf = [0u8; 1];
        let n = lepton::io::read(rd, &mut buf).unwrap();
        (n, buf[0], start.elapsed())
    });
    lepton::sleep(Duration::from_millis(10));
    assert_eq!(lepton::io::write(wr, &[0x5a]).unwrap(), 1);
    let (n, byte, elapsed) = reader.join().unwrap();
    assert_eq!((n, byte), (1, 0x5a));
    assert!(elapsed >= Duration::from_millis(10));
    lepton::io::close(rd).unwrap();
    lepton::io::close(wr).unwrap();
}

// Invariant 7: explicit non-blocking FDs behave exactly like raw syscalls.
fn nonblocking_fd_transparency() {
    let (rd, wr) = lepton::io::pipe(libc::O_NONBLOCK).unwrap();
    let mut buf = [0u8; 8];
    let err = lepton::io::read(rd, &mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    assert_eq!(lepton::io::write(wr, b"x").unwrap(), 1);
    assert_eq!(lepton::io::read(rd, &mut buf).unwrap(), 1);
    assert_eq!(buf[0], b'x');
    lepton::io::close(rd).unwrap();
    lepton::io::close(wr).unwrap();
}

fn condition_signal_and_broadcast() {
    let m = Arc::new(Mutex::new());
    let cond = Arc::new(Condition::new());
    let ready = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let (m, cond, ready) = (m.clone(), cond.clone(), ready.clone());
            lepton::spawn(move || {
                m.acquire();
                ready.fetch_add(1, Ordering::SeqCst);
                cond.wait(&m);
                m.release();
            })
        })
        .collect();
    while lepton::yield_now() {}
    assert_eq!(ready.load(Ordering::SeqCst), 3);

    // One signal wakes exactly one waiter.
    m.acquire();
    cond.signal();
    m.release();
    while lepton::yield_now() {}

    // Broadcast drains the rest.
    m.acquire();
    cond.broadcast();
    m.release();
    for h in handles {
        h.join().unwrap();
    }
}

fn condition_timed_wait() {
    let m = Arc::new(Mutex::new());
    let cond = Arc::new(Condition::new());
    let (m2, cond2) = (m.clone(), cond.clone());
    let h = lepton::spawn(move || {
        m2.acquire();
        let signaled = cond2.wait_deadline(&m2, Time::after(Duration::from_millis(10)));
        m2.release();
        signaled
    });
    assert!(!h.join().unwrap(), "nobody signals: the deadline wins");
}

fn rwlock_alternation() {
    let rw = Arc::new(RwLock::new());

    // Concurrent readers.
    rw.acquire_read();
    assert!(rw.try_acquire_read());
    assert!(!rw.try_acquire_write());
    rw.release();
    rw.release();

    // Writer excludes readers; queued writer blocks new readers.
    rw.acquire_write();
    let rw2 = rw.clone();
    let reader = lepton::spawn(move || {
        rw2.acquire_read();
        rw2.release();
        true
    });
    while lepton::yield_now() {}
    rw.release();
    assert!(reader.join().unwrap());

    // A releasing writer hands off to a queued writer before any queued
    // reader, even when the reader arrived first.
    let order: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));
    rw.acquire_write();
    let (rw2, order2) = (rw.clone(), order.clone());
    let queued_reader = lepton::spawn(move || {
        rw2.acquire_read();
        order2.lock().unwrap().push("reader");
        rw2.release();
    });
    while lepton::yield_now() {}
    let (rw2, order2) = (rw.clone(), order.clone());
    let queued_writer = lepton::spawn(move || {
        rw2.acquire_write();
        order2.lock().unwrap().push("writer");
        rw2.release();
    });
    while lepton::yield_now() {}
    rw.release();
    queued_writer.join().unwrap();
    queued_reader.join().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["writer", "reader"]);

    // Timed write acquisition under a held read lock times out.
    rw.acquire_read();
    let rw2 = rw.clone();
    let w = lepton::spawn(move || rw2.acquire_write_deadline(Time::after(Duration::from_millis(10))));
    assert!(!w.join().unwrap());
    rw.release();
}

fn barrier_distinguished_releaser() {
    let bar = Arc::new(Barrier::new(3));
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let bar = bar.clone();
            lepton::spawn(move || bar.wait())
        })
        .collect();
    let trues = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|&b| b)
        .count();
    assert_eq!(trues, 1, "exactly one participant gets the release code");
}

// Invariant 8: join returns the entry's value; a panic transfers as the
// join error.
fn join_returns_value_and_panic() {
    let h = lepton::spawn(|| 40 + 2);
    assert_eq!(h.join().unwrap(), 42);

    let h = lepton::spawn(|| -> u32 { panic!("task exploded") });
    let err = h.join().unwrap_err();
    let msg = err.downcast_ref::<&str>().copied().unwrap_or_default();
    assert_eq!(msg, "task exploded");
}

fn recursive_mutex_depth() {
    let m = Arc::new(RecursiveMutex::new());
    let m2 = m.clone();
    lepton::spawn(move || {
        assert_eq!(m2.acquire(), 1);
        assert_eq!(m2.acquire(), 2);
        assert_eq!(m2.try_acquire(), 3);
        assert_eq!(m2.release(), 2);
        assert_eq!(m2.release(), 1);
        assert_eq!(m2.release(), 0);
    })
    .join()
    .unwrap();
    // Unheld again: another task can take it.
    let m2 = m.clone();
    lepton::spawn(move || {
        assert_eq!(m2.acquire(), 1);
        assert_eq!(m2.release(), 0);
    })
    .join()
    .unwrap();
}

static DTOR_RUNS: AtomicUsize = AtomicUsize::new(0);

unsafe fn counting_dtor(v: *mut ()) {
    assert_eq!(v as usize, 0x1234);
    DTOR_RUNS.fetch_add(1, Ordering::SeqCst);
}

fn task_local_destructors() {
    let key = lepton::task::key_create(Some(counting_dtor));
    lepton::spawn(move || {
        // SAFETY: the value is a plain cookie checked by the destructor.
        unsafe { lepton::task::set_specific(key, 0x1234 as *mut ()) };
        assert_eq!(lepton::task::get_specific(key), 0x1234 as *mut ());
    })
    .join()
    .unwrap();
    assert_eq!(DTOR_RUNS.load(Ordering::SeqCst), 1);
    lepton::task::key_delete(key);
}

fn sleep_lower_bound() {
    let start = Instant::now();
    lepton::sleep(Duration::from_millis(25));
    assert!(start.elapsed() >= Duration::from_millis(25));
}
