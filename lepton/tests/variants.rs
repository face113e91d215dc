//! Alternate-configuration smoke test: fiber pollers, worker-local
//! pollers, counter-based idle manager, locked ready queues.

use std::sync::Arc;
use std::time::Duration;

use lepton::sync::{Semaphore, SemaphoreResult};
use lepton::{IdleManagerKind, PollerKind, ReadyQueueKind, RuntimeConfig, Time};

#[test]
fn variant_suite() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _scope = RuntimeConfig::new(1, 2)
        .idle_manager(IdleManagerKind::Counter)
        .ready_queue(ReadyQueueKind::Locked)
        .cluster_poller(PollerKind::Fiber)
        .worker_poller(true)
        .bootstrap();

    spawn_join_across_workers();
    pipe_io_through_worker_poller();
    timed_semaphore();
}

fn spawn_join_across_workers() {
    let handles: Vec<_> = (0..32usize)
        .map(|i| lepton::spawn(move || i * 2))
        .collect();
    let sum: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(sum, (0..32usize).map(|i| i * 2).sum::<usize>());
}

fn pipe_io_through_worker_poller() {
    let (rd, wr) = lepton::io::pipe(0).unwrap();
    let reader = lepton::spawn(move || {
        let mut buf = [0u8; 4];
        let n = lepton::io::read(rd, &mut buf).unwrap();
        (n, buf)
    });
    lepton::sleep(Duration::from_millis(10));
    assert_eq!(lepton::io::write(wr, b"abcd").unwrap(), 4);
    let (n, buf) = reader.join().unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf, b"abcd");
    lepton::io::close(rd).unwrap();
    lepton::io::close(wr).unwrap();
}

fn timed_semaphore() {
    let sem = Arc::new(Semaphore::new(0));
    let sem2 = sem.clone();
    let h = lepton::spawn(move || sem2.p_deadline(Time::after(Duration::from_millis(10))));
    assert_eq!(h.join().unwrap(), SemaphoreResult::Timeout);

    let sem2 = sem.clone();
    let h = lepton::spawn(move || sem2.p());
    lepton::sleep(Duration::from_millis(5));
    sem.v();
    assert_eq!(h.join().unwrap(), SemaphoreResult::Success);
}
