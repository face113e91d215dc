//! Alternate-configuration smoke test: stub-based MPSC ready queues and
//! the yield-before-read input path.

use std::time::Duration;

use lepton::{ReadyQueueKind, RuntimeConfig};

#[test]
fn stub_queue_suite() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = RuntimeConfig::new(1, 2).ready_queue(ReadyQueueKind::Stub);
    config.yield_before_read = true;
    let _scope = config.bootstrap();

    // Heavy spawn/yield churn through the stub queues.
    let handles: Vec<_> = (0..64usize)
        .map(|i| {
            lepton::spawn(move || {
                for _ in 0..10 {
                    lepton::yield_now();
                }
                i
            })
        })
        .collect();
    let sum: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(sum, (0..64usize).sum::<usize>());

    // Read path with the pre-read yield enabled.
    let (rd, wr) = lepton::io::pipe(0).unwrap();
    let reader = lepton::spawn(move || {
        let mut buf = [0u8; 2];
        lepton::io::read(rd, &mut buf).unwrap()
    });
    lepton::sleep(Duration::from_millis(5));
    lepton::io::write(wr, b"ok").unwrap();
    assert_eq!(reader.join().unwrap(), 2);
    lepton::io::close(rd).unwrap();
    lepton::io::close(wr).unwrap();
}
