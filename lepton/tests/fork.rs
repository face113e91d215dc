//! S6: fork from a quiescent single-worker scope, plus scope cloning.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lepton::{ForkResult, RuntimeConfig};

#[test]
fn fork_and_clone_suite() {
    let _ = env_logger::builder().is_test(true).try_init();
    let scope = RuntimeConfig::new(1, 1).bootstrap();

    fork_child_gets_working_runtime();
    cloned_scope_runs_main(scope);
}

// The child must come back with a functional runtime: task spawn/join,
// timer sleeps, and pipe I/O all working on the rebuilt pollers.
fn fork_child_gets_working_runtime() {
    match lepton::fork().unwrap() {
        ForkResult::Parent(pid) => {
            let mut status = 0;
            // SAFETY: waiting on our own child.
            let r = unsafe { libc::waitpid(pid, &mut status, 0) };
            assert_eq!(r, pid);
            assert!(libc::WIFEXITED(status), "child did not exit cleanly");
            assert_eq!(libc::WEXITSTATUS(status), 0, "child checks failed");
        }
        ForkResult::Child => {
            // Any panic here must not unwind back into the test harness.
            let code = child_checks();
            // SAFETY: terminating the child process.
            unsafe { libc::_exit(code) };
        }
    }
}

fn child_checks() -> i32 {
    let ok = std::panic::catch_unwind(|| {
        let h = lepton::spawn(|| 6 * 7);
        if h.join().unwrap() != 42 {
            return false;
        }

        // Timer path exercises the rebuilt master poller.
        lepton::sleep(Duration::from_millis(5));

        // Pipe I/O exercises the rebuilt cluster pollers.
        let (rd, wr) = lepton::io::pipe(0).unwrap();
        let reader = lepton::spawn(move || {
            let mut buf = [0u8; 1];
            lepton::io::read(rd, &mut buf).unwrap();
            buf[0]
        });
        lepton::sleep(Duration::from_millis(5));
        lepton::io::write(wr, &[7]).unwrap();
        let byte = reader.join().unwrap();
        lepton::io::close(rd).unwrap();
        lepton::io::close(wr).unwrap();
        byte == 7
    });
    match ok {
        Ok(true) => 0,
        _ => 1,
    }
}

// A cloned scope gets its own worker and runs its main task to completion.
fn cloned_scope_runs_main(scope: &'static lepton::EventScope) {
    let ran = Arc::new(AtomicBool::new(false));
    let ran2 = ran.clone();
    let child = scope.clone_scope(
        move || {
            // Prove the runtime inside the cloned scope works.
            let h = lepton::spawn(|| 1 + 1);
            assert_eq!(h.join().unwrap(), 2);
            ran2.store(true, Ordering::SeqCst);
        },
        1,
    );
    child.join_main();
    assert!(ran.load(Ordering::SeqCst));
}
