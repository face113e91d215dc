//! Category-gated runtime tracing and fatal-error handling.
//!
//! Tracing is off unless a category is enabled through
//! [`install_mask`] (normally from the `FibreDebugString` environment
//! option). Enabled categories forward to the `log` facade so any logger
//! (e.g. `env_logger` in tests) can capture them.

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Closed set of debug categories.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugCategory: u32 {
        /// Bootstrap and miscellaneous events.
        const BASIC      = 1 << 0;
        /// Blocking-primitive operations.
        const BLOCKING   = 1 << 1;
        /// Poller registration and event batches.
        const POLLING    = 1 << 2;
        /// Context switches, queueing, stealing.
        const SCHEDULING = 1 << 3;
        /// Worker thread lifecycle.
        const THREADS    = 1 << 4;
        /// Suspicious but non-fatal conditions.
        const WARNING    = 1 << 5;
    }
}

static MASK: AtomicU32 = AtomicU32::new(0);

/// True if the category is enabled.
#[inline]
pub(crate) fn enabled(cat: DebugCategory) -> bool {
    MASK.load(Ordering::Relaxed) & cat.bits() != 0
}

/// Parses a comma-separated category list (`FibreDebugString` format) and
/// installs it as the active mask. Unknown names are ignored with a log
/// warning.
pub(crate) fn install_mask(list: &str) {
    let mut mask = DebugCategory::empty();
    for name in list.split(',').filter(|s| !s.is_empty()) {
        match name {
            "basic" => mask |= DebugCategory::BASIC,
            "blocking" => mask |= DebugCategory::BLOCKING,
            "polling" => mask |= DebugCategory::POLLING,
            "scheduling" => mask |= DebugCategory::SCHEDULING,
            "threads" => mask |= DebugCategory::THREADS,
            "warning" => mask |= DebugCategory::WARNING,
            other => log::warn!("unknown debug category {other:?}"),
        }
    }
    MASK.store(mask.bits(), Ordering::Relaxed);
}

/// Category-gated trace line. Compiles to a mask test plus a `log::debug!`
/// when the category is on.
macro_rules! trace_cat {
    ($cat:ident, $($arg:tt)*) => {
        if $crate::debug::enabled($crate::debug::DebugCategory::$cat) {
            log::debug!($($arg)*);
        }
    };
}

/// Unrecoverable runtime failure: print a diagnostic plus a backtrace and
/// abort the process. Used for invariant violations and resource
/// exhaustion; never for application-visible errors.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        eprintln!("lepton: fatal: {}", format_args!($($arg)*));
        eprintln!("{}", std::backtrace::Backtrace::force_capture());
        std::process::abort()
    }};
}

/// Checks the return value of a libc call that the runtime requires to
/// succeed; aborts with errno context otherwise. Evaluates to the value.
macro_rules! syscall_check {
    ($call:expr, $what:expr) => {
        ({
            let ret = $call;
            if ret < 0 {
                $crate::debug::fatal!(
                    "{} failed: {}",
                    $what,
                    std::io::Error::last_os_error()
                );
            }
            ret
        })
    };
}

pub(crate) use {fatal, syscall_check, trace_cat};

#[cfg(test)]
mod tests {
    use super::*;

    // Single test: the mask is process-global state.
    #[test]
    fn mask_round_trip() {
        install_mask("polling,scheduling");
        assert!(enabled(DebugCategory::POLLING));
        assert!(enabled(DebugCategory::SCHEDULING));
        assert!(!enabled(DebugCategory::BLOCKING));

        install_mask("bogus,threads");
        assert!(enabled(DebugCategory::THREADS));
        assert!(!enabled(DebugCategory::POLLING));

        install_mask("");
        assert!(!enabled(DebugCategory::THREADS));
    }
}
