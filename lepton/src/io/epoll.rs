//! The readiness source: a thin epoll wrapper.

use std::os::fd::RawFd;

use crate::debug::{syscall_check, trace_cat};

/// Registration operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Create,
    Modify,
    #[allow(dead_code)]
    Remove,
}

/// Readiness direction. Also indexes the per-FD semaphore pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Input = 0,
    Output = 1,
}

/// Trigger mode for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Variant {
    Level,
    #[allow(dead_code)]
    Edge,
    Oneshot,
}

pub(crate) fn direction_bits(dir: Direction) -> u32 {
    match dir {
        Direction::Input => (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32,
        Direction::Output => libc::EPOLLOUT as u32,
    }
}

fn variant_bits(var: Variant) -> u32 {
    match var {
        Variant::Level => 0,
        Variant::Edge => libc::EPOLLET as u32,
        Variant::Oneshot => libc::EPOLLONESHOT as u32,
    }
}

/// An epoll instance.
pub(crate) struct EpollSource {
    fd: RawFd,
}

impl EpollSource {
    pub(crate) fn new() -> Self {
        // SAFETY: plain syscall.
        let fd = syscall_check!(
            unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) },
            "epoll_create1"
        );
        Self { fd }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// Adds, rearms, or removes an FD registration. Registration errors
    /// are runtime invariant violations and abort.
    pub(crate) fn setup_fd(&self, fd: RawFd, op: Op, dir: Direction, var: Variant) {
        trace_cat!(
            POLLING,
            "epoll {} setup fd {fd} {op:?}/{dir:?}/{var:?}",
            self.fd
        );
        let epop = match op {
            Op::Create => libc::EPOLL_CTL_ADD,
            Op::Modify => libc::EPOLL_CTL_MOD,
            Op::Remove => libc::EPOLL_CTL_DEL,
        };
        let mut ev = libc::epoll_event {
            events: direction_bits(dir) | variant_bits(var),
            u64: fd as u64,
        };
        let evp = if op == Op::Remove {
            std::ptr::null_mut()
        } else {
            &mut ev
        };
        // SAFETY: ev outlives the call.
        syscall_check!(
            unsafe { libc::epoll_ctl(self.fd, epop, fd, evp) },
            "epoll_ctl"
        );
    }

    /// Waits for events. Nonblocking when `blocking` is false. A signal
    /// interruption reports zero events.
    pub(crate) fn poll(&self, events: &mut [libc::epoll_event], blocking: bool) -> usize {
        let timeout = if blocking { -1 } else { 0 };
        // SAFETY: the event buffer is valid for `events.len()` entries.
        let n = unsafe {
            libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as i32, timeout)
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                crate::debug::fatal!("epoll_wait failed: {err}");
            }
            return 0;
        }
        n as usize
    }

    /// Closes the epoll descriptor (fork-child cleanup).
    pub(crate) fn close(&self) {
        // SAFETY: closing our own descriptor.
        unsafe { libc::close(self.fd) };
    }
}
