//! Blocking I/O wrappers.
//!
//! Each wrapper behaves like the underlying syscall except that blocking
//! parks only the calling task, never the worker thread. File descriptors
//! created with an explicit non-blocking flag bypass the machinery and
//! behave as raw OS calls. The free functions here forward to the calling
//! worker's [`EventScope`](crate::EventScope).

pub(crate) mod epoll;
pub(crate) mod poller;

use std::io;
use std::os::fd::RawFd;

use crate::task;

/// `socket(2)`. See [`EventScope::socket`](crate::EventScope::socket).
pub fn socket(domain: i32, ty: i32, protocol: i32) -> io::Result<RawFd> {
    task::current_scope().socket(domain, ty, protocol)
}

/// `pipe2(2)`.
pub fn pipe(flags: i32) -> io::Result<(RawFd, RawFd)> {
    task::current_scope().pipe(flags)
}

/// `close(2)`.
pub fn close(fd: RawFd) -> io::Result<()> {
    task::current_scope().close(fd)
}

/// `dup(2)`.
pub fn dup(fd: RawFd) -> io::Result<RawFd> {
    task::current_scope().dup(fd)
}

/// `fcntl(F_SETFL)`.
pub fn set_flags(fd: RawFd, flags: i32) -> io::Result<()> {
    task::current_scope().set_flags(fd, flags)
}

/// `listen(2)`.
pub fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    task::current_scope().listen(fd, backlog)
}

/// `accept4(2)`.
///
/// # Safety
/// `addr`/`addrlen` must be valid or null, as for the raw syscall.
pub unsafe fn accept4(
    fd: RawFd,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
    flags: i32,
) -> io::Result<RawFd> {
    // SAFETY: forwarded caller contract.
    unsafe { task::current_scope().accept4(fd, addr, addrlen, flags) }
}

/// `accept(2)` discarding the peer address.
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    // SAFETY: null address out-parameters are allowed.
    unsafe { task::current_scope().accept4(fd, std::ptr::null_mut(), std::ptr::null_mut(), 0) }
}

/// `connect(2)`.
///
/// # Safety
/// `addr` must point to a valid address of length `addrlen`.
pub unsafe fn connect(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> io::Result<()> {
    // SAFETY: forwarded caller contract.
    unsafe { task::current_scope().connect(fd, addr, addrlen) }
}

/// `bind(2)`.
///
/// # Safety
/// `addr` must point to a valid address of length `addrlen`.
pub unsafe fn bind(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> io::Result<()> {
    // SAFETY: forwarded caller contract.
    unsafe { task::current_scope().bind(fd, addr, addrlen) }
}

/// `read(2)`.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    task::current_scope().read(fd, buf)
}

/// `pread(2)`.
pub fn pread(fd: RawFd, buf: &mut [u8], offset: i64) -> io::Result<usize> {
    task::current_scope().pread(fd, buf, offset)
}

/// `readv(2)`.
pub fn readv(fd: RawFd, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
    task::current_scope().readv(fd, bufs)
}

/// `preadv(2)`.
pub fn preadv(fd: RawFd, bufs: &mut [io::IoSliceMut<'_>], offset: i64) -> io::Result<usize> {
    task::current_scope().preadv(fd, bufs, offset)
}

/// `write(2)`.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    task::current_scope().write(fd, buf)
}

/// `pwrite(2)`.
pub fn pwrite(fd: RawFd, buf: &[u8], offset: i64) -> io::Result<usize> {
    task::current_scope().pwrite(fd, buf, offset)
}

/// `writev(2)`.
pub fn writev(fd: RawFd, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
    task::current_scope().writev(fd, bufs)
}

/// `pwritev(2)`.
pub fn pwritev(fd: RawFd, bufs: &[io::IoSlice<'_>], offset: i64) -> io::Result<usize> {
    task::current_scope().pwritev(fd, bufs, offset)
}

/// `recv(2)`.
pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<usize> {
    task::current_scope().recv(fd, buf, flags)
}

/// `recvfrom(2)`.
pub fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: i32,
) -> io::Result<(usize, libc::sockaddr_storage, libc::socklen_t)> {
    task::current_scope().recvfrom(fd, buf, flags)
}

/// `recvmsg(2)`.
///
/// # Safety
/// `msg` must be a fully valid message header for the duration.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: i32) -> io::Result<usize> {
    // SAFETY: forwarded caller contract.
    unsafe { task::current_scope().recvmsg(fd, msg, flags) }
}

/// `send(2)`.
pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> io::Result<usize> {
    task::current_scope().send(fd, buf, flags)
}

/// `sendto(2)`.
///
/// # Safety
/// `addr` must point to a valid address of length `addrlen`.
pub unsafe fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: i32,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> io::Result<usize> {
    // SAFETY: forwarded caller contract.
    unsafe { task::current_scope().sendto(fd, buf, flags, addr, addrlen) }
}

/// `sendmsg(2)`.
///
/// # Safety
/// `msg` must be a fully valid message header for the duration.
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: i32) -> io::Result<usize> {
    // SAFETY: forwarded caller contract.
    unsafe { task::current_scope().sendmsg(fd, msg, flags) }
}

/// `sendfile(2)`.
pub fn sendfile(
    out_fd: RawFd,
    in_fd: RawFd,
    offset: Option<&mut i64>,
    count: usize,
) -> io::Result<usize> {
    task::current_scope().sendfile(out_fd, in_fd, offset, count)
}

/// Task-blocking `epoll_wait(2)`.
pub fn epoll_wait(
    epfd: RawFd,
    events: &mut [libc::epoll_event],
    timeout_ms: i32,
) -> io::Result<usize> {
    task::current_scope().epoll_wait(epfd, events, timeout_ms)
}

/// Runs a non-pollable operation on the scope's disk cluster.
pub fn direct_io<T>(f: impl FnOnce() -> T) -> T {
    task::current_scope().direct_io(f)
}
