//! Task stacks.
//!
//! Stacks are anonymous private mappings with an optional `PROT_NONE`
//! guard region at the low end. Main tasks and the idle loops of
//! registered workers run on the OS thread's own stack and have no
//! [`StackSpan`]. Allocation failure is fatal: the runtime cannot make
//! progress without stacks.

use std::ptr;
use std::sync::OnceLock;

use crate::debug::fatal;

/// Default usable stack size.
pub const DEFAULT_STACK_SIZE: usize = 65536;
/// Default guard region size.
pub const DEFAULT_GUARD_SIZE: usize = 4096;

/// Process page size, cached at first use.
pub(crate) fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        // SAFETY: sysconf is always callable.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz <= 0 {
            fatal!("sysconf(_SC_PAGESIZE) failed");
        }
        sz as usize
    })
}

fn round_up_to_page(n: usize) -> usize {
    let p = page_size();
    n.div_ceil(p) * p
}

/// An owned, mapped stack region (guard included).
pub(crate) struct StackSpan {
    base: *mut u8,
    total: usize,
}

// SAFETY: the span is a plain memory region; the owning Task serializes
// all access.
unsafe impl Send for StackSpan {}
unsafe impl Sync for StackSpan {}

impl StackSpan {
    /// Maps a stack of `size` usable bytes plus `guard` protected bytes at
    /// the low end. Sizes are rounded up to page multiples. Returns the
    /// span and the initial (aligned) top-of-stack address.
    pub(crate) fn alloc(size: usize, guard: usize) -> (StackSpan, usize) {
        let size = round_up_to_page(size.max(page_size()));
        let guard = round_up_to_page(guard);
        let total = size + guard;

        // SAFETY: fresh anonymous mapping, no existing memory affected.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            fatal!(
                "stack allocation of {total} bytes failed: {}",
                std::io::Error::last_os_error()
            );
        }
        if guard > 0 {
            // SAFETY: protecting the low end of the mapping just created.
            if unsafe { libc::mprotect(ptr, guard, libc::PROT_NONE) } != 0 {
                fatal!(
                    "stack guard mprotect failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }

        let base = ptr as *mut u8;
        let top = (base as usize + total) & !(crate::arch::STACK_ALIGNMENT - 1);
        (StackSpan { base, total }, top)
    }
}

impl Drop for StackSpan {
    fn drop(&mut self) {
        // SAFETY: unmapping the region mapped in alloc(); the owning task
        // has switched off this stack for good.
        if unsafe { libc::munmap(self.base as *mut libc::c_void, self.total) } != 0 {
            fatal!("munmap failed: {}", std::io::Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_returns_aligned_top() {
        let (span, top) = StackSpan::alloc(DEFAULT_STACK_SIZE, DEFAULT_GUARD_SIZE);
        assert_eq!(top % crate::arch::STACK_ALIGNMENT, 0);
        assert!(top > span.base as usize);
        drop(span);
    }

    #[test]
    fn sizes_rounded_to_pages() {
        let (span, _top) = StackSpan::alloc(1000, 100);
        assert_eq!(span.total % page_size(), 0);
        assert!(span.total >= 2 * page_size().min(4096));
    }

    #[test]
    fn stack_is_writable_below_top() {
        let (span, top) = StackSpan::alloc(DEFAULT_STACK_SIZE, DEFAULT_GUARD_SIZE);
        // SAFETY: inside the RW part of the fresh mapping.
        unsafe {
            let p = (top - 8) as *mut u64;
            p.write(0xdead_beef);
            assert_eq!(p.read(), 0xdead_beef);
        }
        drop(span);
    }
}
