//! Intrusive queue link.
//!
//! Nodes that travel through the MPSC queues embed one [`QueueLink`] as
//! their **first** field under `#[repr(C)]`, so a `*mut QueueLink` is also a
//! pointer to the node. The queues themselves only ever see links; the
//! owner casts back on dequeue.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// One intrusive link. A node may be in at most one queue at a time; the
/// link is invalidated (nulled) whenever the node is popped.
pub struct QueueLink {
    next: AtomicPtr<QueueLink>,
}

impl QueueLink {
    /// Creates a detached link.
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn next(&self) -> *mut QueueLink {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn set_next(&self, n: *mut QueueLink) {
        self.next.store(n, Ordering::Release);
    }

    /// True while the node is not linked into a queue segment.
    pub fn is_detached(&self) -> bool {
        self.next().is_null()
    }
}

impl Default for QueueLink {
    fn default() -> Self {
        Self::new()
    }
}
