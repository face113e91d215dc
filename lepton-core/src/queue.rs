//! Intrusive lock-free MPSC queues.
//!
//! Two multi-producer single-consumer queues over [`QueueLink`] nodes, used
//! as the lock-free backing of the per-worker ready queues:
//!
//! - [`StubQueue`]: stub-node queue (Vyukov's intrusive MPSC). The consumer
//!   operates in chunks and re-appends the stub after draining the front
//!   chunk.
//! - [`NemesisQueue`]: an MCS-tail queue extended with a head pointer
//!   (Nemesis). `pop` may spin briefly when a producer has swung the tail
//!   but not yet linked its node.
//!
//! Producers are fully concurrent. Consumers must be serialized externally
//! (the ready queue holds a consumer-side lock; stealers use `try_lock`).
//!
//! # Safety
//!
//! Nodes are raw intrusive links: callers guarantee each node is valid for
//! the duration of its queue membership and is in at most one queue at a
//! time. A node's link is null whenever it is not enqueued.

use core::ptr;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::hint::spin_loop;

use crate::link::QueueLink;

/// Stub-based intrusive MPSC queue.
///
/// The stub node is boxed so the queue value itself can move without
/// invalidating the head/tail pointers into it.
pub struct StubQueue {
    stub: Box<QueueLink>,
    head: AtomicPtr<QueueLink>, // consumer side only
    tail: AtomicPtr<QueueLink>,
}

// SAFETY: all interior state is atomic; node ownership rules are the
// caller's contract (see module docs).
unsafe impl Send for StubQueue {}
unsafe impl Sync for StubQueue {}

impl StubQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let stub = Box::new(QueueLink::new());
        let stub_ptr = &*stub as *const QueueLink as *mut QueueLink;
        Self {
            stub,
            head: AtomicPtr::new(stub_ptr),
            tail: AtomicPtr::new(stub_ptr),
        }
    }

    fn stub_ptr(&self) -> *mut QueueLink {
        &*self.stub as *const QueueLink as *mut QueueLink
    }

    /// True if no node is enqueued. Racy by nature; exact only while
    /// producers and the consumer are quiescent.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.stub_ptr()
            && self.tail.load(Ordering::Acquire) == self.stub_ptr()
    }

    /// Appends a node. Lock-free, callable from any thread.
    ///
    /// # Safety
    /// `node` must be valid until popped and not currently in any queue.
    pub unsafe fn push(&self, node: NonNull<QueueLink>) {
        let node_ptr = node.as_ptr();
        // SAFETY: caller guarantees node validity.
        let link = unsafe { node.as_ref() };
        debug_assert!(link.is_detached());
        let prev = self.tail.swap(node_ptr, Ordering::SeqCst);
        // SAFETY: prev is either the stub or a node still owned by the
        // queue; linking it publishes the new tail segment.
        unsafe { (*prev).set_next(node_ptr) };
    }

    /// Removes the oldest node. Single consumer (externally serialized).
    ///
    /// # Safety
    /// The caller must be the only active consumer.
    pub unsafe fn pop(&self) -> Option<NonNull<QueueLink>> {
        let stub = self.stub_ptr();
        let mut head = self.head.load(Ordering::Acquire);

        if head == stub {
            // Front chunk is drained. If the tail also sits on the stub the
            // queue is empty; otherwise unhook the stub and re-append it
            // behind the pending nodes.
            if self.tail.load(Ordering::Acquire) == stub {
                return None;
            }
            let mut next = self.stub.next();
            while next.is_null() {
                spin_loop(); // producer between tail swing and link
                next = self.stub.next();
            }
            self.head.store(next, Ordering::Release);
            self.stub.set_next(ptr::null_mut());
            // SAFETY: the stub is detached again and owned by this queue.
            unsafe { self.push(NonNull::new_unchecked(stub)) };
            head = next;
        }

        // After the stub re-append the chain always terminates at the stub,
        // so head's successor exists once its producer finishes linking.
        // SAFETY: head is a queued node owned by this queue.
        let mut next = unsafe { (*head).next() };
        while next.is_null() {
            spin_loop();
            next = unsafe { (*head).next() };
        }
        self.head.store(next, Ordering::Release);
        // SAFETY: head is being handed back to the caller; detach its link.
        unsafe { (*head).set_next(ptr::null_mut()) };
        NonNull::new(head)
    }
}

impl Default for StubQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Nemesis intrusive MPSC queue (MCS tail + head pointer).
pub struct NemesisQueue {
    head: AtomicPtr<QueueLink>, // consumer side only
    tail: AtomicPtr<QueueLink>,
}

// SAFETY: see StubQueue.
unsafe impl Send for NemesisQueue {}
unsafe impl Sync for NemesisQueue {}

impl NemesisQueue {
    /// Creates an empty queue.
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// True if no node is enqueued (racy; see [`StubQueue::is_empty`]).
    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Acquire).is_null()
    }

    /// Appends a node; returns `true` if the queue was empty.
    ///
    /// # Safety
    /// `node` must be valid until popped and not currently in any queue.
    pub unsafe fn push(&self, node: NonNull<QueueLink>) -> bool {
        let node_ptr = node.as_ptr();
        // SAFETY: caller guarantees node validity.
        debug_assert!(unsafe { node.as_ref() }.is_detached());
        let prev = self.tail.swap(node_ptr, Ordering::SeqCst);
        if prev.is_null() {
            self.head.store(node_ptr, Ordering::Release);
            return true;
        }
        // SAFETY: prev is still owned by the queue until popped.
        unsafe { (*prev).set_next(node_ptr) };
        false
    }

    // MCS-style tail retirement for the last element.
    unsafe fn pop_last(&self, elem: *mut QueueLink) -> *mut QueueLink {
        if self
            .tail
            .compare_exchange(elem, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return ptr::null_mut();
        }
        // A producer swung the tail past `elem`; wait for its link.
        // SAFETY: elem is owned by this consumer until returned.
        let mut next = unsafe { (*elem).next() };
        while next.is_null() {
            spin_loop();
            next = unsafe { (*elem).next() };
        }
        unsafe { (*elem).set_next(ptr::null_mut()) };
        next
    }

    /// Removes the oldest node. Single consumer (externally serialized).
    ///
    /// # Safety
    /// The caller must be the only active consumer.
    pub unsafe fn pop(&self) -> Option<NonNull<QueueLink>> {
        let elem = self.head.load(Ordering::Acquire);
        if elem.is_null() {
            return None;
        }
        // SAFETY: elem is the queue's front node, owned by the queue.
        let next = unsafe { (*elem).next() };
        self.head.store(next, Ordering::Release);
        if !next.is_null() {
            // SAFETY: detaching the popped node's link.
            unsafe { (*elem).set_next(ptr::null_mut()) };
        } else {
            // Possibly the last element: retire it against the tail, which
            // may hand back a successor linked in the meantime.
            // SAFETY: elem ownership as above.
            let successor = unsafe { self.pop_last(elem) };
            if !successor.is_null() {
                self.head.store(successor, Ordering::Release);
            }
        }
        NonNull::new(elem)
    }
}

impl Default for NemesisQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    // Test node with the first-member link contract.
    #[repr(C)]
    struct Node {
        link: QueueLink,
        value: usize,
    }

    impl Node {
        fn new(value: usize) -> Box<Self> {
            Box::new(Self {
                link: QueueLink::new(),
                value,
            })
        }

        fn link_of(b: &Box<Self>) -> NonNull<QueueLink> {
            NonNull::from(&b.link)
        }

        unsafe fn from_link(l: NonNull<QueueLink>) -> *mut Node {
            l.as_ptr().cast()
        }
    }

    fn check_fifo_order<Q, P, O>(push: P, pop: O)
    where
        P: Fn(&Q, NonNull<QueueLink>),
        O: Fn(&Q) -> Option<NonNull<QueueLink>>,
        Q: Default,
    {
        let q = Q::default();
        let nodes: Vec<_> = (0..10).map(Node::new).collect();
        for n in &nodes {
            push(&q, Node::link_of(n));
        }
        for expect in 0..10 {
            let l = pop(&q).expect("queue drained early");
            let n = unsafe { &*Node::from_link(l) };
            assert_eq!(n.value, expect);
        }
        assert!(pop(&q).is_none());
    }

    #[test]
    fn stub_fifo_order() {
        check_fifo_order::<StubQueue, _, _>(
            |q, n| unsafe { q.push(n) },
            |q| unsafe { q.pop() },
        );
    }

    #[test]
    fn nemesis_fifo_order() {
        check_fifo_order::<NemesisQueue, _, _>(
            |q, n| unsafe {
                q.push(n);
            },
            |q| unsafe { q.pop() },
        );
    }

    #[test]
    fn stub_empty_refill_cycles() {
        let q = StubQueue::new();
        assert!(unsafe { q.pop() }.is_none());
        for round in 0..5 {
            let a = Node::new(round * 2);
            let b = Node::new(round * 2 + 1);
            unsafe {
                q.push(Node::link_of(&a));
                q.push(Node::link_of(&b));
            }
            let first = unsafe { q.pop() }.unwrap();
            let second = unsafe { q.pop() }.unwrap();
            assert_eq!(unsafe { (*Node::from_link(first)).value }, round * 2);
            assert_eq!(unsafe { (*Node::from_link(second)).value }, round * 2 + 1);
            assert!(unsafe { q.pop() }.is_none());
        }
    }

    #[test]
    fn nemesis_push_reports_empty() {
        let q = NemesisQueue::new();
        let a = Node::new(1);
        let b = Node::new(2);
        assert!(unsafe { q.push(Node::link_of(&a)) });
        assert!(!unsafe { q.push(Node::link_of(&b)) });
        unsafe {
            q.pop().unwrap();
            q.pop().unwrap();
        }
        let c = Node::new(3);
        assert!(unsafe { q.push(Node::link_of(&c)) });
        unsafe { q.pop().unwrap() };
    }

    // Multi-producer stress: no node lost, none duplicated. The consumer
    // runs on the main thread (single-consumer contract).
    fn mpsc_stress<Q: Send + Sync + 'static>(
        q: Arc<Q>,
        push: fn(&Q, NonNull<QueueLink>),
        pop: fn(&Q) -> Option<NonNull<QueueLink>>,
    ) {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1000;

        let mut all_nodes = Vec::new();
        for p in 0..PRODUCERS {
            let nodes: Vec<_> = (0..PER_PRODUCER)
                .map(|i| Node::new(p * PER_PRODUCER + i))
                .collect();
            all_nodes.push(nodes);
        }

        // Hand raw link pointers to producer threads; the boxes stay alive
        // in all_nodes for the whole test.
        let handles: Vec<_> = all_nodes
            .iter()
            .map(|nodes| {
                let links: Vec<usize> = nodes
                    .iter()
                    .map(|n| Node::link_of(n).as_ptr() as usize)
                    .collect();
                let q = q.clone();
                thread::spawn(move || {
                    for l in links {
                        push(&q, NonNull::new(l as *mut QueueLink).unwrap());
                    }
                })
            })
            .collect();

        let mut seen = HashSet::new();
        while seen.len() < PRODUCERS * PER_PRODUCER {
            if let Some(l) = pop(&q) {
                let v = unsafe { (*Node::from_link(l)).value };
                assert!(seen.insert(v), "duplicate value {v}");
            } else {
                spin_loop();
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(pop(&q).is_none());
    }

    #[test]
    fn stub_mpsc_stress() {
        mpsc_stress(
            Arc::new(StubQueue::new()),
            |q, n| unsafe { q.push(n) },
            |q| unsafe { q.pop() },
        );
    }

    #[test]
    fn nemesis_mpsc_stress() {
        mpsc_stress(
            Arc::new(NemesisQueue::new()),
            |q, n| unsafe {
                q.push(n);
            },
            |q| unsafe { q.pop() },
        );
    }
}
