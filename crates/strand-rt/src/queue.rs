// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Intrusive lock-free FIFO used for the ready queue and resource wait queues.
//!
//! Nodes are embedded in the values they link ([`Linked`]); the queue never
//! allocates. While linked, a value is kept alive by one strong count the
//! queue took over in [`Queue::put`] and hands back in [`Queue::get`].
//!
//! `put` is wait-free: one swap on the producer end, one store to link the
//! previous node. `get` only hands out a node once its successor link has
//! been written, so no thread touches a node after it left the queue.
//! A queue-owned stub node stands in for "empty".
//!
//! Ordering is mostly FIFO, not strictly: two racing `put`s are ordered by
//! their swaps rather than by call order, and a producer stalled between its
//! swap and its link hides every later `put` from consumers until it resumes.
//! Callers must not rely on anything stronger.
//!
//! `get` is not wait-free. Consumers are serialized by an atomic claim
//! (producers never wait on it), and a consumer that reaches a half-linked
//! node spins until the stalled producer links it instead of returning
//! early. A consumer can therefore block behind a stalled producer.

use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;

use crossbeam_utils::Backoff;

use crate::cell::{AtomicCell, Word};
use crate::error::invariant_violation;

/// `next` of a node that is in no queue.
const DETACHED: Word<QueueNode> = Word::Int(0);

const UNCLAIMED: Word<()> = Word::Int(0);
const CLAIMED: Word<()> = Word::Int(1);

/// Embeddable link. Detached until put on a queue.
pub struct QueueNode {
    next: AtomicCell<QueueNode>,
}

impl QueueNode {
    pub fn new() -> Self {
        Self {
            next: AtomicCell::new(DETACHED),
        }
    }

    /// Whether the node currently sits in some queue.
    pub fn is_linked(&self) -> bool {
        self.next.load() != DETACHED
    }
}

impl Default for QueueNode {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueueNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueNode")
            .field("linked", &self.is_linked())
            .finish()
    }
}

/// A value that embeds a [`QueueNode`].
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` with the node returned by `node()` as
/// their first field, so that a pointer to the node is a pointer to the
/// value.
pub unsafe trait Linked: Sized {
    fn node(&self) -> &QueueNode;
}

enum Pop<T> {
    Item(Arc<T>),
    Empty,
    /// A producer swapped the tail but has not linked yet.
    Inconsistent,
}

pub struct Queue<T: Linked> {
    /// Consumer end: the oldest node (or the stub).
    head: AtomicCell<QueueNode>,
    /// Producer end: the newest node (or the stub).
    tail: AtomicCell<QueueNode>,
    stub: Box<QueueNode>,
    claim: AtomicCell<()>,
    len: AtomicCell<()>,
    _marker: PhantomData<Arc<T>>,
}

impl<T: Linked> Queue<T> {
    pub fn new() -> Self {
        let stub = Box::new(QueueNode::new());
        stub.next.store(Word::null());
        let stub_ptr: *const QueueNode = &*stub;
        Self {
            head: AtomicCell::new(Word::Ptr(stub_ptr)),
            tail: AtomicCell::new(Word::Ptr(stub_ptr)),
            stub,
            claim: AtomicCell::new(UNCLAIMED),
            len: AtomicCell::int(0),
            _marker: PhantomData,
        }
    }

    /// Append `item`. Its node must be detached.
    pub fn put(&self, item: Arc<T>) {
        let node = item.node();
        if node.next.compare_and_swap(DETACHED, Word::null()) != DETACHED {
            invariant_violation("queue node is already linked");
        }
        let raw = Arc::into_raw(item) as *const QueueNode;
        self.link(raw);
        self.len.fetch_add(1);
    }

    /// Remove and return the oldest node, or `None` when empty. Waits out a
    /// producer caught between its swap and its link.
    pub fn get(&self) -> Option<Arc<T>> {
        let _claim = self.claim();
        let backoff = Backoff::new();
        loop {
            // SAFETY: consumers are serialized by the claim.
            match unsafe { self.pop_claimed() } {
                Pop::Item(item) => {
                    self.len.fetch_add(-1);
                    return Some(item);
                }
                Pop::Empty => return None,
                Pop::Inconsistent => backoff.snooze(),
            }
        }
    }

    /// The oldest node without removing it.
    pub fn peek(&self) -> Option<Arc<T>> {
        let _claim = self.claim();
        let stub = self.stub_ptr();
        let mut head = self.head_ptr();
        if ptr::eq(head, stub) {
            // SAFETY: the stub lives as long as the queue.
            head = unsafe { (*stub).next.load() }.as_ptr()?;
        }
        // SAFETY: `head` is linked and only claimed consumers unlink; the
        // queue's strong count keeps the value alive while we clone it.
        unsafe {
            let value = head as *const T;
            Arc::increment_strong_count(value);
            Some(Arc::from_raw(value))
        }
    }

    /// Racy emptiness check; exact when no producer is mid-`put`.
    pub fn is_empty(&self) -> bool {
        let stub = Word::Ptr(self.stub_ptr());
        self.head.load() == stub && self.tail.load() == stub
    }

    /// Approximate number of linked nodes.
    pub fn len(&self) -> usize {
        self.len.load().as_int().unwrap_or(0).max(0) as usize
    }

    fn stub_ptr(&self) -> *const QueueNode {
        &*self.stub
    }

    fn head_ptr(&self) -> *const QueueNode {
        match self.head.load().as_ptr() {
            Some(p) => p,
            None => invariant_violation("queue head is null"),
        }
    }

    fn link(&self, node: *const QueueNode) {
        let prev = match self.tail.swap(Word::Ptr(node)).as_ptr() {
            Some(p) => p,
            None => invariant_violation("queue tail is null"),
        };
        // SAFETY: `prev` cannot be handed out by `get` until this store
        // makes its successor visible, so it is still alive.
        unsafe { (*prev).next.store(Word::Ptr(node)) };
    }

    unsafe fn pop_claimed(&self) -> Pop<T> {
        let stub = self.stub_ptr();
        let mut head = self.head_ptr();
        let mut next = (*head).next.load();

        if ptr::eq(head, stub) {
            let Some(first) = next.as_ptr() else {
                return if self.tail.load() == Word::Ptr(stub) {
                    Pop::Empty
                } else {
                    Pop::Inconsistent
                };
            };
            self.head.store(Word::Ptr(first));
            head = first;
            next = (*head).next.load();
        }

        if let Some(succ) = next.as_ptr() {
            self.head.store(Word::Ptr(succ));
            return Pop::Item(self.detach(head));
        }

        if self.tail.load() != Word::Ptr(head) {
            return Pop::Inconsistent;
        }

        // `head` is the last node: queue the stub behind it so it can leave.
        (*stub).next.store(Word::null());
        self.link(stub);

        match (*head).next.load().as_ptr() {
            Some(succ) => {
                self.head.store(Word::Ptr(succ));
                Pop::Item(self.detach(head))
            }
            None => Pop::Inconsistent,
        }
    }

    unsafe fn detach(&self, node: *const QueueNode) -> Arc<T> {
        (*node).next.store(DETACHED);
        Arc::from_raw(node as *const T)
    }

    fn claim(&self) -> Claim<'_> {
        let backoff = Backoff::new();
        while self.claim.compare_and_swap(UNCLAIMED, CLAIMED) != UNCLAIMED {
            backoff.snooze();
        }
        Claim { cell: &self.claim }
    }
}

impl<T: Linked> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Linked> Drop for Queue<T> {
    fn drop(&mut self) {
        while self.get().is_some() {}
    }
}

impl<T: Linked> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("len", &self.len()).finish()
    }
}

struct Claim<'a> {
    cell: &'a AtomicCell<()>,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.cell.store(UNCLAIMED);
    }
}
