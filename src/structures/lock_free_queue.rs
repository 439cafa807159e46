//! Unbounded lock-free MPMC FIFO queue with split reference counting.
//!
//! The list protocol is the classic two-anchor singly-linked design: `head`
//! always points at a consumed sentinel node, pending values live in its
//! successors, and `tail` points at the last node or one behind it while a
//! push is in flight. Any thread that observes a half-finished append
//! completes it, so a stalled peer never blocks progress.
//!
//! Reclamation is done with two counter families per node instead of a
//! garbage collector or epochs. Each anchor is a single 64-bit word packing
//! the node address with an external count of threads that read the anchor
//! and are still using the node; claiming a pointer and registering interest
//! in it is therefore one CAS, which closes the load-then-increment race a
//! separate counter would have. When an anchor is swung to a new node, the
//! thread that won the swing folds the replaced word's external count into
//! the node's own state word, which tracks the remaining structural balance
//! together with the number of anchor eras still outstanding. A node is
//! freed by exactly the transition that leaves both at zero.

use core::marker::PhantomData;
use core::ptr;

use crate::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use crate::sync::UnsafeCell;

/// Bit position of the external count inside an anchor word; the low 48 bits
/// hold the node address. Covers canonical userspace addresses on x86-64 and
/// aarch64, and bounds the claims taken against one anchor word, while it
/// points at the same node, at 65535.
const COUNT_SHIFT: u32 = 48;
const ADDR_MASK: u64 = (1 << COUNT_SHIFT) - 1;

/// Anchor eras a node lives through: one while the tail can reference it,
/// one while the head can. Each era ends with a fold of the matching anchor
/// word.
const ANCHOR_ERAS: u32 = 2;

struct Node<T> {
    /// `None` only on a node whose payload has already been handed out (or
    /// on the construction-time sentinel). Written once before the node is
    /// published, read once by the unique winner of the head swing.
    slot: UnsafeCell<Option<T>>,
    /// Successor link. Transitions from null to a node exactly once and is
    /// never rewritten afterwards.
    next: AtomicPtr<Node<T>>,
    /// Packed `(anchor eras remaining, reference balance)`. The balance is
    /// signed: a claim taken from an anchor word may be released here before
    /// the word itself has been folded in.
    state: AtomicU64,
}

/// An unbounded multi-producer, multi-consumer FIFO queue.
///
/// `push` and `pop` never block and never spuriously fail; `pop` returns
/// `None` exactly when no value is pending. Removed nodes are reclaimed with
/// split reference counting, so a thread that stalls while holding a freshly
/// read pointer delays only that node's reuse, never the queue.
///
/// The queue cannot be cloned or copied; share it behind an [`Arc`] instead.
///
/// [`Arc`]: std::sync::Arc
pub struct LockFreeQueue<T> {
    head: AtomicU64,
    tail: AtomicU64,
    #[cfg(all(test, not(loom)))]
    live_nodes: std::sync::atomic::AtomicUsize,
    marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

fn pack<T>(node: *mut Node<T>, count: u16) -> u64 {
    let addr = node as usize as u64;
    debug_assert_eq!(addr & !ADDR_MASK, 0, "node address exceeds 48 bits");
    (u64::from(count) << COUNT_SHIFT) | addr
}

fn ptr_of<T>(word: u64) -> *mut Node<T> {
    (word & ADDR_MASK) as usize as *mut Node<T>
}

fn count_of(word: u64) -> u16 {
    (word >> COUNT_SHIFT) as u16
}

fn state_word(eras: u32, refs: i32) -> u64 {
    (u64::from(eras) << 32) | u64::from(refs as u32)
}

fn state_parts(word: u64) -> (u32, i32) {
    ((word >> 32) as u32, word as u32 as i32)
}

/// Atomically re-reads `anchor` and registers the calling thread's interest
/// in the node it points at. Returns the anchor word that now includes this
/// thread's claim; the node stays alive until the claim is released or the
/// word is folded.
fn claim(anchor: &AtomicU64) -> u64 {
    let mut old = anchor.load(Ordering::Relaxed);
    loop {
        debug_assert!(count_of(old) < u16::MAX, "anchor external count overflow");
        let bumped = old + (1 << COUNT_SHIFT);
        match anchor.compare_exchange_weak(old, bumped, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => return bumped,
            Err(current) => old = current,
        }
    }
}

impl<T> LockFreeQueue<T> {
    /// Creates an empty queue anchored at a fresh sentinel node.
    pub fn new() -> Self {
        let queue = LockFreeQueue {
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            #[cfg(all(test, not(loom)))]
            live_nodes: std::sync::atomic::AtomicUsize::new(0),
            marker: PhantomData,
        };
        let sentinel = queue.alloc_node(None);
        queue.head.store(pack(sentinel, 1), Ordering::Relaxed);
        queue.tail.store(pack(sentinel, 1), Ordering::Relaxed);
        queue
    }

    /// Appends `value` at the tail. Never blocks; retries only while racing
    /// other producers for the same link.
    pub fn push(&self, value: T) {
        let node = self.alloc_node(Some(value));
        loop {
            let old_tail = claim(&self.tail);
            let tail_ptr = ptr_of::<T>(old_tail);
            // SAFETY: the claim keeps the tail node alive for this iteration.
            let next = unsafe { (*tail_ptr).next.load(Ordering::Acquire) };
            if !next.is_null() {
                // Another producer has linked but not yet swung the tail.
                // Finish its swing, then start over.
                self.swing_tail(old_tail, next);
                continue;
            }
            let link = unsafe {
                (*tail_ptr).next.compare_exchange(
                    ptr::null_mut(),
                    node,
                    Ordering::Release,
                    Ordering::Acquire,
                )
            };
            match link {
                Ok(_) => {
                    // The value is durably in the queue; the swing is
                    // best-effort because anyone may complete it for us.
                    self.swing_tail(old_tail, node);
                    return;
                }
                Err(linked) => self.swing_tail(old_tail, linked),
            }
        }
    }

    /// Removes and returns the oldest pending value, or `None` if the queue
    /// is empty. Never blocks.
    pub fn pop(&self) -> Option<T> {
        loop {
            let old_head = claim(&self.head);
            let head_ptr = ptr_of::<T>(old_head);
            let old_tail = claim(&self.tail);
            let tail_ptr = ptr_of::<T>(old_tail);
            // SAFETY: the head claim keeps `head_ptr` alive.
            let next = unsafe { (*head_ptr).next.load(Ordering::Acquire) };
            if head_ptr == tail_ptr {
                if next.is_null() {
                    unsafe {
                        self.release_ref(tail_ptr);
                        self.release_ref(head_ptr);
                    }
                    return None;
                }
                // The tail is one step behind a finished link; help it
                // forward before trying again.
                self.swing_tail(old_tail, next);
                unsafe { self.release_ref(head_ptr) };
                continue;
            }
            // head != tail means the tail already moved past `head_ptr`, so a
            // successor is guaranteed to be linked.
            debug_assert!(!next.is_null(), "interior node lost its successor");
            // The installed word carries one reference for the anchor itself
            // and one for this thread, which still has to move the payload
            // out of `next` after the swing.
            let new_head = pack(next, 2);
            match self
                .head
                .compare_exchange(old_head, new_head, Ordering::Release, Ordering::Relaxed)
            {
                Ok(replaced) => {
                    // SAFETY: winning the swing makes this thread the only
                    // one that will ever touch this payload slot.
                    let value =
                        unsafe { &*next }.slot.with_mut(|slot| unsafe { (*slot).take() });
                    unsafe {
                        self.release_ref(next);
                        self.fold_anchor(replaced);
                        self.release_ref(tail_ptr);
                    }
                    debug_assert!(value.is_some(), "dequeued a node with no payload");
                    return value;
                }
                Err(_) => unsafe {
                    self.release_ref(tail_ptr);
                    self.release_ref(head_ptr);
                },
            }
        }
    }

    /// Returns `true` if no value is currently pending. The answer is a
    /// snapshot; concurrent producers and consumers may change it at once.
    pub fn is_empty(&self) -> bool {
        let old_head = claim(&self.head);
        let head_ptr = ptr_of::<T>(old_head);
        // SAFETY: the claim keeps the head node alive.
        let empty = unsafe { (*head_ptr).next.load(Ordering::Acquire).is_null() };
        unsafe { self.release_ref(head_ptr) };
        empty
    }

    /// Advances `tail` from the node in `old_word` to `new_ptr`, then
    /// retires whatever this thread is left holding: the replaced word if we
    /// won the swing, or just our claim if another thread beat us to it.
    fn swing_tail(&self, mut old_word: u64, new_ptr: *mut Node<T>) {
        let old_ptr = ptr_of::<T>(old_word);
        let new_word = pack(new_ptr, 1);
        loop {
            match self
                .tail
                .compare_exchange_weak(old_word, new_word, Ordering::Release, Ordering::Relaxed)
            {
                Ok(replaced) => {
                    // SAFETY: our CAS unlinked `replaced`; nobody else will
                    // fold it.
                    unsafe { self.fold_anchor(replaced) };
                    return;
                }
                Err(current) => {
                    if ptr_of::<T>(current) == old_ptr {
                        // Only the external count moved; retry against the
                        // refreshed word so the fold sees every claim.
                        old_word = current;
                    } else {
                        // Someone else advanced the tail and owns the fold.
                        unsafe { self.release_ref(old_ptr) };
                        return;
                    }
                }
            }
        }
    }

    /// Drops one reference from a node's balance, freeing the node if that
    /// was the last reference of the last anchor era.
    ///
    /// # Safety
    ///
    /// `node` must be kept alive by a claim or fold obligation owned by the
    /// caller, which this call consumes.
    unsafe fn release_ref(&self, node: *mut Node<T>) {
        let state = unsafe { &(*node).state };
        let mut cur = state.load(Ordering::Relaxed);
        loop {
            let (eras, refs) = state_parts(cur);
            let next = state_word(eras, refs - 1);
            match state.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => {
                    if eras == 0 && refs - 1 == 0 {
                        // SAFETY: the transition to (0, 0) happens exactly
                        // once; every other reference is already gone.
                        unsafe { self.free_node(node) };
                    }
                    return;
                }
                Err(observed) => cur = observed,
            }
        }
    }

    /// Retires a replaced anchor word: merges its external count into the
    /// node's balance and closes one anchor era. The `- 2` covers the
    /// anchor's own reference plus the claim held by the unlinking thread,
    /// both of which end here.
    ///
    /// # Safety
    ///
    /// The caller must have removed `word` from an anchor with a successful
    /// CAS; each anchor word may be folded only once.
    unsafe fn fold_anchor(&self, word: u64) {
        let node = ptr_of::<T>(word);
        let delta = i32::from(count_of(word)) - 2;
        let state = unsafe { &(*node).state };
        let mut cur = state.load(Ordering::Relaxed);
        loop {
            let (eras, refs) = state_parts(cur);
            debug_assert!(eras > 0, "anchor era retired twice");
            let next = state_word(eras - 1, refs + delta);
            match state.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => {
                    if eras - 1 == 0 && refs + delta == 0 {
                        // SAFETY: both counter families reached zero in one
                        // observed transition; the node is unreachable.
                        unsafe { self.free_node(node) };
                    }
                    return;
                }
                Err(observed) => cur = observed,
            }
        }
    }

    fn alloc_node(&self, payload: Option<T>) -> *mut Node<T> {
        #[cfg(all(test, not(loom)))]
        self.live_nodes
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Box::into_raw(Box::new(Node {
            slot: UnsafeCell::new(payload),
            next: AtomicPtr::new(ptr::null_mut()),
            state: AtomicU64::new(state_word(ANCHOR_ERAS, 0)),
        }))
    }

    /// # Safety
    ///
    /// `node` must be unreachable from both anchors with no outstanding
    /// claims, and must not have been freed before.
    unsafe fn free_node(&self, node: *mut Node<T>) {
        #[cfg(all(test, not(loom)))]
        self.live_nodes
            .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        drop(unsafe { Box::from_raw(node) });
    }

    #[cfg(all(test, not(loom)))]
    fn live_node_count(&self) -> usize {
        self.live_nodes.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
        // `&mut self` means no claims remain; the final sentinel is owned
        // exclusively and freed directly.
        let sentinel = ptr_of::<T>(self.head.load(Ordering::Relaxed));
        unsafe { self.free_node(sentinel) };
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_pop_in_order() {
        let queue = LockFreeQueue::new();
        for i in 0..100 {
            queue.push(i);
        }
        for i in 0..100 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn interleaved_push_pop() {
        let queue = LockFreeQueue::new();
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop(), Some(1));
        queue.push(3);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn pop_on_empty_is_harmless() {
        let queue = LockFreeQueue::new();
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.pop(), None);
        queue.push(42);
        assert_eq!(queue.pop(), Some(42));
        assert_eq!(queue.pop(), None);
        queue.push(7);
        assert_eq!(queue.pop(), Some(7));
    }

    #[test]
    fn is_empty_tracks_contents() {
        let queue = LockFreeQueue::new();
        assert!(queue.is_empty());
        queue.push(1);
        assert!(!queue.is_empty());
        queue.pop();
        assert!(queue.is_empty());
    }

    #[test]
    fn two_producers_one_consumer() {
        let queue = Arc::new(LockFreeQueue::new());
        let a = thread::spawn({
            let queue = Arc::clone(&queue);
            move || {
                for i in 0..1000 {
                    queue.push(i);
                }
            }
        });
        let b = thread::spawn({
            let queue = Arc::clone(&queue);
            move || {
                for i in 1000..2000 {
                    queue.push(i);
                }
            }
        });
        let consumer = thread::spawn({
            let queue = Arc::clone(&queue);
            move || {
                let mut drained = Vec::with_capacity(2000);
                while drained.len() < 2000 {
                    match queue.pop() {
                        Some(v) => drained.push(v),
                        None => thread::yield_now(),
                    }
                }
                drained
            }
        });
        a.join().unwrap();
        b.join().unwrap();
        let drained = consumer.join().unwrap();

        let unique: HashSet<i32> = drained.iter().copied().collect();
        assert_eq!(unique.len(), 2000);
        assert_eq!(unique, (0..2000).collect::<HashSet<i32>>());
        // Each producer's values must come out in the order it pushed them.
        let from_a: Vec<i32> = drained.iter().copied().filter(|v| *v < 1000).collect();
        let from_b: Vec<i32> = drained.iter().copied().filter(|v| *v >= 1000).collect();
        assert!(from_a.windows(2).all(|w| w[0] < w[1]));
        assert!(from_b.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn mpmc_no_loss_no_duplication() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 500;
        const TOTAL: usize = PRODUCERS * PER_PRODUCER;

        let queue = Arc::new(LockFreeQueue::new());
        let popped = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.push(p * PER_PRODUCER + i);
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let popped = Arc::clone(&popped);
                thread::spawn(move || {
                    let mut local = Vec::new();
                    loop {
                        if let Some(v) = queue.pop() {
                            local.push(v);
                            popped.fetch_add(1, Ordering::Relaxed);
                        } else if popped.load(Ordering::Relaxed) == TOTAL {
                            return local;
                        } else {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.join().unwrap());
        }
        assert_eq!(all.len(), TOTAL);
        let unique: HashSet<usize> = all.iter().copied().collect();
        assert_eq!(unique, (0..TOTAL).collect::<HashSet<usize>>());
    }

    #[test]
    fn node_accounting_single_thread() {
        let queue = LockFreeQueue::new();
        assert_eq!(queue.live_node_count(), 1);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.live_node_count(), 4);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.live_node_count(), 3);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.live_node_count(), 1);
    }

    #[test]
    fn node_accounting_after_stress() {
        const TOTAL: usize = 2000;
        let queue = Arc::new(LockFreeQueue::new());
        let popped = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for half in 0..2 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..TOTAL / 2 {
                    queue.push(half * (TOTAL / 2) + i);
                }
            }));
        }
        for _ in 0..2 {
            let queue = Arc::clone(&queue);
            let popped = Arc::clone(&popped);
            handles.push(thread::spawn(move || loop {
                if queue.pop().is_some() {
                    popped.fetch_add(1, Ordering::Relaxed);
                } else if popped.load(Ordering::Relaxed) == TOTAL {
                    return;
                } else {
                    thread::yield_now();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // Everything drained: only the sentinel may remain allocated.
        assert_eq!(popped.load(Ordering::Relaxed), TOTAL);
        assert_eq!(queue.live_node_count(), 1);
    }

    #[test]
    fn drop_releases_pending_values() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let queue = LockFreeQueue::new();
        for _ in 0..10 {
            queue.push(Counted(Arc::clone(&drops)));
        }
        for _ in 0..3 {
            assert!(queue.pop().is_some());
        }
        assert_eq!(drops.load(Ordering::Relaxed), 3);
        drop(queue);
        assert_eq!(drops.load(Ordering::Relaxed), 10);
    }
}
