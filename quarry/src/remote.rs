//! Cross-thread deallocation without locks on the hot path.
//!
//! A block freed by the wrong thread is overwritten in place with a
//! [`Remote`] message (the block is at least 16 bytes, exactly a message) and
//! batched in the freeing allocator's [`RemoteCache`]. When the cache is
//! posted, each batch is pushed as one linked range onto the owning
//! allocator's inbound MPSC queue. The owner drains a bounded number of
//! messages before each allocation and either reclaims a block or forwards
//! it another hop if the batch's head hashed onto a different owner.

use std::alloc::Layout;
use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicUsize, Ordering};

use atomic::Atomic;

use crate::sizeclass::class_to_size;
use crate::superslab::Allocslab;
use crate::util::constants::{REMOTE_MASK, REMOTE_SLOTS, REMOTE_SLOT_BITS};
use crate::util::meta::meta_alloc;
use crate::util::Address;

const SIZECLASS_BITS: usize = 8;

/// A freed block reinterpreted as a message node. Fits the minimum block
/// size: one link word plus the target id and class packed into a word.
#[repr(C)]
pub struct Remote {
    next: Atomic<usize>,
    value: usize,
}

impl Remote {
    pub fn set_sizeclass_and_target_id(&mut self, target_id: usize, sizeclass: u8) {
        self.value = (target_id << SIZECLASS_BITS) | sizeclass as usize;
        self.next.store(0, Ordering::Relaxed);
    }

    pub fn target_id(&self) -> usize {
        self.value >> SIZECLASS_BITS
    }

    pub fn sizeclass(&self) -> u8 {
        (self.value & ((1 << SIZECLASS_BITS) - 1)) as u8
    }
}

fn remote(p: Address) -> &'static Remote {
    unsafe { p.as_ref::<Remote>() }
}

/// Stub-terminated MPSC queue of message ranges. Any thread pushes; only the
/// owning allocator pops. The stub node lives in the queue structure itself,
/// and the consumer re-seeds it when the last resident message must be
/// recovered, so a quiescent queue always drains completely.
pub struct RemoteQueue {
    back: Atomic<usize>,
    front: Cell<usize>,
    stub: UnsafeCell<Remote>,
}

// Producers only touch `back` and nodes they still own; `front` and the walk
// from it are owner-only.
unsafe impl Sync for RemoteQueue {}
unsafe impl Send for RemoteQueue {}

impl RemoteQueue {
    fn stub(&self) -> Address {
        Address::from(self.stub.get() as *const Remote)
    }

    /// Seed the queue with the stub. Must run before the queue is shared.
    pub fn init(&self) {
        remote(self.stub()).next.store(0, Ordering::Relaxed);
        self.front.set(self.stub().as_usize());
        self.back.store(self.stub().as_usize(), Ordering::Relaxed);
    }

    pub fn is_empty(&self) -> bool {
        self.front.get() == self.stub().as_usize()
            && remote(self.stub()).next.load(Ordering::Relaxed) == 0
    }

    /// Append the linked range `[first, last]`. Producer side; any thread.
    pub fn push(&self, first: Address, last: Address) {
        remote(last).next.store(0, Ordering::Relaxed);
        let prev = Address::from_usize(self.back.swap(last.as_usize(), Ordering::AcqRel));
        remote(prev).next.store(first.as_usize(), Ordering::Release);
    }

    /// Detach and return the front message. Owner side only. `None` means
    /// empty, or a producer is mid-push; the caller just retries later.
    pub fn pop(&self) -> Option<Address> {
        let stub = self.stub();
        let mut head = Address::from_usize(self.front.get());
        let mut next = Address::from_usize(remote(head).next.load(Ordering::Acquire));
        if head == stub {
            if next.is_zero() {
                return None;
            }
            self.front.set(next.as_usize());
            head = next;
            next = Address::from_usize(remote(head).next.load(Ordering::Acquire));
        }
        if !next.is_zero() {
            self.front.set(next.as_usize());
            return Some(head);
        }
        // `head` is the only resident message. Re-seed the stub behind it so
        // it can be detached.
        let back = Address::from_usize(self.back.load(Ordering::Acquire));
        if head != back {
            return None;
        }
        self.push(stub, stub);
        next = Address::from_usize(remote(head).next.load(Ordering::Acquire));
        if !next.is_zero() {
            self.front.set(next.as_usize());
            return Some(head);
        }
        None
    }
}

/// An allocator's public face: its id and inbound queue. Endpoints live in
/// the metadata arena so they outlive the allocator and never move.
pub struct RemoteAllocator {
    pub(crate) message_queue: RemoteQueue,
    id: usize,
}

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

impl RemoteAllocator {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn alloc_endpoint() -> &'static RemoteAllocator {
        let a = meta_alloc(Layout::new::<RemoteAllocator>());
        // Arena memory is zeroed, which is a valid (unseeded) endpoint.
        let endpoint = unsafe { a.as_mut::<RemoteAllocator>() };
        endpoint.id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        endpoint.message_queue.init();
        endpoint
    }
}

/// One outbound batch: a singly-linked range with its tail remembered so it
/// can be appended and posted in O(1).
#[derive(Clone, Copy)]
struct RemoteList {
    first: Address,
    last: Address,
}

impl RemoteList {
    const EMPTY: Self = Self {
        first: Address::ZERO,
        last: Address::ZERO,
    };

    fn is_empty(&self) -> bool {
        self.first.is_zero()
    }

    fn append(&mut self, p: Address) {
        if self.first.is_zero() {
            self.first = p;
        } else {
            remote(self.last).next.store(p.as_usize(), Ordering::Relaxed);
        }
        self.last = p;
    }

    fn clear(&mut self) {
        *self = Self::EMPTY;
    }
}

/// Outbound batches, sliced by the low bits of the target id.
pub struct RemoteCache {
    size: usize,
    list: [RemoteList; REMOTE_SLOTS],
}

impl RemoteCache {
    pub const fn new() -> Self {
        Self {
            size: 0,
            list: [RemoteList::EMPTY; REMOTE_SLOTS],
        }
    }

    /// Bytes batched since the last post.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Overwrite the freed block with a message and batch it.
    pub fn dealloc(&mut self, target_id: usize, p: Address, sizeclass: u8) {
        self.size += class_to_size(sizeclass);
        let r = unsafe { p.as_mut::<Remote>() };
        r.set_sizeclass_and_target_id(target_id, sizeclass);
        debug_assert_eq!(r.sizeclass(), sizeclass);
        debug_assert_eq!(r.target_id(), target_id);
        self.list[target_id & REMOTE_MASK].append(p);
    }

    /// Flush every batch. Each foreign slot is pushed wholesale to the owner
    /// of the slot's head block; messages that hashed onto our own slot are
    /// redistributed by the next id bits and the loop repeats, radix-sorting
    /// them by target until our slot is empty. We never push to ourselves.
    pub fn post(&mut self, id: usize) {
        self.size = 0;
        let mut shift = 0;
        loop {
            let my_slot = (id >> shift) & REMOTE_MASK;
            for i in 0..REMOTE_SLOTS {
                if i == my_slot {
                    continue;
                }
                let list = self.list[i];
                if list.is_empty() {
                    continue;
                }
                self.list[i].clear();
                let target = Allocslab::allocator_of(list.first);
                debug_assert_ne!(target.id(), id);
                target.message_queue.push(list.first, list.last);
            }

            let resend = self.list[my_slot];
            if resend.is_empty() {
                break;
            }
            self.list[my_slot].clear();
            remote(resend.last).next.store(0, Ordering::Relaxed);

            // Spread the collisions out by the next slice of id bits.
            shift += REMOTE_SLOT_BITS;
            let mut r = resend.first;
            while !r.is_zero() {
                let node = remote(r);
                let next = Address::from_usize(node.next.load(Ordering::Relaxed));
                let slot = (node.target_id() >> shift) & REMOTE_MASK;
                self.list[slot].append(r);
                r = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_block() -> Address {
        meta_alloc(Layout::from_size_align(16, 16).unwrap())
    }

    #[test]
    fn message_packing() {
        let p = message_block();
        let r = unsafe { p.as_mut::<Remote>() };
        r.set_sizeclass_and_target_id(0x1234, 7);
        assert_eq!(r.target_id(), 0x1234);
        assert_eq!(r.sizeclass(), 7);
    }

    #[test]
    fn queue_delivers_ranges_in_order() {
        let q = &RemoteAllocator::alloc_endpoint().message_queue;
        assert!(q.is_empty());
        assert_eq!(q.pop(), None);

        let a = message_block();
        let b = message_block();
        let c = message_block();
        for p in [a, b, c] {
            remote(p).next.store(0, Ordering::Relaxed);
        }
        remote(a).next.store(b.as_usize(), Ordering::Relaxed);
        q.push(a, b);
        q.push(c, c);
        assert!(!q.is_empty());
        assert_eq!(q.pop(), Some(a));
        assert_eq!(q.pop(), Some(b));
        assert_eq!(q.pop(), Some(c));
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn queue_recovers_the_last_message() {
        let q = &RemoteAllocator::alloc_endpoint().message_queue;
        let a = message_block();
        q.push(a, a);
        // A single resident message is still recoverable.
        assert_eq!(q.pop(), Some(a));
        assert_eq!(q.pop(), None);
        let b = message_block();
        q.push(b, b);
        assert_eq!(q.pop(), Some(b));
        assert_eq!(q.pop(), None);
    }
}
