//! Mediumslabs: superslab-sized arenas for a single medium size class.
//!
//! The header (and a one-page reserve that keeps it clear of block space)
//! sits at the region start; blocks are carved from the end backwards, so
//! every block is page aligned and boundaries are recoverable from the region
//! end and the class size. Free blocks are tracked as a stack of indices in
//! the header.

use std::ptr;

use crate::remote::RemoteAllocator;
use crate::sizeclass::class_to_size;
use crate::superslab::{Allocslab, SlabKind};
use crate::util::constants::{OS_PAGE_SIZE, SUPERSLAB_BITS, SUPERSLAB_SIZE};
use crate::util::Address;

/// Leading bytes kept free of blocks; the header lives here.
const HEADER_RESERVE: usize = OS_PAGE_SIZE;

/// The smallest medium class is `SLAB_SIZE`, so a mediumslab never holds more
/// blocks than a superslab holds slabs.
const MAX_BLOCKS: usize = SUPERSLAB_SIZE >> (SUPERSLAB_BITS - 4);

#[repr(C)]
pub struct MediumslabHeader {
    base: Allocslab,
    sizeclass: u8,
    /// Total blocks carved from this region.
    count: u16,
    /// Depth of the free-index stack.
    free: u16,
    stack: [u16; MAX_BLOCKS],
    pub(crate) prev: Option<Mediumslab>,
    pub(crate) next: Option<Mediumslab>,
}

crate::aligned_block!(
    /// Handle to a mediumslab region.
    pub struct Mediumslab, log_bytes = SUPERSLAB_BITS, header = MediumslabHeader
);

impl Mediumslab {
    pub(crate) fn init(self, allocator: &'static RemoteAllocator, sizeclass: u8, rsize: usize) {
        debug_assert_eq!(rsize, class_to_size(sizeclass));
        debug_assert_eq!(rsize % OS_PAGE_SIZE, 0);
        let count = (SUPERSLAB_SIZE - HEADER_RESERVE) / rsize;
        debug_assert!(count >= 1 && count <= MAX_BLOCKS);
        let mut stack = [0u16; MAX_BLOCKS];
        for (i, slot) in stack.iter_mut().enumerate().take(count) {
            // Popping yields block 0 first.
            *slot = (count - 1 - i) as u16;
        }
        let header = self.start().as_mut_ptr::<MediumslabHeader>();
        unsafe {
            ptr::write(
                header,
                MediumslabHeader {
                    base: Allocslab {
                        kind: SlabKind::Medium,
                        allocator,
                    },
                    sizeclass,
                    count: count as u16,
                    free: count as u16,
                    stack,
                    prev: None,
                    next: None,
                },
            );
        }
    }

    pub(crate) fn get_allocator(self) -> &'static RemoteAllocator {
        debug_assert!(matches!(self.base.kind, SlabKind::Medium));
        unsafe { &*self.base.allocator }
    }

    pub fn get_sizeclass(self) -> u8 {
        self.sizeclass
    }

    fn rsize(self) -> usize {
        class_to_size(self.sizeclass)
    }

    /// Address of block 0; the last block ends exactly at the region end.
    fn block_base(self) -> Address {
        self.start() + (SUPERSLAB_SIZE - self.count as usize * self.rsize())
    }

    pub fn full(self) -> bool {
        self.free == 0
    }

    pub fn empty(self) -> bool {
        self.free == self.count
    }

    pub(crate) fn alloc(mut self) -> Address {
        debug_assert!(!self.full());
        self.free -= 1;
        let index = self.stack[self.free as usize] as usize;
        self.block_base() + index * self.rsize()
    }

    /// Mark a block free; reports whether the slab was full beforehand.
    pub(crate) fn dealloc(mut self, p: Address) -> bool {
        let was_full = self.full();
        let offset = p - self.block_base();
        debug_assert_eq!(offset % self.rsize(), 0);
        let index = (offset / self.rsize()) as u16;
        debug_assert!(index < self.count);
        let free = self.free as usize;
        self.stack[free] = index;
        self.free += 1;
        was_full
    }
}

/// Doubly-linked list of mediumslabs of one class with free blocks.
pub(crate) struct MediumslabList {
    head: Option<Mediumslab>,
}

impl MediumslabList {
    pub const fn new() -> Self {
        Self { head: None }
    }

    pub fn head(&self) -> Option<Mediumslab> {
        self.head
    }

    pub fn insert(&mut self, mut slab: Mediumslab) {
        slab.prev = None;
        slab.next = self.head;
        if let Some(mut head) = self.head {
            head.prev = Some(slab);
        }
        self.head = Some(slab);
    }

    pub fn remove(&mut self, mut slab: Mediumslab) {
        match slab.prev {
            Some(mut p) => p.next = slab.next,
            None => {
                debug_assert_eq!(self.head, Some(slab));
                self.head = slab.next;
            }
        }
        if let Some(mut n) = slab.next {
            n.prev = slab.prev;
        }
        slab.prev = None;
        slab.next = None;
    }

    pub fn pop(&mut self) -> Option<Mediumslab> {
        let head = self.head?;
        self.remove(head);
        Some(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MemoryProvider, VirtualProvider};
    use crate::remote::RemoteAllocator;
    use crate::sizeclass::{size_to_class, NUM_SIZECLASSES, NUM_SMALL_CLASSES};
    use crate::util::constants::SLAB_SIZE;

    fn fresh(sizeclass: u8) -> Mediumslab {
        let p = VirtualProvider
            .reserve(SUPERSLAB_SIZE, SUPERSLAB_SIZE)
            .unwrap();
        let slab = Mediumslab::new(p);
        slab.init(
            RemoteAllocator::alloc_endpoint(),
            sizeclass,
            class_to_size(sizeclass),
        );
        slab
    }

    #[test]
    fn smallest_medium_class_carves_fifteen_blocks() {
        let sizeclass = size_to_class(SLAB_SIZE);
        assert_eq!(sizeclass as usize, NUM_SMALL_CLASSES);
        let slab = fresh(sizeclass);
        assert!(slab.empty());
        let mut blocks = vec![];
        while !slab.full() {
            blocks.push(slab.alloc());
        }
        assert_eq!(blocks.len(), 15);
        for p in &blocks {
            assert!(p.is_aligned_to(OS_PAGE_SIZE));
        }
        assert_eq!(*blocks.first().unwrap() + 15 * SLAB_SIZE, slab.end());
    }

    #[test]
    fn largest_medium_class_is_one_block() {
        let sizeclass = (NUM_SIZECLASSES - 1) as u8;
        let slab = fresh(sizeclass);
        let p = slab.alloc();
        assert!(slab.full());
        let was_full = slab.dealloc(p);
        assert!(was_full);
        assert!(slab.empty());
    }

    #[test]
    fn dealloc_makes_blocks_reusable() {
        let sizeclass = size_to_class(SLAB_SIZE);
        let slab = fresh(sizeclass);
        let a = slab.alloc();
        let b = slab.alloc();
        assert_ne!(a, b);
        assert!(!slab.dealloc(a));
        assert_eq!(slab.alloc(), a);
    }
}
