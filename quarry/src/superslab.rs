//! Superslabs and the slabs carved out of them.
//!
//! A superslab is a `SUPERSLAB_SIZE`-aligned region split into 16 equal
//! slabs. Slab 0 is the "short" slab: it loses its leading bytes to the
//! superslab header and is only handed out once every other slab is taken.
//! Each slab serves one small size class through an intrusive free-list plus
//! a bump cursor over never-used blocks. Blocks are carved from the slab end
//! backwards so a block boundary can be recovered from the slab end and the
//! class size alone.

use std::ptr;

use crate::remote::RemoteAllocator;
use crate::sizeclass::class_to_size;
use crate::util::constants::{SLAB_BITS, SLAB_COUNT, SLAB_SIZE, SUPERSLAB_BITS};
use crate::util::Address;

/// Discriminates what occupies an owned superslab-aligned region.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabKind {
    Fresh = 0,
    Large = 1,
    Medium = 2,
    Super = 3,
}

/// Header prefix common to superslabs and mediumslabs. The deallocation path
/// reads the owner through this before it knows which of the two it has.
#[repr(C)]
pub struct Allocslab {
    pub(crate) kind: SlabKind,
    pub(crate) allocator: *const RemoteAllocator,
}

impl Allocslab {
    /// Owner endpoint of the superslab or mediumslab covering `p`.
    pub(crate) fn allocator_of(p: Address) -> &'static RemoteAllocator {
        let header = p.align_down(1 << SUPERSLAB_BITS);
        unsafe { &*(*header.as_ptr::<Allocslab>()).allocator }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperslabStatus {
    Full,
    Available,
    OnlyShortSlabAvailable,
    Empty,
}

/// Outcome of a slab deallocation, telling the allocator how much superslab
/// bookkeeping is left to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabAction {
    /// The block went back to the slab; the slab is still in use.
    NoSlabReturn,
    /// The slab drained back into its superslab without a status change.
    NoStatusChange,
    /// The slab drained and the superslab changed status.
    SlabReturned,
}

/// Per-slab metadata, stored in the superslab header.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct Metaslab {
    /// Free-list of returned blocks. Zero when empty.
    head: Address,
    /// Slab-relative offset of the next never-used block.
    bump: u32,
    used: u32,
    sizeclass: u8,
    prev: Option<Slab>,
    next: Option<Slab>,
}

impl Metaslab {
    const EMPTY: Self = Self {
        head: Address::ZERO,
        bump: 0,
        used: 0,
        sizeclass: 0,
        prev: None,
        next: None,
    };

    fn fresh(sizeclass: u8, reserved: usize) -> Self {
        let rsize = class_to_size(sizeclass);
        let count = (SLAB_SIZE - reserved) / rsize;
        debug_assert!(count > 0);
        Self {
            head: Address::ZERO,
            // Carve from the end: the last block ends exactly at the slab end.
            bump: (SLAB_SIZE - count * rsize) as u32,
            used: 0,
            sizeclass,
            prev: None,
            next: None,
        }
    }
}

const ALL_FREE: u16 = 0xffff;

#[repr(C)]
pub struct SuperslabHeader {
    base: Allocslab,
    /// Bit `i` set means slab `i` is free; bit 0 is the short slab.
    free_slabs: u16,
    pub(crate) prev: Option<Superslab>,
    pub(crate) next: Option<Superslab>,
    meta: [Metaslab; SLAB_COUNT],
}

crate::aligned_block!(
    /// Handle to a superslab region.
    pub struct Superslab, log_bytes = SUPERSLAB_BITS, header = SuperslabHeader
);

crate::aligned_block!(
    /// Handle to one of a superslab's 16 slabs.
    pub struct Slab, log_bytes = SLAB_BITS
);

/// Whether blocks of `sizeclass` fit in the short slab.
pub const fn is_short_sizeclass(sizeclass: u8) -> bool {
    class_to_size(sizeclass) <= SLAB_SIZE - std::mem::size_of::<SuperslabHeader>()
}

impl Superslab {
    pub(crate) fn init(self, allocator: &'static RemoteAllocator) {
        let header = self.start().as_mut_ptr::<SuperslabHeader>();
        unsafe {
            ptr::write(
                header,
                SuperslabHeader {
                    base: Allocslab {
                        kind: SlabKind::Super,
                        allocator,
                    },
                    free_slabs: ALL_FREE,
                    prev: None,
                    next: None,
                    meta: [Metaslab::EMPTY; SLAB_COUNT],
                },
            );
        }
    }

    pub(crate) fn get_allocator(self) -> &'static RemoteAllocator {
        debug_assert!(matches!(self.base.kind, SlabKind::Super));
        unsafe { &*self.base.allocator }
    }

    pub fn get_status(self) -> SuperslabStatus {
        let mask = self.free_slabs;
        if mask == ALL_FREE {
            SuperslabStatus::Empty
        } else if mask & !1 != 0 {
            SuperslabStatus::Available
        } else if mask & 1 != 0 {
            SuperslabStatus::OnlyShortSlabAvailable
        } else {
            SuperslabStatus::Full
        }
    }

    pub fn is_full(self) -> bool {
        self.get_status() == SuperslabStatus::Full
    }

    /// Hand out a previously-unused non-short slab, bound to `sizeclass`.
    pub(crate) fn alloc_slab(mut self, sizeclass: u8) -> Slab {
        let mask = self.free_slabs & !1;
        debug_assert!(mask != 0, "no non-short slab available");
        let index = mask.trailing_zeros() as usize;
        self.free_slabs &= !(1 << index);
        self.meta[index] = Metaslab::fresh(sizeclass, 0);
        Slab::new(self.start() + (index << SLAB_BITS))
    }

    /// Hand out the short slab. Only legal once it is the sole free slab.
    pub(crate) fn alloc_short_slab(mut self, sizeclass: u8) -> Slab {
        debug_assert_eq!(self.free_slabs, 1, "short slab is not the last free slab");
        debug_assert!(is_short_sizeclass(sizeclass));
        self.free_slabs = 0;
        self.meta[0] = Metaslab::fresh(sizeclass, Self::HEADER_BYTES);
        Slab::new(self.start())
    }

    pub(crate) fn release_slab(mut self, slab: Slab) {
        let index = slab.index();
        debug_assert_eq!(self.free_slabs & (1 << index), 0, "slab already free");
        self.free_slabs |= 1 << index;
    }
}

impl Slab {
    pub fn superslab(self) -> Superslab {
        Superslab::containing(self.start())
    }

    fn index(self) -> usize {
        (self.start() - self.superslab().start()) >> SLAB_BITS
    }

    #[allow(clippy::mut_from_ref)]
    fn meta(self) -> &'static mut Metaslab {
        let header = self.superslab().start().as_mut_ptr::<SuperslabHeader>();
        let index = self.index();
        unsafe { &mut (*header).meta[index] }
    }

    pub fn sizeclass(self) -> u8 {
        self.meta().sizeclass
    }

    pub fn is_full(self) -> bool {
        let meta = self.meta();
        meta.head.is_zero() && meta.bump as usize + class_to_size(meta.sizeclass) > SLAB_SIZE
    }

    pub fn is_empty(self) -> bool {
        self.meta().used == 0
    }

    /// Pop one block: the free-list first, then the bump region.
    pub(crate) fn alloc(self, rsize: usize) -> Address {
        let meta = self.meta();
        debug_assert_eq!(rsize, class_to_size(meta.sizeclass));
        let cell = if meta.head.is_zero() {
            debug_assert!(meta.bump as usize + rsize <= SLAB_SIZE);
            let cell = self.start() + meta.bump as usize;
            meta.bump += rsize as u32;
            cell
        } else {
            let cell = meta.head;
            meta.head = unsafe { cell.load::<Address>() };
            cell
        };
        meta.used += 1;
        cell
    }

    /// Push a block back. Reports how far the return propagated so the caller
    /// can keep the superslab lists in step.
    pub(crate) fn dealloc(self, list: &mut SlabList, super_slab: Superslab, p: Address) -> SlabAction {
        let was_full = self.is_full();
        {
            let meta = self.meta();
            unsafe { p.store(meta.head) };
            meta.head = p;
            meta.used -= 1;
        }
        if was_full {
            list.insert(self);
        }
        if self.meta().used > 0 {
            return SlabAction::NoSlabReturn;
        }
        // The slab drained completely; hand it back to the superslab.
        list.remove(self);
        let previous = super_slab.get_status();
        super_slab.release_slab(self);
        if super_slab.get_status() == previous {
            SlabAction::NoStatusChange
        } else {
            SlabAction::SlabReturned
        }
    }
}

/// Doubly-linked list of slabs of one size class that still have free blocks.
pub(crate) struct SlabList {
    head: Option<Slab>,
}

impl SlabList {
    pub const fn new() -> Self {
        Self { head: None }
    }

    pub fn head(&self) -> Option<Slab> {
        self.head
    }

    pub fn insert(&mut self, slab: Slab) {
        {
            let meta = slab.meta();
            meta.prev = None;
            meta.next = self.head;
        }
        if let Some(old) = self.head {
            old.meta().prev = Some(slab);
        }
        self.head = Some(slab);
    }

    pub fn remove(&mut self, slab: Slab) {
        let (prev, next) = {
            let meta = slab.meta();
            (meta.prev, meta.next)
        };
        match prev {
            Some(p) => p.meta().next = next,
            None => {
                debug_assert_eq!(self.head, Some(slab));
                self.head = next;
            }
        }
        if let Some(n) = next {
            n.meta().prev = prev;
        }
        let meta = slab.meta();
        meta.prev = None;
        meta.next = None;
    }
}

/// Doubly-linked list of superslabs, threaded through their headers.
pub(crate) struct SuperslabList {
    head: Option<Superslab>,
}

impl SuperslabList {
    pub const fn new() -> Self {
        Self { head: None }
    }

    pub fn head(&self) -> Option<Superslab> {
        self.head
    }

    pub fn insert(&mut self, mut slab: Superslab) {
        slab.prev = None;
        slab.next = self.head;
        if let Some(mut head) = self.head {
            head.prev = Some(slab);
        }
        self.head = Some(slab);
    }

    pub fn remove(&mut self, mut slab: Superslab) {
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

    pub fn pop(&mut self) -> Option<Superslab> {
        let head = self.head?;
        self.remove(head);
        Some(head)
    }
}
