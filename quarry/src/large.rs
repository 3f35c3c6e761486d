//! The large allocator: a per-thread cache of power-of-two chunks.
//!
//! Every region of `SUPERSLAB_SIZE` bytes or more flows through here, whether
//! it ends up as a superslab, a mediumslab, or a large block handed straight
//! to the caller. Freed chunks are kept on intrusive per-class stacks and
//! reused before the memory provider is asked for new address space.

use crate::provider::MemoryProvider;
use crate::stat::Stats;
use crate::superslab::SlabKind;
use crate::util::constants::{
    decommit_strategy, AllowReserve, DecommitStrategy, NUM_LARGE_CLASSES, OS_PAGE_SIZE,
    SUPERSLAB_BITS, SUPERSLAB_SIZE,
};
use crate::util::Address;

#[repr(C)]
pub struct LargeslabHeader {
    kind: SlabKind,
    next: Address,
}

crate::aligned_block!(
    /// A freed large chunk parked in the cache.
    pub struct Largeslab, log_bytes = SUPERSLAB_BITS, header = LargeslabHeader
);

impl Largeslab {
    fn init(mut self, next: Address) {
        self.kind = SlabKind::Large;
        self.next = next;
    }
}

pub struct LargeAlloc<M: MemoryProvider> {
    pub memory_provider: M,
    /// Stack heads per large class; class = size_bits - SUPERSLAB_BITS.
    cache: [Address; NUM_LARGE_CLASSES],
    pub stats: Stats,
}

impl<M: MemoryProvider> LargeAlloc<M> {
    pub fn new(memory_provider: M) -> Self {
        Self {
            memory_provider,
            cache: [Address::ZERO; NUM_LARGE_CLASSES],
            stats: Stats::new(),
        }
    }

    /// A cached chunk of the class if one exists, else fresh address space.
    /// `size` is the caller's request; the returned region is
    /// `1 << (large_class + SUPERSLAB_BITS)` bytes, `SUPERSLAB_SIZE` aligned.
    pub fn alloc(
        &mut self,
        large_class: usize,
        size: usize,
        allow_reserve: AllowReserve,
    ) -> Option<Address> {
        debug_assert!(large_class < NUM_LARGE_CLASSES);
        let rsize = 1usize << (large_class + SUPERSLAB_BITS);
        debug_assert!(size <= rsize);
        let head = self.cache[large_class];
        if !head.is_zero() {
            let slab = Largeslab::new(head);
            debug_assert!(matches!(slab.kind, SlabKind::Large));
            self.cache[large_class] = slab.next;
            // Anything beyond the header page may have been decommitted when
            // the chunk was cached.
            if large_class > 0 || decommit_strategy() != DecommitStrategy::None {
                self.memory_provider
                    .notify_using(head + OS_PAGE_SIZE, rsize - OS_PAGE_SIZE);
            }
            return Some(head);
        }
        if allow_reserve == AllowReserve::NoReserve {
            return None;
        }
        self.memory_provider.reserve(rsize, SUPERSLAB_SIZE)
    }

    /// Park a chunk on its class stack. Anything beyond the header page of a
    /// non-smallest-class chunk is handed back to the OS; superslab-sized
    /// chunks keep their pages unless the decommit strategy says otherwise at
    /// the release site.
    pub fn dealloc(&mut self, p: Address, large_class: usize) {
        debug_assert!(large_class < NUM_LARGE_CLASSES);
        debug_assert!(Largeslab::is_aligned(p));
        if large_class != 0 {
            let rsize = 1usize << (large_class + SUPERSLAB_BITS);
            self.memory_provider
                .notify_not_using(p + OS_PAGE_SIZE, rsize - OS_PAGE_SIZE);
        }
        let slab = Largeslab::new(p);
        slab.init(self.cache[large_class]);
        self.cache[large_class] = p;
    }
}
