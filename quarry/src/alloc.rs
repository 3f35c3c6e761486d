//! The per-thread allocator front-end.
//!
//! Dispatches on size class: small requests go to slabs inside superslabs,
//! medium requests to dedicated mediumslabs, and everything else straight to
//! the large allocator. Before every public operation the inbound message
//! queue is drained a bounded amount, so remote frees are folded back into
//! the local bins without any locking.
//!
//! The allocator is single-threaded over its own structures. The only
//! cross-thread surfaces are its `'static` remote endpoint (any thread may
//! push) and the global page map (owners write disjoint cells).

use std::ptr;

use crate::large::LargeAlloc;
use crate::mediumslab::{Mediumslab, MediumslabList};
use crate::pagemap::{self, PagemapAdaptor, SuperslabMap, PM_MEDIUMSLAB, PM_NOT_OURS, PM_REDIRECT_BASE, PM_SUPERSLAB};
use crate::provider::{MemoryProvider, VirtualProvider};
use crate::remote::{Remote, RemoteAllocator, RemoteCache, RemoteQueue};
use crate::sizeclass::{
    class_to_size, is_multiple_of_sizeclass, size_to_class, size_to_class_const, NUM_MEDIUM_CLASSES,
    NUM_SIZECLASSES, NUM_SMALL_CLASSES,
};
use crate::stat::{self, Stats};
use crate::superslab::{
    is_short_sizeclass, Slab, SlabAction, SlabList, Superslab, SuperslabList, SuperslabStatus,
};
use crate::util::bits;
use crate::util::constants::{
    decommit_strategy, AllowReserve, Boundary, DecommitStrategy, ZeroMem, NUM_LARGE_CLASSES,
    OS_PAGE_SIZE, REMOTE_BATCH, REMOTE_CACHE, SLAB_SIZE, SUPERSLAB_BITS, SUPERSLAB_SIZE,
};
use crate::util::Address;

pub struct Allocator<M: MemoryProvider = VirtualProvider, P: PagemapAdaptor = SuperslabMap> {
    large_allocator: LargeAlloc<M>,
    page_map: P,
    small_classes: [SlabList; NUM_SMALL_CLASSES],
    medium_classes: [MediumslabList; NUM_MEDIUM_CLASSES],
    super_available: SuperslabList,
    super_only_short_available: SuperslabList,
    remote: RemoteCache,
    remote_alloc: &'static RemoteAllocator,
}

/// Stamps the (memory provider, page map, endpoint) combination an allocator
/// is built with. The defaults are the OS virtual-memory provider and the
/// process-wide page map.
pub struct AllocatorBuilder<M: MemoryProvider = VirtualProvider, P: PagemapAdaptor = SuperslabMap> {
    memory_provider: M,
    page_map: P,
    remote_alloc: Option<&'static RemoteAllocator>,
}

impl AllocatorBuilder {
    pub fn new() -> Self {
        Self {
            memory_provider: VirtualProvider,
            page_map: SuperslabMap,
            remote_alloc: None,
        }
    }
}

impl Default for AllocatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: MemoryProvider, P: PagemapAdaptor> AllocatorBuilder<M, P> {
    pub fn memory_provider<M2: MemoryProvider>(self, memory_provider: M2) -> AllocatorBuilder<M2, P> {
        AllocatorBuilder {
            memory_provider,
            page_map: self.page_map,
            remote_alloc: self.remote_alloc,
        }
    }

    pub fn page_map<P2: PagemapAdaptor>(self, page_map: P2) -> AllocatorBuilder<M, P2> {
        AllocatorBuilder {
            memory_provider: self.memory_provider,
            page_map,
            remote_alloc: self.remote_alloc,
        }
    }

    /// Use an externally-placed endpoint instead of allocating one.
    pub fn remote_endpoint(mut self, endpoint: &'static RemoteAllocator) -> Self {
        self.remote_alloc = Some(endpoint);
        self
    }

    pub fn build(self) -> Allocator<M, P> {
        Allocator::from_parts(self.memory_provider, self.page_map, self.remote_alloc)
    }
}

impl Allocator {
    pub fn new() -> Self {
        AllocatorBuilder::new().build()
    }

    pub fn builder() -> AllocatorBuilder {
        AllocatorBuilder::new()
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: MemoryProvider, P: PagemapAdaptor> Allocator<M, P> {
    fn from_parts(
        memory_provider: M,
        page_map: P,
        remote_alloc: Option<&'static RemoteAllocator>,
    ) -> Self {
        pagemap::init();
        let remote_alloc = remote_alloc.unwrap_or_else(RemoteAllocator::alloc_endpoint);
        if remote_alloc.id() == usize::MAX {
            crate::log::fatal("Id should not be -1");
        }
        #[cfg(debug_assertions)]
        Self::check_sizeclass_table();
        Self {
            large_allocator: LargeAlloc::new(memory_provider),
            page_map,
            small_classes: [const { SlabList::new() }; NUM_SMALL_CLASSES],
            medium_classes: [const { MediumslabList::new() }; NUM_MEDIUM_CLASSES],
            super_available: SuperslabList::new(),
            super_only_short_available: SuperslabList::new(),
            remote: RemoteCache::new(),
            remote_alloc,
        }
    }

    #[cfg(debug_assertions)]
    fn check_sizeclass_table() {
        for c in 0..NUM_SIZECLASSES as u8 {
            let size = class_to_size(c);
            assert_eq!(size_to_class(size), c);
            assert_eq!(size_to_class_const(size), c);
            assert_eq!(class_to_size(size_to_class(size)), size);
            // All medium size classes are page aligned.
            if c as usize >= NUM_SMALL_CLASSES {
                assert_eq!(size % OS_PAGE_SIZE, 0);
            }
        }
    }

    pub fn get_id(&self) -> usize {
        self.remote_alloc.id()
    }

    pub fn stats(&self) -> &Stats {
        &self.large_allocator.stats
    }

    fn public_state(&self) -> &'static RemoteAllocator {
        self.remote_alloc
    }

    fn message_queue(&self) -> &'static RemoteQueue {
        &self.remote_alloc.message_queue
    }

    pub fn alloc(&mut self, size: usize) -> Option<Address> {
        self.alloc_flags(size, ZeroMem::NoZero, AllowReserve::YesReserve)
    }

    pub fn alloc_zeroed(&mut self, size: usize) -> Option<Address> {
        self.alloc_flags(size, ZeroMem::YesZero, AllowReserve::YesReserve)
    }

    pub fn alloc_flags(
        &mut self,
        size: usize,
        zero_mem: ZeroMem,
        allow_reserve: AllowReserve,
    ) -> Option<Address> {
        self.large_allocator.stats.alloc_request(size);
        self.handle_message_queue();

        let sizeclass = size_to_class(size);
        if (sizeclass as usize) < NUM_SMALL_CLASSES {
            // Small allocations dominate; keep this case first.
            let rsize = class_to_size(sizeclass);
            stat::track_allocation(size, false);
            self.small_alloc(sizeclass, rsize, zero_mem, allow_reserve)
        } else if (sizeclass as usize) < NUM_SIZECLASSES {
            let rsize = class_to_size(sizeclass);
            stat::track_allocation(size, false);
            self.medium_alloc(sizeclass, rsize, zero_mem, allow_reserve)
        } else {
            stat::track_allocation(size, true);
            self.large_alloc(size, zero_mem, allow_reserve)
        }
    }

    /// Free a block whose size is unknown; the page map resolves the tier and
    /// the slab header the class.
    pub fn dealloc(&mut self, p: Address) {
        self.handle_message_queue();

        let kind = self.page_map.get(p);
        if kind == PM_NOT_OURS {
            crate::log::fatal("Not allocated by this allocator");
        }
        if kind == PM_SUPERSLAB {
            let super_slab = Superslab::containing(p);
            let target = super_slab.get_allocator();
            // Reading a remote sizeclass cannot race: the owner cannot reuse
            // the slab while this pointer is still live.
            let sizeclass = Slab::containing(p).sizeclass();
            stat::track_deallocation(false);
            if ptr::eq(target, self.public_state()) {
                self.small_dealloc(super_slab, p, sizeclass);
            } else {
                self.remote_dealloc(target, p, sizeclass);
            }
            return;
        }
        if kind == PM_MEDIUMSLAB {
            let slab = Mediumslab::containing(p);
            let target = slab.get_allocator();
            let sizeclass = slab.get_sizeclass();
            stat::track_deallocation(false);
            if ptr::eq(target, self.public_state()) {
                self.medium_dealloc(slab, p, sizeclass);
            } else {
                self.remote_dealloc(target, p, sizeclass);
            }
            return;
        }

        if cfg!(feature = "safe-client") && (kind >= PM_REDIRECT_BASE || p != Superslab::align(p)) {
            crate::log::fatal("Not deallocating start of an object");
        }
        stat::track_deallocation(true);
        self.large_dealloc(p, 1usize << kind);
    }

    /// Free a block of a dynamically known size.
    pub fn dealloc_sized(&mut self, p: Address, size: usize) {
        self.handle_message_queue();

        let sizeclass = size_to_class(size);
        if (sizeclass as usize) < NUM_SMALL_CLASSES {
            let super_slab = Superslab::containing(p);
            let target = super_slab.get_allocator();
            stat::track_deallocation(false);
            if ptr::eq(target, self.public_state()) {
                self.small_dealloc(super_slab, p, sizeclass);
            } else {
                self.remote_dealloc(target, p, sizeclass);
            }
        } else if (sizeclass as usize) < NUM_SIZECLASSES {
            let slab = Mediumslab::containing(p);
            let target = slab.get_allocator();
            stat::track_deallocation(false);
            if ptr::eq(target, self.public_state()) {
                self.medium_dealloc(slab, p, sizeclass);
            } else {
                self.remote_dealloc(target, p, sizeclass);
            }
        } else {
            stat::track_deallocation(true);
            self.large_dealloc(p, size);
        }
    }

    /// Free a block of a statically known size.
    pub fn dealloc_const<const SIZE: usize>(&mut self, p: Address) {
        let _sizeclass = const { size_to_class_const(SIZE) };
        self.dealloc_sized(p, SIZE);
    }

    /// Usable size of the block containing `p`. Must be called on a pointer
    /// previously returned by some allocator of this process.
    pub fn alloc_size(p: Address) -> usize {
        alloc_size_in(&SuperslabMap, p)
    }

    /// Start or last byte of the block containing `p`.
    pub fn external_pointer(p: Address, location: Boundary) -> Address {
        external_pointer_in(&SuperslabMap, p, location)
    }

    /// Post all batched remote frees regardless of the byte threshold, after
    /// a bounded drain of our own queue.
    pub fn flush(&mut self) {
        self.handle_message_queue();
        if !self.remote.is_empty() {
            self.large_allocator.stats.remote_post();
            self.remote.post(self.get_id());
        }
    }

    #[inline]
    fn handle_message_queue(&mut self) {
        // Inline the empty check, not the drain.
        if self.message_queue().is_empty() {
            return;
        }
        self.handle_message_queue_inner();
    }

    #[cold]
    fn handle_message_queue_inner(&mut self) {
        for _ in 0..REMOTE_BATCH {
            match self.message_queue().pop() {
                None => break,
                Some(p) => self.handle_dealloc_remote(p),
            }
        }

        // Forwarded frees may have grown our own batches past the limit.
        if self.remote.size() < REMOTE_CACHE {
            return;
        }
        self.large_allocator.stats.remote_post();
        self.remote.post(self.get_id());
    }

    fn handle_dealloc_remote(&mut self, p: Address) {
        let (target_id, sizeclass) = {
            let message = unsafe { p.as_ref::<Remote>() };
            (message.target_id(), message.sizeclass())
        };
        if target_id == self.get_id() {
            self.large_allocator.stats.remote_receive(sizeclass);
            if (sizeclass as usize) < NUM_SMALL_CLASSES {
                self.small_dealloc(Superslab::containing(p), p, sizeclass);
            } else {
                self.medium_dealloc(Mediumslab::containing(p), p, sizeclass);
            }
        } else {
            // Not ours: another hop through our outbound batches.
            self.remote.dealloc(target_id, p, sizeclass);
        }
    }

    fn get_superslab(&mut self, allow_reserve: AllowReserve) -> Option<Superslab> {
        if let Some(super_slab) = self.super_available.head() {
            return Some(super_slab);
        }
        let p = self
            .large_allocator
            .alloc(0, SUPERSLAB_SIZE, allow_reserve)?;
        let super_slab = Superslab::new(p);
        super_slab.init(self.public_state());
        self.page_map.set_superslab(super_slab);
        self.super_available.insert(super_slab);
        self.large_allocator.stats.superslab_pop();
        Some(super_slab)
    }

    fn reposition_superslab(&mut self, super_slab: Superslab) {
        match super_slab.get_status() {
            SuperslabStatus::Full => {
                self.super_available.remove(super_slab);
            }
            SuperslabStatus::Available => {}
            SuperslabStatus::OnlyShortSlabAvailable => {
                self.super_available.remove(super_slab);
                self.super_only_short_available.insert(super_slab);
            }
            SuperslabStatus::Empty => {
                // We just allocated from it.
                crate::log::fatal("Unreachable");
            }
        }
    }

    fn alloc_slab(&mut self, sizeclass: u8, allow_reserve: AllowReserve) -> Option<Slab> {
        self.large_allocator.stats.sizeclass_alloc_slab(sizeclass);
        if is_short_sizeclass(sizeclass) {
            // Prefer superslabs whose short slab is the only one left.
            if let Some(super_slab) = self.super_only_short_available.pop() {
                let slab = super_slab.alloc_short_slab(sizeclass);
                debug_assert!(super_slab.is_full());
                return Some(slab);
            }
        }
        let super_slab = self.get_superslab(allow_reserve)?;
        let slab = super_slab.alloc_slab(sizeclass);
        self.reposition_superslab(super_slab);
        Some(slab)
    }

    fn small_alloc(
        &mut self,
        sizeclass: u8,
        rsize: usize,
        zero_mem: ZeroMem,
        allow_reserve: AllowReserve,
    ) -> Option<Address> {
        let slab = match self.small_classes[sizeclass as usize].head() {
            Some(slab) => slab,
            None => {
                let slab = self.alloc_slab(sizeclass, allow_reserve)?;
                self.small_classes[sizeclass as usize].insert(slab);
                slab
            }
        };
        let p = slab.alloc(rsize);
        if slab.is_full() {
            self.small_classes[sizeclass as usize].remove(slab);
        }
        if zero_mem == ZeroMem::YesZero {
            unsafe { ptr::write_bytes(p.as_mut_ptr::<u8>(), 0, rsize) };
        }
        self.large_allocator.stats.sizeclass_alloc(sizeclass);
        Some(p)
    }

    fn small_dealloc(&mut self, super_slab: Superslab, p: Address, sizeclass: u8) {
        self.large_allocator.stats.sizeclass_dealloc(sizeclass);
        let slab = Slab::containing(p);
        if cfg!(feature = "safe-client")
            && !is_multiple_of_sizeclass(class_to_size(sizeclass), slab.start() + SLAB_SIZE - p)
        {
            crate::log::fatal("Not deallocating start of an object");
        }

        let previous = super_slab.get_status();
        let action = slab.dealloc(&mut self.small_classes[sizeclass as usize], super_slab, p);
        if action == SlabAction::NoSlabReturn {
            return;
        }
        self.large_allocator.stats.sizeclass_dealloc_slab(sizeclass);
        if action == SlabAction::NoStatusChange {
            return;
        }

        match super_slab.get_status() {
            SuperslabStatus::Full => {
                crate::log::fatal("Unreachable");
            }
            SuperslabStatus::Available => {
                if previous == SuperslabStatus::Full {
                    self.super_available.insert(super_slab);
                } else {
                    self.super_only_short_available.remove(super_slab);
                    self.super_available.insert(super_slab);
                }
            }
            SuperslabStatus::OnlyShortSlabAvailable => {
                self.super_only_short_available.insert(super_slab);
            }
            SuperslabStatus::Empty => {
                self.super_available.remove(super_slab);
                if decommit_strategy() == DecommitStrategy::Super {
                    self.large_allocator.memory_provider.notify_not_using(
                        super_slab.start() + OS_PAGE_SIZE,
                        SUPERSLAB_SIZE - OS_PAGE_SIZE,
                    );
                }
                self.page_map.clear_superslab(super_slab);
                self.large_allocator.dealloc(super_slab.start(), 0);
                self.large_allocator.stats.superslab_push();
            }
        }
    }

    fn medium_alloc(
        &mut self,
        sizeclass: u8,
        rsize: usize,
        zero_mem: ZeroMem,
        allow_reserve: AllowReserve,
    ) -> Option<Address> {
        let medium_class = sizeclass as usize - NUM_SMALL_CLASSES;
        let p;
        if let Some(slab) = self.medium_classes[medium_class].head() {
            p = slab.alloc();
            if slab.full() {
                self.medium_classes[medium_class].pop();
            }
        } else {
            let addr = self
                .large_allocator
                .alloc(0, SUPERSLAB_SIZE, allow_reserve)?;
            let slab = Mediumslab::new(addr);
            slab.init(self.public_state(), sizeclass, rsize);
            self.page_map.set_mediumslab(slab);
            p = slab.alloc();
            if !slab.full() {
                self.medium_classes[medium_class].insert(slab);
            }
        }
        if zero_mem == ZeroMem::YesZero {
            unsafe { ptr::write_bytes(p.as_mut_ptr::<u8>(), 0, rsize) };
        }
        self.large_allocator.stats.sizeclass_alloc(sizeclass);
        Some(p)
    }

    fn medium_dealloc(&mut self, slab: Mediumslab, p: Address, sizeclass: u8) {
        self.large_allocator.stats.sizeclass_dealloc(sizeclass);
        if cfg!(feature = "safe-client")
            && !is_multiple_of_sizeclass(
                class_to_size(sizeclass),
                slab.start() + SUPERSLAB_SIZE - p,
            )
        {
            crate::log::fatal("Not deallocating start of an object");
        }

        let was_full = slab.dealloc(p);
        let medium_class = sizeclass as usize - NUM_SMALL_CLASSES;
        if slab.empty() {
            if !was_full {
                self.medium_classes[medium_class].remove(slab);
            }
            if decommit_strategy() == DecommitStrategy::Super {
                self.large_allocator.memory_provider.notify_not_using(
                    slab.start() + OS_PAGE_SIZE,
                    SUPERSLAB_SIZE - OS_PAGE_SIZE,
                );
            }
            self.page_map.clear_mediumslab(slab);
            self.large_allocator.dealloc(slab.start(), 0);
            self.large_allocator.stats.superslab_push();
        } else if was_full {
            self.medium_classes[medium_class].insert(slab);
        }
    }

    fn large_alloc(
        &mut self,
        size: usize,
        zero_mem: ZeroMem,
        allow_reserve: AllowReserve,
    ) -> Option<Address> {
        let size_bits = bits::next_pow2_bits(size);
        debug_assert!(size_bits >= SUPERSLAB_BITS);
        let large_class = size_bits - SUPERSLAB_BITS;
        if large_class >= NUM_LARGE_CLASSES {
            return None;
        }
        let rsize = 1usize << size_bits;
        let p = self.large_allocator.alloc(large_class, rsize, allow_reserve)?;
        // Publish the mapping before the pointer escapes this thread.
        self.page_map.set_large_size(p, size);
        if zero_mem == ZeroMem::YesZero {
            unsafe { ptr::write_bytes(p.as_mut_ptr::<u8>(), 0, size) };
        }
        self.large_allocator.stats.large_alloc(large_class);
        Some(p)
    }

    fn large_dealloc(&mut self, p: Address, size: usize) {
        let size_bits = bits::next_pow2_bits(size);
        let rsize = 1usize << size_bits;
        debug_assert!(rsize >= SUPERSLAB_SIZE);
        let large_class = size_bits - SUPERSLAB_BITS;

        self.page_map.clear_large_size(p, size);
        self.large_allocator.stats.large_dealloc(large_class);

        // The large allocator decommits every other class itself.
        if decommit_strategy() != DecommitStrategy::None && large_class == 0 {
            self.large_allocator
                .memory_provider
                .notify_not_using(p + OS_PAGE_SIZE, rsize - OS_PAGE_SIZE);
        }
        self.large_allocator.dealloc(p, large_class);
    }

    fn remote_dealloc(&mut self, target: &'static RemoteAllocator, p: Address, sizeclass: u8) {
        self.large_allocator.stats.remote_free(sizeclass);
        self.remote.dealloc(target.id(), p, sizeclass);
        if self.remote.size() < REMOTE_CACHE {
            return;
        }
        self.large_allocator.stats.remote_post();
        self.remote.post(self.get_id());
    }
}

impl<M: MemoryProvider, P: PagemapAdaptor> Drop for Allocator<M, P> {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Usable size of the block containing `p`, resolved through `page_map`.
pub(crate) fn alloc_size_in<P: PagemapAdaptor>(page_map: &P, p: Address) -> usize {
    let kind = page_map.get(p);
    if kind == PM_NOT_OURS || kind >= PM_REDIRECT_BASE {
        crate::log::fatal("Not allocated by this allocator");
    }
    if kind == PM_SUPERSLAB {
        return class_to_size(Slab::containing(p).sizeclass());
    }
    if kind == PM_MEDIUMSLAB {
        return class_to_size(Mediumslab::containing(p).get_sizeclass());
    }
    1usize << kind
}

/// Start or last byte of the block containing `p`. For large blocks the
/// page-map redirect chain is walked back to the head. Unknown addresses
/// resolve to the minimum pointer for `Start` and the maximum for `End`.
pub(crate) fn external_pointer_in<P: PagemapAdaptor>(
    page_map: &P,
    p: Address,
    location: Boundary,
) -> Address {
    let kind = page_map.get(p);

    if kind == PM_SUPERSLAB {
        let slab = Slab::containing(p);
        let sizeclass = slab.sizeclass();
        let slab_end = slab.start() + SLAB_SIZE - 1;
        return boundary_from_end(p, sizeclass, slab_end, location);
    }
    if kind == PM_MEDIUMSLAB {
        let slab = Mediumslab::containing(p);
        let sizeclass = slab.get_sizeclass();
        let slab_end = slab.start() + SUPERSLAB_SIZE - 1;
        return boundary_from_end(p, sizeclass, slab_end, location);
    }

    let mut ss = Superslab::align(p);
    let mut kind = kind;
    while kind >= PM_REDIRECT_BASE {
        // A large-block interior: the entry encodes the distance back.
        ss = ss - (1usize << (kind - PM_REDIRECT_BASE));
        kind = page_map.get(ss);
    }

    if kind == PM_NOT_OURS {
        return match location {
            Boundary::Start => Address::ZERO,
            Boundary::End => Address::MAX,
        };
    }

    match location {
        Boundary::Start => ss,
        Boundary::End => ss + (1usize << kind) - 1,
    }
}

/// Recover a block boundary from the covering region's end, exploiting that
/// blocks are carved so the last one ends exactly at the region end.
fn boundary_from_end(p: Address, sizeclass: u8, end_point: Address, location: Boundary) -> Address {
    let rsize = class_to_size(sizeclass);
    let end_point_correction = match location {
        Boundary::End => end_point,
        Boundary::Start => end_point - rsize + 1,
    };
    let offset_from_end = end_point - p;
    let end_to_end = crate::sizeclass::round_by_sizeclass(rsize, offset_from_end);
    end_point_correction - end_to_end
}
