//! The process-wide page map.
//!
//! One byte per `SUPERSLAB_SIZE`-aligned region of the address space records
//! what covers that region: nothing of ours, a superslab, a mediumslab, the
//! head of a large block (the byte is the block's size in bits), or a redirect
//! back towards a large-block head. Deallocation and introspection of an
//! arbitrary pointer starts here.
//!
//! Two interchangeable backings exist: a flat array covering the whole usable
//! address space, and a two-level trie whose leaves are created on demand.
//! The flat map is the default while its footprint fits
//! [`MAX_FLAT_PAGEMAP_SIZE`]; the `pagemap-trie` feature selects the trie.
//! Cells are bytes accessed atomically: concurrent writers only ever touch
//! disjoint entries (each region has one owner), and readers tolerate any
//! interleaving.

use std::alloc::Layout;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, Once};

use crate::mediumslab::Mediumslab;
use crate::superslab::Superslab;
use crate::util::bits;
use crate::util::constants::{
    ADDRESS_BITS, MAX_FLAT_PAGEMAP_SIZE, SUPERSLAB_BITS, SUPERSLAB_SIZE,
};
use crate::util::memory::RawMemory;
use crate::util::meta::meta_alloc;
use crate::util::Address;

pub const PM_NOT_OURS: u8 = 0;
pub const PM_SUPERSLAB: u8 = 1;
pub const PM_MEDIUMSLAB: u8 = 2;

/// First page-map value that encodes a large-block interior redirect.
pub const PM_REDIRECT_BASE: u8 = 64;

const ENTRIES: usize = 1 << (ADDRESS_BITS - SUPERSLAB_BITS);

/// Byte-per-superslab tag table.
pub trait Pagemap {
    fn get(&self, p: Address) -> u8;
    fn set(&self, p: Address, value: u8);

    /// Equivalent to `count` individual `set`s on consecutive superslab cells.
    fn set_range(&self, p: Address, value: u8, count: usize) {
        for i in 0..count {
            self.set(p + (i << SUPERSLAB_BITS), value);
        }
    }
}

const fn cell_index(p: Address) -> usize {
    p.as_usize() >> SUPERSLAB_BITS
}

/// Flat backing: one contiguous mapping covering every possible cell. The
/// mapping is reserved lazily and committed by the OS a page at a time as
/// cells are first written.
pub struct FlatPagemap {
    base: Once<Address>,
}

impl FlatPagemap {
    pub const BYTES: usize = ENTRIES;

    pub const fn new() -> Self {
        Self { base: Once::new() }
    }

    fn backing(&self) -> Address {
        *self.base.call_once(|| {
            RawMemory::map_anonymous(Self::BYTES)
                .unwrap_or_else(|_| crate::log::fatal("Failed to reserve the page map"))
        })
    }
}

impl Default for FlatPagemap {
    fn default() -> Self {
        Self::new()
    }
}

impl Pagemap for FlatPagemap {
    fn get(&self, p: Address) -> u8 {
        let index = cell_index(p);
        if index >= ENTRIES {
            return PM_NOT_OURS;
        }
        match self.base.get() {
            // Nothing was ever set, so nothing is ours.
            None => PM_NOT_OURS,
            Some(base) => unsafe { (*base + index).atomic::<u8>() }.load(Ordering::Relaxed),
        }
    }

    fn set(&self, p: Address, value: u8) {
        let index = cell_index(p);
        debug_assert!(index < ENTRIES, "address beyond the mapped address space");
        let base = self.backing();
        unsafe { (base + index).atomic::<u8>() }.store(value, Ordering::Relaxed);
    }
}

const LEAF_BITS: usize = 12;
const LEAF_ENTRIES: usize = 1 << LEAF_BITS;
const ROOT_ENTRIES: usize = 1 << (ADDRESS_BITS - SUPERSLAB_BITS - LEAF_BITS);

/// Trie backing: a root table of lazily-created 4 KiB leaves. Bounded depth,
/// so lookups stay O(1); only the touched slices of the address space cost
/// memory.
pub struct PagemapTrie {
    root: [AtomicUsize; ROOT_ENTRIES],
    leaf_creation: Mutex<()>,
}

impl PagemapTrie {
    pub const fn new() -> Self {
        Self {
            root: unsafe {
                mem::transmute::<[usize; ROOT_ENTRIES], [AtomicUsize; ROOT_ENTRIES]>(
                    [0; ROOT_ENTRIES],
                )
            },
            leaf_creation: Mutex::new(()),
        }
    }

    fn leaf(&self, root_index: usize, create: bool) -> Option<Address> {
        let entry = self.root[root_index].load(Ordering::Acquire);
        if entry != 0 {
            return Some(Address::from_usize(entry));
        }
        if !create {
            return None;
        }
        let _guard = self.leaf_creation.lock();
        let entry = self.root[root_index].load(Ordering::Acquire);
        if entry != 0 {
            return Some(Address::from_usize(entry));
        }
        // Meta-arena memory is fresh-mapped, so new leaves read as PM_NOT_OURS.
        let leaf = meta_alloc(Layout::from_size_align(LEAF_ENTRIES, LEAF_ENTRIES).unwrap());
        self.root[root_index].store(leaf.as_usize(), Ordering::Release);
        Some(leaf)
    }
}

impl Default for PagemapTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl Pagemap for PagemapTrie {
    fn get(&self, p: Address) -> u8 {
        let index = cell_index(p);
        if index >= ENTRIES {
            return PM_NOT_OURS;
        }
        match self.leaf(index >> LEAF_BITS, false) {
            None => PM_NOT_OURS,
            Some(leaf) => unsafe { (leaf + (index & (LEAF_ENTRIES - 1))).atomic::<u8>() }
                .load(Ordering::Relaxed),
        }
    }

    fn set(&self, p: Address, value: u8) {
        let index = cell_index(p);
        debug_assert!(index < ENTRIES, "address beyond the mapped address space");
        let leaf = self.leaf(index >> LEAF_BITS, true).unwrap();
        unsafe { (leaf + (index & (LEAF_ENTRIES - 1))).atomic::<u8>() }
            .store(value, Ordering::Relaxed);
    }
}

#[cfg(not(feature = "pagemap-trie"))]
pub(crate) type DefaultPagemap = FlatPagemap;
#[cfg(feature = "pagemap-trie")]
pub(crate) type DefaultPagemap = PagemapTrie;

// The flat map may only be the default while it fits the configured cap.
const _: () = assert!(
    FlatPagemap::BYTES <= MAX_FLAT_PAGEMAP_SIZE || cfg!(feature = "pagemap-trie")
);

pub(crate) static GLOBAL_PAGEMAP: DefaultPagemap = DefaultPagemap::new();

/// Reserve the global page map's backing. Called once before the first
/// allocator exists; later calls are no-ops.
pub fn init() {
    #[cfg(not(feature = "pagemap-trie"))]
    GLOBAL_PAGEMAP.backing();
}

/// The allocator's view of a page map: typed set/clear helpers over the raw
/// byte cells. Swapping the adaptor moves page-map maintenance elsewhere
/// without touching the allocator.
pub trait PagemapAdaptor: 'static {
    fn get(&self, p: Address) -> u8;
    fn set_superslab(&self, slab: Superslab);
    fn clear_superslab(&self, slab: Superslab);
    fn set_mediumslab(&self, slab: Mediumslab);
    fn clear_mediumslab(&self, slab: Mediumslab);
    fn set_large_size(&self, p: Address, size: usize);
    fn clear_large_size(&self, p: Address, size: usize);
}

/// Adaptor over the process-wide map.
#[derive(Debug, Default, Clone, Copy)]
pub struct SuperslabMap;

impl PagemapAdaptor for SuperslabMap {
    fn get(&self, p: Address) -> u8 {
        GLOBAL_PAGEMAP.get(p)
    }

    fn set_superslab(&self, slab: Superslab) {
        GLOBAL_PAGEMAP.set(slab.start(), PM_SUPERSLAB);
    }

    fn clear_superslab(&self, slab: Superslab) {
        debug_assert_eq!(self.get(slab.start()), PM_SUPERSLAB);
        GLOBAL_PAGEMAP.set(slab.start(), PM_NOT_OURS);
    }

    fn set_mediumslab(&self, slab: Mediumslab) {
        GLOBAL_PAGEMAP.set(slab.start(), PM_MEDIUMSLAB);
    }

    fn clear_mediumslab(&self, slab: Mediumslab) {
        debug_assert_eq!(self.get(slab.start()), PM_MEDIUMSLAB);
        GLOBAL_PAGEMAP.set(slab.start(), PM_NOT_OURS);
    }

    fn set_large_size(&self, p: Address, size: usize) {
        set_large_size_in(&GLOBAL_PAGEMAP, p, size)
    }

    fn clear_large_size(&self, p: Address, size: usize) {
        clear_large_size_in(&GLOBAL_PAGEMAP, p, size)
    }
}

/// Tag a large block: the head cell holds the block's size in bits, and every
/// trailing superslab-sized cell holds a redirect encoding the power-of-two
/// distance back to the head. Redirect runs double in length, so a block of
/// `2^k` bytes needs `k - SUPERSLAB_BITS` runs.
pub(crate) fn set_large_size_in(map: &impl Pagemap, p: Address, size: usize) {
    debug_assert!(Superslab::is_aligned(p));
    let size_bits = bits::next_pow2_bits(size);
    // Head values must stay clear of the reserved tags below and the redirect
    // range above.
    assert!(
        size_bits >= SUPERSLAB_BITS && size_bits < PM_REDIRECT_BASE as usize,
        "large block size out of range"
    );
    map.set(p, size_bits as u8);
    let mut ss = p + SUPERSLAB_SIZE;
    for i in 0..size_bits - SUPERSLAB_BITS {
        let run = 1usize << i;
        map.set_range(ss, (PM_REDIRECT_BASE as usize + i + SUPERSLAB_BITS) as u8, run);
        ss += SUPERSLAB_SIZE * run;
    }
}

pub(crate) fn clear_large_size_in(map: &impl Pagemap, p: Address, size: usize) {
    let rounded = bits::next_pow2(size);
    debug_assert_eq!(map.get(p) as usize, bits::next_pow2_bits(size));
    map.set_range(p, PM_NOT_OURS, rounded >> SUPERSLAB_BITS);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Probe addresses sit far from anything the kernel hands out in tests.
    const PROBE: usize = 0x1000 << SUPERSLAB_BITS;

    fn addr(i: usize) -> Address {
        Address::from_usize(PROBE + (i << SUPERSLAB_BITS))
    }

    #[test]
    fn unset_cells_read_as_not_ours() {
        let flat = FlatPagemap::new();
        let trie = PagemapTrie::new();
        assert_eq!(flat.get(addr(3)), PM_NOT_OURS);
        assert_eq!(trie.get(addr(3)), PM_NOT_OURS);
        assert_eq!(flat.get(Address::from_usize(1 << 60)), PM_NOT_OURS);
        assert_eq!(trie.get(Address::from_usize(1 << 60)), PM_NOT_OURS);
    }

    #[test]
    fn flat_and_trie_agree() {
        let flat = FlatPagemap::new();
        let trie = PagemapTrie::new();
        let ops: &[(usize, u8, usize)] = &[
            (0, PM_SUPERSLAB, 1),
            (1, PM_MEDIUMSLAB, 1),
            (7, 26, 1),
            (8, 88, 1),
            (9, 89, 2),
            (100, 30, 1),
            // Crosses a trie leaf boundary.
            (LEAF_ENTRIES - 2, 90, 5),
            (3, PM_NOT_OURS, 4),
        ];
        for &(i, value, count) in ops {
            flat.set_range(addr(i), value, count);
            trie.set_range(addr(i), value, count);
        }
        for i in 0..(LEAF_ENTRIES + 8) {
            assert_eq!(flat.get(addr(i)), trie.get(addr(i)), "cell {}", i);
        }
    }

    #[test]
    fn large_size_round_trips_to_zero() {
        let map = FlatPagemap::new();
        let p = addr(16);
        let size = 40 << 20;
        set_large_size_in(&map, p, size);
        assert_eq!(map.get(p), 26);
        assert_eq!(map.get(p + SUPERSLAB_SIZE), 88);
        assert_eq!(map.get(p + 2 * SUPERSLAB_SIZE), 89);
        assert_eq!(map.get(p + 3 * SUPERSLAB_SIZE), 89);
        clear_large_size_in(&map, p, size);
        for i in 0..(bits::next_pow2(size) >> SUPERSLAB_BITS) {
            assert_eq!(map.get(p + (i << SUPERSLAB_BITS)), PM_NOT_OURS);
        }
    }

    #[test]
    fn redirect_runs_double() {
        let map = PagemapTrie::new();
        let p = addr(256);
        let size = 1 << 28; // 16 superslabs
        set_large_size_in(&map, p, size);
        assert_eq!(map.get(p), 28);
        let mut expected = vec![];
        for i in 0..4usize {
            for _ in 0..(1 << i) {
                expected.push((PM_REDIRECT_BASE as usize + i + SUPERSLAB_BITS) as u8);
            }
        }
        for (k, want) in expected.iter().enumerate() {
            assert_eq!(map.get(p + ((k + 1) << SUPERSLAB_BITS)), *want);
        }
        clear_large_size_in(&map, p, size);
        assert_eq!(map.get(p + (5 << SUPERSLAB_BITS)), PM_NOT_OURS);
    }
}
