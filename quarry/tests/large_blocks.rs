//! Large blocks: power-of-two rounding, page-map head and redirect entries,
//! and interior-pointer resolution.

use quarry::util::constants::{SUPERSLAB_BITS, SUPERSLAB_SIZE};
use quarry::{Allocator, Boundary, PagemapAdaptor, SuperslabMap};

#[test]
fn forty_megabyte_block_redirects() {
    let mut alloc = Allocator::new();
    let size = 40 << 20;
    let rounded = 64 << 20;

    let p = alloc.alloc(size).unwrap();
    assert!(p.is_aligned_to(SUPERSLAB_SIZE));
    assert_eq!(Allocator::<quarry::provider::VirtualProvider>::alloc_size(p), rounded);
    // The block is writable end to end.
    unsafe {
        p.store(0x5eedu64);
        (p + size - 8).store(0xfeedu64);
    }

    for q in [
        p,
        p + 1,
        p + SUPERSLAB_SIZE,
        p + SUPERSLAB_SIZE + 12345,
        p + size / 2,
        p + 3 * SUPERSLAB_SIZE,
        p + rounded - 1,
    ] {
        assert_eq!(Allocator::<quarry::provider::VirtualProvider>::external_pointer(q, Boundary::Start), p);
        assert_eq!(Allocator::<quarry::provider::VirtualProvider>::external_pointer(q, Boundary::End), p + rounded - 1);
    }

    alloc.dealloc_sized(p, size);
    let map = SuperslabMap;
    for i in 0..(rounded >> SUPERSLAB_BITS) {
        assert_eq!(map.get(p + (i << SUPERSLAB_BITS)), 0, "cell {}", i);
    }
}

#[test]
fn superslab_sized_block_is_class_zero() {
    let mut alloc = Allocator::new();
    let p = alloc.alloc(SUPERSLAB_SIZE).unwrap();
    let map = SuperslabMap;
    assert_eq!(map.get(p), SUPERSLAB_BITS as u8);
    assert_eq!(Allocator::<quarry::provider::VirtualProvider>::alloc_size(p), SUPERSLAB_SIZE);
    // Unsized free resolves the size from the page map alone.
    alloc.dealloc(p);
    assert_eq!(map.get(p), 0);
}

#[test]
fn freed_large_blocks_are_reused() {
    let mut alloc = Allocator::new();
    let size = 33 << 20; // rounds to 64 MiB
    let p = alloc.alloc(size).unwrap();
    alloc.dealloc_sized(p, size);
    let q = alloc.alloc(48 << 20).unwrap(); // same power-of-two class
    assert_eq!(q, p);
    alloc.dealloc_sized(q, 48 << 20);
}

#[test]
fn largest_medium_class_uses_one_mediumslab_per_allocation() {
    let mut alloc = Allocator::new();
    let size = 14 << 20;
    let p = alloc.alloc(size).unwrap();
    let q = alloc.alloc(size).unwrap();
    let map = SuperslabMap;
    let p_base = p.align_down(SUPERSLAB_SIZE);
    let q_base = q.align_down(SUPERSLAB_SIZE);
    assert_ne!(p_base, q_base);
    assert_eq!(map.get(p_base), 2);
    assert_eq!(map.get(q_base), 2);
    alloc.dealloc(p);
    alloc.dealloc(q);
    assert_eq!(map.get(p_base), 0);
    assert_eq!(map.get(q_base), 0);
}
