//! Superslab lifecycle, tier routing of unsized frees, and block-boundary
//! properties across the three tiers.

use quarry::superslab::{Superslab, SuperslabStatus};
use quarry::util::constants::{SLAB_SIZE, SUPERSLAB_SIZE};
use quarry::{Allocator, Boundary, PagemapAdaptor, SuperslabMap};

// One block of this size fills a whole slab, so 16 allocations exhaust a
// superslab's 15 ordinary slabs plus the short one.
const SLAB_FILLER: usize = 900_000;

#[test]
fn superslab_state_machine() {
    let mut alloc = Allocator::new();
    let map = SuperslabMap;

    let first = alloc.alloc(SLAB_FILLER).unwrap();
    let superslab = Superslab::containing(first);
    assert_eq!(map.get(superslab.start()), 1);
    assert_eq!(superslab.get_status(), SuperslabStatus::Available);

    let mut blocks = vec![first];
    for i in 1..16 {
        blocks.push(alloc.alloc(SLAB_FILLER).unwrap());
        assert_eq!(Superslab::containing(blocks[i]), superslab);
        let expected = match i {
            0..=13 => SuperslabStatus::Available,
            14 => SuperslabStatus::OnlyShortSlabAvailable,
            _ => SuperslabStatus::Full,
        };
        assert_eq!(superslab.get_status(), expected, "after allocation {}", i);
    }
    // The 16th block came from the short slab at the superslab's start.
    assert_eq!(blocks[15].align_down(SLAB_SIZE), superslab.start());

    // Free the short-slab block: Full -> OnlyShortSlabAvailable.
    alloc.dealloc(blocks.pop().unwrap());
    assert_eq!(
        superslab.get_status(),
        SuperslabStatus::OnlyShortSlabAvailable
    );

    // Free one ordinary block: -> Available.
    alloc.dealloc(blocks.pop().unwrap());
    assert_eq!(superslab.get_status(), SuperslabStatus::Available);

    // Free the rest: the superslab empties and goes back to the large
    // allocator exactly once, and its page-map entry is cleared.
    for p in blocks.drain(..) {
        alloc.dealloc(p);
    }
    assert_eq!(alloc.stats().superslab_pushes(), 1);
    assert_eq!(map.get(superslab.start()), 0);

    // The next allocation pulls the same superslab back out of the cache.
    let again = alloc.alloc(SLAB_FILLER).unwrap();
    assert_eq!(Superslab::containing(again), superslab);
    assert_eq!(alloc.stats().superslab_pops(), 2);
    alloc.dealloc(again);
}

#[test]
fn smallest_class_fills_one_slab_before_the_next() {
    let mut alloc = Allocator::new();
    let per_slab = SLAB_SIZE / 16;
    let mut blocks = Vec::with_capacity(per_slab + 1);
    for _ in 0..per_slab + 1 {
        blocks.push(alloc.alloc(16).unwrap());
    }
    let first_slab = blocks[0].align_down(SLAB_SIZE);
    for p in &blocks[..per_slab] {
        assert_eq!(p.align_down(SLAB_SIZE), first_slab);
    }
    assert_ne!(blocks[per_slab].align_down(SLAB_SIZE), first_slab);
    for p in blocks {
        alloc.dealloc_sized(p, 16);
    }
    assert_eq!(alloc.stats().allocs(), alloc.stats().deallocs());
}

#[test]
fn unsized_dealloc_routes_by_tier() {
    let mut alloc = Allocator::new();
    let map = SuperslabMap;

    let small_a = alloc.alloc(16).unwrap();
    let small_b = alloc.alloc(256).unwrap();
    let medium = alloc.alloc(2 << 20).unwrap();
    let large = alloc.alloc(20 << 20).unwrap();

    let small_base = small_a.align_down(SUPERSLAB_SIZE);
    assert_eq!(small_base, small_b.align_down(SUPERSLAB_SIZE));
    let medium_base = medium.align_down(SUPERSLAB_SIZE);
    assert_eq!(map.get(small_base), 1);
    assert_eq!(map.get(medium_base), 2);
    assert_eq!(map.get(large), 25); // 20 MiB rounds to 32 MiB

    assert_eq!(Allocator::<quarry::provider::VirtualProvider>::alloc_size(small_a), 16);
    assert_eq!(Allocator::<quarry::provider::VirtualProvider>::alloc_size(small_b), 256);
    assert_eq!(Allocator::<quarry::provider::VirtualProvider>::alloc_size(medium), 2 << 20);
    assert_eq!(Allocator::<quarry::provider::VirtualProvider>::alloc_size(large), 32 << 20);

    alloc.dealloc(small_a);
    // The superslab still carries the other small class.
    assert_eq!(map.get(small_base), 1);
    alloc.dealloc(small_b);
    assert_eq!(map.get(small_base), 0);
    alloc.dealloc(medium);
    assert_eq!(map.get(medium_base), 0);
    alloc.dealloc(large);
    for i in 0..2 {
        assert_eq!(map.get(large + (i << 24)), 0);
    }
    assert_eq!(alloc.stats().allocs(), alloc.stats().deallocs());
}

#[test]
fn block_boundaries_agree_for_interior_pointers() {
    let mut alloc = Allocator::new();
    for size in [1usize, 16, 17, 48, 64, 100, 4096, 100_000, 1 << 20, 5 << 20] {
        let p = alloc.alloc(size).unwrap();
        let rsize = Allocator::<quarry::provider::VirtualProvider>::alloc_size(p);
        assert!(rsize >= size);
        let end = p + rsize - 1;
        for q in [p, p + rsize / 2, end] {
            assert_eq!(Allocator::<quarry::provider::VirtualProvider>::external_pointer(q, Boundary::Start), p, "size {}", size);
            assert_eq!(Allocator::<quarry::provider::VirtualProvider>::external_pointer(q, Boundary::End), end, "size {}", size);
        }
        alloc.dealloc_sized(p, size);
    }
}

#[test]
fn blocks_are_aligned_to_their_class() {
    let mut alloc = Allocator::new();
    for size in [1usize, 8, 16, 24, 32, 48, 64, 80, 256, 4096, 1 << 16, 2 << 20] {
        let sizeclass = quarry::sizeclass::size_to_class(size);
        let align = quarry::sizeclass::class_alignment(sizeclass);
        let p = alloc.alloc(size).unwrap();
        assert!(p.is_aligned_to(align), "size {} align {}", size, align);
        alloc.dealloc(p);
    }
}
