//! Steady-state behavior under randomized allocate/free churn.

use std::collections::HashSet;

use quarry::util::constants::{SLAB_SIZE, SUPERSLAB_SIZE};
use quarry::{Address, Allocator};

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

#[test]
fn single_thread_churn() {
    const POOL: usize = 10_000;
    const OPS: usize = 100_000;
    const SIZE: usize = 24;

    let mut alloc = Allocator::new();
    let rsize = quarry::sizeclass::class_to_size(quarry::sizeclass::size_to_class(SIZE));
    let mut rng = XorShift(0x9e37_79b9_7f4a_7c15);
    let mut live: Vec<Address> = Vec::with_capacity(POOL);
    let mut superslabs: HashSet<usize> = HashSet::new();

    for _ in 0..OPS {
        let free = live.len() >= POOL || (!live.is_empty() && rng.next() % 2 == 0);
        if free {
            let index = rng.next() as usize % live.len();
            let p = live.swap_remove(index);
            // The tag written at allocation must have survived.
            assert_eq!(unsafe { p.load::<u64>() }, p.as_usize() as u64);
            alloc.dealloc(p);
        } else {
            let p = alloc.alloc(SIZE).unwrap();
            assert!(Allocator::<quarry::provider::VirtualProvider>::alloc_size(p) >= SIZE);
            unsafe { p.store(p.as_usize() as u64) };
            superslabs.insert(p.align_down(SUPERSLAB_SIZE).as_usize());
            live.push(p);
        }
    }

    // The whole pool fits a handful of slabs; churn must not grow the
    // superslab footprint beyond it.
    let bound = (POOL * rsize).div_ceil(SLAB_SIZE * 15) + 1;
    assert!(
        superslabs.len() <= bound,
        "{} superslabs used, expected at most {}",
        superslabs.len(),
        bound
    );

    for p in live.drain(..) {
        alloc.dealloc(p);
    }
    assert_eq!(alloc.stats().allocs(), alloc.stats().deallocs());
}
