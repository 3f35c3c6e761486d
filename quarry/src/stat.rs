//! Allocation statistics.
//!
//! Two layers: per-allocator [`Stats`] are plain single-threaded counters and
//! are always on; the global [`Counter`] registry aggregates across the
//! process and only counts when the `stat` feature is enabled.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;

/// Per-allocator counters, owned by the large allocator.
#[derive(Debug, Default)]
pub struct Stats {
    allocs: usize,
    deallocs: usize,
    requested_bytes: usize,
    slab_allocs: usize,
    slab_deallocs: usize,
    large_allocs: usize,
    large_deallocs: usize,
    remote_frees: usize,
    remote_receives: usize,
    remote_posts: usize,
    superslab_pops: usize,
    superslab_pushes: usize,
}

impl Stats {
    pub const fn new() -> Self {
        Self {
            allocs: 0,
            deallocs: 0,
            requested_bytes: 0,
            slab_allocs: 0,
            slab_deallocs: 0,
            large_allocs: 0,
            large_deallocs: 0,
            remote_frees: 0,
            remote_receives: 0,
            remote_posts: 0,
            superslab_pops: 0,
            superslab_pushes: 0,
        }
    }

    pub(crate) fn alloc_request(&mut self, size: usize) {
        self.requested_bytes += size;
    }

    pub(crate) fn sizeclass_alloc(&mut self, _sizeclass: u8) {
        self.allocs += 1;
    }

    pub(crate) fn sizeclass_dealloc(&mut self, _sizeclass: u8) {
        self.deallocs += 1;
    }

    pub(crate) fn sizeclass_alloc_slab(&mut self, _sizeclass: u8) {
        self.slab_allocs += 1;
    }

    pub(crate) fn sizeclass_dealloc_slab(&mut self, _sizeclass: u8) {
        self.slab_deallocs += 1;
    }

    pub(crate) fn large_alloc(&mut self, _large_class: usize) {
        self.allocs += 1;
        self.large_allocs += 1;
    }

    pub(crate) fn large_dealloc(&mut self, _large_class: usize) {
        self.deallocs += 1;
        self.large_deallocs += 1;
    }

    pub(crate) fn remote_free(&mut self, _sizeclass: u8) {
        self.deallocs += 1;
        self.remote_frees += 1;
    }

    pub(crate) fn remote_receive(&mut self, _sizeclass: u8) {
        self.remote_receives += 1;
    }

    pub(crate) fn remote_post(&mut self) {
        self.remote_posts += 1;
    }

    pub(crate) fn superslab_pop(&mut self) {
        self.superslab_pops += 1;
    }

    pub(crate) fn superslab_push(&mut self) {
        self.superslab_pushes += 1;
    }

    pub fn allocs(&self) -> usize {
        self.allocs
    }

    pub fn deallocs(&self) -> usize {
        self.deallocs
    }

    pub fn requested_bytes(&self) -> usize {
        self.requested_bytes
    }

    pub fn remote_frees(&self) -> usize {
        self.remote_frees
    }

    pub fn remote_receives(&self) -> usize {
        self.remote_receives
    }

    pub fn remote_posts(&self) -> usize {
        self.remote_posts
    }

    pub fn superslab_pops(&self) -> usize {
        self.superslab_pops
    }

    pub fn superslab_pushes(&self) -> usize {
        self.superslab_pushes
    }
}

static COUNTERS: SegQueue<&'static Counter> = SegQueue::new();

static TOTAL_ALLOCATIONS: Counter = Counter::new("total-allocations");
static TOTAL_DEALLOCATIONS: Counter = Counter::new("total-deallocations");
static LARGE_ALLOCATIONS: Counter = Counter::new("large-allocations");
static LARGE_DEALLOCATIONS: Counter = Counter::new("large-deallocations");

#[inline(always)]
pub fn run(block: impl Fn()) {
    if cfg!(not(feature = "stat")) {
        return;
    }
    block()
}

#[inline(always)]
pub fn track_allocation(size: usize, is_large: bool) {
    run(|| {
        let _ = size;
        if is_large {
            LARGE_ALLOCATIONS.inc(1);
        }
        TOTAL_ALLOCATIONS.inc(1);
    })
}

#[inline(always)]
pub fn track_deallocation(is_large: bool) {
    run(|| {
        if is_large {
            LARGE_DEALLOCATIONS.inc(1);
        }
        TOTAL_DEALLOCATIONS.inc(1);
    })
}

pub struct Counter {
    name: &'static str,
    value: AtomicUsize,
    registered: AtomicBool,
}

impl Counter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicUsize::new(0),
            registered: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    pub fn inc(&'static self, delta: usize) {
        assert!(cfg!(feature = "stat"));
        if !self.registered.swap(true, Ordering::Relaxed) {
            COUNTERS.push(self);
        }
        self.value.fetch_add(delta, Ordering::SeqCst);
    }

    #[inline(always)]
    pub fn get(&self) -> usize {
        assert!(cfg!(feature = "stat"));
        self.value.load(Ordering::SeqCst)
    }
}

/// Print every counter that saw traffic.
pub fn report() {
    while let Some(c) = COUNTERS.pop() {
        crate::println!("{}: {}", c.name, c.get());
    }
}

#[cfg(all(test, feature = "stat"))]
mod tests {
    use super::*;

    #[test]
    fn counters_register_on_first_use() {
        track_allocation(32, false);
        track_allocation(64 << 20, true);
        assert!(TOTAL_ALLOCATIONS.get() >= 2);
        assert!(LARGE_ALLOCATIONS.get() >= 1);
    }
}
