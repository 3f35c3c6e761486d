//! Bump arena for crate-internal metadata.
//!
//! Remote endpoints and page-map trie leaves live here: they must outlive any
//! allocator and must not come from the allocator itself. Memory is never
//! returned, and every chunk is a fresh anonymous mapping, so allocations are
//! always zero-filled.

use std::alloc::Layout;

use spin::Mutex;

use super::constants::OS_PAGE_SIZE;
use super::memory::RawMemory;
use super::Address;

#[derive(Debug)]
pub(crate) struct AllocationArea {
    pub top: Address,
    pub limit: Address,
}

impl AllocationArea {
    pub const EMPTY: Self = Self {
        top: Address::ZERO,
        limit: Address::ZERO,
    };

    pub fn alloc(&mut self, layout: Layout) -> Option<Address> {
        let start = self.top.align_up(layout.align());
        let end = start + layout.size();
        if end.as_usize() <= self.limit.as_usize() {
            self.top = end;
            Some(start)
        } else {
            None
        }
    }
}

static META_BUFFER: Mutex<AllocationArea> = Mutex::new(AllocationArea::EMPTY);

const META_CHUNK: usize = 16 * OS_PAGE_SIZE;

pub(crate) fn meta_alloc(layout: Layout) -> Address {
    debug_assert!(layout.size() <= META_CHUNK);
    let mut buffer = META_BUFFER.lock();
    if let Some(a) = buffer.alloc(layout) {
        return a;
    }
    let top = RawMemory::map_anonymous(META_CHUNK)
        .unwrap_or_else(|_| crate::log::fatal("Out of metadata memory"));
    *buffer = AllocationArea {
        top,
        limit: top + META_CHUNK,
    };
    buffer.alloc(layout).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_allocations_are_aligned_and_zeroed() {
        let a = meta_alloc(Layout::from_size_align(256, 64).unwrap());
        assert!(a.is_aligned_to(64));
        for i in 0..256 {
            assert_eq!(unsafe { (a + i).load::<u8>() }, 0);
        }
        let b = meta_alloc(Layout::from_size_align(16, 8).unwrap());
        assert_ne!(a, b);
    }
}
