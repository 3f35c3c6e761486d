//! The memory provider: where superslab-sized and larger chunks come from.
//!
//! The allocator only ever asks for aligned power-of-two regions and hands
//! back decommit/recommit hints; everything else about address-space policy
//! lives behind this trait.

use crate::util::constants::OS_PAGE_SIZE;
use crate::util::memory::RawMemory;
use crate::util::Address;

pub trait MemoryProvider: 'static {
    /// Reserve and commit `size` bytes aligned to `align`, or `None` if the
    /// address space is exhausted. Must be callable from any thread.
    fn reserve(&self, size: usize, align: usize) -> Option<Address>;

    /// Hint that `[p, p + len)` no longer needs its backing pages.
    fn notify_not_using(&self, p: Address, len: usize);

    /// Hint that `[p, p + len)` is about to be touched again.
    fn notify_using(&self, p: Address, len: usize);
}

/// Anonymous virtual memory from the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct VirtualProvider;

impl MemoryProvider for VirtualProvider {
    #[cfg(not(feature = "sbrk"))]
    fn reserve(&self, size: usize, align: usize) -> Option<Address> {
        debug_assert!(align.is_power_of_two() && align >= OS_PAGE_SIZE);
        debug_assert!(size % OS_PAGE_SIZE == 0);
        // Over-reserve, then trim down to an aligned window.
        let total = size + align;
        let raw = RawMemory::map_anonymous(total).ok()?;
        let start = raw.align_up(align);
        let head = start - raw;
        if head > 0 {
            RawMemory::unmap(raw, head);
        }
        let tail = align - head;
        if tail > 0 {
            RawMemory::unmap(start + size, tail);
        }
        Some(start)
    }

    #[cfg(feature = "sbrk")]
    fn reserve(&self, size: usize, align: usize) -> Option<Address> {
        debug_assert!(align.is_power_of_two() && align >= OS_PAGE_SIZE);
        debug_assert!(size % OS_PAGE_SIZE == 0);
        let current = unsafe { libc::sbrk(0) };
        if current as isize == -1 {
            return None;
        }
        let start = Address::from(current).align_up(align);
        let grow = (start - Address::from(current)) + size;
        let previous = unsafe { libc::sbrk(grow as _) };
        if previous as isize == -1 {
            return None;
        }
        debug_assert_eq!(Address::from(previous), Address::from(current));
        Some(start)
    }

    fn notify_not_using(&self, p: Address, len: usize) {
        RawMemory::decommit(p, len);
    }

    fn notify_using(&self, p: Address, len: usize) {
        RawMemory::commit(p, len);
    }
}
