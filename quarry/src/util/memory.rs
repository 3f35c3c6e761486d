use super::constants::OS_PAGE_SIZE;
use super::Address;

#[derive(Debug)]
pub struct MemoryMapError;

pub struct RawMemory {
    _private: (),
}

impl RawMemory {
    pub fn map_anonymous(size: usize) -> Result<Address, MemoryMapError> {
        debug_assert!(
            (size & (OS_PAGE_SIZE - 1)) == 0,
            "mmap size is not page aligned"
        );
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            Err(MemoryMapError)
        } else {
            Ok(ptr.into())
        }
    }

    pub fn unmap(start: Address, size: usize) {
        debug_assert!(
            (size & (OS_PAGE_SIZE - 1)) == 0,
            "munmap size is not page aligned"
        );
        unsafe {
            libc::munmap(start.as_mut_ptr(), size);
        }
    }

    /// Hint that the pages backing `[start, start + size)` may be reclaimed.
    pub fn decommit(start: Address, size: usize) {
        debug_assert!(start.is_aligned_to(OS_PAGE_SIZE));
        debug_assert!((size & (OS_PAGE_SIZE - 1)) == 0);
        #[cfg(target_os = "linux")]
        const ADVICE: libc::c_int = libc::MADV_DONTNEED;
        #[cfg(target_os = "macos")]
        const ADVICE: libc::c_int = libc::MADV_FREE;
        unsafe {
            libc::madvise(start.as_mut_ptr(), size, ADVICE);
        }
    }

    /// Hint that the pages backing `[start, start + size)` are about to be used.
    pub fn commit(start: Address, size: usize) {
        debug_assert!(start.is_aligned_to(OS_PAGE_SIZE));
        debug_assert!((size & (OS_PAGE_SIZE - 1)) == 0);
        unsafe {
            libc::madvise(start.as_mut_ptr(), size, libc::MADV_WILLNEED);
        }
    }
}
