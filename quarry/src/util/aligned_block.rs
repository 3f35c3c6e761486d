//! Handle types for naturally-aligned memory regions.
//!
//! A handle is a `Copy` wrapper around the region's base address. Regions with
//! a header dereference to it; the header occupies the region's first bytes.

#[macro_export]
macro_rules! aligned_block {
    ($(#[$attr:meta])* $vis:vis struct $name:ident, log_bytes = $log:expr, header = $header:ty) => {
        $crate::aligned_block!($(#[$attr])* $vis struct $name, log_bytes = $log);

        impl $name {
            pub const HEADER_BYTES: usize = std::mem::size_of::<$header>();
        }

        impl std::ops::Deref for $name {
            type Target = $header;

            #[inline(always)]
            fn deref(&self) -> &Self::Target {
                unsafe { &*self.start().as_ptr() }
            }
        }

        impl std::ops::DerefMut for $name {
            #[inline(always)]
            fn deref_mut(&mut self) -> &mut Self::Target {
                unsafe { &mut *self.start().as_mut_ptr() }
            }
        }
    };
    ($(#[$attr:meta])* $vis:vis struct $name:ident, log_bytes = $log:expr) => {
        $(#[$attr])*
        #[repr(transparent)]
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        $vis struct $name(std::num::NonZeroUsize);

        impl $name {
            pub const LOG_BYTES: usize = $log;
            pub const BYTES: usize = 1 << Self::LOG_BYTES;
            pub const MASK: usize = Self::BYTES - 1;

            #[inline(always)]
            pub fn new(address: $crate::util::Address) -> Self {
                debug_assert!(!address.is_zero());
                debug_assert!(Self::is_aligned(address));
                Self(unsafe { std::num::NonZeroUsize::new_unchecked(address.as_usize()) })
            }

            #[inline(always)]
            pub const fn start(&self) -> $crate::util::Address {
                $crate::util::Address::from_usize(self.0.get())
            }

            #[inline(always)]
            pub fn end(&self) -> $crate::util::Address {
                self.start() + Self::BYTES
            }

            #[inline(always)]
            pub fn align(address: $crate::util::Address) -> $crate::util::Address {
                address.align_down(Self::BYTES)
            }

            #[inline(always)]
            pub fn containing(address: $crate::util::Address) -> Self {
                Self::new(Self::align(address))
            }

            #[inline(always)]
            pub fn is_aligned(address: $crate::util::Address) -> bool {
                address.is_aligned_to(Self::BYTES)
            }
        }

        unsafe impl Send for $name {}
        unsafe impl Sync for $name {}

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({:?})"), self.start())
            }
        }
    };
}
