//! quarry: a thread-caching memory allocator core.
//!
//! Each thread owns an [`Allocator`]: a front-end over three tiers of
//! size-classed storage. Small blocks come from slabs carved out of 16 MiB
//! superslabs, medium blocks from superslab-sized single-class arenas, and
//! large blocks are power-of-two chunks cached per thread. A process-wide
//! page map resolves any pointer back to its tier and owner, and blocks freed
//! on the wrong thread travel home as batched messages over lock-free queues
//! instead of taking locks on the hot path.
//!
//! ```
//! use quarry::Allocator;
//!
//! let mut alloc = Allocator::new();
//! let p = alloc.alloc(24).unwrap();
//! assert!(Allocator::<quarry::provider::VirtualProvider>::alloc_size(p) >= 24);
//! alloc.dealloc(p);
//! ```

#[cfg(not(target_pointer_width = "64"))]
compile_error!("Only 64-bit targets are supported");

#[cfg(all(feature = "decommit-none", feature = "decommit-large"))]
compile_error!("At most one decommit strategy override may be enabled");

#[doc(hidden)]
pub mod log;

pub mod util;

pub mod alloc;
pub mod large;
pub mod mediumslab;
pub mod pagemap;
pub mod provider;
pub mod remote;
pub mod sizeclass;
pub mod stat;
pub mod superslab;

pub use alloc::{Allocator, AllocatorBuilder};
pub use pagemap::{FlatPagemap, Pagemap, PagemapAdaptor, PagemapTrie, SuperslabMap};
pub use provider::{MemoryProvider, VirtualProvider};
pub use util::constants::{AllowReserve, Boundary, DecommitStrategy, ZeroMem};
pub use util::Address;
