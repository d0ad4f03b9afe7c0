//! Region based slab allocator embedded in the very memory it manages.
//!
//! A [`Region`] is one page aligned, fixed size byte range supplied by the
//! embedder, typically a shared memory mapping. All allocator state (page
//! bitmaps, slab headers, free lists) lives inside that range, and every
//! internal reference is a self-relative [`Offset`] rather than an address.
//! That buys the one property everything here is built around: the mapping
//! can be cloned copy-on-write or remapped at another base and the clone is
//! a fully working allocator without a single fixup, which makes regions a
//! natural store for database-like artifacts (a DNS zone, say) that want
//! cheap snapshots.
//!
//! Small objects (up to 256 bytes) are served from per-size-class caches
//! built on the slab design from Bonwick's "The Slab Allocator: An
//! Object-Caching Kernel Memory Allocator" (USENIX Summer 1994). Larger
//! objects are reserved for a page granular heap at the tail of the region,
//! which does not exist yet; asking for more than 256 bytes fails.
//!
//! ```no_run
//! use std::ptr;
//!
//! use cowslab::{Region, SharedMemory};
//!
//! let shm = SharedMemory::create(20 * 4096).unwrap();
//! let view = shm.map_shared().unwrap();
//!
//! unsafe {
//!     let region = Region::init(view.address(), view.len()).unwrap().as_mut();
//!
//!     let object = region.alloc(7);
//!     assert!(!object.is_null());
//!     ptr::copy_nonoverlapping(b"foobar\0".as_ptr(), region.swizzle(object).as_ptr(), 7);
//!
//!     // A copy-on-write clone of the mapping is a region of its own.
//!     let cloned = shm.map_private().unwrap();
//!     let clone = cloned.address().cast::<cowslab::Region>().as_mut();
//!     assert!(clone.is_object(object));
//!     clone.free(object);
//! }
//! ```
//!
//! The region is single writer: nothing in here locks, the embedder
//! serializes mutations. And it never grows; to resize, the embedder maps a
//! larger range, initializes a new region and copies data over (offsets do
//! not survive that, unlike remapping).

use std::ptr::NonNull;

mod bitmap;
mod cache;
mod class;
mod offset;
mod pages;
mod platform;
mod region;
mod slab;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use offset::Offset;
pub use region::Region;

#[cfg(unix)]
#[cfg(not(miri))]
pub use platform::{SharedMemory, View};
