use std::{mem, ptr, ptr::NonNull};

use crate::{
    bitmap::Bitmap,
    cache::{self, Cache},
    class,
    offset::{self, Offset},
    slab::Slab,
};

/// Size of the unit the underlying mapping is carved into. This is part of
/// the mapped format (bitmaps have one bit per page, slabs span exactly one
/// page), not the hardware page size, although they usually coincide. For
/// caches of large objects a bigger virtual page would waste less space per
/// slab.
pub(crate) const PAGE_SIZE: u64 = 4096;

/// Mask that rounds an offset down to its page boundary.
pub(crate) const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// Capacity of the fixed cache table. Six slots serve the size classes of
/// [`crate::class`]; the rest are reserved for caches of named object types.
pub(crate) const MAX_CACHES: usize = 20;

/// Heap bookkeeping. Only the page bitmap exists so far; the best fit free
/// list for large objects will join it.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct Heap {
    /// Pages in use as heap data, one bit per region page.
    pub bitmap: Bitmap,
}

/// The fixed cache table and the bitmap of pages in use as slabs.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct Caches {
    /// Pages in use as slabs, one bit per region page.
    pub bitmap: Bitmap,
    /// Number of records in use.
    pub count: u64,
    pub records: [Cache; MAX_CACHES],
}

/// A region is one contiguous, page aligned byte range supplied by the
/// embedder, with the allocator embedded in it. This header sits at offset 0
/// and every structure it refers to is addressed by offset, so the region is
/// oblivious to where it is mapped:
///
/// ```text
///             +--------------------------+ offset 0
///             | Region header            |
///             |   cache table            |
///             |   page bitmaps           |  <- here while the region is
///  pages ->   +--------------------------+     small, else at the tail
///             | slab | slab | slab | ... |  <- grows upward
///             |                          |
///             |        free pages        |
///             |                          |
///             | ... heap (reserved tail) |  <- large objects, grows downward
///             +--------------------------+ offset size
/// ```
///
/// Because no absolute address is ever stored, the kernel can duplicate the
/// mapping copy-on-write and the duplicate is a working allocator the moment
/// it exists: a writer clones the region private, mutates it, and copies the
/// dirty pages back on commit, while readers keep the shared mapping. The
/// flip side is that the region cannot grow; when it fills up the embedder
/// maps a larger range and rebuilds into it.
///
/// There is no synchronization anywhere. One writer at a time, by contract.
#[derive(Debug)]
#[repr(C)]
pub struct Region {
    /// Total size of the region in bytes, including this header.
    pub(crate) size: u64,
    /// Offset of the first data page.
    pub(crate) pages: Offset,
    /// A page known to be free, or null once the region is full. Kept one
    /// step ahead by the page manager.
    pub(crate) free_page: Offset,
    pub(crate) heap: Heap,
    pub(crate) caches: Caches,
}

const _: () = assert!(mem::size_of::<Region>() as u64 <= PAGE_SIZE);

impl Region {
    /// Formats `size` bytes at `address` as an empty region and returns the
    /// header, which lives at `address` itself. Returns `None` when the
    /// range cannot hold a region: `address` not page aligned, `size` not a
    /// multiple of the page size, or too few pages left for data after the
    /// header, the bitmaps and one slab per size class.
    ///
    /// The bitmaps need one bit per page. While two bitmaps fit in the slack
    /// of the header page they are packed against its high end (heap bitmap
    /// below the slab bitmap); for larger regions whole pages are reserved
    /// at the tail instead, one span per bitmap, and those pages are marked
    /// in the heap bitmap so the page manager skips them.
    ///
    /// # Safety
    ///
    /// `address` must be valid for reads and writes of `size` bytes, with
    /// exclusive access, and must stay mapped for as long as the returned
    /// header (and anything swizzled out of it) is in use.
    pub unsafe fn init(address: NonNull<u8>, size: usize) -> Option<NonNull<Region>> {
        let size = size as u64;

        if address.as_ptr() as usize as u64 & !PAGE_MASK != 0 {
            return None;
        }

        let pages = (mem::size_of::<Region>() as u64).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let classes = class::CLASSES.len() as u64;
        let size_pages = size / PAGE_SIZE;

        if size & !PAGE_MASK != 0 || size < pages || size_pages <= classes {
            return None;
        }

        // The header page must not inherit stale bytes from whatever the
        // mapping held before; everything below assumes zeroed ground.
        ptr::write_bytes(address.as_ptr(), 0, pages as usize);

        let base = address;
        let mut region = address.cast::<Region>();
        let r = region.as_mut();

        // One bit per page, rounded up to a multiple of 8.
        let bitmap_size = (size_pages + 7) & !7;
        let slack = (PAGE_SIZE - mem::size_of::<Region>() as u64) / 2;

        if bitmap_size <= slack {
            r.heap.bitmap.bits = Offset::new(PAGE_SIZE - 2 * bitmap_size);
            r.caches.bitmap.bits = Offset::new(PAGE_SIZE - bitmap_size);
        } else {
            let bitmap_pages = bitmap_size.div_ceil(PAGE_SIZE);
            if pages / PAGE_SIZE + 2 * bitmap_pages + classes >= size_pages {
                return None;
            }
            r.heap.bitmap.bits = Offset::new(size - 2 * bitmap_pages * PAGE_SIZE);
            r.caches.bitmap.bits = Offset::new(size - bitmap_pages * PAGE_SIZE);
            ptr::write_bytes(
                offset::swizzle(base, r.heap.bitmap.bits).as_ptr(),
                0,
                (2 * bitmap_pages * PAGE_SIZE) as usize,
            );
        }
        r.heap.bitmap.size = bitmap_size;
        r.caches.bitmap.size = bitmap_size;

        r.size = size;
        r.pages = Offset::new(pages);
        r.free_page = Offset::new(pages);
        r.caches.count = 0;

        for entry in &class::CLASSES {
            let index = r.caches.count as usize;
            r.caches.count += 1;
            r.caches.records[index].init(entry.name, entry.size, entry.align);
        }

        // The tail pages holding the bitmaps are in use by bookkeeping, not
        // free. Marking them in the heap bitmap keeps them away from the
        // page manager; they are never in the slab bitmap, so they cannot
        // pass for objects either.
        if bitmap_size > slack {
            let bitmap_pages = bitmap_size.div_ceil(PAGE_SIZE);
            for page in (size_pages - 2 * bitmap_pages)..size_pages {
                r.heap.bitmap.set(base, page as usize);
            }
        }

        Some(region)
    }

    /// Allocates `size` bytes and returns the offset of the new object, or
    /// [`Offset::NULL`] when `size` is 0, larger than the largest size class
    /// (no heap allocator yet), or the region is out of pages. The object is
    /// 8 byte aligned and opaque until freed; write to it through
    /// [`Region::swizzle`].
    ///
    /// # Safety
    ///
    /// Requires exclusive access to the region.
    pub unsafe fn alloc(&mut self, size: usize) -> Offset {
        if size == 0 || size > class::SMALL_OBJECT_MAX {
            return Offset::NULL;
        }

        cache::allocate_object(NonNull::from(self), class::class_of(size))
    }

    /// Releases an object previously returned by [`Region::alloc`]. Offsets
    /// that cannot be an object (out of the data range, misaligned, or on a
    /// page that holds no slab) are ignored, so freeing the null offset is a
    /// no-op. Freeing a live-looking offset twice is fatal.
    ///
    /// # Safety
    ///
    /// Requires exclusive access to the region. `object` must not be used
    /// again after this call.
    pub unsafe fn free(&mut self, object: Offset) {
        if !self.is_object(object) {
            return;
        }

        let index = self.cache_index(object);
        cache::free_object(NonNull::from(self), index, object);
    }

    /// Whether `object` can be an allocated object: inside the data range, 8
    /// byte aligned and on a page tracked as a slab.
    pub fn is_object(&self, object: Offset) -> bool {
        if object <= self.pages || object.get() >= self.size {
            return false;
        }
        if object.get() & 0x7 != 0 {
            return false;
        }

        let bit = (object.get() / PAGE_SIZE) as usize;
        // Reading the bitmap stays within the mapping `init` was given.
        unsafe { self.caches.bitmap.get(NonNull::from(self).cast(), bit) }
    }

    /// Pins `object` to a process-local address against this mapping of the
    /// region. The address is good until the region is unmapped; it does not
    /// survive remapping, the offset does.
    pub fn swizzle(&self, object: Offset) -> NonNull<u8> {
        debug_assert!(object.get() < self.size, "offset outside the region");
        unsafe { offset::swizzle(NonNull::from(self).cast(), object) }
    }

    /// Translates an address inside this mapping of the region back to the
    /// offset that stays valid across remapping.
    pub fn unswizzle(&self, address: NonNull<u8>) -> Offset {
        let object = unsafe { offset::unswizzle(NonNull::from(self).cast(), address) };
        debug_assert!(object.get() < self.size, "address outside the region");
        object
    }

    /// Index of the cache that owns `object`, recovered from the header of
    /// the slab at the top of the object's page. Fatal if that header does
    /// not point back into the cache table.
    unsafe fn cache_index(&self, object: Offset) -> usize {
        let base = NonNull::from(self).cast::<u8>();
        let slab = offset::swizzle_as::<Slab>(base, object.page()).as_ref();
        let first = offset::offset_of(base, &self.caches.records[0]);

        assert!(slab.cache >= first, "slab cache offset below the cache table");
        let delta = (slab.cache.get() - first.get()) as usize;
        assert_eq!(delta % mem::size_of::<Cache>(), 0, "slab cache offset misaligned");

        let index = delta / mem::size_of::<Cache>();
        assert!(index < self.caches.count as usize, "slab cache index out of range");
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{platform, slab::SLAB_HEADER_SIZE};

    /// A fresh region over an anonymous mapping, unmapped on drop.
    struct TestRegion {
        address: NonNull<u8>,
        length: usize,
        region: NonNull<Region>,
    }

    impl TestRegion {
        fn with_pages(pages: usize) -> Self {
            let length = pages * PAGE_SIZE as usize;
            unsafe {
                let address = platform::request_memory(length).unwrap();
                let region = Region::init(address, length).unwrap();
                TestRegion { address, length, region }
            }
        }

        fn region(&mut self) -> &mut Region {
            unsafe { self.region.as_mut() }
        }
    }

    impl Drop for TestRegion {
        fn drop(&mut self) {
            unsafe { platform::return_memory(self.address, self.length) };
        }
    }

    #[test]
    fn write_and_read_back() {
        let mut mapping = TestRegion::with_pages(20);
        let region = mapping.region();

        unsafe {
            let object = region.alloc(7);
            assert!(!object.is_null());
            assert!(region.is_object(object));

            let address = region.swizzle(object);
            ptr::copy_nonoverlapping(b"foobar\0".as_ptr(), address.as_ptr(), 7);

            let mut copy = [0u8; 7];
            ptr::copy_nonoverlapping(address.as_ptr(), copy.as_mut_ptr(), 7);
            assert_eq!(&copy, b"foobar\0");

            // The round trip through swizzle ends at the same offset.
            assert_eq!(region.unswizzle(address), object);
        }
    }

    #[test]
    fn freed_object_is_reused_first() {
        let mut mapping = TestRegion::with_pages(20);
        let region = mapping.region();

        unsafe {
            let first = region.alloc(7);
            assert!(!first.is_null());
            region.free(first);

            // Free cells come back in LIFO order, so the very next
            // allocation of the same class lands on the same cell.
            let second = region.alloc(7);
            assert_eq!(second, first);
        }
    }

    #[test]
    fn allocates_exactly_the_available_capacity() {
        let mut mapping = TestRegion::with_pages(20);
        let region = mapping.region();

        // 20 pages minus the header page, each fitting as many 256 byte
        // cells as a slab holds.
        let per_slab = (PAGE_SIZE - SLAB_HEADER_SIZE as u64) / 256;
        let expected = per_slab * 19;

        unsafe {
            let mut last = Offset::NULL;
            let mut allocated = 0u64;
            loop {
                let object = region.alloc(256);
                if object.is_null() {
                    break;
                }

                // Every returned offset is a well formed object.
                assert!(region.is_object(object));
                assert_eq!(object.get() % 8, 0);
                assert!(object.get() + 256 <= region.size);

                last = object;
                allocated += 1;
                assert!(allocated <= expected, "allocated past region capacity");
            }
            assert_eq!(allocated, expected);

            // Out of pages means every class is out of luck, not just the
            // one that drained the region.
            assert!(region.alloc(8).is_null());

            // Until something is freed.
            region.free(last);
            assert_eq!(region.alloc(256), last);
        }
    }

    #[test]
    fn sizes_get_at_least_what_they_asked_for() {
        let mut mapping = TestRegion::with_pages(64);
        let region = mapping.region();

        unsafe {
            for size in 1..=class::SMALL_OBJECT_MAX {
                let object = region.alloc(size);
                assert!(!object.is_null());
                assert_eq!(object.get() % 8, 0, "object for size {size} misaligned");

                // Writing `size` bytes must stay inside the cell; stomped
                // free list links would trip the scans of later frees.
                let address = region.swizzle(object);
                ptr::write_bytes(address.as_ptr(), 0xAB, size);
            }

            // The free list links survived all those writes.
            let probe = region.alloc(8);
            assert!(region.is_object(probe));
        }
    }

    #[test]
    fn offsets_survive_rebasing() {
        let mut mapping = TestRegion::with_pages(20);
        let length = mapping.length;
        let region = mapping.region();

        let mut objects = Vec::new();
        unsafe {
            for (size, fill) in [(8usize, 0x11u8), (16, 0x22), (64, 0x33), (200, 0x44)] {
                let object = region.alloc(size);
                assert!(!object.is_null());
                ptr::write_bytes(region.swizzle(object).as_ptr(), fill, size);
                objects.push((object, size, fill));
            }

            // Byte copy the whole region somewhere else, which is what a
            // copy-on-write clone amounts to.
            let copy = platform::request_memory(length).unwrap();
            ptr::copy_nonoverlapping(mapping.address.as_ptr(), copy.as_ptr(), length);
            let clone = copy.cast::<Region>().as_mut();

            // Every offset resolves against the new base to the same bytes.
            for (object, size, fill) in &objects {
                assert!(clone.is_object(*object));
                let address = clone.swizzle(*object);
                for i in 0..*size {
                    assert_eq!(*address.as_ptr().add(i), *fill);
                }
            }

            // The clone is a working allocator in its own right, with
            // bookkeeping detached from the original: the original still
            // sees the cell the clone just took as free and hands it out.
            let more = clone.alloc(64);
            assert!(clone.is_object(more));
            assert_eq!(mapping.region().alloc(64), more);

            platform::return_memory(copy, length);
        }
    }

    #[test]
    fn init_rejects_unusable_ranges() {
        let length = 20 * PAGE_SIZE as usize;
        unsafe {
            let address = platform::request_memory(length).unwrap();

            // Not page aligned.
            let unaligned = NonNull::new(address.as_ptr().add(8)).unwrap();
            assert!(Region::init(unaligned, PAGE_SIZE as usize * 19).is_none());

            // Not a multiple of the page size.
            assert!(Region::init(address, length - 123).is_none());

            // Too small: the data pages must outnumber the size classes.
            assert!(Region::init(address, 0).is_none());
            assert!(Region::init(address, PAGE_SIZE as usize).is_none());
            assert!(Region::init(address, 6 * PAGE_SIZE as usize).is_none());

            // The smallest workable region.
            assert!(Region::init(address, 7 * PAGE_SIZE as usize).is_some());

            platform::return_memory(address, length);
        }
    }

    #[test]
    fn invalid_free_is_ignored() {
        let mut mapping = TestRegion::with_pages(20);
        let region = mapping.region();

        unsafe {
            let object = region.alloc(32);

            // None of these can be objects: the null sentinel, offsets into
            // the header, a misaligned offset, a free page, offsets at or
            // past the end.
            for bogus in [
                Offset::NULL,
                Offset::new(64),
                Offset::new(PAGE_SIZE),
                Offset::new(object.get() + 1),
                Offset::new(5 * PAGE_SIZE),
                Offset::new(region.size),
                Offset::new(region.size + PAGE_SIZE),
            ] {
                assert!(!region.is_object(bogus));
                region.free(bogus);
            }

            // The one real object is still alive and freeable.
            assert!(region.is_object(object));
            region.free(object);
            assert_eq!(region.alloc(32), object);
        }
    }

    #[test]
    fn large_region_moves_bitmaps_to_the_tail() {
        // 2048 pages demand more bitmap bytes than the header page has
        // slack for, forcing both bitmaps into reserved tail pages.
        let mut mapping = TestRegion::with_pages(2048);
        let region = mapping.region();
        let size = region.size;

        assert_eq!(region.heap.bitmap.bits, Offset::new(size - 2 * PAGE_SIZE));
        assert_eq!(region.caches.bitmap.bits, Offset::new(size - PAGE_SIZE));

        unsafe {
            // The tail pages are reserved, so nothing in them is an object
            // and the region serves exactly the remaining data pages.
            let per_slab = (PAGE_SIZE - SLAB_HEADER_SIZE as u64) / 256;
            let expected = per_slab * (2048 - 1 - 2);

            let mut allocated = 0u64;
            loop {
                let object = region.alloc(256);
                if object.is_null() {
                    break;
                }
                assert!(
                    object.get() < size - 2 * PAGE_SIZE,
                    "object {object:?} landed on a bitmap page"
                );
                allocated += 1;
            }
            assert_eq!(allocated, expected);

            assert!(!region.is_object(Offset::new(size - 2 * PAGE_SIZE + 8)));
            assert!(!region.is_object(Offset::new(size - PAGE_SIZE + 8)));
        }
    }
}
