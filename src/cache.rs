use std::ptr::NonNull;

use crate::{
    class,
    offset::{self, swizzle_as, Offset},
    pages,
    region::{Region, PAGE_SIZE},
    slab::{self, Slab, SLAB_HEADER_SIZE},
};

/// Singly linked list of slabs, threaded through [`Slab::next`]. The head is
/// the most recently added slab, which keeps hot pages at the front.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub(crate) struct SlabList {
    pub head: Offset,
    pub count: u64,
}

/// Singly linked list of free cells, threaded through the first word of each
/// cell. See [`Slab`].
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub(crate) struct ObjectList {
    pub head: Offset,
    pub count: u64,
}

/// One object size class: the set of slabs serving objects of one aligned
/// size. Slabs are partitioned over three lists by how many of their cells
/// are taken:
///
/// ```text
///          +-------+    +------+    +------+
/// full:    | 0/505 | -> | 0/505| -> | .... |   no free cell
///          +-------+    +------+    +------+
///          +-------+    +------+
/// partial: | 17/505| -> |311/..|                some cells free
///          +-------+    +------+
///          +-------+
/// free:    |505/505|                            every cell free
///          +-------+
/// ```
///
/// Allocation prefers partial slabs so free slabs stay intact as long as
/// possible, and entirely freed slabs are kept on `free` for reuse instead
/// of going back to the page pool.
///
/// The record lives in the fixed cache table of the region header; slabs
/// refer to it (and to the list they are on) by offset.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct Cache {
    /// NUL padded cache name, truncated to 15 bytes.
    pub name: [u8; 16],
    pub full_slabs: SlabList,
    pub partial_slabs: SlabList,
    pub free_slabs: SlabList,
    /// Object size callers asked this cache to serve.
    pub object_size: u16,
    /// Boundary to align cells on, always a multiple of 8.
    pub alignment: u16,
    /// Cell size: `object_size` rounded up to `alignment`.
    pub aligned_size: u64,
    /// Number of cells that fit in one slab.
    pub object_count: u64,
}

impl Cache {
    /// Fills in a cache record for objects of `size` bytes aligned to
    /// `align`. The record is assumed to be zeroed, so the three slab lists
    /// start out empty.
    pub(crate) fn init(&mut self, name: &str, size: u16, align: u16) {
        let truncated = &name.as_bytes()[..name.len().min(self.name.len() - 1)];
        self.name[..truncated.len()].copy_from_slice(truncated);
        self.name[truncated.len()..].fill(0);

        self.object_size = size;
        self.alignment = align;
        self.aligned_size = class::aligned_size(size as u64, align as u64);
        self.object_count = (PAGE_SIZE - SLAB_HEADER_SIZE as u64) / self.aligned_size;
    }
}

/// Takes an object from cache `index`, growing the cache by one slab when
/// every existing slab is depleted. Returns [`Offset::NULL`] only when the
/// page manager is out of pages.
///
/// A slab that hands out its last cell moves to `full` before the pop, and a
/// free slab that hands out its first cell moves to `partial` (straight to
/// `full` for single cell slabs).
///
/// # Safety
///
/// `region` must point to an initialized region with exclusive access, and
/// `index` must be below the region's cache count.
pub(crate) unsafe fn allocate_object(mut region: NonNull<Region>, index: usize) -> Offset {
    let base = region.cast::<u8>();
    let r = region.as_mut();
    assert!(index < r.caches.count as usize, "cache index out of range");
    let cache = &mut r.caches.records[index];

    // Partial slabs first.
    if !cache.partial_slabs.head.is_null() {
        let slab_offset = cache.partial_slabs.head;
        let slab = swizzle_as::<Slab>(base, slab_offset).as_mut();

        if slab.free_objects.count == 1 {
            // About to hand out the last cell.
            cache.partial_slabs.head = slab.next;
            cache.partial_slabs.count -= 1;
            slab.list = offset::offset_of(base, &cache.full_slabs);
            slab.next = cache.full_slabs.head;
            cache.full_slabs.head = slab_offset;
            cache.full_slabs.count += 1;
        }

        return slab.pop_object(base);
    }

    // No partial slab. Take a free one, formatting a fresh page if the free
    // list is empty too.
    if cache.free_slabs.head.is_null() && !grow(region, index) {
        return Offset::NULL;
    }

    let cache = &mut region.as_mut().caches.records[index];
    let slab_offset = cache.free_slabs.head;
    let slab = swizzle_as::<Slab>(base, slab_offset).as_mut();

    cache.free_slabs.head = slab.next;
    cache.free_slabs.count -= 1;

    if slab.free_objects.count == 1 {
        // A single cell slab goes straight from free to full.
        slab.list = offset::offset_of(base, &cache.full_slabs);
        slab.next = cache.full_slabs.head;
        cache.full_slabs.head = slab_offset;
        cache.full_slabs.count += 1;
    } else {
        slab.list = offset::offset_of(base, &cache.partial_slabs);
        slab.next = cache.partial_slabs.head;
        cache.partial_slabs.head = slab_offset;
        cache.partial_slabs.count += 1;
    }

    slab.pop_object(base)
}

/// Returns `object` to its slab in cache `index` and rebalances the slab
/// lists: a depleted slab that regains a cell moves back to `partial`, and a
/// slab whose every cell is free again parks on `free`. Slabs on `free` keep
/// their page; reuse is preferred over returning pages to the pool.
///
/// # Safety
///
/// `region` must point to an initialized region with exclusive access, and
/// `object` must be a live object of cache `index`, as established by
/// [`Region::is_object`] and the slab's `cache` field.
pub(crate) unsafe fn free_object(mut region: NonNull<Region>, index: usize, object: Offset) {
    let base = region.cast::<u8>();
    let r = region.as_mut();
    assert!(index < r.caches.count as usize, "cache index out of range");
    let cache = &mut r.caches.records[index];

    let slab_offset = object.page();
    let slab = swizzle_as::<Slab>(base, slab_offset).as_mut();
    assert_eq!(
        slab.cache,
        offset::offset_of(base, cache),
        "object {object:?} freed into the wrong cache"
    );

    slab.push_object(base, object);

    if slab.free_objects.count == cache.object_count {
        // Every cell is free again. Unlink from full or partial, whichever
        // holds the slab, and park it for reuse.
        unlink(base, slab_offset, slab);
        slab.list = offset::offset_of(base, &cache.free_slabs);
        slab.next = cache.free_slabs.head;
        cache.free_slabs.head = slab_offset;
        cache.free_slabs.count += 1;
    } else if slab.free_objects.count == 1 {
        // First cell to come back to a depleted slab.
        unlink(base, slab_offset, slab);
        slab.list = offset::offset_of(base, &cache.partial_slabs);
        slab.next = cache.partial_slabs.head;
        cache.partial_slabs.head = slab_offset;
        cache.partial_slabs.count += 1;
    }
}

/// Asks the page manager for a page and formats it as a slab on the cache's
/// free list. Returns false when the region is out of pages.
unsafe fn grow(mut region: NonNull<Region>, index: usize) -> bool {
    let base = region.cast::<u8>();

    let page = pages::allocate_page(region);
    if page.is_null() {
        return false;
    }

    // The page now belongs to slab bookkeeping, which is also what routes
    // offsets on it back here on free.
    let bit = (page.get() / PAGE_SIZE) as usize;
    region.as_mut().caches.bitmap.set(base, bit);

    slab::format(region, index, page);
    true
}

/// Unlinks `slab` from the list it is currently on. The slab knows the list
/// through its `list` field but not its predecessor, so the list is scanned
/// from the head.
unsafe fn unlink(base: NonNull<u8>, slab_offset: Offset, slab: &Slab) {
    let list = swizzle_as::<SlabList>(base, slab.list).as_mut();
    assert!(!list.head.is_null(), "slab {slab_offset:?} is on an empty list");

    if list.head == slab_offset {
        list.head = slab.next;
    } else {
        let mut cursor = swizzle_as::<Slab>(base, list.head).as_mut();
        while cursor.next != slab_offset {
            assert!(!cursor.next.is_null(), "slab {slab_offset:?} missing from its list");
            cursor = swizzle_as::<Slab>(base, cursor.next).as_mut();
        }
        cursor.next = slab.next;
    }

    list.count -= 1;
}
