use std::{mem, ptr, ptr::NonNull};

use crate::{
    cache::ObjectList,
    offset::{self, swizzle, swizzle_as, Offset},
    region::{Region, PAGE_SIZE},
};

/// Slab header size in bytes. Whatever the header does not use of the page is
/// object cells.
pub(crate) const SLAB_HEADER_SIZE: usize = mem::size_of::<Slab>();

/// One page formatted as a supply of fixed size object cells for a single
/// cache, after the slab design of Bonwick's kernel memory allocator. The
/// header sits at the top of the page and the cells are packed against the
/// high end, so a cell offset rounded down to the page boundary always lands
/// on the header of its owning slab:
///
/// ```text
/// page boundary ->  +--------------------+
///                   |     Slab header    |  <- cache, list, next, free list
///                   +--------------------+
///                   |       unused       |  <- less than one aligned_size
///      objects ->   +--------------------+
///                   |       cell 0       |  --+
///                   +--------------------+    |
///                   |       cell 1       |    |  object_count cells of
///                   +--------------------+    |  aligned_size bytes each
///                   |        ...         |    |
///                   +--------------------+    |
///                   |  cell (count - 1)  |  --+
/// page boundary ->  +--------------------+
/// ```
///
/// A free cell stores the offset of the next free cell in its first word (0
/// in the last one), threading an intrusive list through the very memory that
/// will later hold user data. An allocated cell is opaque. This is why the
/// smallest object class is one word and every class is 8 byte aligned.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct Slab {
    /// First word of the page, reserved for page level linkage.
    pub next_page: Offset,
    /// Cache record this slab belongs to.
    pub cache: Offset,
    /// The list head field (inside the owning cache) of the list this slab is
    /// currently on, so a freed slab can be unlinked without guessing which
    /// of the three lists holds it.
    pub list: Offset,
    /// Next slab on the same list.
    pub next: Offset,
    /// Where the object cells begin.
    pub objects: Offset,
    /// Intrusive list of free cells.
    pub free_objects: ObjectList,
}

/// Formats the page at `slab_offset` as a fresh slab for cache `index` and
/// pushes it onto that cache's free slab list.
///
/// The free list is threaded from the last cell down to the first, so cells
/// are handed out from the low end of the page first.
///
/// # Safety
///
/// `region` must point to an initialized region with exclusive access, and
/// `slab_offset` must be a data page freshly taken from the page manager and
/// already marked in the slab bitmap.
pub(crate) unsafe fn format(mut region: NonNull<Region>, index: usize, slab_offset: Offset) {
    let base = region.cast::<u8>();
    let cache = &mut region.as_mut().caches.records[index];

    // The first word carries inter-page linkage written by the page manager
    // and survives formatting; the rest of the page starts out zeroed.
    let page = swizzle(base, slab_offset).as_ptr();
    ptr::write_bytes(page.add(mem::size_of::<Offset>()), 0, (PAGE_SIZE as usize) - mem::size_of::<Offset>());

    let aligned_size = cache.aligned_size;
    let object_count = cache.object_count;
    let objects = Offset::new(slab_offset.get() + PAGE_SIZE - object_count * aligned_size);

    let slab = swizzle_as::<Slab>(base, slab_offset).as_mut();
    slab.cache = offset::offset_of(base, cache);
    slab.list = offset::offset_of(base, &cache.free_slabs);
    slab.next = cache.free_slabs.head;
    slab.objects = objects;
    slab.free_objects = ObjectList {
        head: objects,
        count: object_count,
    };

    // Thread the free list from the last cell down to the first. The last
    // cell keeps the 0 already written by the page wipe above.
    let mut cell = Offset::new(objects.get() + (object_count - 1) * aligned_size);
    while cell > objects {
        let previous = Offset::new(cell.get() - aligned_size);
        swizzle_as::<u64>(base, previous).as_ptr().write(cell.get());
        cell = previous;
    }

    cache.free_slabs.head = slab_offset;
    cache.free_slabs.count += 1;
}

impl Slab {
    /// Unlinks and returns the head of the free cell list. The slab must not
    /// be empty; callers check `free_objects.count` (or the list they found
    /// the slab on) first.
    ///
    /// # Safety
    ///
    /// `base` must be the base of the region holding this slab.
    pub(crate) unsafe fn pop_object(&mut self, base: NonNull<u8>) -> Offset {
        let object = self.free_objects.head;
        assert!(!object.is_null(), "popping from a depleted slab");

        self.free_objects.head = Offset::new(swizzle_as::<u64>(base, object).as_ptr().read());
        self.free_objects.count -= 1;
        object
    }

    /// Pushes a freed cell back onto the free list, making it the next cell
    /// handed out.
    ///
    /// Before linking, the whole free list is walked: finding `object`
    /// already on it is a double free, and any link pointing outside this
    /// slab's page means the list has been stomped on. Both are fatal, the
    /// region can no longer be trusted.
    ///
    /// # Safety
    ///
    /// `base` must be the base of the region holding this slab and `object`
    /// must be a cell offset within it.
    pub(crate) unsafe fn push_object(&mut self, base: NonNull<u8>, object: Offset) {
        let slab_offset = offset::offset_of(base, self);
        let next_page = Offset::new(slab_offset.get() + PAGE_SIZE);

        let mut cursor = self.free_objects.head;
        while !cursor.is_null() {
            assert!(cursor != object, "double free of {object:?}");
            assert!(
                cursor > slab_offset && cursor < next_page,
                "free cell list of slab {slab_offset:?} escapes its page"
            );
            cursor = Offset::new(swizzle_as::<u64>(base, cursor).as_ptr().read());
        }

        swizzle_as::<u64>(base, object).as_ptr().write(self.free_objects.head.get());
        self.free_objects.head = object;
        self.free_objects.count += 1;
    }
}
