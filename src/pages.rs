use std::ptr::NonNull;

use crate::{
    offset::Offset,
    region::{Region, PAGE_MASK, PAGE_SIZE},
};

/// Hands out the page at the `free_page` hint and advances the hint to the
/// next free page at or above it, so that sequential demand is served in
/// increasing page order without rescanning from the start of the region.
/// Returns [`Offset::NULL`] when the region has no free page left.
///
/// The caller decides what the page is for and must set its bit in either the
/// slab or the heap bitmap; until then the scan below treats the returned
/// page as taken.
///
/// The scan walks the OR of the two bitmaps 64 pages at a time. Bits past the
/// last real page (the bit count is rounded up) and the pages reserved for
/// the bitmaps themselves read as taken, so neither can ever be handed out.
///
/// # Safety
///
/// `region` must point to an initialized region with exclusive access.
pub(crate) unsafe fn allocate_page(mut region: NonNull<Region>) -> Offset {
    let base = region.cast::<u8>();
    let r = region.as_mut();

    let page = r.free_page;
    if page.is_null() {
        return Offset::NULL;
    }

    assert_eq!(page.get() & PAGE_MASK, page.get(), "free page hint is not page aligned");
    assert_eq!(r.heap.bitmap.size, r.caches.bitmap.size);

    let page_count = (r.size / PAGE_SIZE) as usize;
    let words = page_count.div_ceil(64);
    let bit = (page.get() / PAGE_SIZE) as usize;

    let mut index = bit / 64;
    // The hint page itself is on its way out, and everything below it was
    // already in use when the hint was computed, so the scan starts past it.
    let mut bits = or_word(r, base, index) | (u64::MAX << (63 - bit % 64));

    r.free_page = loop {
        if index == words - 1 {
            // Bits past the last real page do not exist.
            let valid = page_count - index * 64;
            if valid < 64 {
                bits |= u64::MAX >> valid;
            }
        }

        if bits != u64::MAX {
            let next = index * 64 + bits.leading_ones() as usize;
            break Offset::new(next as u64 * PAGE_SIZE);
        }

        index += 1;
        if index == words {
            break Offset::NULL;
        }
        bits = or_word(r, base, index);
    };

    page
}

/// Returns a page to the pool: clears its bit in whichever bitmap holds it
/// and lowers the `free_page` hint if the freed page is below it, biasing the
/// allocator toward reusing low pages. Nothing reclaims slab pages today, but
/// the heap path frees whole pages.
///
/// # Safety
///
/// `region` must point to an initialized region with exclusive access, and
/// `page` must be a data page previously returned by [`allocate_page`].
#[allow(dead_code)] // no caller until the heap path lands, slabs keep their page
pub(crate) unsafe fn release_page(mut region: NonNull<Region>, page: Offset) {
    let base = region.cast::<u8>();
    let r = region.as_mut();

    assert_eq!(page.get() & PAGE_MASK, page.get(), "freed page is not page aligned");
    assert!(page >= r.pages && page.get() < r.size, "freed page outside data range");

    let bit = (page.get() / PAGE_SIZE) as usize;
    if r.caches.bitmap.get(base, bit) {
        r.caches.bitmap.clear(base, bit);
    } else {
        assert!(r.heap.bitmap.get(base, bit), "freed page is not in either bitmap");
        r.heap.bitmap.clear(base, bit);
    }

    if r.free_page.is_null() || page < r.free_page {
        r.free_page = page;
    }
}

/// OR of the two bitmaps, 64 pages at a time. Pages are never in both, which
/// is checked on every load since a contradiction means the region is
/// corrupted.
unsafe fn or_word(region: &Region, base: NonNull<u8>, index: usize) -> u64 {
    let heap = region.heap.bitmap.word(base, index);
    let slab = region.caches.bitmap.word(base, index);
    assert_eq!(heap & slab, 0, "page marked in both bitmaps");
    heap | slab
}
