/// Largest size served by the slab caches. Everything above this would go to
/// the heap allocator, which does not exist yet.
pub(crate) const SMALL_OBJECT_MAX: usize = 256;

/// Fixed object size class created for a region, in creation order. The
/// progression is powers of two for now; classes with 10 to 20 percent
/// increments would waste less of each cell.
pub(crate) struct Class {
    pub name: &'static str,
    pub size: u16,
    pub align: u16,
}

/// The caches every region is initialized with, smallest first. A cell must
/// hold at least the one word free list link, hence the 8 byte floor, and 8
/// byte alignment satisfies every class.
pub(crate) const CLASSES: [Class; 6] = [
    Class { name: "alloc-8", size: 8, align: 8 },
    Class { name: "alloc-16", size: 16, align: 8 },
    Class { name: "alloc-32", size: 32, align: 8 },
    Class { name: "alloc-64", size: 64, align: 8 },
    Class { name: "alloc-128", size: 128, align: 8 },
    Class { name: "alloc-256", size: 256, align: 8 },
];

/// Cache index for every 8 byte granule of `1..=256`, so dispatching a size
/// is one shift and one table load.
#[rustfmt::skip]
const CLASS_OF: [u8; 32] = [
    0, /*   8 */    1, /*  16 */    2, /*  24 */    2, /*  32 */
    3, /*  40 */    3, /*  48 */    3, /*  56 */    3, /*  64 */
    4, /*  72 */    4, /*  80 */    4, /*  88 */    4, /*  96 */
    4, /* 104 */    4, /* 112 */    4, /* 120 */    4, /* 128 */
    5, /* 136 */    5, /* 144 */    5, /* 152 */    5, /* 160 */
    5, /* 168 */    5, /* 176 */    5, /* 184 */    5, /* 192 */
    5, /* 200 */    5, /* 208 */    5, /* 216 */    5, /* 224 */
    5, /* 232 */    5, /* 240 */    5, /* 248 */    5, /* 256 */
];

/// Maps an allocation size to its cache index.
#[inline]
pub(crate) fn class_of(size: usize) -> usize {
    debug_assert!(size >= 1 && size <= SMALL_OBJECT_MAX);
    CLASS_OF[(size - 1) >> 3] as usize
}

/// Cell size for an object of `size` bytes aligned to `align`: at least one
/// alignment unit, otherwise `size` rounded up to the next multiple.
pub(crate) fn aligned_size(size: u64, align: u64) -> u64 {
    let align = if align == 0 { 8 } else { align };

    if align > size {
        return align;
    }

    align * size.div_ceil(align)
}
