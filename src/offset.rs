use std::{fmt, ptr::NonNull};

use crate::region::PAGE_MASK;

/// Self-relative address of a byte inside a region. Every reference the
/// allocator stores in region memory is one of these, never a native pointer,
/// so the whole region can be remapped to a different base address (or cloned
/// copy-on-write by the kernel) without invalidating anything. The value 0 is
/// reserved as the sentinel for "no object" / "end of list", which works out
/// because offset 0 is the region header and can never be handed to a caller.
///
/// Translation to and from process-local addresses happens only through
/// [`swizzle`] and [`unswizzle`]; the rest of the code never observes the
/// mapping base.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Offset(u64);

impl Offset {
    /// The "no object" / "end of list" sentinel.
    pub const NULL: Offset = Offset(0);

    #[inline]
    pub const fn new(offset: u64) -> Self {
        Offset(offset)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset of the page this offset falls into. For a small object this is
    /// the offset of the slab that owns it.
    #[inline]
    pub(crate) const fn page(self) -> Offset {
        Offset(self.0 & PAGE_MASK)
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Offset({:#x})", self.0)
    }
}

/// Returns the process-local address of the byte at `base + offset`.
///
/// # Safety
///
/// `base` must be the base address of a mapped region and `offset` must lie
/// within that region. The result is only valid for as long as the mapping
/// itself.
#[inline]
pub(crate) unsafe fn swizzle(base: NonNull<u8>, offset: Offset) -> NonNull<u8> {
    NonNull::new_unchecked(base.as_ptr().add(offset.get() as usize))
}

/// Same as [`swizzle`], but casts the translated address to `T`.
///
/// # Safety
///
/// Same contract as [`swizzle`], and `offset` must be aligned for `T`. All
/// bookkeeping structures in a region sit at 8 byte boundaries, which is the
/// strictest alignment any of them needs.
#[inline]
pub(crate) unsafe fn swizzle_as<T>(base: NonNull<u8>, offset: Offset) -> NonNull<T> {
    swizzle(base, offset).cast()
}

/// Inverse of [`swizzle`]: translates a process-local address back to its
/// region offset, such that `swizzle(base, unswizzle(base, p)) == p`.
///
/// # Safety
///
/// `address` must point into the region mapped at `base`.
#[inline]
pub(crate) unsafe fn unswizzle(base: NonNull<u8>, address: NonNull<u8>) -> Offset {
    Offset(address.as_ptr().offset_from(base.as_ptr()) as u64)
}

/// Region offset of a value that lives inside the region, typically a list
/// head field embedded in a cache record.
///
/// # Safety
///
/// `value` must actually be stored inside the region mapped at `base`.
#[inline]
pub(crate) unsafe fn offset_of<T>(base: NonNull<u8>, value: &T) -> Offset {
    unswizzle(base, NonNull::from(value).cast())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut buffer = [0u8; 4096];
        let base = NonNull::new(buffer.as_mut_ptr()).unwrap();

        unsafe {
            for raw in [8u64, 16, 64, 1024, 4088] {
                let offset = Offset::new(raw);
                let address = swizzle(base, offset);
                assert_eq!(address.as_ptr() as usize - base.as_ptr() as usize, raw as usize);
                assert_eq!(unswizzle(base, address), offset);
            }

            // The other direction of the contract.
            let address = NonNull::new(buffer.as_mut_ptr().add(123)).unwrap();
            assert_eq!(swizzle(base, unswizzle(base, address)), address);
        }
    }

    #[test]
    fn page_of_offset() {
        assert_eq!(Offset::new(4096).page(), Offset::new(4096));
        assert_eq!(Offset::new(4097).page(), Offset::new(4096));
        assert_eq!(Offset::new(8191).page(), Offset::new(4096));
        assert_eq!(Offset::new(8192).page(), Offset::new(8192));
    }

    #[test]
    fn null_sentinel() {
        assert!(Offset::NULL.is_null());
        assert!(!Offset::new(8).is_null());
        assert_eq!(Offset::NULL.get(), 0);
    }
}
