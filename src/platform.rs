use std::ptr::NonNull;

use crate::Pointer;

/// Abstraction for platform specific memory handling. The embedder decides
/// where a region lives; all this crate needs is page aligned byte ranges for
/// private regions (and for the tests), plus a way to hand them back. The
/// shared, copy-on-write backed variant is a separate POSIX only affair, see
/// [`SharedMemory`].
trait PlatformSpecificMemory {
    /// Requests a memory region from the kernel where `length` bytes can be
    /// written safely.
    unsafe fn request_memory(length: usize) -> Pointer<u8>;

    /// Attempts to return `length` bytes starting from `address` to the
    /// underlying kernel. This function will usually be called to discard
    /// entire regions of memory, so length will equal the size of the region.
    unsafe fn return_memory(address: NonNull<u8>, length: usize);
}

/// Zero sized type carrying the [`PlatformSpecificMemory`] implementation
/// selected by the target.
struct Platform;

/// [`PlatformSpecificMemory::request_memory`] for the current OS.
#[inline]
pub(crate) unsafe fn request_memory(length: usize) -> Pointer<u8> {
    Platform::request_memory(length)
}

/// [`PlatformSpecificMemory::return_memory`] for the current OS.
#[inline]
pub(crate) unsafe fn return_memory(address: NonNull<u8>, length: usize) {
    Platform::return_memory(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use libc;

    use super::{Platform, PlatformSpecificMemory};
    use crate::{region::PAGE_SIZE, Pointer};

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Regions are mapped in one piece and never grow, so this is
            // called once per region, with a whole number of region pages.
            debug_assert!(length % PAGE_SIZE as usize == 0);

            // Plain anonymous memory. Embedders that want snapshots do not
            // come through here, they map a backing object via
            // [`super::SharedMemory`]; this path serves private scratch
            // regions and the tests.
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            // mmap returns whole hardware pages, which keeps the base
            // aligned for `Region::init` even where the hardware page is
            // larger than a region page.
            let address = libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0);
            if address == libc::MAP_FAILED {
                None
            } else {
                Some(NonNull::new_unchecked(address).cast())
            }
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            // Unmapping is the region's entire destructor; there is no
            // per-object teardown to run first.
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // A failed munmap leaves the mapping (and the region in it)
                // intact, so the worst case is a leak.
            }
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::ptr::NonNull;

    use windows::Win32::System::Memory;

    use super::{Platform, PlatformSpecificMemory};
    use crate::{region::PAGE_SIZE, Pointer};

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Same contract as the unix path: one whole-region request, a
            // whole number of region pages long.
            debug_assert!(length % PAGE_SIZE as usize == 0);

            // Reserve and commit in a single call. A region can never grow,
            // so there is nothing to gain from committing lazily.
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;
            let address = Memory::VirtualAlloc(None, length, flags, Memory::PAGE_READWRITE);

            // VirtualAlloc hands out 64 KiB granules, comfortably aligned
            // for `Region::init`.
            NonNull::new(address.cast())
        }

        unsafe fn return_memory(address: NonNull<u8>, _length: usize) {
            // MEM_RELEASE drops the whole reservation and insists on a zero
            // length; the region's length is implicit in the reservation.
            let released = Memory::VirtualFree(address.cast().as_ptr(), 0, Memory::MEM_RELEASE);
            if !released.as_bool() {
                // As with munmap, failure means the region leaks.
            }
        }
    }
}

#[cfg(miri)]
mod miri {
    //! Miri has no FFI, so mappings are mocked with the global allocator.
    //! `Layout` alignment stands in for what `mmap` would guarantee, and
    //! Miri's leak checker then covers tests that forget to return a region.

    use std::{alloc, ptr::NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        // `Region::init` rejects anything not aligned to a region page, so
        // the mock must align like a real mapping would.
        alloc::Layout::from_size_align(length, crate::region::PAGE_SIZE as usize).unwrap()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc(to_layout(length)))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }
    }
}

#[cfg(unix)]
#[cfg(not(miri))]
pub use shm::{SharedMemory, View};

/// Shared memory objects and their mapped views, the intended home of a
/// region: readers map the object shared, a writer clones it privately, lets
/// the kernel copy pages as they are touched, and copies the dirty pages
/// back into the shared view on commit. Offsets stored by the region are
/// valid in every view because the allocator never stores addresses.
#[cfg(unix)]
#[cfg(not(miri))]
mod shm {
    use std::{
        ffi::CString,
        process,
        ptr::{self, NonNull},
        sync::atomic::{AtomicU64, Ordering},
    };

    use libc;

    /// A POSIX shared memory object of a fixed size. The name is unlinked
    /// right after creation, so the object lives exactly as long as mappings
    /// of it (or the owning file descriptor) exist, and nothing is left
    /// behind in `/dev/shm` if the process dies.
    pub struct SharedMemory {
        fd: libc::c_int,
        length: usize,
    }

    /// One mapped view of a [`SharedMemory`] object, unmapped on drop. The
    /// address is page aligned, which is exactly what `Region::init` needs.
    pub struct View {
        address: NonNull<u8>,
        length: usize,
    }

    /// Numbers the shared memory objects of this process, since `shm_open`
    /// requires a name even for a backing object nobody will look up.
    static NEXT_SHM_ID: AtomicU64 = AtomicU64::new(0);

    impl SharedMemory {
        /// Creates a shared memory object of `length` bytes, or `None` if
        /// the kernel refuses.
        pub fn create(length: usize) -> Option<Self> {
            let id = NEXT_SHM_ID.fetch_add(1, Ordering::Relaxed);
            let name = CString::new(format!("/cowslab-{}-{}", process::id(), id)).ok()?;

            unsafe {
                let fd = libc::shm_open(
                    name.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                    (libc::S_IRUSR | libc::S_IWUSR) as libc::mode_t,
                );
                if fd == -1 {
                    return None;
                }

                // The name was only needed to get a descriptor.
                libc::shm_unlink(name.as_ptr());

                if libc::ftruncate(fd, length as libc::off_t) == -1 {
                    libc::close(fd);
                    return None;
                }

                Some(SharedMemory { fd, length })
            }
        }

        /// Size of the object in bytes.
        pub fn len(&self) -> usize {
            self.length
        }

        /// Maps the object shared: stores are visible to every shared view,
        /// in this process or another one holding the same object.
        pub fn map_shared(&self) -> Option<View> {
            self.map(libc::MAP_SHARED)
        }

        /// Maps the object copy-on-write: reads observe the shared contents
        /// until a page is written to, writes land in a private copy of the
        /// page and are never visible outside this view.
        pub fn map_private(&self) -> Option<View> {
            self.map(libc::MAP_PRIVATE)
        }

        fn map(&self, flags: libc::c_int) -> Option<View> {
            let protection = libc::PROT_READ | libc::PROT_WRITE;

            unsafe {
                let address =
                    libc::mmap(ptr::null_mut(), self.length, protection, flags, self.fd, 0);
                if address == libc::MAP_FAILED {
                    None
                } else {
                    Some(View {
                        address: NonNull::new_unchecked(address).cast(),
                        length: self.length,
                    })
                }
            }
        }
    }

    impl Drop for SharedMemory {
        fn drop(&mut self) {
            unsafe { libc::close(self.fd) };
        }
    }

    impl View {
        /// Page aligned base address of the view.
        pub fn address(&self) -> NonNull<u8> {
            self.address
        }

        /// Size of the view in bytes.
        pub fn len(&self) -> usize {
            self.length
        }
    }

    impl Drop for View {
        fn drop(&mut self) {
            unsafe { libc::munmap(self.address.as_ptr().cast(), self.length) };
        }
    }
}
