use std::{io, os::fd::RawFd, ptr::NonNull};

use guestmem_core::HostMapping;

use crate::Error;

/// A host region of consecutive file-backed frames.
///
/// The whole range is reserved first as inaccessible anonymous memory, then
/// every frame is mapped over its slot from the memory file. The region is
/// unmapped as a whole when dropped, including frames mapped before a
/// failure.
pub struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl MmapRegion {
    /// Reserves `len` bytes of host address space.
    pub fn reserve(len: usize) -> Result<Self, Error> {
        // SAFETY: an anonymous mapping at a kernel-chosen address does not
        // alias any existing memory.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::Reserve {
                requested: len,
                source: io::Error::last_os_error(),
            });
        }

        let Some(ptr) = NonNull::new(ptr.cast())
        else {
            return Err(Error::Reserve {
                requested: len,
                source: io::Error::from_raw_os_error(libc::ENOMEM),
            });
        };

        Ok(Self { ptr, len })
    }

    /// Maps `size` bytes of `fd` starting at `file_offset` over the slot at
    /// `offset` in the region.
    pub fn map_fixed(
        &mut self,
        offset: usize,
        size: usize,
        fd: RawFd,
        file_offset: u64,
    ) -> Result<(), io::Error> {
        if offset.checked_add(size).is_none_or(|end| end > self.len) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let file_offset = libc::off_t::try_from(file_offset)
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;

        // SAFETY: the slot lies inside the reservation owned by `self`;
        // `MAP_FIXED` only replaces pages of that reservation.
        let ptr = unsafe {
            libc::mmap(
                self.ptr.as_ptr().add(offset).cast(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                file_offset,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr` and `len` describe the region created in `reserve`.
        let result = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if result != 0 {
            tracing::warn!(
                len = self.len,
                err = %io::Error::last_os_error(),
                "failed to unmap region"
            );
        }
    }
}

// SAFETY: the region stays mapped until drop. Frames are shared file
// mappings that live outside the Rust abstract machine, so they may be
// written through shared references.
unsafe impl HostMapping for MmapRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }
}
