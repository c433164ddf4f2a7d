use std::{
    cell::Cell,
    ops::{Deref, Range},
    rc::Rc,
};

use smallvec::SmallVec;

use crate::{Gfn, MemoryError};

/// A list of guest frames backing a single host mapping.
pub type Frames = SmallVec<[Gfn; 4]>;

/// A contiguous window of host memory backing one or more guest frames.
///
/// Implementors own the host resource (e.g., an `mmap` region) and release
/// it when dropped.
///
/// # Safety
///
/// `as_ptr()` must point to `len()` bytes that stay valid and writable for
/// as long as the implementor is alive. The memory may be modified through
/// the pointer while shared references to the mapping exist, so it must be
/// backed by interior mutability or by memory outside the Rust abstract
/// machine (such as a shared file mapping).
pub unsafe trait HostMapping {
    /// Returns the start of the host window.
    fn as_ptr(&self) -> *mut u8;

    /// Returns the length of the host window in bytes.
    fn len(&self) -> usize;

    /// Checks if the host window is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks if the window is backed by guest memory itself, rather than
    /// by a private copy of it.
    fn is_shared(&self) -> bool {
        true
    }
}

/// A host mapping of guest physical frames.
///
/// The mapping is move-only; it is shared by wrapping it in an `Rc`, which
/// is what the domain's mapping cache does. Dropping the last owner releases
/// the host window.
///
/// Byte `0` of the mapping is the first byte of the first frame, so a guest
/// address maps to `page_offset(address)` within the mapping.
pub struct GuestMemoryMapping {
    inner: Box<dyn HostMapping>,
    frames: Frames,
}

impl GuestMemoryMapping {
    /// Creates a new mapping from a host window and the frames it covers.
    pub fn new(inner: impl HostMapping + 'static, frames: impl Into<Frames>) -> Self {
        let frames = frames.into();
        let inner = Box::new(inner);
        tracing::trace!(frames = frames.len(), len = inner.len(), "mapped");
        Self { inner, frames }
    }

    /// Returns the guest frames backing this mapping, in order.
    pub fn frames(&self) -> &[Gfn] {
        &self.frames
    }

    /// Returns the host address of the first byte of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.as_ptr()
    }

    /// Checks if writes through the mapping reach guest memory.
    pub fn is_shared(&self) -> bool {
        self.inner.is_shared()
    }

    /// Reads `buffer.len()` bytes starting at `offset`.
    pub fn read(&self, offset: usize, buffer: &mut [u8]) -> Result<(), MemoryError> {
        self.check_range(offset, buffer.len())?;

        // SAFETY: the range was checked against the window length.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.inner.as_ptr().add(offset),
                buffer.as_mut_ptr(),
                buffer.len(),
            );
        }

        Ok(())
    }

    /// Writes `buffer` starting at `offset`.
    pub fn write(&self, offset: usize, buffer: &[u8]) -> Result<(), MemoryError> {
        self.check_range(offset, buffer.len())?;

        // SAFETY: the range was checked against the window length and the
        // window is writable per the `HostMapping` contract.
        unsafe {
            std::ptr::copy_nonoverlapping(
                buffer.as_ptr(),
                self.inner.as_ptr().add(offset),
                buffer.len(),
            );
        }

        Ok(())
    }

    /// Moves `len` bytes from `src` to `dest` inside the mapping. The ranges
    /// may overlap.
    pub fn copy_within(&self, src: usize, dest: usize, len: usize) -> Result<(), MemoryError> {
        self.check_range(src, len)?;
        self.check_range(dest, len)?;

        // SAFETY: both ranges were checked; `ptr::copy` handles overlap.
        unsafe {
            let base = self.inner.as_ptr();
            std::ptr::copy(base.add(src), base.add(dest), len);
        }

        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.inner.len() => Ok(()),
            _ => Err(MemoryError::OutOfBounds),
        }
    }
}

impl Deref for GuestMemoryMapping {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // SAFETY: the window is valid for `len()` bytes while `inner` lives.
        unsafe { std::slice::from_raw_parts(self.inner.as_ptr(), self.inner.len()) }
    }
}

impl AsRef<[u8]> for GuestMemoryMapping {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl std::fmt::Debug for GuestMemoryMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("GuestMemoryMapping")
            .field("ptr", &self.inner.as_ptr())
            .field("len", &self.inner.len())
            .field("frames", &self.frames)
            .finish()
    }
}

impl Drop for GuestMemoryMapping {
    fn drop(&mut self) {
        tracing::trace!(frames = self.frames.len(), "unmapped");
    }
}

/// A host mapping backed by a private heap copy of guest memory.
///
/// Useful for drivers whose memory source cannot be mapped directly (such
/// as compressed dumps). Writes only affect the copy.
pub struct HeapMapping {
    data: Box<[Cell<u8>]>,
}

impl HeapMapping {
    /// Creates a new heap mapping holding `data`.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into().into_iter().map(Cell::new).collect(),
        }
    }
}

// SAFETY: the buffer is owned by the mapping and consists of `Cell`s, so
// writes through shared references are permitted.
unsafe impl HostMapping for HeapMapping {
    fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr() as *mut u8
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn is_shared(&self) -> bool {
        false
    }
}

/// A run of consecutive frames inside a shared [`GuestMemoryMapping`].
///
/// This is what the domain's mapping cache hands out. Frames that are
/// already part of a cached mapping are served as a view into it instead of
/// being mapped again. Byte `0` of the view is the first byte of its first
/// frame.
#[derive(Clone)]
pub struct SharedMapping {
    mapping: Rc<GuestMemoryMapping>,
    frames: Range<usize>,
    offset: usize,
    len: usize,
}

impl SharedMapping {
    /// Creates a view covering the whole mapping.
    pub fn new(mapping: Rc<GuestMemoryMapping>) -> Self {
        let frames = 0..mapping.frames().len();
        let len = mapping.len();

        Self {
            mapping,
            frames,
            offset: 0,
            len,
        }
    }

    /// Creates a view of the frames at `frames` (indices into the frame list
    /// of `mapping`), each `page_size` bytes long.
    ///
    /// Returns `None` if the range does not lie inside the mapping.
    pub fn slice(
        mapping: Rc<GuestMemoryMapping>,
        frames: Range<usize>,
        page_size: usize,
    ) -> Option<Self> {
        let offset = frames.start.checked_mul(page_size)?;
        let len = frames.len().checked_mul(page_size)?;

        if frames.start > frames.end
            || frames.end > mapping.frames().len()
            || offset.checked_add(len)? > mapping.len()
        {
            return None;
        }

        Some(Self {
            mapping,
            frames,
            offset,
            len,
        })
    }

    /// Returns the underlying mapping.
    pub fn mapping(&self) -> &Rc<GuestMemoryMapping> {
        &self.mapping
    }

    /// Returns the guest frames covered by the view, in order.
    pub fn frames(&self) -> &[Gfn] {
        &self.mapping.frames()[self.frames.clone()]
    }

    /// Checks if both views cover the same bytes of the same mapping.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.mapping, &other.mapping)
            && self.offset == other.offset
            && self.len == other.len
    }

    /// Reads `buffer.len()` bytes starting at `offset` within the view.
    pub fn read(&self, offset: usize, buffer: &mut [u8]) -> Result<(), MemoryError> {
        self.check_range(offset, buffer.len())?;
        self.mapping.read(self.offset + offset, buffer)
    }

    /// Writes `buffer` starting at `offset` within the view.
    pub fn write(&self, offset: usize, buffer: &[u8]) -> Result<(), MemoryError> {
        self.check_range(offset, buffer.len())?;
        self.mapping.write(self.offset + offset, buffer)
    }

    /// Moves `len` bytes from `src` to `dest` within the view.
    pub fn copy_within(&self, src: usize, dest: usize, len: usize) -> Result<(), MemoryError> {
        self.check_range(src, len)?;
        self.check_range(dest, len)?;
        self.mapping
            .copy_within(self.offset + src, self.offset + dest, len)
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(MemoryError::OutOfBounds),
        }
    }
}

impl Deref for SharedMapping {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.mapping[self.offset..self.offset + self.len]
    }
}

impl std::fmt::Debug for SharedMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SharedMapping")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("frames", &self.frames())
            .finish()
    }
}
