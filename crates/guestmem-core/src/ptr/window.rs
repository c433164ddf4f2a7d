use std::cell::RefCell;

use crate::{GuestAddress, MemoryError, SharedMapping};

/// A shared mapping together with the domain generation it was acquired in.
#[derive(Clone)]
struct Window {
    mapping: SharedMapping,
    generation: u64,

    /// Address value corresponding to byte 0 of the mapping.
    base: u64,
}

impl Window {
    fn offset_of(&self, value: u64, size: usize) -> Option<usize> {
        let offset = usize::try_from(value.checked_sub(self.base)?).ok()?;
        let end = offset.checked_add(size)?;
        (end <= self.mapping.len()).then_some(offset)
    }
}

/// A byte range inside a shared mapping.
pub(crate) struct MappedRange {
    pub mapping: SharedMapping,
    pub offset: usize,
    pub len: usize,
}

impl MappedRange {
    pub fn bytes(&self) -> &[u8] {
        &self.mapping[self.offset..self.offset + self.len]
    }

    pub fn write(&self, at: usize, buffer: &[u8]) -> Result<(), MemoryError> {
        self.check(at, buffer.len())?;
        self.mapping.write(self.offset + at, buffer)
    }

    pub fn copy_within(&self, src: usize, dest: usize, len: usize) -> Result<(), MemoryError> {
        self.check(src, len)?;
        self.check(dest, len)?;
        self.mapping
            .copy_within(self.offset + src, self.offset + dest, len)
    }

    fn check(&self, at: usize, len: usize) -> Result<(), MemoryError> {
        match at.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(MemoryError::OutOfBounds),
        }
    }
}

/// A lazily acquired mapping window of a typed pointer.
///
/// Nothing is mapped until the first access. Later accesses reuse the
/// window as long as the requested range lies inside it and the domain
/// generation has not changed.
#[derive(Clone, Default)]
pub(crate) struct LazyWindow(RefCell<Option<Window>>);

impl LazyWindow {
    /// Returns `size` bytes mapped at `address`.
    pub fn acquire<A>(&self, address: &A, size: usize) -> Result<MappedRange, MemoryError>
    where
        A: GuestAddress,
    {
        if address.is_null() {
            return Err(MemoryError::NullAddress(Some(format!("{address:?}"))));
        }

        let generation = address.domain().generation();

        if let Some(window) = &*self.0.borrow()
            && window.generation == generation
            && let Some(offset) = window.offset_of(address.value(), size)
        {
            return Ok(MappedRange {
                mapping: window.mapping.clone(),
                offset,
                len: size,
            });
        }

        let mapping = address.map_shared(size)?;
        let offset = address.page_offset() as usize;

        *self.0.borrow_mut() = Some(Window {
            mapping: mapping.clone(),
            generation,
            base: address.value() - offset as u64,
        });

        Ok(MappedRange {
            mapping,
            offset,
            len: size,
        })
    }

    /// Checks whether a window is held for the current generation.
    pub fn is_current(&self, generation: u64) -> bool {
        matches!(&*self.0.borrow(), Some(window) if window.generation == generation)
    }
}
