use std::{marker::PhantomData, ops::Range};

use zerocopy::{FromBytes, Immutable, IntoBytes};

use super::{GuestPtr, window::LazyWindow};
use crate::{GuestAddress, MemoryError};

/// A fixed number of consecutive `T` values in guest memory.
///
/// The element count is independent of the byte length. All elements are
/// mapped at once, on first access.
pub struct GuestArray<A, T> {
    address: A,
    len: usize,
    window: LazyWindow,
    _marker: PhantomData<fn() -> T>,
}

impl<A, T> GuestArray<A, T>
where
    A: GuestAddress,
{
    /// Creates a new array of `len` elements at `address`.
    pub fn new(address: A, len: usize) -> Self {
        Self {
            address,
            len,
            window: LazyWindow::default(),
            _marker: PhantomData,
        }
    }

    /// Returns the address of the first element.
    pub fn address(&self) -> A {
        self.address
    }

    /// Returns the number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Checks if the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Checks if the array address is null.
    pub fn is_null(&self) -> bool {
        self.address.is_null()
    }

    /// Returns the size of the array in bytes, or `None` if it does not fit
    /// in a `usize`.
    pub fn byte_len(&self) -> Option<usize> {
        self.len.checked_mul(size_of::<T>())
    }

    fn mapped_len(&self) -> Result<usize, MemoryError> {
        self.byte_len().ok_or(MemoryError::OutOfBounds)
    }

    /// Returns a pointer to the element at `index`.
    pub fn element(&self, index: usize) -> Result<GuestPtr<A, T>, MemoryError> {
        if index >= self.len {
            return Err(MemoryError::OutOfBounds);
        }

        Ok(GuestPtr::new(self.address).add(index))
    }

    /// Reads the element at `index`.
    pub fn get(&self, index: usize) -> Result<T, MemoryError>
    where
        T: FromBytes,
    {
        if index >= self.len {
            return Err(MemoryError::OutOfBounds);
        }

        self.read_at(index)
    }

    /// Reads the element at `index` without checking it against the length.
    ///
    /// The index is only checked in debug builds. Reads past the end are
    /// still confined to the mapping and fail rather than touch foreign
    /// memory.
    pub fn at(&self, index: usize) -> Result<T, MemoryError>
    where
        T: FromBytes,
    {
        debug_assert!(index < self.len, "index {index} out of range");
        self.read_at(index)
    }

    /// Writes the element at `index`.
    pub fn set(&self, index: usize, value: &T) -> Result<(), MemoryError>
    where
        T: IntoBytes + Immutable,
    {
        if index >= self.len {
            return Err(MemoryError::OutOfBounds);
        }

        let range = self.window.acquire(&self.address, self.mapped_len()?)?;
        range.write(index * size_of::<T>(), value.as_bytes())
    }

    /// Reads all elements.
    ///
    /// The whole array is mapped before anything is allocated, so a length
    /// taken from guest memory cannot exhaust host memory.
    pub fn to_vec(&self) -> Result<Vec<T>, MemoryError>
    where
        T: FromBytes,
    {
        if self.is_empty() {
            return Ok(Vec::new());
        }

        // Zero-sized elements fail here, as a zero-length range.
        let range = self.window.acquire(&self.address, self.mapped_len()?)?;
        range
            .bytes()
            .chunks_exact(size_of::<T>())
            .map(|bytes| T::read_from_bytes(bytes).map_err(|_| MemoryError::OutOfBounds))
            .collect()
    }

    /// Returns an iterator over the elements.
    pub fn iter(&self) -> ArrayIter<'_, A, T> {
        ArrayIter {
            array: self,
            index: 0,
        }
    }

    /// Moves the elements in `src` so that they start at `dest`, like
    /// [`slice::copy_within`]. The ranges may overlap.
    pub fn copy_within(&self, src: Range<usize>, dest: usize) -> Result<(), MemoryError> {
        if src.start > src.end || src.end > self.len || dest > self.len - src.len() {
            return Err(MemoryError::OutOfBounds);
        }

        if src.is_empty() {
            return Ok(());
        }

        let size = size_of::<T>();
        let range = self.window.acquire(&self.address, self.mapped_len()?)?;
        range.copy_within(src.start * size, dest * size, src.len() * size)
    }

    fn read_at(&self, index: usize) -> Result<T, MemoryError>
    where
        T: FromBytes,
    {
        let size = size_of::<T>();
        let range = self.window.acquire(&self.address, self.mapped_len()?)?;
        let offset = index.checked_mul(size).ok_or(MemoryError::OutOfBounds)?;
        let bytes = range
            .bytes()
            .get(offset..offset + size)
            .ok_or(MemoryError::OutOfBounds)?;

        T::read_from_bytes(bytes).map_err(|_| MemoryError::OutOfBounds)
    }
}

impl<A> GuestArray<A, u8>
where
    A: GuestAddress,
{
    /// Creates an array covering the NUL-terminated string at `address`.
    ///
    /// The terminator is not part of the array. At most `max_length` bytes
    /// are scanned; a string without a terminator in that range is cut at
    /// `max_length`.
    pub fn cstring(address: A, max_length: usize) -> Result<Self, MemoryError> {
        let mut length = 0;

        while length < max_length {
            let current = address.with_value(address.value().wrapping_add(length as u64));
            let page_remaining = (current.page_size() - current.page_offset()) as usize;
            let chunk = page_remaining.min(max_length - length);

            let range = LazyWindow::default().acquire(&current, chunk)?;
            if let Some(position) = memchr::memchr(0, range.bytes()) {
                return Ok(Self::new(address, length + position));
            }

            length += chunk;
        }

        Ok(Self::new(address, max_length))
    }

    /// Reads the bytes of the array.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MemoryError> {
        if self.is_empty() {
            return Ok(Vec::new());
        }

        let range = self.window.acquire(&self.address, self.len)?;
        Ok(range.bytes().to_vec())
    }

    /// Reads the array as a string, replacing invalid UTF-8.
    pub fn to_string_lossy(&self) -> Result<String, MemoryError> {
        Ok(String::from_utf8_lossy(&self.to_bytes()?).into_owned())
    }
}

impl<A> GuestArray<A, u16>
where
    A: GuestAddress,
{
    /// Creates an array covering the NUL-terminated UTF-16 string at
    /// `address`.
    ///
    /// The terminator is not part of the array. At most `max_length`
    /// characters are scanned.
    pub fn wstring(address: A, max_length: usize) -> Result<Self, MemoryError> {
        let mut length = 0;

        while length < max_length {
            let offset = (length as u64).wrapping_mul(2);
            let current = address.with_value(address.value().wrapping_add(offset));
            let page_remaining = (current.page_size() - current.page_offset()) as usize;

            // A character straddling a page boundary is mapped on its own.
            let chunk = (page_remaining.max(2) & !1).min((max_length - length).saturating_mul(2));

            let range = LazyWindow::default().acquire(&current, chunk)?;
            let bytes = range.bytes();
            let terminator = memchr::memchr_iter(0, bytes)
                .find(|&position| position % 2 == 0 && bytes.get(position + 1) == Some(&0));

            if let Some(position) = terminator {
                return Ok(Self::new(address, length + position / 2));
            }

            length += chunk / 2;
        }

        Ok(Self::new(address, max_length))
    }

    /// Reads the array as a string, replacing invalid UTF-16.
    pub fn to_string_lossy(&self) -> Result<String, MemoryError> {
        Ok(String::from_utf16_lossy(&self.to_vec()?))
    }
}

impl<A, T> Clone for GuestArray<A, T>
where
    A: GuestAddress,
{
    fn clone(&self) -> Self {
        Self {
            address: self.address,
            len: self.len,
            window: self.window.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, T> std::fmt::Debug for GuestArray<A, T>
where
    A: GuestAddress,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("GuestArray")
            .field("address", &self.address)
            .field("len", &self.len)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

/// An iterator over the elements of a [`GuestArray`].
pub struct ArrayIter<'a, A, T> {
    array: &'a GuestArray<A, T>,
    index: usize,
}

impl<A, T> Iterator for ArrayIter<'_, A, T>
where
    A: GuestAddress,
    T: FromBytes,
{
    type Item = Result<T, MemoryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.array.len {
            return None;
        }

        let item = self.array.read_at(self.index);
        self.index += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.array.len - self.index;
        (remaining, Some(remaining))
    }
}
