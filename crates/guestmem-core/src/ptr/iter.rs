use std::marker::PhantomData;

use super::GuestArray;
use crate::{GuestAddress, MemoryError};

/// A variable-size record in a packed guest buffer.
///
/// Each entry knows its own size; the next entry starts right after it.
pub trait SizedEntry<A>
where
    Self: Sized,
    A: GuestAddress,
{
    /// Interprets the memory at `address` as an entry.
    fn from_address(address: A) -> Result<Self, MemoryError>;

    /// Returns the address of the entry.
    fn address(&self) -> A;

    /// Returns the size of the entry in bytes.
    fn size(&self) -> Result<u64, MemoryError>;
}

/// A cursor over consecutive [`SizedEntry`] values.
///
/// Iteration stops once the next entry would start at or beyond the buffer
/// end. A cursor that has run off the end compares equal to
/// [`SizeIter::end()`].
///
/// An entry reporting a size of zero would never advance; it is yielded, and
/// the following step yields an error instead of looping forever.
pub struct SizeIter<A, E> {
    current: Option<E>,
    end: u64,
    pending: Option<MemoryError>,
    _marker: PhantomData<A>,
}

impl<A, E> SizeIter<A, E>
where
    A: GuestAddress,
    E: SizedEntry<A>,
{
    /// Creates a cursor over the entries in `[start, end)`.
    pub fn new(start: A, end: u64) -> Self {
        let mut iter = Self::end();
        iter.end = end;

        if start.value() < end {
            match E::from_address(start) {
                Ok(entry) => iter.current = Some(entry),
                Err(err) => iter.pending = Some(err),
            }
        }

        iter
    }

    /// Returns the past-the-end cursor.
    pub fn end() -> Self {
        Self {
            current: None,
            end: 0,
            pending: None,
            _marker: PhantomData,
        }
    }

    /// Returns the entry under the cursor.
    pub fn current(&self) -> Option<&E> {
        self.current.as_ref()
    }

    fn position(&self) -> Option<u64> {
        self.current.as_ref().map(|entry| entry.address().value())
    }

    fn advance(&mut self, entry: &E) {
        let size = match entry.size() {
            Ok(0) => {
                self.pending = Some(MemoryError::memory(format!(
                    "Zero-sized entry at {}",
                    entry.address()
                )));
                return;
            }
            Ok(size) => size,
            Err(err) => {
                self.pending = Some(err);
                return;
            }
        };

        let current = entry.address().value();
        let next = current.wrapping_add(size);
        if next <= current || next >= self.end {
            return;
        }

        match E::from_address(entry.address().with_value(next)) {
            Ok(entry) => self.current = Some(entry),
            Err(err) => self.pending = Some(err),
        }
    }
}

impl<A, E> Iterator for SizeIter<A, E>
where
    A: GuestAddress,
    E: SizedEntry<A>,
{
    type Item = Result<E, MemoryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending.take() {
            return Some(Err(err));
        }

        let entry = self.current.take()?;
        self.advance(&entry);
        Some(Ok(entry))
    }
}

impl<A, E> PartialEq for SizeIter<A, E>
where
    A: GuestAddress,
    E: SizedEntry<A>,
{
    /// A cursor still holding an unreported error is not at the end.
    fn eq(&self, other: &Self) -> bool {
        self.position() == other.position()
            && self.pending.is_some() == other.pending.is_some()
    }
}

/// A guest buffer holding packed [`SizedEntry`] records.
pub trait SizeIterable<A>
where
    A: GuestAddress,
{
    /// The entry type.
    type Entry: SizedEntry<A>;

    /// Returns the address of the first entry.
    fn first_entry(&self) -> A;

    /// Returns the number of bytes of the buffer that hold entries.
    fn data_length(&self) -> Result<u64, MemoryError>;

    /// Updates the number of bytes of the buffer that hold entries.
    fn set_data_length(&self, length: u64) -> Result<(), MemoryError>;

    /// Returns the address one past the last entry.
    fn buffer_end(&self) -> Result<u64, MemoryError> {
        Ok(self
            .first_entry()
            .value()
            .wrapping_add(self.data_length()?))
    }

    /// Returns a cursor over the entries.
    fn iter(&self) -> Result<SizeIter<A, Self::Entry>, MemoryError> {
        Ok(SizeIter::new(self.first_entry(), self.buffer_end()?))
    }

    /// Removes `entry` from the buffer.
    ///
    /// The bytes following the entry are moved down over it in guest memory
    /// and the data length shrinks by the entry size. Returns the entry that
    /// now occupies the erased position, or `None` if the erased entry was
    /// the last one.
    fn erase(&self, entry: &Self::Entry) -> Result<Option<Self::Entry>, MemoryError> {
        let address = entry.address();
        let size = entry.size()?;
        let length = self.data_length()?;

        let start = self.first_entry().value();
        let end = start.wrapping_add(length);
        let current = address.value();
        let next = current.wrapping_add(size);

        if current < start || next > end || size > length {
            return Err(MemoryError::OutOfBounds);
        }

        let last = next >= end;
        if !last {
            let tail = (end - current) as usize;
            GuestArray::<A, u8>::new(address, tail).copy_within(size as usize..tail, 0)?;
        }

        self.set_data_length(length - size)?;

        match last {
            true => Ok(None),
            false => Ok(Some(Self::Entry::from_address(address)?)),
        }
    }
}

/// A record in a guest buffer that links to its successor by a relative
/// offset.
pub trait LinkedEntry<A>
where
    Self: Sized,
    A: GuestAddress,
{
    /// Interprets the memory at `address` as an entry.
    fn from_address(address: A) -> Result<Self, MemoryError>;

    /// Returns the address of the entry.
    fn address(&self) -> A;

    /// Returns the offset from this entry to the next one; zero marks the
    /// last entry.
    fn next_entry_offset(&self) -> Result<u64, MemoryError>;
}

/// A cursor over [`LinkedEntry`] values.
///
/// Iteration stops at an entry with a zero offset, or when the next entry
/// would start at or beyond the buffer end.
pub struct OffsetIter<A, E> {
    current: Option<E>,
    end: u64,
    pending: Option<MemoryError>,
    _marker: PhantomData<A>,
}

impl<A, E> OffsetIter<A, E>
where
    A: GuestAddress,
    E: LinkedEntry<A>,
{
    /// Creates a cursor starting at `start`, bounded by `end`.
    pub fn new(start: A, end: u64) -> Self {
        let mut iter = Self::end();
        iter.end = end;

        if start.value() < end {
            match E::from_address(start) {
                Ok(entry) => iter.current = Some(entry),
                Err(err) => iter.pending = Some(err),
            }
        }

        iter
    }

    /// Returns the past-the-end cursor.
    pub fn end() -> Self {
        Self {
            current: None,
            end: 0,
            pending: None,
            _marker: PhantomData,
        }
    }

    /// Returns the entry under the cursor.
    pub fn current(&self) -> Option<&E> {
        self.current.as_ref()
    }
}

impl<A, E> Iterator for OffsetIter<A, E>
where
    A: GuestAddress,
    E: LinkedEntry<A>,
{
    type Item = Result<E, MemoryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending.take() {
            return Some(Err(err));
        }

        let entry = self.current.take()?;
        let offset = match entry.next_entry_offset() {
            Ok(offset) => offset,
            Err(err) => {
                self.pending = Some(err);
                return Some(Ok(entry));
            }
        };

        let current = entry.address().value();
        let next = current.wrapping_add(offset);
        if offset != 0 && next > current && next < self.end {
            match E::from_address(entry.address().with_value(next)) {
                Ok(next) => self.current = Some(next),
                Err(err) => self.pending = Some(err),
            }
        }

        Some(Ok(entry))
    }
}

impl<A, E> PartialEq for OffsetIter<A, E>
where
    A: GuestAddress,
    E: LinkedEntry<A>,
{
    fn eq(&self, other: &Self) -> bool {
        let position = |iter: &Self| iter.current.as_ref().map(|entry| entry.address().value());
        position(self) == position(other)
    }
}

/// A guest buffer holding [`LinkedEntry`] records.
pub trait OffsetIterable<A>
where
    A: GuestAddress,
{
    /// The entry type.
    type Entry: LinkedEntry<A>;

    /// Returns the address of the first entry.
    fn first_entry(&self) -> A;

    /// Returns the address one past the end of the buffer.
    fn buffer_end(&self) -> Result<u64, MemoryError>;

    /// Returns a cursor over the entries.
    fn iter(&self) -> Result<OffsetIter<A, Self::Entry>, MemoryError> {
        Ok(OffsetIter::new(self.first_entry(), self.buffer_end()?))
    }
}
