//! Context-carrying guest addresses.
//!
//! A guest address is a plain 64-bit value bound to the [`Domain`] it belongs
//! to and, for virtual addresses, to the address space it was taken from.
//! Addresses are cheap `Copy` values; constructing one never fails, errors
//! surface when the address is translated or mapped.

mod phys;
mod virt;

use std::fmt;

pub use self::{phys::GuestPhysicalAddress, virt::GuestVirtualAddress};
use crate::{
    AccessContext, Architecture, Domain, DomainDriver, Frames, GuestMemoryMapping, MemoryError,
    SharedMapping,
};

/// An address in guest memory, bound to its domain.
pub trait GuestAddress
where
    Self: Copy + fmt::Debug + fmt::Display,
{
    /// The driver of the owning domain.
    type Driver: DomainDriver;

    /// Returns the owning domain.
    fn domain(&self) -> &Domain<Self::Driver>;

    /// Returns the raw address value.
    fn value(&self) -> u64;

    /// Returns an address with the same context and a different value.
    fn with_value(&self, value: u64) -> Self;

    /// Returns the access context describing how this address is resolved.
    fn access_context(&self) -> AccessContext;

    /// Checks whether `other` lives in the same domain and address space.
    fn same_context(&self, other: &Self) -> bool;

    /// Resolves the guest frames backing `[self, self + length)`, in order.
    fn frames(&self, length: usize) -> Result<Frames, MemoryError>;

    /// Checks if the address is zero.
    fn is_null(&self) -> bool {
        self.value() == 0
    }

    /// Returns the page size of the domain's architecture.
    fn page_size(&self) -> u64 {
        <<Self::Driver as DomainDriver>::Architecture as Architecture>::PAGE_SIZE
    }

    /// Returns the page number of the address.
    fn page_number(&self) -> u64 {
        self.value() >> <<Self::Driver as DomainDriver>::Architecture as Architecture>::PAGE_SHIFT
    }

    /// Returns the offset of the address within its page.
    fn page_offset(&self) -> u64 {
        self.value() & !<<Self::Driver as DomainDriver>::Architecture as Architecture>::PAGE_MASK
    }

    /// Maps `length` bytes starting at this address into a new host mapping.
    ///
    /// The mapping starts at the beginning of the first page; the byte at this
    /// address is found at [`page_offset()`] within it.
    ///
    /// [`page_offset()`]: Self::page_offset
    fn map(&self, length: usize) -> Result<GuestMemoryMapping, MemoryError> {
        let frames = self.frames(length)?;
        self.domain().map_frames(&frames)
    }

    /// Like [`map`], but goes through the domain's mapping cache and returns
    /// a shared mapping.
    ///
    /// [`map`]: Self::map
    fn map_shared(&self, length: usize) -> Result<SharedMapping, MemoryError> {
        let frames = self.frames(length)?;
        self.domain().map_frames_shared(&frames)
    }

    /// Reads `buffer.len()` bytes starting at this address.
    fn read(&self, buffer: &mut [u8]) -> Result<(), MemoryError> {
        self.domain().read(self.access_context(), buffer)
    }

    /// Writes `buffer` starting at this address.
    fn write(&self, buffer: &[u8]) -> Result<(), MemoryError> {
        self.domain().write(self.access_context(), buffer)
    }
}

/// Frame numbers covering `length` bytes from `value`, before translation.
///
/// Fails with [`MemoryError::AllocationFailed`] if the range could never be
/// mapped: more frames than the domain has, or more bytes than the host
/// address space holds.
fn page_range<Driver>(
    domain: &Domain<Driver>,
    value: u64,
    length: usize,
) -> Result<(u64, u64), MemoryError>
where
    Driver: DomainDriver,
{
    if length == 0 {
        return Err(MemoryError::memory("Tried to map 0 bytes"));
    }

    let shift = Driver::Architecture::PAGE_SHIFT;
    let first = value >> shift;
    let last = value
        .checked_add(length as u64 - 1)
        .ok_or(MemoryError::OutOfBounds)?
        >> shift;
    let count = last.wrapping_sub(first).wrapping_add(1);

    let too_large = || MemoryError::AllocationFailed {
        requested: length,
        source: std::io::ErrorKind::OutOfMemory.into(),
    };

    count
        .checked_mul(Driver::Architecture::PAGE_SIZE)
        .and_then(|bytes| usize::try_from(bytes).ok())
        .ok_or_else(too_large)?;

    let max_gfn = domain.info()?.max_gfn;
    if count > max_gfn.0.saturating_add(1) {
        tracing::debug!(length, count, %max_gfn, "mapping larger than guest memory");
        return Err(too_large());
    }

    Ok((first, count))
}

/// Allocates an empty frame list able to hold `count` frames.
fn frame_list(count: u64, length: usize) -> Result<Frames, MemoryError> {
    let mut frames = Frames::new();
    usize::try_from(count)
        .ok()
        .and_then(|count| frames.try_reserve_exact(count).ok())
        .ok_or_else(|| MemoryError::AllocationFailed {
            requested: length,
            source: std::io::ErrorKind::OutOfMemory.into(),
        })?;

    Ok(frames)
}

/// Implements wrapping `+`, `-`, `+=` and `-=` by integer offsets.
macro_rules! impl_offset_ops {
    ($name:ident: $($rhs:ty),*) => {
        $(
            impl<Driver> ::std::ops::Add<$rhs> for $name<'_, Driver>
            where
                Driver: DomainDriver,
            {
                type Output = Self;

                fn add(self, rhs: $rhs) -> Self::Output {
                    self.with_value(self.value().wrapping_add(rhs as u64))
                }
            }

            impl<Driver> ::std::ops::AddAssign<$rhs> for $name<'_, Driver>
            where
                Driver: DomainDriver,
            {
                fn add_assign(&mut self, rhs: $rhs) {
                    *self = *self + rhs;
                }
            }

            impl<Driver> ::std::ops::Sub<$rhs> for $name<'_, Driver>
            where
                Driver: DomainDriver,
            {
                type Output = Self;

                fn sub(self, rhs: $rhs) -> Self::Output {
                    self.with_value(self.value().wrapping_sub(rhs as u64))
                }
            }

            impl<Driver> ::std::ops::SubAssign<$rhs> for $name<'_, Driver>
            where
                Driver: DomainDriver,
            {
                fn sub_assign(&mut self, rhs: $rhs) {
                    *self = *self - rhs;
                }
            }
        )*
    };
}

pub(crate) use impl_offset_ops;
