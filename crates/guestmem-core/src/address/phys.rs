use std::{cmp::Ordering, fmt};

use super::{GuestAddress, frame_list, impl_offset_ops, page_range};
use crate::{AccessContext, Domain, DomainDriver, Frames, Gfn, MemoryError, Pa};

/// A guest physical address.
pub struct GuestPhysicalAddress<'a, Driver>
where
    Driver: DomainDriver,
{
    domain: &'a Domain<Driver>,
    pa: Pa,
}

impl<Driver> Clone for GuestPhysicalAddress<'_, Driver>
where
    Driver: DomainDriver,
{
    fn clone(&self) -> Self {
        *self
    }
}

impl<Driver> Copy for GuestPhysicalAddress<'_, Driver> where Driver: DomainDriver {}

impl<'a, Driver> GuestPhysicalAddress<'a, Driver>
where
    Driver: DomainDriver,
{
    /// Creates a new guest physical address.
    pub fn new(domain: &'a Domain<Driver>, pa: Pa) -> Self {
        Self { domain, pa }
    }

    /// Returns the owning domain.
    pub fn domain(&self) -> &'a Domain<Driver> {
        self.domain
    }

    /// Returns the physical address.
    pub fn pa(&self) -> Pa {
        self.pa
    }
}

impl<Driver> GuestAddress for GuestPhysicalAddress<'_, Driver>
where
    Driver: DomainDriver,
{
    type Driver = Driver;

    fn domain(&self) -> &Domain<Driver> {
        self.domain
    }

    fn value(&self) -> u64 {
        self.pa.0
    }

    fn with_value(&self, value: u64) -> Self {
        Self {
            pa: Pa(value),
            ..*self
        }
    }

    fn access_context(&self) -> AccessContext {
        AccessContext::direct(self.pa)
    }

    fn same_context(&self, other: &Self) -> bool {
        std::ptr::eq(self.domain, other.domain)
    }

    fn frames(&self, length: usize) -> Result<Frames, MemoryError> {
        let (first, count) = page_range(self.domain, self.pa.0, length)?;

        let mut frames = frame_list(count, length)?;
        frames.extend((0..count).map(|index| Gfn(first.wrapping_add(index))));
        Ok(frames)
    }
}

impl_offset_ops!(GuestPhysicalAddress: u32, i32, u64, i64, usize);

impl<Driver> PartialEq for GuestPhysicalAddress<'_, Driver>
where
    Driver: DomainDriver,
{
    fn eq(&self, other: &Self) -> bool {
        self.same_context(other) && self.pa == other.pa
    }
}

impl<Driver> Eq for GuestPhysicalAddress<'_, Driver> where Driver: DomainDriver {}

impl<Driver> PartialOrd for GuestPhysicalAddress<'_, Driver>
where
    Driver: DomainDriver,
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if !self.same_context(other) {
            return None;
        }

        self.pa.partial_cmp(&other.pa)
    }
}

impl<Driver> fmt::Debug for GuestPhysicalAddress<'_, Driver>
where
    Driver: DomainDriver,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("GuestPhysicalAddress").field(&self.pa).finish()
    }
}

impl<Driver> fmt::Display for GuestPhysicalAddress<'_, Driver>
where
    Driver: DomainDriver,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.pa, f)
    }
}

impl<Driver> From<GuestPhysicalAddress<'_, Driver>> for Pa
where
    Driver: DomainDriver,
{
    fn from(value: GuestPhysicalAddress<'_, Driver>) -> Self {
        value.pa
    }
}

impl<Driver> From<GuestPhysicalAddress<'_, Driver>> for AccessContext
where
    Driver: DomainDriver,
{
    fn from(value: GuestPhysicalAddress<'_, Driver>) -> Self {
        value.access_context()
    }
}
