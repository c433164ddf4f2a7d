use std::{cmp::Ordering, fmt};

use super::{GuestAddress, GuestPhysicalAddress, frame_list, impl_offset_ops, page_range};
use crate::{
    AccessContext, Architecture, Domain, DomainDriver, Frames, MemoryError, Pa, Va, VcpuId,
};

/// A guest virtual address.
///
/// Besides the value, the address remembers the VCPU it was derived from and
/// the page table root of its address space. Translation always uses that
/// root, so an address taken from one process stays valid while another
/// process is scheduled.
pub struct GuestVirtualAddress<'a, Driver>
where
    Driver: DomainDriver,
{
    domain: &'a Domain<Driver>,
    vcpu: VcpuId,
    root: Pa,
    va: Va,
}

impl<Driver> Clone for GuestVirtualAddress<'_, Driver>
where
    Driver: DomainDriver,
{
    fn clone(&self) -> Self {
        *self
    }
}

impl<Driver> Copy for GuestVirtualAddress<'_, Driver> where Driver: DomainDriver {}

impl<'a, Driver> GuestVirtualAddress<'a, Driver>
where
    Driver: DomainDriver,
{
    /// Creates a new guest virtual address.
    pub fn new(domain: &'a Domain<Driver>, vcpu: VcpuId, root: Pa, va: Va) -> Self {
        Self {
            domain,
            vcpu,
            root,
            va,
        }
    }

    /// Returns the owning domain.
    pub fn domain(&self) -> &'a Domain<Driver> {
        self.domain
    }

    /// Returns the virtual address.
    pub fn va(&self) -> Va {
        self.va
    }

    /// Returns the page table root of the address space.
    pub fn root(&self) -> Pa {
        self.root
    }

    /// Returns the VCPU the address was derived from.
    pub fn vcpu(&self) -> VcpuId {
        self.vcpu
    }

    /// Translates the address to a guest physical address.
    pub fn translate(&self) -> Result<Pa, MemoryError> {
        self.domain
            .translate_access_context(AccessContext::paging(self.va, self.root))
    }

    /// Translates the address and binds the result to the same domain.
    pub fn physical_address(&self) -> Result<GuestPhysicalAddress<'a, Driver>, MemoryError> {
        Ok(GuestPhysicalAddress::new(self.domain, self.translate()?))
    }
}

impl<Driver> GuestAddress for GuestVirtualAddress<'_, Driver>
where
    Driver: DomainDriver,
{
    type Driver = Driver;

    fn domain(&self) -> &Domain<Driver> {
        self.domain
    }

    fn value(&self) -> u64 {
        self.va.0
    }

    fn with_value(&self, value: u64) -> Self {
        Self {
            va: Va(value),
            ..*self
        }
    }

    fn access_context(&self) -> AccessContext {
        AccessContext::paging(self.va, self.root)
    }

    fn same_context(&self, other: &Self) -> bool {
        std::ptr::eq(self.domain, other.domain) && self.root == other.root
    }

    /// Translates every page of `[self, self + length)`.
    ///
    /// The first page is translated through the address itself, so a fault
    /// there reports this exact address.
    fn frames(&self, length: usize) -> Result<Frames, MemoryError> {
        if self.va.is_null() {
            return Err(MemoryError::NullAddress(Some(format!(
                "virtual address {} (root {})",
                self.va, self.root
            ))));
        }

        let (first, count) = page_range(self.domain, self.va.0, length)?;
        let shift = Driver::Architecture::PAGE_SHIFT;

        let mut frames = frame_list(count, length)?;
        for index in 0..count {
            let va = match index {
                0 => self.va,
                _ => Va(first.wrapping_add(index) << shift),
            };

            let pa = self
                .domain
                .translate_access_context(AccessContext::paging(va, self.root))?;
            frames.push(Driver::Architecture::gfn_from_pa(pa));
        }

        Ok(frames)
    }
}

impl_offset_ops!(GuestVirtualAddress: u32, i32, u64, i64, usize);

impl<Driver> PartialEq for GuestVirtualAddress<'_, Driver>
where
    Driver: DomainDriver,
{
    fn eq(&self, other: &Self) -> bool {
        self.same_context(other) && self.va == other.va
    }
}

impl<Driver> Eq for GuestVirtualAddress<'_, Driver> where Driver: DomainDriver {}

impl<Driver> PartialOrd for GuestVirtualAddress<'_, Driver>
where
    Driver: DomainDriver,
{
    /// Addresses from different address spaces are unordered.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if !self.same_context(other) {
            return None;
        }

        self.va.partial_cmp(&other.va)
    }
}

impl<Driver> fmt::Debug for GuestVirtualAddress<'_, Driver>
where
    Driver: DomainDriver,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GuestVirtualAddress")
            .field("va", &self.va)
            .field("root", &self.root)
            .field("vcpu", &self.vcpu)
            .finish()
    }
}

impl<Driver> fmt::Display for GuestVirtualAddress<'_, Driver>
where
    Driver: DomainDriver,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.va, f)
    }
}

impl<Driver> From<GuestVirtualAddress<'_, Driver>> for Va
where
    Driver: DomainDriver,
{
    fn from(value: GuestVirtualAddress<'_, Driver>) -> Self {
        value.va
    }
}

impl<Driver> From<GuestVirtualAddress<'_, Driver>> for AccessContext
where
    Driver: DomainDriver,
{
    fn from(value: GuestVirtualAddress<'_, Driver>) -> Self {
        value.access_context()
    }
}
