use crate::{
    Architecture, Domain, DomainDriver, GuestArray, GuestPhysicalAddress, GuestPtr,
    GuestVirtualAddress, MemoryError, Pa, PagingModeOf, Registers as _, RegistersOf, Va, VcpuId,
};

/// A virtual CPU of a domain, with a snapshot of its registers.
///
/// Addresses created through a `Vcpu` capture the page table root from the
/// snapshot, so they keep translating in that address space even after the
/// VCPU switches to another one.
pub struct Vcpu<'a, Driver>
where
    Driver: DomainDriver,
{
    domain: &'a Domain<Driver>,
    id: VcpuId,
    registers: RegistersOf<Driver>,
}

impl<'a, Driver> Vcpu<'a, Driver>
where
    Driver: DomainDriver,
{
    pub(crate) fn new(domain: &'a Domain<Driver>, id: VcpuId) -> Result<Self, MemoryError> {
        Ok(Self {
            domain,
            id,
            registers: domain.registers(id)?,
        })
    }

    /// Returns the VCPU identifier.
    pub fn id(&self) -> VcpuId {
        self.id
    }

    /// Returns the owning domain.
    pub fn domain(&self) -> &'a Domain<Driver> {
        self.domain
    }

    /// Returns the register snapshot.
    pub fn registers(&self) -> &RegistersOf<Driver> {
        &self.registers
    }

    /// Re-reads the registers from the driver.
    pub fn refresh(&mut self) -> Result<(), MemoryError> {
        self.registers = self.domain.registers(self.id)?;
        Ok(())
    }

    /// Writes new register values to the VCPU.
    pub fn set_registers(&mut self, registers: RegistersOf<Driver>) -> Result<(), MemoryError> {
        self.domain.set_registers(self.id, registers)?;
        self.registers = registers;
        Ok(())
    }

    /// Returns the paging mode selected by the register snapshot.
    pub fn paging_mode(&self) -> Option<PagingModeOf<Driver>> {
        <Driver::Architecture as Architecture>::paging_mode(&self.registers)
    }

    /// Makes the domain translate with this VCPU's paging mode.
    pub fn reconfigure(&self) -> Option<PagingModeOf<Driver>> {
        self.domain.reconfigure(&self.registers)
    }

    /// Returns the address width (pointer size) of the paging mode in bytes.
    pub fn address_width(&self) -> usize {
        self.registers.address_width()
    }

    /// Checks whether the VCPU runs with 64-bit paging.
    pub fn long_mode(&self) -> bool {
        self.registers.address_width() == 8
    }

    /// Checks whether the VCPU runs 32-bit code under 64-bit paging.
    pub fn long_compatibility_mode(&self) -> bool {
        self.long_mode() && self.registers.effective_address_width() == 4
    }

    /// Returns the page table root used to translate `va`.
    pub fn translation_root(&self, va: Va) -> Pa {
        self.registers.translation_root(va)
    }

    /// Creates a guest virtual address in the VCPU's current address space.
    pub fn address(&self, va: impl Into<Va>) -> GuestVirtualAddress<'a, Driver> {
        let va = va.into();
        GuestVirtualAddress::new(self.domain, self.id, self.translation_root(va), va)
    }

    /// Creates a guest physical address.
    pub fn phys(&self, pa: impl Into<Pa>) -> GuestPhysicalAddress<'a, Driver> {
        GuestPhysicalAddress::new(self.domain, pa.into())
    }

    /// Creates a typed pointer to `va` in the VCPU's current address space.
    pub fn ptr<T>(&self, va: impl Into<Va>) -> GuestPtr<GuestVirtualAddress<'a, Driver>, T> {
        GuestPtr::new(self.address(va))
    }

    /// Creates a typed array of `len` elements at `va`.
    pub fn array<T>(
        &self,
        va: impl Into<Va>,
        len: usize,
    ) -> GuestArray<GuestVirtualAddress<'a, Driver>, T> {
        GuestArray::new(self.address(va), len)
    }
}

impl<Driver> std::fmt::Debug for Vcpu<'_, Driver>
where
    Driver: DomainDriver,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Vcpu")
            .field("id", &self.id)
            .field("registers", &self.registers)
            .finish()
    }
}
