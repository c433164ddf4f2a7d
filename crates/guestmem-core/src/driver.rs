use crate::{Architecture, DomainInfo, Gfn, GuestMemoryMapping, MemoryError, VcpuId};

/// A trait for implementing a guest memory backend.
///
/// The driver owns the connection to the hypervisor (or a memory image) and
/// exposes the primitives the [`Domain`] builds on.
///
/// [`Domain`]: crate::Domain
pub trait DomainDriver {
    /// The architecture supported by the driver.
    type Architecture: Architecture + ?Sized;

    /// Retrieves information about the virtual machine.
    fn info(&self) -> Result<DomainInfo, MemoryError>;

    /// Pauses the virtual machine.
    fn pause(&self) -> Result<(), MemoryError>;

    /// Resumes the virtual machine.
    fn resume(&self) -> Result<(), MemoryError>;

    /// Retrieves the registers of a specific virtual CPU.
    fn registers(
        &self,
        vcpu: VcpuId,
    ) -> Result<<Self::Architecture as Architecture>::Registers, MemoryError>;

    /// Sets the registers of a specific virtual CPU.
    fn set_registers(
        &self,
        vcpu: VcpuId,
        registers: <Self::Architecture as Architecture>::Registers,
    ) -> Result<(), MemoryError>;

    /// Maps the given guest frames, in order, into one contiguous host
    /// window.
    ///
    /// The frames do not need to be contiguous in guest physical memory.
    /// If any frame cannot be mapped, frames mapped so far are released and
    /// the error is returned.
    fn map_pfns(&self, frames: &[Gfn]) -> Result<GuestMemoryMapping, MemoryError>;
}
