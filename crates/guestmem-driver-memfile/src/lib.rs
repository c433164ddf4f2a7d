//! guestmem driver for guest RAM stored in a file.
//!
//! The file holds the raw guest physical memory, frame `n` at offset
//! `n * PAGE_SIZE`. This is the layout of a QEMU `memory-backend-file`
//! (with `share=on`) or of a `memfd` created by the caller. Frames are
//! mapped straight from the file, so writes through a mapping are seen by
//! the guest and by every other mapping of the same frame.
//!
//! The driver does not observe a running guest's CPU state; register
//! values are supplied with [`DomainDriver::set_registers`].

mod driver;
mod error;
mod mmap;

use std::{fs::File, path::Path};

use guestmem_core::{
    Architecture, DomainDriver, DomainInfo, Gfn, GuestMemoryMapping, MemoryError, Pa, VcpuId,
};

pub use self::{error::Error, mmap::MmapRegion};
use self::driver::Memfile;

/// guestmem driver for guest RAM stored in a file.
pub struct MemfileDriver<Arch>
where
    Arch: Architecture,
{
    inner: Memfile<Arch>,
}

impl<Arch> MemfileDriver<Arch>
where
    Arch: Architecture,
{
    /// Opens the memory file at `path` for reading and writing.
    pub fn open(path: impl AsRef<Path>, vcpus: u16) -> Result<Self, MemoryError> {
        Ok(Self {
            inner: Memfile::open(path, vcpus)?,
        })
    }

    /// Creates a driver over an already opened memory file.
    ///
    /// The file must be opened for reading and writing.
    pub fn from_file(file: File, vcpus: u16) -> Result<Self, MemoryError> {
        Ok(Self {
            inner: Memfile::new(file, vcpus)?,
        })
    }

    /// Creates a driver over a new zero-filled `memfd` of `size` bytes.
    pub fn anonymous(name: &str, size: u64, vcpus: u16) -> Result<Self, MemoryError> {
        Ok(Self {
            inner: Memfile::anonymous(name, size, vcpus)?,
        })
    }

    /// Returns the size of the memory file in bytes.
    pub fn size(&self) -> u64 {
        self.inner.size()
    }

    /// Checks if the guest is paused.
    pub fn is_paused(&self) -> bool {
        self.inner.is_paused()
    }

    /// Reads guest physical memory directly from the file.
    pub fn read_physical(&self, pa: Pa, buffer: &mut [u8]) -> Result<(), MemoryError> {
        Ok(self.inner.read(pa, buffer)?)
    }

    /// Writes guest physical memory directly to the file.
    pub fn write_physical(&self, pa: Pa, buffer: &[u8]) -> Result<(), MemoryError> {
        Ok(self.inner.write(pa, buffer)?)
    }
}

impl<Arch> DomainDriver for MemfileDriver<Arch>
where
    Arch: Architecture,
{
    type Architecture = Arch;

    fn info(&self) -> Result<DomainInfo, MemoryError> {
        Ok(self.inner.info()?)
    }

    fn pause(&self) -> Result<(), MemoryError> {
        Ok(self.inner.pause()?)
    }

    fn resume(&self) -> Result<(), MemoryError> {
        Ok(self.inner.resume()?)
    }

    fn registers(&self, vcpu: VcpuId) -> Result<Arch::Registers, MemoryError> {
        Ok(self.inner.registers(vcpu)?)
    }

    fn set_registers(&self, vcpu: VcpuId, registers: Arch::Registers) -> Result<(), MemoryError> {
        Ok(self.inner.set_registers(vcpu, registers)?)
    }

    fn map_pfns(&self, frames: &[Gfn]) -> Result<GuestMemoryMapping, MemoryError> {
        Ok(self.inner.map_pfns(frames)?)
    }
}
