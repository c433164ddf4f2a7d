//! Architecture abstraction.
//!
//! An [`Architecture`] describes the page geometry of a CPU family, how its
//! paging mode is derived from the register state, and how a virtual address
//! is translated by walking the guest page tables.

use std::fmt::Debug;

use crate::{Domain, DomainDriver, Gfn, MemoryError, Pa, Va};

/// Defines an interface for CPU architecture-specific operations and constants.
pub trait Architecture {
    /// The size of a memory page in bytes for the given architecture.
    ///
    /// # Architecture-specific
    ///
    /// - **x86**: `0x1000` (4096 bytes)
    const PAGE_SIZE: u64;

    /// The number of bits to shift when converting between page numbers and
    /// physical addresses.
    ///
    /// # Architecture-specific
    ///
    /// - **x86**: `12` (2^12 = 4096)
    const PAGE_SHIFT: u64;

    /// A bitmask used to isolate the page number from a full address.
    ///
    /// # Architecture-specific
    ///
    /// - **x86**: `0xFFFFFFFFFFFFF000`
    const PAGE_MASK: u64;

    /// The complete set of CPU registers for the architecture.
    type Registers: Registers;

    /// The paging configuration of a virtual CPU.
    ///
    /// The mode is an immutable value derived from the register state. The
    /// domain caches it per generation.
    type PagingMode: Debug + Clone + Copy + PartialEq + Eq;

    /// Converts a guest physical address (GPA) to a guest frame number (GFN).
    fn gfn_from_pa(pa: Pa) -> Gfn;

    /// Converts a guest frame number (GFN) to a guest physical address (GPA).
    fn pa_from_gfn(gfn: Gfn) -> Pa;

    /// Extracts the offset within a page from a physical address.
    fn pa_offset(pa: Pa) -> u64;

    /// Extracts the offset within a page from a virtual address.
    fn va_offset(va: Va) -> u64;

    /// Derives the paging mode from the register state.
    ///
    /// Returns `None` if paging is disabled, in which case virtual addresses
    /// are identical to physical addresses.
    fn paging_mode(registers: &Self::Registers) -> Option<Self::PagingMode>;

    /// Performs a full page table walk to translate a virtual address to a
    /// physical address.
    fn translate_address<Driver>(
        domain: &Domain<Driver>,
        mode: Self::PagingMode,
        va: Va,
        root: Pa,
    ) -> Result<Pa, MemoryError>
    where
        Driver: DomainDriver<Architecture = Self>;
}

/// Complete set of CPU registers for a specific architecture.
pub trait Registers
where
    Self: Debug + Default + Clone + Copy,
{
    /// The specific CPU architecture implementation.
    type Architecture: Architecture + ?Sized;

    /// Returns the current value of the instruction pointer.
    fn instruction_pointer(&self) -> u64;

    /// Returns the current value of the stack pointer.
    fn stack_pointer(&self) -> u64;

    /// Returns the native address width (i.e. pointer size) of the
    /// paging mode in bytes.
    ///
    /// # Architecture-specific
    ///
    /// - **x86**: 8 bytes in long mode, 4 bytes otherwise
    fn address_width(&self) -> usize;

    /// Returns the address width of the currently executing code in bytes.
    ///
    /// Differs from [`address_width`] when a 32-bit program runs under a
    /// 64-bit kernel.
    ///
    /// [`address_width`]: Self::address_width
    fn effective_address_width(&self) -> usize;

    /// Returns the root of the paging structures used to translate `va`.
    ///
    /// # Architecture-specific
    ///
    /// - **x86**: the raw `CR3` value
    fn translation_root(&self, va: Va) -> Pa;
}
