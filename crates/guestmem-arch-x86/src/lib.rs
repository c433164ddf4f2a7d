//! x86 paging for guestmem.
//!
//! Implements the guest page table walk for 32-bit, PAE and IA-32e paging,
//! including 4MB, 2MB and 1GB large pages.

mod cr;
mod efer;
mod paging;
mod registers;
mod segment;
mod translation;

use guestmem_core::{Architecture, Domain, DomainDriver, Gfn, MemoryError, Pa, Va};

pub use self::{
    cr::{Cr0, Cr3, Cr4},
    efer::MsrEfer,
    paging::{ENTRY_ADDRESS_MASK, PageTableEntry, PageTableFlags, PageTableLevel, PagingMode},
    registers::Registers,
    segment::{SegmentAccess, SegmentDescriptor},
    translation::{PageDirectory, TranslationEntries, TranslationEntry, VaTranslation},
};

/// x86 architecture.
#[derive(Debug)]
pub struct X86;

impl Architecture for X86 {
    const PAGE_SIZE: u64 = 0x1000;
    const PAGE_SHIFT: u64 = 12;
    const PAGE_MASK: u64 = 0xFFFFFFFFFFFFF000;

    type Registers = Registers;
    type PagingMode = PagingMode;

    fn gfn_from_pa(pa: Pa) -> Gfn {
        Gfn(pa.0 >> Self::PAGE_SHIFT)
    }

    fn pa_from_gfn(gfn: Gfn) -> Pa {
        Pa(gfn.0 << Self::PAGE_SHIFT)
    }

    fn pa_offset(pa: Pa) -> u64 {
        pa.0 & !Self::PAGE_MASK
    }

    fn va_offset(va: Va) -> u64 {
        va.0 & !Self::PAGE_MASK
    }

    fn paging_mode(registers: &Registers) -> Option<PagingMode> {
        registers.paging_mode()
    }

    fn translate_address<Driver>(
        domain: &Domain<Driver>,
        mode: PagingMode,
        va: Va,
        root: Pa,
    ) -> Result<Pa, MemoryError>
    where
        Driver: DomainDriver<Architecture = Self>,
    {
        PageDirectory::new(Some(mode)).translate(domain, va, root)
    }
}

impl X86 {
    /// Returns a page directory for the domain's current paging mode.
    pub fn page_directory<Driver>(domain: &Domain<Driver>) -> Result<PageDirectory, MemoryError>
    where
        Driver: DomainDriver<Architecture = Self>,
    {
        Ok(PageDirectory::new(domain.paging_mode()?))
    }

    /// Walks the paging structures for `va` in the domain's current paging
    /// mode and records every consulted entry.
    ///
    /// See [`PageDirectory::translation`].
    pub fn translation<Driver>(
        domain: &Domain<Driver>,
        va: Va,
        root: Pa,
    ) -> Result<VaTranslation, MemoryError>
    where
        Driver: DomainDriver<Architecture = Self>,
    {
        Ok(Self::page_directory(domain)?.translation(domain, va, root))
    }
}

#[cfg(test)]
mod tests;
