use guestmem_core::{
    Architecture as _, Domain, DomainDriver, MAX_PAGE_FAULT_RETRIES, MemoryError, Pa, PageFault,
    PageFaultResolution, Va,
};
use smallvec::SmallVec;
use zerocopy::FromBytes;

use crate::{
    ENTRY_ADDRESS_MASK, PageTableEntry, PageTableLevel, PagingMode, Registers, X86,
};

/// A single entry consulted during virtual address translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationEntry {
    /// The level of the table holding the entry.
    pub level: PageTableLevel,

    /// The raw entry.
    pub entry: PageTableEntry,

    /// The physical address of the entry.
    pub entry_address: Pa,
}

impl TranslationEntry {
    /// Checks if the entry terminates the walk.
    pub fn is_leaf(&self, mode: PagingMode) -> bool {
        self.entry.present()
            && match self.level {
                PageTableLevel::Pt => true,
                level => mode.large_page_at(level) && self.entry.large(),
            }
    }
}

/// Collection of translation entries, in walk order.
pub type TranslationEntries = SmallVec<[TranslationEntry; 4]>;

/// The record of a page table walk.
#[derive(Debug)]
pub struct VaTranslation {
    entries: TranslationEntries,
    pa: Option<Pa>,
}

impl VaTranslation {
    /// Returns the entries consulted during the walk.
    pub fn entries(&self) -> &[TranslationEntry] {
        &self.entries
    }

    /// Consumes the `VaTranslation` and returns the entries.
    pub fn into_entries(self) -> TranslationEntries {
        self.entries
    }

    /// Returns the resulting physical address, if the walk succeeded.
    pub fn pa(&self) -> Option<Pa> {
        self.pa
    }

    /// Checks if every consulted entry is present.
    pub fn present(&self) -> bool {
        self.entries.iter().all(|entry| entry.entry.present())
    }

    /// Checks if every consulted entry allows writes.
    pub fn write(&self) -> bool {
        self.entries.iter().all(|entry| entry.entry.write())
    }

    /// Checks if every consulted entry allows user-mode access.
    pub fn user(&self) -> bool {
        self.entries.iter().all(|entry| entry.entry.user())
    }
}

impl IntoIterator for VaTranslation {
    type Item = TranslationEntry;
    type IntoIter = <TranslationEntries as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Translates virtual addresses by walking x86 paging structures.
///
/// The page directory holds the paging mode only; the root of the
/// structures is supplied with every translation. Tables are read through
/// the domain's mapping cache. Without a paging mode, virtual addresses are
/// physical addresses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageDirectory {
    mode: Option<PagingMode>,
}

impl PageDirectory {
    /// Creates a page directory for the given paging mode.
    pub fn new(mode: Option<PagingMode>) -> Self {
        Self { mode }
    }

    /// Creates a page directory for the paging mode selected by `registers`.
    pub fn from_registers(registers: &Registers) -> Self {
        Self::new(registers.paging_mode())
    }

    /// Recomputes the paging mode from `registers`.
    pub fn reconfigure(&mut self, registers: &Registers) -> Option<PagingMode> {
        self.mode = registers.paging_mode();
        tracing::debug!(mode = ?self.mode, "page directory reconfigured");
        self.mode
    }

    /// Returns the paging mode.
    pub fn mode(&self) -> Option<PagingMode> {
        self.mode
    }

    /// Returns the number of levels walked per translation.
    pub fn levels(&self) -> usize {
        self.mode.map_or(0, PagingMode::levels)
    }

    /// Translates `va` through the paging structures rooted at `root`.
    ///
    /// Not-present entries are offered to the domain's page fault handler.
    /// If the fault cannot be resolved, fails with
    /// [`MemoryError::VirtualAddressNotPresent`] carrying `va` and `root`.
    pub fn translate<Driver>(
        &self,
        domain: &Domain<Driver>,
        va: Va,
        root: Pa,
    ) -> Result<Pa, MemoryError>
    where
        Driver: DomainDriver<Architecture = X86>,
    {
        let Some(mode) = self.mode
        else {
            return Ok(Pa(va.0));
        };

        let mut entries = TranslationEntries::new();
        walk(domain, mode, va, root, &mut entries, true)
    }

    /// Walks the paging structures for `va` and records every consulted
    /// entry.
    ///
    /// The walk stops at the first entry that cannot be read or is not
    /// present; the page fault handler is not consulted.
    pub fn translation<Driver>(&self, domain: &Domain<Driver>, va: Va, root: Pa) -> VaTranslation
    where
        Driver: DomainDriver<Architecture = X86>,
    {
        let mut entries = TranslationEntries::new();

        let pa = match self.mode {
            Some(mode) => walk(domain, mode, va, root, &mut entries, false).ok(),
            None => Some(Pa(va.0)),
        };

        VaTranslation { entries, pa }
    }
}

fn walk<Driver>(
    domain: &Domain<Driver>,
    mode: PagingMode,
    va: Va,
    root: Pa,
    entries: &mut TranslationEntries,
    resolve_faults: bool,
) -> Result<Pa, MemoryError>
where
    Driver: DomainDriver<Architecture = X86>,
{
    let mut restarts = 0;

    'walk: loop {
        entries.clear();

        let mut level = mode.top_level();
        let mut table = Pa(root.0 & mode.root_mask());

        loop {
            let entry_address = table + mode.index(va, level) * mode.entry_size() as u64;
            let mut entry = read_entry(domain, mode, entry_address)?;

            if !entry.present() {
                tracing::trace!(%va, %root, ?level, entry = entry.0, "entry not present");

                let resolution = match resolve_faults {
                    true => domain.handle_page_fault(PageFault { address: va, root }, entry.0),
                    false => PageFaultResolution::Failure,
                };

                match resolution {
                    PageFaultResolution::Fixed(raw) if PageTableEntry(raw).present() => {
                        entry = PageTableEntry(raw);
                    }
                    PageFaultResolution::Retry if restarts < MAX_PAGE_FAULT_RETRIES => {
                        restarts += 1;
                        continue 'walk;
                    }
                    PageFaultResolution::Retry => {
                        tracing::warn!(%va, %root, restarts, "page fault still unresolved");
                        return Err(MemoryError::page_fault((va, root)));
                    }
                    _ => {
                        entries.push(TranslationEntry {
                            level,
                            entry,
                            entry_address,
                        });
                        return Err(MemoryError::page_fault((va, root)));
                    }
                }
            }

            entries.push(TranslationEntry {
                level,
                entry,
                entry_address,
            });

            let leaf = mode.large_page_at(level) && entry.large();
            match level.next() {
                Some(next) if !leaf => {
                    table = entry.address();
                    level = next;
                }
                _ => {
                    let offset_mask = mode.offset_mask(level);
                    return Ok(Pa(
                        (entry.0 & ENTRY_ADDRESS_MASK & !offset_mask) | (va.0 & offset_mask)
                    ));
                }
            }
        }
    }
}

fn read_entry<Driver>(
    domain: &Domain<Driver>,
    mode: PagingMode,
    address: Pa,
) -> Result<PageTableEntry, MemoryError>
where
    Driver: DomainDriver<Architecture = X86>,
{
    let page = domain.map_page(X86::gfn_from_pa(address))?;
    let offset = X86::pa_offset(address) as usize;
    let bytes = page
        .get(offset..offset + mode.entry_size())
        .ok_or(MemoryError::OutOfBounds)?;

    match mode {
        PagingMode::Legacy => u32::read_from_bytes(bytes)
            .map(|raw| PageTableEntry(raw as u64))
            .map_err(|_| MemoryError::OutOfBounds),
        PagingMode::Pae | PagingMode::Ia32e => {
            PageTableEntry::read_from_bytes(bytes).map_err(|_| MemoryError::OutOfBounds)
        }
    }
}
