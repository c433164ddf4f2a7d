use guestmem_core::{Gfn, Pa, Va};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Bits of a page table entry holding the physical address of the next
/// table or of the page.
pub const ENTRY_ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Supported paging modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PagingMode {
    /// 32-bit paging: two levels of 4-byte entries.
    Legacy,

    /// Physical Address Extension: three levels of 8-byte entries, 32-bit
    /// linear addresses.
    Pae,

    /// IA-32e (4-level) paging used in long mode.
    Ia32e,
}

impl PagingMode {
    /// Returns the number of levels of the paging structures.
    pub fn levels(self) -> usize {
        match self {
            Self::Legacy => 2,
            Self::Pae => 3,
            Self::Ia32e => 4,
        }
    }

    /// Returns the size of a page table entry in bytes.
    pub fn entry_size(self) -> usize {
        match self {
            Self::Legacy => 4,
            Self::Pae | Self::Ia32e => 8,
        }
    }

    /// Returns the number of virtual address bits used to index a table.
    pub fn bits_per_level(self) -> u32 {
        match self {
            Self::Legacy => 10,
            Self::Pae | Self::Ia32e => 9,
        }
    }

    /// Returns the mask of the virtual address bits that take part in
    /// translation.
    pub fn va_mask(self) -> u64 {
        match self {
            Self::Legacy | Self::Pae => 0xffff_ffff,
            Self::Ia32e => 0x0000_ffff_ffff_ffff,
        }
    }

    /// Returns the mask of the virtual address bits indexing the top-level
    /// table.
    pub fn top_index_mask(self) -> u64 {
        match self {
            Self::Legacy => 0xffc0_0000,
            Self::Pae => 0x0000_007f_c000_0000,
            Self::Ia32e => 0x0000_ff80_0000_0000,
        }
    }

    /// Returns the mask applied to the root (`CR3`) to locate the top-level
    /// table.
    ///
    /// The PAE page directory pointer table is only 32-byte aligned.
    pub fn root_mask(self) -> u64 {
        match self {
            Self::Legacy => 0xffff_f000,
            Self::Pae => 0xffff_ffe0,
            Self::Ia32e => 0x000f_ffff_ffff_f000,
        }
    }

    /// Returns the address width (i.e. pointer size) of the paging mode in
    /// bytes.
    pub fn address_width(self) -> usize {
        match self {
            Self::Legacy | Self::Pae => 4,
            Self::Ia32e => 8,
        }
    }

    /// Returns the level of the table the root points to.
    pub fn top_level(self) -> PageTableLevel {
        match self {
            Self::Legacy => PageTableLevel::Pd,
            Self::Pae => PageTableLevel::Pdpt,
            Self::Ia32e => PageTableLevel::Pml4,
        }
    }

    /// Checks whether an entry at `level` may map a large page.
    pub fn large_page_at(self, level: PageTableLevel) -> bool {
        match level {
            PageTableLevel::Pd => true,
            PageTableLevel::Pdpt => self == Self::Ia32e,
            PageTableLevel::Pt | PageTableLevel::Pml4 => false,
        }
    }

    /// Returns the position of the lowest virtual address bit indexing a
    /// table at `level`.
    pub fn shift(self, level: PageTableLevel) -> u32 {
        12 + self.bits_per_level() * level as u32
    }

    /// Returns the index into the table at `level` for `va`.
    pub fn index(self, va: Va, level: PageTableLevel) -> u64 {
        let shift = self.shift(level);
        let mask = match level == self.top_level() {
            true => self.top_index_mask(),
            false => ((1 << self.bits_per_level()) - 1) << shift,
        };

        (va.0 & self.va_mask() & mask) >> shift
    }

    /// Returns the mask of the in-page bits of a page mapped at `level`.
    pub fn offset_mask(self, level: PageTableLevel) -> u64 {
        (1 << self.shift(level)) - 1
    }
}

/// The levels in the page table hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PageTableLevel {
    /// Page Table (PT), pointing to 4KB pages.
    Pt,

    /// Page Directory (PD), pointing to PTs or large pages (4MB with 32-bit
    /// paging, 2MB otherwise).
    Pd,

    /// Page Directory Pointer Table (PDPT), pointing to PDs or, in IA-32e
    /// mode, 1GB pages.
    Pdpt,

    /// Page Map Level 4 (PML4).
    Pml4,
}

impl PageTableLevel {
    /// Returns the next lower level in the page table hierarchy.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Pt => None,
            Self::Pd => Some(Self::Pt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pml4 => Some(Self::Pdpt),
        }
    }
}

bitflags::bitflags! {
    /// Flags of a page table entry.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageTableFlags: u64 {
        /// The entry is present.
        const PRESENT       = 1 << 0;

        /// Writes are allowed.
        const WRITE         = 1 << 1;

        /// User-mode accesses are allowed.
        const USER          = 1 << 2;

        /// Page-level write-through.
        const WRITE_THROUGH = 1 << 3;

        /// Page-level cache disable.
        const CACHE_DISABLE = 1 << 4;

        /// The entry was used for translation.
        const ACCESSED      = 1 << 5;

        /// The page was written to.
        const DIRTY         = 1 << 6;

        /// The entry maps a large page (PS).
        const LARGE         = 1 << 7;

        /// The translation is global.
        const GLOBAL        = 1 << 8;

        /// Instruction fetches are not allowed (XD).
        const NO_EXECUTE    = 1 << 63;
    }
}

/// A page table entry.
///
/// 32-bit paging entries are zero-extended to 64 bits.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    /// Returns the flags of the entry.
    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    /// Checks if the entry is present.
    pub fn present(self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    /// Checks if the page is writable.
    pub fn write(self) -> bool {
        self.flags().contains(PageTableFlags::WRITE)
    }

    /// Checks if the page is accessible in user mode.
    pub fn user(self) -> bool {
        self.flags().contains(PageTableFlags::USER)
    }

    /// Checks if this entry maps a large page.
    pub fn large(self) -> bool {
        self.flags().contains(PageTableFlags::LARGE)
    }

    /// Returns the physical address stored in the entry.
    pub fn address(self) -> Pa {
        Pa(self.0 & ENTRY_ADDRESS_MASK)
    }

    /// Returns the frame number stored in the entry.
    pub fn pfn(self) -> Gfn {
        Gfn(self.address().0 >> 12)
    }
}

impl std::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("flags", &self.flags())
            .field("address", &self.address())
            .finish()
    }
}

impl From<u64> for PageTableEntry {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
