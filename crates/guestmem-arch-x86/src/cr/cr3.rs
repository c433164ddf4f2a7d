use guestmem_core::Pa;

/// `CR3` control register.
///
/// Holds the root of the paging structures.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Cr3(pub u64);

impl Cr3 {
    /// Returns the process-context identifier (PCID).
    ///
    /// Only meaningful when CR4.PCIDE is set.
    pub fn pcid(self) -> u16 {
        (self.0 & 0xfff) as _
    }

    /// Returns the 4KB-aligned physical address of the top-level table.
    pub fn table_address(self) -> Pa {
        Pa(self.0 & 0x000f_ffff_ffff_f000)
    }
}

impl std::fmt::Debug for Cr3 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cr3")
            .field("pcid", &self.pcid())
            .field("table_address", &self.table_address())
            .finish()
    }
}

impl From<u64> for Cr3 {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Cr3> for u64 {
    fn from(value: Cr3) -> Self {
        value.0
    }
}

impl From<Cr3> for Pa {
    fn from(value: Cr3) -> Self {
        Self(value.0)
    }
}
