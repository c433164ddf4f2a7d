/// `CR0` control register.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Cr0(pub u64);

impl Cr0 {
    /// Checks if protected mode is enabled (CR0.PE).
    pub fn protection_enable(self) -> bool {
        self.0 & 1 != 0
    }

    /// Checks if supervisor writes to read-only pages are inhibited
    /// (CR0.WP).
    pub fn write_protect(self) -> bool {
        (self.0 >> 16) & 1 != 0
    }

    /// Checks if paging is enabled (CR0.PG).
    ///
    /// With paging disabled, linear addresses are physical addresses.
    pub fn paging(self) -> bool {
        (self.0 >> 31) & 1 != 0
    }
}

impl std::fmt::Debug for Cr0 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cr0")
            .field("protection_enable", &self.protection_enable())
            .field("write_protect", &self.write_protect())
            .field("paging", &self.paging())
            .finish()
    }
}

impl From<u64> for Cr0 {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Cr0> for u64 {
    fn from(value: Cr0) -> Self {
        value.0
    }
}
