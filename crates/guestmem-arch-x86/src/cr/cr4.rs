/// `CR4` control register.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Cr4(pub u64);

impl Cr4 {
    /// Checks if 4MB pages are enabled for 32-bit paging (CR4.PSE).
    pub fn page_size_extension(self) -> bool {
        (self.0 >> 4) & 1 != 0
    }

    /// Checks if Physical Address Extension is enabled (CR4.PAE).
    ///
    /// Required for PAE and IA-32e paging.
    pub fn physical_address_extension(self) -> bool {
        (self.0 >> 5) & 1 != 0
    }

    /// Checks if global pages are enabled (CR4.PGE).
    pub fn page_global_enable(self) -> bool {
        (self.0 >> 7) & 1 != 0
    }

    /// Checks if process-context identifiers are enabled (CR4.PCIDE).
    pub fn pcid_enable(self) -> bool {
        (self.0 >> 17) & 1 != 0
    }
}

impl std::fmt::Debug for Cr4 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cr4")
            .field("page_size_extension", &self.page_size_extension())
            .field("physical_address_extension", &self.physical_address_extension())
            .field("page_global_enable", &self.page_global_enable())
            .field("pcid_enable", &self.pcid_enable())
            .finish()
    }
}

impl From<u64> for Cr4 {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Cr4> for u64 {
    fn from(value: Cr4) -> Self {
        value.0
    }
}
