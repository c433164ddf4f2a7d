use serde::{Deserialize, Serialize};

use super::macros::impl_address;

impl_address!(Gfn, "Guest Frame Number");
impl_address!(Pa, "Guest Physical Address");
impl_address!(Va, "Guest Virtual Address");

/// The mechanism used for translating an address to a physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TranslationMechanism {
    /// The address is already a guest physical address.
    Direct,

    /// The address is a guest virtual address translated through the page
    /// tables rooted at `root`.
    Paging {
        /// Root of the paging structures (e.g., `CR3` on x86).
        root: Pa,
    },
}

/// Describes a single memory access: an address plus the way it is resolved
/// to guest physical memory.
///
/// Page-aligned access contexts are also used as keys of the V2P cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccessContext {
    /// The address to access.
    ///
    /// Depending on the [`mechanism`] field, this is either a virtual or a
    /// physical address.
    ///
    /// [`mechanism`]: Self::mechanism
    pub address: u64,

    /// The mechanism used for address translation.
    pub mechanism: TranslationMechanism,
}

impl AccessContext {
    /// Creates a new `AccessContext` addressing physical memory directly.
    pub fn direct(address: impl Into<Pa>) -> Self {
        Self {
            address: address.into().0,
            mechanism: TranslationMechanism::Direct,
        }
    }

    /// Creates a new `AccessContext` with paging-based translation.
    pub fn paging(address: impl Into<Va>, root: impl Into<Pa>) -> Self {
        Self {
            address: address.into().0,
            mechanism: TranslationMechanism::Paging { root: root.into() },
        }
    }

    /// Returns the same context with the address rounded down to `mask`.
    pub fn align_down(self, mask: u64) -> Self {
        Self {
            address: self.address & mask,
            ..self
        }
    }
}

impl From<Pa> for AccessContext {
    fn from(value: Pa) -> Self {
        Self::direct(value)
    }
}

impl From<(Va, Pa)> for AccessContext {
    fn from(value: (Va, Pa)) -> Self {
        Self::paging(value.0, value.1)
    }
}

impl ::std::ops::Add<u64> for AccessContext {
    type Output = AccessContext;

    fn add(self, rhs: u64) -> Self::Output {
        Self {
            address: self.address.wrapping_add(rhs),
            ..self
        }
    }
}

impl ::std::ops::AddAssign<u64> for AccessContext {
    fn add_assign(&mut self, rhs: u64) {
        self.address = self.address.wrapping_add(rhs);
    }
}
