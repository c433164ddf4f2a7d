use crate::{Pa, Va};

/// An error that can occur when accessing guest memory.
#[derive(thiserror::Error, Debug)]
pub enum MemoryError {
    /// An error occurred in the domain driver.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error>),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A page table entry on the translation path is not present.
    ///
    /// The fault always carries the virtual address that was originally
    /// requested, not the address of the failing page table entry.
    #[error("Virtual address not present ({:?}, root: {:?})", .0.address, .0.root)]
    VirtualAddressNotPresent(PageFault),

    /// A guest physical frame could not be mapped into the host.
    #[error("Bad physical address {pa}")]
    BadPhysicalAddress {
        /// The guest physical address that failed to map.
        pa: Pa,

        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A null address was mapped or dereferenced.
    #[error("Null address ({})", .0.as_deref().unwrap_or("no context"))]
    NullAddress(Option<String>),

    /// The host could not reserve address space for a mapping.
    #[error("Failed to reserve {requested} bytes of host address space")]
    AllocationFailed {
        /// The number of bytes requested.
        requested: usize,

        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A generic memory error.
    #[error("{message}")]
    Memory {
        /// Description of the failure.
        message: String,

        /// The underlying OS error, if any.
        #[source]
        source: Option<std::io::Error>,
    },

    /// The given address has invalid width.
    #[error("Invalid address width")]
    InvalidAddressWidth,

    /// Operation not supported.
    #[error("Operation not supported.")]
    NotSupported,

    /// Out of bounds.
    #[error("Out of bounds")]
    OutOfBounds,

    /// The host address of a mapped object is not suitably aligned for its
    /// type.
    #[error("Misaligned access")]
    Misaligned,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

/// A page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageFault {
    /// The virtual address that caused the page fault.
    pub address: Va,

    /// The root of the page table hierarchy.
    pub root: Pa,
}

impl From<(Va, Pa)> for PageFault {
    fn from((address, root): (Va, Pa)) -> Self {
        Self { address, root }
    }
}

impl MemoryError {
    /// Creates a new page fault error.
    pub fn page_fault(pf: impl Into<PageFault>) -> Self {
        Self::VirtualAddressNotPresent(pf.into())
    }

    /// Creates a new generic memory error without an OS error attached.
    pub fn memory(message: impl Into<String>) -> Self {
        Self::Memory {
            message: message.into(),
            source: None,
        }
    }

    /// Returns the page fault carried by this error, if any.
    pub fn as_page_fault(&self) -> Option<PageFault> {
        match self {
            Self::VirtualAddressNotPresent(pf) => Some(*pf),
            _ => None,
        }
    }

    /// Returns the OS error number associated with this error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Io(err)
            | Self::BadPhysicalAddress { source: err, .. }
            | Self::AllocationFailed { source: err, .. }
            | Self::Memory {
                source: Some(err), ..
            } => err.raw_os_error(),
            _ => None,
        }
    }
}
