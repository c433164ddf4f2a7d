use guestmem_core::{Gfn, MemoryError, Pa, VcpuId};

/// Error type for the memory file driver.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A guest frame could not be mapped from the memory file.
    #[error("Failed to map frame {gfn}")]
    Frame {
        /// The frame that failed to map.
        gfn: Gfn,

        /// The address of the frame.
        pa: Pa,

        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The host address space for a mapping could not be reserved.
    #[error("Failed to reserve {requested} bytes")]
    Reserve {
        /// The number of bytes requested.
        requested: usize,

        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The virtual CPU does not exist.
    #[error("Invalid vCPU {0}")]
    InvalidVcpu(VcpuId),

    /// The memory file name contains a NUL byte.
    #[error("Invalid memory file name")]
    InvalidName,

    /// An empty list of frames was requested.
    #[error("Tried to map 0 frames")]
    NoFrames,
}

impl From<Error> for MemoryError {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(source) => Self::Io(source),
            Error::Frame { pa, source, .. } => Self::BadPhysicalAddress { pa, source },
            Error::Reserve { requested, source } => Self::AllocationFailed { requested, source },
            Error::NoFrames => Self::memory("Tried to map 0 frames"),
            value => Self::Driver(Box::new(value)),
        }
    }
}
