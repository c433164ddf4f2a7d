//! Guest memory translation and typed pointers for Virtual Machine
//! Introspection.
//!
//! This crate re-exports the member crates of the workspace:
//!
//! - [`guestmem_core`] at the top level: the [`Domain`], address types,
//!   mapping caches and typed pointers.
//! - [`arch`]: architecture support, enabled by the `arch-*` features.
//! - [`driver`]: memory backends, enabled by the `driver-*` features.

pub use guestmem_core::*;

/// Architecture support.
pub mod arch {
    /// x86 paging (32-bit, PAE and IA-32e).
    #[cfg(feature = "arch-x86")]
    pub mod x86 {
        pub use guestmem_arch_x86::*;
    }
}

/// Memory backends.
pub mod driver {
    /// Guest RAM stored in a file or `memfd`.
    #[cfg(feature = "driver-memfile")]
    pub mod memfile {
        pub use guestmem_driver_memfile::*;
    }
}
