use crate::PageFault;

/// The number of times a page table walk restarts after
/// [`PageFaultResolution::Retry`] before it gives up.
pub const MAX_PAGE_FAULT_RETRIES: usize = 8;

/// The outcome of a [`PageFaultHandler`] invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultResolution {
    /// The handler produced a replacement entry; the walk continues with it.
    Fixed(u64),

    /// The handler changed guest state; the walk restarts from the root.
    Retry,

    /// The fault cannot be resolved.
    Failure,
}

/// Resolves page table entries that are not present.
///
/// Operating system layers use this to decode software PTE formats (for
/// example transition or pagefile entries) that the hardware walk would
/// reject. The handler receives the faulting virtual address and the raw
/// entry that was not present.
pub trait PageFaultHandler {
    /// Attempts to resolve a not-present entry.
    fn handle_page_fault(&self, fault: PageFault, entry: u64) -> PageFaultResolution;
}

impl<F> PageFaultHandler for F
where
    F: Fn(PageFault, u64) -> PageFaultResolution,
{
    fn handle_page_fault(&self, fault: PageFault, entry: u64) -> PageFaultResolution {
        self(fault, entry)
    }
}
