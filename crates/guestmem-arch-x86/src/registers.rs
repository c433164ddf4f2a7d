use guestmem_core::{Pa, Va};

use crate::{Cr0, Cr3, Cr4, MsrEfer, PagingMode, SegmentDescriptor, X86};

/// The state of the CPU registers relevant to memory access.
#[expect(missing_docs)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,

    pub cr0: Cr0,
    pub cr3: Cr3,
    pub cr4: Cr4,
    pub msr_efer: MsrEfer,

    pub cs: SegmentDescriptor,
}

impl Registers {
    /// Determines the paging mode from the control registers.
    ///
    /// - CR0.PG clear: paging disabled, `None`
    /// - CR4.PAE clear: 32-bit paging
    /// - CR4.PAE set, IA32_EFER.LMA (or LME) set: IA-32e paging
    /// - CR4.PAE set otherwise: PAE paging
    pub fn paging_mode(&self) -> Option<PagingMode> {
        if !self.cr0.paging() {
            return None;
        }

        if !self.cr4.physical_address_extension() {
            return Some(PagingMode::Legacy);
        }

        if self.msr_efer.long_mode_active() || self.msr_efer.long_mode_enable() {
            return Some(PagingMode::Ia32e);
        }

        Some(PagingMode::Pae)
    }
}

impl guestmem_core::Registers for Registers {
    type Architecture = X86;

    fn instruction_pointer(&self) -> u64 {
        self.rip
    }

    fn stack_pointer(&self) -> u64 {
        self.rsp
    }

    fn address_width(&self) -> usize {
        self.paging_mode().map_or(0, PagingMode::address_width)
    }

    fn effective_address_width(&self) -> usize {
        // With long mode active, CS.L selects between 64-bit mode and
        // compatibility mode.
        match self.paging_mode() {
            Some(PagingMode::Ia32e) if !self.cs.access.long_mode() => 4,
            Some(mode) => mode.address_width(),
            None => 0,
        }
    }

    fn translation_root(&self, _va: Va) -> Pa {
        self.cr3.into()
    }
}
