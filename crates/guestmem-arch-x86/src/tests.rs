use std::{cell::Cell, rc::Rc};

use guestmem_core::{
    Domain, DomainDriver, DomainInfo, Gfn, GuestMemoryMapping, HostMapping,
    MAX_PAGE_FAULT_RETRIES, MemoryError, Pa, PageFault, PageFaultResolution, Registers as _, Va,
    VcpuId,
};

use crate::{
    Cr0, Cr3, Cr4, MsrEfer, PageDirectory, PageTableLevel, PagingMode, Registers,
    SegmentAccess, SegmentDescriptor, X86,
};

const PAGES: usize = 64;

const CR0_PG: u64 = 1 << 31;
const CR4_PAE: u64 = 1 << 5;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;

const P: u64 = 1 << 0;
const RW: u64 = 1 << 1;
const US: u64 = 1 << 2;
const PS: u64 = 1 << 7;

///////////////////////////////////////////////////////////////////////////////
// Mock Driver
///////////////////////////////////////////////////////////////////////////////

/// A window into the driver memory, shared with the driver itself.
struct SharedWindow {
    memory: Rc<[Cell<u8>]>,
    offset: usize,
    len: usize,
}

// SAFETY: the window is a range of `Cell`s kept alive by `memory`.
unsafe impl HostMapping for SharedWindow {
    fn as_ptr(&self) -> *mut u8 {
        self.memory[self.offset..].as_ptr() as *mut u8
    }

    fn len(&self) -> usize {
        self.len
    }
}

struct MockDriver {
    memory: Rc<[Cell<u8>]>,
    registers: Cell<Registers>,
}

impl MockDriver {
    fn new(registers: Registers) -> Self {
        Self {
            memory: (0..PAGES * 0x1000).map(|_| Cell::new(0)).collect(),
            registers: Cell::new(registers),
        }
    }
}

fn write_phys(memory: &[Cell<u8>], pa: u64, data: &[u8]) {
    for (index, byte) in data.iter().enumerate() {
        memory[pa as usize + index].set(*byte);
    }
}

impl DomainDriver for MockDriver {
    type Architecture = X86;

    fn info(&self) -> Result<DomainInfo, MemoryError> {
        Ok(DomainInfo {
            page_size: 0x1000,
            page_shift: 12,
            max_gfn: Gfn(PAGES as u64 - 1),
            vcpus: 1,
        })
    }

    fn pause(&self) -> Result<(), MemoryError> {
        Ok(())
    }

    fn resume(&self) -> Result<(), MemoryError> {
        Ok(())
    }

    fn registers(&self, _vcpu: VcpuId) -> Result<Registers, MemoryError> {
        Ok(self.registers.get())
    }

    fn set_registers(&self, _vcpu: VcpuId, registers: Registers) -> Result<(), MemoryError> {
        self.registers.set(registers);
        Ok(())
    }

    fn map_pfns(&self, frames: &[Gfn]) -> Result<GuestMemoryMapping, MemoryError> {
        let Some(first) = frames.first()
        else {
            return Err(MemoryError::memory("Tried to map 0 frames"));
        };

        let contiguous = frames
            .iter()
            .enumerate()
            .all(|(index, gfn)| gfn.0 == first.0 + index as u64);

        if !contiguous || first.0 as usize + frames.len() > PAGES {
            return Err(MemoryError::BadPhysicalAddress {
                pa: Pa(first.0 << 12),
                source: std::io::ErrorKind::InvalidInput.into(),
            });
        }

        let window = SharedWindow {
            memory: Rc::clone(&self.memory),
            offset: first.0 as usize * 0x1000,
            len: frames.len() * 0x1000,
        };

        Ok(GuestMemoryMapping::new(window, frames))
    }
}

///////////////////////////////////////////////////////////////////////////////
// Helpers
///////////////////////////////////////////////////////////////////////////////

fn registers(cr0: u64, cr4: u64, efer: u64, cr3: u64) -> Registers {
    Registers {
        cr0: Cr0(cr0),
        cr3: Cr3(cr3),
        cr4: Cr4(cr4),
        msr_efer: MsrEfer(efer),
        cs: SegmentDescriptor {
            access: SegmentAccess(1 << 9),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn legacy() -> Registers {
    registers(CR0_PG, 0, 0, 0x1000)
}

fn pae(cr3: u64) -> Registers {
    registers(CR0_PG, CR4_PAE, 0, cr3)
}

fn ia32e(cr3: u64) -> Registers {
    registers(CR0_PG, CR4_PAE, EFER_LME | EFER_LMA, cr3)
}

fn make_domain(registers: Registers) -> Domain<MockDriver> {
    Domain::new(MockDriver::new(registers))
}

fn entry32(domain: &Domain<MockDriver>, pa: u64, value: u32) {
    write_phys(&domain.driver().memory, pa, &value.to_le_bytes());
}

fn entry64(domain: &Domain<MockDriver>, pa: u64, value: u64) {
    write_phys(&domain.driver().memory, pa, &value.to_le_bytes());
}

/// 32-bit paging: PD at 0x1000, PT at 0x2000.
///
/// - 0x00401000 -> 0x5000
/// - 0x00402000 not present
/// - 0x00800000 -> 4MB page at 0x00c00000
fn legacy_domain() -> Domain<MockDriver> {
    let domain = make_domain(legacy());
    entry32(&domain, 0x1000 + 1 * 4, 0x2000 | (P | RW | US) as u32);
    entry32(&domain, 0x2000 + 1 * 4, 0x5000 | (P | RW) as u32);
    entry32(&domain, 0x1000 + 2 * 4, 0x00c0_0000 | (P | RW | PS) as u32);
    domain
}

/// IA-32e paging: PML4 at 0x1000, PDPT at 0x2000, PD at 0x3000, PT at 0x4000.
///
/// - 0x0000_0080_4020_1000 -> 0x7000
/// - 0x0000_0080_4040_0000 -> 2MB page at 0x0060_0000
/// - 0x0000_0080_8000_0000 -> 1GB page at 0x4000_0000
/// - 0x0000_0080_c000_0000 not present at the PDPT level
fn ia32e_domain() -> Domain<MockDriver> {
    let domain = make_domain(ia32e(0x1000));
    entry64(&domain, 0x1000 + 1 * 8, 0x2000 | P | RW | US);
    entry64(&domain, 0x2000 + 1 * 8, 0x3000 | P | RW | US);
    entry64(&domain, 0x3000 + 1 * 8, 0x4000 | P | RW | US);
    entry64(&domain, 0x4000 + 1 * 8, 0x7000 | P | RW);
    entry64(&domain, 0x3000 + 2 * 8, 0x0060_0000 | P | RW | PS);
    entry64(&domain, 0x2000 + 2 * 8, 0x4000_0000 | P | PS);
    domain
}

///////////////////////////////////////////////////////////////////////////////
// Registers
///////////////////////////////////////////////////////////////////////////////

#[test]
fn paging_mode_from_registers() {
    assert_eq!(registers(0, 0, 0, 0).paging_mode(), None);
    assert_eq!(registers(0, CR4_PAE, EFER_LMA, 0).paging_mode(), None);
    assert_eq!(legacy().paging_mode(), Some(PagingMode::Legacy));
    assert_eq!(pae(0).paging_mode(), Some(PagingMode::Pae));
    assert_eq!(ia32e(0).paging_mode(), Some(PagingMode::Ia32e));

    // EFER.LME alone is enough once PAE paging is on.
    assert_eq!(
        registers(CR0_PG, CR4_PAE, EFER_LME, 0).paging_mode(),
        Some(PagingMode::Ia32e)
    );

    // Long mode without PAE is not a valid state; 32-bit paging wins.
    assert_eq!(
        registers(CR0_PG, 0, EFER_LMA, 0).paging_mode(),
        Some(PagingMode::Legacy)
    );
}

#[test]
fn address_width_follows_paging_mode() {
    assert_eq!(registers(0, 0, 0, 0).address_width(), 0);
    assert_eq!(legacy().address_width(), 4);
    assert_eq!(pae(0).address_width(), 4);
    assert_eq!(ia32e(0).address_width(), 8);
    assert_eq!(ia32e(0).effective_address_width(), 8);

    let mut compat = ia32e(0);
    compat.cs.access = SegmentAccess(0);
    assert_eq!(compat.address_width(), 8);
    assert_eq!(compat.effective_address_width(), 4);
}

#[test]
fn translation_root_is_cr3() {
    let registers = ia32e(0x1234_5005);
    assert_eq!(registers.translation_root(Va(0)), Pa(0x1234_5005));
    assert_eq!(registers.cr3.pcid(), 5);
    assert_eq!(registers.cr3.table_address(), Pa(0x1234_5000));
}

///////////////////////////////////////////////////////////////////////////////
// Paging geometry
///////////////////////////////////////////////////////////////////////////////

#[test]
fn table_indices() {
    let va = Va(0x0000_0080_4020_1000);
    assert_eq!(PagingMode::Ia32e.index(va, PageTableLevel::Pml4), 1);
    assert_eq!(PagingMode::Ia32e.index(va, PageTableLevel::Pdpt), 1);
    assert_eq!(PagingMode::Ia32e.index(va, PageTableLevel::Pd), 1);
    assert_eq!(PagingMode::Ia32e.index(va, PageTableLevel::Pt), 1);

    let va = Va(0xffc0_3000);
    assert_eq!(PagingMode::Legacy.index(va, PageTableLevel::Pd), 0x3ff);
    assert_eq!(PagingMode::Legacy.index(va, PageTableLevel::Pt), 3);

    // PAE uses only the low 32 bits; the PDPT has four entries.
    let va = Va(0xdead_0000_c000_0000);
    assert_eq!(PagingMode::Pae.index(va, PageTableLevel::Pdpt), 3);

    // The sign extension of canonical addresses is not part of the index.
    let va = Va(0xffff_8000_0000_0000);
    assert_eq!(PagingMode::Ia32e.index(va, PageTableLevel::Pml4), 0x100);
}

#[test]
fn page_offset_masks() {
    assert_eq!(PagingMode::Legacy.offset_mask(PageTableLevel::Pd), 0x3f_ffff);
    assert_eq!(PagingMode::Pae.offset_mask(PageTableLevel::Pd), 0x1f_ffff);
    assert_eq!(PagingMode::Ia32e.offset_mask(PageTableLevel::Pdpt), 0x3fff_ffff);
    assert_eq!(PagingMode::Ia32e.offset_mask(PageTableLevel::Pt), 0xfff);

    assert!(PagingMode::Ia32e.large_page_at(PageTableLevel::Pdpt));
    assert!(!PagingMode::Pae.large_page_at(PageTableLevel::Pdpt));
    assert!(!PagingMode::Ia32e.large_page_at(PageTableLevel::Pml4));
}

///////////////////////////////////////////////////////////////////////////////
// 32-bit paging
///////////////////////////////////////////////////////////////////////////////

#[test]
fn legacy_translate() -> Result<(), MemoryError> {
    let domain = legacy_domain();
    assert_eq!(domain.translate_address(Va(0x0040_1234), Pa(0x1000))?, Pa(0x5234));

    let translation = X86::translation(&domain, Va(0x0040_1234), Pa(0x1000))?;
    assert_eq!(translation.pa(), Some(Pa(0x5234)));
    assert_eq!(translation.entries().len(), 2);
    assert_eq!(translation.entries()[0].level, PageTableLevel::Pd);
    assert_eq!(translation.entries()[0].entry_address, Pa(0x1004));
    assert_eq!(translation.entries()[1].level, PageTableLevel::Pt);
    assert_eq!(translation.entries()[1].entry.pfn(), Gfn(5));
    assert!(translation.present());
    assert!(translation.write());
    assert!(!translation.user());
    Ok(())
}

#[test]
fn legacy_not_present_reports_requested_address() {
    let domain = legacy_domain();

    let err = domain
        .translate_address(Va(0x0040_2abc), Pa(0x1000))
        .expect_err("page is not mapped");

    let pf = err.as_page_fault().expect("page fault");
    assert_eq!(pf.address, Va(0x0040_2abc));
    assert_eq!(pf.root, Pa(0x1000));
}

#[test]
fn legacy_large_page() -> Result<(), MemoryError> {
    let domain = legacy_domain();
    assert_eq!(domain.translate_address(Va(0x0081_2345), Pa(0x1000))?, Pa(0x00c1_2345));

    let translation = X86::translation(&domain, Va(0x0081_2345), Pa(0x1000))?;
    assert_eq!(translation.entries().len(), 1);
    assert!(translation.entries()[0].is_leaf(PagingMode::Legacy));
    Ok(())
}

#[test]
fn legacy_ignores_high_address_bits() -> Result<(), MemoryError> {
    let domain = legacy_domain();
    assert_eq!(
        domain.translate_address(Va(0xffff_ffff_0040_1234), Pa(0x1000))?,
        Pa(0x5234)
    );
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// PAE paging
///////////////////////////////////////////////////////////////////////////////

#[test]
fn pae_translate_with_unaligned_root() -> Result<(), MemoryError> {
    // The PDPT only needs 32-byte alignment.
    let domain = make_domain(pae(0x10e0));
    entry64(&domain, 0x10e0 + 1 * 8, 0x3000 | P);
    entry64(&domain, 0x3000 + 1 * 8, 0x4000 | P | RW);
    entry64(&domain, 0x4000 + 1 * 8, 0x6000 | P | RW);
    entry64(&domain, 0x3000 + 2 * 8, 0x0020_0000 | P | PS);

    assert_eq!(domain.translate_address(Va(0x4020_1123), Pa(0x10e0))?, Pa(0x6123));
    assert_eq!(domain.translate_address(Va(0x4045_6789), Pa(0x10e0))?, Pa(0x0025_6789));

    let translation = X86::translation(&domain, Va(0x4020_1123), Pa(0x10e0))?;
    assert_eq!(translation.entries().len(), 3);
    assert_eq!(translation.entries()[0].entry_address, Pa(0x10e8));

    let translation = X86::translation(&domain, Va(0x4045_6789), Pa(0x10e0))?;
    assert_eq!(translation.entries().len(), 2);
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// IA-32e paging
///////////////////////////////////////////////////////////////////////////////

#[test]
fn ia32e_translate() -> Result<(), MemoryError> {
    let domain = ia32e_domain();

    // PCID bits in the root are ignored.
    assert_eq!(
        domain.translate_address(Va(0x0000_0080_4020_1abc), Pa(0x1005))?,
        Pa(0x7abc)
    );

    let translation = X86::translation(&domain, Va(0x0000_0080_4020_1abc), Pa(0x1000))?;
    let levels: Vec<_> = translation.into_iter().map(|entry| entry.level).collect();
    assert_eq!(
        levels,
        [
            PageTableLevel::Pml4,
            PageTableLevel::Pdpt,
            PageTableLevel::Pd,
            PageTableLevel::Pt,
        ]
    );
    Ok(())
}

#[test]
fn ia32e_large_pages() -> Result<(), MemoryError> {
    let domain = ia32e_domain();

    // 2MB
    assert_eq!(
        domain.translate_address(Va(0x0000_0080_4041_2345), Pa(0x1000))?,
        Pa(0x0061_2345)
    );

    // 1GB
    assert_eq!(
        domain.translate_address(Va(0x0000_0080_8765_4321), Pa(0x1000))?,
        Pa(0x4765_4321)
    );

    let translation = X86::translation(&domain, Va(0x0000_0080_8765_4321), Pa(0x1000))?;
    assert_eq!(translation.entries().len(), 2);
    assert!(!translation.write());
    Ok(())
}

#[test]
fn ia32e_partial_translation() -> Result<(), MemoryError> {
    let domain = ia32e_domain();

    let translation = X86::translation(&domain, Va(0x0000_0080_c000_0000), Pa(0x1000))?;
    assert_eq!(translation.pa(), None);
    assert_eq!(translation.entries().len(), 2);
    assert!(!translation.present());

    let err = domain
        .translate_address(Va(0x0000_0080_c000_0123), Pa(0x1000))
        .expect_err("PDPT entry is not present");
    assert_eq!(
        err.as_page_fault().map(|pf| pf.address),
        Some(Va(0x0000_0080_c000_0123))
    );
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Page fault handler
///////////////////////////////////////////////////////////////////////////////

#[test]
fn handler_fixed_entry_continues_walk() -> Result<(), MemoryError> {
    let domain = ia32e_domain().with_page_fault_handler(|_: PageFault, entry: u64| match entry {
        0 => PageFaultResolution::Fixed(0x9000 | P),
        _ => PageFaultResolution::Failure,
    });

    // The fixed PDPT entry points at an empty PD, whose entry is fixed too.
    assert_eq!(
        domain.translate_address(Va(0x0000_0080_c000_0123), Pa(0x1000))?,
        Pa(0x9123)
    );
    Ok(())
}

#[test]
fn handler_fixed_entry_must_be_present() {
    let domain = ia32e_domain().with_page_fault_handler(|_: PageFault, _: u64| {
        PageFaultResolution::Fixed(0x9000)
    });

    assert!(
        domain
            .translate_address(Va(0x0000_0080_c000_0123), Pa(0x1000))
            .is_err()
    );
}

#[test]
fn handler_retry_restarts_walk() -> Result<(), MemoryError> {
    let domain = legacy_domain();
    let memory = Rc::clone(&domain.driver().memory);

    let domain = domain.with_page_fault_handler(move |_: PageFault, _: u64| {
        // Page the entry in, then let the walk start over.
        write_phys(&memory, 0x2000 + 2 * 4, &(0x8000 | P as u32).to_le_bytes());
        PageFaultResolution::Retry
    });

    assert_eq!(domain.translate_address(Va(0x0040_2abc), Pa(0x1000))?, Pa(0x8abc));
    Ok(())
}

#[test]
fn handler_retry_is_bounded() {
    let calls = Rc::new(Cell::new(0));

    let domain = legacy_domain().with_page_fault_handler({
        let calls = Rc::clone(&calls);
        move |_: PageFault, _: u64| {
            calls.set(calls.get() + 1);
            PageFaultResolution::Retry
        }
    });

    let err = domain
        .translate_address(Va(0x0040_2abc), Pa(0x1000))
        .expect_err("walk must give up");
    assert!(err.as_page_fault().is_some());
    assert_eq!(calls.get(), MAX_PAGE_FAULT_RETRIES + 1);
}

#[test]
fn translation_does_not_consult_handler() -> Result<(), MemoryError> {
    let calls = Rc::new(Cell::new(0));

    let domain = legacy_domain().with_page_fault_handler({
        let calls = Rc::clone(&calls);
        move |_: PageFault, _: u64| {
            calls.set(calls.get() + 1);
            PageFaultResolution::Fixed(0x8000 | P)
        }
    });

    let translation = X86::translation(&domain, Va(0x0040_2abc), Pa(0x1000))?;
    assert_eq!(translation.pa(), None);
    assert_eq!(calls.get(), 0);
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Paging disabled
///////////////////////////////////////////////////////////////////////////////

#[test]
fn paging_disabled_is_identity() -> Result<(), MemoryError> {
    let domain = make_domain(registers(0, 0, 0, 0x1000));
    assert_eq!(domain.paging_mode()?, None);
    assert_eq!(domain.translate_address(Va(0x0040_1234), Pa(0x1000))?, Pa(0x0040_1234));

    let translation = X86::translation(&domain, Va(0x1234), Pa(0x1000))?;
    assert!(translation.entries().is_empty());
    assert_eq!(translation.pa(), Some(Pa(0x1234)));
    Ok(())
}

#[test]
fn page_directory_reconfigure() {
    let mut directory = PageDirectory::default();
    assert_eq!(directory.levels(), 0);

    assert_eq!(directory.reconfigure(&pae(0)), Some(PagingMode::Pae));
    assert_eq!(directory.levels(), 3);

    let directory = PageDirectory::from_registers(&ia32e(0));
    assert_eq!(directory.mode(), Some(PagingMode::Ia32e));
    assert_eq!(directory.levels(), 4);
}

#[test]
fn domain_reconfigure_switches_mode() -> Result<(), MemoryError> {
    let domain = legacy_domain();
    assert_eq!(domain.paging_mode()?, Some(PagingMode::Legacy));

    domain.reconfigure(&registers(0, 0, 0, 0));
    assert_eq!(domain.translate_address(Va(0x0040_1234), Pa(0x1000))?, Pa(0x0040_1234));

    // Invalidation drops the override; the mode is derived from vCPU 0 again.
    domain.invalidate();
    assert_eq!(domain.translate_address(Va(0x0040_1234), Pa(0x1000))?, Pa(0x5234));
    Ok(())
}
