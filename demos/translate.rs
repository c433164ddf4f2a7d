//! Walks x86 page tables in a memory file.
//!
//! Usage: `translate [<memory-file> <cr3> <va>...]`
//!
//! With a memory file, the addresses are translated with IA-32e paging
//! rooted at `cr3`. Without arguments, a small 32-bit guest is built in a
//! `memfd` and translated instead.

use guestmem::{
    Domain, DomainDriver as _, MemoryError, Pa, Va, VcpuId,
    arch::x86::{Cr0, Cr3, Cr4, MsrEfer, Registers, SegmentAccess, SegmentDescriptor, X86},
    driver::memfile::MemfileDriver,
};

type Guest = (MemfileDriver<X86>, Pa, Vec<Va>);

fn parse_hex(value: &str) -> Result<u64, std::num::ParseIntError> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
}

/// 32-bit guest: PD at 0x1000, PT at 0x2000, 0x00401000 -> 0x5000.
fn demo_guest() -> Result<Guest, MemoryError> {
    let driver = MemfileDriver::<X86>::anonymous("translate-demo", 16 * 0x1000, 1)?;

    driver.write_physical(Pa(0x1004), &(0x2000u32 | 0x7).to_le_bytes())?;
    driver.write_physical(Pa(0x2004), &(0x5000u32 | 0x3).to_le_bytes())?;
    driver.write_physical(Pa(0x5000), b"Hello from the guest\0")?;

    driver.set_registers(
        VcpuId(0),
        Registers {
            cr0: Cr0(1 << 31),
            cr3: Cr3(0x1000),
            ..Default::default()
        },
    )?;

    Ok((driver, Pa(0x1000), vec![Va(0x0040_1000), Va(0x0040_2000)]))
}

fn file_guest(args: &[String]) -> Result<Guest, Box<dyn std::error::Error>> {
    let [path, cr3, addresses @ ..] = args
    else {
        return Err("usage: translate [<memory-file> <cr3> <va>...]".into());
    };

    let root = Pa(parse_hex(cr3)?);
    let addresses = addresses
        .iter()
        .map(|va| parse_hex(va).map(Va))
        .collect::<Result<Vec<_>, _>>()?;

    let driver = MemfileDriver::<X86>::open(path, 1)?;
    driver.set_registers(
        VcpuId(0),
        Registers {
            cr0: Cr0(1 << 31),
            cr3: Cr3(root.0),
            cr4: Cr4(1 << 5),
            msr_efer: MsrEfer((1 << 8) | (1 << 10)),
            cs: SegmentDescriptor {
                access: SegmentAccess(1 << 9),
                ..Default::default()
            },
            ..Default::default()
        },
    )?;

    Ok((driver, root, addresses))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let (driver, root, addresses) = match args.is_empty() {
        true => demo_guest()?,
        false => file_guest(&args)?,
    };

    let domain = Domain::new(driver);
    let _pause_guard = domain.pause_guard()?;

    tracing::info!(mode = ?domain.paging_mode()?, %root, "translating");

    for va in addresses {
        let translation = X86::translation(&domain, va, root)?;
        for entry in translation.entries() {
            println!("  {:?} @ {}: {:?}", entry.level, entry.entry_address, entry.entry);
        }

        match domain.translate_address(va, root) {
            Ok(pa) => {
                let text = domain.read_string_limited(domain.virt(va, root), 64)?;
                println!("{va} -> {pa} {text:?}");
            }
            Err(MemoryError::VirtualAddressNotPresent(pf)) => {
                println!("{} not present (root {})", pf.address, pf.root);
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}
