//! Iterates a buffer of offset-linked records in guest physical memory.
//!
//! Each record starts with the offset of the next record (zero for the last
//! one), followed by a NUL-terminated name. The demo builds such a buffer in
//! a `memfd`, iterates it, then unlinks a record.

use guestmem::{
    Domain, GuestAddress as _, GuestArray, GuestPhysicalAddress, MemoryError, Pa,
    arch::x86::X86,
    driver::memfile::MemfileDriver,
    ptr::{LinkedEntry, OffsetIterable},
};

type Phys<'a> = GuestPhysicalAddress<'a, MemfileDriver<X86>>;

struct Record<'a> {
    address: Phys<'a>,
}

impl Record<'_> {
    fn name(&self) -> Result<String, MemoryError> {
        GuestArray::<_, u8>::cstring(self.address + 4u64, 64)?.to_string_lossy()
    }
}

impl<'a> LinkedEntry<Phys<'a>> for Record<'a> {
    fn from_address(address: Phys<'a>) -> Result<Self, MemoryError> {
        Ok(Self { address })
    }

    fn address(&self) -> Phys<'a> {
        self.address
    }

    fn next_entry_offset(&self) -> Result<u64, MemoryError> {
        Ok(u64::from(self.address.domain().read_u32(self.address)?))
    }
}

struct Records<'a> {
    start: Phys<'a>,
    length: u64,
}

impl<'a> OffsetIterable<Phys<'a>> for Records<'a> {
    type Entry = Record<'a>;

    fn first_entry(&self) -> Phys<'a> {
        self.start
    }

    fn buffer_end(&self) -> Result<u64, MemoryError> {
        Ok(self.start.value() + self.length)
    }
}

fn print_records(records: &Records<'_>) -> Result<(), MemoryError> {
    for record in records.iter()? {
        let record = record?;
        println!("  {}: {}", record.address, record.name()?);
    }

    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let driver = MemfileDriver::<X86>::anonymous("linked-entries", 4 * 0x1000, 1)?;
    let domain = Domain::new(driver);

    // Lay the records out so that the second one straddles a page boundary.
    let start = domain.phys(Pa(0xfe0));
    let names = ["alpha", "bravo-straddles-the-page", "charlie"];

    let mut address = start;
    for (index, name) in names.iter().enumerate() {
        let size = (4 + name.len() as u32 + 1).next_multiple_of(8);
        let next = match index + 1 == names.len() {
            true => 0,
            false => size,
        };

        domain.write_u32(address, next)?;
        domain.write(address + 4u64, name.as_bytes())?;
        domain.write_u8(address + 4u64 + name.len(), 0)?;
        address += u64::from(size);
    }

    let records = Records {
        start,
        length: address.value() - start.value(),
    };

    println!("records:");
    print_records(&records)?;

    // Unlink the second record by extending the first one over it.
    let mut iter = records.iter()?;
    let first = iter.next().ok_or("no records")??;
    let second = iter.next().ok_or("no second record")??;
    let skip = first.next_entry_offset()? + second.next_entry_offset()?;
    domain.write_u32(first.address, skip as u32)?;

    println!("after unlinking {}:", second.name()?);
    print_records(&records)?;

    Ok(())
}
