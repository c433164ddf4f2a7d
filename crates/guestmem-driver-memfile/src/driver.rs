use std::{
    cell::{Cell, RefCell},
    ffi::CString,
    fs::{File, OpenOptions},
    io,
    os::{
        fd::{AsRawFd as _, FromRawFd as _},
        unix::fs::FileExt as _,
    },
    path::Path,
};

use guestmem_core::{Architecture, DomainInfo, Gfn, GuestMemoryMapping, Pa, VcpuId};

use crate::{Error, mmap::MmapRegion};

/// Guest RAM held in a file, with register state kept by the driver.
pub struct Memfile<Arch>
where
    Arch: Architecture,
{
    file: File,
    size: u64,
    registers: RefCell<Vec<Arch::Registers>>,
    paused: Cell<bool>,
}

impl<Arch> Memfile<Arch>
where
    Arch: Architecture,
{
    pub fn new(file: File, vcpus: u16) -> Result<Self, Error> {
        let size = file.metadata()?.len();
        tracing::debug!(size, vcpus, "memory file opened");

        Ok(Self {
            file,
            size,
            registers: RefCell::new(vec![Default::default(); usize::from(vcpus)]),
            paused: Cell::new(false),
        })
    }

    pub fn open(path: impl AsRef<Path>, vcpus: u16) -> Result<Self, Error> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::new(file, vcpus)
    }

    pub fn anonymous(name: &str, size: u64, vcpus: u16) -> Result<Self, Error> {
        let name = CString::new(name).map_err(|_| Error::InvalidName)?;

        // SAFETY: `name` is a valid NUL-terminated string.
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        // SAFETY: `fd` was just created and is owned by nothing else.
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(size)?;

        Self::new(file, vcpus)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_paused(&self) -> bool {
        self.paused.get()
    }

    pub fn info(&self) -> Result<DomainInfo, Error> {
        Ok(DomainInfo {
            page_size: Arch::PAGE_SIZE,
            page_shift: Arch::PAGE_SHIFT,
            max_gfn: Gfn((self.size >> Arch::PAGE_SHIFT).saturating_sub(1)),
            vcpus: self.registers.borrow().len() as u16,
        })
    }

    pub fn pause(&self) -> Result<(), Error> {
        self.paused.set(true);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), Error> {
        self.paused.set(false);
        Ok(())
    }

    pub fn registers(&self, vcpu: VcpuId) -> Result<Arch::Registers, Error> {
        self.registers
            .borrow()
            .get(usize::from(vcpu))
            .copied()
            .ok_or(Error::InvalidVcpu(vcpu))
    }

    pub fn set_registers(&self, vcpu: VcpuId, registers: Arch::Registers) -> Result<(), Error> {
        let mut all = self.registers.borrow_mut();
        let slot = all
            .get_mut(usize::from(vcpu))
            .ok_or(Error::InvalidVcpu(vcpu))?;

        *slot = registers;
        Ok(())
    }

    pub fn read(&self, pa: Pa, buffer: &mut [u8]) -> Result<(), Error> {
        Ok(self.file.read_exact_at(buffer, pa.0)?)
    }

    pub fn write(&self, pa: Pa, buffer: &[u8]) -> Result<(), Error> {
        Ok(self.file.write_all_at(buffer, pa.0)?)
    }

    pub fn map_pfns(&self, frames: &[Gfn]) -> Result<GuestMemoryMapping, Error> {
        if frames.is_empty() {
            return Err(Error::NoFrames);
        }

        let page_size = Arch::PAGE_SIZE as usize;
        let requested = frames.len().saturating_mul(page_size);
        let mut region = MmapRegion::reserve(requested)?;

        for (index, &gfn) in frames.iter().enumerate() {
            let pa = Arch::pa_from_gfn(gfn);

            let result = match pa
                .0
                .checked_add(Arch::PAGE_SIZE)
                .is_some_and(|end| end <= self.size)
            {
                true => region.map_fixed(
                    index * page_size,
                    page_size,
                    self.file.as_raw_fd(),
                    pa.0,
                ),
                false => Err(io::Error::from_raw_os_error(libc::EINVAL)),
            };

            if let Err(source) = result {
                tracing::warn!(%gfn, %source, "failed to map frame");
                return Err(Error::Frame { gfn, pa, source });
            }
        }

        Ok(GuestMemoryMapping::new(region, frames))
    }
}
