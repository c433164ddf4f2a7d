//! Core guest memory functionality.
//!
//! A [`Domain`] wraps a [`DomainDriver`] and provides translation of guest
//! virtual addresses, caching of host mappings of guest frames and byte-level
//! access to guest memory. The [`address`] and [`ptr`] modules build
//! context-carrying addresses and typed pointers on top of it.

pub mod address;
pub mod arch;
mod core;
mod driver;
mod error;
mod fault;
mod mapping;
pub mod ptr;
mod vcpu;

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    num::NonZeroUsize,
    rc::{Rc, Weak},
};

use lru::LruCache;
use zerocopy::{FromBytes, Immutable, IntoBytes};

pub use self::{
    address::{GuestAddress, GuestPhysicalAddress, GuestVirtualAddress},
    arch::{Architecture, Registers},
    core::{AccessContext, DomainInfo, Gfn, Pa, TranslationMechanism, Va, VcpuId},
    driver::DomainDriver,
    error::{MemoryError, PageFault},
    fault::{MAX_PAGE_FAULT_RETRIES, PageFaultHandler, PageFaultResolution},
    mapping::{Frames, GuestMemoryMapping, HeapMapping, HostMapping, SharedMapping},
    ptr::{
        AddressWidth, GuestArray, GuestMemberPtr, GuestPhysArray, GuestPhysPtr, GuestPtr,
        GuestRef, GuestVirtArray, GuestVirtPtr,
    },
    vcpu::Vcpu,
};

type RegistersOf<Driver> = <<Driver as DomainDriver>::Architecture as Architecture>::Registers;
type PagingModeOf<Driver> = <<Driver as DomainDriver>::Architecture as Architecture>::PagingMode;

/// Position of a frame inside a cached mapping.
#[derive(Clone)]
struct FrameSlot {
    mapping: Weak<GuestMemoryMapping>,
    index: usize,
}

struct Cache {
    mappings: RefCell<LruCache<Frames, Rc<GuestMemoryMapping>>>,
    frames: RefCell<HashMap<Gfn, FrameSlot>>,
    v2p: RefCell<LruCache<AccessContext, Pa>>,
}

impl Cache {
    const DEFAULT_SIZE: NonZeroUsize = NonZeroUsize::new(8192).unwrap();

    pub fn new() -> Self {
        Self {
            mappings: RefCell::new(LruCache::new(Self::DEFAULT_SIZE)),
            frames: RefCell::default(),
            v2p: RefCell::new(LruCache::new(Self::DEFAULT_SIZE)),
        }
    }

    /// Records where each frame of a cached mapping lives.
    ///
    /// Private copies of guest memory are not indexed; writes through them
    /// would not reach the guest.
    fn index(&self, mapping: &Rc<GuestMemoryMapping>) {
        if !mapping.is_shared() {
            return;
        }

        let mut frames = self.frames.borrow_mut();
        for (index, gfn) in mapping.frames().iter().enumerate() {
            frames.insert(*gfn, FrameSlot {
                mapping: Rc::downgrade(mapping),
                index,
            });
        }
    }

    /// Forgets the frames of a mapping that left the cache.
    fn unindex(&self, mapping: &Rc<GuestMemoryMapping>) {
        let mut frames = self.frames.borrow_mut();
        for gfn in mapping.frames() {
            let owned = frames
                .get(gfn)
                .is_some_and(|slot| std::ptr::eq(slot.mapping.as_ptr(), Rc::as_ptr(mapping)));

            if owned {
                frames.remove(gfn);
            }
        }
    }

    fn reindex(&self) {
        self.frames.borrow_mut().clear();
        for (_, mapping) in self.mappings.borrow().iter() {
            self.index(mapping);
        }
    }
}

/// Paging mode derived for a particular generation.
#[derive(Debug, Clone, Copy)]
struct PagingState<Mode> {
    generation: u64,
    mode: Option<Mode>,
}

/// An introspected domain (virtual machine).
///
/// The domain owns the driver together with two caches:
///
/// - the **mapping cache**, holding shared host mappings of guest frames,
///   keyed by the list of frames that was mapped and indexed per frame, so
///   frames inside a cached mapping are served as a view into it,
/// - the **V2P cache**, holding virtual-to-physical translations of pages.
///
/// Both caches, as well as the derived paging mode, are only valid while
/// the guest is paused. Every [`resume`] (or [`invalidate`]) advances the
/// domain *generation* and discards them. Typed pointers remember the
/// generation their mapping was acquired in and transparently re-acquire it
/// once the generation changes.
///
/// The domain is single-threaded: it is neither `Send` nor `Sync`.
///
/// [`resume`]: Self::resume
/// [`invalidate`]: Self::invalidate
pub struct Domain<Driver>
where
    Driver: DomainDriver,
{
    driver: Driver,
    cache: Cache,

    map_frames_fn: fn(&Self, &[Gfn]) -> Result<SharedMapping, MemoryError>,
    translate_access_context_fn: fn(&Self, AccessContext) -> Result<Pa, MemoryError>,

    generation: Cell<u64>,
    paging: Cell<Option<PagingState<PagingModeOf<Driver>>>>,
    page_fault_handler: Option<Box<dyn PageFaultHandler>>,

    read_string_length_limit: Cell<Option<usize>>,
}

impl<Driver> Domain<Driver>
where
    Driver: DomainDriver,
{
    /// Creates a new `Domain` instance with the given driver.
    ///
    /// Both the mapping cache and the V2P cache are enabled by default,
    /// each with a capacity of 8192 entries.
    pub fn new(driver: Driver) -> Self {
        Self {
            driver,
            cache: Cache::new(),
            map_frames_fn: Self::map_frames_cache,
            translate_access_context_fn: Self::translate_access_context_cache,
            generation: Cell::new(0),
            paging: Cell::new(None),
            page_fault_handler: None,
            read_string_length_limit: Cell::new(None),
        }
    }

    /// Enables the mapping cache with the given capacity.
    ///
    /// The mapping cache keeps recently used host mappings of guest frames
    /// alive, so that repeated accesses to the same memory do not pay for a
    /// new `mmap` every time. The capacity bounds the number of host
    /// mappings held by the cache.
    pub fn with_mapping_cache(self, size: NonZeroUsize) -> Self {
        Self {
            cache: Cache {
                mappings: RefCell::new(LruCache::new(size)),
                frames: RefCell::default(),
                ..self.cache
            },
            map_frames_fn: Self::map_frames_cache,
            ..self
        }
    }

    /// Enables the mapping cache.
    ///
    /// See [`with_mapping_cache`] for more details.
    ///
    /// [`with_mapping_cache`]: Self::with_mapping_cache
    pub fn enable_mapping_cache(&mut self) {
        self.map_frames_fn = Self::map_frames_cache;
    }

    /// Disables the mapping cache.
    ///
    /// Subsequent calls to [`map_frames_shared`] create a fresh host mapping
    /// each time.
    ///
    /// [`map_frames_shared`]: Self::map_frames_shared
    pub fn disable_mapping_cache(&mut self) {
        self.map_frames_fn = Self::map_frames_nocache;
    }

    /// Resizes the mapping cache.
    pub fn resize_mapping_cache(&mut self, size: NonZeroUsize) {
        self.cache.mappings.borrow_mut().resize(size);
        self.cache.reindex();
    }

    /// Removes every cached mapping that covers `gfn`.
    ///
    /// Returns the number of removed mappings.
    pub fn flush_mapping_cache_entry(&self, gfn: Gfn) -> usize {
        let mut cache = self.cache.mappings.borrow_mut();
        let stale: Vec<Frames> = cache
            .iter()
            .filter(|(frames, _)| frames.contains(&gfn))
            .map(|(frames, _)| frames.clone())
            .collect();

        for frames in &stale {
            if let Some(mapping) = cache.pop(frames) {
                self.cache.unindex(&mapping);
            }
        }

        stale.len()
    }

    /// Clears the entire mapping cache.
    pub fn flush_mapping_cache(&self) {
        self.cache.mappings.borrow_mut().clear();
        self.cache.frames.borrow_mut().clear();
    }

    /// Enables the virtual-to-physical (V2P) address translation cache with
    /// the given capacity.
    ///
    /// The V2P cache stores the physical page of recently translated virtual
    /// pages, keyed by the page-aligned [`AccessContext`].
    pub fn with_v2p_cache(self, size: NonZeroUsize) -> Self {
        Self {
            cache: Cache {
                v2p: RefCell::new(LruCache::new(size)),
                ..self.cache
            },
            translate_access_context_fn: Self::translate_access_context_cache,
            ..self
        }
    }

    /// Enables the V2P cache.
    ///
    /// See [`with_v2p_cache`] for more details.
    ///
    /// [`with_v2p_cache`]: Self::with_v2p_cache
    pub fn enable_v2p_cache(&mut self) {
        self.translate_access_context_fn = Self::translate_access_context_cache;
    }

    /// Disables the V2P cache.
    ///
    /// Subsequent calls to [`translate_access_context`] perform a full page
    /// table walk every time.
    ///
    /// [`translate_access_context`]: Self::translate_access_context
    pub fn disable_v2p_cache(&mut self) {
        self.translate_access_context_fn = Self::translate_access_context_nocache;
    }

    /// Resizes the V2P cache.
    pub fn resize_v2p_cache(&mut self, size: NonZeroUsize) {
        self.cache.v2p.borrow_mut().resize(size);
    }

    /// Removes a specific entry from the V2P cache.
    ///
    /// Returns the removed entry if it was present.
    pub fn flush_v2p_cache_entry(&self, ctx: AccessContext) -> Option<Pa> {
        self.cache
            .v2p
            .borrow_mut()
            .pop(&ctx.align_down(Driver::Architecture::PAGE_MASK))
    }

    /// Clears the entire V2P cache.
    pub fn flush_v2p_cache(&self) {
        self.cache.v2p.borrow_mut().clear();
    }

    /// Installs a handler consulted when a page table walk hits a
    /// not-present entry.
    pub fn with_page_fault_handler(self, handler: impl PageFaultHandler + 'static) -> Self {
        Self {
            page_fault_handler: Some(Box::new(handler)),
            ..self
        }
    }

    /// Replaces the page fault handler.
    ///
    /// Passing `None` removes the handler; not-present entries then always
    /// fail the translation.
    pub fn set_page_fault_handler(&mut self, handler: Option<Box<dyn PageFaultHandler>>) {
        self.page_fault_handler = handler;
        self.flush_v2p_cache();
    }

    /// Asks the installed page fault handler to resolve a not-present entry.
    ///
    /// Returns [`PageFaultResolution::Failure`] if no handler is installed.
    pub fn handle_page_fault(&self, fault: PageFault, entry: u64) -> PageFaultResolution {
        match &self.page_fault_handler {
            Some(handler) => {
                let resolution = handler.handle_page_fault(fault, entry);
                tracing::trace!(?fault, entry, ?resolution, "page fault handled");
                resolution
            }
            None => PageFaultResolution::Failure,
        }
    }

    /// Sets a limit on the length of strings read by the `read_string` methods.
    /// If the limit is reached, the string will be truncated.
    pub fn with_read_string_length_limit(self, limit_in_bytes: usize) -> Self {
        self.read_string_length_limit.set(Some(limit_in_bytes));
        self
    }

    /// Returns the current limit on the length of strings read by the
    /// `read_string` methods.
    pub fn read_string_length_limit(&self) -> Option<usize> {
        self.read_string_length_limit.get()
    }

    /// Sets a limit on the length (in bytes) of strings read by the
    /// `read_string` methods.
    ///
    /// To remove the limit, call this method with `None`.
    pub fn set_read_string_length_limit(&self, limit: Option<usize>) {
        self.read_string_length_limit.set(limit);
    }

    /// Returns the driver used by this `Domain` instance.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Retrieves information about the virtual machine.
    pub fn info(&self) -> Result<DomainInfo, MemoryError> {
        self.driver.info()
    }

    /// Pauses the virtual machine.
    pub fn pause(&self) -> Result<(), MemoryError> {
        self.driver.pause()
    }

    /// Resumes the virtual machine.
    ///
    /// The guest may change its page tables and memory once it runs, so this
    /// also [invalidates] all cached state.
    ///
    /// [invalidates]: Self::invalidate
    pub fn resume(&self) -> Result<(), MemoryError> {
        self.driver.resume()?;
        self.invalidate();
        Ok(())
    }

    /// Pauses the virtual machine and returns a guard that will resume it when
    /// dropped.
    pub fn pause_guard(&self) -> Result<PauseGuard<'_, Driver>, MemoryError> {
        PauseGuard::new(self)
    }

    /// Returns the current generation.
    ///
    /// The generation advances every time cached state is invalidated.
    pub fn generation(&self) -> u64 {
        self.generation.get()
    }

    /// Discards all cached mappings, translations and the derived paging
    /// mode, and advances the generation.
    ///
    /// Host mappings still referenced by typed pointers stay alive until
    /// those pointers re-acquire their mapping on the next access.
    pub fn invalidate(&self) {
        let generation = self.generation.get().wrapping_add(1);
        self.generation.set(generation);
        self.paging.set(None);
        self.flush_mapping_cache();
        self.flush_v2p_cache();
        tracing::debug!(generation, "domain state invalidated");
    }

    /// Retrieves the current state of CPU registers for a specified virtual
    /// CPU.
    pub fn registers(&self, vcpu: VcpuId) -> Result<RegistersOf<Driver>, MemoryError> {
        self.driver.registers(vcpu)
    }

    /// Sets the registers of a virtual CPU.
    ///
    /// The derived paging mode and the V2P cache are dropped, since the new
    /// register state may select a different paging configuration.
    pub fn set_registers(
        &self,
        vcpu: VcpuId,
        registers: RegistersOf<Driver>,
    ) -> Result<(), MemoryError> {
        self.driver.set_registers(vcpu, registers)?;
        self.paging.set(None);
        self.flush_v2p_cache();
        Ok(())
    }

    /// Returns a handle to a virtual CPU with a snapshot of its registers.
    pub fn vcpu(&self, id: VcpuId) -> Result<Vcpu<'_, Driver>, MemoryError> {
        Vcpu::new(self, id)
    }

    /// Returns the paging mode used for translations.
    ///
    /// The mode is derived from the registers of VCPU 0 the first time it is
    /// needed in each generation, unless it was pinned with [`reconfigure`].
    /// `None` means paging is disabled.
    ///
    /// [`reconfigure`]: Self::reconfigure
    pub fn paging_mode(&self) -> Result<Option<PagingModeOf<Driver>>, MemoryError> {
        let generation = self.generation.get();

        if let Some(state) = self.paging.get()
            && state.generation == generation
        {
            return Ok(state.mode);
        }

        let registers = self.driver.registers(VcpuId(0))?;
        let mode = <Driver::Architecture as Architecture>::paging_mode(&registers);
        tracing::debug!(?mode, generation, "paging mode derived");

        self.paging.set(Some(PagingState { generation, mode }));
        Ok(mode)
    }

    /// Recomputes the paging mode from the given register state and uses it
    /// for translations until the next invalidation.
    pub fn reconfigure(&self, registers: &RegistersOf<Driver>) -> Option<PagingModeOf<Driver>> {
        let generation = self.generation.get();
        let mode = <Driver::Architecture as Architecture>::paging_mode(registers);
        tracing::debug!(?mode, generation, "paging mode reconfigured");

        self.paging.set(Some(PagingState { generation, mode }));
        self.flush_v2p_cache();
        mode
    }

    /// Creates a guest virtual address in the address space rooted at `root`.
    pub fn virt(&self, va: impl Into<Va>, root: impl Into<Pa>) -> GuestVirtualAddress<'_, Driver> {
        GuestVirtualAddress::new(self, VcpuId(0), root.into(), va.into())
    }

    /// Creates a guest physical address.
    pub fn phys(&self, pa: impl Into<Pa>) -> GuestPhysicalAddress<'_, Driver> {
        GuestPhysicalAddress::new(self, pa.into())
    }

    /// Maps the given frames into a new host mapping owned by the caller.
    ///
    /// This bypasses the mapping cache.
    pub fn map_frames(&self, frames: &[Gfn]) -> Result<GuestMemoryMapping, MemoryError> {
        self.driver.map_pfns(frames)
    }

    /// Maps the given frames into a shared host mapping, using the mapping
    /// cache if enabled.
    ///
    /// If the frames appear, in order, inside a mapping that is already
    /// cached, the result is a view into that mapping.
    pub fn map_frames_shared(&self, frames: &[Gfn]) -> Result<SharedMapping, MemoryError> {
        (self.map_frames_fn)(self, frames)
    }

    /// Maps a single guest frame, using the mapping cache if enabled.
    pub fn map_page(&self, gfn: Gfn) -> Result<SharedMapping, MemoryError> {
        self.map_frames_shared(&[gfn])
    }

    /// Reads memory from the virtual machine.
    pub fn read(
        &self,
        ctx: impl Into<AccessContext>,
        buffer: &mut [u8],
    ) -> Result<(), MemoryError> {
        let ctx = ctx.into();
        let mut position = 0usize;
        let mut remaining = buffer.len();

        while remaining > 0 {
            let address = self.translate_access_context(ctx + position as u64)?;
            let gfn = Driver::Architecture::gfn_from_pa(address);
            let offset = Driver::Architecture::pa_offset(address) as usize;

            let page = self.map_page(gfn)?;
            let size = std::cmp::min(remaining, page.len().saturating_sub(offset));
            if size == 0 {
                return Err(MemoryError::OutOfBounds);
            }

            page.read(offset, &mut buffer[position..position + size])?;

            position += size;
            remaining -= size;
        }

        Ok(())
    }

    /// Writes memory to the virtual machine.
    pub fn write(&self, ctx: impl Into<AccessContext>, buffer: &[u8]) -> Result<(), MemoryError> {
        let ctx = ctx.into();
        let mut position = 0usize;
        let mut remaining = buffer.len();

        while remaining > 0 {
            let address = self.translate_access_context(ctx + position as u64)?;
            let gfn = Driver::Architecture::gfn_from_pa(address);
            let offset = Driver::Architecture::pa_offset(address) as usize;

            let page = self.map_page(gfn)?;
            let size = std::cmp::min(remaining, page.len().saturating_sub(offset));
            if size == 0 {
                return Err(MemoryError::OutOfBounds);
            }

            page.write(offset, &buffer[position..position + size])?;

            position += size;
            remaining -= size;
        }

        Ok(())
    }

    /// Reads a single byte from the virtual machine.
    pub fn read_u8(&self, ctx: impl Into<AccessContext>) -> Result<u8, MemoryError> {
        let mut buffer = [0u8; 1];
        self.read(ctx, &mut buffer)?;
        Ok(buffer[0])
    }

    /// Reads a 16-bit unsigned integer from the virtual machine.
    pub fn read_u16(&self, ctx: impl Into<AccessContext>) -> Result<u16, MemoryError> {
        let mut buffer = [0u8; 2];
        self.read(ctx, &mut buffer)?;
        Ok(u16::from_le_bytes(buffer))
    }

    /// Reads a 32-bit unsigned integer from the virtual machine.
    pub fn read_u32(&self, ctx: impl Into<AccessContext>) -> Result<u32, MemoryError> {
        let mut buffer = [0u8; 4];
        self.read(ctx, &mut buffer)?;
        Ok(u32::from_le_bytes(buffer))
    }

    /// Reads a 64-bit unsigned integer from the virtual machine.
    pub fn read_u64(&self, ctx: impl Into<AccessContext>) -> Result<u64, MemoryError> {
        let mut buffer = [0u8; 8];
        self.read(ctx, &mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    /// Reads an address of the given width (4 or 8 bytes).
    pub fn read_address(
        &self,
        ctx: impl Into<AccessContext>,
        address_width: usize,
    ) -> Result<u64, MemoryError> {
        match address_width {
            4 => Ok(self.read_u32(ctx)? as u64),
            8 => self.read_u64(ctx),
            _ => Err(MemoryError::InvalidAddressWidth),
        }
    }

    /// Reads a struct from the virtual machine.
    pub fn read_struct<T>(&self, ctx: impl Into<AccessContext>) -> Result<T, MemoryError>
    where
        T: FromBytes + IntoBytes,
    {
        let mut result = T::new_zeroed();
        self.read(ctx, result.as_mut_bytes())?;
        Ok(result)
    }

    /// Writes a single byte to the virtual machine.
    pub fn write_u8(&self, ctx: impl Into<AccessContext>, value: u8) -> Result<(), MemoryError> {
        self.write(ctx, &value.to_le_bytes())
    }

    /// Writes a 16-bit unsigned integer to the virtual machine.
    pub fn write_u16(&self, ctx: impl Into<AccessContext>, value: u16) -> Result<(), MemoryError> {
        self.write(ctx, &value.to_le_bytes())
    }

    /// Writes a 32-bit unsigned integer to the virtual machine.
    pub fn write_u32(&self, ctx: impl Into<AccessContext>, value: u32) -> Result<(), MemoryError> {
        self.write(ctx, &value.to_le_bytes())
    }

    /// Writes a 64-bit unsigned integer to the virtual machine.
    pub fn write_u64(&self, ctx: impl Into<AccessContext>, value: u64) -> Result<(), MemoryError> {
        self.write(ctx, &value.to_le_bytes())
    }

    /// Writes a struct to the virtual machine.
    pub fn write_struct<T>(
        &self,
        ctx: impl Into<AccessContext>,
        value: &T,
    ) -> Result<(), MemoryError>
    where
        T: IntoBytes + Immutable,
    {
        self.write(ctx, value.as_bytes())
    }

    /// Reads a null-terminated string of bytes from the virtual machine with a
    /// specified limit.
    ///
    /// The terminator is not included in the result.
    pub fn read_string_bytes_limited(
        &self,
        ctx: impl Into<AccessContext>,
        limit: usize,
    ) -> Result<Vec<u8>, MemoryError> {
        let mut ctx = ctx.into();
        let mut result = Vec::new();

        while result.len() < limit {
            let page_remaining = (Driver::Architecture::PAGE_SIZE
                - (ctx.address & !Driver::Architecture::PAGE_MASK))
                as usize;
            let chunk = page_remaining.min(limit - result.len());

            let address = self.translate_access_context(ctx)?;
            let offset = Driver::Architecture::pa_offset(address) as usize;
            let page = self.map_page(Driver::Architecture::gfn_from_pa(address))?;
            let bytes = page
                .get(offset..offset + chunk)
                .ok_or(MemoryError::OutOfBounds)?;

            if let Some(position) = memchr::memchr(0, bytes) {
                result.extend_from_slice(&bytes[..position]);
                return Ok(result);
            }

            result.extend_from_slice(bytes);
            ctx += chunk as u64;
        }

        Ok(result)
    }

    /// Reads a null-terminated string of bytes from the virtual machine.
    pub fn read_string_bytes(
        &self,
        ctx: impl Into<AccessContext>,
    ) -> Result<Vec<u8>, MemoryError> {
        self.read_string_bytes_limited(ctx, self.string_limit())
    }

    /// Reads a null-terminated wide string (UTF-16) from the virtual machine
    /// with a specified limit in bytes.
    pub fn read_wstring_bytes_limited(
        &self,
        ctx: impl Into<AccessContext>,
        limit: usize,
    ) -> Result<Vec<u16>, MemoryError> {
        let mut ctx = ctx.into();
        let limit = limit / 2;
        let mut result = Vec::new();
        let mut buffer = vec![0u8; Driver::Architecture::PAGE_SIZE as usize];

        while result.len() < limit {
            let page_remaining = (Driver::Architecture::PAGE_SIZE
                - (ctx.address & !Driver::Architecture::PAGE_MASK))
                as usize;

            // A character straddling a page boundary is read on its own.
            let chunk = (page_remaining.max(2) & !1).min((limit - result.len()) * 2);
            self.read(ctx, &mut buffer[..chunk])?;

            for pair in buffer[..chunk].chunks_exact(2) {
                let unit = u16::from_le_bytes([pair[0], pair[1]]);
                if unit == 0 {
                    return Ok(result);
                }

                result.push(unit);
            }

            ctx += chunk as u64;
        }

        Ok(result)
    }

    /// Reads a null-terminated wide string (UTF-16) from the virtual machine.
    pub fn read_wstring_bytes(
        &self,
        ctx: impl Into<AccessContext>,
    ) -> Result<Vec<u16>, MemoryError> {
        self.read_wstring_bytes_limited(ctx, self.string_limit())
    }

    /// Reads a null-terminated string from the virtual machine with a specified
    /// limit.
    pub fn read_string_limited(
        &self,
        ctx: impl Into<AccessContext>,
        limit: usize,
    ) -> Result<String, MemoryError> {
        Ok(String::from_utf8_lossy(&self.read_string_bytes_limited(ctx, limit)?).into())
    }

    /// Reads a null-terminated string from the virtual machine.
    pub fn read_string(&self, ctx: impl Into<AccessContext>) -> Result<String, MemoryError> {
        self.read_string_limited(ctx, self.string_limit())
    }

    /// Reads a null-terminated wide string (UTF-16) from the virtual machine
    /// with a specified limit in bytes.
    pub fn read_wstring_limited(
        &self,
        ctx: impl Into<AccessContext>,
        limit: usize,
    ) -> Result<String, MemoryError> {
        Ok(String::from_utf16_lossy(
            &self.read_wstring_bytes_limited(ctx, limit)?,
        ))
    }

    /// Reads a null-terminated wide string (UTF-16) from the virtual machine.
    pub fn read_wstring(&self, ctx: impl Into<AccessContext>) -> Result<String, MemoryError> {
        self.read_wstring_limited(ctx, self.string_limit())
    }

    fn string_limit(&self) -> usize {
        self.read_string_length_limit.get().unwrap_or(usize::MAX)
    }

    /// Translates a virtual address to a physical address.
    pub fn translate_address(
        &self,
        va: impl Into<Va>,
        root: impl Into<Pa>,
    ) -> Result<Pa, MemoryError> {
        self.translate_access_context(AccessContext::paging(va, root))
    }

    /// Translates an access context to a physical address.
    pub fn translate_access_context(&self, ctx: AccessContext) -> Result<Pa, MemoryError> {
        (self.translate_access_context_fn)(self, ctx)
    }

    fn map_frames_nocache(&self, frames: &[Gfn]) -> Result<SharedMapping, MemoryError> {
        Ok(SharedMapping::new(Rc::new(self.driver.map_pfns(frames)?)))
    }

    fn map_frames_cache(&self, frames: &[Gfn]) -> Result<SharedMapping, MemoryError> {
        if let Some(mapping) = self.cache.mappings.borrow_mut().get(frames) {
            return Ok(SharedMapping::new(Rc::clone(mapping)));
        }

        if let Some(view) = self.cached_view(frames) {
            tracing::trace!(frames = frames.len(), "served from a cached mapping");
            return Ok(view);
        }

        let mapping = Rc::new(self.driver.map_pfns(frames)?);
        self.cache.index(&mapping);

        let evicted = self
            .cache
            .mappings
            .borrow_mut()
            .push(Frames::from_slice(frames), Rc::clone(&mapping));

        if let Some((_, evicted)) = evicted {
            self.cache.unindex(&evicted);
        }

        Ok(SharedMapping::new(mapping))
    }

    /// Looks for `frames` as a consecutive run inside a cached mapping.
    fn cached_view(&self, frames: &[Gfn]) -> Option<SharedMapping> {
        let first = frames.first()?;
        let slot = self.cache.frames.borrow().get(first).cloned()?;
        let mapping = slot.mapping.upgrade()?;

        let range = slot.index..slot.index.checked_add(frames.len())?;
        if mapping.frames().get(range.clone())? != frames {
            return None;
        }

        self.cache.mappings.borrow_mut().promote(mapping.frames());
        SharedMapping::slice(mapping, range, Driver::Architecture::PAGE_SIZE as usize)
    }

    /// Translates an access context to a physical address without using the
    /// cache.
    ///
    /// With paging disabled, virtual addresses are physical addresses.
    fn translate_access_context_nocache(&self, ctx: AccessContext) -> Result<Pa, MemoryError> {
        match ctx.mechanism {
            TranslationMechanism::Direct => Ok(Pa(ctx.address)),
            TranslationMechanism::Paging { root } => match self.paging_mode()? {
                Some(mode) => <Driver::Architecture as Architecture>::translate_address(
                    self,
                    mode,
                    Va(ctx.address),
                    root,
                ),
                None => Ok(Pa(ctx.address)),
            },
        }
    }

    /// Translates an access context to a physical address, caching the
    /// translation of the containing page.
    fn translate_access_context_cache(&self, ctx: AccessContext) -> Result<Pa, MemoryError> {
        if ctx.mechanism == TranslationMechanism::Direct {
            return Ok(Pa(ctx.address));
        }

        let page = ctx.align_down(Driver::Architecture::PAGE_MASK);
        let offset = ctx.address & !Driver::Architecture::PAGE_MASK;

        if let Some(pa) = self.cache.v2p.borrow_mut().get(&page).copied() {
            return Ok(pa + offset);
        }

        // The walk sees the requested address; only the result is cached
        // per page.
        let pa = self.translate_access_context_nocache(ctx)?;
        self.cache
            .v2p
            .borrow_mut()
            .put(page, Pa(pa.0 & Driver::Architecture::PAGE_MASK));

        Ok(pa)
    }
}

/// A guard that pauses the virtual machine on creation and resumes it on drop.
///
/// Resuming invalidates all cached state of the domain.
pub struct PauseGuard<'a, Driver>
where
    Driver: DomainDriver,
{
    domain: &'a Domain<Driver>,
}

impl<'a, Driver> PauseGuard<'a, Driver>
where
    Driver: DomainDriver,
{
    /// Creates a new pause guard.
    pub fn new(domain: &'a Domain<Driver>) -> Result<Self, MemoryError> {
        domain.pause()?;
        Ok(Self { domain })
    }
}

impl<Driver> Drop for PauseGuard<'_, Driver>
where
    Driver: DomainDriver,
{
    fn drop(&mut self) {
        if let Err(err) = self.domain.resume() {
            tracing::error!(?err, "Failed to resume the virtual machine");
        }
    }
}
