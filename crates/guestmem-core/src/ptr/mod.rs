//! Typed pointers into guest memory.
//!
//! [`GuestPtr`] and [`GuestArray`] give pointer-like access to values in
//! guest memory. They are generic over the addressing mode: a pointer over a
//! [`GuestVirtualAddress`] translates through the guest page tables, a
//! pointer over a [`GuestPhysicalAddress`] accesses physical memory directly.
//!
//! Pointers are lazy. The host mapping backing a pointer is acquired on the
//! first access and reused until the domain generation changes (see
//! [`Domain::invalidate`]). Every access is fallible; dereferencing a null
//! pointer yields [`MemoryError::NullAddress`] rather than a crash.
//!
//! [`Domain::invalidate`]: crate::Domain::invalidate

mod array;
mod iter;
mod member;
mod window;

use std::{marker::PhantomData, ops::Deref};

use zerocopy::{ConvertError, FromBytes, Immutable, IntoBytes, KnownLayout};

pub use self::{
    array::{ArrayIter, GuestArray},
    iter::{LinkedEntry, OffsetIter, OffsetIterable, SizeIter, SizeIterable, SizedEntry},
    member::{AddressWidth, DEFAULT_MAX_STRING_LENGTH, GuestMemberPtr},
};
use self::window::LazyWindow;
use crate::{
    GuestAddress, GuestPhysicalAddress, GuestVirtualAddress, MemoryError, SharedMapping,
};

/// A typed pointer to a guest virtual address.
pub type GuestVirtPtr<'a, Driver, T> = GuestPtr<GuestVirtualAddress<'a, Driver>, T>;

/// A typed pointer to a guest physical address.
pub type GuestPhysPtr<'a, Driver, T> = GuestPtr<GuestPhysicalAddress<'a, Driver>, T>;

/// A typed array at a guest virtual address.
pub type GuestVirtArray<'a, Driver, T> = GuestArray<GuestVirtualAddress<'a, Driver>, T>;

/// A typed array at a guest physical address.
pub type GuestPhysArray<'a, Driver, T> = GuestArray<GuestPhysicalAddress<'a, Driver>, T>;

/// A pointer to a single `T` in guest memory.
pub struct GuestPtr<A, T> {
    address: A,
    window: LazyWindow,
    _marker: PhantomData<fn() -> T>,
}

impl<A, T> GuestPtr<A, T>
where
    A: GuestAddress,
{
    /// Creates a new pointer. Nothing is mapped until the first access.
    pub fn new(address: A) -> Self {
        Self {
            address,
            window: LazyWindow::default(),
            _marker: PhantomData,
        }
    }

    /// Returns the address the pointer points to.
    pub fn address(&self) -> A {
        self.address
    }

    /// Checks if the pointer is null.
    pub fn is_null(&self) -> bool {
        self.address.is_null()
    }

    /// Checks if the pointer holds a mapping for the current generation.
    pub fn is_mapped(&self) -> bool {
        self.window.is_current(self.address.domain().generation())
    }

    /// Returns a pointer `count` elements forward.
    pub fn add(&self, count: usize) -> Self {
        self.offset(count as i64)
    }

    /// Returns a pointer `count` elements backward.
    pub fn sub(&self, count: usize) -> Self {
        self.offset((count as i64).wrapping_neg())
    }

    /// Returns a pointer `count` elements away.
    ///
    /// The mapping window is carried over and reused if the new element lies
    /// inside it.
    pub fn offset(&self, count: i64) -> Self {
        let delta = count.wrapping_mul(size_of::<T>() as i64) as u64;

        Self {
            address: self
                .address
                .with_value(self.address.value().wrapping_add(delta)),
            window: self.window.clone(),
            _marker: PhantomData,
        }
    }

    /// Returns the distance to `origin` in elements.
    ///
    /// Returns `None` for pointers from different address spaces, for
    /// zero-sized `T`, and when the distance is not a whole number of
    /// elements.
    pub fn offset_from(&self, origin: &Self) -> Option<i64> {
        let size = size_of::<T>() as i64;
        if size == 0 || !self.address.same_context(&origin.address) {
            return None;
        }

        let bytes = self.address.value().wrapping_sub(origin.address.value()) as i64;
        (bytes % size == 0).then_some(bytes / size)
    }

    /// Reinterprets the pointer as pointing to a `U`.
    pub fn cast<U>(&self) -> GuestPtr<A, U> {
        GuestPtr {
            address: self.address,
            window: self.window.clone(),
            _marker: PhantomData,
        }
    }

    /// Returns an array of `len` elements starting at this pointer.
    pub fn to_array(&self, len: usize) -> GuestArray<A, T> {
        GuestArray::new(self.address, len)
    }

    /// Reads the value.
    pub fn read(&self) -> Result<T, MemoryError>
    where
        T: FromBytes,
    {
        let range = self.window.acquire(&self.address, size_of::<T>())?;
        T::read_from_bytes(range.bytes()).map_err(|_| MemoryError::OutOfBounds)
    }

    /// Writes the value.
    pub fn write(&self, value: &T) -> Result<(), MemoryError>
    where
        T: IntoBytes + Immutable,
    {
        let range = self.window.acquire(&self.address, size_of::<T>())?;
        range.write(0, value.as_bytes())
    }

    /// Returns a reference to the value inside the host mapping.
    ///
    /// The reference keeps the mapping alive. Fails with
    /// [`MemoryError::Misaligned`] if the host address is not aligned for
    /// `T`.
    ///
    /// See [`GuestRef`] for the aliasing rules; `T` is restricted to plain
    /// `Copy` data so the referenced value is never relied upon beyond a
    /// snapshot.
    pub fn get_ref(&self) -> Result<GuestRef<T>, MemoryError>
    where
        T: FromBytes + KnownLayout + Immutable + Copy,
    {
        let range = self.window.acquire(&self.address, size_of::<T>())?;
        let value = T::ref_from_bytes(range.bytes()).map_err(|err| match err {
            ConvertError::Alignment(_) => MemoryError::Misaligned,
            _ => MemoryError::OutOfBounds,
        })?;

        let ptr = std::ptr::from_ref(value);
        Ok(GuestRef {
            _mapping: range.mapping,
            ptr,
        })
    }
}

impl<A, T> Clone for GuestPtr<A, T>
where
    A: GuestAddress,
{
    fn clone(&self) -> Self {
        Self {
            address: self.address,
            window: self.window.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, T> PartialEq for GuestPtr<A, T>
where
    A: GuestAddress + PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl<A, T> std::fmt::Debug for GuestPtr<A, T>
where
    A: GuestAddress,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("GuestPtr")
            .field("address", &self.address)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<A, T> std::ops::Add<usize> for &GuestPtr<A, T>
where
    A: GuestAddress,
{
    type Output = GuestPtr<A, T>;

    fn add(self, rhs: usize) -> Self::Output {
        GuestPtr::add(self, rhs)
    }
}

impl<A, T> std::ops::Sub<usize> for &GuestPtr<A, T>
where
    A: GuestAddress,
{
    type Output = GuestPtr<A, T>;

    fn sub(self, rhs: usize) -> Self::Output {
        GuestPtr::sub(self, rhs)
    }
}

/// A reference to a value inside a host mapping of guest memory.
///
/// # Aliasing
///
/// The referenced memory is not owned by the reference. The guest may
/// change it while it runs, and writes through any other pointer or
/// mapping of the same frames ([`GuestPtr::write`], [`Domain::write`], a
/// shared host mapping) change it as well, even while the reference is
/// alive. Copy the value out (`*guest_ref`) before writing to the same
/// memory, and do not hold on to the `&T` across such writes.
///
/// [`Domain::write`]: crate::Domain::write
pub struct GuestRef<T> {
    _mapping: SharedMapping,
    ptr: *const T,
}

impl<T> Deref for GuestRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: `ptr` was produced from a checked, aligned slice of the
        // mapping, which `_mapping` keeps alive.
        unsafe { &*self.ptr }
    }
}

impl<T> std::fmt::Debug for GuestRef<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Debug::fmt(&**self, f)
    }
}
