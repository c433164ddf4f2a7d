use std::marker::PhantomData;

use super::{GuestArray, GuestPtr};
use crate::{GuestAddress, MemoryError};

/// Default upper bound, in characters, for strings resolved through a
/// [`GuestMemberPtr`].
pub const DEFAULT_MAX_STRING_LENGTH: usize = 0xFFFF;

/// The width of a pointer stored in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressWidth {
    /// 4-byte pointer.
    Bits32,

    /// 8-byte pointer.
    Bits64,
}

impl AddressWidth {
    /// Converts a width in bytes.
    pub fn from_bytes(bytes: usize) -> Result<Self, MemoryError> {
        match bytes {
            4 => Ok(Self::Bits32),
            8 => Ok(Self::Bits64),
            _ => Err(MemoryError::InvalidAddressWidth),
        }
    }

    /// Returns the width in bytes.
    pub fn bytes(self) -> usize {
        match self {
            Self::Bits32 => 4,
            Self::Bits64 => 8,
        }
    }

    /// Returns the largest value representable with this width.
    pub fn max_value(self) -> u64 {
        match self {
            Self::Bits32 => u32::MAX as u64,
            Self::Bits64 => u64::MAX,
        }
    }
}

/// A pointer value stored inside a guest structure.
///
/// The raw value is kept as read from the guest, together with its width,
/// which is only known at runtime (a 64-bit kernel hosts both 32-bit and
/// 64-bit processes). The pointer is resolved against an explicit context
/// address, whose domain and address space it inherits.
pub struct GuestMemberPtr<T> {
    raw: u64,
    width: AddressWidth,
    _marker: PhantomData<fn() -> T>,
}

impl<T> GuestMemberPtr<T> {
    /// Creates a member pointer from a raw value.
    ///
    /// Fails with [`MemoryError::InvalidAddressWidth`] if `raw` does not fit
    /// `width`.
    pub fn new(raw: u64, width: AddressWidth) -> Result<Self, MemoryError> {
        if raw > width.max_value() {
            return Err(MemoryError::InvalidAddressWidth);
        }

        Ok(Self {
            raw,
            width,
            _marker: PhantomData,
        })
    }

    /// Creates a null member pointer.
    pub fn null(width: AddressWidth) -> Self {
        Self {
            raw: 0,
            width,
            _marker: PhantomData,
        }
    }

    /// Reads a member pointer stored at `field`.
    pub fn read<A>(field: &A, width: AddressWidth) -> Result<Self, MemoryError>
    where
        A: GuestAddress,
    {
        let raw = field
            .domain()
            .read_address(field.access_context(), width.bytes())?;

        Ok(Self {
            raw,
            width,
            _marker: PhantomData,
        })
    }

    /// Returns the raw pointer value.
    pub fn raw(&self) -> u64 {
        self.raw
    }

    /// Returns the pointer width.
    pub fn width(&self) -> AddressWidth {
        self.width
    }

    /// Checks if the pointer is 64 bits wide.
    pub fn x64(&self) -> bool {
        self.width == AddressWidth::Bits64
    }

    /// Checks if the pointer is null.
    pub fn is_null(&self) -> bool {
        self.raw == 0
    }

    /// Resolves the pointer in the domain and address space of `context`.
    pub fn get<A>(&self, context: &A) -> GuestPtr<A, T>
    where
        A: GuestAddress,
    {
        GuestPtr::new(context.with_value(self.raw))
    }

    /// Resolves the pointer as an array of `len` elements.
    pub fn get_array<A>(&self, context: &A, len: usize) -> GuestArray<A, T>
    where
        A: GuestAddress,
    {
        GuestArray::new(context.with_value(self.raw), len)
    }

    /// Points the member pointer at `ptr`.
    ///
    /// Only the local value changes; use [`store`] to write it back.
    ///
    /// [`store`]: Self::store
    pub fn set<A>(&mut self, ptr: &GuestPtr<A, T>) -> Result<(), MemoryError>
    where
        A: GuestAddress,
    {
        self.set_raw(ptr.address().value())
    }

    /// Sets the raw pointer value.
    pub fn set_raw(&mut self, raw: u64) -> Result<(), MemoryError> {
        if raw > self.width.max_value() {
            return Err(MemoryError::InvalidAddressWidth);
        }

        self.raw = raw;
        Ok(())
    }

    /// Writes the pointer value to `field`, using the pointer width.
    pub fn store<A>(&self, field: &A) -> Result<(), MemoryError>
    where
        A: GuestAddress,
    {
        let domain = field.domain();
        match self.width {
            AddressWidth::Bits32 => domain.write_u32(field.access_context(), self.raw as u32),
            AddressWidth::Bits64 => domain.write_u64(field.access_context(), self.raw),
        }
    }
}

impl GuestMemberPtr<u8> {
    /// Resolves the pointer as a NUL-terminated string of at most
    /// `max_length` bytes.
    pub fn cstring<A>(
        &self,
        context: &A,
        max_length: usize,
    ) -> Result<GuestArray<A, u8>, MemoryError>
    where
        A: GuestAddress,
    {
        GuestArray::cstring(context.with_value(self.raw), max_length)
    }
}

impl GuestMemberPtr<u16> {
    /// Resolves the pointer as a NUL-terminated UTF-16 string of at most
    /// `max_length` characters.
    pub fn wstring<A>(
        &self,
        context: &A,
        max_length: usize,
    ) -> Result<GuestArray<A, u16>, MemoryError>
    where
        A: GuestAddress,
    {
        GuestArray::wstring(context.with_value(self.raw), max_length)
    }
}

impl<T> Clone for GuestMemberPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for GuestMemberPtr<T> {}

impl<T> PartialEq for GuestMemberPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw && self.width == other.width
    }
}

impl<T> Eq for GuestMemberPtr<T> {}

impl<T> std::fmt::Debug for GuestMemberPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("GuestMemberPtr")
            .field("raw", &format_args!("0x{:x}", self.raw))
            .field("width", &self.width)
            .finish()
    }
}
