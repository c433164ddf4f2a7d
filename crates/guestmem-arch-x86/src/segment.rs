/// The access rights of a segment descriptor, in the VMX layout.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAccess(pub u32);

impl SegmentAccess {
    /// Returns the descriptor privilege level.
    pub fn descriptor_privilege_level(self) -> u8 {
        ((self.0 >> 5) & 0b11) as _
    }

    /// Checks if the segment is present.
    pub fn present(self) -> bool {
        (self.0 >> 7) & 1 != 0
    }

    /// Checks if a code segment contains 64-bit code (L flag).
    ///
    /// With long mode active, a clear flag means the segment runs in
    /// compatibility mode.
    pub fn long_mode(self) -> bool {
        (self.0 >> 9) & 1 != 0
    }

    /// Checks if 32-bit operands and addresses are the default (D/B flag).
    pub fn default_big(self) -> bool {
        (self.0 >> 10) & 1 != 0
    }
}

impl std::fmt::Debug for SegmentAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SegmentAccess")
            .field("descriptor_privilege_level", &self.descriptor_privilege_level())
            .field("present", &self.present())
            .field("long_mode", &self.long_mode())
            .field("default_big", &self.default_big())
            .finish()
    }
}

/// A cached segment descriptor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// The linear base address of the segment.
    pub base: u64,

    /// The segment limit, in bytes.
    pub limit: u32,

    /// The access rights.
    pub access: SegmentAccess,
}
