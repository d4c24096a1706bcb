//! Method metadata.

use relive_util::ids::{ClassId, MethodId};
use relive_util::Symbol;
use std::fmt;
use std::sync::Arc;

use super::types::AccessFlags;

/// Update-related method flags
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MethodFlags(pub u32);

impl MethodFlags {
    /// A frame of this method blocks the revision switch
    pub const RESTRICTED: u32 = 1 << 0;
    /// Receiver must be checked for a stale class on entry
    pub const NEEDS_STALE_CHECK: u32 = 1 << 1;
    /// Receiver may carry phantom storage
    pub const NEEDS_MIXED_CHECK: u32 = 1 << 2;
    /// Casts in this method must consult the narrowing marks
    pub const NEEDS_TYPE_NARROW_CHECK: u32 = 1 << 3;
    /// Superseded by a newer version, kept only for frames already running it
    pub const OBSOLETE: u32 = 1 << 4;

    #[inline]
    pub fn has(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    #[inline]
    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }

    #[inline]
    pub fn clear(&mut self, flag: u32) {
        self.0 &= !flag;
    }
}

impl fmt::Debug for MethodFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (bit, name) in [
            (Self::RESTRICTED, "restricted"),
            (Self::NEEDS_STALE_CHECK, "stale-check"),
            (Self::NEEDS_MIXED_CHECK, "mixed-check"),
            (Self::NEEDS_TYPE_NARROW_CHECK, "narrow-check"),
            (Self::OBSOLETE, "obsolete"),
        ] {
            if self.has(bit) {
                names.push(name);
            }
        }
        write!(f, "MethodFlags({})", names.join("|"))
    }
}

/// A method in the method arena
#[derive(Debug, Clone)]
pub struct Method {
    pub id: MethodId,
    /// Class whose constant pool the code indexes
    pub holder: ClassId,
    pub name: Symbol,
    pub sig: Symbol,
    pub access: AccessFlags,
    pub max_locals: u16,
    pub code: Arc<[u8]>,
    /// Slot in the holder's vtable, `None` for static, private and
    /// constructor methods
    pub vtable_index: Option<usize>,
    pub flags: MethodFlags,
}

impl Method {
    #[inline]
    pub fn is_static(&self) -> bool {
        self.access.is_static()
    }

    #[inline]
    pub fn is_native(&self) -> bool {
        self.access.is_native()
    }

    #[inline]
    pub fn is_restricted(&self) -> bool {
        self.flags.has(MethodFlags::RESTRICTED)
    }

    pub fn is_initializer(&self) -> bool {
        self.name == relive_util::symbol::sym::INIT || self.name == relive_util::symbol::sym::CLINIT
    }

    /// Whether the method takes part in virtual dispatch
    pub fn is_virtual(&self) -> bool {
        !self.is_static() && !self.access.is_private() && !self.is_initializer()
    }

    pub fn same_signature(&self, other: &Method) -> bool {
        self.name == other.name && self.sig == other.sig
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.sig)
    }
}
