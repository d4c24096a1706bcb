//! Layout Module - field correspondence between class versions
//!
//! For a class whose instance layout changes, the planner computes once,
//! before the pause, everything instance migration needs:
//!
//! - the youngest common ancestor of the old and new hierarchies, which
//!   anchors the byte prefix that stays put
//! - the smallest primary footprint any live instance may have
//!   (`min_object_size`); new fields ending past it need phantom storage
//! - the matched-field tables for instance and static fields
//! - the byte runs of the new shape that are copied verbatim
//!
//! ```text
//!  old C   | a:int@0 | b:int@4 |
//!  new C   | a:int@0 | c:int@4 | b:int@8 |  pad  |
//!
//!  matched   a 0 -> 0, b 4 -> 8, clear [0, 8)
//!  runs      [0, 4)
//! ```
//!
//! A plan is immutable once built and shared through an `Arc` by the new
//! class version and its shape descriptors.

mod planner;

pub use planner::{plan, youngest_common_ancestor};

use relive_util::ids::ClassId;
use relive_util::Symbol;

use crate::model::{BasicType, FieldInfo};

/// One row of a field correspondence table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchedField {
    /// Old offset, or start of the range for a clear entry
    pub old_offset: usize,
    /// New offset, or length of the range for a clear entry
    pub new_offset: usize,
    pub ty: BasicType,
    pub flags: u8,
}

impl MatchedField {
    /// The old location is in phantom storage
    pub const OLD_PHANTOM: u8 = 1 << 0;
    /// The new location is in phantom storage
    pub const NEW_PHANTOM: u8 = 1 << 1;
    /// Synthetic entry: zero `[old_offset, old_offset + new_offset)`
    pub const CLEAR: u8 = 1 << 2;

    pub(crate) fn clear(start: usize, len: usize) -> Self {
        MatchedField {
            old_offset: start,
            new_offset: len,
            ty: BasicType::Byte,
            flags: Self::CLEAR,
        }
    }

    #[inline]
    pub fn is_clear(&self) -> bool {
        self.flags & Self::CLEAR != 0
    }

    #[inline]
    pub fn old_in_phantom(&self) -> bool {
        self.flags & Self::OLD_PHANTOM != 0
    }

    #[inline]
    pub fn new_in_phantom(&self) -> bool {
        self.flags & Self::NEW_PHANTOM != 0
    }

    /// Byte range zeroed by a clear entry
    pub fn clear_range(&self) -> Option<std::ops::Range<usize>> {
        self.is_clear()
            .then(|| self.old_offset..self.old_offset + self.new_offset)
    }
}

/// Old instance field read for a custom transformer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OldFieldRef {
    pub name: Symbol,
    pub offset: usize,
    pub ty: BasicType,
    pub phantom: bool,
}

/// Migration plan of one redefined class
#[derive(Debug, Clone)]
pub struct LayoutPlan {
    pub class: Symbol,
    pub old: ClassId,
    pub new: ClassId,
    pub ycsc_old: ClassId,
    pub ycsc_new: ClassId,
    pub old_size: usize,
    pub new_size: usize,
    /// Smallest instance size over the old version chain
    pub min_object_size: usize,
    pub min_vtable_size: usize,
    /// Ancestor entries, own entries, then the clear entry
    pub instance_fields: Vec<MatchedField>,
    pub static_fields: Vec<MatchedField>,
    /// Half-open byte ranges of the new shape copied verbatim
    pub inplace_runs: Vec<(usize, usize)>,
    pub needs_inplace_shape: bool,
    pub needs_stale_shape: bool,
    /// Check bits for each field of the new version, parallel to its fields
    pub field_checks: Vec<u8>,
    /// Instance field table of the new version, root first
    pub new_fields: Vec<FieldInfo>,
    pub transformer_args: Vec<OldFieldRef>,
}

impl LayoutPlan {
    /// The clear entry of this class
    pub fn clear_entry(&self) -> Option<&MatchedField> {
        self.instance_fields.iter().rev().find(|m| m.is_clear())
    }

    /// Matched entries excluding clear entries
    pub fn matched(&self) -> impl Iterator<Item = &MatchedField> {
        self.instance_fields.iter().filter(|m| !m.is_clear())
    }

    /// New instance fields that need phantom storage
    pub fn phantom_fields(&self) -> impl Iterator<Item = &FieldInfo> {
        let limit = self.min_object_size;
        self.new_fields.iter().filter(move |f| f.end() > limit)
    }
}
