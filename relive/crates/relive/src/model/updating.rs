//! Update classification lattice.
//!
//! Every class named by a request is classified into one [`UpdatingType`].
//! Independent signals (super changed, fields changed, a body changed...)
//! are combined with [`UpdatingType::join`], which only ever escalates.

use serde::Serialize;
use std::fmt;

/// How a class changes in an update
///
/// The numeric codes are stable and reported to submitters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(i32)]
pub enum UpdatingType {
    None = 0,
    /// Only cached resolution entries need clearing
    Relink = 1,
    /// Method bodies changed, shape and signatures did not
    BodyChange = 2,
    StaticMethod = 8,
    StaticField = 16,
    StaticBoth = 24,
    Method = 32,
    Field = 64,
    Both = 96,
    Del = 128,
    Add = 256,
    Stub = 512,
    Unknown = -1,
}

const STATIC_FAMILY: i32 = 24;
const INSTANCE_FAMILY: i32 = 96;

impl UpdatingType {
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<UpdatingType> {
        use UpdatingType::*;
        Some(match code {
            0 => None,
            1 => Relink,
            2 => BodyChange,
            8 => StaticMethod,
            16 => StaticField,
            24 => StaticBoth,
            32 => Method,
            64 => Field,
            96 => Both,
            128 => Del,
            256 => Add,
            512 => Stub,
            -1 => Unknown,
            _ => return Option::None,
        })
    }

    pub fn as_str(self) -> &'static str {
        use UpdatingType::*;
        match self {
            None => "NONE",
            Relink => "RELINK",
            BodyChange => "BODY_CHANGE",
            StaticMethod => "STATIC_METHOD",
            StaticField => "STATIC_FIELD",
            StaticBoth => "STATIC_BOTH",
            Method => "METHOD",
            Field => "FIELD",
            Both => "BOTH",
            Del => "DEL",
            Add => "ADD",
            Stub => "STUB",
            Unknown => "UNKNOWN",
        }
    }

    /// Members of the ordered middle of the lattice
    fn is_middle(self) -> bool {
        (1..=96).contains(&self.code())
    }

    /// Least upper bound of two classifications
    ///
    /// Returns `None` when the pair crosses the ADD/DEL/STUB boundary; the
    /// caller reports that as an invalid join rather than picking a side.
    ///
    /// ```rust
    /// use relive::model::UpdatingType;
    ///
    /// let t = UpdatingType::StaticMethod.join(UpdatingType::StaticField);
    /// assert_eq!(t, Some(UpdatingType::StaticBoth));
    /// assert_eq!(UpdatingType::Add.join(UpdatingType::Method), None);
    /// ```
    pub fn join(self, other: UpdatingType) -> Option<UpdatingType> {
        if self == other || other == UpdatingType::None {
            return Some(self);
        }
        if self == UpdatingType::None {
            return Some(other);
        }
        if other == UpdatingType::Unknown {
            return Some(self);
        }
        if self == UpdatingType::Unknown {
            return Some(other);
        }
        if !self.is_middle() || !other.is_middle() {
            return Option::None;
        }
        let (a, b) = (self.code(), other.code());
        let same_family = |mask: i32| a & mask == a && b & mask == b && a >= 8 && b >= 8;
        if same_family(STATIC_FAMILY) || same_family(INSTANCE_FAMILY) {
            return UpdatingType::from_code(a | b);
        }
        Some(if a >= b { self } else { other })
    }

    /// Whether the class gets a new class object at apply
    pub fn is_redefinition(self) -> bool {
        (8..=96).contains(&self.code())
    }

    /// Whether instance layout may change
    pub fn changes_instances(self) -> bool {
        matches!(self, UpdatingType::Field | UpdatingType::Both)
    }

    /// Whether the class counts as changed for discard purposes
    pub fn is_changed(self) -> bool {
        !matches!(self, UpdatingType::None | UpdatingType::Unknown)
    }

    /// Whether old frames of this class may not survive the update
    pub fn restricts_frames(self) -> bool {
        matches!(
            self,
            UpdatingType::BodyChange
                | UpdatingType::StaticMethod
                | UpdatingType::StaticField
                | UpdatingType::StaticBoth
                | UpdatingType::Method
                | UpdatingType::Field
                | UpdatingType::Both
                | UpdatingType::Del
        )
    }
}

impl fmt::Display for UpdatingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-method outcome of the method merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MethodUpdate {
    None,
    BodyChanged,
    Deleted,
    Added,
}

impl fmt::Display for MethodUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MethodUpdate::None => "NONE",
            MethodUpdate::BodyChanged => "BODY_CHANGED",
            MethodUpdate::Deleted => "DELETED",
            MethodUpdate::Added => "ADDED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    const ALL: [UpdatingType; 13] = [
        UpdatingType::None,
        UpdatingType::Relink,
        UpdatingType::BodyChange,
        UpdatingType::StaticMethod,
        UpdatingType::StaticField,
        UpdatingType::StaticBoth,
        UpdatingType::Method,
        UpdatingType::Field,
        UpdatingType::Both,
        UpdatingType::Del,
        UpdatingType::Add,
        UpdatingType::Stub,
        UpdatingType::Unknown,
    ];

    #[derive(Clone, Debug)]
    struct AnyType(UpdatingType);

    impl Arbitrary for AnyType {
        fn arbitrary(g: &mut Gen) -> Self {
            AnyType(*g.choose(&ALL).unwrap())
        }
    }

    #[test]
    fn test_family_joins() {
        use UpdatingType::*;
        assert_eq!(Method.join(Field), Some(Both));
        assert_eq!(StaticField.join(StaticMethod), Some(StaticBoth));
        assert_eq!(StaticBoth.join(Method), Some(Method));
        assert_eq!(BodyChange.join(Relink), Some(BodyChange));
        assert_eq!(Field.join(BodyChange), Some(Field));
    }

    #[test]
    fn test_boundary_rejected() {
        use UpdatingType::*;
        assert_eq!(Add.join(Del), Option::None);
        assert_eq!(Del.join(Both), Option::None);
        assert_eq!(Stub.join(Relink), Option::None);
        assert_eq!(Del.join(None), Some(Del));
        assert_eq!(Unknown.join(Add), Some(Add));
    }

    #[test]
    fn test_codes_round_trip() {
        for t in ALL {
            assert_eq!(UpdatingType::from_code(t.code()), Some(t));
        }
        assert_eq!(UpdatingType::from_code(3), Option::None);
    }

    #[quickcheck]
    fn prop_none_is_identity(x: AnyType) -> bool {
        x.0.join(UpdatingType::None) == Some(x.0) && UpdatingType::None.join(x.0) == Some(x.0)
    }

    #[quickcheck]
    fn prop_idempotent(x: AnyType) -> bool {
        x.0.join(x.0) == Some(x.0)
    }

    #[quickcheck]
    fn prop_commutative(x: AnyType, y: AnyType) -> bool {
        x.0.join(y.0) == y.0.join(x.0)
    }

    #[quickcheck]
    fn prop_monotone(x: AnyType, y: AnyType) -> bool {
        match x.0.join(y.0) {
            Some(j) => {
                let up = |a: UpdatingType| !a.is_changed() || a.code() <= j.code();
                up(x.0) && up(y.0)
            },
            None => true,
        }
    }
}
