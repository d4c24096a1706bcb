//! Primitive value model shared by class metadata and the heap.

use relive_util::ids::ObjectId;
use std::fmt;

/// Storage type of a field or value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum BasicType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
    Reference,
}

impl BasicType {
    /// Parse the leading type of a field signature (`I`, `J`, `LFoo;`, `[I`)
    pub fn from_signature(sig: &str) -> Option<BasicType> {
        match sig.as_bytes().first()? {
            b'Z' => Some(BasicType::Boolean),
            b'B' => Some(BasicType::Byte),
            b'C' => Some(BasicType::Char),
            b'S' => Some(BasicType::Short),
            b'I' => Some(BasicType::Int),
            b'F' => Some(BasicType::Float),
            b'J' => Some(BasicType::Long),
            b'D' => Some(BasicType::Double),
            b'L' | b'[' => Some(BasicType::Reference),
            _ => None,
        }
    }

    /// Size in bytes inside an object
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            BasicType::Boolean | BasicType::Byte => 1,
            BasicType::Char | BasicType::Short => 2,
            BasicType::Int | BasicType::Float => 4,
            BasicType::Long | BasicType::Double | BasicType::Reference => 8,
        }
    }

    /// Zero value of this type
    pub fn zero(self) -> Value {
        match self {
            BasicType::Boolean => Value::Bool(false),
            BasicType::Byte => Value::Byte(0),
            BasicType::Char => Value::Char(0),
            BasicType::Short => Value::Short(0),
            BasicType::Int => Value::Int(0),
            BasicType::Float => Value::Float(0.0),
            BasicType::Long => Value::Long(0),
            BasicType::Double => Value::Double(0.0),
            BasicType::Reference => Value::Ref(ObjectId::NONE),
        }
    }
}

/// Access flags of classes, fields and methods
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
pub struct AccessFlags(pub u16);

impl AccessFlags {
    pub const PUBLIC: u16 = 0x0001;
    pub const PRIVATE: u16 = 0x0002;
    pub const PROTECTED: u16 = 0x0004;
    pub const STATIC: u16 = 0x0008;
    pub const FINAL: u16 = 0x0010;
    pub const SYNCHRONIZED: u16 = 0x0020;
    pub const NATIVE: u16 = 0x0100;
    pub const INTERFACE: u16 = 0x0200;
    pub const ABSTRACT: u16 = 0x0400;

    pub const fn new(bits: u16) -> Self {
        AccessFlags(bits)
    }

    #[inline]
    pub const fn has(self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    pub fn is_static(self) -> bool {
        self.has(Self::STATIC)
    }

    pub fn is_private(self) -> bool {
        self.has(Self::PRIVATE)
    }

    pub fn is_final(self) -> bool {
        self.has(Self::FINAL)
    }

    pub fn is_native(self) -> bool {
        self.has(Self::NATIVE)
    }

    pub fn is_interface(self) -> bool {
        self.has(Self::INTERFACE)
    }

    pub fn is_abstract(self) -> bool {
        self.has(Self::ABSTRACT)
    }
}

impl fmt::Debug for AccessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessFlags({:#06x})", self.0)
    }
}

/// A runtime value held in a field, local or operand stack slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Ref(ObjectId),
}

impl Value {
    pub fn basic_type(&self) -> BasicType {
        match self {
            Value::Bool(_) => BasicType::Boolean,
            Value::Byte(_) => BasicType::Byte,
            Value::Char(_) => BasicType::Char,
            Value::Short(_) => BasicType::Short,
            Value::Int(_) => BasicType::Int,
            Value::Float(_) => BasicType::Float,
            Value::Long(_) => BasicType::Long,
            Value::Double(_) => BasicType::Double,
            Value::Ref(_) => BasicType::Reference,
        }
    }

    /// Integer view used by arithmetic and branches
    pub fn as_int(&self) -> Option<i32> {
        match *self {
            Value::Bool(b) => Some(b as i32),
            Value::Byte(v) => Some(v as i32),
            Value::Char(v) => Some(v as i32),
            Value::Short(v) => Some(v as i32),
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match *self {
            Value::Long(v) => Some(v),
            other => other.as_int().map(i64::from),
        }
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match *self {
            Value::Ref(id) => Some(id),
            _ => None,
        }
    }

    /// Little-endian encoding, `ty.size()` bytes
    pub fn encode(&self, ty: BasicType, out: &mut [u8]) {
        let n = ty.size();
        match (ty, *self) {
            (BasicType::Float, Value::Float(v)) => out[..n].copy_from_slice(&v.to_le_bytes()),
            (BasicType::Double, Value::Double(v)) => out[..n].copy_from_slice(&v.to_le_bytes()),
            (BasicType::Reference, Value::Ref(id)) => {
                out[..n].copy_from_slice(&id.as_u64().to_le_bytes())
            },
            (_, v) => {
                let raw = v.as_long().unwrap_or(0).to_le_bytes();
                out[..n].copy_from_slice(&raw[..n]);
            },
        }
    }

    /// Decode `ty.size()` little-endian bytes
    pub fn decode(ty: BasicType, bytes: &[u8]) -> Value {
        let mut raw = [0u8; 8];
        raw[..ty.size()].copy_from_slice(&bytes[..ty.size()]);
        let word = u64::from_le_bytes(raw);
        match ty {
            BasicType::Boolean => Value::Bool(word != 0),
            BasicType::Byte => Value::Byte(word as u8 as i8),
            BasicType::Char => Value::Char(word as u16),
            BasicType::Short => Value::Short(word as u16 as i16),
            BasicType::Int => Value::Int(word as u32 as i32),
            BasicType::Float => Value::Float(f32::from_bits(word as u32)),
            BasicType::Long => Value::Long(word as i64),
            BasicType::Double => Value::Double(f64::from_bits(word)),
            BasicType::Reference => Value::Ref(ObjectId(word)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Byte(v) => write!(f, "{}", v),
            Value::Char(v) => write!(f, "'\\u{:04x}'", v),
            Value::Short(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}f", v),
            Value::Long(v) => write!(f, "{}L", v),
            Value::Double(v) => write!(f, "{}d", v),
            Value::Ref(id) if id.is_none() => write!(f, "null"),
            Value::Ref(id) => write!(f, "{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_types() {
        assert_eq!(BasicType::from_signature("I"), Some(BasicType::Int));
        assert_eq!(BasicType::from_signature("LFoo;"), Some(BasicType::Reference));
        assert_eq!(BasicType::from_signature("[J"), Some(BasicType::Reference));
        assert_eq!(BasicType::from_signature("Q"), None);
        assert_eq!(BasicType::Long.size(), 8);
        assert_eq!(BasicType::Char.size(), 2);
    }

    #[test]
    fn test_encode_decode_negative_int() {
        let mut buf = [0u8; 4];
        Value::Int(-7).encode(BasicType::Int, &mut buf);
        assert_eq!(Value::decode(BasicType::Int, &buf), Value::Int(-7));
    }

    #[test]
    fn test_encode_reference() {
        let mut buf = [0u8; 8];
        Value::Ref(ObjectId(42)).encode(BasicType::Reference, &mut buf);
        assert_eq!(
            Value::decode(BasicType::Reference, &buf),
            Value::Ref(ObjectId(42))
        );
    }

    #[test]
    fn test_access_flags() {
        let flags = AccessFlags::new(AccessFlags::PUBLIC | AccessFlags::STATIC);
        assert!(flags.is_static());
        assert!(!flags.is_final());
    }
}
