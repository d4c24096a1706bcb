//! Parsed class definitions.
//!
//! A [`ClassDef`] is what a stream provider hands the engine: the class
//! already decoded from its byte stream, with symbolic references only.
//! Offsets, vtable slots and ids are assigned when the registry links it.

use super::types::AccessFlags;

/// Constant pool entry, referenced by `u16` index from bytecode
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Utf8(String),
    Int(i32),
    Long(i64),
    String(String),
    Class(String),
    FieldRef {
        class: String,
        name: String,
        sig: String,
    },
    MethodRef {
        class: String,
        name: String,
        sig: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub sig: String,
    pub access: AccessFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDef {
    pub name: String,
    pub sig: String,
    pub access: AccessFlags,
    pub max_locals: u16,
    pub code: Vec<u8>,
}

/// A class as produced by a stream provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    pub name: String,
    /// `None` only for the root class
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub access: AccessFlags,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodDef>,
    pub constants: Vec<Constant>,
}

impl ClassDef {
    /// New public class extending the root class
    pub fn new(name: impl Into<String>) -> Self {
        ClassDef {
            name: name.into(),
            super_name: Some(relive_util::symbol::sym::OBJECT.as_str().to_string()),
            interfaces: Vec::new(),
            access: AccessFlags::new(AccessFlags::PUBLIC),
            fields: Vec::new(),
            methods: Vec::new(),
            constants: Vec::new(),
        }
    }

    /// New interface
    pub fn interface(name: impl Into<String>) -> Self {
        let mut def = Self::new(name);
        def.access = AccessFlags::new(
            AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT,
        );
        def
    }

    pub fn extends(mut self, super_name: impl Into<String>) -> Self {
        self.super_name = Some(super_name.into());
        self
    }

    pub fn implements(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    pub fn access(mut self, bits: u16) -> Self {
        self.access = AccessFlags::new(bits);
        self
    }

    /// Instance field
    pub fn field(self, name: &str, sig: &str) -> Self {
        self.field_with(name, sig, AccessFlags::PRIVATE)
    }

    pub fn static_field(self, name: &str, sig: &str) -> Self {
        self.field_with(name, sig, AccessFlags::PRIVATE | AccessFlags::STATIC)
    }

    pub fn field_with(mut self, name: &str, sig: &str, access: u16) -> Self {
        self.fields.push(FieldDef {
            name: name.to_string(),
            sig: sig.to_string(),
            access: AccessFlags::new(access),
        });
        self
    }

    /// Public instance method
    pub fn method(self, name: &str, sig: &str, code: Vec<u8>) -> Self {
        self.method_with(name, sig, AccessFlags::PUBLIC, code)
    }

    pub fn static_method(self, name: &str, sig: &str, code: Vec<u8>) -> Self {
        self.method_with(name, sig, AccessFlags::PUBLIC | AccessFlags::STATIC, code)
    }

    /// Method implemented by a registered host function
    pub fn native_method(self, name: &str, sig: &str, access: u16) -> Self {
        self.method_with(name, sig, access | AccessFlags::NATIVE, Vec::new())
    }

    pub fn method_with(mut self, name: &str, sig: &str, access: u16, code: Vec<u8>) -> Self {
        self.methods.push(MethodDef {
            name: name.to_string(),
            sig: sig.to_string(),
            access: AccessFlags::new(access),
            max_locals: arg_slots(sig) + u16::from(access & AccessFlags::STATIC == 0) + 4,
            code,
        });
        self
    }

    /// Append a constant and return its index
    pub fn constant(&mut self, constant: Constant) -> u16 {
        if let Some(pos) = self.constants.iter().position(|c| *c == constant) {
            return pos as u16;
        }
        self.constants.push(constant);
        (self.constants.len() - 1) as u16
    }

    /// Builder-style [`constant`](Self::constant) for definitions whose
    /// pool indices are fixed up front
    pub fn with_constant(mut self, constant: Constant) -> Self {
        self.constant(constant);
        self
    }

    pub fn find_method(&self, name: &str, sig: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.name == name && m.sig == sig)
    }
}

/// Count argument slots of a method signature `(IJLFoo;)V`
pub fn arg_slots(sig: &str) -> u16 {
    let inner = match sig.strip_prefix('(').and_then(|s| s.split(')').next()) {
        Some(inner) => inner,
        None => return 0,
    };
    let bytes = inner.as_bytes();
    let mut count = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'L' => {
                while i < bytes.len() && bytes[i] != b';' {
                    i += 1;
                }
            },
            b'[' => {
                while i < bytes.len() && bytes[i] == b'[' {
                    i += 1;
                }
                if i < bytes.len() && bytes[i] == b'L' {
                    while i < bytes.len() && bytes[i] != b';' {
                        i += 1;
                    }
                }
            },
            _ => {},
        }
        count += 1;
        i += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_slots() {
        assert_eq!(arg_slots("()V"), 0);
        assert_eq!(arg_slots("(IJ)I"), 2);
        assert_eq!(arg_slots("(LFoo;[I[LBar;Z)V"), 4);
    }

    #[test]
    fn test_builder() {
        let def = ClassDef::new("C")
            .extends("B")
            .field("a", "I")
            .static_field("count", "J")
            .method("get", "()I", vec![]);
        assert_eq!(def.super_name.as_deref(), Some("B"));
        assert_eq!(def.fields.len(), 2);
        assert!(def.fields[1].access.is_static());
        assert!(def.find_method("get", "()I").is_some());
    }

    #[test]
    fn test_constants_are_deduplicated() {
        let mut def = ClassDef::new("C");
        let a = def.constant(Constant::Int(1));
        let b = def.constant(Constant::Class("D".into()));
        let c = def.constant(Constant::Int(1));
        assert_eq!(a, c);
        assert_ne!(a, b);
    }
}
