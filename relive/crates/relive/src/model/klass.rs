//! Class metadata.
//!
//! A [`Klass`] is one *version* of a class. Versions of the same class are
//! chained through `previous_version`/`next_version` and each carries the
//! half-open revision interval `[born_rn, dead_rn)` during which it is the
//! live version. Dead versions are never removed from the arena; frames and
//! objects created under them still need their metadata.

use parking_lot::Mutex;
use relive_util::ids::{ClassId, LoaderId, MethodId};
use relive_util::Symbol;
use std::fmt;
use std::sync::Arc;

use super::constant_pool::ConstantPool;
use super::def::ClassDef;
use super::types::{AccessFlags, BasicType};
use crate::layout::LayoutPlan;
use crate::migration::Transformer;

/// `dead_rn` of a class that is still alive
pub const ALIVE: u64 = u64::MAX;

/// A field declared by a class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: Symbol,
    pub sig: Symbol,
    pub access: AccessFlags,
    pub ty: BasicType,
    /// Byte offset in the instance, or in the static area for statics
    pub offset: usize,
    /// [`FieldInfo::STALE_CHECK`] / [`FieldInfo::MIXED_CHECK`]
    pub checks: u8,
}

impl FieldInfo {
    /// The field moved or is new since the previous version
    pub const STALE_CHECK: u8 = 1 << 0;
    /// The field may live in phantom storage
    pub const MIXED_CHECK: u8 = 1 << 1;

    #[inline]
    pub fn is_static(&self) -> bool {
        self.access.is_static()
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.ty.size()
    }

    pub fn matches(&self, name: Symbol, sig: Symbol) -> bool {
        self.name == name && self.sig == sig
    }
}

/// Class-level update flags
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KlassFlags(pub u32);

impl KlassFlags {
    /// Superseded or deleted; objects of it must be migrated
    pub const STALE: u32 = 1 << 0;
    /// The new version dropped a supertype the old one had
    pub const TYPE_NARROWED: u32 = 1 << 1;
    /// An ancestor between the old super and the common ancestor
    pub const SUPER_OF_STALE: u32 = 1 << 2;
    /// Dynamic type checks against this type must consult narrowing
    pub const NARROWING_RELEVANT: u32 = 1 << 3;
    /// Shape descriptor of the inplace part of a mixed object
    pub const INPLACE_SHAPE: u32 = 1 << 4;
    /// Descriptor of a half-migrated object
    pub const STALE_SHAPE: u32 = 1 << 5;
    pub const HAS_TRANSFORMER: u32 = 1 << 6;
    /// Static initialization done
    pub const INITIALIZED: u32 = 1 << 7;

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

impl fmt::Debug for KlassFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KlassFlags({:#x})", self.0)
    }
}

/// Where a class version stands in the update it takes part in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
pub enum UpdateState {
    #[default]
    None,
    WillBeAdded,
    WillBeRecompiled,
    WillBeSwapped,
    WillBeRedefined,
    WillBeDeleted,
    HasBeenAdded,
    HasBeenRecompiled,
    HasBeenSwapped,
    HasBeenRedefined,
    HasBeenDeleted,
}

impl UpdateState {
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            UpdateState::WillBeAdded
                | UpdateState::WillBeRecompiled
                | UpdateState::WillBeSwapped
                | UpdateState::WillBeRedefined
                | UpdateState::WillBeDeleted
        )
    }
}

/// How instances of a redefined class reach the new shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
pub enum TransformLevel {
    /// Nothing to do
    #[default]
    None,
    /// Layout identical, only the class pointer moves
    ReplaceKlass,
    /// Copy matched fields
    DefaultCopy,
    /// Copy matched fields, then run a custom transformer
    Custom,
}

/// One version of a class
pub struct Klass {
    pub id: ClassId,
    pub name: Symbol,
    pub loader: LoaderId,
    pub access: AccessFlags,
    pub super_class: Option<ClassId>,
    /// Interfaces named by the definition
    pub local_interfaces: Vec<ClassId>,
    /// All implemented interfaces, including inherited ones
    pub interfaces: Vec<ClassId>,
    /// Fields declared by this class, instance and static
    pub fields: Vec<FieldInfo>,
    pub instance_size: usize,
    pub static_size: usize,
    /// Methods declared by this class
    pub methods: Vec<MethodId>,
    pub vtable: Vec<MethodId>,
    pub constants: Arc<ConstantPool>,
    pub def: Arc<ClassDef>,
    pub statics: Arc<Mutex<Box<[u8]>>>,
    pub subclasses: Vec<ClassId>,
    pub flags: KlassFlags,
    pub update_state: UpdateState,
    pub born_rn: u64,
    pub dead_rn: u64,
    pub previous_version: Option<ClassId>,
    pub next_version: Option<ClassId>,
    /// Migration plan, set on the new version of a redefined class
    pub plan: Option<Arc<LayoutPlan>>,
    pub transform_level: TransformLevel,
    pub transformer: Option<Arc<dyn Transformer>>,
    pub inplace_shape: Option<ClassId>,
    pub stale_shape: Option<ClassId>,
}

impl Klass {
    #[inline]
    pub fn is_stale(&self) -> bool {
        self.flags.has(KlassFlags::STALE)
    }

    #[inline]
    pub fn is_interface(&self) -> bool {
        self.access.is_interface()
    }

    /// Whether this version is the live one at revision `rn`
    #[inline]
    pub fn is_alive_at(&self, rn: u64) -> bool {
        self.born_rn <= rn && rn < self.dead_rn
    }

    /// Validity interval `[born_rn, dead_rn)`
    pub fn revision_interval(&self) -> (u64, u64) {
        (self.born_rn, self.dead_rn)
    }

    pub fn own_field(&self, name: Symbol, sig: Symbol) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.matches(name, sig))
    }

    pub fn instance_fields(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter().filter(|f| !f.is_static())
    }

    pub fn static_fields(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter().filter(|f| f.is_static())
    }

    /// Build a shape-only descriptor from this class
    ///
    /// The copy shares layout, vtable, constants and statics with `self` but
    /// has its own id and no place in the dictionary or the hierarchy.
    pub(crate) fn derive_shape(&self, id: ClassId, flag: u32, instance_size: usize) -> Klass {
        let mut flags = KlassFlags::default();
        flags.set(flag);
        Klass {
            id,
            name: self.name,
            loader: self.loader,
            access: self.access,
            super_class: self.super_class,
            local_interfaces: self.local_interfaces.clone(),
            interfaces: self.interfaces.clone(),
            fields: self.fields.clone(),
            instance_size,
            static_size: self.static_size,
            methods: self.methods.clone(),
            vtable: self.vtable.clone(),
            constants: Arc::clone(&self.constants),
            def: Arc::clone(&self.def),
            statics: Arc::clone(&self.statics),
            subclasses: Vec::new(),
            flags,
            update_state: UpdateState::None,
            born_rn: self.born_rn,
            dead_rn: ALIVE,
            previous_version: None,
            next_version: Some(self.id),
            plan: self.plan.clone(),
            transform_level: self.transform_level,
            transformer: self.transformer.clone(),
            inplace_shape: None,
            stale_shape: None,
        }
    }
}

impl fmt::Debug for Klass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Klass")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("super", &self.super_class)
            .field("size", &self.instance_size)
            .field("flags", &self.flags)
            .field("state", &self.update_state)
            .field("born_rn", &self.born_rn)
            .field("dead_rn", &self.dead_rn)
            .finish()
    }
}

impl fmt::Display for Klass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dead_rn == ALIVE {
            write!(f, "{}@[{},)", self.name, self.born_rn)
        } else {
            write!(f, "{}@[{},{})", self.name, self.born_rn, self.dead_rn)
        }
    }
}
