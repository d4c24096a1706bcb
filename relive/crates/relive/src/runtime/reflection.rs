//! Reflective field handles.
//!
//! A handle caches the resolved location of a field so repeated reflective
//! access skips lookup. Handles outlive updates: when the holder class is
//! redefined the handle is re-pointed at the matching field of the new
//! version, following a remap hint when the request supplies one, and
//! invalidated when the field is gone.

use parking_lot::RwLock;
use relive_util::fx::FxIndexMap;
use relive_util::ids::ClassId;
use relive_util::{IdGenerator, Symbol};
use std::fmt;

use crate::model::{BasicType, ClassRegistry};

/// Opaque reflective field handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldHandle(pub u64);

impl From<u64> for FieldHandle {
    fn from(raw: u64) -> Self {
        FieldHandle(raw)
    }
}

impl fmt::Display for FieldHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "field-handle#{}", self.0)
    }
}

/// Resolved target of a field handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSlot {
    pub holder: ClassId,
    pub name: Symbol,
    pub sig: Symbol,
    pub offset: usize,
    pub ty: BasicType,
    pub is_static: bool,
    pub valid: bool,
}

/// Request hint: field `old` of `class` is now called `new`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRemapHint {
    pub class: String,
    pub old_field: String,
    pub new_field: String,
}

/// Counts of one remap pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemapOutcome {
    pub remapped: usize,
    pub invalidated: usize,
}

#[derive(Default)]
pub struct ReflectionTable {
    slots: RwLock<FxIndexMap<FieldHandle, FieldSlot>>,
    ids: IdGenerator,
}

impl ReflectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self, slot: FieldSlot) -> FieldHandle {
        let handle: FieldHandle = self.ids.next();
        self.slots.write().insert(handle, slot);
        handle
    }

    pub fn get(&self, handle: FieldHandle) -> Option<FieldSlot> {
        self.slots.read().get(&handle).cloned()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Re-point handles whose holder was replaced
    ///
    /// `replaced` maps each old holder to its successor, `None` for a
    /// deleted class.
    pub(crate) fn remap(
        &self,
        registry: &ClassRegistry,
        replaced: &[(ClassId, Option<ClassId>)],
        hints: &[FieldRemapHint],
    ) -> RemapOutcome {
        let mut outcome = RemapOutcome::default();
        let mut slots = self.slots.write();
        for slot in slots.values_mut().filter(|s| s.valid) {
            let Some(&(_, successor)) = replaced.iter().find(|(old, _)| *old == slot.holder) else {
                continue;
            };
            let Some(new) = successor else {
                slot.valid = false;
                outcome.invalidated += 1;
                continue;
            };
            let class_name = registry.klass(new).name;
            let target = hints
                .iter()
                .find(|h| class_name == h.class.as_str() && slot.name == h.old_field.as_str())
                .map_or(slot.name, |h| Symbol::intern(&h.new_field));
            let found = registry
                .klass(new)
                .fields
                .iter()
                .find(|f| f.name == target && f.is_static() == slot.is_static)
                .cloned();
            match found {
                Some(f) if f.sig == slot.sig || target != slot.name => {
                    slot.holder = new;
                    slot.name = f.name;
                    slot.sig = f.sig;
                    slot.offset = f.offset;
                    slot.ty = f.ty;
                    outcome.remapped += 1;
                },
                _ => {
                    slot.valid = false;
                    outcome.invalidated += 1;
                },
            }
        }
        outcome
    }
}
