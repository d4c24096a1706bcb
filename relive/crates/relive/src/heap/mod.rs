//! Heap Module - instance storage
//!
//! A flat table of live instances keyed by [`ObjectId`]. There is no
//! collector: objects live as long as the runtime. The heap exists so the
//! migration engine has real instances to reshape and so an eager sweep can
//! enumerate every object.

pub mod object;

pub use object::{HeaderState, HeapObject, InstanceShape, Phantom, PendingTransform};

use parking_lot::RwLock;
use relive_util::fx::FxIndexMap;
use relive_util::ids::{ClassId, ObjectId};
use relive_util::IdGenerator;
use std::sync::Arc;

use crate::error::{Result, UpdateError};

#[derive(Default)]
pub struct Heap {
    objects: RwLock<FxIndexMap<ObjectId, Arc<HeapObject>>>,
    ids: IdGenerator,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed instance of `size` bytes
    pub fn allocate(&self, klass: ClassId, size: usize) -> Arc<HeapObject> {
        let id: ObjectId = self.ids.next();
        let object = Arc::new(HeapObject::new(id, klass, size));
        self.objects.write().insert(id, Arc::clone(&object));
        object
    }

    pub fn get(&self, id: ObjectId) -> Result<Arc<HeapObject>> {
        if id.is_none() {
            return Err(UpdateError::InvalidArgument("null reference".to_string()));
        }
        self.objects
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| UpdateError::InvalidArgument(format!("unknown object {}", id)))
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// All objects in allocation order
    pub fn snapshot(&self) -> Vec<Arc<HeapObject>> {
        self.objects.read().values().cloned().collect()
    }

    /// Objects whose header currently names one of `classes`
    pub fn instances_of(&self, classes: &[ClassId]) -> Vec<Arc<HeapObject>> {
        self.objects
            .read()
            .values()
            .filter(|o| classes.contains(&o.klass()))
            .cloned()
            .collect()
    }

    /// Bytes handed back as filler across the heap
    pub fn filler_bytes(&self) -> usize {
        self.objects.read().values().map(|o| o.filler()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relive_util::index_vec::Idx;

    #[test]
    fn test_allocate_and_get() {
        let heap = Heap::new();
        let a = heap.allocate(ClassId::from_usize(1), 16);
        let b = heap.allocate(ClassId::from_usize(2), 0);
        assert_ne!(a.id(), b.id());
        assert_eq!(heap.len(), 2);
        assert_eq!(heap.get(a.id()).unwrap().primary_len(), 16);
        assert!(heap.get(ObjectId::NONE).is_err());
        assert_eq!(heap.instances_of(&[ClassId::from_usize(2)]).len(), 1);
    }
}
