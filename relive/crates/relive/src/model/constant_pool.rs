//! Constant pools and their resolution caches.
//!
//! The symbolic entries never change after a class is built. Resolution
//! results are cached per index; relinking a class throws the cache away so
//! the next execution resolves against the current registry.

use parking_lot::RwLock;
use relive_util::fx::FxHashMap;
use relive_util::ids::{ClassId, MethodId};

use super::def::Constant;
use super::types::BasicType;

/// Cached result of resolving one constant pool entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Class(ClassId),
    Field {
        holder: ClassId,
        offset: usize,
        ty: BasicType,
        is_static: bool,
        /// Access check bits of the resolved field
        checks: u8,
    },
    Method {
        method: MethodId,
        /// Dispatch through the receiver's vtable when set
        vtable_index: Option<usize>,
        /// Dispatch by name and signature on the receiver (interface calls)
        by_name: bool,
    },
}

#[derive(Debug)]
pub struct ConstantPool {
    entries: Vec<Constant>,
    cache: RwLock<FxHashMap<u16, Resolved>>,
}

impl ConstantPool {
    pub fn new(entries: Vec<Constant>) -> Self {
        ConstantPool {
            entries,
            cache: RwLock::new(FxHashMap::default()),
        }
    }

    #[inline]
    pub fn get(&self, index: u16) -> Option<&Constant> {
        self.entries.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Constant] {
        &self.entries
    }

    pub fn resolved(&self, index: u16) -> Option<Resolved> {
        self.cache.read().get(&index).copied()
    }

    pub fn store(&self, index: u16, resolved: Resolved) {
        self.cache.write().insert(index, resolved);
    }

    /// Drop every cached resolution, returning how many were dropped
    pub fn clear_cache(&self) -> usize {
        let mut cache = self.cache.write();
        let n = cache.len();
        cache.clear();
        n
    }

    pub fn cached_count(&self) -> usize {
        self.cache.read().len()
    }

    /// Names of all classes this pool refers to, including the owners of
    /// field and method references
    pub fn referenced_classes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|c| match c {
            Constant::Class(name) => Some(name.as_str()),
            Constant::FieldRef { class, .. } | Constant::MethodRef { class, .. } => {
                Some(class.as_str())
            },
            _ => None,
        })
    }

    pub fn references_class(&self, name: &str) -> bool {
        self.referenced_classes().any(|c| c == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relive_util::index_vec::Idx;

    fn pool() -> ConstantPool {
        ConstantPool::new(vec![
            Constant::Int(4),
            Constant::MethodRef {
                class: "Helper".into(),
                name: "run".into(),
                sig: "()V".into(),
            },
            Constant::Class("Widget".into()),
        ])
    }

    #[test]
    fn test_referenced_classes() {
        let pool = pool();
        let names: Vec<_> = pool.referenced_classes().collect();
        assert_eq!(names, vec!["Helper", "Widget"]);
        assert!(pool.references_class("Widget"));
        assert!(!pool.references_class("Gadget"));
    }

    #[test]
    fn test_cache_clear() {
        let pool = pool();
        pool.store(2, Resolved::Class(ClassId::from_usize(7)));
        assert_eq!(pool.resolved(2), Some(Resolved::Class(ClassId::from_usize(7))));
        assert_eq!(pool.clear_cache(), 1);
        assert_eq!(pool.resolved(2), None);
    }
}
