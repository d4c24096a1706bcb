//! Code cache
//!
//! Records which methods run as compiled code and which methods each
//! compiled body inlined. Compiled code carries no separate machine code
//! here; what matters to an update is the dependency record, because a
//! compiled body that inlined a now-stale method must be thrown away and
//! its frames deoptimized before the revision switch.

use parking_lot::RwLock;
use relive_util::fx::FxHashMap;
use relive_util::ids::MethodId;
use std::sync::atomic::{AtomicU64, Ordering};

/// Code cache events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeEvent {
    Compiled { method: MethodId, inlined: usize },
    Invalidated { method: MethodId, reason: String },
}

#[derive(Debug, Clone)]
struct CompiledMethod {
    /// Methods whose bodies were inlined into this one
    inlined: Vec<MethodId>,
}

/// Code cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CodeCacheStats {
    pub total_compilations: u64,
    pub total_invalidations: u64,
    pub active_methods: usize,
}

pub struct CodeCache {
    compiled: RwLock<FxHashMap<MethodId, CompiledMethod>>,
    events: RwLock<Vec<CodeEvent>>,
    total_compilations: AtomicU64,
    total_invalidations: AtomicU64,
}

impl CodeCache {
    pub fn new() -> Self {
        Self {
            compiled: RwLock::new(FxHashMap::default()),
            events: RwLock::new(Vec::new()),
            total_compilations: AtomicU64::new(0),
            total_invalidations: AtomicU64::new(0),
        }
    }

    /// Enter `method` as compiled with the given inlined callees
    pub fn compile(&self, method: MethodId, inlined: Vec<MethodId>) {
        self.total_compilations.fetch_add(1, Ordering::Relaxed);
        let count = inlined.len();
        self.compiled.write().insert(method, CompiledMethod { inlined });
        self.events.write().push(CodeEvent::Compiled {
            method,
            inlined: count,
        });
    }

    pub fn is_compiled(&self, method: MethodId) -> bool {
        self.compiled.read().contains_key(&method)
    }

    pub fn inlined(&self, method: MethodId) -> Option<Vec<MethodId>> {
        self.compiled.read().get(&method).map(|c| c.inlined.clone())
    }

    /// Drop every compiled body that is or inlined one of `stale`
    ///
    /// Returns the methods that lost their compiled code.
    pub fn invalidate_dependent(&self, stale: &[MethodId]) -> Vec<MethodId> {
        let mut compiled = self.compiled.write();
        let removed: Vec<MethodId> = compiled
            .iter()
            .filter(|(m, c)| stale.contains(m) || c.inlined.iter().any(|i| stale.contains(i)))
            .map(|(&m, _)| m)
            .collect();
        for m in &removed {
            compiled.remove(m);
        }
        drop(compiled);

        if !removed.is_empty() {
            self.total_invalidations
                .fetch_add(removed.len() as u64, Ordering::Relaxed);
            let mut events = self.events.write();
            for &method in &removed {
                events.push(CodeEvent::Invalidated {
                    method,
                    reason: "depends on stale method".to_string(),
                });
            }
        }
        removed
    }

    /// Drop all compiled code
    pub fn flush_all(&self) -> usize {
        let mut compiled = self.compiled.write();
        let n = compiled.len();
        compiled.clear();
        self.total_invalidations.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    pub fn events(&self) -> Vec<CodeEvent> {
        self.events.read().clone()
    }

    pub fn get_stats(&self) -> CodeCacheStats {
        CodeCacheStats {
            total_compilations: self.total_compilations.load(Ordering::Relaxed),
            total_invalidations: self.total_invalidations.load(Ordering::Relaxed),
            active_methods: self.compiled.read().len(),
        }
    }
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relive_util::index_vec::Idx;

    fn m(i: usize) -> MethodId {
        MethodId::from_usize(i)
    }

    #[test]
    fn test_invalidate_inliners() {
        let cache = CodeCache::new();
        cache.compile(m(1), vec![m(5)]);
        cache.compile(m(2), vec![m(6)]);
        cache.compile(m(5), vec![]);

        let mut removed = cache.invalidate_dependent(&[m(5)]);
        removed.sort();
        assert_eq!(removed, vec![m(1), m(5)]);
        assert!(cache.is_compiled(m(2)));

        let stats = cache.get_stats();
        assert_eq!(stats.total_compilations, 3);
        assert_eq!(stats.total_invalidations, 2);
        assert_eq!(stats.active_methods, 1);
    }

    #[test]
    fn test_flush_all() {
        let cache = CodeCache::new();
        cache.compile(m(1), vec![]);
        assert_eq!(cache.flush_all(), 1);
        assert!(!cache.is_compiled(m(1)));
    }
}
