//! String interner backed by DashMap.
//!
//! Forward lookups (string to symbol) go through a sharded `DashMap` hashed
//! with ahash. Reverse lookups index a vector of leaked strings, which is
//! appended to while the inserting shard is still locked so that a symbol's
//! index always equals its position in the vector.

use ahash::RandomState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{LazyLock, RwLock};

use super::{sym, InternerStats, Symbol};
use crate::error::{SymbolError, SymbolResult};

/// The process-wide string table
pub static STRING_TABLE: LazyLock<StringTable> = LazyLock::new(|| {
    let table = StringTable::new();
    for known in sym::KNOWN {
        table.intern(known);
    }
    table
});

pub struct StringTable {
    map: DashMap<&'static str, u32, RandomState>,
    strings: RwLock<Vec<&'static str>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl StringTable {
    fn new() -> Self {
        Self {
            map: DashMap::with_capacity_and_hasher(256, RandomState::new()),
            strings: RwLock::new(Vec::with_capacity(256)),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn intern(&self, string: &str) -> Symbol {
        if let Some(entry) = self.map.get(string) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Symbol {
                index: *entry.value(),
            };
        }

        let interned: &'static str = Box::leak(string.to_owned().into_boxed_str());
        match self.map.entry(interned) {
            Entry::Occupied(entry) => {
                // lost the race; the leaked copy is small and never reused
                self.hits.fetch_add(1, Ordering::Relaxed);
                Symbol {
                    index: *entry.get(),
                }
            }
            Entry::Vacant(entry) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let mut strings = self
                    .strings
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let index = strings.len() as u32;
                strings.push(interned);
                entry.insert(index);
                Symbol { index }
            }
        }
    }

    /// Reverse lookup
    pub fn get(&self, symbol: Symbol) -> Option<&'static str> {
        let strings = self
            .strings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        strings.get(symbol.index as usize).copied()
    }

    pub fn resolve(&self, symbol: Symbol) -> SymbolResult<&'static str> {
        self.get(symbol).ok_or(SymbolError::NotFound {
            index: symbol.index,
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn stats(&self) -> InternerStats {
        InternerStats {
            count: self.map.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_intern_same_string() {
        let s1 = STRING_TABLE.intern("hello");
        let s2 = STRING_TABLE.intern("hello");
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_intern_different_strings() {
        let s1 = STRING_TABLE.intern("hello");
        let s2 = STRING_TABLE.intern("world");
        assert_ne!(s1, s2);
    }

    #[test]
    fn test_get_string() {
        let symbol = STRING_TABLE.intern("test_string");
        assert_eq!(STRING_TABLE.get(symbol), Some("test_string"));
        assert_eq!(STRING_TABLE.resolve(symbol), Ok("test_string"));
    }

    #[test]
    fn test_concurrent_intern_same_names() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                thread::spawn(|| {
                    (0..50)
                        .map(|i| STRING_TABLE.intern(&format!("shared_{}", i)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<Vec<Symbol>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for other in &results[1..] {
            assert_eq!(&results[0], other);
        }
        for (i, symbol) in results[0].iter().enumerate() {
            assert_eq!(symbol.as_str(), format!("shared_{}", i));
        }
    }

    #[test]
    fn test_stats_count_hits() {
        let before = STRING_TABLE.stats();
        STRING_TABLE.intern("stats_probe");
        STRING_TABLE.intern("stats_probe");
        let after = STRING_TABLE.stats();
        assert!(after.hits > before.hits);
        assert!(after.count >= before.count);
    }
}
