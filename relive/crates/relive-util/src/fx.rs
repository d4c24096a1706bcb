//! Hash collections keyed with the Fx hasher.
//!
//! Keys in the engine are small integers and interned symbols, for which Fx
//! is much faster than SipHash and DoS resistance does not matter.

use std::hash::BuildHasherDefault;

pub use rustc_hash::{FxHashMap, FxHashSet, FxHasher};

/// Insertion-ordered map with the Fx hasher
///
/// Used wherever iteration order has to be deterministic, such as the class
/// dictionary and per-loader request groups.
pub type FxIndexMap<K, V> = indexmap::IndexMap<K, V, BuildHasherDefault<FxHasher>>;

/// Insertion-ordered set with the Fx hasher
pub type FxIndexSet<T> = indexmap::IndexSet<T, BuildHasherDefault<FxHasher>>;
