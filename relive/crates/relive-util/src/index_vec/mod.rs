//! IndexVec - arena storage addressed by typed ids.
//!
//! Class metadata, methods and frames are kept in flat arenas and referred to
//! by small copyable ids rather than by pointers. [`IndexVec`] is the arena:
//! a `Vec<T>` whose index type is a newtype such as `ClassId`, so a method id
//! can never be used to look up a class by accident.
//!
//! # Example
//!
//! ```
//! use relive_util::index_vec::IndexVec;
//! use relive_util::define_idx;
//!
//! define_idx!(SlotId);
//!
//! let mut slots: IndexVec<SlotId, &str> = IndexVec::new();
//! let id = slots.push("toString");
//! assert_eq!(slots[id], "toString");
//! ```

use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// Conversion between a typed id and a raw arena position.
///
/// Implemented by every id newtype; usually through [`define_idx!`].
pub trait Idx: Copy + Eq + PartialEq {
    /// Build an id from a raw position
    ///
    /// # Panics
    ///
    /// Implementations panic if the position does not fit the id type.
    fn from_usize(idx: usize) -> Self;

    /// Raw position in the arena
    fn index(self) -> usize;
}

impl Idx for usize {
    #[inline]
    fn from_usize(idx: usize) -> Self {
        idx
    }

    #[inline]
    fn index(self) -> usize {
        self
    }
}

/// A vector indexed by a specific id type
///
/// Entries are never removed from the arenas this type backs; ids stay valid
/// for the life of the arena, which is what lets old class versions remain
/// addressable after they die.
#[derive(Clone)]
pub struct IndexVec<I, T> {
    raw: Vec<T>,
    _marker: PhantomData<fn(&I)>,
}

impl<I, T> IndexVec<I, T> {
    /// Create an empty arena
    #[inline]
    pub fn new() -> Self {
        Self {
            raw: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Create an arena with room for `capacity` entries
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            raw: Vec::with_capacity(capacity),
            _marker: PhantomData,
        }
    }

    /// Wrap an existing vector
    #[inline]
    pub fn from_raw(raw: Vec<T>) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    /// Reserve room for `additional` more entries
    #[inline]
    pub fn reserve(&mut self, additional: usize) {
        self.raw.reserve(additional)
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.raw
    }

    /// Iterate over values in id order
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.raw.iter()
    }

    #[inline]
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.raw.iter_mut()
    }
}

impl<I: Idx, T> IndexVec<I, T> {
    /// Append an entry and return its id
    #[inline]
    pub fn push(&mut self, value: T) -> I {
        let index = self.raw.len();
        self.raw.push(value);
        I::from_usize(index)
    }

    /// Id the next pushed entry will receive
    #[inline]
    pub fn next_index(&self) -> I {
        I::from_usize(self.raw.len())
    }

    #[inline]
    pub fn get(&self, index: I) -> Option<&T> {
        self.raw.get(index.index())
    }

    #[inline]
    pub fn get_mut(&mut self, index: I) -> Option<&mut T> {
        self.raw.get_mut(index.index())
    }

    /// Check whether `index` addresses an entry
    #[inline]
    pub fn contains(&self, index: I) -> bool {
        index.index() < self.raw.len()
    }

    /// Mutable access to two distinct entries at once
    ///
    /// Used when contents are exchanged between an old and a new class
    /// version in place.
    ///
    /// # Panics
    ///
    /// Panics if `a == b` or either id is out of bounds.
    pub fn pick2_mut(&mut self, a: I, b: I) -> (&mut T, &mut T) {
        let (ai, bi) = (a.index(), b.index());
        assert!(ai != bi, "pick2_mut requires distinct ids");
        if ai < bi {
            let (left, right) = self.raw.split_at_mut(bi);
            (&mut left[ai], &mut right[0])
        } else {
            let (left, right) = self.raw.split_at_mut(ai);
            (&mut right[0], &mut left[bi])
        }
    }

    /// Iterate over (id, value) pairs
    #[inline]
    pub fn iter_enumerated(&self) -> impl Iterator<Item = (I, &T)> {
        self.raw
            .iter()
            .enumerate()
            .map(|(i, v)| (I::from_usize(i), v))
    }

    /// Iterate over ids only
    #[inline]
    pub fn indices(&self) -> impl Iterator<Item = I> {
        (0..self.raw.len()).map(I::from_usize)
    }
}

impl<I: Idx, T> Index<I> for IndexVec<I, T> {
    type Output = T;

    #[inline]
    fn index(&self, index: I) -> &T {
        &self.raw[index.index()]
    }
}

impl<I: Idx, T> IndexMut<I> for IndexVec<I, T> {
    #[inline]
    fn index_mut(&mut self, index: I) -> &mut T {
        &mut self.raw[index.index()]
    }
}

impl<I, T> Default for IndexVec<I, T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<I, T: std::fmt::Debug> std::fmt::Debug for IndexVec<I, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.raw.iter()).finish()
    }
}

/// Define a `u32` id newtype implementing [`Idx`]
///
/// The generated type derives the usual traits and displays as `Name#n`.
///
/// ```
/// use relive_util::define_idx;
/// use relive_util::index_vec::Idx;
///
/// define_idx!(LoaderId);
/// assert_eq!(LoaderId::from_usize(3).index(), 3);
/// ```
#[macro_export]
macro_rules! define_idx {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl $crate::index_vec::Idx for $name {
            #[inline]
            fn from_usize(idx: usize) -> Self {
                assert!(idx <= u32::MAX as usize, "Index {} exceeds u32::MAX", idx);
                $name(idx as u32)
            }

            #[inline]
            fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

#[cfg(test)]
mod tests;
