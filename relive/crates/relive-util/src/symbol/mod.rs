//! Symbol module - interned names for classes, fields and methods.
//!
//! A [`Symbol`] is a 4-byte handle to a string stored once in a process-wide
//! table. Two symbols are equal exactly when their strings are equal, so
//! member matching during class comparison is an integer compare.
//!
//! Ordering: the derived `Ord` on `Symbol` compares interning order, which is
//! arbitrary. Code that needs name order (the method merge in the differ)
//! must use [`Symbol::cmp_str`].
//!
//! # Examples
//!
//! ```
//! use relive_util::symbol::{Symbol, sym};
//!
//! let a = Symbol::intern("counter");
//! let b = Symbol::intern("counter");
//! assert_eq!(a, b);
//! assert_eq!(a.as_str(), "counter");
//! assert_eq!(sym::INIT.as_str(), "<init>");
//! ```
//!
//! Symbols can be interned from any thread:
//!
//! ```
//! use relive_util::symbol::Symbol;
//! use std::thread;
//!
//! let handles: Vec<_> = (0..4)
//!     .map(|i| thread::spawn(move || Symbol::intern(&format!("field_{}", i))))
//!     .collect();
//! let symbols: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
//! assert_eq!(symbols.len(), 4);
//! ```

mod interner;

use std::cmp::Ordering;
use std::fmt;

pub use interner::{StringTable, STRING_TABLE};

use crate::error::SymbolResult;

/// Hit/miss counters of the interner
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InternerStats {
    /// Number of interned strings
    pub count: usize,
    /// Lookups that found an existing entry
    pub hits: usize,
    /// Lookups that inserted a new entry
    pub misses: usize,
}

impl InternerStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Handle to an interned string
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol {
    pub(crate) index: u32,
}

static_assertions::assert_eq_size!(Symbol, u32);
static_assertions::assert_impl_all!(Symbol: Send, Sync, Copy);

/// Symbols pre-interned at table creation, in this order.
pub mod sym {
    use super::Symbol;

    pub const EMPTY: Symbol = Symbol { index: 0 };
    /// Instance initializer
    pub const INIT: Symbol = Symbol { index: 1 };
    /// Static initializer
    pub const CLINIT: Symbol = Symbol { index: 2 };
    /// Root of every class hierarchy
    pub const OBJECT: Symbol = Symbol { index: 3 };
    /// Signature of a no-arg void method
    pub const VOID_SIG: Symbol = Symbol { index: 4 };

    pub(crate) const KNOWN: &[&str] = &["", "<init>", "<clinit>", "Object", "()V"];
}

impl Symbol {
    /// Intern a string, returning its symbol
    ///
    /// Thread-safe; concurrent calls with the same string return the same
    /// symbol.
    pub fn intern(string: &str) -> Self {
        STRING_TABLE.intern(string)
    }

    /// The interned string
    ///
    /// Symbols are only created by interning, so lookup cannot fail for any
    /// symbol obtained through [`Symbol::intern`]. A symbol forged through
    /// [`Symbol::from_u32`] with an unknown index renders as `"<invalid>"`.
    pub fn as_str(self) -> &'static str {
        STRING_TABLE.get(self).unwrap_or("<invalid>")
    }

    /// Fallible variant of [`Symbol::as_str`]
    pub fn try_as_str(self) -> SymbolResult<&'static str> {
        STRING_TABLE.resolve(self)
    }

    /// Compare two symbols by their string contents
    pub fn cmp_str(self, other: Symbol) -> Ordering {
        if self == other {
            return Ordering::Equal;
        }
        self.as_str().cmp(other.as_str())
    }

    /// True for symbols interned when the table was created
    pub fn is_known(self) -> bool {
        (self.index as usize) < sym::KNOWN.len()
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self.index
    }

    /// Rebuild a symbol from a raw index, typically one read back from
    /// [`Symbol::as_u32`]
    #[inline]
    pub const fn from_u32(index: u32) -> Self {
        Symbol { index }
    }

    /// Interner statistics
    pub fn stats() -> InternerStats {
        STRING_TABLE.stats()
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.as_str(), self.index)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::intern(s)
    }
}

impl PartialEq<str> for Symbol {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for Symbol {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_symbols_resolve() {
        assert_eq!(sym::EMPTY.as_str(), "");
        assert_eq!(sym::INIT.as_str(), "<init>");
        assert_eq!(sym::CLINIT.as_str(), "<clinit>");
        assert_eq!(sym::OBJECT.as_str(), "Object");
        assert_eq!(sym::VOID_SIG.as_str(), "()V");
        assert!(sym::OBJECT.is_known());
        assert_eq!(Symbol::intern("Object"), sym::OBJECT);
    }

    #[test]
    fn test_cmp_str_is_lexicographic() {
        // intern in reverse order so index order disagrees with name order
        let zed = Symbol::intern("zz_method");
        let alpha = Symbol::intern("aa_method");
        assert_eq!(alpha.cmp_str(zed), Ordering::Less);
        assert_eq!(zed.cmp_str(alpha), Ordering::Greater);
        assert_eq!(zed.cmp_str(zed), Ordering::Equal);
    }

    #[test]
    fn test_eq_str() {
        let s = Symbol::intern("value");
        assert!(s == "value");
        assert_eq!(s.to_string(), "value");
    }

    #[test]
    fn test_forged_symbol_is_invalid() {
        let forged = Symbol::from_u32(u32::MAX - 1);
        assert_eq!(forged.as_str(), "<invalid>");
        assert!(forged.try_as_str().is_err());
    }
}
