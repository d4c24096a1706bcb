//! Typed ids for engine entities.
//!
//! Arena-backed entities (classes, methods, loaders) get `u32` newtypes that
//! implement [`Idx`](crate::index_vec::Idx). Runtime-allocated entities
//! (objects, threads, frames, requests) are handed out by an [`IdGenerator`]
//! and never reused.

use std::sync::atomic::{AtomicU64, Ordering};

crate::define_idx!(
    /// Index of a class version in the class arena
    ClassId
);

crate::define_idx!(
    /// Index of a method in the method arena
    MethodId
);

crate::define_idx!(
    /// Defining class loader
    LoaderId
);

impl LoaderId {
    /// The bootstrap loader, which always exists
    pub const BOOT: LoaderId = LoaderId(0);
}

macro_rules! define_runtime_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub u64);

        impl $name {
            /// The reserved "no entity" value
            pub const NONE: $name = $name(0);

            #[inline]
            pub fn is_none(self) -> bool {
                self.0 == 0
            }

            #[inline]
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(raw: u64) -> Self {
                $name(raw)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_runtime_id!(
    /// Heap object identity; `0` is the null reference
    ObjectId,
    "obj#"
);

define_runtime_id!(
    /// Application thread
    ThreadId,
    "thread#"
);

define_runtime_id!(
    /// A single activation on a thread stack
    FrameId,
    "frame#"
);

define_runtime_id!(
    /// An update request submitted to the coordinator
    RequestId,
    "request#"
);

/// Monotonic id source
///
/// Ids start at 1 so the zero value stays free as the `NONE` sentinel.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next raw id
    #[inline]
    pub fn next_raw(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate the next id as a typed value
    #[inline]
    pub fn next<T: From<u64>>(&self) -> T {
        T::from(self.next_raw())
    }

    /// Number of ids handed out so far
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - 1
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

static_assertions::assert_eq_size!(ObjectId, u64);
static_assertions::assert_eq_size!(ClassId, u32);
