//! relive-util - Foundation types shared by the live-update engine
//!
//! ============================================================================
//! MODULE OVERVIEW
//! ============================================================================
//!
//! The engine keeps every piece of VM metadata (classes, methods, threads,
//! frames) in flat arenas. This crate supplies the small pieces those arenas
//! are built from:
//!
//! - [`index_vec`]: `IndexVec<I, T>`, a vector addressed by a typed id
//! - [`ids`]: the id newtypes used across the engine plus an atomic id
//!   generator for runtime-allocated ids
//! - [`symbol`]: a process-wide string interner so class, field and method
//!   names compare in O(1)
//! - [`fx`]: hash map aliases with the fast non-cryptographic Fx hasher
//! - [`error`]: error types for the above
//!
//! DESIGN PRINCIPLES:
//! ------------------
//! 1. TYPE SAFETY
//!    A `MethodId` can never index the class arena. Mixing id spaces is a
//!    compile error, not a silent bug during a live update.
//!
//! 2. STABLE HANDLES
//!    Arena entries are never removed, so an id handed out before an update
//!    still resolves afterwards. Dead class versions stay reachable through
//!    their ids for stack repair and instance migration.
//!
//! 3. CHEAP NAME COMPARISON
//!    The differ and the layout planner match members by (name, signature)
//!    pairs many times per update. Interned [`symbol::Symbol`]s make each
//!    comparison an integer compare.

pub mod error;
pub mod fx;
pub mod ids;
pub mod index_vec;
pub mod symbol;

pub use error::{IndexVecError, SymbolError};
pub use ids::IdGenerator;
pub use index_vec::{Idx, IndexVec};
pub use symbol::Symbol;
