//! Core error types for relive-util
//!
//! This module defines error types used throughout the util crate.

use thiserror::Error;

/// Error type for symbol interning operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SymbolError {
    /// The interner ran out of indices
    #[error("Symbol table exhausted after {count} entries")]
    Exhausted { count: u32 },

    /// Symbol not found in the interner
    #[error("Symbol not found: index {index}")]
    NotFound { index: u32 },
}

/// Error type for index vector operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexVecError {
    /// Index out of bounds
    #[error("Index out of bounds: index {index}, length {length}")]
    OutOfBounds { index: usize, length: usize },

    /// Invalid index
    #[error("Invalid index: {0}")]
    InvalidIndex(String),
}

/// Result type alias for symbol operations
pub type SymbolResult<T> = std::result::Result<T, SymbolError>;

/// Result type alias for index vector operations
pub type IndexVecResult<T> = std::result::Result<T, IndexVecError>;

impl IndexVecError {
    /// Build an out-of-bounds error for `index` against an arena of `length`
    pub fn out_of_bounds(index: usize, length: usize) -> Self {
        IndexVecError::OutOfBounds { index, length }
    }
}
