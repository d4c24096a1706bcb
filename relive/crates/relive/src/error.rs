//! Error Module - live-update error types
//!
//! Defines all error types used by the engine.
//!
//! # Error Categories
//!
//! ## Update Errors
//! - `ClassResolution` - a class named by a request could not be resolved
//! - `LayoutComputation` - field correspondence could not be computed
//! - `InvalidJoin` - classification crossed the ADD/DEL boundary
//! - `QuiescenceRetry` - some thread is still running restricted code
//! - `PartialApplication` - at least one class failed during apply
//! - `ObjectMigration` - an instance could not be migrated yet
//!
//! ## Concurrency Errors
//! - `LockPoisoned` - mutex poisoned by thread panic
//! - `Timeout` - a request or pause did not complete in time
//!
//! ## Execution Errors
//! - `Execution` - interpreted code failed
//!
//! ## Configuration Errors
//! - `Configuration` - invalid configuration
//! - `InvalidState` - invalid internal state
//! - `InvalidArgument` - invalid function argument
//!
//! None of these abort the host process. Every error is returned as a value
//! and every variant maps to a stable [`DiagnosticCode`] reported back to the
//! submitter.

use std::fmt;
use std::sync::PoisonError;
use thiserror::Error;

use crate::model::UpdatingType;

/// Main error type for all engine operations
///
/// # Examples
///
/// ```rust
/// use relive::error::UpdateError;
///
/// fn handle_error(err: UpdateError) {
///     match err {
///         UpdateError::QuiescenceRetry { unsafe_threads } => {
///             eprintln!("{} threads still busy, retrying", unsafe_threads);
///         }
///         UpdateError::ClassResolution { class, reason } => {
///             eprintln!("cannot resolve {}: {}", class, reason);
///         }
///         _ => {
///             eprintln!("Other error: {}", err);
///         }
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum UpdateError {
    /// A class named in the request could not be resolved
    ///
    /// **When returned:** the old class is missing for a modified/deleted
    /// entry, the provider fails to produce a definition, a superclass is
    /// unknown, or preparation recursion reaches the same class twice.
    ///
    /// **Recovery strategy:** fix the request and resubmit
    #[error("Class resolution failed for {class}: {reason}")]
    ClassResolution { class: String, reason: String },

    /// Field correspondence could not be computed
    ///
    /// **When returned:** old and new hierarchies share no ancestor, or the
    /// shared ancestor shrank
    ///
    /// **Recovery strategy:** none for this request; the class shape is not
    /// updatable in place
    #[error("Layout computation failed for {class}: {reason}")]
    LayoutComputation { class: String, reason: String },

    /// Two classifications that cannot be combined
    ///
    /// **When returned:** joining ADD or DEL with a middle category
    ///
    /// **Recovery strategy:** reject the request during prepare
    #[error("Invalid classification join for {class}: {left} with {right}")]
    InvalidJoin {
        class: String,
        left: UpdatingType,
        right: UpdatingType,
    },

    /// Some application thread is still executing restricted code
    ///
    /// **When returned:** a pause found unsafe threads; return barriers have
    /// been installed
    ///
    /// **Recovery strategy:** automatic; the coordinator retries when the
    /// last barrier fires
    #[error("Quiescence not reached: {unsafe_threads} threads unsafe")]
    QuiescenceRetry { unsafe_threads: usize },

    /// The class registry changed between prepare and apply
    ///
    /// **Recovery strategy:** automatic; the request is prepared again
    #[error("Class registry modified since prepare (expected {expected}, found {found})")]
    SystemModified { expected: u64, found: u64 },

    /// At least one class could not be applied
    ///
    /// **When returned:** a per-class fault during apply. Classes applied
    /// before the fault stay applied.
    ///
    /// **Recovery strategy:** submit a corrective request for the failed
    /// classes
    #[error("Partial application: {failed} of {total} classes failed ({first})")]
    PartialApplication {
        failed: usize,
        total: usize,
        first: String,
    },

    /// A live instance could not be migrated
    ///
    /// **When returned:** a custom transformer failed
    ///
    /// **Recovery strategy:** automatic; the object stays in its stale shape
    /// and the transformer is retried on the next access
    #[error("Object migration failed for {object}: {reason}")]
    ObjectMigration { object: String, reason: String },

    /// The request carried no classes at all
    #[error("Update request is empty")]
    EmptyRequest,

    /// No class in the request actually changed
    #[error("Update request discarded: no class changed")]
    Discarded,

    /// Configuration error
    ///
    /// **When returned:** invalid engine configuration detected
    ///
    /// **Recovery strategy:** use default configuration or fail fast
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Interpreted code failed
    ///
    /// **When returned:** a null dereference, a call to a method of a
    /// deleted class, malformed bytecode, or a failing host function
    ///
    /// **Recovery strategy:** the failing call unwinds; the thread stays
    /// usable
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Internal error - indicates a bug in the engine
    ///
    /// **Recovery strategy:** cannot recover - this is a bug
    #[error("Internal error: {0}")]
    Internal(String),

    /// Lock poisoned
    ///
    /// **When returned:** another thread panicked while holding a lock
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    /// Invalid state
    ///
    /// **When returned:** internal state machine violation, such as applying
    /// a request that was never prepared
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Invalid argument
    ///
    /// **When returned:** a request references unknown ids, or names one
    /// class twice with conflicting kinds
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation timeout
    ///
    /// **When returned:** a synchronous submission did not settle in time
    #[error("Operation timeout: {0}")]
    Timeout(String),

    /// Resource exhausted
    ///
    /// **When returned:** the request queue is full or the coordinator has
    /// shut down
    #[error("Resource exhausted: {resource}")]
    ResourceExhausted { resource: String },
}

impl UpdateError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            UpdateError::QuiescenceRetry { .. }
                | UpdateError::SystemModified { .. }
                | UpdateError::ObjectMigration { .. }
                | UpdateError::Timeout(_)
                | UpdateError::ResourceExhausted { .. }
        )
    }

    /// Check if this error indicates a bug in the code
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            UpdateError::InvalidState { .. } | UpdateError::Internal(_) | UpdateError::LockPoisoned(_)
        )
    }

    /// Stable code reported to the submitter
    pub fn code(&self) -> DiagnosticCode {
        match self {
            UpdateError::ClassResolution { .. } => DiagnosticCode::CLASS_RESOLUTION,
            UpdateError::LayoutComputation { .. } => DiagnosticCode::LAYOUT_COMPUTATION,
            UpdateError::InvalidJoin { .. } => DiagnosticCode::INVALID_JOIN,
            UpdateError::QuiescenceRetry { .. } => DiagnosticCode::QUIESCENCE_RETRY,
            UpdateError::SystemModified { .. } => DiagnosticCode::SYSTEM_MODIFIED,
            UpdateError::PartialApplication { .. } => DiagnosticCode::PARTIAL_APPLICATION,
            UpdateError::ObjectMigration { .. } => DiagnosticCode::OBJECT_MIGRATION,
            UpdateError::EmptyRequest => DiagnosticCode::EMPTY,
            UpdateError::Discarded => DiagnosticCode::DISCARDED,
            UpdateError::Configuration(_) => DiagnosticCode::CONFIGURATION,
            UpdateError::InvalidArgument(_) => DiagnosticCode::INVALID_ARGUMENT,
            UpdateError::Timeout(_) => DiagnosticCode::TIMEOUT,
            UpdateError::Execution(_) => DiagnosticCode::EXECUTION,
            UpdateError::ResourceExhausted { .. } => DiagnosticCode::RESOURCE_EXHAUSTED,
            UpdateError::Internal(_)
            | UpdateError::LockPoisoned(_)
            | UpdateError::InvalidState { .. } => DiagnosticCode::INTERNAL,
        }
    }

    pub(crate) fn resolution(class: impl fmt::Display, reason: impl Into<String>) -> Self {
        UpdateError::ClassResolution {
            class: class.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn layout(class: impl fmt::Display, reason: impl Into<String>) -> Self {
        UpdateError::LayoutComputation {
            class: class.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn execution(reason: impl Into<String>) -> Self {
        UpdateError::Execution(reason.into())
    }

    pub(crate) fn invalid_state(expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        UpdateError::InvalidState {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

impl<T> From<PoisonError<T>> for UpdateError {
    fn from(err: PoisonError<T>) -> Self {
        UpdateError::LockPoisoned(err.to_string())
    }
}

impl From<crate::config::ConfigError> for UpdateError {
    fn from(err: crate::config::ConfigError) -> Self {
        UpdateError::Configuration(err.to_string())
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, UpdateError>;

/// Stable numeric diagnostic attached to every finished request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub struct DiagnosticCode(pub u16);

impl DiagnosticCode {
    pub const OK: DiagnosticCode = DiagnosticCode(0);
    pub const DISCARDED: DiagnosticCode = DiagnosticCode(1);
    pub const EMPTY: DiagnosticCode = DiagnosticCode(2);
    pub const QUIESCENCE_RETRY: DiagnosticCode = DiagnosticCode(10);
    pub const SYSTEM_MODIFIED: DiagnosticCode = DiagnosticCode(11);
    pub const CLASS_RESOLUTION: DiagnosticCode = DiagnosticCode(20);
    pub const LAYOUT_COMPUTATION: DiagnosticCode = DiagnosticCode(21);
    pub const INVALID_JOIN: DiagnosticCode = DiagnosticCode(22);
    pub const INVALID_ARGUMENT: DiagnosticCode = DiagnosticCode(23);
    pub const PARTIAL_APPLICATION: DiagnosticCode = DiagnosticCode(30);
    pub const OBJECT_MIGRATION: DiagnosticCode = DiagnosticCode(40);
    pub const CONFIGURATION: DiagnosticCode = DiagnosticCode(50);
    pub const TIMEOUT: DiagnosticCode = DiagnosticCode(51);
    pub const RESOURCE_EXHAUSTED: DiagnosticCode = DiagnosticCode(52);
    pub const EXECUTION: DiagnosticCode = DiagnosticCode(60);
    pub const INTERNAL: DiagnosticCode = DiagnosticCode(99);

    pub fn is_success(self) -> bool {
        self == DiagnosticCode::OK
    }
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RL{:04}", self.0)
    }
}

/// Macro for early return with error
#[macro_export]
macro_rules! bail {
    ($err:expr) => {
        return Err($err.into())
    };
}

/// Ensure condition is true, otherwise return error
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err.into());
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifiers() {
        let retry = UpdateError::QuiescenceRetry { unsafe_threads: 2 };
        assert!(retry.is_recoverable());
        assert!(!retry.is_bug());
        assert_eq!(retry.code(), DiagnosticCode::QUIESCENCE_RETRY);

        let internal = UpdateError::Internal("vtable mismatch".into());
        assert!(internal.is_bug());
        assert!(!internal.is_recoverable());
    }

    #[test]
    fn test_poison_conversion() {
        let mutex = std::sync::Mutex::new(0);
        let _ = std::panic::catch_unwind(|| {
            let _guard = mutex.lock().unwrap();
            panic!("poison");
        });
        let err: UpdateError = mutex.lock().unwrap_err().into();
        assert!(matches!(err, UpdateError::LockPoisoned(_)));
    }

    #[test]
    fn test_diagnostic_display() {
        assert_eq!(DiagnosticCode::PARTIAL_APPLICATION.to_string(), "RL0030");
        assert!(DiagnosticCode::OK.is_success());
    }

    #[test]
    fn test_ensure_macro() {
        fn check(n: usize) -> Result<usize> {
            crate::ensure!(n > 0, UpdateError::InvalidArgument("zero".into()));
            Ok(n)
        }
        assert!(check(1).is_ok());
        assert!(matches!(check(0), Err(UpdateError::InvalidArgument(_))));
    }
}
