//! Orchestrator Module - the update state machine
//!
//! ```text
//!  request:  INIT ──prepare──▶ PREPARED ──pause──▶ APPLIED ──▶ FINISHED
//!              │                   │   ▲              │
//!              │                   ▼   │ barrier       └──▶ FAILED
//!              │              INTERRUPTED
//!              ├──▶ EMPTY       (no class named)
//!              └──▶ DISCARDED   (no class changed)
//!
//!  class:    UNPREPARED ──▶ PREPARED ──▶ RELINKED | SWAPPED | REDEFINED
//!                                        | DELETED | ADDED | UNCHANGED | FAILED
//! ```
//!
//! Prepare runs outside any pause: it fetches new definitions, builds the
//! new class versions without making them live, classifies every pair and
//! computes layout plans. Apply runs inside the single pause in which the
//! revision advances. A single coordinator thread processes requests one at
//! a time from a queue.

mod apply;
mod coordinator;
mod prepare;
mod request;
mod unit;

pub use coordinator::{Coordinator, RequestHandle};
pub use request::{
    ChangeKind, ClassChange, LoaderGroup, MapProvider, StreamProvider, UpdateRequest,
    UpdateRequestBuilder,
};
pub use unit::{ClassUnit, PreparedRequest};

use serde::Serialize;
use std::fmt;

use crate::error::{DiagnosticCode, UpdateError};

/// Per-class state within a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ClassState {
    Unprepared,
    Prepared,
    Relinked,
    Swapped,
    Redefined,
    Deleted,
    Added,
    Unchanged,
    Failed,
}

impl ClassState {
    pub fn as_str(self) -> &'static str {
        match self {
            ClassState::Unprepared => "UNPREPARED",
            ClassState::Prepared => "PREPARED",
            ClassState::Relinked => "RELINKED",
            ClassState::Swapped => "SWAPPED",
            ClassState::Redefined => "REDEFINED",
            ClassState::Deleted => "DELETED",
            ClassState::Added => "ADDED",
            ClassState::Unchanged => "UNCHANGED",
            ClassState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ClassState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RequestState {
    Init,
    Prepared,
    /// A pause found unsafe threads; barriers are installed
    Interrupted,
    /// The registry changed after prepare; preparing again
    SystemModified,
    Applied,
    Finished,
    Discarded,
    Empty,
    Failed,
}

impl RequestState {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestState::Init => "INIT",
            RequestState::Prepared => "PREPARED",
            RequestState::Interrupted => "INTERRUPTED",
            RequestState::SystemModified => "SYSTEM_MODIFIED",
            RequestState::Applied => "APPLIED",
            RequestState::Finished => "FINISHED",
            RequestState::Discarded => "DISCARDED",
            RequestState::Empty => "EMPTY",
            RequestState::Failed => "FAILED",
        }
    }

    /// Whether the request is over
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Finished
                | RequestState::Discarded
                | RequestState::Empty
                | RequestState::Failed
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one class
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassOutcome {
    pub name: String,
    pub updating_type: String,
    pub state: ClassState,
    pub error: Option<String>,
}

/// Final report of a request
#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub request: u64,
    pub state: RequestState,
    pub code: DiagnosticCode,
    pub classes: Vec<ClassOutcome>,
    pub from_rn: u64,
    pub to_rn: u64,
    /// Pause attempts, including interrupted ones
    pub attempts: u32,
    pub duration_ms: f64,
    pub error: Option<String>,
}

impl UpdateReport {
    pub(crate) fn failed(request: u64, state: RequestState, err: &UpdateError, rn: u64) -> Self {
        UpdateReport {
            request,
            state,
            code: err.code(),
            classes: Vec::new(),
            from_rn: rn,
            to_rn: rn,
            attempts: 0,
            duration_ms: 0.0,
            error: Some(err.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == RequestState::Finished
    }

    pub fn class(&self, name: &str) -> Option<&ClassOutcome> {
        self.classes.iter().find(|c| c.name == name)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
