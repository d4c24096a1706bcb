//! # Relive - Live Class Redefinition for a Managed VM
//!
//! Relive replaces class definitions in a running VM without restarting
//! it. Code, field layouts and class hierarchies may all change; running
//! threads keep going and existing instances are converted to the new
//! layouts.
//!
//! ## Overview
//!
//! - **Classification**: every (old, new) class pair is diffed into an
//!   updating type, from a plain relink up to a full redefinition
//! - **Revisions**: the system switches from one revision to the next in a
//!   single pause; each class version is alive over a revision interval
//! - **Quiescence**: a pause is only used when no thread runs a method whose
//!   old code cannot continue; otherwise return barriers are installed and
//!   the update waits for them
//! - **Lazy migration**: stale instances are converted on first access,
//!   growing into phantom storage when the new layout does not fit
//! - **Eager migration**: optionally a parallel heap sweep converts every
//!   stale instance right after the switch
//!
//! ## Quick Start
//!
//! ```rust
//! use relive::model::Assembler;
//! use relive::{ClassDef, Runtime, UpdateConfig, UpdateRequest, Value};
//!
//! fn main() -> Result<(), relive::UpdateError> {
//!     let runtime = Runtime::new(UpdateConfig::default())?;
//!     let vm = runtime.vm();
//!
//!     let mut v1 = ClassDef::new("Greeter");
//!     let code = Assembler::new(&mut v1).iconst(1).ireturn().finish();
//!     vm.define_class(v1.static_method("answer", "()I", code))?;
//!
//!     let mut v2 = ClassDef::new("Greeter");
//!     let code = Assembler::new(&mut v2).iconst(2).ireturn().finish();
//!     let request = UpdateRequest::builder()
//!         .redefine(v2.static_method("answer", "()I", code))
//!         .build();
//!     let report = runtime.submit(request)?;
//!     assert!(report.is_success());
//!
//!     let thread = vm.attach_thread("main");
//!     let answer = thread.invoke_static("Greeter", "answer", "()I", &[])?;
//!     assert_eq!(answer, Some(Value::Int(2)));
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Application Threads                     │
//! │   ThreadHandle ──▶ Interpreter ──▶ safepoint polls        │
//! │        │                 │                                │
//! │        │           stale instance? ──▶ migration          │
//! └────────┼─────────────────┼────────────────────────────────┘
//!          │ submit          │ barrier fired
//! ┌────────▼─────────────────▼────────────────────────────────┐
//! │                    Coordinator Thread                      │
//! │  ┌──────────────────────────────────────────────┐          │
//! │  │ Prepare (no pause)                            │          │
//! │  │  - fetch and build new versions               │          │
//! │  │  - differ: classify each pair                 │          │
//! │  │  - layout planner: field correspondence       │          │
//! │  └──────────────────────────────────────────────┘          │
//! │                         │                                  │
//! │                         ▼                                  │
//! │  ┌──────────────────────────────────────────────┐          │
//! │  │ Pause                                         │          │
//! │  │  - quiescence check, barriers if unsafe       │          │
//! │  │  - apply: swap, redefine, delete, add         │          │
//! │  │  - revision advances, frames repaired         │          │
//! │  └──────────────────────────────────────────────┘          │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: update configuration and validation
//! - [`differ`]: classification of class pairs
//! - [`error`]: error types and diagnostic codes
//! - [`heap`]: instances, their headers and phantom storage
//! - [`layout`]: field correspondence plans between versions
//! - [`logging`]: structured update events
//! - [`migration`]: lazy and eager instance migration, transformers
//! - [`model`]: class definitions, class versions and the registry
//! - [`orchestrator`]: requests, the prepare and apply phases, the coordinator
//! - [`quiescence`]: thread checks, barriers and frame repair
//! - [`runtime`]: the VM, its threads, safepoint and code cache
//! - [`stats`]: counters and pause histograms
//! - [`version_graph`]: prepare order and type narrowing

// Update engine
pub mod differ;
pub mod layout;
pub mod orchestrator;
pub mod quiescence;
pub mod version_graph;

// Class and instance model
pub mod heap;
pub mod migration;
pub mod model;

// Runtime and monitoring
pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod stats;

pub use config::{MigrationMode, UpdateConfig};
pub use error::{DiagnosticCode, Result, UpdateError};
pub use migration::{FnTransformer, ObjectView, Transformer};
pub use model::{ClassDef, UpdatingType, Value};
pub use orchestrator::{
    ClassOutcome, ClassState, MapProvider, RequestHandle, RequestState, StreamProvider,
    UpdateReport, UpdateRequest,
};
pub use runtime::{Runtime, ThreadHandle, Vm};

/// Relive version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Start a runtime with the default configuration
///
/// # Examples
///
/// ```rust
/// let runtime = relive::init()?;
/// assert_eq!(runtime.vm().revision(), 0);
/// # Ok::<(), relive::UpdateError>(())
/// ```
pub fn init() -> Result<Runtime> {
    Runtime::new(UpdateConfig::default())
}

/// Start a runtime with `config`
pub fn init_with_config(config: UpdateConfig) -> Result<Runtime> {
    Runtime::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_default() {
        let runtime = init();
        assert!(runtime.is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = UpdateConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_version_not_empty() {
        assert!(!VERSION.is_empty());
    }
}
