//! Host metadata model
//!
//! Class definitions as handed in by stream providers ([`def`]), the
//! instruction set ([`bytecode`]), and the linked, arena-allocated metadata
//! the engine updates ([`klass`], [`method`], [`registry`]).

pub mod bytecode;
pub mod constant_pool;
pub mod def;
pub mod klass;
pub mod method;
pub mod registry;
pub mod types;
pub mod updating;

pub use bytecode::{Assembler, Instruction, Instructions, Opcode};
pub use constant_pool::{ConstantPool, Resolved};
pub use def::{ClassDef, Constant, FieldDef, MethodDef};
pub use klass::{FieldInfo, Klass, KlassFlags, TransformLevel, UpdateState, ALIVE};
pub use method::{Method, MethodFlags};
pub use registry::ClassRegistry;
pub use types::{AccessFlags, BasicType, Value};
pub use updating::{MethodUpdate, UpdatingType};
