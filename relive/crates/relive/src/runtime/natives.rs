//! Host functions bound to native methods.
//!
//! A native method is declared in a class definition with no body and bound
//! here by (class, name, signature). The binding survives redefinition of
//! the class because it is keyed by name, not by method id.

use parking_lot::RwLock;
use relive_util::fx::FxHashMap;
use relive_util::ids::ThreadId;
use relive_util::Symbol;
use std::sync::Arc;

use super::Vm;
use crate::model::Value;

/// What a host function sees of its caller
pub struct NativeContext<'a> {
    pub(crate) vm: &'a Vm,
    pub(crate) thread: ThreadId,
}

impl<'a> NativeContext<'a> {
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Current system revision
    pub fn revision(&self) -> u64 {
        self.vm.revision()
    }

    pub fn vm(&self) -> &'a Vm {
        self.vm
    }
}

/// Host function implementing a native method
pub type NativeFn = dyn Fn(&NativeContext<'_>, &[Value]) -> anyhow::Result<Option<Value>> + Send + Sync;

#[derive(Default)]
pub struct NativeRegistry {
    bindings: RwLock<FxHashMap<(Symbol, Symbol, Symbol), Arc<NativeFn>>>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `func`, replacing an earlier binding of the same method
    pub fn register<F>(&self, class: &str, name: &str, sig: &str, func: F)
    where
        F: Fn(&NativeContext<'_>, &[Value]) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        let key = (Symbol::intern(class), Symbol::intern(name), Symbol::intern(sig));
        self.bindings.write().insert(key, Arc::new(func));
    }

    pub fn get(&self, class: Symbol, name: Symbol, sig: Symbol) -> Option<Arc<NativeFn>> {
        self.bindings.read().get(&(class, name, sig)).cloned()
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }
}
