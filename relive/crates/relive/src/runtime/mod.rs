//! Runtime Module - the managed VM the update engine works on
//!
//! This module holds everything an update touches:
//! - The class registry and the heap
//! - Application threads and their frame stacks
//! - The safepoint used for the apply pause
//! - The code cache, reflective field handles and native bindings
//!
//! [`Vm`] owns these pieces. [`Runtime`] pairs a `Vm` with the coordinator
//! thread that processes update requests.

pub mod code_cache;
mod handle;
pub(crate) mod interpreter;
pub mod natives;
pub mod reflection;
pub mod safepoint;
pub mod thread;

pub use code_cache::{CodeCache, CodeCacheStats, CodeEvent};
pub use handle::ThreadHandle;
pub use natives::{NativeContext, NativeRegistry};
pub use reflection::{FieldHandle, FieldRemapHint, FieldSlot, RemapOutcome, ReflectionTable};
pub use safepoint::{PauseGuard, Safepoint};
pub use thread::{AppThread, Frame, FrameKind, ThreadRegistry, ThreadState};

use parking_lot::RwLock;
use relive_util::ids::{ClassId, FrameId, LoaderId, MethodId, ObjectId};
use relive_util::{IdGenerator, Symbol};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::UpdateConfig;
use crate::error::{Result, UpdateError};
use crate::heap::{Heap, HeapObject};
use crate::model::bytecode::Instructions;
use crate::model::{ClassDef, ClassRegistry, Constant, KlassFlags, Opcode, Value};
use crate::orchestrator::{Coordinator, RequestHandle, UpdateReport, UpdateRequest};
use crate::quiescence::BarrierState;
use crate::stats::{UpdateStats, UpdateSummary};

/// The managed VM
pub struct Vm {
    pub config: UpdateConfig,
    pub stats: Arc<UpdateStats>,
    pub(crate) registry: RwLock<ClassRegistry>,
    pub heap: Heap,
    pub threads: ThreadRegistry,
    pub safepoint: Safepoint,
    pub code_cache: CodeCache,
    pub reflection: ReflectionTable,
    pub natives: NativeRegistry,
    pub(crate) quiescence: BarrierState,
    /// System revision number
    revision: AtomicU64,
    frame_ids: IdGenerator,
}

impl Vm {
    /// Create a VM with an empty class registry at revision 0
    pub fn new(config: UpdateConfig) -> Result<Arc<Vm>> {
        config.validate()?;
        let registry = ClassRegistry::new(config.object_alignment);
        Ok(Arc::new(Vm {
            stats: Arc::new(UpdateStats::new()),
            registry: RwLock::new(registry),
            heap: Heap::new(),
            threads: ThreadRegistry::new(),
            safepoint: Safepoint::new(),
            code_cache: CodeCache::new(),
            reflection: ReflectionTable::new(),
            natives: NativeRegistry::new(),
            quiescence: BarrierState::new(),
            revision: AtomicU64::new(0),
            frame_ids: IdGenerator::new(),
            config,
        }))
    }

    /// Load a class into the boot loader
    pub fn define_class(&self, def: ClassDef) -> Result<ClassId> {
        self.define_class_in(def, LoaderId::BOOT)
    }

    /// Load a class into `loader`
    ///
    /// Bumps the registry modification count, so an update prepared before
    /// this call is prepared again.
    pub fn define_class_in(&self, def: ClassDef, loader: LoaderId) -> Result<ClassId> {
        let name = def.name.clone();
        let id = self.registry.write().define(def, loader, self.revision())?;
        log::debug!("defined {} as {} at revision {}", name, id, self.revision());
        Ok(id)
    }

    /// Attach the calling context as an application thread
    pub fn attach_thread(self: &Arc<Self>, name: &str) -> ThreadHandle {
        ThreadHandle::attach(Arc::clone(self), name)
    }

    /// Bind a host function to a native method
    pub fn register_native<F>(&self, class: &str, name: &str, sig: &str, func: F)
    where
        F: Fn(&NativeContext<'_>, &[Value]) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        self.natives.register(class, name, sig, func);
    }

    #[inline]
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub(crate) fn set_revision(&self, rn: u64) {
        self.revision.store(rn, Ordering::Release);
    }

    /// Read access to the class registry
    pub fn with_registry<R>(&self, f: impl FnOnce(&ClassRegistry) -> R) -> R {
        f(&self.registry.read())
    }

    /// Live version of `name` in the boot loader
    pub fn lookup_class(&self, name: &str) -> Option<ClassId> {
        self.registry.read().lookup(LoaderId::BOOT, name)
    }

    /// Validity interval of the live version of `name`
    pub fn revision_interval(&self, name: &str) -> Option<(u64, u64)> {
        let reg = self.registry.read();
        reg.lookup(LoaderId::BOOT, name)
            .map(|id| reg.klass(id).revision_interval())
    }

    /// Every installed version of `name`, oldest first
    ///
    /// Scratch versions retired by a body change are included. Shape
    /// descriptors are not versions and are left out.
    pub fn class_versions(&self, name: &str) -> Vec<(ClassId, u64, u64)> {
        let reg = self.registry.read();
        let Some(live) = reg.lookup(LoaderId::BOOT, name) else {
            return Vec::new();
        };
        let mut versions = Vec::new();
        let mut cur = Some(live);
        while let Some(id) = cur {
            let k = reg.klass(id);
            versions.push((id, k.born_rn, k.dead_rn));
            cur = k.previous_version;
        }
        versions.reverse();
        versions
    }

    /// Allocate a zeroed instance of the live version of `class`
    pub fn allocate(&self, class: ClassId) -> Result<ObjectId> {
        let size = {
            let reg = self.registry.read();
            let k = reg.try_klass(class)?;
            if k.is_interface() {
                return Err(UpdateError::execution(format!(
                    "cannot instantiate interface {}",
                    k.name
                )));
            }
            if k.is_stale() {
                return Err(UpdateError::execution(format!(
                    "cannot instantiate stale version {} of {}",
                    class, k.name
                )));
            }
            k.instance_size
        };
        Ok(self.heap.allocate(class, size).id())
    }

    /// Whether `object` has to be migrated before its fields are touched
    pub fn needs_migration(&self, object: &HeapObject) -> bool {
        let reg = self.registry.read();
        let k = reg.klass(object.klass());
        k.flags.has(KlassFlags::STALE_SHAPE) || (k.is_stale() && k.next_version.is_some())
    }

    pub(crate) fn next_frame_id(&self) -> FrameId {
        self.frame_ids.next()
    }

    /// Issue a reflective handle for a field of the live version of `class`
    pub fn field_handle(&self, class: &str, name: &str) -> Result<FieldHandle> {
        let reg = self.registry.read();
        let id = reg
            .lookup(LoaderId::BOOT, class)
            .ok_or_else(|| UpdateError::InvalidArgument(format!("class {} not found", class)))?;
        let field = reg
            .klass(id)
            .fields
            .iter()
            .find(|f| f.name == name)
            .cloned()
            .ok_or_else(|| {
                UpdateError::InvalidArgument(format!("{} has no field {}", class, name))
            })?;
        Ok(self.reflection.issue(FieldSlot {
            holder: id,
            name: field.name,
            sig: field.sig,
            offset: field.offset,
            ty: field.ty,
            is_static: field.is_static(),
            valid: true,
        }))
    }

    /// Compile a method of the live version of `class`
    ///
    /// The compiled body inlines every static callee it names, so it is
    /// thrown away when any of them goes stale.
    pub fn compile(&self, class: &str, name: &str, sig: &str) -> Result<MethodId> {
        let reg = self.registry.read();
        let id = reg
            .lookup(LoaderId::BOOT, class)
            .ok_or_else(|| UpdateError::InvalidArgument(format!("class {} not found", class)))?;
        let method = reg
            .own_method(id, Symbol::intern(name), Symbol::intern(sig))
            .ok_or_else(|| {
                UpdateError::InvalidArgument(format!("{}.{}{} not found", class, name, sig))
            })?;
        let pool = &reg.klass(id).constants;
        let mut inlined = Vec::new();
        for insn in Instructions::new(&reg.method(method).code).flatten() {
            if insn.opcode != Opcode::Invokestatic {
                continue;
            }
            let Some(Constant::MethodRef { class, name, sig }) = pool.get(insn.operand) else {
                continue;
            };
            let callee = reg.lookup(reg.klass(id).loader, class).and_then(|c| {
                reg.find_method(c, Symbol::intern(name), Symbol::intern(sig))
            });
            if let Some(callee) = callee {
                if !inlined.contains(&callee) {
                    inlined.push(callee);
                }
            }
        }
        drop(reg);
        self.code_cache.compile(method, inlined);
        Ok(method)
    }
}

/// Runtime state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Running,
    Stopped,
}

/// Runtime - a VM plus its update coordinator
pub struct Runtime {
    vm: Arc<Vm>,
    coordinator: Mutex<Coordinator>,
    state: Mutex<RuntimeState>,
}

impl Runtime {
    /// Create a VM and start its coordinator thread
    pub fn new(config: UpdateConfig) -> Result<Self> {
        let vm = Vm::new(config)?;
        let coordinator = Coordinator::start(Arc::clone(&vm))?;
        Ok(Runtime {
            vm,
            coordinator: Mutex::new(coordinator),
            state: Mutex::new(RuntimeState::Running),
        })
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    /// Queue an update and wait for its report
    pub fn submit(&self, request: UpdateRequest) -> Result<UpdateReport> {
        self.submit_async(request)?.wait()
    }

    /// Queue an update and wait at most `timeout` for its report
    pub fn submit_timeout(&self, request: UpdateRequest, timeout: Duration) -> Result<UpdateReport> {
        self.submit_async(request)?.wait_timeout(timeout)
    }

    /// Queue an update without waiting
    pub fn submit_async(&self, request: UpdateRequest) -> Result<RequestHandle> {
        if self.state()? != RuntimeState::Running {
            return Err(UpdateError::invalid_state("running", "stopped"));
        }
        self.coordinator
            .lock()
            .map_err(|e| UpdateError::LockPoisoned(format!("coordinator mutex poisoned: {}", e)))?
            .submit(request)
    }

    pub fn stats(&self) -> UpdateSummary {
        self.vm.stats.summary()
    }

    pub fn state(&self) -> Result<RuntimeState> {
        Ok(*self
            .state
            .lock()
            .map_err(|e| UpdateError::LockPoisoned(format!("state mutex poisoned: {}", e)))?)
    }

    /// Stop the coordinator after the queued requests are processed
    pub fn shutdown(&self) -> Result<()> {
        *self
            .state
            .lock()
            .map_err(|e| UpdateError::LockPoisoned(format!("state mutex poisoned: {}", e)))? =
            RuntimeState::Stopped;
        self.coordinator
            .lock()
            .map_err(|e| UpdateError::LockPoisoned(format!("coordinator mutex poisoned: {}", e)))?
            .shutdown();
        Ok(())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("runtime shutdown failed: {}", e);
        }
    }
}
