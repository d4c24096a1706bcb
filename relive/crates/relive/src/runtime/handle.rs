//! Host-side handle of an application thread
//!
//! A [`ThreadHandle`] is how host code runs managed code. The thread counts
//! as safe whenever no call through the handle is in progress, so an idle
//! handle never holds up a pause.

use relive_util::ids::{ClassId, LoaderId, ObjectId, ThreadId};
use relive_util::Symbol;
use std::sync::Arc;

use super::interpreter::{live_version, Interpreter};
use super::reflection::FieldHandle;
use super::thread::{AppThread, ThreadState};
use super::Vm;
use crate::error::{Result, UpdateError};
use crate::heap::HeapObject;
use crate::migration;
use crate::model::{ClassRegistry, FieldInfo, KlassFlags, Value};
use crate::quiescence;

pub struct ThreadHandle {
    vm: Arc<Vm>,
    thread: Arc<AppThread>,
}

/// Keeps the thread running for the duration of one host call
struct Entered<'a> {
    vm: &'a Vm,
    thread: &'a AppThread,
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        self.vm.safepoint.enter_safe(self.thread, ThreadState::InNative);
    }
}

/// Class an instance answers to, looking through shape descriptors
fn class_of(reg: &ClassRegistry, klass: ClassId) -> ClassId {
    let k = reg.klass(klass);
    let base = if k.flags.has(KlassFlags::INPLACE_SHAPE) || k.flags.has(KlassFlags::STALE_SHAPE) {
        k.next_version.unwrap_or(klass)
    } else {
        klass
    };
    live_version(reg, base).unwrap_or(base)
}

impl ThreadHandle {
    pub(crate) fn attach(vm: Arc<Vm>, name: &str) -> Self {
        let thread = vm.threads.register(name);
        log::debug!("attached thread {} ({})", thread.id(), name);
        ThreadHandle { vm, thread }
    }

    pub fn id(&self) -> ThreadId {
        self.thread.id()
    }

    /// Revision this thread's code currently runs at
    pub fn current_revision(&self) -> u64 {
        self.thread.revision()
    }

    pub fn thread(&self) -> &Arc<AppThread> {
        &self.thread
    }

    fn enter(&self) -> Entered<'_> {
        self.vm.safepoint.leave_safe(&self.thread);
        if self.thread.depth() == 0 {
            self.thread.set_revision(self.vm.revision());
        }
        Entered {
            vm: &self.vm,
            thread: &self.thread,
        }
    }

    fn interpreter(&self) -> Interpreter<'_> {
        Interpreter::new(&self.vm, &self.thread)
    }

    /// Wait out a pause in progress
    pub fn poll(&self) {
        let _entered = self.enter();
    }

    /// Call a static method of the live version of `class`
    pub fn invoke_static(&self, class: &str, name: &str, sig: &str, args: &[Value]) -> Result<Option<Value>> {
        let _entered = self.enter();
        let method = {
            let reg = self.vm.registry.read();
            let id = lookup(&reg, class)?;
            let method = reg
                .find_method(id, Symbol::intern(name), Symbol::intern(sig))
                .ok_or_else(|| missing_method(class, name, sig))?;
            if !reg.method(method).is_static() {
                return Err(UpdateError::InvalidArgument(format!(
                    "{}.{}{} is not static",
                    class, name, sig
                )));
            }
            method
        };
        self.interpreter().invoke(method, args.to_vec())
    }

    /// Call an instance method on `receiver` through its vtable
    pub fn invoke_virtual(&self, receiver: ObjectId, name: &str, sig: &str, args: &[Value]) -> Result<Option<Value>> {
        let _entered = self.enter();
        let interpreter = self.interpreter();
        let object = self.vm.heap.get(receiver)?;
        if self.vm.needs_migration(&object) {
            interpreter.migrate_lenient(receiver)?;
        }
        let method = {
            let reg = self.vm.registry.read();
            let class = class_of(&reg, object.klass());
            reg.lookup_virtual(class, Symbol::intern(name), Symbol::intern(sig))
                .ok_or_else(|| missing_method(reg.klass(class).name.as_str(), name, sig))?
        };
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(Value::Ref(receiver));
        full.extend_from_slice(args);
        interpreter.invoke(method, full)
    }

    /// Allocate a zeroed instance of the live version of `class`
    pub fn new_object(&self, class: &str) -> Result<ObjectId> {
        let _entered = self.enter();
        let id = lookup(&self.vm.registry.read(), class)?;
        self.vm.allocate(id)
    }

    /// Fetch an instance, migrated to the current revision if it is stale
    fn current(&self, id: ObjectId) -> Result<Arc<HeapObject>> {
        let object = self.vm.heap.get(id)?;
        if self.vm.needs_migration(&object) {
            self.interpreter().migrate_lenient(id)?;
        }
        Ok(object)
    }

    pub fn get_field(&self, object: ObjectId, name: &str) -> Result<Value> {
        let _entered = self.enter();
        let object = self.current(object)?;
        let field = instance_field(&self.vm, &object, name)?;
        Ok(object.load(self.thread.id(), field.offset, field.ty))
    }

    pub fn set_field(&self, object: ObjectId, name: &str, value: Value) -> Result<()> {
        let _entered = self.enter();
        let object = self.current(object)?;
        let field = instance_field(&self.vm, &object, name)?;
        object.store(self.thread.id(), field.offset, field.ty, value);
        Ok(())
    }

    pub fn get_static(&self, class: &str, name: &str) -> Result<Value> {
        let _entered = self.enter();
        let (statics, field) = self.static_field(class, name)?;
        let area = statics.lock();
        let bytes = area
            .get(field.offset..field.end())
            .ok_or_else(|| UpdateError::execution("static field outside its class area"))?;
        Ok(Value::decode(field.ty, bytes))
    }

    pub fn set_static(&self, class: &str, name: &str, value: Value) -> Result<()> {
        let _entered = self.enter();
        let (statics, field) = self.static_field(class, name)?;
        let mut area = statics.lock();
        let bytes = area
            .get_mut(field.offset..field.end())
            .ok_or_else(|| UpdateError::execution("static field outside its class area"))?;
        value.encode(field.ty, bytes);
        Ok(())
    }

    fn static_field(
        &self,
        class: &str,
        name: &str,
    ) -> Result<(Arc<parking_lot::Mutex<Box<[u8]>>>, FieldInfo)> {
        let reg = self.vm.registry.read();
        let id = lookup(&reg, class)?;
        let k = reg.klass(id);
        let field = k
            .static_fields()
            .find(|f| f.name == name)
            .cloned()
            .ok_or_else(|| missing_field(class, name))?;
        Ok((Arc::clone(&k.statics), field))
    }

    /// Read through a reflective handle; `object` is ignored for statics
    pub fn get(&self, handle: FieldHandle, object: Option<ObjectId>) -> Result<Value> {
        let _entered = self.enter();
        let slot = self.slot(handle)?;
        if slot.is_static {
            let statics = Arc::clone(&self.vm.registry.read().klass(slot.holder).statics);
            let area = statics.lock();
            let bytes = area
                .get(slot.offset..slot.offset + slot.ty.size())
                .ok_or_else(|| UpdateError::execution("static field outside its class area"))?;
            return Ok(Value::decode(slot.ty, bytes));
        }
        let object = self.reflective_target(&slot, object)?;
        Ok(object.load(self.thread.id(), slot.offset, slot.ty))
    }

    /// Write through a reflective handle; `object` is ignored for statics
    pub fn set(&self, handle: FieldHandle, object: Option<ObjectId>, value: Value) -> Result<()> {
        let _entered = self.enter();
        let slot = self.slot(handle)?;
        if slot.is_static {
            let statics = Arc::clone(&self.vm.registry.read().klass(slot.holder).statics);
            let mut area = statics.lock();
            let bytes = area
                .get_mut(slot.offset..slot.offset + slot.ty.size())
                .ok_or_else(|| UpdateError::execution("static field outside its class area"))?;
            value.encode(slot.ty, bytes);
            return Ok(());
        }
        let object = self.reflective_target(&slot, object)?;
        object.store(self.thread.id(), slot.offset, slot.ty, value);
        Ok(())
    }

    fn slot(&self, handle: FieldHandle) -> Result<super::FieldSlot> {
        let slot = self
            .vm
            .reflection
            .get(handle)
            .ok_or_else(|| UpdateError::InvalidArgument(format!("unknown field handle {}", handle)))?;
        if !slot.valid {
            return Err(UpdateError::InvalidArgument(format!(
                "field handle {} for {} no longer names a field",
                handle, slot.name
            )));
        }
        Ok(slot)
    }

    fn reflective_target(&self, slot: &super::FieldSlot, object: Option<ObjectId>) -> Result<Arc<HeapObject>> {
        let id = object.ok_or_else(|| {
            UpdateError::InvalidArgument(format!("instance field {} needs a receiver", slot.name))
        })?;
        let object = self.current(id)?;
        let reg = self.vm.registry.read();
        let class = class_of(&reg, object.klass());
        if !reg.is_subtype(class, slot.holder) {
            return Err(UpdateError::InvalidArgument(format!(
                "{} is not an instance of {}",
                id,
                reg.klass(slot.holder).name
            )));
        }
        Ok(object)
    }

    /// Whether `object` is an instance of the live version of `class`
    pub fn instance_of(&self, object: ObjectId, class: &str) -> Result<bool> {
        let object = self.vm.heap.get(object)?;
        let reg = self.vm.registry.read();
        let target = lookup(&reg, class)?;
        Ok(reg.is_subtype(class_of(&reg, object.klass()), target))
    }

    /// Class named in the object's header
    pub fn header_class(&self, object: ObjectId) -> Result<ClassId> {
        Ok(self.vm.heap.get(object)?.klass())
    }

    /// Migrate `object` to the current revision
    ///
    /// Unlike an access from running code, a failing transformer is reported
    /// to the caller. The object is left in its stale shape and the next
    /// attempt runs the transformer again.
    pub fn migrate_object(&self, object: ObjectId) -> Result<()> {
        let _entered = self.enter();
        let object = self.vm.heap.get(object)?;
        migration::ensure_current(&self.vm, self.thread.id(), self.thread.revision(), &object)
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.vm.threads.deregister(self.thread.id());
        quiescence::thread_detached(&self.vm);
        log::debug!("detached thread {}", self.thread.id());
    }
}

fn lookup(reg: &ClassRegistry, class: &str) -> Result<ClassId> {
    reg.lookup(LoaderId::BOOT, class)
        .ok_or_else(|| UpdateError::InvalidArgument(format!("class {} not found", class)))
}

fn instance_field(vm: &Vm, object: &HeapObject, name: &str) -> Result<FieldInfo> {
    let reg = vm.registry.read();
    let class = object.klass();
    reg.instance_field_table(class)
        .into_iter()
        .rev()
        .find(|f| f.name == name)
        .ok_or_else(|| missing_field(reg.klass(class).name.as_str(), name))
}

fn missing_field(class: &str, name: &str) -> UpdateError {
    UpdateError::InvalidArgument(format!("{} has no field {}", class, name))
}

fn missing_method(class: &str, name: &str, sig: &str) -> UpdateError {
    UpdateError::InvalidArgument(format!("{}.{}{} not found", class, name, sig))
}
