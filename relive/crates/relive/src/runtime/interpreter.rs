//! Bytecode interpreter
//!
//! Runs method bodies on an application thread. The interpreter cooperates
//! with updates in three places:
//!
//! - it polls the safepoint before calls, before returns and on backward
//!   branches, and afterwards reloads its code and constant pool if the
//!   frame was repaired onto a new method while it was parked
//! - after a callee returns it checks its own frame for a return barrier
//! - before touching an instance of a redefined class it migrates the
//!   instance to the live version
//!
//! Registry read guards are only ever held for short snapshots, never
//! across a poll, a call, or a migration.

use relive_util::ids::{ClassId, MethodId, ObjectId};
use std::sync::Arc;

use super::natives::NativeContext;
use super::thread::{AppThread, Frame, FrameKind, ThreadState};
use super::Vm;
use crate::error::{Result, UpdateError};
use crate::heap::HeapObject;
use crate::migration;
use crate::model::bytecode::decode_at;
use crate::model::def::arg_slots;
use crate::model::{
    BasicType, ClassRegistry, Constant, ConstantPool, Instruction, MethodFlags,
    Opcode, Resolved, Value,
};
use crate::quiescence;

/// Code and pool of the method a frame is executing
struct Activation {
    method: MethodId,
    holder: ClassId,
    code: Arc<[u8]>,
    pool: Arc<ConstantPool>,
}

/// Resolved field operand
#[derive(Clone, Copy)]
struct FieldTarget {
    holder: ClassId,
    offset: usize,
    ty: BasicType,
    is_static: bool,
    checks: u8,
}

/// Resolved call target
#[derive(Clone, Copy)]
struct CallTarget {
    method: MethodId,
    vtable_index: Option<usize>,
    by_name: bool,
}

/// Everything [`Interpreter::invoke`] needs about a callee, read in one
/// registry snapshot
struct Callee {
    method: MethodId,
    holder_name: relive_util::Symbol,
    name: relive_util::Symbol,
    sig: relive_util::Symbol,
    is_static: bool,
    is_native: bool,
    stale_check: bool,
    max_locals: usize,
    activation: Activation,
}

pub(crate) struct Interpreter<'a> {
    vm: &'a Vm,
    thread: &'a AppThread,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(vm: &'a Vm, thread: &'a AppThread) -> Self {
        Interpreter { vm, thread }
    }

    /// Call `method` with `args`, receiver first for instance methods
    pub(crate) fn invoke(&self, method: MethodId, mut args: Vec<Value>) -> Result<Option<Value>> {
        let callee = self.callee(method)?;
        let expected = arg_slots(callee.sig.as_str()) as usize + usize::from(!callee.is_static);
        if args.len() != expected {
            return Err(UpdateError::execution(format!(
                "{}.{}{} takes {} arguments, got {}",
                callee.holder_name,
                callee.name,
                callee.sig,
                expected,
                args.len()
            )));
        }

        if callee.stale_check {
            if let Some(receiver) = args.first().and_then(Value::as_object) {
                self.migrate_lenient(receiver)?;
            }
        }

        let kind = if callee.is_native {
            FrameKind::Native
        } else if self.vm.code_cache.is_compiled(callee.method) {
            FrameKind::Compiled
        } else {
            FrameKind::Interpreted
        };
        let depth = {
            let mut frames = self.thread.frames();
            frames.push(Frame {
                id: self.vm.next_frame_id(),
                method: callee.method,
                bci: 0,
                kind,
                barrier: false,
            });
            frames.len() - 1
        };

        let result = if callee.is_native {
            self.call_native(&callee, &args)
        } else {
            args.resize(callee.max_locals.max(args.len()), Value::Int(0));
            self.run(depth, callee.activation, args)
        };

        let emptied = {
            let mut frames = self.thread.frames();
            frames.truncate(depth);
            frames.is_empty()
        };
        if emptied {
            quiescence::stack_emptied(self.vm);
        }
        result
    }

    fn callee(&self, method: MethodId) -> Result<Callee> {
        let reg = self.vm.registry.read();
        let mut m = reg.try_method(method)?;
        let holder = reg.klass(m.holder);
        if holder.is_stale() {
            // a superseded version: call the live method of the same name
            let live = live_version(&reg, holder.id).ok_or_else(|| {
                UpdateError::execution(format!("{}.{} belongs to a deleted class", holder.name, m))
            })?;
            let id = reg.find_method(live, m.name, m.sig).ok_or_else(|| {
                UpdateError::execution(format!("{}.{} no longer exists", holder.name, m))
            })?;
            m = reg.method(id);
        }
        let holder = reg.klass(m.holder);
        Ok(Callee {
            method: m.id,
            holder_name: holder.name,
            name: m.name,
            sig: m.sig,
            is_static: m.is_static(),
            is_native: m.is_native(),
            stale_check: m.flags.has(MethodFlags::NEEDS_STALE_CHECK) && !m.is_static(),
            max_locals: m.max_locals as usize,
            activation: Activation {
                method: m.id,
                holder: holder.id,
                code: Arc::clone(&m.code),
                pool: Arc::clone(&holder.constants),
            },
        })
    }

    fn activation(&self, method: MethodId) -> Activation {
        let reg = self.vm.registry.read();
        let m = reg.method(method);
        Activation {
            method,
            holder: m.holder,
            code: Arc::clone(&m.code),
            pool: Arc::clone(&reg.klass(m.holder).constants),
        }
    }

    fn call_native(&self, callee: &Callee, args: &[Value]) -> Result<Option<Value>> {
        let func = self
            .vm
            .natives
            .get(callee.holder_name, callee.name, callee.sig)
            .ok_or_else(|| {
                UpdateError::execution(format!(
                    "no host function bound to {}.{}{}",
                    callee.holder_name, callee.name, callee.sig
                ))
            })?;
        let ctx = NativeContext {
            vm: self.vm,
            thread: self.thread.id(),
        };
        self.vm.safepoint.enter_safe(self.thread, ThreadState::InNative);
        let result = func(&ctx, args);
        self.vm.safepoint.leave_safe(self.thread);
        result.map_err(|e| UpdateError::execution(format!("{}.{}: {:#}", callee.holder_name, callee.name, e)))
    }

    fn run(&self, depth: usize, mut act: Activation, mut locals: Vec<Value>) -> Result<Option<Value>> {
        let mut stack: Vec<Value> = Vec::with_capacity(8);
        let mut pc = 0usize;
        loop {
            let mut insn = decode(&act, pc)?;
            if polls(&insn) {
                self.checkpoint(depth, &mut act, pc);
                insn = decode(&act, pc)?;
            }
            let next = pc + insn.opcode.length();
            match insn.opcode {
                Opcode::Nop => {},
                Opcode::Bipush => stack.push(Value::Int(insn.operand as u8 as i8 as i32)),
                Opcode::Ldc => stack.push(load_constant(&act, insn.operand)?),
                Opcode::Load => stack.push(local(&locals, insn.operand as usize)?),
                Opcode::Aload0 => stack.push(local(&locals, 0)?),
                Opcode::Store => {
                    let value = pop(&mut stack)?;
                    let slot = insn.operand as usize;
                    if slot >= locals.len() {
                        locals.resize(slot + 1, Value::Int(0));
                    }
                    locals[slot] = value;
                },
                Opcode::Pop => {
                    pop(&mut stack)?;
                },
                Opcode::Dup => {
                    let top = *stack
                        .last()
                        .ok_or_else(|| UpdateError::execution("dup on empty stack"))?;
                    stack.push(top);
                },
                Opcode::Iadd | Opcode::Isub | Opcode::Imul => {
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    stack.push(arith(insn.opcode, a, b)?);
                },
                Opcode::Ifeq => {
                    let v = pop(&mut stack)?;
                    let zero = v
                        .as_long()
                        .ok_or_else(|| UpdateError::execution(format!("ifeq on {}", v)))?
                        == 0;
                    if zero {
                        pc = branch(pc, insn.branch_offset())?;
                        continue;
                    }
                },
                Opcode::Goto => {
                    pc = branch(pc, insn.branch_offset())?;
                    continue;
                },
                Opcode::Ireturn | Opcode::Areturn => return Ok(Some(pop(&mut stack)?)),
                Opcode::Return => return Ok(None),
                Opcode::Getstatic => {
                    let field = self.resolve_field(&act, insn.operand, true)?;
                    stack.push(self.read_static(field)?);
                },
                Opcode::Putstatic => {
                    let field = self.resolve_field(&act, insn.operand, true)?;
                    let value = pop(&mut stack)?;
                    self.write_static(field, value)?;
                },
                Opcode::Getfield => {
                    let field = self.resolve_field(&act, insn.operand, false)?;
                    let object = self.field_object(pop(&mut stack)?)?;
                    stack.push(object.load(self.thread.id(), field.offset, field.ty));
                },
                Opcode::Putfield => {
                    let field = self.resolve_field(&act, insn.operand, false)?;
                    let value = pop(&mut stack)?;
                    let object = self.field_object(pop(&mut stack)?)?;
                    object.store(self.thread.id(), field.offset, field.ty, value);
                },
                Opcode::New => {
                    let class = self.resolve_class(&act, insn.operand)?;
                    let object = self.vm.allocate(class)?;
                    stack.push(Value::Ref(object));
                },
                Opcode::Invokestatic | Opcode::Invokevirtual => {
                    let target = self.resolve_method(&act, insn.operand)?;
                    let n = self.arg_count(target.method)?;
                    if stack.len() < n {
                        return Err(UpdateError::execution("operand stack underflow at call"));
                    }
                    let args = stack.split_off(stack.len() - n);
                    let method = if insn.opcode == Opcode::Invokevirtual {
                        self.dispatch(target, &args)?
                    } else {
                        target.method
                    };
                    let ret = self.invoke(method, args)?;
                    self.after_call(depth, &mut act);
                    if let Some(v) = ret {
                        stack.push(v);
                    }
                },
            }
            pc = next;
        }
    }

    /// Safepoint poll with the frame's bci published for stack walkers
    fn checkpoint(&self, depth: usize, act: &mut Activation, pc: usize) {
        if let Some(frame) = self.thread.frames().get_mut(depth) {
            frame.bci = pc;
        }
        self.vm.safepoint.poll(self.thread);
        self.refresh(depth, act);
    }

    /// Reload code and pool if the frame was repaired onto another method
    fn refresh(&self, depth: usize, act: &mut Activation) {
        let current = self.thread.frames().get(depth).map(|f| f.method);
        if let Some(method) = current {
            if method != act.method {
                *act = self.activation(method);
            }
        }
    }

    fn after_call(&self, depth: usize, act: &mut Activation) {
        let fired = {
            let mut frames = self.thread.frames();
            match frames.get_mut(depth) {
                Some(frame) if frame.barrier => {
                    frame.barrier = false;
                    true
                },
                _ => false,
            }
        };
        if fired {
            quiescence::on_barrier(self.vm, self.thread, depth);
        }
        self.refresh(depth, act);
    }

    fn arg_count(&self, method: MethodId) -> Result<usize> {
        let reg = self.vm.registry.read();
        let m = reg.try_method(method)?;
        Ok(arg_slots(m.sig.as_str()) as usize + usize::from(!m.is_static()))
    }

    /// Select the implementation for a virtual call on `args[0]`
    fn dispatch(&self, target: CallTarget, args: &[Value]) -> Result<MethodId> {
        let receiver = args
            .first()
            .and_then(Value::as_object)
            .filter(|r| !r.is_none())
            .ok_or_else(|| UpdateError::execution("virtual call on null receiver"))?;
        let object = self.vm.heap.get(receiver)?;
        if self.vm.needs_migration(&object) {
            self.migrate_lenient(receiver)?;
        }

        let reg = self.vm.registry.read();
        let declared = reg.method(target.method);
        let class = object.klass();
        let recv = reg.klass(class);
        if !target.by_name {
            if let Some(&m) = target.vtable_index.and_then(|i| recv.vtable.get(i)) {
                if reg.method(m).same_signature(declared) {
                    return Ok(m);
                }
            }
        }
        reg.lookup_virtual(class, declared.name, declared.sig)
            .ok_or_else(|| {
                UpdateError::execution(format!("{} has no method {}", recv.name, declared))
            })
    }

    /// Fetch the object operand of a field instruction, migrated if needed
    ///
    /// Any stale instance is migrated, whichever class declares the field.
    fn field_object(&self, value: Value) -> Result<Arc<HeapObject>> {
        let id = value
            .as_object()
            .filter(|r| !r.is_none())
            .ok_or_else(|| UpdateError::execution("field access on null reference"))?;
        let object = self.vm.heap.get(id)?;
        if self.vm.needs_migration(&object) {
            self.migrate_lenient(id)?;
        }
        Ok(object)
    }

    /// Migrate an instance touched by running code
    ///
    /// A failing transformer leaves the instance in its stale shape, which
    /// already has the new layout, so the access goes ahead.
    pub(crate) fn migrate_lenient(&self, id: ObjectId) -> Result<()> {
        let object = self.vm.heap.get(id)?;
        match migration::ensure_current(self.vm, self.thread.id(), self.thread.revision(), &object) {
            Ok(()) => Ok(()),
            Err(UpdateError::ObjectMigration { object, reason }) => {
                log::debug!("{} left stale: {}", object, reason);
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    fn read_static(&self, field: FieldTarget) -> Result<Value> {
        let statics = Arc::clone(&self.vm.registry.read().klass(field.holder).statics);
        let area = statics.lock();
        let bytes = area
            .get(field.offset..field.offset + field.ty.size())
            .ok_or_else(|| UpdateError::execution("static field outside its class area"))?;
        Ok(Value::decode(field.ty, bytes))
    }

    fn write_static(&self, field: FieldTarget, value: Value) -> Result<()> {
        let statics = Arc::clone(&self.vm.registry.read().klass(field.holder).statics);
        let mut area = statics.lock();
        let bytes = area
            .get_mut(field.offset..field.offset + field.ty.size())
            .ok_or_else(|| UpdateError::execution("static field outside its class area"))?;
        value.encode(field.ty, bytes);
        Ok(())
    }

    fn lookup_class(&self, reg: &ClassRegistry, act: &Activation, name: &str) -> Result<ClassId> {
        let loader = reg.klass(act.holder).loader;
        reg.lookup(loader, name)
            .ok_or_else(|| UpdateError::execution(format!("class {} not found", name)))
    }

    fn resolve_class(&self, act: &Activation, index: u16) -> Result<ClassId> {
        let reg = self.vm.registry.read();
        if let Some(Resolved::Class(id)) = act.pool.resolved(index) {
            if !reg.klass(id).is_stale() {
                return Ok(id);
            }
        }
        let Some(Constant::Class(name)) = act.pool.get(index) else {
            return Err(UpdateError::execution(format!("constant {} is not a class", index)));
        };
        let id = self.lookup_class(&reg, act, name)?;
        if reg.klass(id).is_interface() {
            return Err(UpdateError::execution(format!("cannot instantiate interface {}", name)));
        }
        act.pool.store(index, Resolved::Class(id));
        Ok(id)
    }

    fn resolve_field(&self, act: &Activation, index: u16, want_static: bool) -> Result<FieldTarget> {
        let reg = self.vm.registry.read();
        if let Some(Resolved::Field {
            holder,
            offset,
            ty,
            is_static,
            checks,
        }) = act.pool.resolved(index)
        {
            if !reg.klass(holder).is_stale() && is_static == want_static {
                return Ok(FieldTarget {
                    holder,
                    offset,
                    ty,
                    is_static,
                    checks,
                });
            }
        }
        let Some(Constant::FieldRef { class, name, sig }) = act.pool.get(index) else {
            return Err(UpdateError::execution(format!("constant {} is not a field", index)));
        };
        let class_id = self.lookup_class(&reg, act, class)?;
        let (holder, info) = reg
            .find_field(
                class_id,
                relive_util::Symbol::intern(name),
                relive_util::Symbol::intern(sig),
            )
            .ok_or_else(|| UpdateError::execution(format!("field {}.{} not found", class, name)))?;
        if info.is_static() != want_static {
            return Err(UpdateError::execution(format!(
                "field {}.{} static-ness does not match the instruction",
                class, name
            )));
        }
        let target = FieldTarget {
            holder,
            offset: info.offset,
            ty: info.ty,
            is_static: info.is_static(),
            checks: info.checks,
        };
        act.pool.store(
            index,
            Resolved::Field {
                holder,
                offset: target.offset,
                ty: target.ty,
                is_static: target.is_static,
                checks: target.checks,
            },
        );
        Ok(target)
    }

    fn resolve_method(&self, act: &Activation, index: u16) -> Result<CallTarget> {
        let reg = self.vm.registry.read();
        if let Some(Resolved::Method {
            method,
            vtable_index,
            by_name,
        }) = act.pool.resolved(index)
        {
            if !reg.klass(reg.method(method).holder).is_stale() {
                return Ok(CallTarget {
                    method,
                    vtable_index,
                    by_name,
                });
            }
        }
        let Some(Constant::MethodRef { class, name, sig }) = act.pool.get(index) else {
            return Err(UpdateError::execution(format!("constant {} is not a method", index)));
        };
        let class_id = self.lookup_class(&reg, act, class)?;
        let method = reg
            .find_method(
                class_id,
                relive_util::Symbol::intern(name),
                relive_util::Symbol::intern(sig),
            )
            .ok_or_else(|| {
                UpdateError::execution(format!("method {}.{}{} not found", class, name, sig))
            })?;
        let target = CallTarget {
            method,
            vtable_index: reg.method(method).vtable_index,
            by_name: reg.klass(class_id).is_interface(),
        };
        act.pool.store(
            index,
            Resolved::Method {
                method,
                vtable_index: target.vtable_index,
                by_name: target.by_name,
            },
        );
        Ok(target)
    }
}

/// Follow the version chain of a stale class to its live successor
pub(crate) fn live_version(reg: &ClassRegistry, class: ClassId) -> Option<ClassId> {
    let mut cur = class;
    for _ in 0..=reg.class_count() {
        let k = reg.klass(cur);
        if !k.is_stale() {
            return Some(cur);
        }
        cur = k.next_version?;
    }
    None
}

fn decode(act: &Activation, pc: usize) -> Result<Instruction> {
    decode_at(&act.code, pc)
        .ok_or_else(|| UpdateError::execution(format!("invalid instruction at bci {}", pc)))
}

/// Instructions at which a thread may be stopped for an update
fn polls(insn: &Instruction) -> bool {
    match insn.opcode {
        Opcode::Invokestatic
        | Opcode::Invokevirtual
        | Opcode::Ireturn
        | Opcode::Areturn
        | Opcode::Return => true,
        Opcode::Goto | Opcode::Ifeq => insn.branch_offset() < 0,
        _ => false,
    }
}

fn branch(pc: usize, offset: i16) -> Result<usize> {
    let target = pc as i64 + i64::from(offset);
    usize::try_from(target)
        .map_err(|_| UpdateError::execution(format!("branch to {} from {}", target, pc)))
}

fn pop(stack: &mut Vec<Value>) -> Result<Value> {
    stack
        .pop()
        .ok_or_else(|| UpdateError::execution("operand stack underflow"))
}

fn local(locals: &[Value], slot: usize) -> Result<Value> {
    locals
        .get(slot)
        .copied()
        .ok_or_else(|| UpdateError::execution(format!("local {} out of range", slot)))
}

fn load_constant(act: &Activation, index: u16) -> Result<Value> {
    match act.pool.get(index) {
        Some(Constant::Int(v)) => Ok(Value::Int(*v)),
        Some(Constant::Long(v)) => Ok(Value::Long(*v)),
        other => Err(UpdateError::execution(format!(
            "ldc of unsupported constant {:?}",
            other
        ))),
    }
}

/// Integer arithmetic, widened to long when either operand is a long
fn arith(op: Opcode, a: Value, b: Value) -> Result<Value> {
    let bad = || UpdateError::execution(format!("{} on {} and {}", op.mnemonic(), a, b));
    if matches!(a, Value::Long(_)) || matches!(b, Value::Long(_)) {
        let (x, y) = (a.as_long().ok_or_else(bad)?, b.as_long().ok_or_else(bad)?);
        let r = match op {
            Opcode::Iadd => x.wrapping_add(y),
            Opcode::Isub => x.wrapping_sub(y),
            _ => x.wrapping_mul(y),
        };
        return Ok(Value::Long(r));
    }
    let (x, y) = (a.as_int().ok_or_else(bad)?, b.as_int().ok_or_else(bad)?);
    let r = match op {
        Opcode::Iadd => x.wrapping_add(y),
        Opcode::Isub => x.wrapping_sub(y),
        _ => x.wrapping_mul(y),
    };
    Ok(Value::Int(r))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arith_widening() {
        assert_eq!(arith(Opcode::Iadd, Value::Int(2), Value::Int(3)).unwrap(), Value::Int(5));
        assert_eq!(
            arith(Opcode::Imul, Value::Int(2), Value::Long(1 << 40)).unwrap(),
            Value::Long(1 << 41)
        );
        assert_eq!(
            arith(Opcode::Iadd, Value::Int(i32::MAX), Value::Int(1)).unwrap(),
            Value::Int(i32::MIN)
        );
        assert!(arith(Opcode::Isub, Value::Float(1.0), Value::Int(1)).is_err());
    }

    #[test]
    fn test_branch_bounds() {
        assert_eq!(branch(10, -4).unwrap(), 6);
        assert!(branch(2, -4).is_err());
    }

    #[test]
    fn test_poll_points() {
        let back = Instruction {
            bci: 8,
            opcode: Opcode::Goto,
            operand: (-8i16) as u16,
        };
        let forward = Instruction {
            bci: 8,
            opcode: Opcode::Goto,
            operand: 4,
        };
        assert!(polls(&back));
        assert!(!polls(&forward));
    }
}
