//! Quiescence Module - getting threads out of restricted code
//!
//! An update may only be applied while no thread has a frame of a
//! restricted method (a method whose body or holder layout changes) on its
//! stack. Inside a pause the coordinator walks every stack:
//!
//! ```text
//!   frame 0   Driver.run        <- barrier installed here
//!   frame 1   C.m   RESTRICTED  <- oldest restricted frame
//!   frame 2   Hooks.block
//! ```
//!
//! A thread whose oldest restricted frame sits above frame 0 gets a return
//! barrier on the frame below it. When the restricted frame returns, the
//! barrier fires: the thread reports in and blocks until the next attempt
//! settles, so it cannot re-enter restricted code in the meantime. When the
//! last outstanding barrier fires (or, without eager wakeup, the first one)
//! the coordinator retries.
//!
//! A thread whose bottom frame is restricted cannot be caught by a barrier;
//! the coordinator also retries when such a stack empties, when a thread
//! detaches, and after the retry interval.
//!
//! Once the update is applied every frame of a replaced method is repaired
//! onto the matching method of the new version, keeping its bci, and every
//! thread's revision cursor advances to the new revision.

use parking_lot::{Condvar, Mutex};
use relive_util::ids::{ClassId, MethodId, ThreadId};
use std::time::{Duration, Instant};

use crate::config::trace;
use crate::logging::{log_event, UpdateEvent};
use crate::model::bytecode::decode_at;
use crate::model::ClassRegistry;
use crate::runtime::thread::{AppThread, Frame, FrameKind, ThreadState};
use crate::runtime::Vm;

#[derive(Debug, Default)]
struct BarrierInner {
    /// A request is between its first pause and its final settle
    pending: bool,
    /// Barriers installed by the last interrupted attempt not yet fired
    outstanding: usize,
    /// The coordinator should retry now
    wake: bool,
    /// Bumped whenever an attempt settles; blocked threads wait for it
    epoch: u64,
}

/// Shared state between the coordinator and threads hitting barriers
#[derive(Default)]
pub(crate) struct BarrierState {
    inner: Mutex<BarrierInner>,
    coordinator: Condvar,
    threads: Condvar,
}

impl BarrierState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A request starts its attempts
    pub(crate) fn begin(&self) {
        let mut inner = self.inner.lock();
        inner.pending = true;
        inner.outstanding = 0;
        inner.wake = false;
    }

    /// An attempt was interrupted with `outstanding` barriers installed
    pub(crate) fn arm(&self, outstanding: usize) {
        let mut inner = self.inner.lock();
        inner.outstanding = outstanding;
        inner.wake = false;
    }

    /// An attempt is over; release threads blocked on a fired barrier
    pub(crate) fn settle(&self) {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        self.threads.notify_all();
    }

    /// The request is over
    pub(crate) fn finish(&self) {
        let mut inner = self.inner.lock();
        inner.pending = false;
        inner.outstanding = 0;
        inner.wake = false;
        inner.epoch += 1;
        self.threads.notify_all();
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.inner.lock().pending
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.inner.lock().outstanding
    }

    /// Block the coordinator until a retry is due or `timeout` passes
    ///
    /// Returns whether a thread asked for the retry.
    pub(crate) fn wait_for_wake(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while !inner.wake {
            if self.coordinator.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        std::mem::take(&mut inner.wake)
    }

    fn wake(&self) {
        let mut inner = self.inner.lock();
        if inner.pending {
            inner.wake = true;
            self.coordinator.notify_all();
        }
    }
}

/// Result of a stack check inside a pause
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckOutcome {
    pub unsafe_threads: Vec<ThreadId>,
    pub barriers: usize,
}

impl CheckOutcome {
    pub fn is_safe(&self) -> bool {
        self.unsafe_threads.is_empty()
    }
}

/// Index of the oldest frame running a restricted method
fn oldest_restricted(registry: &ClassRegistry, frames: &[Frame]) -> Option<usize> {
    frames
        .iter()
        .position(|f| registry.method(f.method).is_restricted())
}

/// Walk every stack, installing return barriers where needed
///
/// Runs inside a pause. Barriers left over from an earlier attempt are
/// cleared first, and a thread whose cursor lags behind the system
/// revision is caught up before its stack is checked.
pub(crate) fn check_threads(vm: &Vm, registry: &ClassRegistry) -> CheckOutcome {
    let mut outcome = CheckOutcome::default();
    let system_rn = vm.revision();
    for thread in vm.threads.snapshot() {
        let mut frames = thread.frames();
        for frame in frames.iter_mut() {
            frame.barrier = false;
        }
        if thread.revision() < system_rn {
            let from = thread.revision();
            let repaired = advance_thread(registry, &thread, &mut frames, system_rn, &[]);
            vm.stats.record_frames_repaired(repaired);
            log::debug!(
                "{} caught up from revision {} to {}, {} frames repaired",
                thread.id(),
                from,
                system_rn,
                repaired
            );
        }
        let Some(r) = oldest_restricted(registry, &frames) else {
            continue;
        };
        outcome.unsafe_threads.push(thread.id());
        if r > 0 {
            let frame = &mut frames[r - 1];
            frame.barrier = true;
            outcome.barriers += 1;
            vm.stats.record_barrier_installed();
            if vm.config.traces(trace::BARRIERS) {
                log_event(UpdateEvent::BarrierInstalled {
                    thread: thread.id().as_u64(),
                    frame: frame.id.as_u64(),
                });
            }
        }
    }
    outcome
}

/// Move every thread's frames onto the new revision
///
/// `deopt` lists methods whose compiled code was thrown away. Returns the
/// number of frames moved onto a new method.
pub(crate) fn repair_threads(
    vm: &Vm,
    registry: &ClassRegistry,
    to_rn: u64,
    deopt: &[MethodId],
) -> usize {
    let repaired = vm.threads.advance(to_rn, |thread| {
        let mut frames = thread.frames();
        advance_thread(registry, thread, &mut frames, to_rn, deopt)
    });
    vm.stats.record_frames_repaired(repaired);
    repaired
}

/// Step a thread's cursor up to `to_rn`, one revision at a time
///
/// `deopt` applies to the last step only.
fn advance_thread(
    registry: &ClassRegistry,
    thread: &AppThread,
    frames: &mut [Frame],
    to_rn: u64,
    deopt: &[MethodId],
) -> usize {
    let mut repaired = 0;
    for rn in thread.revision().saturating_add(1)..=to_rn {
        let deopt = if rn == to_rn { deopt } else { &[] };
        repaired += repair_frames(registry, frames, rn, deopt);
        thread.set_revision(rn);
    }
    repaired
}

/// Version of `class` in use at revision `rn`, following its successors
fn version_at(registry: &ClassRegistry, class: ClassId, rn: u64) -> Option<ClassId> {
    let mut cur = class;
    for _ in 0..=registry.class_count() {
        let k = registry.klass(cur);
        if k.is_alive_at(rn) {
            return Some(cur);
        }
        cur = k.next_version?;
    }
    None
}

/// Move frames whose method belongs to a version retired before `rn`
fn repair_frames(registry: &ClassRegistry, frames: &mut [Frame], rn: u64, deopt: &[MethodId]) -> usize {
    let mut repaired = 0;
    let depth = frames.len();
    for i in 0..depth {
        let frame = &frames[i];
        if frame.kind == FrameKind::Native {
            continue;
        }
        let callee_interpreted = frames.get(i + 1).map(|f| f.kind) == Some(FrameKind::Interpreted);
        let old = registry.method(frame.method);
        let holder = registry.klass(old.holder);
        let mut kind = frame.kind;
        if kind == FrameKind::Compiled && deopt.contains(&frame.method) {
            kind = FrameKind::Interpreted;
        }

        let mut method = frame.method;
        if !holder.is_alive_at(rn) {
            let replacement = version_at(registry, holder.id, rn)
                .and_then(|current| registry.find_method(current, old.name, old.sig));
            if let Some(new) = replacement.filter(|&m| m != frame.method) {
                kind = FrameKind::Interpreted;
                if callee_interpreted {
                    carry_call_site(registry, frame.method, new, frame.bci);
                }
                method = new;
                repaired += 1;
            }
        }

        let frame = &mut frames[i];
        frame.method = method;
        frame.kind = kind;
    }
    repaired
}

/// Copy the resolved call site of a pending invoke into the new method's
/// pool so the return lands in an already linked call
fn carry_call_site(registry: &ClassRegistry, old: MethodId, new: MethodId, bci: usize) {
    let (old_m, new_m) = (registry.method(old), registry.method(new));
    let (Some(old_insn), Some(new_insn)) = (decode_at(&old_m.code, bci), decode_at(&new_m.code, bci)) else {
        return;
    };
    if !old_insn.opcode.is_invoke() || old_insn.opcode != new_insn.opcode {
        return;
    }
    let (Some(old_idx), Some(new_idx)) = (old_insn.cp_index(), new_insn.cp_index()) else {
        return;
    };
    let old_pool = &registry.klass(old_m.holder).constants;
    let new_pool = &registry.klass(new_m.holder).constants;
    if new_pool.resolved(new_idx).is_none() {
        if let Some(entry) = old_pool.resolved(old_idx) {
            new_pool.store(new_idx, entry);
        }
    }
}

/// A return barrier fired on frame `depth` of `thread`
///
/// Called by the interpreter after the restricted callee returned. If the
/// thread is now clear of restricted frames it reports to the coordinator
/// and blocks until the current attempt settles; otherwise a new barrier is
/// installed further down the stack.
pub(crate) fn on_barrier(vm: &Vm, thread: &AppThread, depth: usize) {
    vm.stats.record_barrier_fired();
    if vm.config.traces(trace::BARRIERS) {
        log_event(UpdateEvent::BarrierFired {
            thread: thread.id().as_u64(),
        });
    }
    let barriers = &vm.quiescence;
    if !barriers.is_pending() {
        return;
    }

    let still_restricted = {
        let registry = vm.registry.read();
        let system_rn = vm.revision();
        let mut frames = thread.frames();
        if thread.revision() < system_rn {
            advance_thread(&registry, thread, &mut frames, system_rn, &[]);
        }
        debug_assert_eq!(frames.len(), depth + 1);
        match oldest_restricted(&registry, &frames) {
            Some(r) if r > 0 => {
                frames[r - 1].barrier = true;
                vm.stats.record_barrier_installed();
                true
            },
            Some(_) => true,
            None => false,
        }
    };
    if still_restricted {
        log::trace!("{} still in restricted code after barrier", thread.id());
        return;
    }

    vm.safepoint.enter_safe(thread, ThreadState::Blocked);
    {
        let mut inner = barriers.inner.lock();
        if inner.pending {
            inner.outstanding = inner.outstanding.saturating_sub(1);
            if !vm.config.eager_wakeup || inner.outstanding == 0 {
                inner.wake = true;
                barriers.coordinator.notify_all();
            }
            let epoch = inner.epoch;
            while inner.pending && inner.epoch == epoch {
                barriers.threads.wait(&mut inner);
            }
        }
    }
    vm.safepoint.leave_safe(thread);
}

/// A thread's stack became empty
pub(crate) fn stack_emptied(vm: &Vm) {
    vm.quiescence.wake();
}

/// A thread detached from the runtime
pub(crate) fn thread_detached(vm: &Vm) {
    vm.quiescence.wake();
    vm.safepoint.notify_arrival();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpdateConfig;
    use crate::model::{Assembler, ClassDef, KlassFlags};
    use relive_util::ids::{FrameId, LoaderId};
    use relive_util::Symbol;
    use std::sync::Arc;
    use std::thread;

    fn clock(value: i8) -> ClassDef {
        let mut def = ClassDef::new("Clock");
        let code = Assembler::new(&mut def).iconst(value).ireturn().finish();
        def.static_method("tick", "()I", code)
    }

    /// Three versions of `Clock` retired at revisions 1 and 2
    fn version_chain() -> (ClassRegistry, [ClassId; 3]) {
        let mut reg = ClassRegistry::new(8);
        let v0 = reg.define(clock(0), LoaderId::BOOT, 0).unwrap();
        let mut ids = [v0; 3];
        for rn in 1..3u64 {
            let next = reg
                .build(Arc::new(clock(rn as i8)), LoaderId::BOOT, |r, n| r.lookup(LoaderId::BOOT, n))
                .unwrap();
            let prev = ids[rn as usize - 1];
            let k = reg.klass_mut(prev);
            k.flags.set(KlassFlags::STALE);
            k.dead_rn = rn;
            k.next_version = Some(next);
            let k = reg.klass_mut(next);
            k.born_rn = rn;
            k.previous_version = Some(prev);
            ids[rn as usize] = next;
        }
        (reg, ids)
    }

    fn tick(reg: &ClassRegistry, class: ClassId) -> MethodId {
        reg.own_method(class, Symbol::intern("tick"), Symbol::intern("()I")).unwrap()
    }

    #[test]
    fn test_version_at_follows_successors() {
        let (reg, [v0, v1, v2]) = version_chain();
        assert_eq!(version_at(&reg, v0, 0), Some(v0));
        assert_eq!(version_at(&reg, v0, 1), Some(v1));
        assert_eq!(version_at(&reg, v0, 2), Some(v2));
        assert_eq!(version_at(&reg, v1, 7), Some(v2));
        assert_eq!(version_at(&reg, v2, 0), None, "no version before the first");
    }

    #[test]
    fn test_lagging_thread_steps_through_each_revision() {
        let (reg, [v0, _, v2]) = version_chain();
        let threads = crate::runtime::thread::ThreadRegistry::new();
        let thread = threads.register("lagging");
        let mut frames = vec![Frame {
            id: FrameId(1),
            method: tick(&reg, v0),
            bci: 0,
            kind: FrameKind::Compiled,
            barrier: false,
        }];

        let repaired = advance_thread(&reg, &thread, &mut frames, 2, &[]);
        assert_eq!(repaired, 2, "one move per retired version");
        assert_eq!(frames[0].method, tick(&reg, v2));
        assert_eq!(frames[0].kind, FrameKind::Interpreted);
        assert_eq!(thread.revision(), 2);

        assert_eq!(advance_thread(&reg, &thread, &mut frames, 2, &[]), 0);
    }

    #[test]
    fn test_check_catches_up_lagging_thread() {
        let vm = Vm::new(UpdateConfig::default()).unwrap();
        let handle = vm.attach_thread("idle");
        vm.set_revision(3);

        let registry = vm.registry.read();
        let outcome = check_threads(&vm, &registry);
        assert!(outcome.is_safe(), "{:?}", outcome);
        assert_eq!(handle.current_revision(), 3);
    }

    #[test]
    fn test_wait_for_wake_times_out() {
        let state = BarrierState::new();
        state.begin();
        assert!(!state.wait_for_wake(Duration::from_millis(5)));
    }

    #[test]
    fn test_wake_only_while_pending() {
        let state = BarrierState::new();
        state.wake();
        state.begin();
        assert!(!state.wait_for_wake(Duration::from_millis(1)), "wake before begin is dropped");
        state.wake();
        assert!(state.wait_for_wake(Duration::from_secs(5)));
        state.finish();
        assert!(!state.is_pending());
    }

    #[test]
    fn test_wake_from_other_thread() {
        let state = Arc::new(BarrierState::new());
        state.begin();
        state.arm(1);
        assert_eq!(state.outstanding(), 1);
        let remote = Arc::clone(&state);
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.wake();
        });
        assert!(state.wait_for_wake(Duration::from_secs(10)));
        waker.join().unwrap();
    }
}
