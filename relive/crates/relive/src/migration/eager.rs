//! Eager heap sweep
//!
//! In eager mode every stale instance is migrated inside the update pause.
//! Candidates are pushed to a shared injector and drained by a small pool
//! of scoped workers that steal from it. Optionally, instances left with a
//! phantom area are folded back into a single primary area sized for their
//! class.

use crossbeam_deque::{Injector, Steal};
use relive_util::ids::ThreadId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{ensure_current, old_image};
use crate::heap::HeapObject;
use crate::logging::{log_event, UpdateEvent};
use crate::model::KlassFlags;
use crate::runtime::Vm;
use crate::stats::PhaseTimer;

/// Result of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub scanned: usize,
    pub migrated: usize,
    /// Instances left in a stale shape by a failing transformer
    pub failed: usize,
    /// Mixed instances folded back to a single area
    pub merged: usize,
    pub workers: usize,
    pub duration: Duration,
}

/// Sweep ids live at the top of the thread id space
fn sweeper_id(worker: usize) -> ThreadId {
    ThreadId(u64::MAX - worker as u64)
}

/// Migrate every stale instance to revision `rn`
///
/// Must run while application threads are paused; the registry must not
/// be write-locked by the caller.
pub fn sweep(vm: &Vm, rn: u64) -> SweepOutcome {
    let timer = PhaseTimer::new();
    let candidates: Vec<Arc<HeapObject>> = {
        let registry = vm.registry.read();
        vm.heap
            .snapshot()
            .into_iter()
            .filter(|o| {
                let k = registry.klass(o.klass());
                k.is_stale() || k.flags.has(KlassFlags::STALE_SHAPE)
            })
            .collect()
    };
    let scanned = candidates.len();
    let workers = vm.config.effective_eager_workers().clamp(1, scanned.max(1));

    let injector = Injector::new();
    for object in candidates {
        injector.push(object);
    }

    let migrated = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let merged = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for worker in 0..workers {
            let (injector, migrated, failed, merged) = (&injector, &migrated, &failed, &merged);
            scope.spawn(move || {
                let id = sweeper_id(worker);
                while let Some(object) = next(injector) {
                    match ensure_current(vm, id, rn, &object) {
                        Ok(()) => {
                            migrated.fetch_add(1, Ordering::Relaxed);
                            if vm.config.merge_mixed_on_eager && merge_mixed(vm, id, &object) {
                                merged.fetch_add(1, Ordering::Relaxed);
                            }
                        },
                        Err(err) => {
                            log::debug!("eager sweep left {} stale: {}", object.id(), err);
                            failed.fetch_add(1, Ordering::Relaxed);
                        },
                    }
                }
            });
        }
    });

    let outcome = SweepOutcome {
        scanned,
        migrated: migrated.into_inner(),
        failed: failed.into_inner(),
        merged: merged.into_inner(),
        workers,
        duration: timer.elapsed(),
    };
    log_event(UpdateEvent::EagerSweep {
        objects: outcome.migrated,
        workers,
        duration_ms: timer.elapsed_ms(),
    });
    outcome
}

fn next(injector: &Injector<Arc<HeapObject>>) -> Option<Arc<HeapObject>> {
    loop {
        match injector.steal() {
            Steal::Success(object) => return Some(object),
            Steal::Empty => return None,
            Steal::Retry => continue,
        }
    }
}

/// Fold a mixed instance into one primary area sized for its class
fn merge_mixed(vm: &Vm, worker: ThreadId, object: &HeapObject) -> bool {
    if !object.is_mixed() {
        return false;
    }
    let size = vm.registry.read().klass(object.klass()).instance_size;
    let Ok(seen) = object.try_lock(worker) else {
        return false;
    };
    if !seen.is_mixed() {
        object.unlock(seen.klass(), false);
        return false;
    }
    let mut image = old_image(object, true);
    image.resize(size, 0);
    object.replace_primary(image.into_boxed_slice());
    object.replace_phantom(None);
    object.record_filler(0);
    object.unlock(seen.klass(), false);
    true
}
