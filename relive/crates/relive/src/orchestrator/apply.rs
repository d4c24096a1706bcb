//! Apply phase
//!
//! Runs inside the pause with the registry write-locked and every
//! application thread parked. Units are applied supertypes first. A unit
//! that faults is marked failed before any of its metadata is touched, and
//! so is every unit built against it; siblings already applied stay applied.

use relive_util::fx::FxHashSet;
use relive_util::ids::{ClassId, MethodId};
use relive_util::Symbol;
use std::sync::Arc;

use super::prepare::{mark_restricted, reset_update_states};
use super::unit::{ClassUnit, PreparedRequest};
use super::ClassState;
use crate::config::trace;
use crate::error::{Result, UpdateError};
use crate::logging::{log_event, UpdateEvent};
use crate::model::{
    ClassRegistry, Klass, KlassFlags, Method, MethodFlags, TransformLevel, UpdateState, UpdatingType,
};
use crate::quiescence;
use crate::runtime::reflection::{FieldRemapHint, RemapOutcome};
use crate::runtime::Vm;
use crate::version_graph::apply_marks;

/// What one apply did
#[derive(Debug, Default)]
pub(crate) struct ApplyOutcome {
    pub to_rn: u64,
    /// Compiled methods thrown away
    pub deopt: Vec<MethodId>,
    pub frames_repaired: usize,
    pub remap: RemapOutcome,
    /// Classes outside the request whose caches were cleared
    pub relinked: Vec<Symbol>,
    pub failed: usize,
}

/// Apply a prepared request and advance the revision
pub(crate) fn apply(
    vm: &Vm,
    registry: &mut ClassRegistry,
    prepared: &mut PreparedRequest,
    hints: &[FieldRemapHint],
) -> ApplyOutcome {
    let to_rn = prepared.from_rn + 1;
    let mut outcome = ApplyOutcome {
        to_rn,
        ..Default::default()
    };

    outcome.deopt = vm.code_cache.invalidate_dependent(&dying_methods(registry, prepared));
    if !outcome.deopt.is_empty() {
        log::debug!("deoptimized {} compiled methods", outcome.deopt.len());
    }

    let changed_old: FxHashSet<ClassId> = prepared
        .units
        .iter()
        .filter(|u| u.is_changed())
        .filter_map(|u| u.old)
        .collect();
    let mut failed_names: FxHashSet<Symbol> = FxHashSet::default();
    let mut replaced: Vec<(ClassId, Option<ClassId>)> = Vec::new();
    let stale_checks = prepared.stale_checks;

    for unit in prepared.units.iter_mut() {
        if unit.state != ClassState::Prepared {
            continue;
        }
        let result = match depends_on_failed(registry, unit, &failed_names) {
            Some(dep) => Err(UpdateError::resolution(
                unit.name,
                format!("{} failed to apply", dep),
            )),
            None => apply_unit(registry, unit, &changed_old, stale_checks, to_rn),
        };
        match result {
            Ok(state) => {
                unit.state = state;
                match (state, unit.old) {
                    (ClassState::Redefined, Some(old)) => replaced.push((old, unit.new)),
                    (ClassState::Deleted, Some(old)) => replaced.push((old, None)),
                    _ => {},
                }
                if vm.config.traces(trace::APPLY) {
                    log_event(UpdateEvent::ClassApplied {
                        class: unit.name.to_string(),
                        state: state.to_string(),
                    });
                }
            },
            Err(e) => {
                log_event(UpdateEvent::ClassFailed {
                    class: unit.name.to_string(),
                    reason: e.to_string(),
                });
                if let Some(old) = unit.old {
                    registry.klass_mut(old).update_state = UpdateState::None;
                }
                failed_names.insert(unit.name);
                unit.state = ClassState::Failed;
                unit.error = Some(e);
                outcome.failed += 1;
            },
        }
        vm.stats.record_class(unit.state);
    }

    mark_restricted(registry, &prepared.restricted_methods(), false);
    reset_update_states(registry, prepared);

    outcome.remap = vm.reflection.remap(registry, &replaced, hints);
    for &class in &prepared.relink {
        let k = registry.klass(class);
        k.constants.clear_cache();
        outcome.relinked.push(k.name);
        vm.stats.record_class(ClassState::Relinked);
    }

    vm.set_revision(to_rn);
    outcome.frames_repaired = quiescence::repair_threads(vm, registry, to_rn, &outcome.deopt);
    log::info!(
        "revision {} -> {}: {} classes applied, {} failed, {} frames repaired",
        prepared.from_rn,
        to_rn,
        prepared.units.iter().filter(|u| is_applied(u.state)).count(),
        outcome.failed,
        outcome.frames_repaired
    );
    outcome
}

/// Work left after the pause ends: added classes become initialized
pub(crate) fn finalize(registry: &mut ClassRegistry, prepared: &PreparedRequest) {
    for unit in &prepared.units {
        if let (ClassState::Added, Some(new)) = (unit.state, unit.new) {
            registry.klass_mut(new).flags.set(KlassFlags::INITIALIZED);
        }
    }
}

fn is_applied(state: ClassState) -> bool {
    matches!(
        state,
        ClassState::Relinked
            | ClassState::Swapped
            | ClassState::Redefined
            | ClassState::Deleted
            | ClassState::Added
    )
}

/// Methods whose compiled code may no longer be used
fn dying_methods(registry: &ClassRegistry, prepared: &PreparedRequest) -> Vec<MethodId> {
    let mut out = prepared.restricted_methods();
    for unit in prepared.units.iter().filter(|u| u.is_changed()) {
        if let Some(old) = unit.old {
            for &m in &registry.klass(old).methods {
                if !out.contains(&m) {
                    out.push(m);
                }
            }
        }
    }
    out
}

/// Name of a failed unit this unit was built against
fn depends_on_failed(registry: &ClassRegistry, unit: &ClassUnit, failed: &FxHashSet<Symbol>) -> Option<Symbol> {
    if failed.is_empty() {
        return None;
    }
    let new = unit.new?;
    let k = registry.klass(new);
    k.super_class
        .iter()
        .chain(k.local_interfaces.iter())
        .map(|&c| registry.klass(c).name)
        .find(|n| failed.contains(n))
}

fn apply_unit(
    registry: &mut ClassRegistry,
    unit: &ClassUnit,
    changed_old: &FxHashSet<ClassId>,
    stale_checks: bool,
    to_rn: u64,
) -> Result<ClassState> {
    let missing = || UpdateError::invalid_state("prepared class versions", format!("{:?}", unit));
    match unit.updating_type {
        UpdatingType::Add => {
            let new = unit.new.ok_or_else(missing)?;
            add_class(registry, new, to_rn);
            Ok(ClassState::Added)
        },
        UpdatingType::Del => {
            let old = unit.old.ok_or_else(missing)?;
            delete_class(registry, old, changed_old, to_rn);
            Ok(ClassState::Deleted)
        },
        UpdatingType::Relink => {
            let old = unit.old.ok_or_else(missing)?;
            registry.klass(old).constants.clear_cache();
            registry.klass_mut(old).update_state = UpdateState::HasBeenRecompiled;
            Ok(ClassState::Relinked)
        },
        UpdatingType::BodyChange => {
            let (old, new) = (unit.old.ok_or_else(missing)?, unit.new.ok_or_else(missing)?);
            swap_class(registry, old, new, changed_old, to_rn)?;
            Ok(ClassState::Swapped)
        },
        t if t.is_redefinition() => {
            let (old, new) = (unit.old.ok_or_else(missing)?, unit.new.ok_or_else(missing)?);
            redefine_class(registry, unit, old, new, stale_checks || unit.transformer.is_some(), to_rn)?;
            Ok(ClassState::Redefined)
        },
        _ => Ok(ClassState::Unchanged),
    }
}

fn add_class(registry: &mut ClassRegistry, new: ClassId, to_rn: u64) {
    let k = registry.klass_mut(new);
    k.born_rn = to_rn;
    k.update_state = UpdateState::HasBeenAdded;
    registry.install(new);
}

/// Live subclasses of `class` that the request does not replace, parents
/// before children
fn bystanders(registry: &ClassRegistry, class: ClassId, changed_old: &FxHashSet<ClassId>) -> Vec<ClassId> {
    registry
        .all_subclasses(class)
        .into_iter()
        .filter(|c| !changed_old.contains(c))
        .filter(|&c| {
            let k = registry.klass(c);
            !k.is_stale() && registry.lookup_symbol(k.loader, k.name) == Some(c)
        })
        .collect()
}

/// Exchange code between the live class and its scratch version
///
/// The live class keeps its identity, statics and instances; its methods
/// and constants become the new ones. The scratch version ends up holding
/// the old code and the old revision interval, is marked stale so frames
/// still running it get repaired, and is linked in as the live class's
/// previous version.
fn swap_class(
    registry: &mut ClassRegistry,
    old: ClassId,
    new: ClassId,
    changed_old: &FxHashSet<ClassId>,
    to_rn: u64,
) -> Result<()> {
    let subs = bystanders(registry, old, changed_old);
    check_final_overrides(registry, new, &subs)?;

    {
        let (o, n) = registry.pick2_mut(old, new);
        std::mem::swap(&mut o.methods, &mut n.methods);
        std::mem::swap(&mut o.constants, &mut n.constants);
        std::mem::swap(&mut o.def, &mut n.def);
        std::mem::swap(&mut o.fields, &mut n.fields);
        o.update_state = UpdateState::HasBeenSwapped;
        n.flags.set(KlassFlags::STALE);
        n.born_rn = o.born_rn;
        n.dead_rn = to_rn;
        o.born_rn = to_rn;
        n.previous_version = o.previous_version;
        n.next_version = Some(old);
        o.previous_version = Some(new);
    }
    for_each_method(registry, old, |method| method.holder = old);
    for_each_method(registry, new, |method| {
        method.holder = new;
        method.flags.set(MethodFlags::OBSOLETE);
    });
    retarget_supertype(registry, new, old);

    registry.relink_vtable(old)?;
    registry.klass(old).constants.clear_cache();
    for sub in subs {
        registry.relink_vtable(sub)?;
        registry.klass(sub).constants.clear_cache();
    }
    Ok(())
}

/// Visit the methods declared by `class` without copying its method list
fn for_each_method(registry: &mut ClassRegistry, class: ClassId, mut f: impl FnMut(&mut Method)) {
    for i in 0..registry.klass(class).methods.len() {
        let m = registry.klass(class).methods[i];
        f(registry.method_mut(m));
    }
}

/// A bystander subclass overriding a method the new code declares final
/// cannot be relinked
fn check_final_overrides(registry: &ClassRegistry, new: ClassId, subs: &[ClassId]) -> Result<()> {
    for &m in &registry.klass(new).methods {
        let method = registry.method(m);
        if !method.access.is_final() || !method.is_virtual() {
            continue;
        }
        for &sub in subs {
            if registry.own_method(sub, method.name, method.sig).is_some() {
                return Err(UpdateError::resolution(
                    registry.klass(sub).name,
                    format!("overrides {} which is now final", method),
                ));
            }
        }
    }
    Ok(())
}

/// Point classes built against the scratch version `from` at `to`
fn retarget_supertype(registry: &mut ClassRegistry, from: ClassId, to: ClassId) {
    let users: Vec<ClassId> = registry
        .classes()
        .filter(|k| k.super_class == Some(from) || k.interfaces.contains(&from))
        .map(|k| k.id)
        .collect();
    for id in users {
        let k = registry.klass_mut(id);
        if k.super_class == Some(from) {
            k.super_class = Some(to);
        }
        for i in k.local_interfaces.iter_mut().chain(k.interfaces.iter_mut()) {
            if *i == from {
                *i = to;
            }
        }
    }
}

/// Make `new` the live version of `old`
fn redefine_class(
    registry: &mut ClassRegistry,
    unit: &ClassUnit,
    old: ClassId,
    new: ClassId,
    stale_checks: bool,
    to_rn: u64,
) -> Result<()> {
    let plan = unit
        .plan
        .clone()
        .ok_or_else(|| UpdateError::invalid_state("layout plan", format!("none for {}", unit.name)))?;

    {
        let (o, n) = registry.pick2_mut(old, new);
        o.flags.set(KlassFlags::STALE);
        o.dead_rn = to_rn;
        o.next_version = Some(new);
        o.update_state = UpdateState::HasBeenRedefined;
        n.born_rn = to_rn;
        n.previous_version = Some(old);
        n.update_state = UpdateState::None;

        // statics of the old version survive where the field still exists
        let from = o.statics.lock();
        let mut to = n.statics.lock();
        for m in &plan.static_fields {
            let size = m.ty.size();
            if let (Some(src), Some(dst)) = (
                from.get(m.old_offset..m.old_offset + size),
                to.get_mut(m.new_offset..m.new_offset + size),
            ) {
                dst.copy_from_slice(src);
            }
        }
        drop(to);
        drop(from);

        for (field, &checks) in n.fields.iter_mut().zip(&plan.field_checks) {
            field.checks = checks;
        }
        n.transform_level = if unit.transformer.is_some() {
            TransformLevel::Custom
        } else if unit.updating_type.changes_instances() {
            TransformLevel::DefaultCopy
        } else {
            TransformLevel::ReplaceKlass
        };
        if let Some(t) = &unit.transformer {
            n.transformer = Some(Arc::clone(t));
            n.flags.set(KlassFlags::HAS_TRANSFORMER);
        }
        n.flags.set(KlassFlags::INITIALIZED);
    }
    registry.replace_live(old, new);

    for_each_method(registry, old, |method| method.flags.set(MethodFlags::OBSOLETE));
    let has_phantom = plan.phantom_fields().next().is_some();
    for_each_method(registry, new, |method| {
        if method.is_static() {
            return;
        }
        if stale_checks {
            method.flags.set(MethodFlags::NEEDS_STALE_CHECK);
        }
        if has_phantom {
            method.flags.set(MethodFlags::NEEDS_MIXED_CHECK);
        }
        if unit.narrowing.type_narrowed {
            method.flags.set(MethodFlags::NEEDS_TYPE_NARROW_CHECK);
        }
    });
    apply_marks(registry, new, &unit.narrowing);

    if plan.needs_inplace_shape {
        let shape = registry
            .klass(new)
            .derive_shape(new, KlassFlags::INPLACE_SHAPE, plan.min_object_size);
        let id = registry.push_klass(|id| Klass { id, ..shape });
        registry.klass_mut(new).inplace_shape = Some(id);
    }
    if plan.needs_stale_shape || unit.transformer.is_some() {
        let size = registry.klass(new).instance_size;
        let shape = registry.klass(new).derive_shape(new, KlassFlags::STALE_SHAPE, size);
        let id = registry.push_klass(|id| Klass { id, ..shape });
        registry.klass_mut(new).stale_shape = Some(id);
    }
    Ok(())
}

/// Retire a deleted class
///
/// Bystander subclasses keep it as their superclass; their dispatch slots
/// holding its methods move to the nearest live ancestor implementation.
fn delete_class(registry: &mut ClassRegistry, old: ClassId, changed_old: &FxHashSet<ClassId>, to_rn: u64) {
    let subs = bystanders(registry, old, changed_old);
    {
        let k = registry.klass_mut(old);
        k.flags.set(KlassFlags::STALE);
        k.dead_rn = to_rn;
        k.update_state = UpdateState::HasBeenDeleted;
    }
    for_each_method(registry, old, |method| method.flags.set(MethodFlags::OBSOLETE));
    registry.uninstall(old);

    let ancestor = registry.klass(old).super_class;
    for sub in subs {
        let mut vtable = registry.klass(sub).vtable.clone();
        for slot in vtable.iter_mut() {
            let m = registry.method(*slot);
            if m.holder != old {
                continue;
            }
            if let Some(found) = ancestor.and_then(|a| registry.lookup_virtual(a, m.name, m.sig)) {
                *slot = found;
            }
        }
        registry.klass_mut(sub).vtable = vtable;
        registry.klass(sub).constants.clear_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Assembler, ClassDef, ALIVE};
    use relive_util::ids::LoaderId;

    fn counter(body: i8) -> ClassDef {
        let mut def = ClassDef::new("Counter").field("n", "I");
        let code = Assembler::new(&mut def).iconst(body).ireturn().finish();
        def.method("get", "()I", code)
    }

    /// Registry where `Counter` went through one body change at revision 1
    fn swapped() -> (ClassRegistry, ClassId, ClassId) {
        let mut reg = ClassRegistry::new(8);
        let live = reg.define(counter(1), LoaderId::BOOT, 0).unwrap();
        let scratch = reg
            .build(Arc::new(counter(2)), LoaderId::BOOT, |r, n| r.lookup(LoaderId::BOOT, n))
            .unwrap();
        swap_class(&mut reg, live, scratch, &FxHashSet::default(), 1).unwrap();
        (reg, live, scratch)
    }

    #[test]
    fn test_swap_moves_revision_boundary() {
        let (reg, live, scratch) = swapped();
        assert_eq!(reg.klass(live).revision_interval(), (1, ALIVE));
        assert_eq!(reg.klass(scratch).revision_interval(), (0, 1));
        assert_eq!(reg.klass(scratch).dead_rn, reg.klass(live).born_rn);
        assert!(reg.klass(live).is_alive_at(1));
        assert!(!reg.klass(live).is_alive_at(0));
        assert!(reg.klass(scratch).is_alive_at(0));
    }

    #[test]
    fn test_swap_links_scratch_as_previous_version() {
        let (reg, live, scratch) = swapped();
        assert_eq!(reg.klass(live).previous_version, Some(scratch));
        assert_eq!(reg.klass(scratch).next_version, Some(live));
        assert_eq!(reg.klass(scratch).previous_version, None);
        assert_eq!(reg.lookup(LoaderId::BOOT, "Counter"), Some(live));

        for &m in &reg.klass(live).methods {
            assert_eq!(reg.method(m).holder, live);
            assert!(!reg.method(m).flags.has(MethodFlags::OBSOLETE));
        }
        for &m in &reg.klass(scratch).methods {
            assert_eq!(reg.method(m).holder, scratch);
            assert!(reg.method(m).flags.has(MethodFlags::OBSOLETE));
        }
    }
}
