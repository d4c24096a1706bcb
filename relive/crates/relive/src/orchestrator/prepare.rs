//! Prepare phase
//!
//! Runs outside the pause with the registry write-locked. New versions are
//! built into the arena but not made live, so a request that is discarded
//! or fails here leaves nothing visible behind.

use relive_util::fx::{FxHashMap, FxHashSet};
use relive_util::ids::{ClassId, MethodId};
use relive_util::Symbol;
use std::sync::Arc;

use super::request::{ChangeKind, UpdateRequest};
use super::unit::{ClassUnit, PreparedRequest};
use super::ClassState;
use crate::config::{trace, MigrationMode};
use crate::differ;
use crate::error::{Result, UpdateError};
use crate::layout;
use crate::logging::{log_event, UpdateEvent};
use crate::model::{ClassDef, ClassRegistry, MethodFlags, MethodUpdate, UpdateState, UpdatingType};
use crate::runtime::Vm;
use crate::stats::PhaseTimer;
use crate::version_graph;

/// Prepare `request` against the current registry
pub(crate) fn prepare(vm: &Vm, registry: &mut ClassRegistry, request: &UpdateRequest) -> Result<PreparedRequest> {
    let timer = PhaseTimer::new();
    let changes = request.validate(registry)?;

    let mut units = Vec::with_capacity(changes.len());
    let mut defs: Vec<Option<Arc<ClassDef>>> = Vec::with_capacity(changes.len());
    for (loader, change) in &changes {
        let mut unit = ClassUnit::new(Symbol::intern(&change.name), *loader, change.kind, false);
        unit.old = registry.lookup(*loader, &change.name);
        unit.transformer = request.transformers.get(&change.name).cloned();
        let def = match &change.provider {
            Some(provider) if change.kind != ChangeKind::Deleted => {
                let def = provider
                    .provide(&change.name)
                    .map_err(|e| UpdateError::resolution(&change.name, format!("{:#}", e)))?;
                if def.name != change.name {
                    return Err(UpdateError::resolution(
                        &change.name,
                        format!("provider returned a definition of {}", def.name),
                    ));
                }
                Some(Arc::new(def))
            },
            _ => None,
        };
        units.push(unit);
        defs.push(def);
    }
    add_implicit_units(registry, &mut units, &mut defs);

    let names: Vec<Symbol> = units.iter().map(|u| u.name).collect();
    let order = version_graph::prepare_order(&names, |i| {
        let Some(def) = &defs[i] else {
            return Vec::new();
        };
        def.super_name
            .iter()
            .chain(def.interfaces.iter())
            .filter_map(|dep| names.iter().position(|n| *n == dep.as_str()))
            .filter(|&j| j != i)
            .collect()
    })?;
    let mut slots: Vec<Option<(ClassUnit, Option<Arc<ClassDef>>)>> =
        units.into_iter().zip(defs).map(Some).collect();
    let ordered: Vec<(ClassUnit, Option<Arc<ClassDef>>)> =
        order.iter().filter_map(|&i| slots[i].take()).collect();

    let base_checks = (vm.config.migration_mode == MigrationMode::Lazy
        && vm.config.stale_object_checks)
        || !request.transformers.is_empty();

    let mut units = Vec::with_capacity(ordered.len());
    if let Err(e) = prepare_units(vm, registry, ordered, base_checks, &mut units) {
        clear_pending(registry, &units);
        return Err(e);
    }

    let prepared = PreparedRequest {
        relink: relink_set(registry, &units),
        units,
        modification_count: registry.modification_count(),
        stale_checks: base_checks,
        from_rn: vm.revision(),
    };
    let changed = prepared.changed();
    if changed == 0 {
        reset_update_states(registry, &prepared);
        return Err(UpdateError::Discarded);
    }
    mark_restricted(registry, &prepared.restricted_methods(), true);

    log_event(UpdateEvent::RequestPrepared {
        request: request.id.as_u64(),
        changed,
        duration_ms: timer.elapsed_ms(),
    });
    Ok(prepared)
}

/// Build, classify and plan every unit in prepare order
///
/// Units are pushed to `units` once their old version carries its pending
/// state, so a failure part way leaves `units` naming exactly what to undo.
fn prepare_units(
    vm: &Vm,
    registry: &mut ClassRegistry,
    ordered: Vec<(ClassUnit, Option<Arc<ClassDef>>)>,
    base_checks: bool,
    units: &mut Vec<ClassUnit>,
) -> Result<()> {
    let mut new_versions: FxHashMap<Symbol, ClassId> = FxHashMap::default();
    let mut deleted: FxHashSet<Symbol> = FxHashSet::default();
    let mut types_by_old: FxHashMap<ClassId, UpdatingType> = FxHashMap::default();
    let mut successors: FxHashMap<ClassId, ClassId> = FxHashMap::default();

    for (mut unit, def) in ordered {
        if unit.kind == ChangeKind::Deleted {
            if let Some(old) = unit.old {
                unit.updating_type = UpdatingType::Del;
                unit.restricted = registry.klass(old).methods.clone();
                registry.klass_mut(old).update_state = UpdateState::WillBeDeleted;
                types_by_old.insert(old, UpdatingType::Del);
                deleted.insert(unit.name);
            }
            unit.state = ClassState::Prepared;
            units.push(unit);
            continue;
        }
        let Some(def) = def else {
            return Err(UpdateError::resolution(unit.name, "no definition"));
        };

        let loader = unit.loader;
        let new = registry.build(def, loader, |reg, name| {
            let sym = Symbol::intern(name);
            if deleted.contains(&sym) {
                return None;
            }
            new_versions
                .get(&sym)
                .copied()
                .or_else(|| reg.lookup(loader, name))
        })?;
        unit.new = Some(new);

        let Some(old) = unit.old else {
            unit.updating_type = UpdatingType::Add;
            unit.state = ClassState::Prepared;
            registry.klass_mut(new).update_state = UpdateState::WillBeAdded;
            new_versions.insert(unit.name, new);
            units.push(unit);
            continue;
        };

        let diff = differ::classify(registry, old, new, |id| types_by_old.get(&id).copied())?;
        let ty = diff.updating_type;
        types_by_old.insert(old, ty);
        if vm.config.traces(trace::CLASSIFY) {
            log_event(UpdateEvent::ClassClassified {
                class: unit.name.to_string(),
                updating_type: ty.to_string(),
            });
        }

        if !ty.is_changed() || (unit.implicit && !ty.is_redefinition()) {
            // an untouched subclass of a class swapped in place keeps its
            // version; the swap relinks it
            unit.updating_type = UpdatingType::None;
            unit.state = ClassState::Unchanged;
            unit.new = None;
            unit.diff = Some(diff);
            units.push(unit);
            continue;
        }

        if ty.restricts_frames() {
            unit.restricted = diff
                .methods
                .iter()
                .filter(|m| m.kind != MethodUpdate::None)
                .map(|m| m.old)
                .collect();
        }
        if ty.is_redefinition() {
            let stale_checks = base_checks || unit.transformer.is_some();
            let plan = Arc::new(layout::plan(
                registry,
                old,
                new,
                ty,
                stale_checks,
                unit.transformer.as_deref(),
            )?);
            registry.klass_mut(new).plan = Some(Arc::clone(&plan));
            unit.plan = Some(plan);
            unit.narrowing =
                version_graph::narrowing(registry, old, new, |id| successors.get(&id).copied());
        }
        registry.klass_mut(old).update_state = match ty {
            UpdatingType::BodyChange => UpdateState::WillBeSwapped,
            UpdatingType::Relink => UpdateState::WillBeRecompiled,
            _ => UpdateState::WillBeRedefined,
        };
        unit.updating_type = ty;
        unit.diff = Some(diff);
        unit.state = ClassState::Prepared;
        new_versions.insert(unit.name, new);
        successors.insert(old, new);
        units.push(unit);
    }
    Ok(())
}

/// Pull in live subtypes of modified classes the request does not name
fn add_implicit_units(
    registry: &ClassRegistry,
    units: &mut Vec<ClassUnit>,
    defs: &mut Vec<Option<Arc<ClassDef>>>,
) {
    let mut i = 0;
    while i < units.len() {
        let (kind, old) = (units[i].kind, units[i].old);
        i += 1;
        let (ChangeKind::Modified, Some(old)) = (kind, old) else {
            continue;
        };
        for sub in subtypes(registry, old) {
            let k = registry.klass(sub);
            if units.iter().any(|u| u.name == k.name && u.loader == k.loader) {
                continue;
            }
            let mut unit = ClassUnit::new(k.name, k.loader, ChangeKind::Modified, true);
            unit.old = Some(sub);
            units.push(unit);
            defs.push(Some(Arc::clone(&k.def)));
        }
    }
}

/// Live direct subclasses and implementors of `class`
fn subtypes(registry: &ClassRegistry, class: ClassId) -> Vec<ClassId> {
    let is_live = |id: ClassId| {
        let k = registry.klass(id);
        !k.is_stale() && registry.lookup_symbol(k.loader, k.name) == Some(id)
    };
    let mut out: Vec<ClassId> = registry
        .klass(class)
        .subclasses
        .iter()
        .copied()
        .filter(|&c| is_live(c))
        .collect();
    if registry.klass(class).is_interface() {
        for id in registry.live_classes() {
            if registry.klass(id).local_interfaces.contains(&class) && !out.contains(&id) {
                out.push(id);
            }
        }
    }
    out
}

/// Live classes outside the request whose constant pools name a class of it
fn relink_set(registry: &ClassRegistry, units: &[ClassUnit]) -> Vec<ClassId> {
    let in_request: FxHashSet<ClassId> = units.iter().filter_map(|u| u.old).collect();
    let names: Vec<&str> = units
        .iter()
        .filter(|u| u.is_changed())
        .map(|u| u.name.as_str())
        .collect();
    registry
        .live_classes()
        .filter(|id| !in_request.contains(id))
        .filter(|&id| {
            let pool = &registry.klass(id).constants;
            names.iter().any(|n| pool.references_class(n))
        })
        .collect()
}

pub(crate) fn mark_restricted(registry: &mut ClassRegistry, methods: &[MethodId], on: bool) {
    for &m in methods {
        let flags = &mut registry.method_mut(m).flags;
        if on {
            flags.set(MethodFlags::RESTRICTED);
        } else {
            flags.clear(MethodFlags::RESTRICTED);
        }
    }
}

/// Undo the pending update states of a request that will not be applied
pub(crate) fn reset_update_states(registry: &mut ClassRegistry, prepared: &PreparedRequest) {
    clear_pending(registry, &prepared.units);
}

fn clear_pending(registry: &mut ClassRegistry, units: &[ClassUnit]) {
    for unit in units {
        if let Some(old) = unit.old {
            let k = registry.klass_mut(old);
            if k.update_state.is_pending() {
                k.update_state = UpdateState::None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpdateConfig;
    use crate::model::Assembler;
    use relive_util::ids::LoaderId;

    fn vm() -> Arc<Vm> {
        Vm::new(UpdateConfig::default()).unwrap()
    }

    fn counter(body: i8) -> ClassDef {
        let mut def = ClassDef::new("Counter").field("n", "I");
        let code = Assembler::new(&mut def).iconst(body).ireturn().finish();
        def.method("get", "()I", code)
    }

    #[test]
    fn test_body_change_restricts_changed_method() {
        let vm = vm();
        vm.define_class(counter(1)).unwrap();
        let request = UpdateRequest::builder().redefine(counter(2)).build();
        let mut reg = vm.registry.write();
        let prepared = prepare(&vm, &mut reg, &request).unwrap();
        let unit = prepared.unit("Counter").unwrap();
        assert_eq!(unit.updating_type, UpdatingType::BodyChange);
        assert_eq!(unit.restricted.len(), 1);
        assert!(reg.method(unit.restricted[0]).is_restricted());
        assert!(unit.plan.is_none(), "swapped classes need no plan");
    }

    #[test]
    fn test_identical_request_discarded() {
        let vm = vm();
        vm.define_class(counter(1)).unwrap();
        let request = UpdateRequest::builder().redefine(counter(1)).build();
        let mut reg = vm.registry.write();
        assert!(matches!(prepare(&vm, &mut reg, &request), Err(UpdateError::Discarded)));
    }

    #[test]
    fn test_subclass_pulled_in_and_ordered_after_super() {
        let vm = vm();
        vm.define_class(ClassDef::new("Base").field("a", "I")).unwrap();
        vm.define_class(ClassDef::new("Sub").extends("Base").field("b", "I")).unwrap();
        let request = UpdateRequest::builder()
            .redefine(ClassDef::new("Base").field("a", "I").field("z", "J"))
            .build();
        let mut reg = vm.registry.write();
        let prepared = prepare(&vm, &mut reg, &request).unwrap();
        let names: Vec<&str> = prepared.units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["Base", "Sub"]);
        let sub = prepared.unit("Sub").unwrap();
        assert!(sub.implicit);
        assert_eq!(sub.updating_type, UpdatingType::Both);
        let new_sub = sub.new.unwrap();
        let new_base = prepared.unit("Base").unwrap().new.unwrap();
        assert_eq!(reg.klass(new_sub).super_class, Some(new_base));
        assert!(sub.plan.is_some());
    }

    #[test]
    fn test_relink_set_collects_referencing_classes() {
        let vm = vm();
        vm.define_class(counter(1)).unwrap();
        let mut user = ClassDef::new("User");
        let code = Assembler::new(&mut user)
            .new_object("Counter")
            .invokevirtual("Counter", "get", "()I")
            .ireturn()
            .finish();
        vm.define_class(user.static_method("run", "()I", code)).unwrap();

        let request = UpdateRequest::builder().redefine(counter(5)).build();
        let mut reg = vm.registry.write();
        let prepared = prepare(&vm, &mut reg, &request).unwrap();
        let user_id = reg.lookup(LoaderId::BOOT, "User").unwrap();
        assert_eq!(prepared.relink, vec![user_id]);
    }
}
