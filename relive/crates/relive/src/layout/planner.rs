//! Layout planner

use relive_util::ids::ClassId;

use super::{LayoutPlan, MatchedField, OldFieldRef};
use crate::error::{Result, UpdateError};
use crate::migration::Transformer;
use crate::model::{ClassRegistry, FieldInfo, Klass, UpdatingType};

/// First supertype of `old` whose name also appears among the supertypes of
/// `new`, paired with that namesake
pub fn youngest_common_ancestor(
    registry: &ClassRegistry,
    old: ClassId,
    new: ClassId,
) -> Option<(ClassId, ClassId)> {
    let new_chain = registry.super_chain(new);
    registry.super_chain(old).into_iter().find_map(|o| {
        let name = registry.klass(o).name;
        new_chain
            .iter()
            .copied()
            .find(|&n| registry.klass(n).name == name)
            .map(|n| (o, n))
    })
}

/// Versions of a class from `id` back to the oldest one
fn version_chain(registry: &ClassRegistry, id: ClassId) -> Vec<ClassId> {
    let mut chain = vec![id];
    let mut cur = registry.klass(id).previous_version;
    while let Some(c) = cur {
        if chain.contains(&c) || chain.len() > registry.class_count() {
            break;
        }
        chain.push(c);
        cur = registry.klass(c).previous_version;
    }
    chain
}

/// Offset past which fields of `k` may live in phantom storage
fn phantom_limit(k: &Klass) -> usize {
    k.plan.as_ref().map_or(usize::MAX, |p| p.min_object_size)
}

fn same_layout(registry: &ClassRegistry, a: ClassId, b: ClassId) -> bool {
    let (ta, tb) = (registry.instance_field_table(a), registry.instance_field_table(b));
    ta.len() == tb.len()
        && ta
            .iter()
            .zip(&tb)
            .all(|(x, y)| x.matches(y.name, y.sig) && x.offset == y.offset)
}

fn merge_runs(runs: &mut Vec<(usize, usize)>, mut own: Vec<(usize, usize)>) {
    own.sort_unstable();
    for (start, end) in own {
        match runs.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => runs.push((start, end)),
        }
    }
}

/// Compute the migration plan from `old` to its new version `new`
///
/// `new` must be built against the new versions of its redefined supertypes,
/// which must already carry their own plans.
pub fn plan(
    registry: &ClassRegistry,
    old: ClassId,
    new: ClassId,
    updating_type: UpdatingType,
    stale_checks: bool,
    transformer: Option<&dyn Transformer>,
) -> Result<LayoutPlan> {
    let old_k = registry.klass(old);
    let new_k = registry.klass(new);

    let (ycsc_old, ycsc_new) = youngest_common_ancestor(registry, old, new)
        .ok_or_else(|| UpdateError::layout(old_k.name, "no common ancestor"))?;
    let (anc_old, anc_new) = (registry.klass(ycsc_old), registry.klass(ycsc_new));
    if anc_new.instance_size < anc_old.instance_size {
        return Err(UpdateError::layout(
            old_k.name,
            format!(
                "ancestor {} shrank from {} to {} bytes",
                anc_new.name, anc_old.instance_size, anc_new.instance_size
            ),
        ));
    }

    let versions = version_chain(registry, old);
    let min_object_size = versions
        .iter()
        .map(|&v| registry.klass(v).instance_size)
        .min()
        .unwrap_or(old_k.instance_size);
    let min_vtable_size = versions
        .iter()
        .map(|&v| registry.klass(v).vtable.len())
        .min()
        .unwrap_or(0);
    let old_limit = phantom_limit(old_k);

    // the ancestor prefix: its own plan when it is being redefined, else a
    // verbatim copy of its footprint
    let mut instance_fields = Vec::new();
    let mut inplace_runs = Vec::new();
    match anc_new.plan.as_deref() {
        Some(p) if ycsc_old != ycsc_new && p.old == ycsc_old => {
            instance_fields.extend_from_slice(&p.instance_fields);
            inplace_runs.extend_from_slice(&p.inplace_runs);
        },
        _ => {
            if !same_layout(registry, ycsc_old, ycsc_new) {
                return Err(UpdateError::layout(
                    old_k.name,
                    format!("ancestor {} changed layout without a plan", anc_new.name),
                ));
            }
            if anc_old.instance_size > 0 {
                inplace_runs.push((0, anc_old.instance_size));
            }
        },
    }

    let old_table = registry.instance_field_table(old);
    let new_fields = registry.instance_field_table(new);
    let old_own: Vec<&FieldInfo> = old_table
        .iter()
        .filter(|f| f.offset >= anc_old.instance_size)
        .collect();

    let mut own_runs = Vec::new();
    for nf in new_fields.iter().filter(|f| f.offset >= anc_new.instance_size) {
        let Some(of) = old_own.iter().find(|f| f.matches(nf.name, nf.sig)) else {
            continue;
        };
        let mut flags = 0;
        if of.end() > old_limit {
            flags |= MatchedField::OLD_PHANTOM;
        }
        if nf.end() > min_object_size {
            flags |= MatchedField::NEW_PHANTOM;
        }
        if of.offset == nf.offset && flags == 0 {
            own_runs.push((nf.offset, nf.end()));
        }
        instance_fields.push(MatchedField {
            old_offset: of.offset,
            new_offset: nf.offset,
            ty: nf.ty,
            flags,
        });
    }
    merge_runs(&mut inplace_runs, own_runs);

    let clear_start = anc_new.instance_size;
    let clear_len = old_k
        .instance_size
        .min(new_k.instance_size)
        .saturating_sub(clear_start);
    instance_fields.push(MatchedField::clear(clear_start, clear_len));

    let static_fields = new_k
        .static_fields()
        .filter_map(|nf| {
            old_k
                .static_fields()
                .find(|of| of.matches(nf.name, nf.sig))
                .map(|of| MatchedField {
                    old_offset: of.offset,
                    new_offset: nf.offset,
                    ty: nf.ty,
                    flags: 0,
                })
        })
        .collect();

    let field_checks = new_k
        .fields
        .iter()
        .map(|f| {
            if f.is_static() {
                return 0;
            }
            let mut checks = 0;
            if stale_checks {
                checks |= FieldInfo::STALE_CHECK;
            }
            if f.end() > min_object_size {
                checks |= FieldInfo::MIXED_CHECK;
            }
            checks
        })
        .collect();

    let mut transformer_args = Vec::new();
    if let Some(t) = transformer {
        for input in t.inputs() {
            let field = old_table
                .iter()
                .rev()
                .find(|f| f.name == input.as_str())
                .ok_or_else(|| {
                    UpdateError::layout(old_k.name, format!("transformer input {} not found", input))
                })?;
            transformer_args.push(OldFieldRef {
                name: field.name,
                offset: field.offset,
                ty: field.ty,
                phantom: field.end() > old_limit,
            });
        }
    }

    let plan = LayoutPlan {
        class: old_k.name,
        old,
        new,
        ycsc_old,
        ycsc_new,
        old_size: old_k.instance_size,
        new_size: new_k.instance_size,
        min_object_size,
        min_vtable_size,
        instance_fields,
        static_fields,
        inplace_runs,
        needs_inplace_shape: min_object_size < new_k.instance_size,
        needs_stale_shape: updating_type.changes_instances(),
        field_checks,
        new_fields,
        transformer_args,
    };
    log::trace!(
        "{}: ycsc {} min size {} -> {} matched, {} runs",
        plan.class,
        anc_new.name,
        plan.min_object_size,
        plan.matched().count(),
        plan.inplace_runs.len()
    );
    Ok(plan)
}
