//! Migration Module - bringing stale instances to the new class version
//!
//! An instance whose header names a dead class version is migrated one
//! version at a time until its class is alive at the accessing thread's
//! revision. Each step rebuilds the instance bytes from the layout plan of
//! the successor version:
//!
//! 1. the in-place runs of the new shape are copied from the old image
//! 2. the clear range is zeroed
//! 3. matched fields are copied from their old to their new offsets
//!
//! The old image is the logical view of the instance (primary storage with
//! phantom fields overlaid), so it does not matter whether a field lived in
//! primary or phantom storage before the step.
//!
//! ## Transitions
//!
//! ```text
//!               new size fits primary    new size exceeds primary
//!  direct   ->  SimpleToSimple           SimpleToMixed
//!  mixed    ->  MixedToSimple            MixedToMixedReallocate (phantom reused)
//!                                        MixedToMixedRelink     (new phantom)
//! ```
//!
//! `ReplaceKlass` only rewrites the header; it is used when the instance
//! layout is unchanged.
//!
//! While the bytes are rewritten the object holds its BUSY bit; other
//! threads wait on the object monitor. A custom transformer runs after the
//! structural copy with the header pointing at the stale shape of the new
//! version. If it fails the object stays in the stale shape and the
//! transformer is retried on the next access.

mod eager;
mod transformer;

pub use eager::{sweep, SweepOutcome};
pub use transformer::{FnTransformer, ObjectView, Transformer};

use relive_util::ids::{ClassId, ThreadId};
use std::sync::Arc;

use crate::config::trace;
use crate::error::{Result, UpdateError};
use crate::heap::{HeapObject, Phantom, PendingTransform};
use crate::layout::LayoutPlan;
use crate::logging::{log_event, UpdateEvent};
use crate::model::{ClassRegistry, FieldInfo, KlassFlags, Value};
use crate::runtime::Vm;

/// Storage transition of one migration step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum TransitionKind {
    ReplaceKlass,
    SimpleToSimple,
    SimpleToMixed,
    MixedToSimple,
    MixedToMixedReallocate,
    MixedToMixedRelink,
}

impl TransitionKind {
    pub const COUNT: usize = 6;

    pub const ALL: [TransitionKind; Self::COUNT] = [
        TransitionKind::ReplaceKlass,
        TransitionKind::SimpleToSimple,
        TransitionKind::SimpleToMixed,
        TransitionKind::MixedToSimple,
        TransitionKind::MixedToMixedReallocate,
        TransitionKind::MixedToMixedRelink,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransitionKind::ReplaceKlass => "replace-klass",
            TransitionKind::SimpleToSimple => "simple-to-simple",
            TransitionKind::SimpleToMixed => "simple-to-mixed",
            TransitionKind::MixedToSimple => "mixed-to-simple",
            TransitionKind::MixedToMixedReallocate => "mixed-to-mixed-reallocate",
            TransitionKind::MixedToMixedRelink => "mixed-to-mixed-relink",
        }
    }

    /// Pick the transition for an instance of the given storage
    pub fn select(
        changes_layout: bool,
        mixed: bool,
        primary_len: usize,
        phantom_len: Option<usize>,
        new_size: usize,
    ) -> TransitionKind {
        if !changes_layout {
            return TransitionKind::ReplaceKlass;
        }
        let fits = new_size <= primary_len;
        match (mixed, fits) {
            (false, true) => TransitionKind::SimpleToSimple,
            (false, false) => TransitionKind::SimpleToMixed,
            (true, true) => TransitionKind::MixedToSimple,
            (true, false) if phantom_len.is_some_and(|len| new_size <= len) => {
                TransitionKind::MixedToMixedReallocate
            },
            (true, false) => TransitionKind::MixedToMixedRelink,
        }
    }

    pub fn is_mixed_result(self) -> bool {
        matches!(
            self,
            TransitionKind::SimpleToMixed
                | TransitionKind::MixedToMixedReallocate
                | TransitionKind::MixedToMixedRelink
        )
    }
}

/// One version step, copied out of the registry so no registry lock is
/// held while the object is locked
struct Step {
    from: ClassId,
    target: ClassId,
    transformer: Option<Arc<dyn Transformer>>,
    fields: Vec<FieldInfo>,
    action: Action,
}

enum Action {
    /// The object is in a stale shape; only the transformer is outstanding
    Retransform,
    Migrate {
        plan: Option<Arc<LayoutPlan>>,
        new_size: usize,
        limit: usize,
        stale_shape: Option<ClassId>,
    },
}

/// Work out the next step for an object whose header names `klass`
fn next_step(registry: &ClassRegistry, klass: ClassId, rn: u64) -> Option<Step> {
    let k = registry.klass(klass);
    if k.flags.has(KlassFlags::STALE_SHAPE) {
        let target = k.next_version?;
        let n = registry.klass(target);
        return Some(Step {
            from: klass,
            target,
            transformer: n.transformer.clone(),
            fields: field_table(registry, target),
            action: Action::Retransform,
        });
    }
    if !k.is_stale() || k.dead_rn > rn {
        return None;
    }
    // deleted classes have no successor; their instances stay as they are
    let target = k.next_version?;
    let n = registry.klass(target);
    let limit = n
        .inplace_shape
        .map(|s| registry.klass(s).instance_size)
        .or_else(|| n.plan.as_ref().map(|p| p.min_object_size))
        .unwrap_or(n.instance_size);
    Some(Step {
        from: klass,
        target,
        transformer: n.transformer.clone(),
        fields: field_table(registry, target),
        action: Action::Migrate {
            plan: n.plan.clone(),
            new_size: n.instance_size,
            limit,
            stale_shape: n.stale_shape,
        },
    })
}

fn field_table(registry: &ClassRegistry, class: ClassId) -> Vec<FieldInfo> {
    match &registry.klass(class).plan {
        Some(plan) => plan.new_fields.clone(),
        None => registry.instance_field_table(class),
    }
}

/// Migrate `object` until its class is alive at revision `rn`
///
/// Re-entrant: a transformer touching the object it is migrating sees it
/// as already current. Waits while another thread migrates the object.
pub fn ensure_current(vm: &Vm, thread: ThreadId, rn: u64, object: &HeapObject) -> Result<()> {
    loop {
        let step = {
            let registry = vm.registry.read();
            next_step(&registry, object.klass(), rn)
        };
        let Some(step) = step else {
            return Ok(());
        };
        match object.try_lock(thread) {
            Ok(seen) if seen.klass() != step.from => {
                object.unlock(seen.klass(), seen.is_mixed());
            },
            Ok(seen) => match &step.action {
                Action::Retransform => retransform(vm, object, &step, seen.is_mixed())?,
                Action::Migrate { .. } => migrate(vm, object, &step, seen.is_mixed())?,
            },
            Err(_) if object.owner() == thread => return Ok(()),
            Err(_) => object.wait_unlocked(),
        }
    }
}

/// Logical byte image of an instance
fn old_image(object: &HeapObject, mixed: bool) -> Vec<u8> {
    let mut image = object.primary_bytes().into_vec();
    if mixed {
        if let Some(phantom) = object.phantom() {
            if phantom.data.len() > image.len() {
                image.resize(phantom.data.len(), 0);
            }
            let start = phantom.limit.min(phantom.data.len());
            image[start..phantom.data.len()].copy_from_slice(&phantom.data[start..]);
        }
    }
    image
}

/// Bytes of the new shape built from the old image
fn build_prototype(plan: &LayoutPlan, image: &[u8], new_size: usize) -> Vec<u8> {
    let mut proto = vec![0u8; new_size];
    for &(start, end) in &plan.inplace_runs {
        let end = end.min(new_size).min(image.len());
        if start < end {
            proto[start..end].copy_from_slice(&image[start..end]);
        }
    }
    for range in plan.instance_fields.iter().filter_map(|m| m.clear_range()) {
        let end = range.end.min(new_size);
        if range.start < end {
            proto[range.start..end].fill(0);
        }
    }
    for m in plan.matched() {
        let n = m.ty.size();
        if m.old_offset + n <= image.len() && m.new_offset + n <= new_size {
            proto[m.new_offset..m.new_offset + n]
                .copy_from_slice(&image[m.old_offset..m.old_offset + n]);
        }
    }
    proto
}

fn transformer_inputs(plan: Option<&LayoutPlan>, image: &[u8]) -> Vec<Value> {
    let Some(plan) = plan else {
        return Vec::new();
    };
    plan.transformer_args
        .iter()
        .map(|arg| {
            image
                .get(arg.offset..arg.offset + arg.ty.size())
                .map_or_else(|| arg.ty.zero(), |bytes| Value::decode(arg.ty, bytes))
        })
        .collect()
}

fn migrate(vm: &Vm, object: &HeapObject, step: &Step, mixed: bool) -> Result<()> {
    let Action::Migrate {
        plan,
        new_size,
        limit,
        stale_shape,
    } = &step.action
    else {
        return Err(UpdateError::Internal("migrate called for a retransform step".into()));
    };
    let (new_size, limit) = (*new_size, *limit);
    let changes_layout = plan.as_ref().is_some_and(|p| p.needs_stale_shape);
    let kind = TransitionKind::select(
        changes_layout,
        mixed,
        object.primary_len(),
        object.phantom_len(),
        new_size,
    );

    let image = old_image(object, mixed);
    let old_values = if step.transformer.is_some() {
        transformer_inputs(plan.as_deref(), &image)
    } else {
        Vec::new()
    };

    let now_mixed = match (kind, plan.as_deref()) {
        (TransitionKind::ReplaceKlass, _) | (_, None) => mixed,
        (kind, Some(plan)) => {
            let proto = build_prototype(plan, &image, new_size);
            write_storage(vm, object, kind, &proto, limit);
            kind.is_mixed_result()
        },
    };

    if let Some(transformer) = &step.transformer {
        let shape = stale_shape.unwrap_or(step.target);
        object.set_klass_locked(shape, now_mixed);
        let view = ObjectView::new(object, &step.fields);
        if let Err(err) = transformer.transform(&view, &old_values) {
            object.set_pending(Some(PendingTransform {
                target: step.target,
                old_values,
            }));
            object.unlock(shape, now_mixed);
            return Err(transform_failed(vm, object, &err));
        }
    }

    object.unlock(step.target, now_mixed);
    vm.stats.record_migration(kind);
    if vm.config.traces(trace::OBJECTS) {
        log_event(UpdateEvent::ObjectMigrated {
            object: object.id().as_u64(),
            transition: kind.as_str().to_string(),
        });
    }
    Ok(())
}

fn write_storage(vm: &Vm, object: &HeapObject, kind: TransitionKind, proto: &[u8], limit: usize) {
    let primary_len = object.primary_len();
    let head = &proto[..proto.len().min(primary_len)];
    match kind {
        TransitionKind::ReplaceKlass => {},
        TransitionKind::SimpleToSimple | TransitionKind::MixedToSimple => {
            object.reset_primary(proto);
            object.replace_phantom(None);
            let surplus = primary_len - proto.len();
            object.record_filler(if surplus >= vm.config.min_fill_size { surplus } else { 0 });
        },
        TransitionKind::SimpleToMixed | TransitionKind::MixedToMixedRelink => {
            object.reset_primary(head);
            object.replace_phantom(Some(Phantom {
                limit,
                data: proto.to_vec().into_boxed_slice(),
            }));
        },
        TransitionKind::MixedToMixedReallocate => {
            object.reset_primary(head);
            object.with_phantom_mut(|phantom| {
                phantom.limit = limit;
                phantom.data[..proto.len()].copy_from_slice(proto);
                phantom.data[proto.len()..].fill(0);
            });
        },
    }
}

fn retransform(vm: &Vm, object: &HeapObject, step: &Step, mixed: bool) -> Result<()> {
    let pending = object.pending();
    if let (Some(transformer), Some(pending)) = (&step.transformer, pending) {
        let view = ObjectView::new(object, &step.fields);
        if let Err(err) = transformer.transform(&view, &pending.old_values) {
            object.unlock(step.from, mixed);
            return Err(transform_failed(vm, object, &err));
        }
        object.set_pending(None);
    }
    object.unlock(step.target, mixed);
    Ok(())
}

fn transform_failed(vm: &Vm, object: &HeapObject, err: &anyhow::Error) -> UpdateError {
    vm.stats.record_transformer_failure();
    log_event(UpdateEvent::MigrationFailed {
        object: object.id().as_u64(),
        reason: format!("{:#}", err),
    });
    UpdateError::ObjectMigration {
        object: object.id().to_string(),
        reason: format!("transformer failed: {:#}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::MatchedField;
    use crate::model::BasicType;
    use relive_util::ids::ObjectId;
    use relive_util::index_vec::Idx;
    use relive_util::Symbol;

    #[test]
    fn test_select_transition() {
        use TransitionKind::*;
        assert_eq!(TransitionKind::select(false, true, 8, Some(16), 32), ReplaceKlass);
        assert_eq!(TransitionKind::select(true, false, 16, None, 16), SimpleToSimple);
        assert_eq!(TransitionKind::select(true, false, 16, None, 24), SimpleToMixed);
        assert_eq!(TransitionKind::select(true, true, 16, Some(24), 8), MixedToSimple);
        assert_eq!(TransitionKind::select(true, true, 8, Some(24), 24), MixedToMixedReallocate);
        assert_eq!(TransitionKind::select(true, true, 8, Some(16), 24), MixedToMixedRelink);
    }

    #[test]
    fn test_old_image_overlays_phantom() {
        let object = HeapObject::new(ObjectId(1), ClassId::from_usize(1), 8);
        object.store_primary(&[1, 1, 1, 1, 2, 2, 2, 2]);
        let mut data = vec![0u8; 16];
        data[8..12].copy_from_slice(&[3, 3, 3, 3]);
        object.replace_phantom(Some(Phantom {
            limit: 8,
            data: data.into_boxed_slice(),
        }));
        let image = old_image(&object, true);
        assert_eq!(image.len(), 16);
        assert_eq!(&image[..12], &[1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
        assert_eq!(old_image(&object, false).len(), 8);
    }

    #[test]
    fn test_prototype_moves_matched_fields() {
        // old a@0 b@4, new a@0 c@4 b@8
        let plan = LayoutPlan {
            class: Symbol::intern("C"),
            old: ClassId::from_usize(1),
            new: ClassId::from_usize(2),
            ycsc_old: ClassId::from_usize(0),
            ycsc_new: ClassId::from_usize(0),
            old_size: 8,
            new_size: 16,
            min_object_size: 8,
            min_vtable_size: 0,
            instance_fields: vec![
                MatchedField {
                    old_offset: 0,
                    new_offset: 0,
                    ty: BasicType::Int,
                    flags: 0,
                },
                MatchedField {
                    old_offset: 4,
                    new_offset: 8,
                    ty: BasicType::Int,
                    flags: MatchedField::NEW_PHANTOM,
                },
                MatchedField::clear(0, 8),
            ],
            static_fields: Vec::new(),
            inplace_runs: vec![(0, 4)],
            needs_inplace_shape: false,
            needs_stale_shape: true,
            field_checks: Vec::new(),
            new_fields: Vec::new(),
            transformer_args: Vec::new(),
        };
        let image = [7, 0, 0, 0, 9, 0, 0, 0];
        let proto = build_prototype(&plan, &image, 16);
        assert_eq!(&proto[0..4], &[7, 0, 0, 0]);
        assert_eq!(&proto[4..8], &[0, 0, 0, 0], "new field starts zeroed");
        assert_eq!(&proto[8..12], &[9, 0, 0, 0]);
    }
}
