//! Differ - classify an (old, new) class pair
//!
//! The classification is the join of independent signals:
//!
//! | Signal                                   | Contribution               |
//! |------------------------------------------|----------------------------|
//! | superclass replaced by its new version   | the superclass' type       |
//! | superclass deleted or renamed            | BOTH                       |
//! | local interface count differs            | BOTH                       |
//! | one interface replaced                   | the interface's type       |
//! | class access flags differ                | BOTH                       |
//! | instance fields differ                   | BOTH                       |
//! | static fields differ                     | STATIC_FIELD               |
//! | method added, deleted or flags changed   | METHOD / STATIC_METHOD     |
//! | method body changed                      | BODY_CHANGE                |
//!
//! Methods are matched with a merge over both method lists ordered by name.
//! Overloads of one name are matched by signature with a forward search
//! that swaps the match into place, so matched pairs share an index.

use relive_util::ids::{ClassId, MethodId};
use std::cmp::Ordering;

use crate::error::{Result, UpdateError};
use crate::model::{bytecode, ClassRegistry, FieldInfo, Klass, MethodUpdate, UpdatingType};

/// Fate of one old method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodMatch {
    pub old: MethodId,
    /// Matched method of the new version
    pub new: Option<MethodId>,
    pub kind: MethodUpdate,
}

/// Result of classifying one class pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDiff {
    pub updating_type: UpdatingType,
    /// One entry per old method
    pub methods: Vec<MethodMatch>,
    /// Methods only present in the new version
    pub added: Vec<MethodId>,
}

impl ClassDiff {
    pub fn matched_new(&self, old: MethodId) -> Option<MethodId> {
        self.methods.iter().find(|m| m.old == old).and_then(|m| m.new)
    }

    pub fn count(&self, kind: MethodUpdate) -> usize {
        if kind == MethodUpdate::Added {
            return self.added.len();
        }
        self.methods.iter().filter(|m| m.kind == kind).count()
    }
}

struct Accumulator<'a> {
    class: &'a str,
    current: UpdatingType,
}

impl Accumulator<'_> {
    fn join(&mut self, t: UpdatingType) -> Result<()> {
        self.current = self.current.join(t).ok_or_else(|| UpdateError::InvalidJoin {
            class: self.class.to_string(),
            left: self.current,
            right: t,
        })?;
        Ok(())
    }
}

/// Classify `old` against `new`
///
/// `updating_type_of` reports the classification of a class that takes part
/// in the same update, keyed by its old version. Supertypes are expected to
/// be classified already.
pub fn classify<F>(
    registry: &ClassRegistry,
    old: ClassId,
    new: ClassId,
    updating_type_of: F,
) -> Result<ClassDiff>
where
    F: Fn(ClassId) -> Option<UpdatingType>,
{
    let old_k = registry.klass(old);
    let new_k = registry.klass(new);
    let name = old_k.name.as_str();
    let mut acc = Accumulator {
        class: name,
        current: UpdatingType::None,
    };

    compare_supertype(registry, old_k.super_class, new_k.super_class, &updating_type_of, &mut acc)?;

    if old_k.local_interfaces.len() != new_k.local_interfaces.len() {
        acc.join(UpdatingType::Both)?;
    } else {
        for (&o, &n) in old_k.local_interfaces.iter().zip(&new_k.local_interfaces) {
            compare_supertype(registry, Some(o), Some(n), &updating_type_of, &mut acc)?;
        }
    }

    if old_k.access != new_k.access {
        acc.join(UpdatingType::Both)?;
    }

    acc.join(compare_fields(old_k, new_k))?;

    let (methods, added) = merge_methods(registry, old_k, new_k, &mut acc)?;

    log::trace!("{} classified as {}", name, acc.current);
    Ok(ClassDiff {
        updating_type: acc.current,
        methods,
        added,
    })
}

fn compare_supertype<F>(
    registry: &ClassRegistry,
    old: Option<ClassId>,
    new: Option<ClassId>,
    updating_type_of: &F,
    acc: &mut Accumulator<'_>,
) -> Result<()>
where
    F: Fn(ClassId) -> Option<UpdatingType>,
{
    let (o, n) = match (old, new) {
        (Some(o), Some(n)) if o == n => return Ok(()),
        (Some(o), Some(n)) => (o, n),
        (None, None) => return Ok(()),
        _ => return acc.join(UpdatingType::Both),
    };
    if registry.klass(o).name != registry.klass(n).name {
        return acc.join(UpdatingType::Both);
    }
    match updating_type_of(o) {
        Some(UpdatingType::Del) | None => acc.join(UpdatingType::Both),
        Some(t) => acc.join(t),
    }
}

fn field_differs(a: &FieldInfo, b: &FieldInfo) -> bool {
    a.name != b.name || a.sig != b.sig || a.access != b.access || a.offset != b.offset
}

fn compare_fields(old: &Klass, new: &Klass) -> UpdatingType {
    let old_inst: Vec<_> = old.instance_fields().collect();
    let new_inst: Vec<_> = new.instance_fields().collect();
    if old_inst.len() != new_inst.len()
        || old_inst.iter().zip(&new_inst).any(|(a, b)| field_differs(a, b))
        || old.instance_size != new.instance_size
    {
        return UpdatingType::Both;
    }
    let old_static: Vec<_> = old.static_fields().collect();
    let new_static: Vec<_> = new.static_fields().collect();
    if old_static.len() != new_static.len()
        || old_static.iter().zip(&new_static).any(|(a, b)| field_differs(a, b))
    {
        return UpdatingType::StaticField;
    }
    UpdatingType::None
}

/// Methods of `k` ordered by name, overloads in declaration order
fn sorted_methods(registry: &ClassRegistry, k: &Klass) -> Vec<MethodId> {
    let mut methods = k.methods.clone();
    methods.sort_by(|&a, &b| registry.method(a).name.cmp_str(registry.method(b).name));
    methods
}

fn method_kind_type(registry: &ClassRegistry, m: MethodId) -> UpdatingType {
    if registry.method(m).is_static() {
        UpdatingType::StaticMethod
    } else {
        UpdatingType::Method
    }
}

fn merge_methods(
    registry: &ClassRegistry,
    old_k: &Klass,
    new_k: &Klass,
    acc: &mut Accumulator<'_>,
) -> Result<(Vec<MethodMatch>, Vec<MethodId>)> {
    let old_methods = sorted_methods(registry, old_k);
    let mut new_methods = sorted_methods(registry, new_k);
    let mut matches = Vec::with_capacity(old_methods.len());
    let mut added = Vec::new();

    let (mut oi, mut ni) = (0, 0);
    loop {
        let outcome = match (old_methods.get(oi), new_methods.get(ni)) {
            (None, None) => break,
            (None, Some(_)) => Merge::Added,
            (Some(_), None) => Merge::Deleted,
            (Some(&o), Some(&n)) => {
                let (om, nm) = (registry.method(o), registry.method(n));
                if om.name != nm.name {
                    match om.name.cmp_str(nm.name) {
                        Ordering::Greater => Merge::Added,
                        _ => Merge::Deleted,
                    }
                } else if om.sig == nm.sig {
                    Merge::Matched
                } else {
                    // search forward through the overloads of this name
                    let mut outcome = Merge::Deleted;
                    for nj in ni + 1..new_methods.len() {
                        let candidate = registry.method(new_methods[nj]);
                        if candidate.name != om.name {
                            break;
                        }
                        if candidate.sig == om.sig {
                            new_methods.swap(ni, nj);
                            outcome = Merge::Matched;
                            break;
                        }
                    }
                    outcome
                }
            },
        };

        match outcome {
            Merge::Matched => {
                let (o, n) = (old_methods[oi], new_methods[ni]);
                let (om, nm) = (registry.method(o), registry.method(n));
                if om.access != nm.access {
                    acc.join(method_kind_type(registry, o))?;
                }
                let same_body = bytecode::equivalent(
                    &om.code,
                    old_k.constants.entries(),
                    &nm.code,
                    new_k.constants.entries(),
                );
                let kind = if same_body {
                    MethodUpdate::None
                } else {
                    acc.join(UpdatingType::BodyChange)?;
                    log::trace!("body of {}.{} changed", old_k.name, om);
                    MethodUpdate::BodyChanged
                };
                matches.push(MethodMatch {
                    old: o,
                    new: Some(n),
                    kind,
                });
                oi += 1;
                ni += 1;
            },
            Merge::Added => {
                let n = new_methods[ni];
                acc.join(method_kind_type(registry, n))?;
                added.push(n);
                ni += 1;
            },
            Merge::Deleted => {
                let o = old_methods[oi];
                acc.join(method_kind_type(registry, o))?;
                matches.push(MethodMatch {
                    old: o,
                    new: None,
                    kind: MethodUpdate::Deleted,
                });
                oi += 1;
            },
        }
    }
    Ok((matches, added))
}

#[derive(Clone, Copy)]
enum Merge {
    Matched,
    Added,
    Deleted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Assembler, ClassDef};
    use relive_util::ids::LoaderId;
    use std::sync::Arc;

    /// Define `old` live, then build `new` as a scratch version
    fn pair(old: ClassDef, new: ClassDef) -> (ClassRegistry, ClassId, ClassId) {
        let mut reg = ClassRegistry::new(8);
        let o = reg.define(old, LoaderId::BOOT, 0).unwrap();
        let n = reg
            .build(Arc::new(new), LoaderId::BOOT, |r, name| r.lookup(LoaderId::BOOT, name))
            .unwrap();
        (reg, o, n)
    }

    fn returning(def: &mut ClassDef, value: i8) -> Vec<u8> {
        Assembler::new(def).iconst(value).ireturn().finish()
    }

    fn with_get(name: &str, value: i8) -> ClassDef {
        let mut def = ClassDef::new(name).field("a", "I");
        let code = returning(&mut def, value);
        def.method("get", "()I", code)
    }

    #[test]
    fn test_identical_is_none() {
        let (reg, o, n) = pair(with_get("C", 1), with_get("C", 1));
        let diff = classify(&reg, o, n, |_| None).unwrap();
        assert_eq!(diff.updating_type, UpdatingType::None);
        assert_eq!(diff.count(MethodUpdate::None), 1);
    }

    #[test]
    fn test_body_change() {
        let (reg, o, n) = pair(with_get("C", 1), with_get("C", 2));
        let diff = classify(&reg, o, n, |_| None).unwrap();
        assert_eq!(diff.updating_type, UpdatingType::BodyChange);
        assert_eq!(diff.methods[0].kind, MethodUpdate::BodyChanged);
        assert!(diff.methods[0].new.is_some());
    }

    #[test]
    fn test_field_insert_is_both() {
        let old = ClassDef::new("C").field("a", "I").field("b", "I");
        let new = ClassDef::new("C").field("a", "I").field("c", "I").field("b", "I");
        let (reg, o, n) = pair(old, new);
        assert_eq!(classify(&reg, o, n, |_| None).unwrap().updating_type, UpdatingType::Both);
    }

    #[test]
    fn test_static_only_changes() {
        let old = ClassDef::new("C").static_field("s", "I");
        let new = ClassDef::new("C").static_field("s", "I").static_field("t", "J");
        let (reg, o, n) = pair(old, new);
        assert_eq!(
            classify(&reg, o, n, |_| None).unwrap().updating_type,
            UpdatingType::StaticField
        );

        let mut old = ClassDef::new("C");
        let code = returning(&mut old, 1);
        let old = old.static_method("f", "()I", code.clone());
        let new = ClassDef::new("C")
            .static_method("f", "()I", code.clone())
            .static_method("g", "()I", code);
        let (reg, o, n) = pair(old, new);
        let diff = classify(&reg, o, n, |_| None).unwrap();
        assert_eq!(diff.updating_type, UpdatingType::StaticMethod);
        assert_eq!(diff.added.len(), 1);
    }

    #[test]
    fn test_overload_lookahead() {
        let old = ClassDef::new("C")
            .method("m", "(I)V", vec![0xb1])
            .method("m", "(J)V", vec![0xb1]);
        let new = ClassDef::new("C")
            .method("m", "(J)V", vec![0xb1])
            .method("m", "(I)V", vec![0xb1]);
        let (reg, o, n) = pair(old, new);
        let diff = classify(&reg, o, n, |_| None).unwrap();
        assert_eq!(diff.updating_type, UpdatingType::None);
        for m in &diff.methods {
            let new = m.new.unwrap();
            assert_eq!(reg.method(m.old).sig, reg.method(new).sig);
        }
    }

    #[test]
    fn test_added_and_deleted_by_name_order() {
        let old = ClassDef::new("C").method("alpha", "()V", vec![0xb1]);
        let new = ClassDef::new("C").method("beta", "()V", vec![0xb1]);
        let (reg, o, n) = pair(old, new);
        let diff = classify(&reg, o, n, |_| None).unwrap();
        assert_eq!(diff.updating_type, UpdatingType::Method);
        assert_eq!(diff.count(MethodUpdate::Deleted), 1);
        assert_eq!(diff.count(MethodUpdate::Added), 1);
    }

    #[test]
    fn test_super_contribution() {
        let mut reg = ClassRegistry::new(8);
        let b_old = reg.define(ClassDef::new("B").field("x", "I"), LoaderId::BOOT, 0).unwrap();
        let e_old = reg.define(ClassDef::new("E").extends("B"), LoaderId::BOOT, 0).unwrap();
        let b_new = reg
            .build(
                Arc::new(ClassDef::new("B").field("x", "I").method("m", "()V", vec![0xb1])),
                LoaderId::BOOT,
                |r, name| r.lookup(LoaderId::BOOT, name),
            )
            .unwrap();
        let e_new = reg
            .build(Arc::new(ClassDef::new("E").extends("B")), LoaderId::BOOT, |r, name| {
                if name == "B" {
                    Some(b_new)
                } else {
                    r.lookup(LoaderId::BOOT, name)
                }
            })
            .unwrap();
        let diff = classify(&reg, e_old, e_new, |c| (c == b_old).then_some(UpdatingType::Method))
            .unwrap();
        assert_eq!(diff.updating_type, UpdatingType::Method);

        let deleted = classify(&reg, e_old, e_new, |c| (c == b_old).then_some(UpdatingType::Del))
            .unwrap();
        assert_eq!(deleted.updating_type, UpdatingType::Both);
    }

    #[test]
    fn test_deterministic() {
        let old = with_get("C", 1).method("z", "()V", vec![0xb1]);
        let new = with_get("C", 3).field("q", "J");
        let (reg, o, n) = pair(old, new);
        let first = classify(&reg, o, n, |_| None).unwrap();
        for _ in 0..10 {
            assert_eq!(classify(&reg, o, n, |_| None).unwrap(), first);
        }
    }
}
