//! Version graph
//!
//! Orders the classes of a request so every class is prepared after its
//! superclass and interfaces, and computes the type-narrowing marks of a
//! redefinition whose supertype set shrinks.
//!
//! Classification propagation itself happens in the differ, which asks for
//! the updating type of each supertype it finds replaced. Preparing in
//! dependency order guarantees that answer exists.

use relive_util::ids::ClassId;
use relive_util::Symbol;

use crate::error::{Result, UpdateError};
use crate::layout::youngest_common_ancestor;
use crate::model::{ClassRegistry, KlassFlags};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    Unvisited,
    InProgress,
    Done,
}

/// Order `names.len()` nodes so that every node follows its dependencies
///
/// A dependency cycle is a resolution error naming a class on the cycle.
pub fn prepare_order<F>(names: &[Symbol], deps: F) -> Result<Vec<usize>>
where
    F: Fn(usize) -> Vec<usize>,
{
    let mut visit = vec![Visit::Unvisited; names.len()];
    let mut order = Vec::with_capacity(names.len());
    for root in 0..names.len() {
        if visit[root] != Visit::Unvisited {
            continue;
        }
        // explicit stack of (node, dependencies, next dependency)
        let mut stack = vec![(root, deps(root), 0usize)];
        visit[root] = Visit::InProgress;
        while let Some((node, node_deps, next)) = stack.last_mut() {
            if let Some(&dep) = node_deps.get(*next) {
                *next += 1;
                match visit[dep] {
                    Visit::Done => {},
                    Visit::InProgress => {
                        return Err(UpdateError::resolution(
                            names[dep],
                            "circular superclass or interface dependency",
                        ));
                    },
                    Visit::Unvisited => {
                        visit[dep] = Visit::InProgress;
                        let d = deps(dep);
                        stack.push((dep, d, 0));
                    },
                }
            } else {
                let node = *node;
                visit[node] = Visit::Done;
                order.push(node);
                stack.pop();
            }
        }
    }
    Ok(order)
}

/// Narrowing marks of one redefinition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Narrowing {
    /// The new version lost a supertype the old one had
    pub type_narrowed: bool,
    /// Old superclasses below the youngest common ancestor
    pub super_of_stale: Vec<ClassId>,
    /// Types whose dynamic checks must account for narrowing
    pub relevant: Vec<ClassId>,
}

impl Narrowing {
    pub fn is_empty(&self) -> bool {
        !self.type_narrowed && self.relevant.is_empty()
    }

    fn mark(&mut self, id: ClassId) {
        if !self.relevant.contains(&id) {
            self.relevant.push(id);
        }
    }
}

/// Compute the narrowing marks for `old` replaced by `new`
///
/// `successor` maps a class replaced by the same request to its new version.
pub fn narrowing<F>(registry: &ClassRegistry, old: ClassId, new: ClassId, successor: F) -> Narrowing
where
    F: Fn(ClassId) -> Option<ClassId>,
{
    let mut marks = Narrowing::default();
    let Some((ycsc_old, ycsc_new)) = youngest_common_ancestor(registry, old, new) else {
        return marks;
    };

    for s in registry.super_chain(old) {
        if s == ycsc_old {
            break;
        }
        marks.type_narrowed = true;
        marks.super_of_stale.push(s);
        marks.mark(successor(s).unwrap_or(s));
    }
    for s in registry.super_chain(new) {
        if s == ycsc_new {
            break;
        }
        marks.mark(s);
    }

    let old_k = registry.klass(old);
    let new_k = registry.klass(new);
    let named = |ids: &[ClassId], name: Symbol| ids.iter().any(|&i| registry.klass(i).name == name);
    for &i in &old_k.interfaces {
        if !named(&new_k.interfaces, registry.klass(i).name) {
            marks.type_narrowed = true;
            marks.mark(successor(i).unwrap_or(i));
        }
    }
    for &i in &new_k.interfaces {
        if !named(&old_k.interfaces, registry.klass(i).name) {
            marks.mark(i);
        }
    }
    marks
}

/// Record `marks` on the classes they name
pub(crate) fn apply_marks(registry: &mut ClassRegistry, new: ClassId, marks: &Narrowing) {
    if marks.type_narrowed {
        registry.klass_mut(new).flags.set(KlassFlags::TYPE_NARROWED);
    }
    for &s in &marks.super_of_stale {
        registry.klass_mut(s).flags.set(KlassFlags::SUPER_OF_STALE);
    }
    for &r in &marks.relevant {
        registry.klass_mut(r).flags.set(KlassFlags::NARROWING_RELEVANT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClassDef;
    use relive_util::ids::LoaderId;
    use std::sync::Arc;

    fn syms(names: &[&str]) -> Vec<Symbol> {
        names.iter().map(|n| Symbol::intern(n)).collect()
    }

    #[test]
    fn test_order_puts_supers_first() {
        // 0 extends 1, 1 extends 2, 3 implements 2
        let names = syms(&["C", "B", "A", "D"]);
        let deps = |i: usize| match i {
            0 => vec![1],
            1 => vec![2],
            3 => vec![2],
            _ => vec![],
        };
        let order = prepare_order(&names, deps).unwrap();
        let pos = |n: usize| order.iter().position(|&x| x == n).unwrap();
        assert!(pos(2) < pos(1));
        assert!(pos(1) < pos(0));
        assert!(pos(2) < pos(3));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_cycle_rejected() {
        let names = syms(&["X", "Y"]);
        let err = prepare_order(&names, |i| vec![1 - i]).unwrap_err();
        assert!(matches!(err, UpdateError::ClassResolution { .. }));
    }

    #[test]
    fn test_narrowing_marks() {
        let mut reg = ClassRegistry::new(8);
        let i = reg.define(ClassDef::interface("I"), LoaderId::BOOT, 0).unwrap();
        let a = reg.define(ClassDef::new("A"), LoaderId::BOOT, 0).unwrap();
        let b = reg.define(ClassDef::new("B").extends("A"), LoaderId::BOOT, 0).unwrap();
        let old = reg
            .define(ClassDef::new("C").extends("B").implements("I"), LoaderId::BOOT, 0)
            .unwrap();
        let new = reg
            .build(Arc::new(ClassDef::new("C").extends("A")), LoaderId::BOOT, |r, n| {
                r.lookup(LoaderId::BOOT, n)
            })
            .unwrap();

        let marks = narrowing(&reg, old, new, |_| None);
        assert!(marks.type_narrowed);
        assert_eq!(marks.super_of_stale, vec![b]);
        assert!(marks.relevant.contains(&b));
        assert!(marks.relevant.contains(&i));
        assert!(!marks.relevant.contains(&a));

        apply_marks(&mut reg, new, &marks);
        assert!(reg.klass(new).flags.has(KlassFlags::TYPE_NARROWED));
        assert!(reg.klass(b).flags.has(KlassFlags::SUPER_OF_STALE));
    }

    #[test]
    fn test_widening_is_not_narrowing() {
        let mut reg = ClassRegistry::new(8);
        reg.define(ClassDef::interface("I"), LoaderId::BOOT, 0).unwrap();
        let old = reg.define(ClassDef::new("C"), LoaderId::BOOT, 0).unwrap();
        let new = reg
            .build(Arc::new(ClassDef::new("C").implements("I")), LoaderId::BOOT, |r, n| {
                r.lookup(LoaderId::BOOT, n)
            })
            .unwrap();
        let marks = narrowing(&reg, old, new, |_| None);
        assert!(!marks.type_narrowed);
        assert_eq!(marks.relevant.len(), 1);
    }
}
