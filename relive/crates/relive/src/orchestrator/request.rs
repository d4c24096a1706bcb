//! Update requests
//!
//! A request names classes grouped by defining loader. Each entry says
//! whether the class is modified, added or deleted and, except for
//! deletions, where its new definition comes from.

use relive_util::fx::{FxHashMap, FxIndexMap};
use relive_util::ids::{LoaderId, RequestId};
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, UpdateError};
use crate::migration::Transformer;
use crate::model::{ClassDef, ClassRegistry, UpdatingType};
use crate::runtime::reflection::FieldRemapHint;

/// What the request does to a class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ChangeKind {
    Modified,
    Added,
    Deleted,
}

impl ChangeKind {
    /// Classification a kind implies before diffing, used to reject
    /// conflicting entries for one class
    fn implied_type(self) -> UpdatingType {
        match self {
            ChangeKind::Modified => UpdatingType::Both,
            ChangeKind::Added => UpdatingType::Add,
            ChangeKind::Deleted => UpdatingType::Del,
        }
    }
}

/// Source of a new class definition
pub trait StreamProvider: Send + Sync {
    fn provide(&self, class: &str) -> anyhow::Result<ClassDef>;
}

impl<F> StreamProvider for F
where
    F: Fn(&str) -> anyhow::Result<ClassDef> + Send + Sync,
{
    fn provide(&self, class: &str) -> anyhow::Result<ClassDef> {
        self(class)
    }
}

/// Provider serving definitions held in memory
#[derive(Debug, Clone, Default)]
pub struct MapProvider {
    defs: FxHashMap<String, ClassDef>,
}

impl MapProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, def: ClassDef) {
        self.defs.insert(def.name.clone(), def);
    }

    pub fn with(mut self, def: ClassDef) -> Self {
        self.insert(def);
        self
    }
}

impl StreamProvider for MapProvider {
    fn provide(&self, class: &str) -> anyhow::Result<ClassDef> {
        self.defs
            .get(class)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no definition for {}", class))
    }
}

/// One class named by a request
#[derive(Clone)]
pub struct ClassChange {
    pub name: String,
    pub kind: ChangeKind,
    /// Absent for deletions
    pub provider: Option<Arc<dyn StreamProvider>>,
}

impl fmt::Debug for ClassChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassChange")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("provider", &self.provider.is_some())
            .finish()
    }
}

/// Changes for classes of one defining loader
#[derive(Debug, Clone)]
pub struct LoaderGroup {
    pub loader: LoaderId,
    pub changes: Vec<ClassChange>,
}

/// A live-update request
#[derive(Clone, Default)]
pub struct UpdateRequest {
    /// Assigned on submission
    pub id: RequestId,
    pub groups: Vec<LoaderGroup>,
    pub hints: Vec<FieldRemapHint>,
    /// Custom transformers by class name
    pub transformers: FxIndexMap<String, Arc<dyn Transformer>>,
}

impl fmt::Debug for UpdateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateRequest")
            .field("id", &self.id)
            .field("groups", &self.groups)
            .field("hints", &self.hints)
            .field("transformers", &self.transformers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl UpdateRequest {
    pub fn builder() -> UpdateRequestBuilder {
        UpdateRequestBuilder::default()
    }

    pub fn class_count(&self) -> usize {
        self.groups.iter().map(|g| g.changes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.class_count() == 0
    }

    /// Every change with its loader, conflicting duplicates rejected and
    /// repeated entries collapsed to the last one
    pub(crate) fn validate(&self, registry: &ClassRegistry) -> Result<Vec<(LoaderId, ClassChange)>> {
        if self.is_empty() {
            return Err(UpdateError::EmptyRequest);
        }
        let mut seen: FxIndexMap<(LoaderId, String), ClassChange> = FxIndexMap::default();
        for group in &self.groups {
            for change in &group.changes {
                let key = (group.loader, change.name.clone());
                if let Some(prev) = seen.get(&key) {
                    let (left, right) = (prev.kind.implied_type(), change.kind.implied_type());
                    if left.join(right).is_none() {
                        return Err(UpdateError::InvalidJoin {
                            class: change.name.clone(),
                            left,
                            right,
                        });
                    }
                }
                seen.insert(key, change.clone());
            }
        }

        for ((loader, name), change) in &seen {
            let exists = registry.lookup(*loader, name).is_some();
            match change.kind {
                ChangeKind::Modified | ChangeKind::Deleted if !exists => {
                    return Err(UpdateError::resolution(name, "class is not loaded"));
                },
                ChangeKind::Added if exists => {
                    return Err(UpdateError::InvalidArgument(format!(
                        "class {} is already defined",
                        name
                    )));
                },
                ChangeKind::Modified | ChangeKind::Added if change.provider.is_none() => {
                    return Err(UpdateError::InvalidArgument(format!(
                        "class {} has no definition provider",
                        name
                    )));
                },
                _ => {},
            }
        }
        Ok(seen.into_iter().map(|((loader, _), c)| (loader, c)).collect())
    }
}

/// Builder for [`UpdateRequest`]
///
/// Changes are added to the group of the loader selected last with
/// [`loader`](Self::loader), the boot loader by default.
pub struct UpdateRequestBuilder {
    request: UpdateRequest,
    loader: LoaderId,
}

impl Default for UpdateRequestBuilder {
    fn default() -> Self {
        UpdateRequestBuilder {
            request: UpdateRequest::default(),
            loader: LoaderId::BOOT,
        }
    }
}

impl UpdateRequestBuilder {
    pub fn loader(mut self, loader: LoaderId) -> Self {
        self.loader = loader;
        self
    }

    fn push(mut self, name: &str, kind: ChangeKind, provider: Option<Arc<dyn StreamProvider>>) -> Self {
        let change = ClassChange {
            name: name.to_string(),
            kind,
            provider,
        };
        match self.request.groups.iter_mut().find(|g| g.loader == self.loader) {
            Some(group) => group.changes.push(change),
            None => self.request.groups.push(LoaderGroup {
                loader: self.loader,
                changes: vec![change],
            }),
        }
        self
    }

    pub fn modify(self, name: &str, provider: Arc<dyn StreamProvider>) -> Self {
        self.push(name, ChangeKind::Modified, Some(provider))
    }

    pub fn add(self, name: &str, provider: Arc<dyn StreamProvider>) -> Self {
        self.push(name, ChangeKind::Added, Some(provider))
    }

    pub fn delete(self, name: &str) -> Self {
        self.push(name, ChangeKind::Deleted, None)
    }

    /// Modify a class with an in-memory definition
    pub fn redefine(self, def: ClassDef) -> Self {
        let name = def.name.clone();
        self.modify(&name, Arc::new(MapProvider::new().with(def)))
    }

    /// Add a class with an in-memory definition
    pub fn define(self, def: ClassDef) -> Self {
        let name = def.name.clone();
        self.add(&name, Arc::new(MapProvider::new().with(def)))
    }

    /// Reflective handles to `class.old_field` follow it to `new_field`
    pub fn hint(mut self, class: &str, old_field: &str, new_field: &str) -> Self {
        self.request.hints.push(FieldRemapHint {
            class: class.to_string(),
            old_field: old_field.to_string(),
            new_field: new_field.to_string(),
        });
        self
    }

    pub fn transformer(mut self, class: &str, transformer: Arc<dyn Transformer>) -> Self {
        self.request.transformers.insert(class.to_string(), transformer);
        self
    }

    pub fn build(self) -> UpdateRequest {
        self.request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ClassRegistry {
        let mut reg = ClassRegistry::new(8);
        reg.define(ClassDef::new("A"), LoaderId::BOOT, 0).unwrap();
        reg
    }

    #[test]
    fn test_empty_request() {
        let request = UpdateRequest::builder().build();
        assert!(matches!(request.validate(&registry()), Err(UpdateError::EmptyRequest)));
    }

    #[test]
    fn test_conflicting_kinds_rejected() {
        let request = UpdateRequest::builder()
            .redefine(ClassDef::new("A"))
            .delete("A")
            .build();
        assert!(matches!(
            request.validate(&registry()),
            Err(UpdateError::InvalidJoin { .. })
        ));
    }

    #[test]
    fn test_repeated_entry_collapses() {
        let request = UpdateRequest::builder()
            .redefine(ClassDef::new("A"))
            .redefine(ClassDef::new("A").field("x", "I"))
            .build();
        let changes = request.validate(&registry()).unwrap();
        assert_eq!(changes.len(), 1);
        let def = changes[0].1.provider.as_ref().unwrap().provide("A").unwrap();
        assert_eq!(def.fields.len(), 1);
    }

    #[test]
    fn test_unknown_and_duplicate_classes() {
        let reg = registry();
        let missing = UpdateRequest::builder().delete("Nope").build();
        assert!(matches!(
            missing.validate(&reg),
            Err(UpdateError::ClassResolution { .. })
        ));
        let twice = UpdateRequest::builder().define(ClassDef::new("A")).build();
        assert!(matches!(twice.validate(&reg), Err(UpdateError::InvalidArgument(_))));
    }

    #[test]
    fn test_builder_groups_by_loader() {
        let request = UpdateRequest::builder()
            .delete("A")
            .loader(LoaderId(3))
            .delete("B")
            .loader(LoaderId::BOOT)
            .delete("C")
            .build();
        assert_eq!(request.groups.len(), 2);
        assert_eq!(request.groups[0].changes.len(), 2);
        assert_eq!(request.class_count(), 3);
    }
}
