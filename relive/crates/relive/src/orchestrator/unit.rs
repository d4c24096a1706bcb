//! Per-class units of a prepared request

use relive_util::ids::{ClassId, LoaderId, MethodId};
use relive_util::Symbol;
use std::fmt;
use std::sync::Arc;

use super::request::ChangeKind;
use super::ClassState;
use crate::differ::ClassDiff;
use crate::error::UpdateError;
use crate::layout::LayoutPlan;
use crate::migration::Transformer;
use crate::model::UpdatingType;
use crate::version_graph::Narrowing;

/// One class taking part in an update
pub struct ClassUnit {
    pub name: Symbol,
    pub loader: LoaderId,
    pub kind: ChangeKind,
    /// Live version before the update, `None` for an added class
    pub old: Option<ClassId>,
    /// Built version, `None` for a deleted class
    pub new: Option<ClassId>,
    pub updating_type: UpdatingType,
    pub state: ClassState,
    pub diff: Option<ClassDiff>,
    pub plan: Option<Arc<LayoutPlan>>,
    pub narrowing: Narrowing,
    pub transformer: Option<Arc<dyn Transformer>>,
    /// Old methods whose frames block the revision switch
    pub restricted: Vec<MethodId>,
    /// Pulled in because a superclass is modified, not named by the request
    pub implicit: bool,
    pub error: Option<UpdateError>,
}

impl ClassUnit {
    pub(crate) fn new(name: Symbol, loader: LoaderId, kind: ChangeKind, implicit: bool) -> Self {
        ClassUnit {
            name,
            loader,
            kind,
            old: None,
            new: None,
            updating_type: UpdatingType::None,
            state: ClassState::Unprepared,
            diff: None,
            plan: None,
            narrowing: Narrowing::default(),
            transformer: None,
            restricted: Vec::new(),
            implicit,
            error: None,
        }
    }

    pub fn is_changed(&self) -> bool {
        self.updating_type.is_changed()
    }
}

impl fmt::Debug for ClassUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassUnit")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("old", &self.old)
            .field("new", &self.new)
            .field("updating_type", &self.updating_type)
            .field("state", &self.state)
            .field("implicit", &self.implicit)
            .finish()
    }
}

/// Result of the prepare phase, consumed by apply
#[derive(Debug)]
pub struct PreparedRequest {
    /// Units in apply order, supertypes first
    pub units: Vec<ClassUnit>,
    /// Live classes outside the request whose pools name a requested class
    pub relink: Vec<ClassId>,
    /// Registry modification count seen at prepare
    pub modification_count: u64,
    /// Whether field accesses of redefined classes check for stale instances
    pub stale_checks: bool,
    pub from_rn: u64,
}

impl PreparedRequest {
    /// Units that actually change something
    pub fn changed(&self) -> usize {
        self.units.iter().filter(|u| u.is_changed()).count()
    }

    pub fn unit(&self, name: &str) -> Option<&ClassUnit> {
        self.units.iter().find(|u| u.name == name)
    }

    /// Old methods whose frames block the revision switch
    pub fn restricted_methods(&self) -> Vec<MethodId> {
        self.units
            .iter()
            .flat_map(|u| u.restricted.iter().copied())
            .collect()
    }
}
