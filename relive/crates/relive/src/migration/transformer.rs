//! Custom per-object transformers
//!
//! A transformer runs against a half-migrated instance after the default
//! structural copy. It names the old fields it wants as inputs; their values
//! are read from the object before it changes shape and handed over in the
//! same order.

use anyhow::{anyhow, bail};
use relive_util::ids::ObjectId;
use std::fmt;
use std::sync::Arc;

use crate::heap::HeapObject;
use crate::model::{FieldInfo, Value};

/// User callback completing the migration of one instance
pub trait Transformer: Send + Sync {
    /// Old instance fields passed to [`Transformer::transform`], by name
    fn inputs(&self) -> &[String] {
        &[]
    }

    /// Finish migrating `object`
    ///
    /// `old` holds the values of [`Transformer::inputs`] as they were before
    /// the update. An error leaves the object in its stale shape; the call is
    /// repeated on the next access.
    fn transform(&self, object: &ObjectView<'_>, old: &[Value]) -> anyhow::Result<()>;
}

/// Transformer backed by a closure
pub struct FnTransformer<F> {
    inputs: Vec<String>,
    func: F,
}

impl<F> FnTransformer<F>
where
    F: Fn(&ObjectView<'_>, &[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(inputs: &[&str], func: F) -> Self {
        FnTransformer {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            func,
        }
    }

    pub fn shared(inputs: &[&str], func: F) -> Arc<dyn Transformer> {
        Arc::new(Self::new(inputs, func))
    }
}

impl<F> Transformer for FnTransformer<F>
where
    F: Fn(&ObjectView<'_>, &[Value]) -> anyhow::Result<()> + Send + Sync,
{
    fn inputs(&self) -> &[String] {
        &self.inputs
    }

    fn transform(&self, object: &ObjectView<'_>, old: &[Value]) -> anyhow::Result<()> {
        (self.func)(object, old)
    }
}

impl<F> fmt::Debug for FnTransformer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTransformer").field("inputs", &self.inputs).finish()
    }
}

/// Field access to an instance under migration, in the new layout
pub struct ObjectView<'a> {
    object: &'a HeapObject,
    fields: &'a [FieldInfo],
}

impl<'a> ObjectView<'a> {
    pub(crate) fn new(object: &'a HeapObject, fields: &'a [FieldInfo]) -> Self {
        ObjectView { object, fields }
    }

    pub fn id(&self) -> ObjectId {
        self.object.id()
    }

    fn field(&self, name: &str) -> Option<&FieldInfo> {
        // subclass fields shadow superclass fields of the same name
        self.fields.iter().rev().find(|f| f.name == name)
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.field(name).map(|f| self.object.read(f.offset, f.ty))
    }

    pub fn set(&self, name: &str, value: Value) -> anyhow::Result<()> {
        let field = self
            .field(name)
            .ok_or_else(|| anyhow!("no field {} in new layout", name))?;
        if value.basic_type() != field.ty {
            bail!(
                "field {} has type {:?}, got {:?}",
                name,
                field.ty,
                value.basic_type()
            );
        }
        self.object.write(field.offset, field.ty, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessFlags, BasicType};
    use relive_util::ids::ClassId;
    use relive_util::Symbol;

    fn int_field(name: &str, offset: usize) -> FieldInfo {
        FieldInfo {
            name: Symbol::intern(name),
            sig: Symbol::intern("I"),
            access: AccessFlags::new(AccessFlags::PRIVATE),
            ty: BasicType::Int,
            offset,
            checks: 0,
        }
    }

    #[test]
    fn test_closure_transformer() {
        let object = HeapObject::new(ObjectId(1), ClassId(3), 8);
        let fields = vec![int_field("a", 0), int_field("sum", 4)];
        let view = ObjectView::new(&object, &fields);

        let t = FnTransformer::new(&["a", "b"], |view, old| {
            let sum = old.iter().filter_map(|v| v.as_int()).sum();
            view.set("sum", Value::Int(sum))
        });
        assert_eq!(t.inputs(), &["a".to_string(), "b".to_string()]);
        t.transform(&view, &[Value::Int(2), Value::Int(3)]).unwrap();
        assert_eq!(view.get("sum"), Some(Value::Int(5)));
    }

    #[test]
    fn test_set_checks_type_and_name() {
        let object = HeapObject::new(ObjectId(1), ClassId(3), 8);
        let fields = vec![int_field("a", 0)];
        let view = ObjectView::new(&object, &fields);
        assert!(view.set("a", Value::Long(1)).is_err());
        assert!(view.set("missing", Value::Int(1)).is_err());
        assert!(view.get("missing").is_none());
    }
}
