//! Class registry
//!
//! Arena of every class version and method ever built, plus the dictionary
//! mapping `(loader, name)` to the live version. The registry is mutated
//! only by class definition and by the coordinator inside an update pause.
//!
//! ## Layout rules
//!
//! Instance fields are laid out after the superclass footprint in
//! declaration order, each aligned to its own size. The instance size is
//! rounded up to the object alignment. Statics live in a per-class area with
//! offsets starting at zero.
//!
//! ```text
//! class C { int a; int b; }          a@0 b@4          size 8
//! class C { int a; int c; int b; }   a@0 c@4 b@8      size 16
//! ```

use parking_lot::Mutex;
use relive_util::fx::FxIndexMap;
use relive_util::ids::{ClassId, LoaderId, MethodId};
use relive_util::index_vec::IndexVec;
use relive_util::symbol::sym;
use relive_util::Symbol;
use std::sync::Arc;

use super::constant_pool::ConstantPool;
use super::def::ClassDef;
use super::klass::{FieldInfo, Klass, KlassFlags, TransformLevel, UpdateState, ALIVE};
use super::method::{Method, MethodFlags};
use super::types::{AccessFlags, BasicType};
use crate::error::{Result, UpdateError};

pub struct ClassRegistry {
    classes: IndexVec<ClassId, Klass>,
    methods: IndexVec<MethodId, Method>,
    dictionary: FxIndexMap<(LoaderId, Symbol), ClassId>,
    /// Bumped on every dictionary change
    modification_count: u64,
    alignment: usize,
    root: ClassId,
}

impl ClassRegistry {
    /// Create a registry holding only the root class
    pub fn new(alignment: usize) -> Self {
        let mut registry = ClassRegistry {
            classes: IndexVec::new(),
            methods: IndexVec::new(),
            dictionary: FxIndexMap::default(),
            modification_count: 0,
            alignment,
            root: ClassId(0),
        };
        let root_def = ClassDef {
            name: sym::OBJECT.as_str().to_string(),
            super_name: None,
            interfaces: Vec::new(),
            access: AccessFlags::new(AccessFlags::PUBLIC),
            fields: Vec::new(),
            methods: Vec::new(),
            constants: Vec::new(),
        };
        // the root has no super to resolve, so building cannot fail
        if let Ok(root) = registry.build(Arc::new(root_def), LoaderId::BOOT, |_, _| None) {
            registry.root = root;
            registry.classes[root].flags.set(KlassFlags::INITIALIZED);
            registry.install(root);
        }
        registry
    }

    #[inline]
    pub fn root(&self) -> ClassId {
        self.root
    }

    #[inline]
    pub fn klass(&self, id: ClassId) -> &Klass {
        &self.classes[id]
    }

    #[inline]
    pub fn klass_mut(&mut self, id: ClassId) -> &mut Klass {
        &mut self.classes[id]
    }

    pub fn try_klass(&self, id: ClassId) -> Result<&Klass> {
        self.classes
            .get(id)
            .ok_or_else(|| UpdateError::InvalidArgument(format!("unknown class {}", id)))
    }

    #[inline]
    pub fn method(&self, id: MethodId) -> &Method {
        &self.methods[id]
    }

    #[inline]
    pub fn method_mut(&mut self, id: MethodId) -> &mut Method {
        &mut self.methods[id]
    }

    pub fn try_method(&self, id: MethodId) -> Result<&Method> {
        self.methods
            .get(id)
            .ok_or_else(|| UpdateError::InvalidArgument(format!("unknown method {}", id)))
    }

    pub(crate) fn pick2_mut(&mut self, a: ClassId, b: ClassId) -> (&mut Klass, &mut Klass) {
        self.classes.pick2_mut(a, b)
    }

    pub fn classes(&self) -> impl Iterator<Item = &Klass> {
        self.classes.iter()
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    #[inline]
    pub fn modification_count(&self) -> u64 {
        self.modification_count
    }

    /// Live classes in definition order
    pub fn live_classes(&self) -> impl Iterator<Item = ClassId> + '_ {
        self.dictionary.values().copied()
    }

    /// Find the live version of `name`, falling back to the boot loader
    pub fn lookup(&self, loader: LoaderId, name: &str) -> Option<ClassId> {
        self.lookup_symbol(loader, Symbol::intern(name))
    }

    pub fn lookup_symbol(&self, loader: LoaderId, name: Symbol) -> Option<ClassId> {
        self.dictionary
            .get(&(loader, name))
            .or_else(|| self.dictionary.get(&(LoaderId::BOOT, name)))
            .copied()
    }

    /// Build a class version from its definition without making it live
    ///
    /// `resolve` maps the names of the superclass and interfaces to class
    /// ids. The new version is not entered in the dictionary or in its
    /// superclass' subclass list.
    pub fn build<F>(&mut self, def: Arc<ClassDef>, loader: LoaderId, resolve: F) -> Result<ClassId>
    where
        F: Fn(&ClassRegistry, &str) -> Option<ClassId>,
    {
        let super_class = match &def.super_name {
            Some(name) => Some(resolve(self, name).ok_or_else(|| {
                UpdateError::resolution(&def.name, format!("superclass {} not found", name))
            })?),
            None => None,
        };
        let mut local_interfaces = Vec::with_capacity(def.interfaces.len());
        for name in &def.interfaces {
            let id = resolve(self, name).ok_or_else(|| {
                UpdateError::resolution(&def.name, format!("interface {} not found", name))
            })?;
            if !self.classes[id].is_interface() {
                return Err(UpdateError::resolution(
                    &def.name,
                    format!("{} is not an interface", name),
                ));
            }
            local_interfaces.push(id);
        }
        if let Some(s) = super_class {
            if self.classes[s].is_interface() {
                return Err(UpdateError::resolution(
                    &def.name,
                    format!("superclass {} is an interface", self.classes[s].name),
                ));
            }
        }

        let super_size = super_class.map_or(0, |s| self.classes[s].instance_size);
        let (fields, instance_end, static_size) = layout_fields(&def, super_size)?;
        let instance_size = align_up(instance_end, self.alignment);

        let mut interfaces: Vec<ClassId> = super_class
            .map(|s| self.classes[s].interfaces.clone())
            .unwrap_or_default();
        for &local in &local_interfaces {
            for id in std::iter::once(local).chain(self.classes[local].interfaces.iter().copied()) {
                if !interfaces.contains(&id) {
                    interfaces.push(id);
                }
            }
        }

        let id = self.classes.next_index();
        let mut methods = Vec::with_capacity(def.methods.len());
        for m in &def.methods {
            let mid = self.methods.next_index();
            methods.push(self.methods.push(Method {
                id: mid,
                holder: id,
                name: Symbol::intern(&m.name),
                sig: Symbol::intern(&m.sig),
                access: m.access,
                max_locals: m.max_locals,
                code: Arc::from(m.code.as_slice()),
                vtable_index: None,
                flags: MethodFlags::default(),
            }));
        }

        let pushed = self.classes.push(Klass {
            id,
            name: Symbol::intern(&def.name),
            loader,
            access: def.access,
            super_class,
            local_interfaces,
            interfaces,
            fields,
            instance_size,
            static_size,
            methods,
            vtable: Vec::new(),
            constants: Arc::new(ConstantPool::new(def.constants.clone())),
            def: Arc::clone(&def),
            statics: Arc::new(Mutex::new(vec![0u8; static_size].into_boxed_slice())),
            subclasses: Vec::new(),
            flags: KlassFlags::default(),
            update_state: UpdateState::None,
            born_rn: 0,
            dead_rn: ALIVE,
            previous_version: None,
            next_version: None,
            plan: None,
            transform_level: TransformLevel::None,
            transformer: None,
            inplace_shape: None,
            stale_shape: None,
        });
        debug_assert_eq!(pushed, id);
        self.relink_vtable(id)?;
        Ok(id)
    }

    /// Build a class against the live dictionary and make it live at `rn`
    pub fn define(&mut self, def: ClassDef, loader: LoaderId, rn: u64) -> Result<ClassId> {
        if self.dictionary.contains_key(&(loader, Symbol::intern(&def.name))) {
            return Err(UpdateError::InvalidArgument(format!(
                "class {} already defined",
                def.name
            )));
        }
        let id = self.build(Arc::new(def), loader, |reg, name| reg.lookup(loader, name))?;
        let klass = &mut self.classes[id];
        klass.born_rn = rn;
        klass.flags.set(KlassFlags::INITIALIZED);
        self.install(id);
        Ok(id)
    }

    /// Enter `id` in the dictionary and in its superclass' subclass list
    pub(crate) fn install(&mut self, id: ClassId) {
        let (loader, name, super_class) = {
            let k = &self.classes[id];
            (k.loader, k.name, k.super_class)
        };
        self.dictionary.insert((loader, name), id);
        if let Some(s) = super_class {
            let subs = &mut self.classes[s].subclasses;
            if !subs.contains(&id) {
                subs.push(id);
            }
        }
        self.modification_count += 1;
    }

    /// Remove `id` from the dictionary if it is the live entry
    pub(crate) fn uninstall(&mut self, id: ClassId) {
        let (loader, name, super_class) = {
            let k = &self.classes[id];
            (k.loader, k.name, k.super_class)
        };
        if self.dictionary.get(&(loader, name)) == Some(&id) {
            self.dictionary.shift_remove(&(loader, name));
            self.modification_count += 1;
        }
        if let Some(s) = super_class {
            self.classes[s].subclasses.retain(|&c| c != id);
        }
    }

    /// Replace `old` by `new` in every subclass list and in the dictionary
    pub(crate) fn replace_live(&mut self, old: ClassId, new: ClassId) {
        if let Some(s) = self.classes[old].super_class {
            self.classes[s].subclasses.retain(|&c| c != old);
        }
        self.install(new);
    }

    /// Append a class built elsewhere (shape descriptors)
    pub(crate) fn push_klass<F>(&mut self, make: F) -> ClassId
    where
        F: FnOnce(ClassId) -> Klass,
    {
        let id = self.classes.next_index();
        self.classes.push(make(id))
    }

    /// Superclasses of `id`, nearest first
    pub fn super_chain(&self, id: ClassId) -> Vec<ClassId> {
        let mut chain = Vec::new();
        let mut cur = self.classes[id].super_class;
        while let Some(c) = cur {
            chain.push(c);
            cur = self.classes[c].super_class;
        }
        chain
    }

    /// Every transitive subclass of `id` currently linked in the hierarchy
    pub fn all_subclasses(&self, id: ClassId) -> Vec<ClassId> {
        let mut out = Vec::new();
        let mut work = self.classes[id].subclasses.clone();
        while let Some(c) = work.pop() {
            if !out.contains(&c) {
                out.push(c);
                work.extend(self.classes[c].subclasses.iter().copied());
            }
        }
        out
    }

    pub fn is_subtype(&self, sub: ClassId, sup: ClassId) -> bool {
        if sub == sup {
            return true;
        }
        let k = &self.classes[sub];
        if k.interfaces.contains(&sup) {
            return true;
        }
        self.super_chain(sub).contains(&sup)
    }

    /// Look a field up in `class` and its superclasses
    pub fn find_field(&self, class: ClassId, name: Symbol, sig: Symbol) -> Option<(ClassId, &FieldInfo)> {
        let mut cur = Some(class);
        while let Some(c) = cur {
            let k = &self.classes[c];
            if let Some(f) = k.own_field(name, sig) {
                return Some((c, f));
            }
            cur = k.super_class;
        }
        None
    }

    /// Instance fields of `class` including inherited ones, root first
    pub fn instance_field_table(&self, class: ClassId) -> Vec<FieldInfo> {
        let mut chain = self.super_chain(class);
        chain.reverse();
        chain.push(class);
        chain
            .into_iter()
            .flat_map(|c| self.classes[c].instance_fields().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn own_method(&self, class: ClassId, name: Symbol, sig: Symbol) -> Option<MethodId> {
        self.classes[class]
            .methods
            .iter()
            .copied()
            .find(|&m| self.methods[m].name == name && self.methods[m].sig == sig)
    }

    /// Look a method up in `class`, its superclasses, then its interfaces
    pub fn find_method(&self, class: ClassId, name: Symbol, sig: Symbol) -> Option<MethodId> {
        let mut cur = Some(class);
        while let Some(c) = cur {
            if let Some(m) = self.own_method(c, name, sig) {
                return Some(m);
            }
            cur = self.classes[c].super_class;
        }
        self.classes[class]
            .interfaces
            .iter()
            .find_map(|&i| self.own_method(i, name, sig))
    }

    /// Virtual dispatch by name and signature on a receiver class
    pub fn lookup_virtual(&self, receiver: ClassId, name: Symbol, sig: Symbol) -> Option<MethodId> {
        let k = &self.classes[receiver];
        k.vtable
            .iter()
            .rev()
            .copied()
            .find(|&m| self.methods[m].name == name && self.methods[m].sig == sig)
            .or_else(|| self.find_method(receiver, name, sig))
    }

    /// Compute the vtable of `class` from its superclass' current vtable
    ///
    /// Overriding a method the superclass declares final is a link error.
    pub fn compute_vtable(&self, class: ClassId) -> Result<Vec<MethodId>> {
        let k = &self.classes[class];
        if k.is_interface() {
            return Ok(Vec::new());
        }
        let mut vtable = k
            .super_class
            .map(|s| self.classes[s].vtable.clone())
            .unwrap_or_default();
        for &m in &k.methods {
            let method = &self.methods[m];
            if !method.is_virtual() {
                continue;
            }
            match vtable
                .iter()
                .position(|&v| self.methods[v].same_signature(method))
            {
                Some(slot) => {
                    let overridden = &self.methods[vtable[slot]];
                    if overridden.access.is_final() && overridden.holder != class {
                        return Err(UpdateError::resolution(
                            k.name,
                            format!(
                                "{} overrides final method of {}",
                                method,
                                self.classes[overridden.holder].name
                            ),
                        ));
                    }
                    vtable[slot] = m;
                },
                None => vtable.push(m),
            }
        }
        Ok(vtable)
    }

    /// Recompute and store the vtable of `class`
    pub(crate) fn relink_vtable(&mut self, class: ClassId) -> Result<()> {
        let vtable = self.compute_vtable(class)?;
        for (slot, &m) in vtable.iter().enumerate() {
            if self.methods[m].holder == class {
                self.methods[m].vtable_index = Some(slot);
            }
        }
        self.classes[class].vtable = vtable;
        Ok(())
    }
}

/// Lay out the declared fields of `def` after `super_size` bytes
///
/// Returns the fields, the unaligned end of the instance area, and the size
/// of the static area.
fn layout_fields(def: &ClassDef, super_size: usize) -> Result<(Vec<FieldInfo>, usize, usize)> {
    let mut fields = Vec::with_capacity(def.fields.len());
    let mut instance_end = super_size;
    let mut static_end = 0;
    for f in &def.fields {
        let ty = BasicType::from_signature(&f.sig).ok_or_else(|| {
            UpdateError::resolution(&def.name, format!("bad signature {} for {}", f.sig, f.name))
        })?;
        let cursor = if f.access.is_static() {
            &mut static_end
        } else {
            &mut instance_end
        };
        let offset = align_up(*cursor, ty.size());
        *cursor = offset + ty.size();
        fields.push(FieldInfo {
            name: Symbol::intern(&f.name),
            sig: Symbol::intern(&f.sig),
            access: f.access,
            ty,
            offset,
            checks: 0,
        });
    }
    Ok((fields, instance_end, static_end))
}

#[inline]
pub(crate) fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}
