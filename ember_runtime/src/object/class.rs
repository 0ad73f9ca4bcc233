//! Type objects.
//!
//! A `TypeObject` represents a builtin or user-defined class. It contains:
//! - The class name
//! - Base classes and the cached C3 method resolution order
//! - Class attributes (methods, descriptors, class variables)
//! - A version tag consulted by inline caches
//! - The shared key layout used by split instance dicts
//!
//! # Versioning
//!
//! ```text
//!   mutation of C.__dict__ / C.__bases__
//!            │
//!            ▼
//!   C.version  ← fresh tag ──┐
//!   D.version  ← fresh tag   │ for every live subclass D of C
//!   E.version  ← fresh tag ──┘
//! ```
//!
//! Tags come from a single process-wide counter and are never reused, so a
//! cache that recorded `(type id, version)` can validate itself with two
//! integer comparisons.

use crate::exception::{PyErr, PyResult};
use crate::object::dict::SharedKeys;
use crate::object::next_object_id;
use crate::value::Value;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

// =============================================================================
// Version Tags
// =============================================================================

static NEXT_VERSION_TAG: AtomicU64 = AtomicU64::new(1);

#[inline]
fn next_version_tag() -> u64 {
    NEXT_VERSION_TAG.fetch_add(1, Ordering::Relaxed)
}

// =============================================================================
// Class Flags
// =============================================================================

bitflags::bitflags! {
    /// Flags describing class capabilities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ClassFlags: u32 {
        /// Defined at run time rather than by the runtime itself.
        const HEAPTYPE = 1 << 0;
        /// May be used as a base class.
        const BASETYPE = 1 << 1;
        /// Instances carry an attribute dict.
        const HAS_DICT = 1 << 2;
    }
}

/// Storage layout of instances created from a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceLayout {
    /// Builtin value without a generic instance representation.
    Builtin,
    /// `Instance` with an attribute dict.
    Plain,
    /// `ExceptionObject`.
    Exception,
}

// =============================================================================
// Type Object
// =============================================================================

/// A class.
pub struct TypeObject {
    id: u64,
    name: Arc<str>,
    module: Arc<str>,
    flags: ClassFlags,
    layout: InstanceLayout,
    bases: RwLock<Vec<Arc<TypeObject>>>,
    /// MRO without the type itself (it cannot hold a strong ref to itself).
    mro_tail: RwLock<Arc<[Arc<TypeObject>]>>,
    dict: RwLock<FxHashMap<Arc<str>, Value>>,
    version: AtomicU64,
    subclasses: Mutex<Vec<Weak<TypeObject>>>,
    shared_keys: RwLock<Arc<SharedKeys>>,
}

/// Error produced when a consistent MRO cannot be built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Cannot create a consistent method resolution order (MRO) for bases {bases}")]
pub struct MroError {
    /// Comma-separated names of the conflicting bases.
    pub bases: String,
}

impl TypeObject {
    /// Create the root `object` type.
    pub(crate) fn new_root(name: &str) -> Arc<Self> {
        Arc::new(Self::raw(
            name,
            "builtins",
            ClassFlags::BASETYPE,
            InstanceLayout::Plain,
            Vec::new(),
            Arc::from(Vec::new()),
        ))
    }

    fn raw(
        name: &str,
        module: &str,
        flags: ClassFlags,
        layout: InstanceLayout,
        bases: Vec<Arc<TypeObject>>,
        mro_tail: Arc<[Arc<TypeObject>]>,
    ) -> Self {
        Self {
            id: next_object_id(),
            name: Arc::from(name),
            module: Arc::from(module),
            flags,
            layout,
            bases: RwLock::new(bases),
            mro_tail: RwLock::new(mro_tail),
            dict: RwLock::new(FxHashMap::default()),
            version: AtomicU64::new(next_version_tag()),
            subclasses: Mutex::new(Vec::new()),
            shared_keys: RwLock::new(Arc::new(SharedKeys::new())),
        }
    }

    /// Create a builtin type with a single base.
    pub(crate) fn new_builtin(
        name: &str,
        base: &Arc<TypeObject>,
        layout: InstanceLayout,
        basetype: bool,
    ) -> Arc<Self> {
        let mut flags = ClassFlags::empty();
        if basetype {
            flags |= ClassFlags::BASETYPE;
        }
        let bases = vec![base.clone()];
        let mro = compute_mro(&bases).unwrap_or_default();
        let ty = Arc::new(Self::raw(name, "builtins", flags, layout, bases, mro.into()));
        base.subclasses.lock().push(Arc::downgrade(&ty));
        ty
    }

    /// Create a heap type from its bases and namespace.
    ///
    /// An empty `bases` list means `(object,)`.
    pub fn new_class(
        name: &str,
        module: &str,
        bases: Vec<Arc<TypeObject>>,
        namespace: Vec<(Arc<str>, Value)>,
    ) -> PyResult<Arc<Self>> {
        let bases = if bases.is_empty() {
            vec![crate::types::builtin_types().object.clone()]
        } else {
            bases
        };
        for base in &bases {
            if !base.flags.contains(ClassFlags::BASETYPE) {
                return Err(PyErr::type_error(format!(
                    "type '{}' is not an acceptable base type",
                    base.name
                )));
            }
        }
        let layout = solid_layout(&bases)?;
        let mro = compute_mro(&bases).map_err(|e| PyErr::type_error(e.to_string()))?;
        let ty = Arc::new(Self::raw(
            name,
            module,
            ClassFlags::HEAPTYPE | ClassFlags::BASETYPE | ClassFlags::HAS_DICT,
            layout,
            bases,
            mro.into(),
        ));
        {
            let mut dict = ty.dict.write();
            for (key, value) in namespace {
                dict.insert(key, value);
            }
        }
        for base in ty.bases.read().iter() {
            base.subclasses.lock().push(Arc::downgrade(&ty));
        }
        Ok(ty)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Unique identity.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Class name.
    #[inline]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Defining module name.
    #[inline]
    pub fn module(&self) -> &Arc<str> {
        &self.module
    }

    /// Class flags.
    #[inline]
    pub fn flags(&self) -> ClassFlags {
        self.flags
    }

    /// Instance layout.
    #[inline]
    pub fn layout(&self) -> InstanceLayout {
        self.layout
    }

    /// Current version tag.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Direct bases.
    pub fn bases(&self) -> Vec<Arc<TypeObject>> {
        self.bases.read().clone()
    }

    /// Full MRO, starting with `this`.
    pub fn mro(this: &Arc<TypeObject>) -> Vec<Arc<TypeObject>> {
        let tail = this.mro_tail.read().clone();
        let mut mro = Vec::with_capacity(tail.len() + 1);
        mro.push(this.clone());
        mro.extend(tail.iter().cloned());
        mro
    }

    /// Shared key layout for split instance dicts.
    #[inline]
    pub fn shared_keys(&self) -> Arc<SharedKeys> {
        self.shared_keys.read().clone()
    }

    // =========================================================================
    // Attribute Lookup
    // =========================================================================

    /// Look up `name` in this type's own dict.
    #[inline]
    pub fn get_own(&self, name: &str) -> Option<Value> {
        self.dict.read().get(name).cloned()
    }

    /// Look up `name` along the MRO.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.get_own(name) {
            return Some(v);
        }
        let tail = self.mro_tail.read().clone();
        tail.iter().find_map(|base| base.get_own(name))
    }

    /// Snapshot of the type's own attributes.
    pub fn own_attributes(&self) -> Vec<(Arc<str>, Value)> {
        self.dict
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Whether `other` appears in this type's MRO.
    pub fn is_subtype(&self, other: &TypeObject) -> bool {
        if self.id == other.id {
            return true;
        }
        self.mro_tail.read().iter().any(|t| t.id == other.id)
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Set a class attribute, invalidating caches that trust this type.
    pub fn set_attr(&self, name: &str, value: Value) -> PyResult<()> {
        self.check_mutable(name)?;
        self.dict.write().insert(Arc::from(name), value);
        self.modified();
        Ok(())
    }

    /// Delete a class attribute.
    pub fn del_attr(&self, name: &str) -> PyResult<()> {
        self.check_mutable(name)?;
        let removed = self.dict.write().remove(name);
        match removed {
            Some(_) => {
                self.modified();
                Ok(())
            }
            None => Err(PyErr::attribute_error(format!(
                "type object '{}' has no attribute '{}'",
                self.name, name
            ))),
        }
    }

    /// Populate a builtin type during bootstrap.
    pub(crate) fn set_builtin_attr(&self, name: &str, value: Value) {
        self.dict.write().insert(Arc::from(name), value);
        self.modified();
    }

    fn check_mutable(&self, name: &str) -> PyResult<()> {
        if self.flags.contains(ClassFlags::HEAPTYPE) {
            Ok(())
        } else {
            Err(PyErr::type_error(format!(
                "cannot set '{}' attribute of immutable type '{}'",
                name, self.name
            )))
        }
    }

    /// Replace the base classes, recomputing the MRO of this type and all of
    /// its subclasses.
    pub fn set_bases(this: &Arc<TypeObject>, new_bases: Vec<Arc<TypeObject>>) -> PyResult<()> {
        if !this.flags.contains(ClassFlags::HEAPTYPE) {
            return Err(PyErr::type_error(format!(
                "cannot set '__bases__' attribute of immutable type '{}'",
                this.name
            )));
        }
        if new_bases.is_empty() {
            return Err(PyErr::type_error(format!(
                "can only assign non-empty tuple to {}.__bases__, not ()",
                this.name
            )));
        }
        for base in &new_bases {
            if base.is_subtype(this) {
                return Err(PyErr::type_error(
                    "a __bases__ item causes an inheritance cycle",
                ));
            }
        }
        if solid_layout(&new_bases)? != this.layout() {
            return Err(PyErr::type_error(format!(
                "__bases__ assignment: '{}' object layout differs",
                this.name
            )));
        }
        let mro = compute_mro(&new_bases).map_err(|e| PyErr::type_error(e.to_string()))?;

        let old_bases = std::mem::replace(&mut *this.bases.write(), new_bases.clone());
        for old in &old_bases {
            old.subclasses
                .lock()
                .retain(|w| w.upgrade().map_or(false, |t| t.id != this.id));
        }
        for base in &new_bases {
            base.subclasses.lock().push(Arc::downgrade(this));
        }
        *this.mro_tail.write() = mro.into();
        for sub in this.live_subclasses() {
            sub.recompute_mro_recursive();
        }
        this.modified();
        tracing::debug!(class = %this.name, bases = new_bases.len(), "bases reassigned");
        Ok(())
    }

    fn recompute_mro_recursive(&self) {
        let bases = self.bases();
        if let Ok(mro) = compute_mro(&bases) {
            *self.mro_tail.write() = mro.into();
        }
        for sub in self.live_subclasses() {
            sub.recompute_mro_recursive();
        }
    }

    /// Live subclasses.
    pub fn live_subclasses(&self) -> Vec<Arc<TypeObject>> {
        let mut subs = self.subclasses.lock();
        subs.retain(|w| w.strong_count() > 0);
        subs.iter().filter_map(Weak::upgrade).collect()
    }

    /// Assign fresh version tags to this type and every subclass.
    pub fn modified(&self) {
        self.version.store(next_version_tag(), Ordering::Release);
        for sub in self.live_subclasses() {
            sub.modified();
        }
    }
}

impl fmt::Debug for TypeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<class '{}'>", self.name)
    }
}

/// Instance layout implied by a list of bases.
fn solid_layout(bases: &[Arc<TypeObject>]) -> PyResult<InstanceLayout> {
    let mut layout = InstanceLayout::Plain;
    for base in bases {
        match base.layout() {
            InstanceLayout::Plain => {}
            InstanceLayout::Exception => {
                if layout == InstanceLayout::Plain {
                    layout = InstanceLayout::Exception;
                }
            }
            InstanceLayout::Builtin => {
                return Err(PyErr::type_error(format!(
                    "type '{}' is not an acceptable base type",
                    base.name
                )))
            }
        }
    }
    Ok(layout)
}

// =============================================================================
// C3 Linearization
// =============================================================================

/// Compute the MRO tail (everything after the new class itself) for a class
/// with the given bases.
pub fn compute_mro(bases: &[Arc<TypeObject>]) -> Result<Vec<Arc<TypeObject>>, MroError> {
    let mut sequences: Vec<Vec<Arc<TypeObject>>> = bases.iter().map(TypeObject::mro).collect();
    sequences.push(bases.to_vec());

    let mut result: Vec<Arc<TypeObject>> = Vec::new();
    loop {
        sequences.retain(|s| !s.is_empty());
        if sequences.is_empty() {
            return Ok(result);
        }
        let candidate = sequences.iter().find_map(|seq| {
            let head = &seq[0];
            let in_tail = sequences
                .iter()
                .any(|other| other[1..].iter().any(|t| t.id == head.id));
            (!in_tail).then(|| head.clone())
        });
        let Some(next) = candidate else {
            let names: Vec<&str> = bases.iter().map(|b| &*b.name).collect();
            return Err(MroError {
                bases: names.join(", "),
            });
        };
        for seq in &mut sequences {
            if seq[0].id == next.id {
                seq.remove(0);
            }
        }
        result.push(next);
    }
}
