//! Object model.
//!
//! - [`TypeObject`] - classes with version tags and C3 MRO
//! - [`DictObject`] - split/combined dicts with versions and watch hooks
//! - [`Instance`] - instances of heap types
//! - [`FunctionObject`] / [`BoundMethod`] - callables
//! - [`Property`] / [`StaticMethod`] - builtin descriptors
//! - [`ModuleObject`] / [`LazyImport`] - namespaces
//! - [`NativeObject`] - hook for objects defined by the VM itself

pub mod class;
pub mod descriptor;
pub mod dict;
pub mod function;
pub mod instance;
pub mod module;

pub use class::{compute_mro, ClassFlags, InstanceLayout, MroError, TypeObject};
pub use descriptor::{Property, StaticMethod};
pub use dict::{DictKey, DictObject, SharedKeys};
pub use function::{BoundMethod, FrameMode, FunctionFlags, FunctionObject};
pub use instance::Instance;
pub use module::{LazyImport, ModuleObject};

use crate::value::Value;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique object id.
#[inline]
pub fn next_object_id() -> u64 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// An object implemented outside the core object model (generators,
/// frames, iterators, builtin callables).
pub trait NativeObject: Any + Send + Sync + fmt::Debug {
    /// Type name used in messages.
    fn type_name(&self) -> &'static str;

    /// Class of the object.
    fn class(&self) -> Arc<TypeObject> {
        crate::types::builtin_types().object.clone()
    }

    /// Read-only attribute access.
    fn get_attr(&self, _name: &str) -> Option<Value> {
        None
    }

    /// Visit every object reference held by this object.
    fn traverse(&self, _visit: &mut dyn FnMut(&Value)) {}

    /// Upcast for downcasting by reference.
    fn as_any(&self) -> &dyn Any;

    /// Upcast for downcasting shared ownership.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}
