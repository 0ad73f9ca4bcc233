//! Modules and lazily imported values.

use crate::object::dict::DictObject;
use crate::value::Value;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// A module: a name and its globals.
pub struct ModuleObject {
    /// Module name.
    pub name: Arc<str>,
    /// Module namespace.
    pub dict: Arc<DictObject>,
}

impl ModuleObject {
    /// Create a module with a fresh namespace.
    pub fn new(name: &str) -> Self {
        let dict = DictObject::new();
        dict.set_str("__name__", Value::Str(Arc::from(name)));
        Self {
            name: Arc::from(name),
            dict: Arc::new(dict),
        }
    }
}

impl fmt::Debug for ModuleObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<module '{}'>", self.name)
    }
}

/// A value bound by a lazy import; resolved on first load.
///
/// Resolution calls `loader` with no arguments. The loader may have side
/// effects on other globals, so nothing that reads a namespace ahead of
/// execution may treat a `LazyImport` as its final value.
pub struct LazyImport {
    /// Name the value is bound to.
    pub name: Arc<str>,
    /// Callable receiving the bound name and producing the value.
    pub loader: Value,
    resolved: Mutex<Option<Value>>,
}

impl LazyImport {
    /// Create an unresolved lazy value.
    pub fn new(name: &str, loader: Value) -> Self {
        Self {
            name: Arc::from(name),
            loader,
            resolved: Mutex::new(None),
        }
    }

    /// Resolved value, if the loader already ran.
    pub fn resolved(&self) -> Option<Value> {
        self.resolved.lock().clone()
    }

    /// Record the loader's result.
    pub fn set_resolved(&self, value: Value) {
        *self.resolved.lock() = Some(value);
    }
}

impl fmt::Debug for LazyImport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<lazy import '{}'>", self.name)
    }
}
