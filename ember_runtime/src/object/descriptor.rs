//! Builtin descriptors.

use crate::value::Value;

/// `property(fget, fset)`: always a data descriptor.
#[derive(Debug, Clone)]
pub struct Property {
    /// Getter, called with the instance.
    pub getter: Option<Value>,
    /// Setter, called with the instance and the new value.
    pub setter: Option<Value>,
}

/// `staticmethod(func)`: returns `func` unbound from both instances and classes.
#[derive(Debug, Clone)]
pub struct StaticMethod {
    /// Wrapped callable.
    pub func: Value,
}
