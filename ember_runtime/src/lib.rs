//! Ember runtime object model.
//!
//! Values, classes, dicts, functions and exceptions shared by the
//! interpreter and the JIT.

pub mod exception;
pub mod finalize;
pub mod object;
pub mod types;
pub mod value;
pub mod watch;

pub use exception::{ExceptionObject, PyErr, PyResult, TracebackEntry};
pub use object::{
    BoundMethod, ClassFlags, DictKey, DictObject, FrameMode, FunctionFlags, FunctionObject,
    Instance, InstanceLayout, LazyImport, ModuleObject, NativeObject, Property, SharedKeys,
    StaticMethod, TypeObject,
};
pub use types::{builtin_types, BuiltinTypes};
pub use value::{values_equal, ListObject, Value};
pub use watch::{DictEvent, DictWatcher};
