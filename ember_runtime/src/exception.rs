//! Exception objects and the error type of the runtime.
//!
//! Every fallible runtime operation returns [`PyResult`]. The error carries
//! a live exception object so that `except` clauses, chaining and
//! tracebacks work the same whether the error came from the interpreter,
//! compiled code or a runtime helper.

use crate::object::{DictObject, TypeObject};
use crate::types::builtin_types;
use crate::value::Value;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Result of a runtime operation.
pub type PyResult<T> = Result<T, PyErr>;

/// One traceback line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracebackEntry {
    pub filename: Arc<str>,
    pub qualname: Arc<str>,
    pub lineno: u32,
}

// =============================================================================
// Exception Object
// =============================================================================

/// A raised (or raisable) exception instance.
pub struct ExceptionObject {
    class: Arc<TypeObject>,
    /// Constructor arguments.
    pub args: Arc<[Value]>,
    dict: Arc<DictObject>,
    cause: Mutex<Option<Arc<ExceptionObject>>>,
    context: Mutex<Option<Arc<ExceptionObject>>>,
    suppress_context: AtomicBool,
    traceback: Mutex<Vec<TracebackEntry>>,
}

impl ExceptionObject {
    /// Create an exception of `class` with `args`.
    pub fn new(class: Arc<TypeObject>, args: Vec<Value>) -> Self {
        Self {
            class,
            args: Arc::from(args),
            dict: Arc::new(DictObject::new()),
            cause: Mutex::new(None),
            context: Mutex::new(None),
            suppress_context: AtomicBool::new(false),
            traceback: Mutex::new(Vec::new()),
        }
    }

    /// Exception class.
    #[inline]
    pub fn class(&self) -> &Arc<TypeObject> {
        &self.class
    }

    /// Attribute namespace.
    #[inline]
    pub fn dict(&self) -> &Arc<DictObject> {
        &self.dict
    }

    /// `str(exc)`.
    pub fn message(&self) -> String {
        match &*self.args {
            [] => String::new(),
            [one] => one.to_string(),
            many => Value::Tuple(Arc::from(many)).to_string(),
        }
    }

    /// Whether this exception is an instance of `class`.
    #[inline]
    pub fn matches(&self, class: &TypeObject) -> bool {
        self.class.is_subtype(class)
    }

    /// `StopIteration.value`: the first argument, or `None`.
    pub fn value(&self) -> Value {
        self.args.first().cloned().unwrap_or(Value::None)
    }

    /// `__cause__`.
    pub fn cause(&self) -> Option<Arc<ExceptionObject>> {
        self.cause.lock().clone()
    }

    /// Set `__cause__` (also sets `__suppress_context__`).
    pub fn set_cause(&self, cause: Option<Arc<ExceptionObject>>) {
        *self.cause.lock() = cause;
        self.suppress_context.store(true, Ordering::Relaxed);
    }

    /// `__context__`.
    pub fn context(&self) -> Option<Arc<ExceptionObject>> {
        self.context.lock().clone()
    }

    /// Set `__context__`, refusing to create a cycle.
    pub fn set_context(self: &Arc<Self>, context: Arc<ExceptionObject>) {
        let mut cursor = Some(context.clone());
        while let Some(exc) = cursor {
            if Arc::ptr_eq(&exc, self) {
                return;
            }
            cursor = exc.context();
        }
        *self.context.lock() = Some(context);
    }

    /// `__suppress_context__`.
    pub fn suppress_context(&self) -> bool {
        self.suppress_context.load(Ordering::Relaxed)
    }

    /// Append a traceback entry (innermost last).
    pub fn push_traceback(&self, entry: TracebackEntry) {
        self.traceback.lock().push(entry);
    }

    /// Traceback, outermost frame first.
    pub fn traceback(&self) -> Vec<TracebackEntry> {
        let mut tb = self.traceback.lock().clone();
        tb.reverse();
        tb
    }
}

impl fmt::Debug for ExceptionObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.class.name(), self.message())
    }
}

// =============================================================================
// PyErr
// =============================================================================

/// A runtime error carrying an exception object.
#[derive(Clone)]
pub struct PyErr(pub Arc<ExceptionObject>);

macro_rules! constructors {
    ($($(#[$doc:meta])* $fn_name:ident => $field:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $fn_name(msg: impl Into<String>) -> PyErr {
                PyErr::new(builtin_types().$field.clone(), msg)
            }
        )*
    };
}

impl PyErr {
    /// Error of `class` with a message.
    pub fn new(class: Arc<TypeObject>, msg: impl Into<String>) -> PyErr {
        let msg: String = msg.into();
        let args = if msg.is_empty() {
            Vec::new()
        } else {
            vec![Value::Str(Arc::from(msg))]
        };
        PyErr(Arc::new(ExceptionObject::new(class, args)))
    }

    /// Wrap an existing exception.
    #[inline]
    pub fn from_exception(exc: Arc<ExceptionObject>) -> PyErr {
        PyErr(exc)
    }

    constructors! {
        /// `TypeError`.
        type_error => type_error;
        /// `AttributeError`.
        attribute_error => attribute_error;
        /// `RuntimeError`.
        runtime_error => runtime_error;
        /// `ValueError`.
        value_error => value_error;
        /// `NameError`.
        name_error => name_error;
        /// `UnboundLocalError`.
        unbound_local => unbound_local_error;
        /// `KeyError`.
        key_error => key_error;
        /// `IndexError`.
        index_error => index_error;
        /// `ZeroDivisionError`.
        zero_division => zero_division_error;
        /// `OverflowError`.
        overflow => overflow_error;
        /// `RecursionError`.
        recursion_error => recursion_error;
        /// `NotImplementedError`.
        not_implemented => not_implemented_error;
        /// `ImportError`.
        import_error => import_error;
        /// `AssertionError`.
        assertion_error => assertion_error;
    }

    /// `StopIteration(value)`.
    pub fn stop_iteration(value: Value) -> PyErr {
        let args = if value.is_none() { Vec::new() } else { vec![value] };
        PyErr(Arc::new(ExceptionObject::new(
            builtin_types().stop_iteration.clone(),
            args,
        )))
    }

    /// `StopAsyncIteration`.
    pub fn stop_async_iteration() -> PyErr {
        PyErr::new(builtin_types().stop_async_iteration.clone(), "")
    }

    /// `GeneratorExit`.
    pub fn generator_exit() -> PyErr {
        PyErr::new(builtin_types().generator_exit.clone(), "")
    }

    /// The exception object.
    #[inline]
    pub fn exception(&self) -> &Arc<ExceptionObject> {
        &self.0
    }

    /// The exception as a value.
    #[inline]
    pub fn to_value(&self) -> Value {
        Value::Exception(self.0.clone())
    }

    /// `str(exc)`.
    #[inline]
    pub fn message(&self) -> String {
        self.0.message()
    }

    /// Whether the exception is an instance of `class`.
    #[inline]
    pub fn matches(&self, class: &TypeObject) -> bool {
        self.0.matches(class)
    }

    /// Whether this is a `StopIteration`.
    #[inline]
    pub fn is_stop_iteration(&self) -> bool {
        self.matches(&builtin_types().stop_iteration)
    }
}

impl fmt::Display for PyErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = self.0.message();
        if msg.is_empty() {
            write!(f, "{}", self.0.class.name())
        } else {
            write!(f, "{}: {}", self.0.class.name(), msg)
        }
    }
}

impl fmt::Debug for PyErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PyErr({})", self)
    }
}

impl std::error::Error for PyErr {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(PyErr::type_error("bad").to_string(), "TypeError: bad");
        assert_eq!(PyErr::generator_exit().to_string(), "GeneratorExit");
        assert_eq!(
            PyErr::stop_iteration(Value::Int(3)).exception().value().as_int(),
            Some(3)
        );
    }

    #[test]
    fn test_hierarchy_matching() {
        let t = builtin_types();
        let err = PyErr::key_error("k");
        assert!(err.matches(&t.lookup_error));
        assert!(err.matches(&t.exception));
        assert!(!err.matches(&t.index_error));
        assert!(PyErr::generator_exit().matches(&t.base_exception));
        assert!(!PyErr::generator_exit().matches(&t.exception));
    }

    #[test]
    fn test_context_cycle_is_refused() {
        let a = PyErr::value_error("a").0;
        let b = PyErr::value_error("b").0;
        b.set_context(a.clone());
        a.set_context(b.clone());
        assert!(a.context().is_none());
        assert!(Arc::ptr_eq(&b.context().unwrap(), &a));
    }
}
