//! Dynamic values.
//!
//! `Value` is the boxed representation every interpreter slot, constant and
//! container element uses. Scalars are stored inline; everything else is an
//! `Arc` so cloning a value is cheap and identity is pointer identity.

use crate::exception::ExceptionObject;
use crate::object::{
    BoundMethod, DictObject, FunctionObject, Instance, LazyImport, ModuleObject, NativeObject,
    Property, StaticMethod, TypeObject,
};
use crate::types::builtin_types;
use ember_bytecode::{CodeObject, Constant};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// A dynamically typed value.
#[derive(Clone)]
pub enum Value {
    None,
    /// Placeholder pushed by `LoadMethod` when no unbound method was found.
    /// Never visible to user code.
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Tuple(Arc<[Value]>),
    List(Arc<ListObject>),
    Dict(Arc<DictObject>),
    Type(Arc<TypeObject>),
    Instance(Arc<Instance>),
    Function(Arc<FunctionObject>),
    BoundMethod(Arc<BoundMethod>),
    Property(Arc<Property>),
    StaticMethod(Arc<StaticMethod>),
    Code(Arc<CodeObject>),
    Exception(Arc<ExceptionObject>),
    Module(Arc<ModuleObject>),
    Lazy(Arc<LazyImport>),
    Native(Arc<dyn NativeObject>),
}

impl Default for Value {
    fn default() -> Self {
        Value::None
    }
}

impl Value {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// String value.
    #[inline]
    pub fn str(s: &str) -> Value {
        Value::Str(Arc::from(s))
    }

    /// Tuple value.
    #[inline]
    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Arc::from(items))
    }

    /// New list.
    #[inline]
    pub fn new_list(items: Vec<Value>) -> Value {
        Value::List(Arc::new(ListObject::new(items)))
    }

    /// New empty dict.
    #[inline]
    pub fn new_dict() -> Value {
        Value::Dict(Arc::new(DictObject::new()))
    }

    /// Wrap a native object.
    #[inline]
    pub fn native<T: NativeObject>(obj: T) -> Value {
        Value::Native(Arc::new(obj))
    }

    /// Convert a compile-time constant.
    pub fn from_constant(c: &Constant) -> Value {
        match c {
            Constant::None => Value::None,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(i) => Value::Int(*i),
            Constant::Float(f) => Value::Float(*f),
            Constant::Str(s) => Value::Str(s.clone()),
            Constant::Tuple(items) => {
                Value::Tuple(items.iter().map(Value::from_constant).collect())
            }
            Constant::Code(code) => Value::Code(code.clone()),
            // Native signatures are only consumed by `InvokeNative`.
            Constant::Native(_) => Value::None,
        }
    }

    // =========================================================================
    // Type Queries
    // =========================================================================

    /// Class of the value.
    pub fn class(&self) -> Arc<TypeObject> {
        let t = builtin_types();
        match self {
            Value::None | Value::Null => t.none_type.clone(),
            Value::Bool(_) => t.bool.clone(),
            Value::Int(_) => t.int.clone(),
            Value::Float(_) => t.float.clone(),
            Value::Str(_) => t.str.clone(),
            Value::Tuple(_) => t.tuple.clone(),
            Value::List(_) => t.list.clone(),
            Value::Dict(_) => t.dict.clone(),
            Value::Type(_) => t.type_.clone(),
            Value::Instance(inst) => inst.class(),
            Value::Function(_) => t.function.clone(),
            Value::BoundMethod(_) => t.method.clone(),
            Value::Property(_) => t.property.clone(),
            Value::StaticMethod(_) => t.staticmethod.clone(),
            Value::Code(_) => t.code.clone(),
            Value::Exception(exc) => exc.class().clone(),
            Value::Module(_) => t.module.clone(),
            Value::Lazy(_) => t.lazy_import.clone(),
            Value::Native(obj) => obj.class(),
        }
    }

    /// Class name, as used in messages.
    pub fn type_name(&self) -> Arc<str> {
        match self {
            Value::Native(obj) => Arc::from(obj.type_name()),
            other => other.class().name().clone(),
        }
    }

    /// Address-like identity for heap values; a stable hash for scalars.
    pub fn identity(&self) -> usize {
        match self {
            Value::None | Value::Null => 0,
            Value::Bool(b) => 1 + *b as usize,
            Value::Int(i) => *i as usize,
            Value::Float(f) => f.to_bits() as usize,
            Value::Str(s) => Arc::as_ptr(s) as *const u8 as usize,
            Value::Tuple(t) => Arc::as_ptr(t) as *const Value as usize,
            Value::List(o) => Arc::as_ptr(o) as usize,
            Value::Dict(o) => Arc::as_ptr(o) as usize,
            Value::Type(o) => Arc::as_ptr(o) as usize,
            Value::Instance(o) => Arc::as_ptr(o) as usize,
            Value::Function(o) => Arc::as_ptr(o) as usize,
            Value::BoundMethod(o) => Arc::as_ptr(o) as usize,
            Value::Property(o) => Arc::as_ptr(o) as usize,
            Value::StaticMethod(o) => Arc::as_ptr(o) as usize,
            Value::Code(o) => Arc::as_ptr(o) as usize,
            Value::Exception(o) => Arc::as_ptr(o) as usize,
            Value::Module(o) => Arc::as_ptr(o) as usize,
            Value::Lazy(o) => Arc::as_ptr(o) as usize,
            Value::Native(o) => Arc::as_ptr(o) as *const () as usize,
        }
    }

    /// `a is b`.
    pub fn is(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::None | Value::Null | Value::Bool(_) | Value::Int(_), _)
            | (Value::Float(_) | Value::Str(_), _) => false,
            _ => {
                std::mem::discriminant(self) == std::mem::discriminant(other)
                    && self.identity() == other.identity()
            }
        }
    }

    /// Truthiness of values whose truth does not require calling user code.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::List(l) => l.len() != 0,
            Value::Dict(d) => !d.is_empty(),
            _ => true,
        }
    }

    /// Whether this is `None`.
    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Integer payload (bools included).
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Float payload, widening ints.
    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(*b as i64 as f64),
            _ => None,
        }
    }

    /// Downcast a native object by reference.
    pub fn downcast_ref<T: NativeObject>(&self) -> Option<&T> {
        match self {
            Value::Native(obj) => obj.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Downcast a native object, sharing ownership.
    pub fn downcast<T: NativeObject>(&self) -> Option<Arc<T>> {
        match self {
            Value::Native(obj) => obj.clone().into_any().downcast::<T>().ok(),
            _ => None,
        }
    }

    /// `repr(value)` for values whose repr does not require user code.
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            other => other.to_string(),
        }
    }
}

/// Structural equality used by `==` for builtin values; heap objects
/// without builtin equality compare by identity.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Float(_), _) | (_, Value::Float(_)) => match (a.as_float(), b.as_float()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        (Value::Int(_) | Value::Bool(_), Value::Int(_) | Value::Bool(_)) => a.as_int() == b.as_int(),
        (Value::Tuple(x), Value::Tuple(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| values_equal(p, q))
        }
        (Value::List(x), Value::List(y)) => {
            let (x, y) = (x.snapshot(), y.snapshot());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| values_equal(p, q))
        }
        _ => a.is(b),
    }
}

fn fmt_float(f: f64, out: &mut fmt::Formatter<'_>) -> fmt::Result {
    if f.is_nan() {
        out.write_str("nan")
    } else if f.is_infinite() {
        out.write_str(if f > 0.0 { "inf" } else { "-inf" })
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        write!(out, "{:.1}", f)
    } else {
        write!(out, "{}", f)
    }
}

fn fmt_seq(items: &[Value], open: &str, close: &str, out: &mut fmt::Formatter<'_>) -> fmt::Result {
    out.write_str(open)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.write_str(", ")?;
        }
        out.write_str(&item.repr())?;
    }
    if open == "(" && items.len() == 1 {
        out.write_str(",")?;
    }
    out.write_str(close)
}

/// `str(value)`.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Null => f.write_str("<NULL>"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => fmt_float(*x, f),
            Value::Str(s) => f.write_str(s),
            Value::Tuple(items) => fmt_seq(items, "(", ")", f),
            Value::List(list) => fmt_seq(&list.snapshot(), "[", "]", f),
            Value::Dict(dict) => {
                f.write_str("{")?;
                for (i, (k, v)) in dict.items().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k.repr(), v.repr())?;
                }
                f.write_str("}")
            }
            Value::Type(t) => write!(f, "<class '{}'>", t.name()),
            Value::Instance(inst) => write!(f, "<{} object>", inst.class().name()),
            Value::Function(func) => write!(f, "<function {}>", func.qualname),
            Value::BoundMethod(m) => write!(f, "<bound method {}>", m.func),
            Value::Property(_) => f.write_str("<property object>"),
            Value::StaticMethod(_) => f.write_str("<staticmethod object>"),
            Value::Code(code) => write!(f, "<code object {}>", code.qualname),
            Value::Exception(exc) => f.write_str(&exc.message()),
            Value::Module(m) => write!(f, "<module '{}'>", m.name),
            Value::Lazy(l) => write!(f, "<lazy import '{}'>", l.name),
            Value::Native(obj) => write!(f, "<{} object>", obj.type_name()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(_) => f.write_str(&self.repr()),
            Value::Exception(exc) => write!(f, "{}({})", exc.class().name(), exc.message()),
            _ => fmt::Display::fmt(self, f),
        }
    }
}

// =============================================================================
// List
// =============================================================================

/// A mutable list.
#[derive(Default)]
pub struct ListObject {
    items: RwLock<Vec<Value>>,
}

impl ListObject {
    /// Create a list.
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items: RwLock::new(items),
        }
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Item at `index`.
    pub fn get(&self, index: usize) -> Option<Value> {
        self.items.read().get(index).cloned()
    }

    /// Replace the item at `index`; returns false when out of range.
    pub fn set(&self, index: usize, value: Value) -> bool {
        let old = {
            let mut items = self.items.write();
            match items.get_mut(index) {
                Some(slot) => std::mem::replace(slot, value),
                None => return false,
            }
        };
        drop(old);
        true
    }

    /// Append an item.
    pub fn push(&self, value: Value) {
        self.items.write().push(value);
    }

    /// Remove and return the last item.
    pub fn pop(&self) -> Option<Value> {
        let item = self.items.write().pop();
        item
    }

    /// Copy of the items.
    pub fn snapshot(&self) -> Vec<Value> {
        self.items.read().clone()
    }
}

impl fmt::Debug for ListObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.read().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::Float(0.5).to_string(), "0.5");
        assert_eq!(Value::tuple(vec![Value::Int(1)]).to_string(), "(1,)");
        assert_eq!(
            Value::new_list(vec![Value::str("a"), Value::None]).to_string(),
            "['a', None]"
        );
    }

    #[test]
    fn test_equality_and_identity() {
        assert!(values_equal(&Value::Int(1), &Value::Float(1.0)));
        assert!(values_equal(&Value::Bool(true), &Value::Int(1)));
        assert!(!values_equal(&Value::str("1"), &Value::Int(1)));
        let l = Value::new_list(vec![]);
        assert!(l.is(&l.clone()));
        assert!(!l.is(&Value::new_list(vec![])));
        assert!(values_equal(&l, &Value::new_list(vec![])));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::None.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::str("x").is_truthy());
        assert!(!Value::tuple(vec![]).is_truthy());
    }

    #[test]
    fn test_class_of_scalars() {
        assert_eq!(&*Value::Int(3).type_name(), "int");
        assert_eq!(&*Value::None.type_name(), "NoneType");
    }
}
