//! Builtin functions, the builtins namespace and methods of builtin types.

use crate::attr;
use crate::generator;
use crate::iterator::RangeIterator;
use crate::jit_module;
use crate::ops::{self, IterStep};
use crate::vm::Vm;
use ember_runtime::{
    builtin_types, DictObject, ExceptionObject, Instance, InstanceLayout, ModuleObject,
    NativeObject, Property, PyErr, PyResult, StaticMethod, TypeObject, Value,
};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Builtin Function Objects
// =============================================================================

/// Signature of every builtin. Bound builtins receive their receiver as the
/// first argument.
pub type BuiltinFn = fn(&mut Vm, Vec<Value>) -> PyResult<Value>;

/// A function implemented by the VM.
pub struct BuiltinFunction {
    name: Arc<str>,
    func: BuiltinFn,
    receiver: Option<Value>,
}

impl BuiltinFunction {
    /// Unbound builtin.
    pub fn new(name: &str, func: BuiltinFn) -> Self {
        Self {
            name: Arc::from(name),
            func,
            receiver: None,
        }
    }

    /// Unbound builtin as a value.
    pub fn value(name: &str, func: BuiltinFn) -> Value {
        Value::native(Self::new(name, func))
    }

    /// Builtin bound to `receiver`.
    pub fn bound(name: &str, func: BuiltinFn, receiver: Value) -> Value {
        Value::native(Self {
            name: Arc::from(name),
            func,
            receiver: Some(receiver),
        })
    }

    #[inline]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Call with `args`, prepending the receiver of a bound builtin.
    pub fn call(&self, vm: &mut Vm, mut args: Vec<Value>) -> PyResult<Value> {
        if let Some(receiver) = &self.receiver {
            args.insert(0, receiver.clone());
        }
        (self.func)(vm, args)
    }
}

impl fmt::Debug for BuiltinFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.receiver {
            Some(r) => write!(f, "<built-in method {} of {} object>", self.name, r.type_name()),
            None => write!(f, "<built-in function {}>", self.name),
        }
    }
}

impl NativeObject for BuiltinFunction {
    fn type_name(&self) -> &'static str {
        "builtin_function_or_method"
    }

    fn class(&self) -> Arc<TypeObject> {
        builtin_types().builtin_function.clone()
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        match name {
            "__name__" | "__qualname__" => Some(Value::Str(self.name.clone())),
            "__self__" => Some(self.receiver.clone().unwrap_or(Value::None)),
            _ => None,
        }
    }

    fn traverse(&self, visit: &mut dyn FnMut(&Value)) {
        if let Some(r) = &self.receiver {
            visit(r);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// =============================================================================
// Argument Helpers
// =============================================================================

/// Check the number of arguments of builtin `name`.
pub fn check_args(name: &str, args: &[Value], min: usize, max: usize) -> PyResult<()> {
    if (min..=max).contains(&args.len()) {
        return Ok(());
    }
    let expected = if min == max {
        format!("exactly {}", min)
    } else if args.len() < min {
        format!("at least {}", min)
    } else {
        format!("at most {}", max)
    };
    Err(PyErr::type_error(format!(
        "{}() takes {} argument{} ({} given)",
        name,
        expected,
        if min == max && min == 1 { "" } else { "s" },
        args.len()
    )))
}

fn int_arg(name: &str, v: &Value) -> PyResult<i64> {
    match v {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(*b as i64),
        other => Err(PyErr::type_error(format!(
            "{}() argument must be int, not {}",
            name,
            other.type_name()
        ))),
    }
}

fn str_arg<'a>(name: &str, v: &'a Value) -> PyResult<&'a Arc<str>> {
    match v {
        Value::Str(s) => Ok(s),
        other => Err(PyErr::type_error(format!(
            "{}(): attribute name must be string, not '{}'",
            name,
            other.type_name()
        ))),
    }
}

// =============================================================================
// Functions
// =============================================================================

fn builtin_len(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("len", &args, 1, 1)?;
    Ok(Value::Int(ops::get_len(vm, &args[0])?))
}

fn builtin_iter(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("iter", &args, 1, 1)?;
    ops::get_iter(vm, &args[0])
}

fn builtin_next(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("next", &args, 1, 2)?;
    match ops::iter_step(vm, &args[0])? {
        IterStep::Yield(v) => Ok(v),
        IterStep::Return(_) if args.len() == 2 => Ok(args[1].clone()),
        IterStep::Return(v) => Err(PyErr::stop_iteration(v)),
    }
}

fn builtin_isinstance(_vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("isinstance", &args, 2, 2)?;
    let check = |cls: &Value| match cls {
        Value::Type(t) => Ok(ops::isinstance(&args[0], t)),
        other => Err(PyErr::type_error(format!(
            "isinstance() arg 2 must be a type or tuple of types, not {}",
            other.type_name()
        ))),
    };
    match &args[1] {
        Value::Tuple(items) => {
            for item in items.iter() {
                if check(item)? {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        cls => check(cls).map(Value::Bool),
    }
}

fn builtin_repr(_vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("repr", &args, 1, 1)?;
    Ok(Value::str(&args[0].repr()))
}

fn builtin_id(_vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("id", &args, 1, 1)?;
    Ok(Value::Int(args[0].identity() as i64))
}

fn builtin_range(_vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("range", &args, 1, 3)?;
    let ints = args
        .iter()
        .map(|v| int_arg("range", v))
        .collect::<PyResult<Vec<i64>>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step, ..] => (*start, *stop, *step),
        [] => (0, 0, 1),
    };
    if step == 0 {
        return Err(PyErr::value_error("range() arg 3 must not be zero"));
    }
    Ok(Value::native(RangeIterator::new(start, stop, step)))
}

fn builtin_getattr(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("getattr", &args, 2, 3)?;
    let name = str_arg("getattr", &args[1])?;
    match args.get(2) {
        Some(default) => Ok(attr::get_attr_opt(vm, &args[0], name)?.unwrap_or_else(|| default.clone())),
        None => attr::get_attr(vm, &args[0], name),
    }
}

fn builtin_setattr(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("setattr", &args, 3, 3)?;
    let name = str_arg("setattr", &args[1])?;
    attr::set_attr(vm, &args[0], name, args[2].clone())?;
    Ok(Value::None)
}

fn builtin_hasattr(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("hasattr", &args, 2, 2)?;
    let name = str_arg("hasattr", &args[1])?;
    Ok(Value::Bool(attr::get_attr_opt(vm, &args[0], name)?.is_some()))
}

fn builtin_staticmethod(_vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("staticmethod", &args, 1, 1)?;
    Ok(Value::StaticMethod(Arc::new(StaticMethod {
        func: args[0].clone(),
    })))
}

fn builtin_property(_vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("property", &args, 0, 2)?;
    let mut args = args.into_iter().map(|v| (!v.is_none()).then_some(v));
    Ok(Value::Property(Arc::new(Property {
        getter: args.next().flatten(),
        setter: args.next().flatten(),
    })))
}

/// `_getframe(depth=0)`: the materialized frame `depth` levels up.
fn builtin_getframe(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("_getframe", &args, 0, 1)?;
    let depth = match args.first() {
        Some(v) => int_arg("_getframe", v)?,
        None => 0,
    };
    if depth < 0 {
        return Err(PyErr::value_error("call stack is not deep enough"));
    }
    match vm.shadow.frame_at_depth(depth as usize) {
        Some(frame) => Ok(Value::Native(frame)),
        None => Err(PyErr::value_error("call stack is not deep enough")),
    }
}

// =============================================================================
// Type Calls
// =============================================================================

/// Call a class: instantiate it, or convert for builtin types.
pub fn construct(vm: &mut Vm, class: &Arc<TypeObject>, args: Vec<Value>) -> PyResult<Value> {
    let t = builtin_types();
    if Arc::ptr_eq(class, &t.type_) {
        check_args("type", &args, 1, 1)?;
        return Ok(Value::Type(args[0].class()));
    }
    match class.layout() {
        InstanceLayout::Exception => Ok(Value::Exception(Arc::new(ExceptionObject::new(
            class.clone(),
            args,
        )))),
        InstanceLayout::Plain => {
            let obj = Value::Instance(Arc::new(Instance::new(class.clone())));
            if let Some(init) = class.lookup("__init__") {
                let r = attr::call_bound(vm, &init, &obj, args)?;
                if !r.is_none() {
                    return Err(PyErr::type_error(format!(
                        "__init__() should return None, not '{}'",
                        r.type_name()
                    )));
                }
            } else if !args.is_empty() {
                return Err(PyErr::type_error(format!("{}() takes no arguments", class.name())));
            }
            Ok(obj)
        }
        InstanceLayout::Builtin => convert(vm, class, args),
    }
}

fn convert(vm: &mut Vm, class: &Arc<TypeObject>, args: Vec<Value>) -> PyResult<Value> {
    let t = builtin_types();
    let name = class.name().clone();
    check_args(&name, &args, 0, 1)?;
    let arg = args.into_iter().next();
    if Arc::ptr_eq(class, &t.list) {
        let items = match arg {
            Some(v) => ops::collect(vm, &v)?,
            None => Vec::new(),
        };
        return Ok(Value::new_list(items));
    }
    if Arc::ptr_eq(class, &t.tuple) {
        let items = match arg {
            Some(v) => ops::collect(vm, &v)?,
            None => Vec::new(),
        };
        return Ok(Value::tuple(items));
    }
    if Arc::ptr_eq(class, &t.dict) {
        return match arg {
            None => Ok(Value::new_dict()),
            Some(Value::Dict(d)) => {
                let copy = DictObject::new();
                for (k, v) in d.items() {
                    copy.set(k, v)?;
                }
                Ok(Value::Dict(Arc::new(copy)))
            }
            Some(other) => Err(PyErr::type_error(format!(
                "'{}' object is not a mapping",
                other.type_name()
            ))),
        };
    }
    if Arc::ptr_eq(class, &t.bool) {
        return match arg {
            Some(v) => Ok(Value::Bool(ops::truthy(vm, &v)?)),
            None => Ok(Value::Bool(false)),
        };
    }
    if Arc::ptr_eq(class, &t.str) {
        return Ok(match arg {
            Some(Value::Str(s)) => Value::Str(s),
            Some(v) => Value::str(&v.repr()),
            None => Value::str(""),
        });
    }
    if Arc::ptr_eq(class, &t.int) {
        return match arg {
            None => Ok(Value::Int(0)),
            Some(Value::Int(i)) => Ok(Value::Int(i)),
            Some(Value::Bool(b)) => Ok(Value::Int(b as i64)),
            Some(Value::Float(f)) if f.is_finite() => Ok(Value::Int(f.trunc() as i64)),
            Some(Value::Float(_)) => Err(PyErr::overflow("cannot convert float infinity or NaN to integer")),
            Some(Value::Str(s)) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                PyErr::value_error(format!("invalid literal for int() with base 10: '{}'", s))
            }),
            Some(other) => Err(PyErr::type_error(format!(
                "int() argument must be a string or a number, not '{}'",
                other.type_name()
            ))),
        };
    }
    if Arc::ptr_eq(class, &t.float) {
        return match arg {
            None => Ok(Value::Float(0.0)),
            Some(Value::Float(f)) => Ok(Value::Float(f)),
            Some(Value::Int(i)) => Ok(Value::Float(i as f64)),
            Some(Value::Bool(b)) => Ok(Value::Float(b as i64 as f64)),
            Some(Value::Str(s)) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                PyErr::value_error(format!("could not convert string to float: '{}'", s))
            }),
            Some(other) => Err(PyErr::type_error(format!(
                "float() argument must be a string or a number, not '{}'",
                other.type_name()
            ))),
        };
    }
    Err(PyErr::type_error(format!("cannot create '{}' instances", name)))
}

// =============================================================================
// Namespace
// =============================================================================

/// Fresh builtins namespace, including the `jit` module.
pub fn make_builtins() -> DictObject {
    let t = builtin_types();
    let dict = DictObject::new();
    let functions: [(&str, BuiltinFn); 14] = [
        ("len", builtin_len),
        ("iter", builtin_iter),
        ("next", builtin_next),
        ("isinstance", builtin_isinstance),
        ("repr", builtin_repr),
        ("id", builtin_id),
        ("range", builtin_range),
        ("getattr", builtin_getattr),
        ("setattr", builtin_setattr),
        ("hasattr", builtin_hasattr),
        ("staticmethod", builtin_staticmethod),
        ("property", builtin_property),
        ("_getframe", builtin_getframe),
        ("__build_class__", builtin_build_class),
    ];
    for (name, func) in functions {
        dict.set_str(name, BuiltinFunction::value(name, func));
    }

    let types = [
        &t.object,
        &t.type_,
        &t.int,
        &t.bool,
        &t.float,
        &t.str,
        &t.tuple,
        &t.list,
        &t.dict,
        &t.base_exception,
        &t.generator_exit,
        &t.exception,
        &t.type_error,
        &t.value_error,
        &t.attribute_error,
        &t.import_error,
        &t.assertion_error,
        &t.stop_iteration,
        &t.stop_async_iteration,
        &t.runtime_error,
        &t.recursion_error,
        &t.not_implemented_error,
        &t.name_error,
        &t.unbound_local_error,
        &t.lookup_error,
        &t.key_error,
        &t.index_error,
        &t.arithmetic_error,
        &t.zero_division_error,
        &t.overflow_error,
    ];
    for ty in types {
        dict.set_str(ty.name(), Value::Type(ty.clone()));
    }

    let jit = ModuleObject::new("jit");
    jit_module::populate(&jit.dict);
    dict.set_str("jit", Value::Module(Arc::new(jit)));
    dict
}

/// `__build_class__(name, bases, namespace)`: create a class from a tuple
/// of bases and a dict of string-keyed attributes.
fn builtin_build_class(_vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("__build_class__", &args, 3, 3)?;
    let name = str_arg("__build_class__", &args[0])?;
    let bases = match &args[1] {
        Value::Tuple(items) => items
            .iter()
            .map(|b| match b {
                Value::Type(t) => Ok(t.clone()),
                other => Err(PyErr::type_error(format!(
                    "bases must be types, not {}",
                    other.type_name()
                ))),
            })
            .collect::<PyResult<Vec<_>>>()?,
        other => {
            return Err(PyErr::type_error(format!(
                "bases must be a tuple, not {}",
                other.type_name()
            )))
        }
    };
    let Value::Dict(ns) = &args[2] else {
        return Err(PyErr::type_error("namespace must be a dict"));
    };
    let mut namespace = Vec::with_capacity(ns.len());
    for (k, v) in ns.items() {
        match k {
            Value::Str(k) => namespace.push((k, v)),
            other => {
                return Err(PyErr::type_error(format!(
                    "class attribute names must be strings, not {}",
                    other.type_name()
                )))
            }
        }
    }
    let module = match ns.get_str("__module__") {
        Some(Value::Str(m)) => m,
        _ => Arc::from("__main__"),
    };
    TypeObject::new_class(name, &module, bases, namespace).map(Value::Type)
}

// =============================================================================
// Methods of Builtin Types
// =============================================================================

fn receiver(args: &[Value]) -> PyResult<&Value> {
    args.first()
        .ok_or_else(|| PyErr::type_error("method called without a receiver"))
}

fn list_append(_vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("append", &args, 2, 2)?;
    match receiver(&args)? {
        Value::List(list) => {
            list.push(args[1].clone());
            Ok(Value::None)
        }
        other => Err(PyErr::type_error(format!("descriptor 'append' requires a list, not {}", other.type_name()))),
    }
}

fn list_pop(_vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("pop", &args, 1, 1)?;
    match receiver(&args)? {
        Value::List(list) => list.pop().ok_or_else(|| PyErr::index_error("pop from empty list")),
        other => Err(PyErr::type_error(format!("descriptor 'pop' requires a list, not {}", other.type_name()))),
    }
}

fn dict_of(args: &[Value]) -> PyResult<&Arc<DictObject>> {
    match receiver(args)? {
        Value::Dict(d) => Ok(d),
        other => Err(PyErr::type_error(format!("descriptor requires a dict, not {}", other.type_name()))),
    }
}

fn dict_get(_vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("get", &args, 2, 3)?;
    let d = dict_of(&args)?;
    Ok(d.get(&args[1])?.unwrap_or_else(|| args.get(2).cloned().unwrap_or(Value::None)))
}

fn dict_keys(_vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    Ok(Value::new_list(dict_of(&args)?.keys()))
}

fn dict_values(_vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    Ok(Value::new_list(dict_of(&args)?.values()))
}

fn dict_items(_vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    let items = dict_of(&args)?
        .items()
        .into_iter()
        .map(|(k, v)| Value::tuple(vec![k, v]))
        .collect();
    Ok(Value::new_list(items))
}

/// Bound method `name` of a builtin-typed object.
pub fn method(obj: &Value, name: &str) -> Option<Value> {
    let func: BuiltinFn = match (obj, name) {
        (Value::List(_), "append") => list_append,
        (Value::List(_), "pop") => list_pop,
        (Value::Dict(_), "get") => dict_get,
        (Value::Dict(_), "keys") => dict_keys,
        (Value::Dict(_), "values") => dict_values,
        (Value::Dict(_), "items") => dict_items,
        (Value::Native(_), _) => return generator::method(obj, name),
        _ => return None,
    };
    Some(BuiltinFunction::bound(name, func, obj.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitConfig;
    use crate::vm::Runtime;

    fn vm() -> Vm {
        Vm::new(Runtime::new(JitConfig::default()).unwrap())
    }

    #[test]
    fn test_namespace_contents() {
        let dict = make_builtins();
        assert!(matches!(dict.get_str("len"), Some(Value::Native(_))));
        assert!(matches!(dict.get_str("ValueError"), Some(Value::Type(_))));
        assert!(matches!(dict.get_str("jit"), Some(Value::Module(_))));
    }

    #[test]
    fn test_bound_builtin_prepends_receiver() {
        let mut vm = vm();
        let list = Value::new_list(vec![]);
        let append = method(&list, "append").unwrap();
        vm.call(&append, vec![Value::Int(4)]).unwrap();
        assert_eq!(ops::get_len(&mut vm, &list).unwrap(), 1);
    }

    #[test]
    fn test_next_with_default() {
        let mut vm = vm();
        let it = builtin_iter(&mut vm, vec![Value::tuple(vec![])]).unwrap();
        let r = builtin_next(&mut vm, vec![it.clone(), Value::Int(9)]).unwrap();
        assert_eq!(r.as_int(), Some(9));
        let err = builtin_next(&mut vm, vec![it]).unwrap_err();
        assert!(err.is_stop_iteration());
    }

    #[test]
    fn test_arity_message() {
        let err = check_args("len", &[], 1, 1).unwrap_err();
        assert_eq!(err.message(), "len() takes exactly 1 argument (0 given)");
    }

    #[test]
    fn test_build_class_and_instantiate() {
        let mut vm = vm();
        let ns = DictObject::new();
        ns.set_str("x", Value::Int(3));
        let cls = builtin_build_class(
            &mut vm,
            vec![Value::str("C"), Value::tuple(vec![]), Value::Dict(Arc::new(ns))],
        )
        .unwrap();
        let obj = vm.call(&cls, vec![]).unwrap();
        assert_eq!(attr::get_attr(&mut vm, &obj, "x").unwrap().as_int(), Some(3));
        let err = vm.call(&cls, vec![Value::Int(1)]).unwrap_err();
        assert_eq!(err.message(), "C() takes no arguments");
    }

    #[test]
    fn test_exception_class_call() {
        let mut vm = vm();
        let cls = Value::Type(builtin_types().value_error.clone());
        let exc = vm.call(&cls, vec![Value::str("bad")]).unwrap();
        assert!(matches!(exc, Value::Exception(_)));
    }
}
