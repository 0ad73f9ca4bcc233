//! Attribute protocol.
//!
//! Lookup order for `obj.name` on an instance:
//!
//! 1. a **data descriptor** (`property`, or an object whose class defines
//!    `__set__` or `__delete__`) found on the type's MRO
//! 2. the instance `__dict__`
//! 3. a **non-data descriptor** (function, `staticmethod`, an object whose
//!    class defines `__get__`) or a plain class attribute
//! 4. `AttributeError`
//!
//! These are the slow paths behind the inline caches; every cached action
//! must produce what these functions produce.

use crate::builtins::{self, BuiltinFunction};
use crate::global_cache;
use crate::ops;
use crate::vm::Vm;
use ember_runtime::{
    BoundMethod, ExceptionObject, Instance, PyErr, PyResult, TypeObject, Value,
};
use std::sync::Arc;

// =============================================================================
// Descriptor Classification
// =============================================================================

/// How a class attribute participates in lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescrKind {
    /// Takes precedence over the instance dict.
    Data,
    /// Bound on access; the instance dict wins.
    NonData,
    /// Returned as is; the instance dict wins.
    Plain,
}

/// Classify a value found on a type.
pub fn descr_kind(descr: &Value) -> DescrKind {
    match descr {
        Value::Property(_) => DescrKind::Data,
        Value::Function(_) | Value::StaticMethod(_) => DescrKind::NonData,
        Value::Instance(d) => {
            let class = d.class();
            if class.lookup("__set__").is_some() || class.lookup("__delete__").is_some() {
                DescrKind::Data
            } else if class.lookup("__get__").is_some() {
                DescrKind::NonData
            } else {
                DescrKind::Plain
            }
        }
        _ => DescrKind::Plain,
    }
}

/// Apply `descr`'s `__get__` for `obj` (`None` for class access).
pub fn bind(vm: &mut Vm, descr: &Value, obj: Option<&Value>, owner: &Arc<TypeObject>) -> PyResult<Value> {
    match (descr, obj) {
        (Value::Property(p), Some(obj)) => match &p.getter {
            Some(getter) => vm.call(getter, vec![obj.clone()]),
            None => Err(PyErr::attribute_error("unreadable attribute")),
        },
        (Value::Function(_), Some(obj)) => Ok(Value::BoundMethod(Arc::new(BoundMethod {
            func: descr.clone(),
            receiver: obj.clone(),
        }))),
        (Value::StaticMethod(s), _) => Ok(s.func.clone()),
        (Value::Instance(_), _) if descr_kind(descr) != DescrKind::Plain => {
            let instance = obj.cloned().unwrap_or(Value::None);
            let args = vec![instance, Value::Type(owner.clone())];
            match ops::call_special(vm, descr, "__get__", args)? {
                Some(v) => Ok(v),
                None => Ok(descr.clone()),
            }
        }
        _ => Ok(descr.clone()),
    }
}

fn no_attribute(obj: &Value, name: &str) -> PyErr {
    match obj {
        Value::Type(t) => PyErr::attribute_error(format!(
            "type object '{}' has no attribute '{}'",
            t.name(),
            name
        )),
        Value::Module(m) => PyErr::attribute_error(format!(
            "module '{}' has no attribute '{}'",
            m.name, name
        )),
        _ => PyErr::attribute_error(format!(
            "'{}' object has no attribute '{}'",
            obj.type_name(),
            name
        )),
    }
}

// =============================================================================
// Load
// =============================================================================

/// `obj.name`.
pub fn get_attr(vm: &mut Vm, obj: &Value, name: &str) -> PyResult<Value> {
    if name == "__class__" {
        return Ok(Value::Type(obj.class()));
    }
    match obj {
        Value::Instance(inst) => instance_get(vm, obj, inst, name),
        Value::Type(t) => type_get(vm, t, name),
        Value::Module(m) => match name {
            "__name__" => Ok(Value::Str(m.name.clone())),
            "__dict__" => Ok(Value::Dict(m.dict.clone())),
            _ => match m.dict.get_str(name) {
                Some(Value::Lazy(lazy)) => global_cache::resolve_lazy(vm, &m.dict, name, &lazy),
                Some(v) => Ok(v),
                None => Err(no_attribute(obj, name)),
            },
        },
        Value::Function(f) => match name {
            "__name__" => Ok(Value::Str(f.name().clone())),
            "__qualname__" => Ok(Value::Str(f.qualname.clone())),
            "__module__" => Ok(Value::Str(f.module.clone())),
            "__code__" => Ok(Value::Code(f.code.clone())),
            "__globals__" => Ok(Value::Dict(f.globals.clone())),
            "__defaults__" => Ok(f.defaults().map_or(Value::None, Value::Tuple)),
            _ => Err(no_attribute(obj, name)),
        },
        Value::BoundMethod(m) => match name {
            "__self__" => Ok(m.receiver.clone()),
            "__func__" => Ok(m.func.clone()),
            _ => get_attr(vm, &m.func, name),
        },
        Value::Code(c) => match name {
            "co_name" => Ok(Value::Str(c.name.clone())),
            "co_qualname" => Ok(Value::Str(c.qualname.clone())),
            "co_filename" => Ok(Value::Str(c.filename.clone())),
            "co_firstlineno" => Ok(Value::Int(c.first_lineno as i64)),
            _ => Err(no_attribute(obj, name)),
        },
        Value::Exception(exc) => exception_get(vm, obj, exc, name),
        Value::Native(native) => native
            .get_attr(name)
            .or_else(|| builtins::method(obj, name))
            .ok_or_else(|| no_attribute(obj, name)),
        _ => builtins::method(obj, name).ok_or_else(|| no_attribute(obj, name)),
    }
}

/// `obj.name`, with `None` in place of an `AttributeError`.
pub fn get_attr_opt(vm: &mut Vm, obj: &Value, name: &str) -> PyResult<Option<Value>> {
    match get_attr(vm, obj, name) {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.matches(&ember_runtime::builtin_types().attribute_error) => Ok(None),
        Err(e) => Err(e),
    }
}

fn instance_get(vm: &mut Vm, obj: &Value, inst: &Instance, name: &str) -> PyResult<Value> {
    if name == "__dict__" {
        return Ok(Value::Dict(inst.dict()));
    }
    let class = inst.class();
    let descr = class.lookup(name);
    if let Some(d) = descr.as_ref().filter(|d| descr_kind(d) == DescrKind::Data) {
        return bind(vm, d, Some(obj), &class);
    }
    if let Some(v) = inst.dict().get_str(name) {
        return Ok(v);
    }
    if let Some(d) = descr {
        return bind(vm, &d, Some(obj), &class);
    }
    if let Some(hook) = class.lookup("__getattr__") {
        return call_bound(vm, &hook, obj, vec![Value::str(name)]);
    }
    Err(no_attribute(obj, name))
}

fn type_get(vm: &mut Vm, t: &Arc<TypeObject>, name: &str) -> PyResult<Value> {
    match name {
        "__name__" => return Ok(Value::Str(t.name().clone())),
        "__module__" if t.get_own("__module__").is_none() => {
            return Ok(Value::Str(t.module().clone()))
        }
        "__bases__" => return Ok(Value::tuple(t.bases().into_iter().map(Value::Type).collect())),
        "__mro__" => {
            return Ok(Value::tuple(
                TypeObject::mro(t).into_iter().map(Value::Type).collect(),
            ))
        }
        _ => {}
    }
    match t.lookup(name) {
        Some(Value::Property(p)) => Ok(Value::Property(p)),
        Some(Value::Function(f)) => Ok(Value::Function(f)),
        Some(d) => bind(vm, &d, None, t),
        None => Err(no_attribute(&Value::Type(t.clone()), name)),
    }
}

fn exception_get(vm: &mut Vm, obj: &Value, exc: &Arc<ExceptionObject>, name: &str) -> PyResult<Value> {
    let link = |e: Option<Arc<ExceptionObject>>| e.map_or(Value::None, Value::Exception);
    match name {
        "__cause__" => Ok(link(exc.cause())),
        "__context__" => Ok(link(exc.context())),
        "__suppress_context__" => Ok(Value::Bool(exc.suppress_context())),
        "__dict__" => Ok(Value::Dict(exc.dict().clone())),
        "value" if exc.class().is_subtype(&ember_runtime::builtin_types().stop_iteration) => {
            Ok(exc.value())
        }
        _ => {
            if let Some(v) = exc.dict().get_str(name) {
                return Ok(v);
            }
            let class = exc.class().clone();
            match class.lookup(name) {
                Some(d) => bind(vm, &d, Some(obj), &class),
                None => Err(no_attribute(obj, name)),
            }
        }
    }
}

/// `LoadMethod`: `(method, receiver)` when `name` resolves to a function on
/// the type that the instance does not shadow, otherwise `(Null, attr)`.
pub fn load_method(vm: &mut Vm, obj: &Value, name: &str) -> PyResult<(Value, Value)> {
    if let Value::Instance(inst) = obj {
        let class = inst.class();
        if let Some(descr @ Value::Function(_)) = class.lookup(name) {
            if !inst.dict().contains_str(name) {
                return Ok((descr, obj.clone()));
            }
        }
    }
    Ok((Value::Null, get_attr(vm, obj, name)?))
}

/// Call `method`, found on the type of `obj`, with `obj` bound.
pub fn call_bound(vm: &mut Vm, method: &Value, obj: &Value, mut args: Vec<Value>) -> PyResult<Value> {
    match method {
        Value::StaticMethod(s) => vm.call(&s.func, args),
        Value::Function(_) => {
            args.insert(0, obj.clone());
            vm.call(method, args)
        }
        Value::Native(_) if method.downcast_ref::<BuiltinFunction>().is_some() => {
            args.insert(0, obj.clone());
            vm.call(method, args)
        }
        _ => {
            let class = obj.class();
            let bound = bind(vm, method, Some(obj), &class)?;
            vm.call(&bound, args)
        }
    }
}

// =============================================================================
// Store / Delete
// =============================================================================

fn types_of(value: &Value) -> PyResult<Vec<Arc<TypeObject>>> {
    let Value::Tuple(items) = value else {
        return Err(PyErr::type_error(format!(
            "can only assign tuple to __bases__, not {}",
            value.type_name()
        )));
    };
    items
        .iter()
        .map(|v| match v {
            Value::Type(t) => Ok(t.clone()),
            other => Err(PyErr::type_error(format!(
                "__bases__ must contain only classes, not {}",
                other.type_name()
            ))),
        })
        .collect()
}

/// `obj.name = value`.
pub fn set_attr(vm: &mut Vm, obj: &Value, name: &str, value: Value) -> PyResult<()> {
    match obj {
        Value::Instance(inst) => match (name, value) {
            ("__class__", Value::Type(t)) => inst.set_class(t),
            ("__class__", other) => Err(PyErr::type_error(format!(
                "__class__ must be set to a class, not '{}' object",
                other.type_name()
            ))),
            ("__dict__", Value::Dict(d)) => {
                inst.set_dict(d);
                Ok(())
            }
            ("__dict__", other) => Err(PyErr::type_error(format!(
                "__dict__ must be set to a dictionary, not a '{}'",
                other.type_name()
            ))),
            (_, value) => {
                let class = inst.class();
                match class.lookup(name) {
                    Some(Value::Property(p)) => match &p.setter {
                        Some(setter) => vm.call(setter, vec![obj.clone(), value]).map(drop),
                        None => Err(PyErr::attribute_error(format!(
                            "can't set attribute '{}'",
                            name
                        ))),
                    },
                    Some(d @ Value::Instance(_)) if descr_kind(&d) == DescrKind::Data => {
                        match ops::call_special(vm, &d, "__set__", vec![obj.clone(), value])? {
                            Some(_) => Ok(()),
                            None => Err(PyErr::attribute_error(format!(
                                "can't set attribute '{}'",
                                name
                            ))),
                        }
                    }
                    _ => {
                        inst.dict().set_str(name, value);
                        Ok(())
                    }
                }
            }
        },
        Value::Type(t) => match name {
            "__bases__" => TypeObject::set_bases(t, types_of(&value)?),
            _ => t.set_attr(name, value),
        },
        Value::Module(m) => {
            m.dict.set_str(name, value);
            Ok(())
        }
        Value::Function(f) if name == "__defaults__" => {
            match value {
                Value::None => f.set_defaults(None),
                Value::Tuple(items) => f.set_defaults(Some(items)),
                other => {
                    return Err(PyErr::type_error(format!(
                        "__defaults__ must be set to a tuple object, not {}",
                        other.type_name()
                    )))
                }
            }
            Ok(())
        }
        Value::Exception(exc) => {
            exc.dict().set_str(name, value);
            Ok(())
        }
        _ => Err(PyErr::attribute_error(format!(
            "'{}' object attribute '{}' is read-only",
            obj.type_name(),
            name
        ))),
    }
}

/// `del obj.name`.
pub fn del_attr(vm: &mut Vm, obj: &Value, name: &str) -> PyResult<()> {
    match obj {
        Value::Instance(inst) => {
            let class = inst.class();
            match class.lookup(name) {
                Some(Value::Property(_)) => {
                    Err(PyErr::attribute_error(format!("can't delete attribute '{}'", name)))
                }
                Some(d @ Value::Instance(_)) if descr_kind(&d) == DescrKind::Data => {
                    match ops::call_special(vm, &d, "__delete__", vec![obj.clone()])? {
                        Some(_) => Ok(()),
                        None => Err(PyErr::attribute_error(format!(
                            "can't delete attribute '{}'",
                            name
                        ))),
                    }
                }
                _ if inst.dict().del_str(name) => Ok(()),
                _ => Err(no_attribute(obj, name)),
            }
        }
        Value::Type(t) => t.del_attr(name),
        Value::Module(m) if m.dict.del_str(name) => Ok(()),
        _ => Err(no_attribute(obj, name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitConfig;
    use crate::vm::Runtime;
    use ember_runtime::{DictObject, Property};

    fn vm() -> Vm {
        Vm::new(Runtime::new(JitConfig::default()).unwrap())
    }

    fn class(name: &str, attrs: Vec<(&str, Value)>) -> Arc<TypeObject> {
        let ns = attrs.into_iter().map(|(k, v)| (Arc::from(k), v)).collect();
        TypeObject::new_class(name, "t", Vec::new(), ns).unwrap()
    }

    #[test]
    fn test_instance_dict_shadows_plain_class_attr() {
        let mut vm = vm();
        let c = class("C", vec![("x", Value::Int(1))]);
        let obj = Value::Instance(Arc::new(Instance::new(c)));
        assert_eq!(get_attr(&mut vm, &obj, "x").unwrap().as_int(), Some(1));
        set_attr(&mut vm, &obj, "x", Value::Int(2)).unwrap();
        assert_eq!(get_attr(&mut vm, &obj, "x").unwrap().as_int(), Some(2));
        del_attr(&mut vm, &obj, "x").unwrap();
        assert_eq!(get_attr(&mut vm, &obj, "x").unwrap().as_int(), Some(1));
    }

    #[test]
    fn test_readonly_property() {
        let mut vm = vm();
        let prop = Value::Property(Arc::new(Property {
            getter: None,
            setter: None,
        }));
        let c = class("C", vec![("p", prop)]);
        let obj = Value::Instance(Arc::new(Instance::new(c)));
        let err = set_attr(&mut vm, &obj, "p", Value::Int(1)).unwrap_err();
        assert_eq!(err.message(), "can't set attribute 'p'");
    }

    #[test]
    fn test_missing_attribute_message() {
        let mut vm = vm();
        let c = class("C", vec![]);
        let obj = Value::Instance(Arc::new(Instance::new(c.clone())));
        let err = get_attr(&mut vm, &obj, "y").unwrap_err();
        assert_eq!(err.message(), "'C' object has no attribute 'y'");
        let err = get_attr(&mut vm, &Value::Type(c), "y").unwrap_err();
        assert_eq!(err.message(), "type object 'C' has no attribute 'y'");
        assert!(get_attr_opt(&mut vm, &Value::Int(1), "y").unwrap().is_none());
    }

    #[test]
    fn test_dict_reassignment() {
        let mut vm = vm();
        let c = class("C", vec![]);
        let obj = Value::Instance(Arc::new(Instance::new(c)));
        let d = Arc::new(DictObject::from_pairs([("z", Value::Int(9))]));
        set_attr(&mut vm, &obj, "__dict__", Value::Dict(d)).unwrap();
        assert_eq!(get_attr(&mut vm, &obj, "z").unwrap().as_int(), Some(9));
    }
}
