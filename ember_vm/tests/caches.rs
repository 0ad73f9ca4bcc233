//! Attribute, method and global caches observed through interpreted and
//! compiled code.
//!
//! Every scenario runs in both execution modes; a cached access must never
//! return a stale value after the object graph changes underneath it.

mod common;

use common::*;
use ember_bytecode::FunctionBuilder;
use ember_runtime::{
    builtin_types, DictObject, FunctionObject, Instance, LazyImport, ListObject, Property, TypeObject, Value,
};
use ember_vm::{attr, Vm};
use std::sync::Arc;

fn class(name: &str, bases: Vec<Arc<TypeObject>>, attrs: Vec<(&str, Value)>) -> Arc<TypeObject> {
    let ns = attrs.into_iter().map(|(k, v)| (Arc::from(k), v)).collect();
    TypeObject::new_class(name, "__main__", bases, ns).unwrap()
}

fn instance(class: &Arc<TypeObject>) -> (Arc<Instance>, Value) {
    let inst = Arc::new(Instance::new(class.clone()));
    let value = Value::Instance(inst.clone());
    (inst, value)
}

/// `def get(o): return o.x`
fn getter(vm: &Vm, globals: &Arc<DictObject>) -> Arc<FunctionObject> {
    define(vm, globals, "get", |b| {
        b.set_params(&["o"]);
        b.load_fast("o");
        b.load_attr("x");
        b.return_value();
    })
}

/// `def call_m(o): return o.m()`
fn method_caller(vm: &Vm, globals: &Arc<DictObject>) -> Arc<FunctionObject> {
    define(vm, globals, "call_m", |b| {
        b.set_params(&["o"]);
        b.load_fast("o");
        b.load_method("m");
        b.call_method(0);
        b.return_value();
    })
}

/// A one-parameter function returning `value`.
fn returning(vm: &Vm, globals: &Arc<DictObject>, name: &str, value: i64) -> Value {
    let mut b = FunctionBuilder::new(name);
    b.set_params(&["self"]);
    b.load_int(value);
    b.return_value();
    Value::Function(vm.new_function(Arc::new(b.finish().unwrap()), globals.clone()))
}

fn get(vm: &mut Vm, f: &Arc<FunctionObject>, obj: &Value) -> i64 {
    vm.call_function(f, vec![obj.clone()]).unwrap().as_int().unwrap()
}

// =============================================================================
// Attribute Loads
// =============================================================================

mod load_attr_tests {
    use super::*;

    #[test]
    fn test_dict_reassignment() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = getter(&vm, &globals);
            let c = class("C", vec![], vec![]);
            let (inst, obj) = instance(&c);
            inst.dict().set_str("x", Value::Int(1));
            assert_eq!(get(&mut vm, &f, &obj), 1);
            assert_eq!(get(&mut vm, &f, &obj), 1);

            let replacement = DictObject::from_pairs([("x", Value::Int(2))]);
            attr::set_attr(&mut vm, &obj, "__dict__", Value::Dict(Arc::new(replacement))).unwrap();
            assert_eq!(get(&mut vm, &f, &obj), 2);
        }
    }

    #[test]
    fn test_in_place_dict_mutation() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = getter(&vm, &globals);
            let c = class("C", vec![], vec![]);
            let (inst, obj) = instance(&c);
            inst.dict().set_str("x", Value::Int(1));
            assert_eq!(get(&mut vm, &f, &obj), 1);
            inst.dict().set_str("x", Value::Int(3));
            assert_eq!(get(&mut vm, &f, &obj), 3);
        }
    }

    #[test]
    fn test_split_dict_becomes_combined() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = getter(&vm, &globals);
            let c = class("C", vec![], vec![]);
            let (first, a) = instance(&c);
            let (second, b) = instance(&c);
            first.dict().set_str("x", Value::Int(1));
            second.dict().set_str("x", Value::Int(10));
            assert_eq!(get(&mut vm, &f, &a), 1);
            assert_eq!(get(&mut vm, &f, &b), 10);

            let d = first.dict();
            d.del_str("x");
            d.set_str("y", Value::Int(0));
            d.set_str("x", Value::Int(4));
            assert_eq!(get(&mut vm, &f, &a), 4);
            assert_eq!(get(&mut vm, &f, &b), 10);
        }
    }

    #[test]
    fn test_bases_reassignment() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = getter(&vm, &globals);
            let a = class("A", vec![], vec![("x", Value::Int(1))]);
            let b = class("B", vec![], vec![("x", Value::Int(2))]);
            let c = class("C", vec![a], vec![]);
            let (_, obj) = instance(&c);
            assert_eq!(get(&mut vm, &f, &obj), 1);
            TypeObject::set_bases(&c, vec![b]).unwrap();
            assert_eq!(get(&mut vm, &f, &obj), 2);
        }
    }

    #[test]
    fn test_data_descriptor_added_over_class_attribute() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = getter(&vm, &globals);
            let c = class("C", vec![], vec![("x", Value::Int(1))]);
            let (inst, obj) = instance(&c);
            assert_eq!(get(&mut vm, &f, &obj), 1);
            inst.dict().set_str("x", Value::Int(5));
            assert_eq!(get(&mut vm, &f, &obj), 5);

            let prop = Property {
                getter: Some(returning(&vm, &globals, "fget", 7)),
                setter: None,
            };
            c.set_attr("x", Value::Property(Arc::new(prop))).unwrap();
            assert_eq!(get(&mut vm, &f, &obj), 7);
        }
    }

    #[test]
    fn test_class_change() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = getter(&vm, &globals);
            let a = class("A", vec![], vec![("x", Value::Int(1))]);
            let b = class("B", vec![], vec![("x", Value::Int(2))]);
            let (inst, obj) = instance(&a);
            assert_eq!(get(&mut vm, &f, &obj), 1);
            inst.set_class(b).unwrap();
            assert_eq!(get(&mut vm, &f, &obj), 2);
        }
    }

    #[test]
    fn test_polymorphic_site() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = getter(&vm, &globals);
            let objs: Vec<Value> = (0..8)
                .map(|i| instance(&class("C", vec![], vec![("x", Value::Int(i))])).1)
                .collect();
            for _ in 0..2 {
                for (i, obj) in objs.iter().enumerate() {
                    assert_eq!(get(&mut vm, &f, obj), i as i64);
                }
            }
        }
    }

    #[test]
    fn test_missing_attribute_raises() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = getter(&vm, &globals);
            let c = class("C", vec![], vec![]);
            let (inst, obj) = instance(&c);
            inst.dict().set_str("x", Value::Int(1));
            assert_eq!(get(&mut vm, &f, &obj), 1);
            inst.dict().del_str("x");
            let err = vm.call_function(&f, vec![obj]).unwrap_err();
            assert!(err.matches(&builtin_types().attribute_error));
        }
    }

    #[test]
    fn test_hits_are_counted() {
        let mut vm = jit_vm();
        let globals = Arc::new(DictObject::new());
        let f = getter(&vm, &globals);
        let c = class("C", vec![], vec![("x", Value::Int(1))]);
        let (_, obj) = instance(&c);
        let stats_fn = jit_fn(&vm, "get_and_clear_inline_cache_stats");
        vm.call(&stats_fn, vec![]).unwrap();
        for _ in 0..3 {
            get(&mut vm, &f, &obj);
        }
        let stats = vm.call(&stats_fn, vec![]).unwrap();
        assert!(dict_item(&stats, "hits").as_int().unwrap() >= 2);
        let misses = dict_item(&stats, "load_attr_misses");
        assert_eq!(dict_item(&misses, "uncached").as_int(), Some(1));
    }
}

// =============================================================================
// Method Loads
// =============================================================================

mod load_method_tests {
    use super::*;

    #[test]
    fn test_base_method_replaced() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = method_caller(&vm, &globals);
            let base = class("Base", vec![], vec![("m", returning(&vm, &globals, "m", 1))]);
            let derived = class("Derived", vec![base.clone()], vec![]);
            let (_, obj) = instance(&derived);
            assert_eq!(get(&mut vm, &f, &obj), 1);
            base.set_attr("m", returning(&vm, &globals, "m", 2)).unwrap();
            assert_eq!(get(&mut vm, &f, &obj), 2);
        }
    }

    #[test]
    fn test_override_in_subclass() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = method_caller(&vm, &globals);
            let base = class("Base", vec![], vec![("m", returning(&vm, &globals, "m", 1))]);
            let derived = class("Derived", vec![base], vec![]);
            let (_, obj) = instance(&derived);
            assert_eq!(get(&mut vm, &f, &obj), 1);
            derived.set_attr("m", returning(&vm, &globals, "m", 3)).unwrap();
            assert_eq!(get(&mut vm, &f, &obj), 3);
        }
    }

    #[test]
    fn test_instance_attribute_shadows_method() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = method_caller(&vm, &globals);
            let c = class("C", vec![], vec![("m", returning(&vm, &globals, "m", 1))]);
            let (inst, obj) = instance(&c);
            assert_eq!(get(&mut vm, &f, &obj), 1);

            let mut b = FunctionBuilder::new("shadow");
            b.load_int(9);
            b.return_value();
            let shadow = vm.new_function(Arc::new(b.finish().unwrap()), globals.clone());
            inst.dict().set_str("m", Value::Function(shadow));
            assert_eq!(get(&mut vm, &f, &obj), 9);
        }
    }
}

// =============================================================================
// Globals
// =============================================================================

mod global_tests {
    use super::*;

    fn reader(vm: &Vm, globals: &Arc<DictObject>, name: &str) -> Arc<FunctionObject> {
        define(vm, globals, "read", |b| {
            b.load_global(name);
            b.return_value();
        })
    }

    #[test]
    fn test_rebinding_and_deletion() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            globals.set_str("x", Value::Int(1));
            let f = reader(&vm, &globals, "x");
            assert_eq!(vm.call_function(&f, vec![]).unwrap().as_int(), Some(1));
            globals.set_str("x", Value::Int(2));
            assert_eq!(vm.call_function(&f, vec![]).unwrap().as_int(), Some(2));
            globals.del_str("x");
            let err = vm.call_function(&f, vec![]).unwrap_err();
            assert!(err.matches(&builtin_types().name_error));
        }
    }

    #[test]
    fn test_global_shadows_builtin() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = reader(&vm, &globals, "len");
            assert!(matches!(vm.call_function(&f, vec![]).unwrap(), Value::Native(_)));
            globals.set_str("len", Value::Int(3));
            assert_eq!(vm.call_function(&f, vec![]).unwrap().as_int(), Some(3));
            globals.del_str("len");
            assert!(matches!(vm.call_function(&f, vec![]).unwrap(), Value::Native(_)));
        }
    }

    #[test]
    fn test_unwatchable_builtins() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = reader(&vm, &globals, "len");
            vm.call_function(&f, vec![]).unwrap();

            let builtins = vm.runtime().builtins().clone();
            builtins.set(Value::Int(1), Value::Int(0)).unwrap();
            assert!(!builtins.is_watchable());
            builtins.set_str("len", Value::Int(9));
            assert_eq!(vm.call_function(&f, vec![]).unwrap().as_int(), Some(9));
            builtins.set_str("len", Value::Int(10));
            assert_eq!(vm.call_function(&f, vec![]).unwrap().as_int(), Some(10));
        }
    }

    #[test]
    fn test_lazy_import_resolves_once() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let log = Arc::new(ListObject::new(Vec::new()));
            globals.set_str("log", Value::List(log.clone()));
            let loader = define(&vm, &globals, "loader", |b| {
                b.set_params(&["name"]);
                b.load_global("log");
                b.load_method("append");
                b.load_fast("name");
                b.call_method(1);
                b.pop_top();
                b.load_int(42);
                b.return_value();
            });
            let lazy = Arc::new(LazyImport::new("mod", Value::Function(loader)));
            globals.set_str("mod", Value::Lazy(lazy.clone()));

            let f = reader(&vm, &globals, "mod");
            assert_eq!(vm.call_function(&f, vec![]).unwrap().as_int(), Some(42));
            assert_eq!(vm.call_function(&f, vec![]).unwrap().as_int(), Some(42));
            assert_eq!(log.len(), 1);
            assert!(matches!(&log.snapshot()[0], Value::Str(s) if &**s == "mod"));
            assert_eq!(globals.get_str("mod").and_then(|v| v.as_int()), Some(42));
            assert_eq!(lazy.resolved().and_then(|v| v.as_int()), Some(42));
        }
    }

    #[test]
    fn test_lazy_import_failure_propagates() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let loader = define(&vm, &globals, "loader", |b| {
                b.set_params(&["name"]);
                b.load_global("missing");
                b.return_value();
            });
            globals.set_str("mod", Value::Lazy(Arc::new(LazyImport::new("mod", Value::Function(loader)))));
            let f = reader(&vm, &globals, "mod");
            let err = vm.call_function(&f, vec![]).unwrap_err();
            assert!(err.matches(&builtin_types().name_error));
            assert!(matches!(globals.get_str("mod"), Some(Value::Lazy(_))));
        }
    }
}
