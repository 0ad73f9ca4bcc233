//! Compilation, inlining and deoptimization through the public VM surface.

mod common;

use common::*;
use ember_bytecode::{BinOp, CodeFlags, FunctionBuilder};
use ember_jit::DeoptReason;
use ember_runtime::{builtin_types, DictObject, FunctionObject, Value};
use ember_vm::{GeneratorObject, JitConfig, Vm};
use std::sync::Arc;

/// `def f(x, y): return x + y`
fn define_f(vm: &Vm, globals: &Arc<DictObject>) -> Arc<FunctionObject> {
    define(vm, globals, "f", |b| {
        b.set_first_lineno(1);
        b.set_params(&["x", "y"]);
        b.set_line(2);
        b.load_fast("x");
        b.load_fast("y");
        b.binary(BinOp::Add);
        b.return_value();
    })
}

/// `def g(): return f(2, 3)`
fn define_g(vm: &Vm, globals: &Arc<DictObject>) -> Arc<FunctionObject> {
    define(vm, globals, "g", |b| {
        b.set_first_lineno(4);
        b.set_line(5);
        b.load_global("f");
        b.load_int(2);
        b.load_int(3);
        b.call(2);
        b.return_value();
    })
}

/// `def gen(): yield f(1, 1); yield f(1, 2)`
fn define_gen(vm: &Vm, globals: &Arc<DictObject>) -> Arc<FunctionObject> {
    define(vm, globals, "gen", |b: &mut FunctionBuilder| {
        b.add_flags(CodeFlags::GENERATOR);
        b.set_first_lineno(7);
        b.set_line(8);
        b.load_global("f");
        b.load_int(1);
        b.load_int(1);
        b.call(2);
        b.yield_value();
        b.pop_top();
        b.set_line(9);
        b.load_global("f");
        b.load_int(1);
        b.load_int(2);
        b.call(2);
        b.yield_value();
        b.pop_top();
        b.return_none();
    })
}

// =============================================================================
// Inlining
// =============================================================================

mod inlining_tests {
    use super::*;

    #[test]
    fn test_inlined_call_result() {
        let mut vm = jit_vm();
        let globals = Arc::new(DictObject::new());
        define_f(&vm, &globals);
        let g = define_g(&vm, &globals);
        let r = vm.call_function(&g, vec![]).unwrap();
        assert_eq!(r.as_int(), Some(5));
        assert!(vm.is_jit_compiled(&g));
        assert_eq!(vm.num_inlined_functions(&g), 1);
    }

    #[test]
    fn test_inline_count_through_builtin() {
        let mut vm = jit_vm();
        let globals = Arc::new(DictObject::new());
        define_f(&vm, &globals);
        let g = define_g(&vm, &globals);
        vm.call_function(&g, vec![]).unwrap();
        let count = vm
            .call(&jit_fn(&vm, "get_num_inlined_functions"), vec![Value::Function(g)])
            .unwrap();
        assert_eq!(count.as_int(), Some(1));
    }

    #[test]
    fn test_rejected_callee_is_reported() {
        let mut vm = jit_vm();
        let globals = Arc::new(DictObject::new());
        let fd = define(&vm, &globals, "fd", |b| {
            b.set_params(&["x"]);
            b.load_fast("x");
            b.return_value();
        });
        fd.set_defaults(Some(Arc::from([Value::Int(0)])));
        let caller = define(&vm, &globals, "caller", |b| {
            b.load_global("fd");
            b.load_int(4);
            b.call(1);
            b.return_value();
        });
        assert_eq!(vm.call_function(&caller, vec![]).unwrap().as_int(), Some(4));

        let stats = vm
            .call(&jit_fn(&vm, "get_inlined_functions_stats"), vec![Value::Function(caller)])
            .unwrap();
        assert_eq!(dict_item(&stats, "num_inlined_functions").as_int(), Some(0));
        let failures = dict_item(&stats, "failure_stats");
        let names = list_items(&dict_item(&failures, "HasDefaults"));
        assert_eq!(names.len(), 1);
        assert!(matches!(&names[0], Value::Str(s) if &**s == "__main__:fd"));
    }

    #[test]
    fn test_inliner_disabled() {
        let mut vm = vm_with(JitConfig {
            inliner: false,
            ..JitConfig::enabled()
        });
        let globals = Arc::new(DictObject::new());
        define_f(&vm, &globals);
        let g = define_g(&vm, &globals);
        assert_eq!(vm.call_function(&g, vec![]).unwrap().as_int(), Some(5));
        assert_eq!(vm.num_inlined_functions(&g), 0);
    }
}

// =============================================================================
// Deoptimization
// =============================================================================

mod deopt_tests {
    use super::*;

    #[test]
    fn test_generator_resumes_in_interpreter() {
        let mut vm = jit_vm();
        let globals = Arc::new(DictObject::new());
        define_f(&vm, &globals);
        let gen = define_gen(&vm, &globals);
        let next = builtin(&vm, "next");

        let g = vm.call_function(&gen, vec![]).unwrap();
        assert!(g.downcast_ref::<GeneratorObject>().unwrap().is_compiled());
        assert_eq!(vm.call(&next, vec![g.clone()]).unwrap().as_int(), Some(2));

        let deopted = vm.call(&jit_fn(&vm, "_deopt_gen"), vec![g.clone()]).unwrap();
        assert!(deopted.is_truthy());
        assert!(!g.downcast_ref::<GeneratorObject>().unwrap().is_compiled());

        assert_eq!(vm.call(&next, vec![g.clone()]).unwrap().as_int(), Some(3));
        let err = vm.call(&next, vec![g]).unwrap_err();
        assert!(err.is_stop_iteration());
    }

    #[test]
    fn test_deopt_before_first_yield() {
        let mut vm = jit_vm();
        let globals = Arc::new(DictObject::new());
        define_f(&vm, &globals);
        let gen = define_gen(&vm, &globals);
        let next = builtin(&vm, "next");

        let g = vm.call_function(&gen, vec![]).unwrap();
        assert!(vm.deopt_generator(&g).unwrap());
        assert_eq!(vm.call(&next, vec![g.clone()]).unwrap().as_int(), Some(2));
        assert_eq!(vm.call(&next, vec![g]).unwrap().as_int(), Some(3));
    }

    #[test]
    fn test_deopt_gen_rejects_non_generators() {
        let mut vm = jit_vm();
        let err = vm
            .call(&jit_fn(&vm, "_deopt_gen"), vec![Value::Int(1)])
            .unwrap_err();
        assert!(err.matches(&builtin_types().type_error));
    }

    #[test]
    fn test_guard_failure_falls_back() {
        let mut vm = jit_vm();
        let globals = Arc::new(DictObject::new());
        define_f(&vm, &globals);
        let g = define_g(&vm, &globals);
        assert_eq!(vm.call_function(&g, vec![]).unwrap().as_int(), Some(5));
        vm.take_deopt_stats();

        let h = define(&vm, &globals, "h", |b| {
            b.set_params(&["x", "y"]);
            b.load_fast("x");
            b.load_fast("y");
            b.binary(BinOp::Mul);
            b.return_value();
        });
        globals.set_str("f", Value::Function(h));
        assert_eq!(vm.call_function(&g, vec![]).unwrap().as_int(), Some(6));

        let events = vm.take_deopt_stats();
        assert!(events
            .iter()
            .any(|(key, _)| key.reason == DeoptReason::GuardFailure && &*key.func_qualname == "g"));
    }

    #[test]
    fn test_runtime_stats_builtin_resets() {
        let mut vm = jit_vm();
        let globals = Arc::new(DictObject::new());
        define_f(&vm, &globals);
        let g = define_g(&vm, &globals);
        vm.call_function(&g, vec![]).unwrap();
        let h = define(&vm, &globals, "h", |b| {
            b.set_params(&["x", "y"]);
            b.load_fast("y");
            b.return_value();
        });
        globals.set_str("f", Value::Function(h));
        vm.call_function(&g, vec![]).unwrap();

        let stats_fn = jit_fn(&vm, "get_and_clear_runtime_stats");
        let stats = vm.call(&stats_fn, vec![]).unwrap();
        let events = list_items(&dict_item(&stats, "deopt"));
        assert!(!events.is_empty());
        let first = &events[0];
        assert!(matches!(dict_item(first, "reason"), Value::Str(s) if &*s == "GuardFailure"));
        assert!(dict_item(first, "count").as_int().unwrap() >= 1);

        let stats = vm.call(&stats_fn, vec![]).unwrap();
        assert!(list_items(&dict_item(&stats, "deopt")).is_empty());
    }

    #[test]
    fn test_compile_deopt_recompile() {
        let mut vm = jit_vm();
        let globals = Arc::new(DictObject::new());
        let f = define_f(&vm, &globals);
        let args = || vec![Value::Int(1), Value::Int(2)];

        assert_eq!(vm.call_function(&f, args()).unwrap().as_int(), Some(3));
        assert!(vm.is_jit_compiled(&f));
        assert!(vm.deopt_function(&f));
        assert!(!vm.is_jit_compiled(&f));
        assert!(!vm.deopt_function(&f));

        assert_eq!(vm.call_function(&f, args()).unwrap().as_int(), Some(3));
        assert!(vm.is_jit_compiled(&f));
    }

    #[test]
    fn test_exception_in_compiled_code_unwinds() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = define(&vm, &globals, "div", |b| {
                b.set_params(&["x"]);
                b.load_int(1);
                b.load_fast("x");
                b.binary(BinOp::TrueDiv);
                b.return_value();
            });
            let err = vm.call_function(&f, vec![Value::Int(0)]).unwrap_err();
            assert!(err.matches(&builtin_types().zero_division_error));
            assert_eq!(vm.stack_depth(), 0);
        }
    }
}

// =============================================================================
// Policy
// =============================================================================

mod policy_tests {
    use super::*;

    #[test]
    fn test_disabled_by_default() {
        let mut vm = interp_vm();
        let globals = Arc::new(DictObject::new());
        let f = define_f(&vm, &globals);
        vm.call_function(&f, vec![Value::Int(1), Value::Int(1)]).unwrap();
        assert!(!vm.is_jit_compiled(&f));
        assert!(!vm.force_compile(&f));
    }

    #[test]
    fn test_compile_threshold() {
        let mut vm = vm_with(JitConfig {
            compile_threshold: 3,
            ..JitConfig::enabled()
        });
        let globals = Arc::new(DictObject::new());
        let f = define_f(&vm, &globals);
        for _ in 0..2 {
            vm.call_function(&f, vec![Value::Int(1), Value::Int(1)]).unwrap();
            assert!(!vm.is_jit_compiled(&f));
        }
        vm.call_function(&f, vec![Value::Int(1), Value::Int(1)]).unwrap();
        assert!(vm.is_jit_compiled(&f));
    }

    #[test]
    fn test_disable_then_enable() {
        let mut vm = jit_vm();
        let globals = Arc::new(DictObject::new());
        let f = define_f(&vm, &globals);
        vm.disable_jit(false);
        assert_eq!(vm.call_function(&f, vec![Value::Int(2), Value::Int(2)]).unwrap().as_int(), Some(4));
        assert!(!vm.is_jit_compiled(&f));
        vm.enable_jit();
        vm.call_function(&f, vec![Value::Int(2), Value::Int(2)]).unwrap();
        assert!(vm.is_jit_compiled(&f));
        vm.call(&jit_fn(&vm, "disable"), vec![Value::Bool(true)]).unwrap();
        assert!(!vm.is_jit_compiled(&f));
    }

    #[test]
    fn test_disable_from_running_compiled_code() {
        let mut vm = jit_vm();
        let globals = Arc::new(DictObject::new());
        globals.set_str("disable", jit_fn(&vm, "disable"));
        define_f(&vm, &globals);
        let g = define(&vm, &globals, "g", |b| {
            b.load_global("disable");
            b.call(0);
            b.pop_top();
            b.load_global("f");
            b.load_int(2);
            b.load_int(3);
            b.call(2);
            b.return_value();
        });
        assert_eq!(vm.call_function(&g, vec![]).unwrap().as_int(), Some(5));
        assert!(!vm.runtime().driver().is_enabled());
        assert_eq!(vm.call_function(&g, vec![]).unwrap().as_int(), Some(5));
    }

    #[test]
    fn test_precompile_all() {
        let mut vm = jit_vm();
        let globals = Arc::new(DictObject::new());
        let f = define_f(&vm, &globals);
        let g = define_g(&vm, &globals);
        let done = vm
            .call(&jit_fn(&vm, "precompile_all"), vec![Value::Int(2)])
            .unwrap();
        assert!(done.is_truthy());
        assert!(vm.is_jit_compiled(&f));
        assert!(vm.is_jit_compiled(&g));
        let compiled = vm.call(&jit_fn(&vm, "get_compiled_functions"), vec![]).unwrap();
        assert_eq!(list_items(&compiled).len(), 2);
    }

    #[test]
    fn test_suppressed_function_stays_interpreted() {
        let mut vm = jit_vm();
        let globals = Arc::new(DictObject::new());
        let f = define_f(&vm, &globals);
        vm.call(&jit_fn(&vm, "jit_suppress"), vec![Value::Function(f.clone())])
            .unwrap();
        assert_eq!(vm.call_function(&f, vec![Value::Int(1), Value::Int(2)]).unwrap().as_int(), Some(3));
        assert!(!vm.is_jit_compiled(&f));
        assert!(vm.is_jit_suppressed(&f));
    }

    #[test]
    fn test_jit_list_restricts_compilation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jitlist.txt");
        std::fs::write(&path, "# hot functions\n__main__:f\n").unwrap();
        let mut vm = vm_with(JitConfig {
            jit_list_file: Some(path),
            ..JitConfig::enabled()
        });
        let globals = Arc::new(DictObject::new());
        let f = define_f(&vm, &globals);
        let g = define_g(&vm, &globals);
        vm.call_function(&g, vec![]).unwrap();
        vm.call_function(&f, vec![Value::Int(1), Value::Int(1)]).unwrap();
        assert!(vm.is_jit_compiled(&f));
        assert!(!vm.is_jit_compiled(&g));
    }
}

// =============================================================================
// Pattern Matching
// =============================================================================

mod match_tests {
    use super::*;
    use ember_bytecode::Opcode;
    use ember_runtime::{Instance, TypeObject};

    #[test]
    fn test_match_class_in_both_modes() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let point = TypeObject::new_class(
                "Point",
                "__main__",
                Vec::new(),
                vec![(
                    Arc::from("__match_args__"),
                    Value::tuple(vec![Value::str("x"), Value::str("y")]),
                )],
            )
            .unwrap();
            globals.set_str("Point", Value::Type(point.clone()));
            let f = define(&vm, &globals, "destructure", |b| {
                b.set_params(&["o"]);
                b.load_fast("o");
                b.load_global("Point");
                b.emit(Opcode::MatchClass, 2);
                b.return_value();
            });

            let inst = Arc::new(Instance::new(point));
            inst.dict().set_str("x", Value::Int(1));
            inst.dict().set_str("y", Value::Int(2));
            let r = vm.call_function(&f, vec![Value::Instance(inst)]).unwrap();
            assert_eq!(int_tuple(&r), vec![1, 2]);
            let r = vm.call_function(&f, vec![Value::Int(0)]).unwrap();
            assert!(r.is_none());
        }
    }

    #[test]
    fn test_sequence_length_in_both_modes() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = define(&vm, &globals, "seqlen", |b| {
                b.set_params(&["o"]);
                b.load_fast("o");
                b.emit(Opcode::GetLen, 0);
                b.return_value();
            });
            let r = vm
                .call_function(&f, vec![Value::tuple(vec![Value::None; 3])])
                .unwrap();
            assert_eq!(r.as_int(), Some(3));
        }
    }
}
