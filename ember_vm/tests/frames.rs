//! Frame introspection, tracebacks and finalization across execution modes.

mod common;

use common::*;
use ember_bytecode::{BinOp, CodeFlags, FunctionBuilder};
use ember_runtime::{builtin_types, DictObject, FunctionObject, ListObject, TypeObject, Value};
use ember_vm::{spill, FrameObject, JitConfig, Vm};
use std::sync::Arc;

/// Globals with `_getframe` bound.
fn frame_globals(vm: &Vm) -> Arc<DictObject> {
    let globals = Arc::new(DictObject::new());
    globals.set_str("_getframe", builtin(vm, "_getframe"));
    globals
}

fn frame_of(v: &Value) -> &FrameObject {
    v.downcast_ref::<FrameObject>().unwrap()
}

/// `(qualname, lineno)` pairs of the traceback carried by `err`.
fn traceback_of(err: &ember_runtime::PyErr) -> Vec<(String, u32)> {
    err.exception()
        .traceback()
        .into_iter()
        .map(|e| (e.qualname.to_string(), e.lineno))
        .collect()
}

// =============================================================================
// Line Numbers
// =============================================================================

mod line_tests {
    use super::*;

    /// `who()` reports its caller's current line; `g` calls it from two lines.
    fn lines(vm: &mut Vm) -> Vec<i64> {
        let globals = frame_globals(vm);
        define(vm, &globals, "who", |b| {
            b.set_first_lineno(1);
            b.set_line(2);
            b.load_global("_getframe");
            b.load_int(1);
            b.call(1);
            b.load_attr("f_lineno");
            b.return_value();
        });
        let g = define(vm, &globals, "g", |b| {
            b.set_first_lineno(9);
            b.set_line(10);
            b.load_global("who");
            b.call(0);
            b.store_fast("a");
            b.set_line(11);
            b.load_global("who");
            b.call(0);
            b.store_fast("b");
            b.set_line(12);
            b.load_fast("a");
            b.load_fast("b");
            b.emit(ember_bytecode::Opcode::BuildTuple, 2);
            b.return_value();
        });
        let r = vm.call_function(&g, vec![]).unwrap();
        int_tuple(&r)
    }

    #[test]
    fn test_caller_lines_match_across_modes() {
        for mut vm in both_modes() {
            assert_eq!(lines(&mut vm), vec![10, 11]);
        }
    }

    #[test]
    fn test_caller_lines_in_shadow_mode() {
        let mut vm = vm_with(JitConfig {
            shadow_frame: true,
            ..JitConfig::enabled()
        });
        assert_eq!(lines(&mut vm), vec![10, 11]);
    }

    #[test]
    fn test_traceback_of_inlined_callee() {
        let build = |vm: &mut Vm| -> Vec<(String, u32)> {
            let globals = Arc::new(DictObject::new());
            define(vm, &globals, "inner", |b| {
                b.set_first_lineno(1);
                b.set_params(&["x"]);
                b.set_line(2);
                b.load_int(1);
                b.load_fast("x");
                b.binary(BinOp::TrueDiv);
                b.return_value();
            });
            let outer = define(vm, &globals, "outer", |b| {
                b.set_first_lineno(4);
                b.set_line(5);
                b.load_global("inner");
                b.load_int(0);
                b.call(1);
                b.return_value();
            });
            let err = vm.call_function(&outer, vec![]).unwrap_err();
            assert!(err.matches(&builtin_types().zero_division_error));
            traceback_of(&err)
        };
        let [mut interp, mut jit] = both_modes();
        let expected = build(&mut interp);
        assert_eq!(
            expected,
            vec![("outer".to_string(), 5), ("inner".to_string(), 2)]
        );
        assert_eq!(build(&mut jit), expected);
    }
}

// =============================================================================
// Frame Chains
// =============================================================================

mod chain_tests {
    use super::*;

    fn escaped_frame(vm: &mut Vm) -> Value {
        let globals = frame_globals(vm);
        define(vm, &globals, "callee", |b| {
            b.load_global("_getframe");
            b.load_int(0);
            b.call(1);
            b.return_value();
        });
        let caller = define(vm, &globals, "caller", |b| {
            b.load_global("callee");
            b.call(0);
            b.return_value();
        });
        vm.call_function(&caller, vec![]).unwrap()
    }

    #[test]
    fn test_escaped_frame_links_to_caller() {
        for mut vm in both_modes() {
            let frame = escaped_frame(&mut vm);
            let frame = frame_of(&frame);
            assert_eq!(&*frame.code().qualname, "callee");
            let back = frame.back().unwrap();
            assert_eq!(&*back.code().qualname, "caller");
            assert!(back.back().is_none());
        }
    }

    #[test]
    fn test_frame_attributes() {
        for mut vm in both_modes() {
            let frame = escaped_frame(&mut vm);
            let f = frame_of(&frame);
            let globals = f.func().globals.clone();
            match ember_vm::attr::get_attr(&mut vm, &frame, "f_globals").unwrap() {
                Value::Dict(d) => assert!(Arc::ptr_eq(&d, &globals)),
                other => panic!("unexpected f_globals {:?}", other),
            }
            let back = ember_vm::attr::get_attr(&mut vm, &frame, "f_back").unwrap();
            assert_eq!(&*frame_of(&back).code().qualname, "caller");
        }
    }

    #[test]
    fn test_getframe_too_deep() {
        for mut vm in both_modes() {
            let globals = frame_globals(&vm);
            let f = define(&vm, &globals, "deep", |b| {
                b.load_global("_getframe");
                b.load_int(5);
                b.call(1);
                b.return_value();
            });
            let err = vm.call_function(&f, vec![]).unwrap_err();
            assert!(err.matches(&builtin_types().value_error));
        }
    }
}

// =============================================================================
// Finalization
// =============================================================================

mod finalizer_tests {
    use super::*;

    /// Class `C` whose `__del__` appends to the returned list.
    fn finalizing_class(vm: &Vm, globals: &Arc<DictObject>) -> Arc<ListObject> {
        let log = Arc::new(ListObject::new(Vec::new()));
        globals.set_str("log", Value::List(log.clone()));
        let mut b = FunctionBuilder::new("__del__");
        b.set_qualname("C.__del__");
        b.set_params(&["self"]);
        b.load_global("log");
        b.load_method("append");
        b.load_int(1);
        b.call_method(1);
        b.pop_top();
        b.return_none();
        let del = vm.new_function(Arc::new(b.finish().unwrap()), globals.clone());
        let class = TypeObject::new_class(
            "C",
            "__main__",
            Vec::new(),
            vec![(Arc::from("__del__"), Value::Function(del))],
        )
        .unwrap();
        globals.set_str("C", Value::Type(class));
        log
    }

    fn make_and_drop(vm: &Vm, globals: &Arc<DictObject>, raise: bool) -> Arc<FunctionObject> {
        define(vm, globals, "mk", |b| {
            b.load_global("C");
            b.call(0);
            b.store_fast("o");
            if raise {
                b.load_int(1);
                b.load_int(0);
                b.binary(BinOp::TrueDiv);
                b.return_value();
            } else {
                b.return_none();
            }
        })
    }

    #[test]
    fn test_del_runs_once_on_return() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let log = finalizing_class(&vm, &globals);
            let mk = make_and_drop(&vm, &globals, false);
            vm.call_function(&mk, vec![]).unwrap();
            assert_eq!(log.len(), 1);
            vm.call_function(&mk, vec![]).unwrap();
            assert_eq!(log.len(), 2);
        }
    }

    #[test]
    fn test_del_runs_before_next_statement() {
        // def count(): return len(log)
        // def f(): o = C(); del o; return count()
        let run = |vm: &mut Vm| {
            let globals = Arc::new(DictObject::new());
            finalizing_class(vm, &globals);
            define(vm, &globals, "count", |b| {
                b.load_global("len");
                b.load_global("log");
                b.call(1);
                b.return_value();
            });
            let f = define(vm, &globals, "f", |b| {
                b.load_global("C");
                b.call(0);
                b.store_fast("o");
                b.delete_fast("o");
                b.load_global("count");
                b.call(0);
                b.return_value();
            });
            let r = vm.call_function(&f, vec![]).unwrap();
            (r.as_int(), vm.num_inlined_functions(&f))
        };
        let [mut interp, mut jit] = both_modes();
        assert_eq!(run(&mut interp), (Some(1), 0));
        assert_eq!(run(&mut jit), (Some(1), 1));
    }

    #[test]
    fn test_del_runs_once_while_unwinding() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let log = finalizing_class(&vm, &globals);
            let mk = make_and_drop(&vm, &globals, true);
            let err = vm.call_function(&mk, vec![]).unwrap_err();
            assert!(err.matches(&builtin_types().zero_division_error));
            assert_eq!(log.len(), 1);
        }
    }
}

// =============================================================================
// Generator Register Storage
// =============================================================================

mod spill_tests {
    use super::*;

    #[test]
    fn test_pool_clean_after_generator_completes() {
        let mut vm = jit_vm();
        let globals = Arc::new(DictObject::new());
        let gen = define(&vm, &globals, "counter", |b| {
            b.add_flags(CodeFlags::GENERATOR);
            for i in 0..3 {
                b.load_int(i);
                b.yield_value();
                b.pop_top();
            }
            b.return_none();
        });
        let next = builtin(&vm, "next");
        let before = spill::stats();

        let g = vm.call_function(&gen, vec![]).unwrap();
        for i in 0..3 {
            assert_eq!(vm.call(&next, vec![g.clone()]).unwrap().as_int(), Some(i));
        }
        assert!(vm.call(&next, vec![g.clone()]).unwrap_err().is_stop_iteration());
        drop(g);

        let after = spill::stats();
        assert!(after.allocations > before.allocations);
        assert_eq!(
            after.allocations - before.allocations,
            after.releases - before.releases
        );
        assert!(spill::is_clean());
    }
}
