//! Generators, coroutines and async generators over interpreted and compiled
//! bodies.

mod common;

use common::*;
use ember_bytecode::{BinOp, CodeFlags, FunctionBuilder};
use ember_runtime::{builtin_types, DictObject, FunctionObject, Value};
use ember_vm::generator::{self, GenInput, GenStep};
use ember_vm::{GenState, GeneratorObject, Vm};
use std::sync::Arc;

fn gen_of(v: &Value) -> &GeneratorObject {
    v.downcast_ref::<GeneratorObject>().unwrap()
}

fn send(vm: &mut Vm, g: &Value, v: Value) -> GenStep {
    gen_of(g).resume(vm, GenInput::Send(v)).unwrap()
}

/// Call the bound method `name` of `obj`.
fn call_method(vm: &mut Vm, obj: &Value, name: &str, args: Vec<Value>) -> ember_runtime::PyResult<Value> {
    let method = generator::method(obj, name).unwrap();
    vm.call(&method, args)
}

// =============================================================================
// Generators
// =============================================================================

mod generator_tests {
    use super::*;

    /// `def echo(): x = yield 0; yield x * 2`
    fn echo(vm: &Vm, globals: &Arc<DictObject>) -> Arc<FunctionObject> {
        define(vm, globals, "echo", |b: &mut FunctionBuilder| {
            b.add_flags(CodeFlags::GENERATOR);
            b.load_int(0);
            b.yield_value();
            b.store_fast("x");
            b.load_fast("x");
            b.load_int(2);
            b.binary(BinOp::Mul);
            b.yield_value();
            b.pop_top();
            b.return_none();
        })
    }

    #[test]
    fn test_sent_values_reach_the_body() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = echo(&vm, &globals);
            let g = vm.call_function(&f, vec![]).unwrap();
            assert!(matches!(send(&mut vm, &g, Value::None), GenStep::Yield(Value::Int(0))));
            assert!(matches!(send(&mut vm, &g, Value::Int(21)), GenStep::Yield(Value::Int(42))));
            assert!(matches!(send(&mut vm, &g, Value::None), GenStep::Return(Value::None)));
            assert_eq!(gen_of(&g).state(), GenState::Completed);
        }
    }

    #[test]
    fn test_compiled_body_selected_at_creation() {
        let mut vm = jit_vm();
        let globals = Arc::new(DictObject::new());
        let f = echo(&vm, &globals);
        let g = vm.call_function(&f, vec![]).unwrap();
        assert!(gen_of(&g).is_compiled());

        let mut vm = interp_vm();
        let f = echo(&vm, &globals);
        let g = vm.call_function(&f, vec![]).unwrap();
        assert!(!gen_of(&g).is_compiled());
    }

    #[test]
    fn test_close_suspended_generator() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = echo(&vm, &globals);
            let g = vm.call_function(&f, vec![]).unwrap();
            send(&mut vm, &g, Value::None);
            call_method(&mut vm, &g, "close", vec![]).unwrap();
            let err = call_method(&mut vm, &g, "__next__", vec![]).unwrap_err();
            assert!(err.is_stop_iteration());
            assert!(gen_of(&g).frame().is_none());
        }
    }

    #[test]
    fn test_throw_into_suspended_generator() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = echo(&vm, &globals);
            let g = vm.call_function(&f, vec![]).unwrap();
            send(&mut vm, &g, Value::None);
            let exc = Value::Type(builtin_types().value_error.clone());
            let err = call_method(&mut vm, &g, "throw", vec![exc]).unwrap_err();
            assert!(err.matches(&builtin_types().value_error));
            assert!(call_method(&mut vm, &g, "__next__", vec![]).unwrap_err().is_stop_iteration());
        }
    }

    #[test]
    fn test_deopt_after_completion_is_refused() {
        let mut vm = jit_vm();
        let globals = Arc::new(DictObject::new());
        let f = echo(&vm, &globals);
        let g = vm.call_function(&f, vec![]).unwrap();
        send(&mut vm, &g, Value::None);
        send(&mut vm, &g, Value::Int(1));
        assert!(matches!(send(&mut vm, &g, Value::None), GenStep::Return(_)));
        assert!(!vm.deopt_generator(&g).unwrap());
    }

    #[test]
    fn test_deopt_preserves_locals() {
        let mut vm = jit_vm();
        let globals = Arc::new(DictObject::new());
        let f = echo(&vm, &globals);
        let g = vm.call_function(&f, vec![]).unwrap();
        send(&mut vm, &g, Value::None);
        assert!(vm.deopt_generator(&g).unwrap());
        assert!(!gen_of(&g).is_compiled());
        assert!(matches!(send(&mut vm, &g, Value::Int(5)), GenStep::Yield(Value::Int(10))));
    }

    /// Generator stored as global `it` yielding 1 and 2, then returning 5.
    fn delegate_target(vm: &mut Vm, globals: &Arc<DictObject>) -> Value {
        let inner = define(vm, globals, "inner", |b| {
            b.add_flags(CodeFlags::GENERATOR);
            for i in [1, 2] {
                b.load_int(i);
                b.yield_value();
                b.pop_top();
            }
            b.load_int(5);
            b.return_value();
        });
        let it = vm.call_function(&inner, vec![]).unwrap();
        globals.set_str("it", it.clone());
        it
    }

    /// `def outer(): return (yield from it)`
    fn delegating(vm: &Vm, globals: &Arc<DictObject>) -> Arc<FunctionObject> {
        define(vm, globals, "outer", |b| {
            b.add_flags(CodeFlags::GENERATOR);
            b.load_global("it");
            b.yield_from();
            b.return_value();
        })
    }

    fn yielded(step: GenStep) -> Option<i64> {
        match step {
            GenStep::Yield(v) | GenStep::Delegate(v) => v.as_int(),
            GenStep::Return(_) => None,
        }
    }

    #[test]
    fn test_throw_forwarded_to_delegate() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let it = delegate_target(&mut vm, &globals);
            let f = delegating(&vm, &globals);
            let g = vm.call_function(&f, vec![]).unwrap();
            assert_eq!(yielded(send(&mut vm, &g, Value::None)), Some(1));
            assert!(gen_of(&g).is_delegating());

            let exc = Value::Type(builtin_types().value_error.clone());
            let err = call_method(&mut vm, &g, "throw", vec![exc]).unwrap_err();
            assert!(err.matches(&builtin_types().value_error));
            assert_eq!(gen_of(&it).state(), GenState::Raised);
            assert_eq!(gen_of(&g).state(), GenState::Raised);
        }
    }

    #[test]
    fn test_deopt_while_delegating() {
        let mut vm = jit_vm();
        let globals = Arc::new(DictObject::new());
        delegate_target(&mut vm, &globals);
        let f = delegating(&vm, &globals);
        let g = vm.call_function(&f, vec![]).unwrap();
        assert!(gen_of(&g).is_compiled());
        assert_eq!(yielded(send(&mut vm, &g, Value::None)), Some(1));

        assert!(vm.deopt_generator(&g).unwrap());
        assert!(!gen_of(&g).is_compiled());
        assert!(gen_of(&g).is_delegating());
        assert_eq!(yielded(send(&mut vm, &g, Value::None)), Some(2));
        assert!(matches!(send(&mut vm, &g, Value::None), GenStep::Return(Value::Int(5))));
    }
}

// =============================================================================
// Coroutines
// =============================================================================

mod coroutine_tests {
    use super::*;

    /// `async def outer(): return await inner()`
    fn outer(vm: &Vm, globals: &Arc<DictObject>) -> Arc<FunctionObject> {
        define(vm, globals, "outer", |b| {
            b.add_flags(CodeFlags::COROUTINE);
            b.load_global("inner");
            b.call(0);
            b.await_value();
            b.return_value();
        })
    }

    #[test]
    fn test_await_completed_inner() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            define(&vm, &globals, "inner", |b| {
                b.add_flags(CodeFlags::COROUTINE);
                b.load_int(42);
                b.return_value();
            });
            let f = outer(&vm, &globals);
            let c = vm.call_function(&f, vec![]).unwrap();
            assert!(matches!(send(&mut vm, &c, Value::None), GenStep::Return(Value::Int(42))));
        }
    }

    #[test]
    fn test_await_suspending_inner() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            define(&vm, &globals, "inner", |b| {
                b.add_flags(CodeFlags::COROUTINE);
                b.load_int(7);
                b.yield_value();
                b.return_value();
            });
            let f = outer(&vm, &globals);
            let c = vm.call_function(&f, vec![]).unwrap();
            assert!(matches!(
                send(&mut vm, &c, Value::None),
                GenStep::Yield(Value::Int(7)) | GenStep::Delegate(Value::Int(7))
            ));
            assert!(matches!(send(&mut vm, &c, Value::Int(5)), GenStep::Return(Value::Int(5))));
        }
    }

    #[test]
    fn test_await_non_awaitable() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            define(&vm, &globals, "inner", |b| {
                b.load_int(1);
                b.return_value();
            });
            let f = outer(&vm, &globals);
            let c = vm.call_function(&f, vec![]).unwrap();
            let err = gen_of(&c).resume(&mut vm, GenInput::Send(Value::None)).unwrap_err();
            assert!(err.matches(&builtin_types().type_error));
        }
    }

    #[test]
    fn test_await_plain_generator() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            define(&vm, &globals, "inner", |b| {
                b.add_flags(CodeFlags::GENERATOR);
                b.load_int(7);
                b.yield_value();
                b.return_value();
            });
            let f = outer(&vm, &globals);
            let c = vm.call_function(&f, vec![]).unwrap();
            let err = gen_of(&c).resume(&mut vm, GenInput::Send(Value::None)).unwrap_err();
            assert!(err.matches(&builtin_types().type_error));
            assert!(err.to_string().contains("can't be used in 'await' expression"));
        }
    }

    #[test]
    fn test_await_iterable_coroutine_generator() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            define(&vm, &globals, "inner", |b| {
                b.add_flags(CodeFlags::GENERATOR | CodeFlags::ITERABLE_COROUTINE);
                b.load_int(7);
                b.yield_value();
                b.return_value();
            });
            let f = outer(&vm, &globals);
            let c = vm.call_function(&f, vec![]).unwrap();
            assert!(matches!(
                send(&mut vm, &c, Value::None),
                GenStep::Yield(Value::Int(7)) | GenStep::Delegate(Value::Int(7))
            ));
            assert!(matches!(send(&mut vm, &c, Value::Int(4)), GenStep::Return(Value::Int(4))));
        }
    }

    #[test]
    fn test_coroutine_awaited_twice() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            define(&vm, &globals, "inner", |b| {
                b.add_flags(CodeFlags::COROUTINE);
                b.load_int(7);
                b.yield_value();
                b.return_value();
            });
            let f = outer(&vm, &globals);
            let first = vm.call_function(&f, vec![]).unwrap();
            send(&mut vm, &first, Value::None);
            assert!(gen_of(&first).is_delegating());

            // async def again(c): return await c
            let again = define(&vm, &globals, "again", |b| {
                b.add_flags(CodeFlags::COROUTINE);
                b.set_params(&["c"]);
                b.load_fast("c");
                b.await_value();
                b.return_value();
            });
            let second = vm.call_function(&again, vec![first]).unwrap();
            let err = gen_of(&second).resume(&mut vm, GenInput::Send(Value::None)).unwrap_err();
            assert!(err.matches(&builtin_types().runtime_error));
            assert!(err.to_string().contains("being awaited already"));
        }
    }

    #[test]
    fn test_await_wrapper_drives_coroutine() {
        let mut vm = interp_vm();
        let globals = Arc::new(DictObject::new());
        let inner = define(&vm, &globals, "inner", |b| {
            b.add_flags(CodeFlags::COROUTINE);
            b.load_int(3);
            b.return_value();
        });
        let c = vm.call_function(&inner, vec![]).unwrap();
        let wrapper = call_method(&mut vm, &c, "__await__", vec![]).unwrap();
        let err = call_method(&mut vm, &wrapper, "send", vec![Value::None]).unwrap_err();
        assert!(err.is_stop_iteration());
        assert_eq!(err.exception().value().as_int(), Some(3));
    }
}

// =============================================================================
// Async Generators
// =============================================================================

mod async_generator_tests {
    use super::*;

    /// `async def agen(): yield 1`
    fn agen(vm: &Vm, globals: &Arc<DictObject>) -> Arc<FunctionObject> {
        define(vm, globals, "agen", |b| {
            b.add_flags(CodeFlags::ASYNC_GENERATOR);
            b.load_int(1);
            b.yield_value();
            b.pop_top();
            b.return_none();
        })
    }

    #[test]
    fn test_anext_then_exhaustion() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = agen(&vm, &globals);
            let ag = vm.call_function(&f, vec![]).unwrap();

            let first = call_method(&mut vm, &ag, "__anext__", vec![]).unwrap();
            let err = call_method(&mut vm, &first, "send", vec![Value::None]).unwrap_err();
            assert!(err.is_stop_iteration());
            assert_eq!(err.exception().value().as_int(), Some(1));

            let second = call_method(&mut vm, &ag, "__anext__", vec![]).unwrap();
            let err = call_method(&mut vm, &second, "send", vec![Value::None]).unwrap_err();
            assert!(err.matches(&builtin_types().stop_async_iteration));
        }
    }

    #[test]
    fn test_awaitable_is_single_use() {
        let mut vm = interp_vm();
        let globals = Arc::new(DictObject::new());
        let f = agen(&vm, &globals);
        let ag = vm.call_function(&f, vec![]).unwrap();
        let aw = call_method(&mut vm, &ag, "__anext__", vec![]).unwrap();
        call_method(&mut vm, &aw, "send", vec![Value::None]).unwrap_err();
        let err = call_method(&mut vm, &aw, "send", vec![Value::None]).unwrap_err();
        assert!(err.matches(&builtin_types().runtime_error));
    }

    #[test]
    fn test_aclose_suspended() {
        for mut vm in both_modes() {
            let globals = Arc::new(DictObject::new());
            let f = agen(&vm, &globals);
            let ag = vm.call_function(&f, vec![]).unwrap();
            let aw = call_method(&mut vm, &ag, "__anext__", vec![]).unwrap();
            call_method(&mut vm, &aw, "send", vec![Value::None]).unwrap_err();

            let closing = call_method(&mut vm, &ag, "aclose", vec![]).unwrap();
            let err = call_method(&mut vm, &closing, "send", vec![Value::None]).unwrap_err();
            assert!(err.is_stop_iteration());
            assert!(gen_of(&ag).frame().is_none());
        }
    }
}
