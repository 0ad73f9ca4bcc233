//! Calls into native library symbols from static code.
#![cfg(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")))]

mod common;

use common::*;
use ember_bytecode::{FunctionBuilder, LocalType, NativeSignature, PrimitiveKind};
use ember_runtime::{builtin_types, DictObject, FunctionObject, Value};
use ember_vm::Vm;
use std::sync::Arc;

fn labs() -> NativeSignature {
    NativeSignature::new("", "labs", vec![PrimitiveKind::Int64], PrimitiveKind::Int64)
}

/// `def absval(x): return box(labs(unbox(x)))`
fn absval(vm: &Vm, globals: &Arc<DictObject>) -> Arc<FunctionObject> {
    define(vm, globals, "absval", |b| {
        b.set_params(&["x"]);
        b.load_fast("x");
        b.primitive_unbox(PrimitiveKind::Int64);
        b.invoke_native(labs());
        b.primitive_box(PrimitiveKind::Int64);
        b.return_value();
    })
}

#[test]
fn test_invoke_native_in_both_modes() {
    for mut vm in both_modes() {
        let globals = Arc::new(DictObject::new());
        let f = absval(&vm, &globals);
        for (arg, expected) in [(-3, 3), (0, 0), (12, 12)] {
            let r = vm.call_function(&f, vec![Value::Int(arg)]).unwrap();
            assert_eq!(r.as_int(), Some(expected));
        }
    }
}

#[test]
fn test_unbox_rejects_wrong_representation() {
    for mut vm in both_modes() {
        let globals = Arc::new(DictObject::new());
        let f = absval(&vm, &globals);
        let err = vm.call_function(&f, vec![Value::Float(1.5)]).unwrap_err();
        assert!(err.matches(&builtin_types().type_error));
    }
}

#[test]
fn test_caller_of_native_body() {
    for mut vm in both_modes() {
        let globals = Arc::new(DictObject::new());
        absval(&vm, &globals);
        let g = define(&vm, &globals, "g", |b| {
            b.load_global("absval");
            b.load_int(-8);
            b.call(1);
            b.return_value();
        });
        assert_eq!(vm.call_function(&g, vec![]).unwrap().as_int(), Some(8));
    }
}

mod native_function_tests {
    use super::*;

    fn native_labs(vm: &Vm) -> Arc<FunctionObject> {
        let mut b = FunctionBuilder::new("labs");
        b.set_filename("test.py");
        b.set_params(&["x"]);
        b.set_local_type("x", LocalType::Primitive(PrimitiveKind::Int64));
        b.set_return_type(LocalType::Primitive(PrimitiveKind::Int64));
        b.return_none();
        let code = Arc::new(b.finish().unwrap());
        vm.new_native_function(code, Arc::new(DictObject::new()), labs())
            .unwrap()
    }

    #[test]
    fn test_call_static() {
        let mut vm = jit_vm();
        let f = native_labs(&vm);
        let r = vm.call_static(&f, vec![Value::Int(-3)]).unwrap();
        assert_eq!(r.as_int(), Some(3));
    }

    #[test]
    fn test_call_static_checks_arguments() {
        let mut vm = interp_vm();
        let f = native_labs(&vm);
        let err = vm.call_static(&f, vec![Value::str("x")]).unwrap_err();
        assert!(err.matches(&builtin_types().type_error));
    }

    #[test]
    fn test_plain_call_is_refused() {
        let mut vm = jit_vm();
        let f = native_labs(&vm);
        let err = vm.call_function(&f, vec![Value::Int(-3)]).unwrap_err();
        assert!(err.matches(&builtin_types().runtime_error));
        assert!(!vm.is_jit_compiled(&f));
    }

    #[test]
    fn test_arity_must_match_signature() {
        let vm = interp_vm();
        let mut b = FunctionBuilder::new("bad");
        b.set_params(&["x", "y"]);
        b.return_none();
        let code = Arc::new(b.finish().unwrap());
        let err = vm
            .new_native_function(code, Arc::new(DictObject::new()), labs())
            .unwrap_err();
        assert!(err.matches(&builtin_types().type_error));
    }
}
