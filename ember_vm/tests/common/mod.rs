//! Shared helpers for the integration suites.

#![allow(dead_code)]

use ember_bytecode::FunctionBuilder;
use ember_runtime::{DictObject, FunctionObject, Value};
use ember_vm::{JitConfig, Runtime, Vm};
use std::sync::{Arc, Once};

static TRACING: Once = Once::new();

/// Route VM logs to the test harness; `EMBER_LOG` sets the filter.
pub fn init_tracing() {
    TRACING.call_once(|| {
        use tracing_subscriber::EnvFilter;

        let filter = std::env::var("EMBER_LOG")
            .ok()
            .and_then(|expr| EnvFilter::try_new(expr).ok())
            .unwrap_or_else(|| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// VM that interprets everything.
pub fn interp_vm() -> Vm {
    vm_with(JitConfig::default())
}

/// VM that compiles every function on its first call.
pub fn jit_vm() -> Vm {
    vm_with(JitConfig::enabled())
}

/// VM with a custom configuration.
pub fn vm_with(config: JitConfig) -> Vm {
    init_tracing();
    Vm::new(Runtime::new(config).unwrap())
}

/// Both execution modes, for equivalence checks.
pub fn both_modes() -> [Vm; 2] {
    [interp_vm(), jit_vm()]
}

/// Build a function named `name` over `globals` and bind it there.
pub fn define(
    vm: &Vm,
    globals: &Arc<DictObject>,
    name: &str,
    build: impl FnOnce(&mut FunctionBuilder),
) -> Arc<FunctionObject> {
    let mut b = FunctionBuilder::new(name);
    b.set_filename("test.py");
    build(&mut b);
    let f = vm.new_function(Arc::new(b.finish().unwrap()), globals.clone());
    globals.set_str(name, Value::Function(f.clone()));
    f
}

/// A function of the `jit` module.
pub fn jit_fn(vm: &Vm, name: &str) -> Value {
    match vm.runtime().builtins().get_str("jit") {
        Some(Value::Module(m)) => m.dict.get_str(name).unwrap(),
        other => panic!("jit module missing: {:?}", other),
    }
}

/// A builtin by name.
pub fn builtin(vm: &Vm, name: &str) -> Value {
    vm.runtime().builtins().get_str(name).unwrap()
}

/// Contents of a list value.
pub fn list_items(v: &Value) -> Vec<Value> {
    match v {
        Value::List(l) => l.snapshot(),
        other => panic!("expected a list, got {:?}", other),
    }
}

/// Contents of a tuple value as ints.
pub fn int_tuple(v: &Value) -> Vec<i64> {
    match v {
        Value::Tuple(items) => items.iter().map(|i| i.as_int().unwrap()).collect(),
        other => panic!("expected a tuple, got {:?}", other),
    }
}

/// Item `key` of a dict value.
pub fn dict_item(v: &Value, key: &str) -> Value {
    match v {
        Value::Dict(d) => d.get_str(key).unwrap(),
        other => panic!("expected a dict, got {:?}", other),
    }
}
