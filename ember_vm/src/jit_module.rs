//! JIT introspection and control.
//!
//! The same operations are available as methods on [`Vm`] and as builtins
//! of the `jit` module in the builtins namespace.

use crate::builtins::{check_args, BuiltinFn, BuiltinFunction};
use crate::deopt::DeoptKey;
use crate::generator::GeneratorObject;
use crate::inline_cache::SiteKind;
use crate::jit_driver::BatchStats;
use crate::vm::Vm;
use ember_runtime::{DictObject, FrameMode, FunctionObject, PyErr, PyResult, Value};
use std::sync::Arc;

// =============================================================================
// Rust API
// =============================================================================

impl Vm {
    pub fn is_jit_compiled(&self, func: &FunctionObject) -> bool {
        self.runtime().driver().is_compiled(func)
    }

    /// Compile `func` now. `false` when the JIT is disabled or refuses it.
    pub fn force_compile(&self, func: &Arc<FunctionObject>) -> bool {
        self.runtime().driver().force_compile(func)
    }

    /// Never compile `func`.
    pub fn jit_suppress(&self, func: &FunctionObject) {
        self.runtime().driver().suppress(func);
    }

    pub fn is_jit_suppressed(&self, func: &FunctionObject) -> bool {
        self.runtime().driver().is_suppressed(func)
    }

    /// Drop the compiled unit of `func`.
    pub fn deopt_function(&self, func: &FunctionObject) -> bool {
        self.runtime().driver().deopt_function(func)
    }

    pub fn disable_jit(&self, deopt_all: bool) {
        self.runtime().driver().disable(deopt_all);
    }

    pub fn enable_jit(&self) {
        self.runtime().driver().enable();
    }

    pub fn precompile_all(&self, workers: Option<usize>) -> BatchStats {
        self.runtime().driver().precompile_all(workers)
    }

    /// Move a suspended compiled generator to the interpreter.
    pub fn deopt_generator(&mut self, gen: &Value) -> PyResult<bool> {
        let Some(g) = gen.downcast_ref::<GeneratorObject>() else {
            return Err(PyErr::type_error(format!(
                "expected a generator, got '{}'",
                gen.type_name()
            )));
        };
        Ok(g.deopt_suspended(self))
    }

    /// Deopt counters since the last call.
    pub fn take_deopt_stats(&self) -> Vec<(DeoptKey, u64)> {
        self.runtime().deopt_stats().get_and_clear()
    }

    pub fn num_inlined_functions(&self, func: &FunctionObject) -> usize {
        self.runtime().driver().num_inlined(func)
    }

    /// Listing of the compiled unit of `func`, or of its bytecode when it
    /// has none.
    pub fn disassemble(&self, func: &FunctionObject) -> String {
        match self.runtime().driver().cache().lookup(func.id()) {
            Some(unit) => unit.disassemble(),
            None => ember_bytecode::disassemble(&func.code),
        }
    }

    /// Machine code size of `func` in bytes, 0 when not compiled.
    pub fn compiled_size(&self, func: &FunctionObject) -> usize {
        self.runtime()
            .driver()
            .cache()
            .lookup(func.id())
            .map_or(0, |unit| unit.size)
    }

    pub fn jit_frame_mode(&self) -> FrameMode {
        if self.runtime().config().shadow_frame {
            FrameMode::Shadow
        } else {
            FrameMode::Normal
        }
    }
}

// =============================================================================
// Builtins
// =============================================================================

/// Register the `jit` module functions in `dict`.
pub fn populate(dict: &DictObject) {
    let functions: [(&str, BuiltinFn); 20] = [
        ("is_jit_compiled", jit_is_jit_compiled),
        ("force_compile", jit_force_compile),
        ("jit_suppress", jit_jit_suppress),
        ("is_jit_suppressed", jit_is_jit_suppressed),
        ("deopt_function", jit_deopt_function),
        ("disable", jit_disable),
        ("enable", jit_enable),
        ("is_enabled", jit_is_enabled),
        ("precompile_all", jit_precompile_all),
        ("get_and_clear_runtime_stats", jit_get_and_clear_runtime_stats),
        ("get_num_inlined_functions", jit_get_num_inlined_functions),
        ("get_inlined_functions_stats", jit_get_inlined_functions_stats),
        ("_deopt_gen", jit_deopt_gen),
        ("page_in_profiler_dependencies", jit_page_in_profiler_dependencies),
        ("get_compiled_functions", jit_get_compiled_functions),
        ("jit_frame_mode", jit_jit_frame_mode),
        ("get_and_clear_inline_cache_stats", jit_get_and_clear_inline_cache_stats),
        ("disassemble", jit_disassemble),
        ("get_compiled_size", jit_get_compiled_size),
        ("get_jit_list", jit_get_jit_list),
    ];
    for (name, func) in functions {
        dict.set_str(name, BuiltinFunction::value(name, func));
    }
}

fn function_arg<'a>(name: &str, args: &'a [Value]) -> PyResult<&'a Arc<FunctionObject>> {
    check_args(name, args, 1, 1)?;
    match &args[0] {
        Value::Function(f) => Ok(f),
        other => Err(PyErr::type_error(format!(
            "{}() expected a function, got '{}'",
            name,
            other.type_name()
        ))),
    }
}

fn dict_value(pairs: Vec<(&str, Value)>) -> Value {
    Value::Dict(Arc::new(DictObject::from_pairs(pairs)))
}

fn jit_is_jit_compiled(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("is_jit_compiled", &args, 1, 1)?;
    Ok(Value::Bool(match &args[0] {
        Value::Function(f) => vm.is_jit_compiled(f),
        _ => false,
    }))
}

fn jit_force_compile(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    let func = function_arg("force_compile", &args)?;
    Ok(Value::Bool(vm.force_compile(func)))
}

fn jit_jit_suppress(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    let func = function_arg("jit_suppress", &args)?;
    vm.jit_suppress(func);
    Ok(args[0].clone())
}

fn jit_is_jit_suppressed(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    let func = function_arg("is_jit_suppressed", &args)?;
    Ok(Value::Bool(vm.is_jit_suppressed(func)))
}

fn jit_deopt_function(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    let func = function_arg("deopt_function", &args)?;
    Ok(Value::Bool(vm.deopt_function(func)))
}

fn jit_disable(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("disable", &args, 0, 1)?;
    let deopt_all = match args.first() {
        None => false,
        Some(Value::Bool(b)) => *b,
        Some(other) => {
            return Err(PyErr::type_error(format!(
                "disable() argument 'deopt_all' must be bool, not '{}'",
                other.type_name()
            )))
        }
    };
    vm.disable_jit(deopt_all);
    Ok(Value::None)
}

fn jit_enable(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("enable", &args, 0, 0)?;
    vm.enable_jit();
    Ok(Value::None)
}

fn jit_is_enabled(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("is_enabled", &args, 0, 0)?;
    Ok(Value::Bool(vm.runtime().driver().is_enabled()))
}

fn jit_precompile_all(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("precompile_all", &args, 0, 1)?;
    let workers = match args.first() {
        None | Some(Value::None) => None,
        Some(Value::Int(n)) if *n > 0 => Some(*n as usize),
        Some(other) => {
            return Err(PyErr::value_error(format!(
                "precompile_all() workers must be a positive int, not {}",
                other.repr()
            )))
        }
    };
    if !vm.runtime().driver().is_enabled() {
        return Ok(Value::Bool(false));
    }
    vm.precompile_all(workers);
    Ok(Value::Bool(true))
}

fn jit_get_and_clear_runtime_stats(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("get_and_clear_runtime_stats", &args, 0, 0)?;
    let events = vm
        .take_deopt_stats()
        .into_iter()
        .map(|(key, count)| {
            dict_value(vec![
                ("func_qualname", Value::Str(key.func_qualname)),
                ("filename", Value::Str(key.filename)),
                ("lineno", Value::Int(key.lineno as i64)),
                ("reason", Value::str(key.reason.name())),
                ("description", Value::str(&key.description)),
                ("guilty_type", key.guilty_type.as_deref().map_or(Value::None, Value::str)),
                ("count", Value::Int(count as i64)),
            ])
        })
        .collect();
    Ok(dict_value(vec![("deopt", Value::new_list(events))]))
}

fn jit_get_num_inlined_functions(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    let func = function_arg("get_num_inlined_functions", &args)?;
    Ok(Value::Int(vm.num_inlined_functions(func) as i64))
}

fn jit_get_inlined_functions_stats(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    let func = function_arg("get_inlined_functions_stats", &args)?;
    let stats = vm.runtime().driver().inline_stats(func).unwrap_or_default();
    let failures = DictObject::new();
    for (reason, callees) in &stats.failures {
        let names = callees.iter().map(|n| Value::str(n)).collect();
        failures.set_str(reason.name(), Value::new_list(names));
    }
    Ok(dict_value(vec![
        ("num_inlined_functions", Value::Int(stats.num_inlined as i64)),
        ("failure_stats", Value::Dict(Arc::new(failures))),
    ]))
}

fn jit_deopt_gen(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("_deopt_gen", &args, 1, 1)?;
    vm.deopt_generator(&args[0]).map(Value::Bool)
}

fn jit_page_in_profiler_dependencies(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("page_in_profiler_dependencies", &args, 0, 0)?;
    let names = vm
        .runtime()
        .driver()
        .page_in_profiler_dependencies()
        .iter()
        .map(|n| Value::str(n))
        .collect();
    Ok(Value::new_list(names))
}

fn jit_get_compiled_functions(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("get_compiled_functions", &args, 0, 0)?;
    let funcs = vm
        .runtime()
        .driver()
        .compiled_functions()
        .into_iter()
        .map(Value::Function)
        .collect();
    Ok(Value::new_list(funcs))
}

fn jit_jit_frame_mode(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("jit_frame_mode", &args, 0, 0)?;
    Ok(Value::Int(match vm.jit_frame_mode() {
        FrameMode::Normal => 0,
        FrameMode::Shadow => 1,
    }))
}

fn jit_get_and_clear_inline_cache_stats(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("get_and_clear_inline_cache_stats", &args, 0, 0)?;
    let (hits, misses) = vm.runtime().ic_stats().get_and_clear();
    let load_attr = DictObject::new();
    let store_attr = DictObject::new();
    let load_method = DictObject::new();
    for ((kind, reason), count) in misses {
        let target = match kind {
            SiteKind::LoadAttr => &load_attr,
            SiteKind::StoreAttr => &store_attr,
            SiteKind::LoadMethod => &load_method,
        };
        target.set_str(reason.name(), Value::Int(count as i64));
    }
    Ok(dict_value(vec![
        ("hits", Value::Int(hits as i64)),
        ("load_attr_misses", Value::Dict(Arc::new(load_attr))),
        ("store_attr_misses", Value::Dict(Arc::new(store_attr))),
        ("load_method_misses", Value::Dict(Arc::new(load_method))),
    ]))
}

fn jit_disassemble(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    let func = function_arg("disassemble", &args)?;
    Ok(Value::str(&vm.disassemble(func)))
}

fn jit_get_compiled_size(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    let func = function_arg("get_compiled_size", &args)?;
    Ok(Value::Int(vm.compiled_size(func) as i64))
}

fn jit_get_jit_list(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    check_args("get_jit_list", &args, 0, 0)?;
    Ok(match vm.runtime().driver().jit_list() {
        Some(list) => Value::new_list(list.entries().iter().map(|e| Value::str(e)).collect()),
        None => Value::None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitConfig;
    use crate::vm::Runtime;
    use ember_bytecode::FunctionBuilder;
    use ember_runtime::builtin_types;

    fn vm(config: JitConfig) -> Vm {
        Vm::new(Runtime::new(config).unwrap())
    }

    fn jit(vm: &Vm, name: &str) -> Value {
        let module = vm.runtime().builtins().get_str("jit").unwrap();
        let Value::Module(m) = module else {
            panic!("jit is not a module");
        };
        m.dict.get_str(name).unwrap()
    }

    fn one(vm: &Vm) -> Arc<FunctionObject> {
        let mut b = FunctionBuilder::new("one");
        b.load_int(1);
        b.return_value();
        vm.new_function(Arc::new(b.finish().unwrap()), Arc::new(DictObject::new()))
    }

    #[test]
    fn test_disable_rejects_bad_arguments() {
        let mut vm = vm(JitConfig::enabled());
        let disable = jit(&vm, "disable");
        let err = vm.call(&disable, vec![Value::Int(1), Value::Int(2)]).unwrap_err();
        assert!(err.matches(&builtin_types().type_error));
        let err = vm.call(&disable, vec![Value::None]).unwrap_err();
        assert!(err.matches(&builtin_types().type_error));
        assert!(vm.runtime().driver().is_enabled());
        vm.call(&disable, vec![]).unwrap();
        assert!(!vm.runtime().driver().is_enabled());
    }

    #[test]
    fn test_force_compile_and_query() {
        let mut vm = vm(JitConfig::enabled());
        let f = Value::Function(one(&vm));
        let force = jit(&vm, "force_compile");
        let is_compiled = jit(&vm, "is_jit_compiled");
        assert!(vm.call(&force, vec![f.clone()]).unwrap().is_truthy());
        assert!(vm.call(&is_compiled, vec![f.clone()]).unwrap().is_truthy());
        assert!(!vm.call(&is_compiled, vec![Value::Int(3)]).unwrap().is_truthy());
        let listed = vm.call(&jit(&vm, "get_compiled_functions"), vec![]).unwrap();
        let Value::List(listed) = listed else {
            panic!("expected a list");
        };
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn test_suppress_is_a_decorator() {
        let mut vm = vm(JitConfig::enabled());
        let f = Value::Function(one(&vm));
        let out = vm.call(&jit(&vm, "jit_suppress"), vec![f.clone()]).unwrap();
        assert!(out.is(&f));
        assert!(vm.call(&jit(&vm, "is_jit_suppressed"), vec![f.clone()]).unwrap().is_truthy());
        assert!(!vm.call(&jit(&vm, "force_compile"), vec![f]).unwrap().is_truthy());
    }

    #[test]
    fn test_force_compile_requires_function() {
        let mut vm = vm(JitConfig::enabled());
        let err = vm.call(&jit(&vm, "force_compile"), vec![Value::str("f")]).unwrap_err();
        assert!(err.matches(&builtin_types().type_error));
    }

    #[test]
    fn test_frame_mode() {
        let mut vm = vm(JitConfig {
            shadow_frame: true,
            ..JitConfig::enabled()
        });
        let mode = vm.call(&jit(&vm, "jit_frame_mode"), vec![]).unwrap();
        assert_eq!(mode.as_int(), Some(1));
    }

    #[test]
    fn test_page_in_lists_compiled_code() {
        let mut vm = vm(JitConfig::enabled());
        let f = one(&vm);
        assert!(vm.force_compile(&f));
        let deps = vm.call(&jit(&vm, "page_in_profiler_dependencies"), vec![]).unwrap();
        let Value::List(deps) = deps else {
            panic!("expected a list");
        };
        assert!(deps.snapshot().iter().any(|v| matches!(v, Value::Str(s) if &**s == "one")));
    }

    #[test]
    fn test_disassemble_and_size() {
        let mut vm = vm(JitConfig::enabled());
        let f = one(&vm);
        let disassemble = jit(&vm, "disassemble");
        let size = jit(&vm, "get_compiled_size");

        let text = vm.call(&disassemble, vec![Value::Function(f.clone())]).unwrap();
        assert!(matches!(&text, Value::Str(s) if s.starts_with("Code object: one")));
        assert_eq!(vm.call(&size, vec![Value::Function(f.clone())]).unwrap().as_int(), Some(0));

        assert!(vm.force_compile(&f));
        let text = vm.call(&disassemble, vec![Value::Function(f.clone())]).unwrap();
        assert!(matches!(&text, Value::Str(s) if s.starts_with("unit ")));
        let bytes = vm.call(&size, vec![Value::Function(f.clone())]).unwrap().as_int().unwrap();
        assert!(bytes > 0);
        assert_eq!(bytes as usize, vm.compiled_size(&f));
    }

    #[test]
    fn test_get_jit_list() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"app:main\napp:*.handle\napp:Server.run\n").unwrap();
        let mut plain = vm(JitConfig::enabled());
        let mut listing = vm(JitConfig {
            jit_list_file: Some(file.path().to_path_buf()),
            jit_list_wildcards: true,
            ..JitConfig::enabled()
        });

        let get_jit_list = jit(&plain, "get_jit_list");
        assert!(plain.call(&get_jit_list, vec![]).unwrap().is_none());

        let get_jit_list = jit(&listing, "get_jit_list");
        let Value::List(listed) = listing.call(&get_jit_list, vec![]).unwrap() else {
            panic!("expected a list");
        };
        let names: Vec<String> = listed
            .snapshot()
            .iter()
            .map(|v| match v {
                Value::Str(s) => s.to_string(),
                other => panic!("unexpected entry {:?}", other),
            })
            .collect();
        assert_eq!(names, ["app:Server.run", "app:main", "app:*.handle"]);
    }
}
