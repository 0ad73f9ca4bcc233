//! Inline Cache Benchmarks
//!
//! Measures attribute access through a cached site against the uncached
//! lookup, and the cost of whole calls in each execution mode.
//!
//! # Benchmark Categories
//!
//! 1. **Attribute Loads**: monomorphic hit, polymorphic hit, uncached lookup
//! 2. **Method Loads**: cached `o.m()` against a bound-method lookup
//! 3. **Calls**: interpreted and compiled `f(x, y)`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ember_bytecode::{BinOp, CodeObject, FunctionBuilder};
use ember_runtime::{DictObject, FunctionObject, Instance, TypeObject, Value};
use ember_vm::{attr, inline_cache, JitConfig, Runtime, Vm};
use std::sync::Arc;

// =============================================================================
// Benchmark Helpers
// =============================================================================

fn vm(config: JitConfig) -> Vm {
    Vm::new(Runtime::new(config).unwrap())
}

fn class_with(name: &str, attrs: Vec<(&str, Value)>) -> Arc<TypeObject> {
    let ns = attrs.into_iter().map(|(k, v)| (Arc::from(k), v)).collect();
    TypeObject::new_class(name, "bench", Vec::new(), ns).unwrap()
}

/// Code with a single `LoadAttr x` site at offset 1.
fn attr_site() -> CodeObject {
    let mut b = FunctionBuilder::new("site");
    b.set_params(&["o"]);
    b.load_fast("o");
    b.load_attr("x");
    b.return_value();
    b.finish().unwrap()
}

fn adder(vm: &Vm) -> Arc<FunctionObject> {
    let mut b = FunctionBuilder::new("add");
    b.set_params(&["x", "y"]);
    b.load_fast("x");
    b.load_fast("y");
    b.binary(BinOp::Add);
    b.return_value();
    vm.new_function(Arc::new(b.finish().unwrap()), Arc::new(DictObject::new()))
}

// =============================================================================
// Attribute Loads
// =============================================================================

fn bench_load_attr(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_attr");

    group.bench_function("monomorphic_hit", |b| {
        let mut vm = vm(JitConfig::default());
        let code = attr_site();
        let obj = Value::Instance(Arc::new(Instance::new(class_with("C", vec![("x", Value::Int(1))]))));
        inline_cache::load_attr(&mut vm, &code, 1, &obj, "x").unwrap();
        b.iter(|| black_box(inline_cache::load_attr(&mut vm, &code, 1, black_box(&obj), "x").unwrap()));
    });

    group.bench_function("instance_dict_hit", |b| {
        let mut vm = vm(JitConfig::default());
        let code = attr_site();
        let inst = Arc::new(Instance::new(class_with("C", vec![])));
        inst.dict().set_str("x", Value::Int(1));
        let obj = Value::Instance(inst);
        inline_cache::load_attr(&mut vm, &code, 1, &obj, "x").unwrap();
        b.iter(|| black_box(inline_cache::load_attr(&mut vm, &code, 1, black_box(&obj), "x").unwrap()));
    });

    for n in [2usize, 4] {
        group.bench_with_input(BenchmarkId::new("polymorphic_hit", n), &n, |b, &n| {
            let mut vm = vm(JitConfig::default());
            let code = attr_site();
            let objs: Vec<Value> = (0..n)
                .map(|i| {
                    let class = class_with("C", vec![("x", Value::Int(i as i64))]);
                    Value::Instance(Arc::new(Instance::new(class)))
                })
                .collect();
            for obj in &objs {
                inline_cache::load_attr(&mut vm, &code, 1, obj, "x").unwrap();
            }
            b.iter(|| {
                for obj in &objs {
                    black_box(inline_cache::load_attr(&mut vm, &code, 1, obj, "x").unwrap());
                }
            });
        });
    }

    group.bench_function("uncached_lookup", |b| {
        let mut vm = vm(JitConfig::default());
        let obj = Value::Instance(Arc::new(Instance::new(class_with("C", vec![("x", Value::Int(1))]))));
        b.iter(|| black_box(attr::get_attr(&mut vm, black_box(&obj), "x").unwrap()));
    });

    group.finish();
}

// =============================================================================
// Method Loads
// =============================================================================

fn bench_load_method(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_method");

    let setup = || {
        let vm = vm(JitConfig::default());
        let mut b = FunctionBuilder::new("m");
        b.set_params(&["self"]);
        b.load_none();
        b.return_value();
        let m = vm.new_function(Arc::new(b.finish().unwrap()), Arc::new(DictObject::new()));
        let class = class_with("C", vec![("m", Value::Function(m))]);
        let obj = Value::Instance(Arc::new(Instance::new(class)));
        let mut b = FunctionBuilder::new("site");
        b.set_params(&["o"]);
        b.load_fast("o");
        b.load_method("m");
        b.call_method(0);
        b.return_value();
        (vm, b.finish().unwrap(), obj)
    };

    group.bench_function("cached", |b| {
        let (mut vm, code, obj) = setup();
        inline_cache::load_method(&mut vm, &code, 1, &obj, "m").unwrap();
        b.iter(|| black_box(inline_cache::load_method(&mut vm, &code, 1, black_box(&obj), "m").unwrap()));
    });

    group.bench_function("bound_lookup", |b| {
        let (mut vm, _, obj) = setup();
        b.iter(|| black_box(attr::get_attr(&mut vm, black_box(&obj), "m").unwrap()));
    });

    group.finish();
}

// =============================================================================
// Calls
// =============================================================================

fn bench_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("call");

    for (label, config) in [("interpreted", JitConfig::default()), ("compiled", JitConfig::enabled())] {
        group.bench_function(label, |b| {
            let mut vm = vm(config.clone());
            let f = adder(&vm);
            let args = || vec![Value::Int(2), Value::Int(3)];
            vm.call_function(&f, args()).unwrap();
            b.iter(|| black_box(vm.call_function(&f, args()).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_load_attr, bench_load_method, bench_calls);
criterion_main!(benches);
