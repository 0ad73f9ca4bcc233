//! Process runtime and per-thread virtual machine.
//!
//! A [`Runtime`] is shared by every thread through an `Arc`: it owns the
//! configuration, the JIT driver and code cache, the global-load cache, the
//! counters and the builtins namespace. A [`Vm`] is owned by one thread and
//! holds that thread's shadow stack.
//!
//! Every call goes through [`Vm::call`]:
//!
//! ```text
//! call(callable, args)
//!   ├─ Function ──bind args──▶ resumable? ──▶ generator object
//!   │                            │ no
//!   │                            ▼
//!   │                  driver.unit_for_call ──Some──▶ compiled code ──deopt──▶ interpreter
//!   │                            │ None
//!   │                            ▼
//!   │                       interpreter
//!   ├─ BoundMethod / StaticMethod ──▶ unwrap and call again
//!   ├─ Type ──▶ instance construction
//!   ├─ builtin ──▶ native Rust function
//!   └─ Instance ──▶ __call__
//! ```

use crate::builtins::{self, BuiltinFunction};
use crate::config::{ConfigError, JitConfig};
use crate::deopt::{self, DeoptStats};
use crate::executor::{self, ExecExit, Word};
use crate::generator;
use crate::global_cache::GlobalCacheManager;
use crate::inline_cache::IcStats;
use crate::interpreter::{self, check_primitive, Frame, FrameExit, Resume};
use crate::jit_driver::JitDriver;
use crate::native::NativeLibraries;
use crate::ops;
use crate::shadow::{FrameKind, FrameObject, ShadowFrame, ShadowStack};
use ember_bytecode::{CodeFlags, CodeObject, NativeSignature};
use ember_jit::{CompiledUnit, ValueKind};
use ember_runtime::finalize::{self, PendingFinalizer};
use ember_runtime::{DictObject, FrameMode, FunctionFlags, FunctionObject, PyErr, PyResult, Value};
use std::fmt;
use std::sync::Arc;

/// Nested calls allowed before `RecursionError`.
pub const DEFAULT_RECURSION_LIMIT: usize = 128;

// =============================================================================
// Runtime
// =============================================================================

/// State shared by every thread of the process.
pub struct Runtime {
    config: JitConfig,
    driver: JitDriver,
    globals: Arc<GlobalCacheManager>,
    deopt_stats: DeoptStats,
    ic_stats: Arc<IcStats>,
    natives: NativeLibraries,
    builtins: Arc<DictObject>,
}

impl Runtime {
    /// Runtime for a resolved configuration.
    pub fn new(config: JitConfig) -> Result<Arc<Self>, ConfigError> {
        let driver = JitDriver::new(&config)?;
        tracing::debug!(
            enabled = config.enabled,
            threshold = config.compile_threshold,
            shadow_frame = config.shadow_frame,
            "runtime created"
        );
        Ok(Arc::new(Self {
            config,
            driver,
            globals: GlobalCacheManager::new(),
            deopt_stats: DeoptStats::new(),
            ic_stats: Arc::new(IcStats::new()),
            natives: NativeLibraries::new(),
            builtins: Arc::new(builtins::make_builtins()),
        }))
    }

    /// Runtime configured from `-X` options and the environment.
    pub fn from_x_options<S: AsRef<str>>(x_options: &[S]) -> Result<Arc<Self>, ConfigError> {
        Self::new(JitConfig::resolve(x_options)?)
    }

    #[inline]
    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    #[inline]
    pub fn driver(&self) -> &JitDriver {
        &self.driver
    }

    #[inline]
    pub fn globals(&self) -> &Arc<GlobalCacheManager> {
        &self.globals
    }

    #[inline]
    pub fn deopt_stats(&self) -> &DeoptStats {
        &self.deopt_stats
    }

    #[inline]
    pub fn ic_stats(&self) -> &Arc<IcStats> {
        &self.ic_stats
    }

    #[inline]
    pub fn natives(&self) -> &NativeLibraries {
        &self.natives
    }

    /// The builtins namespace every function created by a [`Vm`] uses.
    #[inline]
    pub fn builtins(&self) -> &Arc<DictObject> {
        &self.builtins
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("driver", &self.driver)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Vm
// =============================================================================

/// Per-thread execution state.
pub struct Vm {
    runtime: Arc<Runtime>,
    pub(crate) shadow: ShadowStack,
    depth: usize,
    recursion_limit: usize,
    in_safepoint: bool,
}

impl Vm {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            shadow: ShadowStack::new(),
            depth: 0,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            in_safepoint: false,
        }
    }

    #[inline]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    #[inline]
    pub fn recursion_limit(&self) -> usize {
        self.recursion_limit
    }

    pub fn set_recursion_limit(&mut self, limit: usize) {
        self.recursion_limit = limit.max(1);
    }

    /// Activations on this thread, inlined ones included.
    #[inline]
    pub fn stack_depth(&self) -> usize {
        self.shadow.len()
    }

    /// Frame object `depth` levels below the innermost activation.
    pub fn frame(&mut self, depth: usize) -> Option<Arc<FrameObject>> {
        self.shadow.frame_at_depth(depth)
    }

    // =========================================================================
    // Functions
    // =========================================================================

    /// Function over `code` in module `globals`, registered with the driver.
    pub fn new_function(&self, code: Arc<CodeObject>, globals: Arc<DictObject>) -> Arc<FunctionObject> {
        let func = FunctionObject::new(code, globals, self.runtime.builtins.clone());
        self.adopt(func)
    }

    /// Function whose body is the native symbol named by `sig`.
    pub fn new_native_function(
        &self,
        code: Arc<CodeObject>,
        globals: Arc<DictObject>,
        sig: NativeSignature,
    ) -> PyResult<Arc<FunctionObject>> {
        let func = FunctionObject::new_native(code, globals, self.runtime.builtins.clone(), Arc::new(sig))?;
        Ok(self.adopt(func))
    }

    fn adopt(&self, func: FunctionObject) -> Arc<FunctionObject> {
        if self.runtime.config.shadow_frame {
            func.add_flags(FunctionFlags::SHADOW_FRAME);
        }
        let func = Arc::new(func);
        self.runtime.driver.register(&func);
        func
    }

    /// `MakeFunction`: a function over `code` defined inside `parent`.
    pub fn make_function_value(
        &self,
        code: &Value,
        parent: &Arc<FunctionObject>,
        defaults: Option<&Value>,
    ) -> PyResult<Value> {
        let Value::Code(code) = code else {
            return Err(PyErr::type_error(format!(
                "function body must be a code object, not '{}'",
                code.type_name()
            )));
        };
        let func = FunctionObject::new(code.clone(), parent.globals.clone(), parent.builtins.clone());
        match defaults {
            None => {}
            Some(Value::Tuple(items)) => func.set_defaults(Some(items.clone())),
            Some(other) => {
                return Err(PyErr::type_error(format!(
                    "defaults must be a tuple, not '{}'",
                    other.type_name()
                )))
            }
        }
        Ok(Value::Function(self.adopt(func)))
    }

    /// Run a module body with `globals` as its namespace.
    pub fn run_module(&mut self, code: Arc<CodeObject>, globals: Arc<DictObject>) -> PyResult<Value> {
        let func = self.new_function(code, globals);
        self.call_function(&func, Vec::new())
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Call any callable value.
    pub fn call(&mut self, callable: &Value, mut args: Vec<Value>) -> PyResult<Value> {
        match callable {
            Value::Function(f) => self.call_function(f, args),
            Value::BoundMethod(m) => {
                args.insert(0, m.receiver.clone());
                let func = m.func.clone();
                self.call(&func, args)
            }
            Value::StaticMethod(s) => {
                let func = s.func.clone();
                self.call(&func, args)
            }
            Value::Type(class) => builtins::construct(self, class, args),
            Value::Native(obj) => match obj.as_any().downcast_ref::<BuiltinFunction>() {
                Some(builtin) => builtin.call(self, args),
                None => Err(not_callable(callable)),
            },
            Value::Instance(_) => {
                ops::call_special(self, callable, "__call__", args)?.ok_or_else(|| not_callable(callable))
            }
            _ => Err(not_callable(callable)),
        }
    }

    /// Call a function object through the generic calling convention.
    pub fn call_function(&mut self, func: &Arc<FunctionObject>, args: Vec<Value>) -> PyResult<Value> {
        if func.native().is_some() {
            return Err(PyErr::runtime_error(format!(
                "cannot call native function '{}' outside static code",
                func.qualname
            )));
        }
        self.invoke(func, args)
    }

    /// `CallStatic`: a direct call from static code, which may target a
    /// native function.
    pub fn call_static(&mut self, func: &Arc<FunctionObject>, args: Vec<Value>) -> PyResult<Value> {
        let Some(sig) = func.native() else {
            return self.invoke(func, args);
        };
        let mut words = Vec::with_capacity(args.len());
        for (value, kind) in args.into_iter().zip(sig.params.iter()) {
            check_primitive(&value, *kind)?;
            let word = Word::from_value(value, ValueKind::from_primitive(*kind))
                .ok_or_else(|| PyErr::type_error(format!("expected {}", kind.name())))?;
            words.push(word);
        }
        let result = self.runtime.natives.invoke(sig, &words)?;
        result
            .to_value(ValueKind::from_primitive(sig.ret))
            .ok_or_else(|| PyErr::type_error(format!("'{}' returned a malformed {}", sig.symbol, sig.ret.name())))
    }

    fn invoke(&mut self, func: &Arc<FunctionObject>, args: Vec<Value>) -> PyResult<Value> {
        let locals = bind_args(func, args)?;
        if self.depth >= self.recursion_limit {
            return Err(PyErr::recursion_error("maximum recursion depth exceeded"));
        }
        let unit = self.runtime.driver.unit_for_call(func);
        if func.code.is_resumable() {
            return Ok(generator::create(func, locals, unit));
        }
        self.depth += 1;
        let result = match unit {
            Some(unit) => self.run_compiled(unit, locals),
            None => self.run_interpreted(func, locals),
        };
        self.depth -= 1;
        result
    }

    /// Push the shadow entry of a new activation.
    ///
    /// In normal frame mode the frame object is allocated first, then
    /// pending finalizers run (they may push and pop frames of their own),
    /// and only then is the frame published and linked to its caller.
    fn enter(&mut self, func: &Arc<FunctionObject>, kind: FrameKind) -> usize {
        let mut entry = ShadowFrame::new(func.clone(), kind);
        match func.frame_mode() {
            FrameMode::Shadow => self.shadow.push(entry),
            FrameMode::Normal => {
                entry.materialize_detached();
                self.safepoint();
                let idx = self.shadow.push(entry);
                self.shadow.link(idx);
                idx
            }
        }
    }

    fn run_interpreted(&mut self, func: &Arc<FunctionObject>, locals: Vec<Option<Value>>) -> PyResult<Value> {
        let mut frame = Frame::new(func.clone(), locals);
        let idx = self.enter(func, FrameKind::Interpreted);
        let result = interpreter::run_frame(self, &mut frame, idx, Resume::Start);
        self.shadow.truncate(idx);
        drop(frame);
        self.safepoint();
        match result? {
            FrameExit::Return(v) => Ok(v),
            FrameExit::Yield(_) | FrameExit::Delegate(_) => Err(suspended(func)),
        }
    }

    fn run_compiled(&mut self, unit: Arc<CompiledUnit>, locals: Vec<Option<Value>>) -> PyResult<Value> {
        let func = unit.function().clone();
        let idx = self.enter(&func, FrameKind::Compiled { unit: unit.clone() });
        let mut regs = executor::entry_registers(&unit, locals);
        let result = match executor::run(self, &unit, &mut regs, 0, idx) {
            ExecExit::Return(v) => {
                drop(regs);
                Ok(v)
            }
            ExecExit::Deopt { id, err } => deopt::resume_function(self, &unit, id, err, regs, idx),
            ExecExit::Yield { .. } => {
                drop(regs);
                Err(suspended(&func))
            }
        };
        self.shadow.truncate(idx);
        self.safepoint();
        result
    }

    // =========================================================================
    // Safepoints
    // =========================================================================

    /// Run queued finalizers. Exceptions they raise are logged and dropped.
    pub fn safepoint(&mut self) {
        if self.in_safepoint || !finalize::has_pending() {
            return;
        }
        self.in_safepoint = true;
        loop {
            let pending = finalize::take_pending();
            if pending.is_empty() {
                break;
            }
            for PendingFinalizer { object, method } in pending {
                if let Err(err) = self.call(&method, vec![object]) {
                    tracing::warn!(error = %err, "exception ignored in __del__");
                }
            }
        }
        self.in_safepoint = false;
    }
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("depth", &self.depth)
            .field("shadow", &self.shadow.len())
            .finish_non_exhaustive()
    }
}

fn not_callable(v: &Value) -> PyErr {
    PyErr::type_error(format!("'{}' object is not callable", v.type_name()))
}

fn suspended(func: &FunctionObject) -> PyErr {
    PyErr::runtime_error(format!("'{}' suspended outside a generator", func.qualname))
}

/// Bind positional `args` to the parameter slots of `func`.
fn bind_args(func: &FunctionObject, mut args: Vec<Value>) -> PyResult<Vec<Option<Value>>> {
    let code = &func.code;
    let argc = code.arg_count as usize;
    let varargs = code.flags.contains(CodeFlags::VARARGS);

    if args.len() > argc && !varargs {
        return Err(PyErr::type_error(format!(
            "{}() takes {} positional argument{} but {} were given",
            code.qualname,
            argc,
            if argc == 1 { "" } else { "s" },
            args.len()
        )));
    }
    let extra = if args.len() > argc { args.split_off(argc) } else { Vec::new() };

    let mut locals: Vec<Option<Value>> = args.into_iter().map(Some).collect();
    if locals.len() < argc {
        let defaults = func.defaults().unwrap_or_else(|| Arc::from([]));
        let first_default = argc.saturating_sub(defaults.len());
        for i in locals.len()..argc {
            match i.checked_sub(first_default).and_then(|d| defaults.get(d)) {
                Some(v) => locals.push(Some(v.clone())),
                None => {
                    return Err(PyErr::type_error(format!(
                        "{}() missing required argument: '{}'",
                        code.qualname,
                        code.varnames.get(i).map_or("?", |n| &**n)
                    )))
                }
            }
        }
    }

    if code.kwonlyarg_count > 0 {
        let name = code.varnames.get(argc).map_or("?", |n| &**n);
        return Err(PyErr::type_error(format!(
            "{}() missing required keyword-only argument: '{}'",
            code.qualname, name
        )));
    }
    if varargs {
        locals.push(Some(Value::tuple(extra)));
    }
    if code.flags.contains(CodeFlags::VARKEYWORDS) {
        locals.push(Some(Value::new_dict()));
    }

    for (slot, value) in locals.iter().enumerate().take(argc) {
        if let (Some(kind), Some(value)) = (code.local_type(slot).primitive(), value) {
            check_primitive(value, kind)?;
        }
    }
    Ok(locals)
}
