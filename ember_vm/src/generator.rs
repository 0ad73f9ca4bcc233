//! Generators, coroutines and async generators.
//!
//! A generator is an explicit state machine:
//!
//! ```text
//!              send(None)             yield
//! NotStarted ─────────────▶ Running ─────────▶ Suspended
//!     │                      │  ▲                  │
//!     │ throw                │  └──── send/throw ──┘
//!     ▼                      ▼
//!  Completed ◀── return ── Running ── raise ──▶ Raised
//! ```
//!
//! The body is either an interpreted [`Frame`] or a compiled unit with its
//! register file spilled into a pooled buffer. A compiled body records
//! where it suspended; resuming it writes the sent value into the recorded
//! register and re-enters the unit. Throwing into a compiled body, or
//! forcing a deopt with `_deopt_gen`, rebuilds the interpreter frame from
//! the suspension point's metadata. That works before the first yield, at
//! any `yield`, and in the middle of a `yield from`/`await` delegation.
//!
//! While suspended the generator owns its shadow entry (`parked`), so its
//! materialized frame keeps its identity across resumptions.

use crate::attr;
use crate::builtins::BuiltinFunction;
use crate::deopt;
use crate::executor::{self, ExecExit, ResumePoint, Word};
use crate::interpreter::{self, Frame, FrameExit, Resume};
use crate::ops::{self, IterStep};
use crate::shadow::{FrameKind, ShadowFrame};
use crate::spill::SpillRegs;
use crate::vm::Vm;
use ember_bytecode::{CodeFlags, CodeObject, Opcode};
use ember_jit::CompiledUnit;
use ember_runtime::object::next_object_id;
use ember_runtime::{
    builtin_types, finalize, FunctionObject, NativeObject, PyErr, PyResult, TypeObject, Value,
};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// States
// =============================================================================

/// Flavor of a resumable body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenKind {
    Generator,
    Coroutine,
    AsyncGenerator,
}

impl GenKind {
    /// Flavor produced by calling a function with body `code`.
    pub fn of(code: &CodeObject) -> Self {
        if code.is_coroutine() {
            GenKind::Coroutine
        } else if code.is_async_generator() {
            GenKind::AsyncGenerator
        } else {
            GenKind::Generator
        }
    }

    /// Name used in messages.
    pub const fn name(self) -> &'static str {
        match self {
            GenKind::Generator => "generator",
            GenKind::Coroutine => "coroutine",
            GenKind::AsyncGenerator => "async generator",
        }
    }

    fn type_name(self) -> &'static str {
        match self {
            GenKind::Generator => "generator",
            GenKind::Coroutine => "coroutine",
            GenKind::AsyncGenerator => "async_generator",
        }
    }

    fn class(self) -> Arc<TypeObject> {
        let t = builtin_types();
        match self {
            GenKind::Generator => t.generator.clone(),
            GenKind::Coroutine => t.coroutine.clone(),
            GenKind::AsyncGenerator => t.async_generator.clone(),
        }
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenState {
    NotStarted,
    Suspended,
    Running,
    Completed,
    Raised,
}

/// Where a compiled body continues.
#[derive(Debug, Clone, Copy)]
enum CompiledResume {
    Start,
    At(ResumePoint),
}

enum Body {
    Interpreted(Box<Frame>),
    Compiled {
        unit: Arc<CompiledUnit>,
        regs: SpillRegs,
        resume: CompiledResume,
    },
    Empty,
}

impl Body {
    fn is_delegating(&self) -> bool {
        match self {
            Body::Interpreted(frame) => frame.delegating,
            Body::Compiled {
                resume: CompiledResume::At(ResumePoint::AtYieldFrom { .. }),
                ..
            } => true,
            _ => false,
        }
    }

    fn has_active_blocks(&self) -> bool {
        match self {
            Body::Interpreted(frame) => frame.has_active_blocks(),
            Body::Compiled {
                unit,
                resume: CompiledResume::At(point),
                ..
            } => unit
                .deopt(point.point())
                .and_then(|meta| meta.innermost())
                .map_or(false, |fm| !fm.blocks.is_empty()),
            _ => false,
        }
    }

    fn traverse(&self, visit: &mut dyn FnMut(&Value)) {
        match self {
            Body::Interpreted(frame) => frame.traverse(visit),
            Body::Compiled { regs, .. } => {
                for word in regs.iter() {
                    if let Word::Obj(v) = word {
                        visit(v);
                    }
                }
            }
            Body::Empty => {}
        }
    }
}

/// Input to a resumption.
#[derive(Debug)]
pub enum GenInput {
    Send(Value),
    Throw(PyErr),
}

/// Outcome of a resumption.
#[derive(Debug)]
pub enum GenStep {
    /// `yield` in the body.
    Yield(Value),
    /// A value passed through from a delegate.
    Delegate(Value),
    Return(Value),
}

impl From<FrameExit> for GenStep {
    fn from(exit: FrameExit) -> Self {
        match exit {
            FrameExit::Return(v) => GenStep::Return(v),
            FrameExit::Yield(v) => GenStep::Yield(v),
            FrameExit::Delegate(v) => GenStep::Delegate(v),
        }
    }
}

impl GenStep {
    fn into_iter_step(self) -> IterStep {
        match self {
            GenStep::Yield(v) | GenStep::Delegate(v) => IterStep::Yield(v),
            GenStep::Return(v) => IterStep::Return(v),
        }
    }
}

// =============================================================================
// Generator Object
// =============================================================================

struct GenInner {
    state: GenState,
    body: Body,
    parked: Option<ShadowFrame>,
    /// Already handed to the finalizer queue once.
    finalizing: bool,
}

/// A generator, coroutine or async generator.
pub struct GeneratorObject {
    id: u64,
    kind: GenKind,
    func: Arc<FunctionObject>,
    inner: Mutex<GenInner>,
}

enum Admit {
    Run(Body, ShadowFrame, bool, GenInput),
    Finished(GenInput),
    ThrowUnstarted(Body, PyErr),
}

/// Create the suspendable object for a call of `func`.
///
/// With a compiled `unit` the arguments go straight into a pooled register
/// file; otherwise an interpreter frame holds them.
pub fn create(func: &Arc<FunctionObject>, locals: Vec<Option<Value>>, unit: Option<Arc<CompiledUnit>>) -> Value {
    let kind = GenKind::of(&func.code);
    let (body, shadow_kind) = match unit {
        Some(unit) => {
            let mut regs = SpillRegs::acquire(unit.frame_size());
            executor::place_params(&unit, &mut regs, locals);
            let shadow_kind = FrameKind::Compiled { unit: unit.clone() };
            (
                Body::Compiled {
                    unit,
                    regs,
                    resume: CompiledResume::Start,
                },
                shadow_kind,
            )
        }
        None => (
            Body::Interpreted(Box::new(Frame::new(func.clone(), locals))),
            FrameKind::Interpreted,
        ),
    };
    Value::native(GeneratorObject {
        id: next_object_id(),
        kind,
        func: func.clone(),
        inner: Mutex::new(GenInner {
            state: GenState::NotStarted,
            body,
            parked: Some(ShadowFrame::new(func.clone(), shadow_kind)),
            finalizing: false,
        }),
    })
}

impl GeneratorObject {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> GenKind {
        self.kind
    }

    #[inline]
    pub fn func(&self) -> &Arc<FunctionObject> {
        &self.func
    }

    /// Current state.
    pub fn state(&self) -> GenState {
        self.inner.lock().state
    }

    /// Whether the body runs compiled code.
    pub fn is_compiled(&self) -> bool {
        matches!(self.inner.lock().body, Body::Compiled { .. })
    }

    /// Whether the body is suspended inside a delegation.
    pub fn is_delegating(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == GenState::Suspended && inner.body.is_delegating()
    }

    /// Resume the body with `input`.
    pub fn resume(&self, vm: &mut Vm, input: GenInput) -> PyResult<GenStep> {
        let admit = {
            let mut inner = self.inner.lock();
            match (inner.state, input) {
                (GenState::Running, _) => {
                    return Err(PyErr::value_error(format!(
                        "{} already executing",
                        self.kind.name()
                    )))
                }
                (GenState::Completed | GenState::Raised, input) => Admit::Finished(input),
                (GenState::NotStarted, GenInput::Send(v)) if !v.is_none() => {
                    return Err(PyErr::type_error(format!(
                        "can't send non-None value to a just-started {}",
                        self.kind.name()
                    )))
                }
                (GenState::NotStarted, GenInput::Throw(e)) => {
                    inner.state = GenState::Completed;
                    inner.parked = None;
                    let body = std::mem::replace(&mut inner.body, Body::Empty);
                    Admit::ThrowUnstarted(body, e)
                }
                (state, input) => {
                    let started = state != GenState::NotStarted;
                    inner.state = GenState::Running;
                    let body = std::mem::replace(&mut inner.body, Body::Empty);
                    let parked = inner
                        .parked
                        .take()
                        .unwrap_or_else(|| ShadowFrame::new(self.func.clone(), FrameKind::Interpreted));
                    Admit::Run(body, parked, started, input)
                }
            }
        };

        let (body, entry, started, input) = match admit {
            Admit::Run(body, entry, started, input) => (body, entry, started, input),
            Admit::Finished(GenInput::Send(_)) if self.kind == GenKind::Coroutine => {
                return Err(PyErr::runtime_error("cannot reuse already awaited coroutine"))
            }
            Admit::Finished(GenInput::Send(_)) => return Ok(GenStep::Return(Value::None)),
            Admit::Finished(GenInput::Throw(e)) => return Err(e),
            Admit::ThrowUnstarted(body, e) => {
                drop(body);
                vm.safepoint();
                return Err(e);
            }
        };

        let relink = entry.frame.is_some();
        let idx = vm.shadow.push(entry);
        if relink {
            vm.shadow.link(idx);
        }
        let (body, result) = self.run_body(vm, body, idx, input, started);
        vm.shadow.truncate(idx + 1);
        let mut entry = vm.shadow.pop();
        if let Some(entry) = entry.as_mut() {
            entry.park();
        }

        let (result, dead) = {
            let mut inner = self.inner.lock();
            match result {
                Ok(step @ (GenStep::Yield(_) | GenStep::Delegate(_))) => {
                    inner.state = GenState::Suspended;
                    inner.body = body;
                    inner.parked = entry;
                    (Ok(step), None)
                }
                Ok(GenStep::Return(v)) => {
                    inner.state = GenState::Completed;
                    (Ok(GenStep::Return(v)), Some(body))
                }
                Err(e) => {
                    inner.state = GenState::Raised;
                    (Err(self.translate_escape(e)), Some(body))
                }
            }
        };
        drop(dead);
        vm.safepoint();
        result
    }

    /// Exceptions that may not escape a resumable body unchanged.
    fn translate_escape(&self, err: PyErr) -> PyErr {
        let t = builtin_types();
        let replacement = if err.matches(&t.stop_iteration) {
            format!("{} raised StopIteration", self.kind.name())
        } else if self.kind == GenKind::AsyncGenerator && err.matches(&t.stop_async_iteration) {
            "async generator raised StopAsyncIteration".to_string()
        } else {
            return err;
        };
        let new = PyErr::runtime_error(replacement);
        new.exception().set_cause(Some(err.exception().clone()));
        new
    }

    fn run_body(
        &self,
        vm: &mut Vm,
        body: Body,
        idx: usize,
        input: GenInput,
        started: bool,
    ) -> (Body, PyResult<GenStep>) {
        match body {
            Body::Interpreted(mut frame) => {
                let resume = match input {
                    GenInput::Send(_) if !started => Resume::Start,
                    GenInput::Send(v) => Resume::Send(v),
                    GenInput::Throw(e) => Resume::Throw(e),
                };
                let result = interpreter::run_frame(vm, &mut frame, idx, resume).map(GenStep::from);
                (Body::Interpreted(frame), result)
            }
            Body::Compiled {
                unit,
                mut regs,
                resume,
            } => {
                let pc = match (resume, input) {
                    (CompiledResume::Start, GenInput::Send(_)) => 0,
                    (CompiledResume::At(point), GenInput::Send(v)) => point.accept(&unit, &mut regs, v),
                    (resume, GenInput::Throw(e)) => {
                        let frame = suspended_frame(vm, &unit, regs, resume);
                        if let Some(entry) = vm.shadow.get_mut(idx) {
                            entry.kind = FrameKind::Interpreted;
                            entry.pc = frame.pc;
                        }
                        let body = Body::Interpreted(Box::new(frame));
                        return self.run_body(vm, body, idx, GenInput::Throw(e), true);
                    }
                };
                match executor::run(vm, &unit, &mut regs, pc, idx) {
                    ExecExit::Return(v) => {
                        drop(regs);
                        (Body::Empty, Ok(GenStep::Return(v)))
                    }
                    ExecExit::Yield {
                        value,
                        resume,
                        delegated,
                    } => {
                        let step = if delegated {
                            GenStep::Delegate(value)
                        } else {
                            GenStep::Yield(value)
                        };
                        let body = Body::Compiled {
                            unit,
                            regs,
                            resume: CompiledResume::At(resume),
                        };
                        (body, Ok(step))
                    }
                    ExecExit::Deopt { id, err } => {
                        let (mut frame, resume) = deopt::resume_frames(vm, &unit, id, err, regs, idx);
                        let result = interpreter::run_frame(vm, &mut frame, idx, resume).map(GenStep::from);
                        (Body::Interpreted(Box::new(frame)), result)
                    }
                }
            }
            Body::Empty => (
                Body::Empty,
                Err(PyErr::runtime_error(format!(
                    "{} has no body to run",
                    self.kind.name()
                ))),
            ),
        }
    }

    /// Move a suspended compiled body to the interpreter.
    ///
    /// Returns `false` when the body is not compiled or is running.
    pub fn deopt_suspended(&self, vm: &mut Vm) -> bool {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, GenState::NotStarted | GenState::Suspended) {
            return false;
        }
        let Body::Compiled { .. } = inner.body else {
            return false;
        };
        let Body::Compiled { unit, regs, resume } = std::mem::replace(&mut inner.body, Body::Empty) else {
            return false;
        };
        let frame = suspended_frame(vm, &unit, regs, resume);
        if let Some(parked) = inner.parked.as_mut() {
            parked.kind = FrameKind::Interpreted;
            parked.pc = frame.pc;
            parked.park();
        }
        inner.body = Body::Interpreted(Box::new(frame));
        true
    }

    /// `close()`.
    pub fn close(&self, vm: &mut Vm) -> PyResult<Value> {
        match self.state() {
            GenState::NotStarted => {
                let body = {
                    let mut inner = self.inner.lock();
                    inner.state = GenState::Completed;
                    inner.parked = None;
                    std::mem::replace(&mut inner.body, Body::Empty)
                };
                drop(body);
                return Ok(Value::None);
            }
            GenState::Completed | GenState::Raised => return Ok(Value::None),
            _ => {}
        }
        let t = builtin_types();
        match self.resume(vm, GenInput::Throw(PyErr::generator_exit())) {
            Ok(GenStep::Yield(_)) | Ok(GenStep::Delegate(_)) => Err(PyErr::runtime_error(format!(
                "{} ignored GeneratorExit",
                self.kind.name()
            ))),
            Ok(GenStep::Return(v)) => Ok(v),
            Err(e) if e.matches(&t.generator_exit) || e.matches(&t.stop_iteration) => Ok(Value::None),
            Err(e) => Err(e),
        }
    }

    /// `gi_frame`: the frame of a suspended or unstarted body.
    pub fn frame(&self) -> Option<Value> {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, GenState::NotStarted | GenState::Suspended) {
            return None;
        }
        let frame = inner.parked.as_mut()?.materialize_detached();
        Some(Value::Native(frame))
    }
}

/// Interpreter frame of a compiled body suspended at `resume`.
fn suspended_frame(vm: &mut Vm, unit: &Arc<CompiledUnit>, regs: SpillRegs, resume: CompiledResume) -> Frame {
    let point = match resume {
        CompiledResume::Start => {
            let locals = executor::read_params(unit, &regs);
            drop(regs);
            vm.runtime().deopt_stats().record_unstarted(unit.function());
            return Frame::new(unit.function().clone(), locals);
        }
        CompiledResume::At(point) => point,
    };
    let Some(meta) = unit.deopt(point.point()) else {
        deopt::fatal(deopt::DeoptError::UnknownPoint {
            func: unit.full_name.clone(),
            id: point.point(),
        });
    };
    vm.runtime().deopt_stats().record_point(unit, meta, &regs);
    tracing::debug!(func = %unit.full_name, reason = %meta.reason, "deoptimizing suspended generator");
    let mut frames = deopt::reconstruct(unit, meta, &regs).unwrap_or_else(|e| deopt::fatal(e));
    drop(regs);
    let Some(mut frame) = frames.pop().filter(|_| frames.is_empty()) else {
        deopt::fatal(deopt::DeoptError::InlinedSuspension {
            func: unit.full_name.clone(),
        });
    };
    match frame.code.instructions.get(frame.pc).map(|i| i.opcode) {
        Some(Opcode::YieldValue) => frame.pc += 1,
        Some(Opcode::YieldFrom) => frame.delegating = true,
        _ => {}
    }
    frame
}

impl Drop for GeneratorObject {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.finalizing || inner.state != GenState::Suspended || !inner.body.has_active_blocks() {
            return;
        }
        // Handlers in the body must observe GeneratorExit: revive the state
        // into a new object and close it at the next safepoint.
        let revived = GeneratorObject {
            id: self.id,
            kind: self.kind,
            func: self.func.clone(),
            inner: Mutex::new(GenInner {
                state: inner.state,
                body: std::mem::replace(&mut inner.body, Body::Empty),
                parked: inner.parked.take(),
                finalizing: true,
            }),
        };
        finalize::enqueue(
            Value::native(revived),
            BuiltinFunction::value("close", generator_close),
        );
    }
}

impl fmt::Debug for GeneratorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} object {}>", self.kind.type_name(), self.func.qualname)
    }
}

impl NativeObject for GeneratorObject {
    fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    fn class(&self) -> Arc<TypeObject> {
        self.kind.class()
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        match name {
            "gi_running" | "cr_running" | "ag_running" => {
                Some(Value::Bool(self.state() == GenState::Running))
            }
            "gi_frame" | "cr_frame" | "ag_frame" => Some(self.frame().unwrap_or(Value::None)),
            "gi_code" | "cr_code" | "ag_code" => Some(Value::Code(self.func.code.clone())),
            "__name__" => Some(Value::Str(self.func.name().clone())),
            "__qualname__" => Some(Value::Str(self.func.qualname.clone())),
            _ => None,
        }
    }

    fn traverse(&self, visit: &mut dyn FnMut(&Value)) {
        if let Some(inner) = self.inner.try_lock() {
            inner.body.traverse(visit);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// =============================================================================
// Awaitable Wrappers
// =============================================================================

/// Iterator returned by `coroutine.__await__()`.
#[derive(Debug)]
pub struct CoroutineWrapper {
    coro: Value,
}

impl NativeObject for CoroutineWrapper {
    fn type_name(&self) -> &'static str {
        "coroutine_wrapper"
    }

    fn class(&self) -> Arc<TypeObject> {
        builtin_types().iterator.clone()
    }

    fn traverse(&self, visit: &mut dyn FnMut(&Value)) {
        visit(&self.coro);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AwaitState {
    Init,
    Iter,
    Closed,
}

/// Awaitable of `__anext__()` and `asend(value)`.
#[derive(Debug)]
pub struct AsyncGenASend {
    gen: Value,
    value: Value,
    state: Mutex<AwaitState>,
}

/// Awaitable of `athrow(exc)` and `aclose()`.
#[derive(Debug)]
pub struct AsyncGenAThrow {
    gen: Value,
    err: PyErr,
    closing: bool,
    state: Mutex<AwaitState>,
}

macro_rules! awaitable_native {
    ($ty:ty, $name:literal) => {
        impl NativeObject for $ty {
            fn type_name(&self) -> &'static str {
                $name
            }

            fn class(&self) -> Arc<TypeObject> {
                builtin_types().async_gen_awaitable.clone()
            }

            fn traverse(&self, visit: &mut dyn FnMut(&Value)) {
                visit(&self.gen);
            }

            fn as_any(&self) -> &dyn Any {
                self
            }

            fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
                self
            }
        }
    };
}

awaitable_native!(AsyncGenASend, "async_generator_asend");
awaitable_native!(AsyncGenAThrow, "async_generator_athrow");

fn gen_ref(v: &Value) -> PyResult<&GeneratorObject> {
    v.downcast_ref::<GeneratorObject>()
        .ok_or_else(|| PyErr::type_error(format!("expected a generator, got '{}'", v.type_name())))
}

impl AsyncGenASend {
    fn step(&self, vm: &mut Vm, input: GenInput) -> PyResult<IterStep> {
        let input = {
            let mut state = self.state.lock();
            match *state {
                AwaitState::Closed => {
                    return Err(PyErr::runtime_error(
                        "cannot reuse already awaited __anext__()/asend()",
                    ))
                }
                AwaitState::Init => {
                    *state = AwaitState::Iter;
                    match input {
                        GenInput::Send(v) if v.is_none() => GenInput::Send(self.value.clone()),
                        other => other,
                    }
                }
                AwaitState::Iter => input,
            }
        };
        let result = gen_ref(&self.gen)?.resume(vm, input);
        let mut state = self.state.lock();
        match result {
            Ok(GenStep::Delegate(v)) => Ok(IterStep::Yield(v)),
            Ok(GenStep::Yield(v)) => {
                *state = AwaitState::Closed;
                Ok(IterStep::Return(v))
            }
            Ok(GenStep::Return(_)) => {
                *state = AwaitState::Closed;
                Err(PyErr::stop_async_iteration())
            }
            Err(e) => {
                *state = AwaitState::Closed;
                Err(e)
            }
        }
    }
}

impl AsyncGenAThrow {
    fn step(&self, vm: &mut Vm, input: GenInput) -> PyResult<IterStep> {
        let input = {
            let mut state = self.state.lock();
            match *state {
                AwaitState::Closed => {
                    return Err(PyErr::runtime_error(
                        "cannot reuse already awaited aclose()/athrow()",
                    ))
                }
                AwaitState::Init => {
                    *state = AwaitState::Iter;
                    GenInput::Throw(self.err.clone())
                }
                AwaitState::Iter => input,
            }
        };
        let result = gen_ref(&self.gen)?.resume(vm, input);
        let t = builtin_types();
        let mut state = self.state.lock();
        match result {
            Ok(GenStep::Delegate(v)) => Ok(IterStep::Yield(v)),
            Ok(GenStep::Yield(v)) => {
                *state = AwaitState::Closed;
                if self.closing {
                    Err(PyErr::runtime_error("async generator ignored GeneratorExit"))
                } else {
                    Ok(IterStep::Return(v))
                }
            }
            Ok(GenStep::Return(_)) if self.closing => {
                *state = AwaitState::Closed;
                Ok(IterStep::Return(Value::None))
            }
            Ok(GenStep::Return(_)) => {
                *state = AwaitState::Closed;
                Err(PyErr::stop_async_iteration())
            }
            Err(e)
                if self.closing
                    && (e.matches(&t.generator_exit) || e.matches(&t.stop_async_iteration)) =>
            {
                *state = AwaitState::Closed;
                Ok(IterStep::Return(Value::None))
            }
            Err(e) => {
                *state = AwaitState::Closed;
                Err(e)
            }
        }
    }
}

// =============================================================================
// Iteration Protocol
// =============================================================================

/// `iter(v)` for the objects defined here.
pub fn get_iter(v: &Value) -> Option<PyResult<Value>> {
    if let Some(gen) = v.downcast_ref::<GeneratorObject>() {
        return Some(match gen.kind {
            GenKind::Generator => Ok(v.clone()),
            kind => Err(PyErr::type_error(format!(
                "'{}' object is not iterable",
                kind.type_name()
            ))),
        });
    }
    let is_awaitable_iter = v.downcast_ref::<CoroutineWrapper>().is_some()
        || v.downcast_ref::<AsyncGenASend>().is_some()
        || v.downcast_ref::<AsyncGenAThrow>().is_some();
    is_awaitable_iter.then(|| Ok(v.clone()))
}

/// Send into a native resumable object.
pub fn send_native(vm: &mut Vm, it: &Value, value: Value) -> Option<PyResult<IterStep>> {
    step_native(vm, it, GenInput::Send(value))
}

/// Throw into a native resumable object.
pub fn throw_native(vm: &mut Vm, it: &Value, err: PyErr) -> Option<PyResult<IterStep>> {
    step_native(vm, it, GenInput::Throw(err))
}

fn step_native(vm: &mut Vm, it: &Value, input: GenInput) -> Option<PyResult<IterStep>> {
    if let Some(gen) = it.downcast_ref::<GeneratorObject>() {
        return Some(gen.resume(vm, input).map(GenStep::into_iter_step));
    }
    if let Some(wrapper) = it.downcast_ref::<CoroutineWrapper>() {
        let coro = gen_ref(&wrapper.coro);
        return Some(coro.and_then(|c| c.resume(vm, input).map(GenStep::into_iter_step)));
    }
    if let Some(asend) = it.downcast_ref::<AsyncGenASend>() {
        return Some(asend.step(vm, input));
    }
    if let Some(athrow) = it.downcast_ref::<AsyncGenAThrow>() {
        return Some(athrow.step(vm, input));
    }
    None
}

/// Close a native resumable object.
pub fn close_native(vm: &mut Vm, it: &Value) -> Option<PyResult<()>> {
    if let Some(gen) = it.downcast_ref::<GeneratorObject>() {
        return Some(gen.close(vm).map(drop));
    }
    if let Some(wrapper) = it.downcast_ref::<CoroutineWrapper>() {
        return Some(gen_ref(&wrapper.coro).and_then(|c| c.close(vm).map(drop)));
    }
    if let Some(asend) = it.downcast_ref::<AsyncGenASend>() {
        *asend.state.lock() = AwaitState::Closed;
        return Some(Ok(()));
    }
    if let Some(athrow) = it.downcast_ref::<AsyncGenAThrow>() {
        *athrow.state.lock() = AwaitState::Closed;
        return Some(Ok(()));
    }
    None
}

/// Forward a thrown exception to a delegate. A delegate without `throw`
/// gets the exception raised at the delegation point instead.
pub fn throw_to(vm: &mut Vm, delegate: &Value, err: PyErr) -> PyResult<IterStep> {
    if let Some(step) = throw_native(vm, delegate, err.clone()) {
        return step;
    }
    let Some(throw) = attr::get_attr_opt(vm, delegate, "throw")? else {
        return Err(err);
    };
    match vm.call(&throw, vec![err.to_value()]) {
        Ok(v) => Ok(IterStep::Yield(v)),
        Err(e) if e.is_stop_iteration() => Ok(IterStep::Return(e.exception().value())),
        Err(e) => Err(e),
    }
}

/// Close a delegate when `GeneratorExit` passes through its delegator.
pub fn close_delegate(vm: &mut Vm, delegate: &Value) -> PyResult<()> {
    if let Some(result) = close_native(vm, delegate) {
        return result;
    }
    if let Some(close) = attr::get_attr_opt(vm, delegate, "close")? {
        vm.call(&close, Vec::new())?;
    }
    Ok(())
}

/// Operand of `yield from`.
pub fn get_yield_from_iter(vm: &mut Vm, v: &Value) -> PyResult<Value> {
    if let Some(gen) = v.downcast_ref::<GeneratorObject>() {
        return match gen.kind {
            GenKind::Generator => Ok(v.clone()),
            GenKind::Coroutine => Err(PyErr::type_error(
                "cannot 'yield from' a coroutine object in a non-coroutine generator",
            )),
            GenKind::AsyncGenerator => Err(PyErr::type_error(
                "'async_generator' object is not iterable",
            )),
        };
    }
    ops::get_iter(vm, v)
}

/// Operand of `await`.
pub fn get_awaitable(vm: &mut Vm, v: &Value) -> PyResult<Value> {
    if let Some(gen) = v.downcast_ref::<GeneratorObject>() {
        return match gen.kind {
            GenKind::Coroutine if gen.is_delegating() => {
                Err(PyErr::runtime_error("coroutine is being awaited already"))
            }
            GenKind::Coroutine => Ok(v.clone()),
            GenKind::Generator if gen.func.code.flags.contains(CodeFlags::ITERABLE_COROUTINE) => Ok(v.clone()),
            GenKind::Generator | GenKind::AsyncGenerator => Err(not_awaitable(v)),
        };
    }
    if v.downcast_ref::<AsyncGenASend>().is_some()
        || v.downcast_ref::<AsyncGenAThrow>().is_some()
        || v.downcast_ref::<CoroutineWrapper>().is_some()
    {
        return Ok(v.clone());
    }
    match ops::call_special(vm, v, "__await__", Vec::new())? {
        Some(it) => {
            if let Some(gen) = it.downcast_ref::<GeneratorObject>() {
                if gen.kind == GenKind::Coroutine {
                    return Err(PyErr::type_error("__await__() returned a coroutine"));
                }
            }
            Ok(it)
        }
        None => Err(not_awaitable(v)),
    }
}

fn not_awaitable(v: &Value) -> PyErr {
    PyErr::type_error(format!(
        "object {} can't be used in 'await' expression",
        v.type_name()
    ))
}

// =============================================================================
// Methods
// =============================================================================

fn receiver(args: &[Value]) -> PyResult<&Value> {
    args.first()
        .ok_or_else(|| PyErr::type_error("method called without a receiver"))
}

fn step_result(step: IterStep) -> PyResult<Value> {
    match step {
        IterStep::Yield(v) => Ok(v),
        IterStep::Return(v) => Err(PyErr::stop_iteration(v)),
    }
}

fn not_resumable(v: &Value) -> PyErr {
    PyErr::type_error(format!("'{}' object cannot be resumed", v.type_name()))
}

fn generator_send(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    let it = receiver(&args)?;
    let value = args.get(1).cloned().unwrap_or(Value::None);
    send_native(vm, it, value).ok_or_else(|| not_resumable(it))?.and_then(step_result)
}

fn generator_next(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    let it = receiver(&args)?;
    send_native(vm, it, Value::None).ok_or_else(|| not_resumable(it))?.and_then(step_result)
}

fn generator_throw(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    let it = receiver(&args)?;
    let exc = args
        .get(1)
        .ok_or_else(|| PyErr::type_error("throw expected at least 1 argument, got 0"))?;
    let err = ops::make_exception(vm, exc)?;
    throw_native(vm, it, err).ok_or_else(|| not_resumable(it))?.and_then(step_result)
}

fn generator_close(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    let it = receiver(&args)?;
    close_native(vm, it).ok_or_else(|| not_resumable(it))??;
    Ok(Value::None)
}

fn coroutine_await(_vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    let coro = receiver(&args)?.clone();
    Ok(Value::native(CoroutineWrapper { coro }))
}

fn async_gen_anext(_vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    let gen = receiver(&args)?.clone();
    Ok(Value::native(AsyncGenASend {
        gen,
        value: Value::None,
        state: Mutex::new(AwaitState::Init),
    }))
}

fn async_gen_asend(_vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    let gen = receiver(&args)?.clone();
    let value = args.get(1).cloned().unwrap_or(Value::None);
    Ok(Value::native(AsyncGenASend {
        gen,
        value,
        state: Mutex::new(AwaitState::Init),
    }))
}

fn async_gen_athrow(vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    let gen = receiver(&args)?.clone();
    let exc = args
        .get(1)
        .ok_or_else(|| PyErr::type_error("athrow expected at least 1 argument, got 0"))?;
    let err = ops::make_exception(vm, exc)?;
    Ok(Value::native(AsyncGenAThrow {
        gen,
        err,
        closing: false,
        state: Mutex::new(AwaitState::Init),
    }))
}

fn async_gen_aclose(_vm: &mut Vm, args: Vec<Value>) -> PyResult<Value> {
    let gen = receiver(&args)?.clone();
    Ok(Value::native(AsyncGenAThrow {
        gen,
        err: PyErr::generator_exit(),
        closing: true,
        state: Mutex::new(AwaitState::Init),
    }))
}

/// Bound method `name` of a generator-like object.
pub fn method(obj: &Value, name: &str) -> Option<Value> {
    let func: crate::builtins::BuiltinFn = if let Some(gen) = obj.downcast_ref::<GeneratorObject>() {
        match (gen.kind, name) {
            (GenKind::Generator, "__next__") => generator_next,
            (GenKind::Generator | GenKind::Coroutine, "send") => generator_send,
            (GenKind::Generator | GenKind::Coroutine, "throw") => generator_throw,
            (GenKind::Generator | GenKind::Coroutine, "close") => generator_close,
            (GenKind::Coroutine, "__await__") => coroutine_await,
            (GenKind::AsyncGenerator, "__anext__") => async_gen_anext,
            (GenKind::AsyncGenerator, "asend") => async_gen_asend,
            (GenKind::AsyncGenerator, "athrow") => async_gen_athrow,
            (GenKind::AsyncGenerator, "aclose") => async_gen_aclose,
            _ => return None,
        }
    } else if obj.downcast_ref::<CoroutineWrapper>().is_some()
        || obj.downcast_ref::<AsyncGenASend>().is_some()
        || obj.downcast_ref::<AsyncGenAThrow>().is_some()
    {
        match name {
            "__next__" => generator_next,
            "send" => generator_send,
            "throw" => generator_throw,
            "close" => generator_close,
            _ => return None,
        }
    } else {
        return None;
    };
    Some(BuiltinFunction::bound(name, func, obj.clone()))
}
