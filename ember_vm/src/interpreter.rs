//! Bytecode interpreter.
//!
//! A [`Frame`] is the complete state of one interpreted activation: locals,
//! value stack, handler block stack and the exceptions currently being
//! handled. Generators keep their frame across suspensions, and the deopt
//! controller builds frames from compiled state, so everything the
//! interpreter needs to continue lives here rather than on the Rust stack.
//!
//! Primitive values are represented by their boxed counterparts; the
//! primitive opcodes check representations the same way compiled code
//! does, so both execution modes raise the same errors.

use crate::attr;
use crate::executor::Word;
use crate::generator;
use crate::global_cache;
use crate::inline_cache;
use crate::ops::{self, IterStep};
use crate::vm::Vm;
use ember_bytecode::{CodeObject, Constant, Instruction, Opcode, PrimitiveKind};
use ember_jit::{BlockSpec, ValueKind};
use ember_runtime::{builtin_types, FunctionObject, PyErr, PyResult, TracebackEntry, Value};
use std::sync::Arc;

// =============================================================================
// Frames
// =============================================================================

/// State of an interpreted activation.
#[derive(Debug, Clone)]
pub struct Frame {
    pub func: Arc<FunctionObject>,
    pub code: Arc<CodeObject>,
    pub locals: Vec<Option<Value>>,
    pub stack: Vec<Value>,
    pub blocks: Vec<BlockSpec>,
    /// Exceptions being handled, with the block depth of their handler.
    pub handled: Vec<(PyErr, usize)>,
    /// Next bytecode offset.
    pub pc: usize,
    /// Suspended inside `YieldFrom`; the delegate is on top of the stack.
    pub delegating: bool,
}

impl Frame {
    /// Frame for a call of `func` with bound locals.
    pub fn new(func: Arc<FunctionObject>, mut locals: Vec<Option<Value>>) -> Self {
        let code = func.code.clone();
        locals.resize(code.nlocals(), None);
        let stack = Vec::with_capacity(code.stack_size as usize);
        Self {
            func,
            code,
            locals,
            stack,
            blocks: Vec::new(),
            handled: Vec::new(),
            pc: 0,
            delegating: false,
        }
    }

    /// Frame executing `code` (an inlined callee) on behalf of `func`.
    pub fn for_code(func: Arc<FunctionObject>, code: Arc<CodeObject>) -> Self {
        Self {
            func,
            locals: vec![None; code.nlocals()],
            code,
            stack: Vec::new(),
            blocks: Vec::new(),
            handled: Vec::new(),
            pc: 0,
            delegating: false,
        }
    }

    /// Whether a handler block is active.
    #[inline]
    pub fn has_active_blocks(&self) -> bool {
        !self.blocks.is_empty()
    }

    /// Visit every value the frame keeps alive.
    pub fn traverse(&self, visit: &mut dyn FnMut(&Value)) {
        self.locals.iter().flatten().for_each(&mut *visit);
        self.stack.iter().for_each(&mut *visit);
    }

    fn pop(&mut self) -> PyResult<Value> {
        self.stack.pop().ok_or_else(underflow)
    }

    fn top(&self) -> PyResult<&Value> {
        self.stack.last().ok_or_else(underflow)
    }

    fn pop_n(&mut self, n: usize) -> PyResult<Vec<Value>> {
        let at = self.stack.len().checked_sub(n).ok_or_else(underflow)?;
        Ok(self.stack.split_off(at))
    }

    fn name(&self, index: u32) -> PyResult<Arc<str>> {
        self.code
            .names
            .get(index as usize)
            .cloned()
            .ok_or_else(|| PyErr::runtime_error(format!("bad name index {}", index)))
    }

    fn local_name(&self, index: u32) -> Arc<str> {
        self.code
            .varnames
            .get(index as usize)
            .cloned()
            .unwrap_or_else(|| Arc::from("?"))
    }

    fn traceback_entry(&self, offset: usize) -> TracebackEntry {
        TracebackEntry {
            filename: self.code.filename.clone(),
            qualname: self.code.qualname.clone(),
            lineno: self.code.line_or_first(offset as u32),
        }
    }
}

fn underflow() -> PyErr {
    PyErr::runtime_error("value stack underflow")
}

/// How a frame is entered or re-entered.
#[derive(Debug)]
pub enum Resume {
    /// Fresh activation, or continuing a reconstructed frame as is.
    Start,
    /// Push a value (sent into a generator or returned by a callee).
    Send(Value),
    /// Throw into a suspended generator frame.
    Throw(PyErr),
    /// Raise at the current offset, as if the instruction there failed.
    Raise(PyErr),
}

/// How a frame stopped running.
#[derive(Debug)]
pub enum FrameExit {
    Return(Value),
    /// Suspended at a `YieldValue`.
    Yield(Value),
    /// Suspended inside a `YieldFrom`, passing on a delegate's value.
    Delegate(Value),
}

enum Flow {
    Next,
    Exit(FrameExit),
}

/// An exception on its way through a frame.
struct Raised {
    err: PyErr,
    /// Whether the raising offset gets a traceback line.
    record: bool,
}

impl From<PyErr> for Raised {
    #[inline]
    fn from(err: PyErr) -> Self {
        Raised { err, record: true }
    }
}

// =============================================================================
// Execution
// =============================================================================

/// Run `frame`, whose shadow entry is at index `idx`, until it returns,
/// suspends or lets an exception escape.
pub fn run_frame(vm: &mut Vm, frame: &mut Frame, idx: usize, resume: Resume) -> PyResult<FrameExit> {
    let mut pending: Option<(Raised, usize)> = match resume {
        Resume::Start => None,
        Resume::Send(v) => {
            frame.stack.push(v);
            None
        }
        Resume::Raise(err) => Some((Raised::from(err), frame.pc)),
        Resume::Throw(err) => match throw_into(vm, frame, err)? {
            Thrown::Continue => None,
            Thrown::Exit(exit) => return Ok(exit),
            Thrown::Raise(raised, at) => Some((raised, at)),
        },
    };

    loop {
        if let Some((raised, at)) = pending.take() {
            unwind(frame, raised.err, raised.record.then_some(at))?;
        }
        let offset = frame.pc;
        let Some(inst) = frame.code.instructions.get(offset).copied() else {
            return Err(PyErr::runtime_error(format!(
                "execution fell off the end of '{}'",
                frame.code.qualname
            )));
        };
        frame.pc += 1;
        vm.shadow.set_pc(idx, offset);
        match execute(vm, frame, inst, offset) {
            Ok(Flow::Next) => {}
            Ok(Flow::Exit(exit)) => return Ok(exit),
            Err(raised) => pending = Some((raised, offset)),
        }
    }
}

enum Thrown {
    Continue,
    Exit(FrameExit),
    Raise(Raised, usize),
}

fn throw_into(vm: &mut Vm, frame: &mut Frame, err: PyErr) -> PyResult<Thrown> {
    if !frame.delegating {
        let at = frame.pc.saturating_sub(1);
        return Ok(Thrown::Raise(Raised::from(err), at));
    }
    let at = frame.pc;
    let delegate = frame.top()?.clone();
    if err.matches(&builtin_types().generator_exit) {
        frame.delegating = false;
        let raised = match generator::close_delegate(vm, &delegate) {
            Ok(()) => err,
            Err(e) => e,
        };
        return Ok(Thrown::Raise(Raised::from(raised), at));
    }
    match generator::throw_to(vm, &delegate, err) {
        Ok(IterStep::Yield(v)) => Ok(Thrown::Exit(FrameExit::Delegate(v))),
        Ok(IterStep::Return(r)) => {
            frame.delegating = false;
            frame.pop()?;
            frame.stack.push(r);
            frame.pc += 1;
            Ok(Thrown::Continue)
        }
        Err(e) => {
            frame.delegating = false;
            Ok(Thrown::Raise(Raised::from(e), at))
        }
    }
}

/// Route `err` to the innermost handler of `frame`, or return it when the
/// frame has none.
fn unwind(frame: &mut Frame, err: PyErr, record_at: Option<usize>) -> PyResult<()> {
    if let Some(offset) = record_at {
        err.exception().push_traceback(frame.traceback_entry(offset));
    }
    if let Some((handled, _)) = frame.handled.last() {
        let exc = err.exception();
        if exc.context().is_none() && !Arc::ptr_eq(handled.exception(), exc) {
            exc.set_context(handled.exception().clone());
        }
    }
    frame.delegating = false;
    let Some(block) = frame.blocks.pop() else {
        return Err(err);
    };
    let depth = frame.blocks.len();
    frame.handled.retain(|(_, d)| *d <= depth);
    frame.stack.truncate(block.level as usize);
    frame.stack.push(err.to_value());
    frame.handled.push((err, depth));
    frame.pc = block.handler as usize;
    Ok(())
}

fn unbound_local(name: &str) -> PyErr {
    PyErr::unbound_local(format!(
        "cannot access local variable '{}' where it is not associated with a value",
        name
    ))
}

fn bad_arg(inst: Instruction) -> PyErr {
    PyErr::runtime_error(format!("malformed instruction {}", inst))
}

/// Unboxed form of `v` for a primitive slot of `kind`.
pub fn check_primitive(v: &Value, kind: PrimitiveKind) -> PyResult<()> {
    let ok = matches!(
        (kind, v),
        (PrimitiveKind::Int64, Value::Int(_))
            | (PrimitiveKind::Float64, Value::Float(_))
            | (PrimitiveKind::Bool, Value::Bool(_))
    );
    if ok {
        Ok(())
    } else {
        Err(PyErr::type_error(format!(
            "expected {}, got {}",
            kind.name(),
            v.type_name()
        )))
    }
}

fn execute(vm: &mut Vm, frame: &mut Frame, inst: Instruction, offset: usize) -> Result<Flow, Raised> {
    use Opcode::*;
    let arg = inst.arg;
    match inst.opcode {
        Nop => {}
        PopTop => {
            frame.pop()?;
            vm.safepoint();
        }
        RotTwo => {
            let n = frame.stack.len();
            if n < 2 {
                return Err(underflow().into());
            }
            frame.stack.swap(n - 1, n - 2);
        }
        RotThree => {
            let n = frame.stack.len();
            if n < 3 {
                return Err(underflow().into());
            }
            frame.stack[n - 3..].rotate_right(1);
        }
        DupTop => {
            let v = frame.top()?.clone();
            frame.stack.push(v);
        }
        DupTopTwo => {
            let n = frame.stack.len();
            if n < 2 {
                return Err(underflow().into());
            }
            frame.stack.extend_from_within(n - 2..);
        }

        LoadConst | PrimitiveLoadConst => {
            let c = frame.code.constants.get(arg as usize).ok_or_else(|| bad_arg(inst))?;
            frame.stack.push(Value::from_constant(c));
        }
        LoadFast => match frame.locals.get(arg as usize) {
            Some(Some(v)) => {
                let v = v.clone();
                frame.stack.push(v);
            }
            _ => return Err(unbound_local(&frame.local_name(arg)).into()),
        },
        StoreFast => {
            let v = frame.pop()?;
            let slot = frame.locals.get_mut(arg as usize).ok_or_else(|| bad_arg(inst))?;
            let old = slot.replace(v);
            drop(old);
            vm.safepoint();
        }
        DeleteFast => {
            let slot = frame.locals.get_mut(arg as usize).ok_or_else(|| bad_arg(inst))?;
            if slot.take().is_none() {
                return Err(unbound_local(&frame.local_name(arg)).into());
            }
            vm.safepoint();
        }
        LoadGlobal => {
            let v = global_cache::load_global(vm, &frame.func, &frame.code, offset as u32, arg)?;
            frame.stack.push(v);
        }
        StoreGlobal | StoreName => {
            let name = frame.name(arg)?;
            let v = frame.pop()?;
            frame.func.globals.set_str(&name, v);
        }
        LoadName => {
            let name = frame.name(arg)?;
            let v = global_cache::load_name(vm, &frame.func, &name)?;
            frame.stack.push(v);
        }

        LoadAttr => {
            let name = frame.name(arg)?;
            let obj = frame.pop()?;
            let v = inline_cache::load_attr(vm, &frame.code, offset as u32, &obj, &name)?;
            frame.stack.push(v);
        }
        StoreAttr => {
            let name = frame.name(arg)?;
            let obj = frame.pop()?;
            let value = frame.pop()?;
            inline_cache::store_attr(vm, &frame.code, offset as u32, &obj, &name, value)?;
        }
        DeleteAttr => {
            let name = frame.name(arg)?;
            let obj = frame.pop()?;
            attr::del_attr(vm, &obj, &name)?;
        }
        LoadMethod => {
            let name = frame.name(arg)?;
            let obj = frame.pop()?;
            let (method, receiver) = inline_cache::load_method(vm, &frame.code, offset as u32, &obj, &name)?;
            frame.stack.push(method);
            frame.stack.push(receiver);
        }

        CallMethod => {
            let mut args = frame.pop_n(arg as usize)?;
            let receiver = frame.pop()?;
            let method = frame.pop()?;
            let result = if matches!(method, Value::Null) {
                vm.call(&receiver, args)?
            } else {
                args.insert(0, receiver);
                vm.call(&method, args)?
            };
            frame.stack.push(result);
        }
        CallFunction => {
            let args = frame.pop_n(arg as usize)?;
            let callable = frame.pop()?;
            let result = vm.call(&callable, args)?;
            frame.stack.push(result);
        }
        InvokeNative => {
            let Some(Constant::Native(sig)) = frame.code.constants.get(arg as usize) else {
                return Err(bad_arg(inst).into());
            };
            let sig = sig.clone();
            let args = frame.pop_n(sig.params.len())?;
            let mut words = Vec::with_capacity(args.len());
            for (v, kind) in args.into_iter().zip(sig.params.iter()) {
                check_primitive(&v, *kind)?;
                words.extend(Word::from_value(v, ValueKind::from_primitive(*kind)));
            }
            let result = vm.runtime().natives().invoke(&sig, &words)?;
            let value = result
                .to_value(ValueKind::from_primitive(sig.ret))
                .ok_or_else(|| PyErr::runtime_error("native call returned the wrong representation"))?;
            frame.stack.push(value);
        }
        ReturnValue => {
            let v = frame.pop()?;
            return Ok(Flow::Exit(FrameExit::Return(v)));
        }
        MakeFunction => {
            let code = frame.pop()?;
            let defaults = if arg & 1 != 0 { Some(frame.pop()?) } else { None };
            let func = vm.make_function_value(&code, &frame.func, defaults.as_ref())?;
            frame.stack.push(func);
        }

        BinaryOp => {
            let op = inst.bin_op().ok_or_else(|| bad_arg(inst))?;
            let rhs = frame.pop()?;
            let lhs = frame.pop()?;
            let v = ops::binary_op(vm, op, &lhs, &rhs)?;
            frame.stack.push(v);
        }
        CompareOp => {
            let op = inst.cmp_op().ok_or_else(|| bad_arg(inst))?;
            let rhs = frame.pop()?;
            let lhs = frame.pop()?;
            let v = ops::compare_op(vm, op, &lhs, &rhs)?;
            frame.stack.push(v);
        }
        UnaryNot => {
            let v = frame.pop()?;
            let r = ops::unary_not(vm, &v)?;
            frame.stack.push(r);
        }
        UnaryNegative => {
            let v = frame.pop()?;
            let r = ops::unary_negative(vm, &v)?;
            frame.stack.push(r);
        }

        PrimitiveBinaryOp => {
            let kind = inst.primitive_kind().ok_or_else(|| bad_arg(inst))?;
            let op = inst.bin_op().ok_or_else(|| bad_arg(inst))?;
            let rhs = frame.pop()?;
            let lhs = frame.pop()?;
            check_primitive(&lhs, kind)?;
            check_primitive(&rhs, kind)?;
            let result = match (&lhs, &rhs) {
                (Value::Int(a), Value::Int(b)) => ops::prim_i64(op, *a, *b).map(Value::Int),
                (Value::Float(a), Value::Float(b)) => ops::prim_f64(op, *a, *b).map(Value::Float),
                (Value::Bool(a), Value::Bool(b)) => ops::prim_bool(op, *a, *b).map(Value::Bool),
                _ => None,
            };
            let v = result.ok_or_else(|| ops::prim_zero_division(kind))?;
            frame.stack.push(v);
        }
        PrimitiveCompareOp => {
            let kind = inst.primitive_kind().ok_or_else(|| bad_arg(inst))?;
            let op = inst.cmp_op().ok_or_else(|| bad_arg(inst))?;
            let rhs = frame.pop()?;
            let lhs = frame.pop()?;
            check_primitive(&lhs, kind)?;
            check_primitive(&rhs, kind)?;
            let result = match (&lhs, &rhs) {
                (Value::Int(a), Value::Int(b)) => ops::prim_compare(op, *a, *b),
                (Value::Float(a), Value::Float(b)) => ops::prim_compare(op, *a, *b),
                (Value::Bool(a), Value::Bool(b)) => ops::prim_compare(op, *a, *b),
                _ => false,
            };
            frame.stack.push(Value::Bool(result));
        }
        PrimitiveBox => {
            let kind = inst.primitive_kind().ok_or_else(|| bad_arg(inst))?;
            check_primitive(frame.top()?, kind)?;
        }
        PrimitiveUnbox => {
            let kind = inst.primitive_kind().ok_or_else(|| bad_arg(inst))?;
            check_primitive(frame.top()?, kind)?;
        }

        Jump => frame.pc = arg as usize,
        PopJumpIfFalse | PopJumpIfTrue => {
            let v = frame.pop()?;
            let truth = ops::truthy(vm, &v)?;
            if truth == (inst.opcode == PopJumpIfTrue) {
                frame.pc = arg as usize;
            }
        }
        GetIter => {
            let v = frame.pop()?;
            let it = ops::get_iter(vm, &v)?;
            frame.stack.push(it);
        }
        ForIter => {
            let it = frame.top()?.clone();
            match ops::iter_step(vm, &it)? {
                IterStep::Yield(v) => frame.stack.push(v),
                IterStep::Return(_) => {
                    frame.pop()?;
                    frame.pc = arg as usize;
                }
            }
        }

        BuildTuple => {
            let items = frame.pop_n(arg as usize)?;
            frame.stack.push(Value::tuple(items));
        }
        BuildList => {
            let items = frame.pop_n(arg as usize)?;
            frame.stack.push(Value::new_list(items));
        }
        BuildMap => {
            let items = frame.pop_n(2 * arg as usize)?;
            frame.stack.push(ops::build_map(&items)?);
        }
        BinarySubscr => {
            let index = frame.pop()?;
            let container = frame.pop()?;
            let v = ops::subscr(vm, &container, &index)?;
            frame.stack.push(v);
        }
        StoreSubscr => {
            let index = frame.pop()?;
            let container = frame.pop()?;
            let value = frame.pop()?;
            ops::store_subscr(vm, &container, &index, value)?;
        }
        UnpackSequence => {
            let v = frame.pop()?;
            let items = ops::unpack_sequence(vm, &v, arg as usize)?;
            frame.stack.extend(items.into_iter().rev());
        }

        SetupFinally => frame.blocks.push(BlockSpec {
            handler: arg,
            level: frame.stack.len() as u32,
        }),
        PopBlock => {
            frame.blocks.pop();
        }
        PopExcept => {
            frame.handled.pop();
        }
        Raise => {
            let err = match arg {
                0 => {
                    let Some((err, _)) = frame.handled.last() else {
                        return Err(PyErr::runtime_error("No active exception to reraise").into());
                    };
                    return Err(Raised {
                        err: err.clone(),
                        record: false,
                    });
                }
                1 => {
                    let exc = frame.pop()?;
                    ops::make_exception(vm, &exc)?
                }
                2 => {
                    let cause = frame.pop()?;
                    let exc = frame.pop()?;
                    ops::raise_from(vm, &exc, &cause)?
                }
                _ => return Err(bad_arg(inst).into()),
            };
            return Err(err.into());
        }
        Reraise => {
            let v = frame.pop()?;
            let Value::Exception(exc) = v else {
                return Err(PyErr::type_error("exceptions must derive from BaseException").into());
            };
            return Err(Raised {
                err: PyErr::from_exception(exc),
                record: false,
            });
        }
        JumpIfNotExcMatch => {
            let spec = frame.pop()?;
            let exc = frame.pop()?;
            if !ops::exception_matches(&exc, &spec)? {
                frame.pc = arg as usize;
            }
        }

        YieldValue => {
            let v = frame.pop()?;
            return Ok(Flow::Exit(FrameExit::Yield(v)));
        }
        GetYieldFromIter => {
            let v = frame.pop()?;
            let it = generator::get_yield_from_iter(vm, &v)?;
            frame.stack.push(it);
        }
        YieldFrom => {
            let sent = frame.pop()?;
            let delegate = frame.top()?.clone();
            match ops::send_to(vm, &delegate, sent)? {
                IterStep::Yield(v) => {
                    frame.pc = offset;
                    frame.delegating = true;
                    return Ok(Flow::Exit(FrameExit::Delegate(v)));
                }
                IterStep::Return(r) => {
                    frame.delegating = false;
                    frame.pop()?;
                    frame.stack.push(r);
                }
            }
        }
        GetAwaitable => {
            let v = frame.pop()?;
            let it = generator::get_awaitable(vm, &v)?;
            frame.stack.push(it);
        }

        GetLen => {
            let v = frame.top()?.clone();
            let n = ops::get_len(vm, &v)?;
            frame.stack.push(Value::Int(n));
        }
        MatchSequence => {
            let r = ops::match_sequence(frame.top()?);
            frame.stack.push(Value::Bool(r));
        }
        MatchMapping => {
            let r = ops::match_mapping(frame.top()?);
            frame.stack.push(Value::Bool(r));
        }
        MatchClass => {
            let class = frame.pop()?;
            let subject = frame.pop()?;
            let v = ops::match_class(vm, &subject, &class, arg as usize)?;
            frame.stack.push(v);
        }
    }
    Ok(Flow::Next)
}
