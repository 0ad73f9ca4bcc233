//! Execution of compiled units.
//!
//! A unit's machine instructions run against a register file of
//! [`Word`]s: `num_regs` registers followed by `num_spill_slots` spill
//! slots. Unboxed primitives live in their own word variants; boxed values
//! are ordinary [`Value`]s.
//!
//! | Exit | Meaning |
//! |------|---------|
//! | [`ExecExit::Return`] | the function returned |
//! | [`ExecExit::Yield`] | a generator suspended; resume at the recorded point |
//! | [`ExecExit::Deopt`] | control must leave for the interpreter |
//!
//! Runtime helpers go through the same operations the interpreter uses,
//! and finalizers queued by a release run at the same instructions as in the
//! interpreter (`Safepoint`). Before every helper call the owner's shadow entry is positioned at the
//! calling instruction so that frames materialized by the callee report
//! the right line, including for inlined frames.

use crate::attr;
use crate::deopt::{self, DeoptError};
use crate::generator;
use crate::global_cache;
use crate::inline_cache;
use crate::ops::{self, IterStep};
use crate::shadow::{FrameKind, ShadowFrame};
use crate::vm::Vm;
use ember_bytecode::{Constant, PrimitiveKind};
use ember_jit::{CompiledUnit, DeoptId, Helper, Imm, Inst, Loc, ValueKind};
use ember_runtime::{PyErr, PyResult, Value};
use smallvec::{smallvec, SmallVec};
use std::sync::Arc;

// =============================================================================
// Register Words
// =============================================================================

/// Contents of one register or spill slot.
#[derive(Debug, Clone, Default)]
pub enum Word {
    /// Unbound local or dead temporary.
    #[default]
    Empty,
    Obj(Value),
    I64(i64),
    F64(f64),
    Bool(bool),
}

impl Word {
    /// Word holding `value` in representation `kind`, if it fits.
    pub fn from_value(value: Value, kind: ValueKind) -> Option<Word> {
        match (kind, value) {
            (ValueKind::Boxed, v) => Some(Word::Obj(v)),
            (ValueKind::I64, Value::Int(i)) => Some(Word::I64(i)),
            (ValueKind::F64, Value::Float(f)) => Some(Word::F64(f)),
            (ValueKind::Bool, Value::Bool(b)) => Some(Word::Bool(b)),
            _ => None,
        }
    }

    /// Boxed form of a word of representation `kind`. `None` when the
    /// word does not hold that representation.
    pub fn to_value(&self, kind: ValueKind) -> Option<Value> {
        match (kind, self) {
            (ValueKind::Boxed, Word::Obj(v)) => Some(v.clone()),
            (ValueKind::I64, Word::I64(i)) => Some(Value::Int(*i)),
            (ValueKind::F64, Word::F64(f)) => Some(Value::Float(*f)),
            (ValueKind::Bool, Word::Bool(b)) => Some(Value::Bool(*b)),
            _ => None,
        }
    }

    /// Name of the held representation, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Word::Empty => "empty",
            Word::Obj(_) => "obj",
            Word::I64(_) => "i64",
            Word::F64(_) => "f64",
            Word::Bool(_) => "bool",
        }
    }

    /// Type name of the held value, as recorded for a guilty value.
    pub fn type_name(&self) -> String {
        match self {
            Word::Obj(v) => v.type_name().to_string(),
            Word::I64(_) => PrimitiveKind::Int64.name().to_string(),
            Word::F64(_) => PrimitiveKind::Float64.name().to_string(),
            Word::Bool(_) => PrimitiveKind::Bool.name().to_string(),
            Word::Empty => "<unbound>".to_string(),
        }
    }
}

/// Register file index of a location.
#[inline]
pub fn slot(unit: &CompiledUnit, loc: Loc) -> usize {
    match loc {
        Loc::Reg(r) => r as usize,
        Loc::Stack(s) => unit.num_regs as usize + s as usize,
    }
}

/// Place bound arguments into the parameter locations of `unit`.
pub fn place_params(unit: &CompiledUnit, regs: &mut [Word], locals: Vec<Option<Value>>) {
    for ((loc, kind), value) in unit.params.iter().zip(locals) {
        let Some(value) = value else { continue };
        match Word::from_value(value, *kind) {
            Some(w) => regs[slot(unit, *loc)] = w,
            None => deopt::fatal(DeoptError::Representation {
                func: unit.full_name.clone(),
                expected: *kind,
                found: "boxed argument",
            }),
        }
    }
}

/// Register file of a fresh activation of `unit`.
pub fn entry_registers(unit: &CompiledUnit, locals: Vec<Option<Value>>) -> Vec<Word> {
    let mut regs = vec![Word::Empty; unit.frame_size()];
    place_params(unit, &mut regs, locals);
    regs
}

/// Arguments bound from a suspended-before-start register file.
pub fn read_params(unit: &CompiledUnit, regs: &[Word]) -> Vec<Option<Value>> {
    unit.params
        .iter()
        .map(|(loc, kind)| regs[slot(unit, *loc)].to_value(*kind))
        .collect()
}

// =============================================================================
// Exits
// =============================================================================

/// Where a suspended unit continues.
#[derive(Debug, Clone, Copy)]
pub enum ResumePoint {
    /// After a `Yield`; the sent value lands in `dst`.
    AfterYield { pc: usize, dst: Loc, point: DeoptId },
    /// At a `YieldFrom`; the sent value lands in `value` and the
    /// instruction runs again.
    AtYieldFrom { pc: usize, value: Loc, point: DeoptId },
}

impl ResumePoint {
    /// Deopt point describing the suspended state.
    #[inline]
    pub fn point(&self) -> DeoptId {
        match self {
            ResumePoint::AfterYield { point, .. } | ResumePoint::AtYieldFrom { point, .. } => *point,
        }
    }

    /// Native pc of the suspending instruction.
    #[inline]
    pub fn suspended_pc(&self) -> usize {
        match self {
            ResumePoint::AfterYield { pc, .. } => pc.saturating_sub(1),
            ResumePoint::AtYieldFrom { pc, .. } => *pc,
        }
    }

    /// Store a sent value and return the pc to continue at.
    pub fn accept(&self, unit: &CompiledUnit, regs: &mut [Word], sent: Value) -> usize {
        match *self {
            ResumePoint::AfterYield { pc, dst, .. } => {
                regs[slot(unit, dst)] = Word::Obj(sent);
                pc
            }
            ResumePoint::AtYieldFrom { pc, value, .. } => {
                regs[slot(unit, value)] = Word::Obj(sent);
                pc
            }
        }
    }
}

/// How a unit stopped running.
#[derive(Debug)]
pub enum ExecExit {
    Return(Value),
    /// Suspended producing `value`. `delegated` is set when the value came
    /// from a delegate rather than a `yield` in this body.
    Yield {
        value: Value,
        resume: ResumePoint,
        delegated: bool,
    },
    /// Leave through deopt point `id`; `err` is pending for `Unwind`.
    Deopt { id: DeoptId, err: Option<PyErr> },
}

// =============================================================================
// Execution Loop
// =============================================================================

#[inline]
fn boxed(unit: &CompiledUnit, regs: &[Word], loc: Loc) -> Value {
    match &regs[slot(unit, loc)] {
        Word::Obj(v) => v.clone(),
        other => deopt::fatal(DeoptError::Representation {
            func: unit.full_name.clone(),
            expected: ValueKind::Boxed,
            found: other.kind_name(),
        }),
    }
}

fn mismatch(unit: &CompiledUnit, expected: ValueKind, found: &Word) -> ! {
    deopt::fatal(DeoptError::Representation {
        func: unit.full_name.clone(),
        expected,
        found: found.kind_name(),
    })
}

/// Run `unit` from native pc `pc`. `owner` is the shadow index of the
/// unit's own activation.
pub fn run(vm: &mut Vm, unit: &Arc<CompiledUnit>, regs: &mut [Word], mut pc: usize, owner: usize) -> ExecExit {
    loop {
        let Some(inst) = unit.code.get(pc) else {
            deopt::fatal(DeoptError::PcOutOfRange {
                func: unit.full_name.clone(),
                pc,
            });
        };
        match inst {
            Inst::Move { dst, src } => {
                regs[slot(unit, *dst)] = regs[slot(unit, *src)].clone();
            }
            Inst::LoadConst { dst, index } => {
                let value = unit.constants.get(*index as usize).cloned().unwrap_or(Value::None);
                regs[slot(unit, *dst)] = Word::Obj(value);
            }
            Inst::LoadImm { dst, imm } => {
                regs[slot(unit, *dst)] = match *imm {
                    Imm::I64(i) => Word::I64(i),
                    Imm::F64(f) => Word::F64(f),
                    Imm::Bool(b) => Word::Bool(b),
                };
            }
            Inst::Clear { dst } => regs[slot(unit, *dst)] = Word::Empty,
            Inst::Box { dst, src, kind } => {
                let word = &regs[slot(unit, *src)];
                let vk = ValueKind::from_primitive(*kind);
                let Some(value) = word.to_value(vk) else {
                    mismatch(unit, vk, word)
                };
                regs[slot(unit, *dst)] = Word::Obj(value);
            }
            Inst::Unbox { dst, src, kind, deopt } => {
                let word = match &regs[slot(unit, *src)] {
                    Word::Obj(v) => Word::from_value(v.clone(), ValueKind::from_primitive(*kind)),
                    other => mismatch(unit, ValueKind::Boxed, other),
                };
                match word {
                    Some(w) => regs[slot(unit, *dst)] = w,
                    None => return ExecExit::Deopt { id: *deopt, err: None },
                }
            }
            Inst::PrimBinary { dst, lhs, rhs, kind, op, deopt } => {
                let (a, b) = (&regs[slot(unit, *lhs)], &regs[slot(unit, *rhs)]);
                let result = match (kind, a, b) {
                    (PrimitiveKind::Int64, Word::I64(a), Word::I64(b)) => {
                        ops::prim_i64(*op, *a, *b).map(Word::I64)
                    }
                    (PrimitiveKind::Float64, Word::F64(a), Word::F64(b)) => {
                        ops::prim_f64(*op, *a, *b).map(Word::F64)
                    }
                    (PrimitiveKind::Bool, Word::Bool(a), Word::Bool(b)) => {
                        ops::prim_bool(*op, *a, *b).map(Word::Bool)
                    }
                    _ => mismatch(unit, ValueKind::from_primitive(*kind), a),
                };
                match (result, deopt) {
                    (Some(w), _) => regs[slot(unit, *dst)] = w,
                    (None, Some(id)) => return ExecExit::Deopt { id: *id, err: None },
                    (None, None) => deopt::fatal(DeoptError::MissingDeopt {
                        func: unit.full_name.clone(),
                        pc,
                    }),
                }
            }
            Inst::PrimCompare { dst, lhs, rhs, kind, op } => {
                let (a, b) = (&regs[slot(unit, *lhs)], &regs[slot(unit, *rhs)]);
                let result = match (a, b) {
                    (Word::I64(a), Word::I64(b)) => ops::prim_compare(*op, *a, *b),
                    (Word::F64(a), Word::F64(b)) => ops::prim_compare(*op, *a, *b),
                    (Word::Bool(a), Word::Bool(b)) => ops::prim_compare(*op, *a, *b),
                    _ => mismatch(unit, ValueKind::from_primitive(*kind), a),
                };
                regs[slot(unit, *dst)] = Word::Bool(result);
            }
            Inst::Jump { target } => {
                pc = *target;
                continue;
            }
            Inst::BranchBool { cond, target, jump_if } => match &regs[slot(unit, *cond)] {
                Word::Bool(b) if b == jump_if => {
                    pc = *target;
                    continue;
                }
                Word::Bool(_) => {}
                other => mismatch(unit, ValueKind::Bool, other),
            },
            Inst::BranchTruthy { cond, target, jump_if, deopt } => {
                let value = boxed(unit, regs, *cond);
                vm.shadow.set_pc(owner, pc);
                match ops::truthy(vm, &value) {
                    Ok(b) if b == *jump_if => {
                        pc = *target;
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => return ExecExit::Deopt { id: *deopt, err: Some(e) },
                }
            }
            Inst::CheckBound { src, deopt } => {
                if matches!(regs[slot(unit, *src)], Word::Empty) {
                    return ExecExit::Deopt { id: *deopt, err: None };
                }
            }
            Inst::GuardIs { src, index, deopt } => {
                let ok = match (&regs[slot(unit, *src)], unit.constants.get(*index as usize)) {
                    (Word::Obj(v), Some(expected)) => v.is(expected),
                    _ => false,
                };
                if !ok {
                    return ExecExit::Deopt { id: *deopt, err: None };
                }
            }
            Inst::Call { helper, dsts, args, deopt } => {
                let words: SmallVec<[Word; 4]> =
                    args.iter().map(|a| regs[slot(unit, *a)].clone()).collect();
                vm.shadow.set_pc(owner, pc);
                match call_helper(vm, unit, *helper, &words) {
                    Ok(results) => {
                        for (dst, w) in dsts.iter().zip(results) {
                            regs[slot(unit, *dst)] = w;
                        }
                    }
                    Err(e) => return ExecExit::Deopt { id: *deopt, err: Some(e) },
                }
            }
            Inst::ForIter { iter, dst, exhausted, deopt } => {
                let it = boxed(unit, regs, *iter);
                vm.shadow.set_pc(owner, pc);
                match ops::iter_step(vm, &it) {
                    Ok(IterStep::Yield(v)) => regs[slot(unit, *dst)] = Word::Obj(v),
                    Ok(IterStep::Return(_)) => {
                        pc = *exhausted;
                        continue;
                    }
                    Err(e) => return ExecExit::Deopt { id: *deopt, err: Some(e) },
                }
            }
            Inst::Yield { value, dst, point } => {
                let value = boxed(unit, regs, *value);
                vm.shadow.set_pc(owner, pc);
                return ExecExit::Yield {
                    value,
                    resume: ResumePoint::AfterYield {
                        pc: pc + 1,
                        dst: *dst,
                        point: *point,
                    },
                    delegated: false,
                };
            }
            Inst::YieldFrom { iter, value, dst, point, deopt } => {
                let it = boxed(unit, regs, *iter);
                let sent = boxed(unit, regs, *value);
                vm.shadow.set_pc(owner, pc);
                match ops::send_to(vm, &it, sent) {
                    Ok(IterStep::Yield(v)) => {
                        return ExecExit::Yield {
                            value: v,
                            resume: ResumePoint::AtYieldFrom {
                                pc,
                                value: *value,
                                point: *point,
                            },
                            delegated: true,
                        }
                    }
                    Ok(IterStep::Return(r)) => {
                        regs[slot(unit, *value)] = Word::Empty;
                        regs[slot(unit, *dst)] = Word::Obj(r);
                    }
                    Err(e) => return ExecExit::Deopt { id: *deopt, err: Some(e) },
                }
            }
            Inst::BeginInlined { frame } => {
                vm.shadow.set_pc(owner, pc);
                let Some(inline) = unit.inline_frames.get(*frame as usize) else {
                    deopt::fatal(DeoptError::UnknownInlineFrame {
                        func: unit.full_name.clone(),
                        frame: *frame,
                    });
                };
                vm.shadow.push(ShadowFrame::new(
                    inline.func.clone(),
                    FrameKind::Inlined {
                        unit: unit.clone(),
                        frame: *frame,
                        owner,
                    },
                ));
            }
            Inst::EndInlined { frame } => {
                let matches_top = matches!(
                    vm.shadow.top().map(|e| &e.kind),
                    Some(FrameKind::Inlined { frame: f, owner: o, .. }) if f == frame && *o == owner
                );
                if !matches_top {
                    deopt::fatal(DeoptError::ShadowMismatch {
                        func: unit.full_name.clone(),
                        expected: owner + 1,
                        found: vm.shadow.len(),
                    });
                }
                vm.shadow.pop();
            }
            Inst::Safepoint => {
                vm.shadow.set_pc(owner, pc);
                vm.safepoint();
            }
            Inst::Deopt { deopt } => return ExecExit::Deopt { id: *deopt, err: None },
            Inst::Return { src, kind } => {
                let word = &regs[slot(unit, *src)];
                match word.to_value(*kind) {
                    Some(v) => return ExecExit::Return(v),
                    None => mismatch(unit, *kind, word),
                }
            }
        }
        pc += 1;
    }
}

// =============================================================================
// Runtime Helpers
// =============================================================================

fn obj(word: &Word) -> Value {
    match word {
        Word::Obj(v) => v.clone(),
        other => deopt::fatal(DeoptError::HelperOperand {
            found: other.kind_name(),
        }),
    }
}

fn name_of(unit: &CompiledUnit, frame: u16, index: u32) -> PyResult<Arc<str>> {
    unit.inline_frames
        .get(frame as usize)
        .and_then(|f| f.code.names.get(index as usize).cloned())
        .ok_or_else(|| PyErr::runtime_error(format!("bad name index {}", index)))
}

type Results = SmallVec<[Word; 2]>;

#[inline]
fn one(value: Value) -> PyResult<Results> {
    Ok(smallvec![Word::Obj(value)])
}

fn call_helper(vm: &mut Vm, unit: &CompiledUnit, helper: Helper, args: &[Word]) -> PyResult<Results> {
    let inline_frame = |frame: u16| {
        unit.inline_frames
            .get(frame as usize)
            .ok_or_else(|| PyErr::runtime_error(format!("bad inline frame {}", frame)))
    };
    match helper {
        Helper::LoadGlobal { frame, offset, name } => {
            let f = inline_frame(frame)?;
            one(global_cache::load_global(vm, &f.func, &f.code, offset, name)?)
        }
        Helper::StoreGlobal { frame, name } => {
            let f = inline_frame(frame)?;
            let name = name_of(unit, frame, name)?;
            f.func.globals.set_str(&name, obj(&args[0]));
            Ok(SmallVec::new())
        }
        Helper::LoadAttr { frame, offset, name } => {
            let code = &inline_frame(frame)?.code;
            let name = name_of(unit, frame, name)?;
            one(inline_cache::load_attr(vm, code, offset, &obj(&args[0]), &name)?)
        }
        Helper::StoreAttr { frame, offset, name } => {
            let code = &inline_frame(frame)?.code;
            let name = name_of(unit, frame, name)?;
            inline_cache::store_attr(vm, code, offset, &obj(&args[1]), &name, obj(&args[0]))?;
            Ok(SmallVec::new())
        }
        Helper::DeleteAttr { frame, name } => {
            let name = name_of(unit, frame, name)?;
            attr::del_attr(vm, &obj(&args[0]), &name)?;
            Ok(SmallVec::new())
        }
        Helper::LoadMethod { frame, offset, name } => {
            let code = &inline_frame(frame)?.code;
            let name = name_of(unit, frame, name)?;
            let (method, receiver) = inline_cache::load_method(vm, code, offset, &obj(&args[0]), &name)?;
            Ok(smallvec![Word::Obj(method), Word::Obj(receiver)])
        }
        Helper::Call { .. } => {
            let callable = obj(&args[0]);
            let rest = args[1..].iter().map(obj).collect();
            one(vm.call(&callable, rest)?)
        }
        Helper::CallMethod { .. } => {
            let method = obj(&args[0]);
            let receiver = obj(&args[1]);
            let mut rest: Vec<Value> = args[2..].iter().map(obj).collect();
            if matches!(method, Value::Null) {
                one(vm.call(&receiver, rest)?)
            } else {
                rest.insert(0, receiver);
                one(vm.call(&method, rest)?)
            }
        }
        Helper::CallStatic { .. } => {
            let callee = obj(&args[0]);
            let rest = args[1..].iter().map(obj).collect();
            match &callee {
                Value::Function(f) => one(vm.call_static(f, rest)?),
                _ => one(vm.call(&callee, rest)?),
            }
        }
        Helper::InvokeNative { frame, constant } => {
            let code = &inline_frame(frame)?.code;
            let Some(Constant::Native(sig)) = code.constants.get(constant as usize) else {
                return Err(PyErr::runtime_error("native call without a signature"));
            };
            let result = vm.runtime().natives().invoke(sig, args)?;
            Ok(smallvec![result])
        }
        Helper::MakeFunction { frame, with_defaults } => {
            let f = inline_frame(frame)?;
            let (defaults, code) = if with_defaults {
                (Some(obj(&args[0])), obj(&args[1]))
            } else {
                (None, obj(&args[0]))
            };
            one(vm.make_function_value(&code, &f.func, defaults.as_ref())?)
        }
        Helper::BinaryOp(op) => one(ops::binary_op(vm, op, &obj(&args[0]), &obj(&args[1]))?),
        Helper::Compare(op) => one(ops::compare_op(vm, op, &obj(&args[0]), &obj(&args[1]))?),
        Helper::UnaryNot => one(ops::unary_not(vm, &obj(&args[0]))?),
        Helper::UnaryNegative => one(ops::unary_negative(vm, &obj(&args[0]))?),
        Helper::GetIter => one(ops::get_iter(vm, &obj(&args[0]))?),
        Helper::BuildTuple => one(Value::tuple(args.iter().map(obj).collect())),
        Helper::BuildList => one(Value::new_list(args.iter().map(obj).collect())),
        Helper::BuildMap => {
            let items: Vec<Value> = args.iter().map(obj).collect();
            one(ops::build_map(&items)?)
        }
        Helper::BinarySubscr => one(ops::subscr(vm, &obj(&args[0]), &obj(&args[1]))?),
        Helper::StoreSubscr => {
            ops::store_subscr(vm, &obj(&args[1]), &obj(&args[2]), obj(&args[0]))?;
            Ok(SmallVec::new())
        }
        Helper::UnpackSequence { count } => {
            let items = ops::unpack_sequence(vm, &obj(&args[0]), count as usize)?;
            Ok(items.into_iter().rev().map(Word::Obj).collect())
        }
        Helper::GetYieldFromIter => one(generator::get_yield_from_iter(vm, &obj(&args[0]))?),
        Helper::GetAwaitable => one(generator::get_awaitable(vm, &obj(&args[0]))?),
        Helper::GetLen => one(Value::Int(ops::get_len(vm, &obj(&args[0]))?)),
        Helper::MatchSequence => one(Value::Bool(ops::match_sequence(&obj(&args[0])))),
        Helper::MatchMapping => one(Value::Bool(ops::match_mapping(&obj(&args[0])))),
        Helper::MatchClass { count } => one(ops::match_class(
            vm,
            &obj(&args[0]),
            &obj(&args[1]),
            count as usize,
        )?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_conversions() {
        assert!(matches!(Word::from_value(Value::Int(3), ValueKind::I64), Some(Word::I64(3))));
        assert!(Word::from_value(Value::Int(3), ValueKind::F64).is_none());
        assert!(Word::from_value(Value::Bool(true), ValueKind::I64).is_none());
        assert_eq!(Word::F64(1.5).to_value(ValueKind::F64).and_then(|v| v.as_float()), Some(1.5));
        assert!(Word::Empty.to_value(ValueKind::Boxed).is_none());
        assert_eq!(Word::I64(0).type_name(), "int64");
    }
}
