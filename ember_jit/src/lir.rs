//! Low-level IR and machine instructions.
//!
//! Lowering produces [`Inst<VReg, Label>`]; after register allocation code
//! generation rewrites every operand to a [`Loc`] and every label to an
//! instruction index, giving the [`MInst`] stream stored in a compiled
//! unit. Both forms share one instruction set so passes can be written
//! once.
//!
//! | Family | Instructions |
//! |--------|--------------|
//! | Data movement | `Move`, `LoadConst`, `LoadImm`, `Clear` |
//! | Representation | `Box`, `Unbox` |
//! | Primitive arithmetic | `PrimBinary`, `PrimCompare` |
//! | Control flow | `Jump`, `BranchBool`, `BranchTruthy`, `ForIter`, `Return` |
//! | Guards | `CheckBound`, `GuardIs`, `Deopt` |
//! | Runtime calls | `Call` (see [`Helper`]) |
//! | Suspension | `Yield`, `YieldFrom` |
//! | Inlining markers | `BeginInlined`, `EndInlined` |

use crate::deopt_meta::{DeoptId, DeoptMetadata, InlineFrame, ValueKind};
use crate::inliner::InlineStats;
use crate::regalloc::{Loc, VReg};
use ember_bytecode::{BinOp, CmpOp, PrimitiveKind};
use ember_runtime::Value;
use smallvec::SmallVec;
use std::fmt;

/// Branch target in the LIR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

/// Inline frame id; 0 is the compiled function itself.
pub type FrameId = u16;

/// Machine instruction.
pub type MInst = Inst<Loc, usize>;

/// LIR instruction.
pub type LirInst = Inst<VReg, Label>;

/// Unboxed immediate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Imm {
    I64(i64),
    F64(f64),
    Bool(bool),
}

impl Imm {
    /// Representation of the immediate.
    pub fn kind(self) -> ValueKind {
        match self {
            Imm::I64(_) => ValueKind::I64,
            Imm::F64(_) => ValueKind::F64,
            Imm::Bool(_) => ValueKind::Bool,
        }
    }
}

// =============================================================================
// Runtime Helpers
// =============================================================================

/// Runtime operation invoked by a `Call` instruction.
///
/// Helpers are shared with the interpreter, so compiled and interpreted
/// execution produce identical results. Arguments and results are listed
/// in evaluation-stack order, bottom first. `frame` names the inline frame
/// whose code owns the name table and the inline cache site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Helper {
    LoadGlobal { frame: FrameId, offset: u32, name: u32 },
    StoreGlobal { frame: FrameId, name: u32 },
    LoadAttr { frame: FrameId, offset: u32, name: u32 },
    StoreAttr { frame: FrameId, offset: u32, name: u32 },
    DeleteAttr { frame: FrameId, name: u32 },
    /// Results: method (or null), then receiver (or attribute).
    LoadMethod { frame: FrameId, offset: u32, name: u32 },
    /// `args[0]` is the callable.
    Call { argc: u32 },
    /// `args[0..2]` are method/null and self/callable.
    CallMethod { argc: u32 },
    /// Direct call of a known function; `args[0]` is that function.
    CallStatic { argc: u32 },
    /// Native library call with unboxed arguments.
    InvokeNative { frame: FrameId, constant: u32 },
    MakeFunction { frame: FrameId, with_defaults: bool },
    BinaryOp(BinOp),
    Compare(CmpOp),
    UnaryNot,
    UnaryNegative,
    GetIter,
    BuildTuple,
    BuildList,
    BuildMap,
    BinarySubscr,
    StoreSubscr,
    /// `count` results; the first item ends up on top.
    UnpackSequence { count: u32 },
    GetYieldFromIter,
    GetAwaitable,
    GetLen,
    MatchSequence,
    MatchMapping,
    MatchClass { count: u32 },
}

impl Helper {
    /// Short name for listings.
    pub fn name(&self) -> &'static str {
        match self {
            Helper::LoadGlobal { .. } => "load_global",
            Helper::StoreGlobal { .. } => "store_global",
            Helper::LoadAttr { .. } => "load_attr",
            Helper::StoreAttr { .. } => "store_attr",
            Helper::DeleteAttr { .. } => "delete_attr",
            Helper::LoadMethod { .. } => "load_method",
            Helper::Call { .. } => "call",
            Helper::CallMethod { .. } => "call_method",
            Helper::CallStatic { .. } => "call_static",
            Helper::InvokeNative { .. } => "invoke_native",
            Helper::MakeFunction { .. } => "make_function",
            Helper::BinaryOp(_) => "binary_op",
            Helper::Compare(_) => "compare",
            Helper::UnaryNot => "unary_not",
            Helper::UnaryNegative => "unary_negative",
            Helper::GetIter => "get_iter",
            Helper::BuildTuple => "build_tuple",
            Helper::BuildList => "build_list",
            Helper::BuildMap => "build_map",
            Helper::BinarySubscr => "binary_subscr",
            Helper::StoreSubscr => "store_subscr",
            Helper::UnpackSequence { .. } => "unpack_sequence",
            Helper::GetYieldFromIter => "get_yield_from_iter",
            Helper::GetAwaitable => "get_awaitable",
            Helper::GetLen => "get_len",
            Helper::MatchSequence => "match_sequence",
            Helper::MatchMapping => "match_mapping",
            Helper::MatchClass { .. } => "match_class",
        }
    }
}

// =============================================================================
// Instructions
// =============================================================================

/// An instruction over locations `L` and branch targets `T`.
#[derive(Debug, Clone, PartialEq)]
pub enum Inst<L, T> {
    Move { dst: L, src: L },
    /// Load a boxed constant from the unit's constant pool.
    LoadConst { dst: L, index: u32 },
    LoadImm { dst: L, imm: Imm },
    /// Make a location empty (an unbound local).
    Clear { dst: L },
    Box { dst: L, src: L, kind: PrimitiveKind },
    Unbox { dst: L, src: L, kind: PrimitiveKind, deopt: DeoptId },
    /// Division by zero deopts through `deopt`; everything else wraps.
    PrimBinary {
        dst: L,
        lhs: L,
        rhs: L,
        kind: PrimitiveKind,
        op: BinOp,
        deopt: Option<DeoptId>,
    },
    PrimCompare { dst: L, lhs: L, rhs: L, kind: PrimitiveKind, op: CmpOp },
    Jump { target: T },
    BranchBool { cond: L, target: T, jump_if: bool },
    BranchTruthy { cond: L, target: T, jump_if: bool, deopt: DeoptId },
    /// Deopt when the location is empty.
    CheckBound { src: L, deopt: DeoptId },
    /// Deopt unless the location holds constant `index` (by identity).
    GuardIs { src: L, index: u32, deopt: DeoptId },
    Call { helper: Helper, dsts: SmallVec<[L; 2]>, args: SmallVec<[L; 4]>, deopt: DeoptId },
    /// Advance an iterator; jump to `exhausted` when done.
    ForIter { iter: L, dst: L, exhausted: T, deopt: DeoptId },
    /// Suspend producing `value`; the sent value lands in `dst`.
    Yield { value: L, dst: L, point: DeoptId },
    /// Delegate to `iter` until it finishes; its result lands in `dst`.
    YieldFrom { iter: L, value: L, dst: L, point: DeoptId, deopt: DeoptId },
    BeginInlined { frame: FrameId },
    EndInlined { frame: FrameId },
    /// Run queued finalizers after a reference may have been released.
    Safepoint,
    /// Unconditional transfer to the interpreter.
    Deopt { deopt: DeoptId },
    Return { src: L, kind: ValueKind },
}

impl<L: Copy, T: Copy> Inst<L, T> {
    /// Rewrite locations and targets.
    pub fn map<L2, T2>(&self, mut fl: impl FnMut(L) -> L2, mut ft: impl FnMut(T) -> T2) -> Inst<L2, T2> {
        use Inst::*;
        match self {
            Move { dst, src } => Move { dst: fl(*dst), src: fl(*src) },
            LoadConst { dst, index } => LoadConst { dst: fl(*dst), index: *index },
            LoadImm { dst, imm } => LoadImm { dst: fl(*dst), imm: *imm },
            Clear { dst } => Clear { dst: fl(*dst) },
            Box { dst, src, kind } => Box { dst: fl(*dst), src: fl(*src), kind: *kind },
            Unbox { dst, src, kind, deopt } => Unbox {
                dst: fl(*dst),
                src: fl(*src),
                kind: *kind,
                deopt: *deopt,
            },
            PrimBinary { dst, lhs, rhs, kind, op, deopt } => PrimBinary {
                dst: fl(*dst),
                lhs: fl(*lhs),
                rhs: fl(*rhs),
                kind: *kind,
                op: *op,
                deopt: *deopt,
            },
            PrimCompare { dst, lhs, rhs, kind, op } => PrimCompare {
                dst: fl(*dst),
                lhs: fl(*lhs),
                rhs: fl(*rhs),
                kind: *kind,
                op: *op,
            },
            Jump { target } => Jump { target: ft(*target) },
            BranchBool { cond, target, jump_if } => BranchBool {
                cond: fl(*cond),
                target: ft(*target),
                jump_if: *jump_if,
            },
            BranchTruthy { cond, target, jump_if, deopt } => BranchTruthy {
                cond: fl(*cond),
                target: ft(*target),
                jump_if: *jump_if,
                deopt: *deopt,
            },
            CheckBound { src, deopt } => CheckBound { src: fl(*src), deopt: *deopt },
            GuardIs { src, index, deopt } => GuardIs {
                src: fl(*src),
                index: *index,
                deopt: *deopt,
            },
            Call { helper, dsts, args, deopt } => Call {
                helper: *helper,
                dsts: dsts.iter().map(|d| fl(*d)).collect(),
                args: args.iter().map(|a| fl(*a)).collect(),
                deopt: *deopt,
            },
            ForIter { iter, dst, exhausted, deopt } => ForIter {
                iter: fl(*iter),
                dst: fl(*dst),
                exhausted: ft(*exhausted),
                deopt: *deopt,
            },
            Yield { value, dst, point } => Yield {
                value: fl(*value),
                dst: fl(*dst),
                point: *point,
            },
            YieldFrom { iter, value, dst, point, deopt } => YieldFrom {
                iter: fl(*iter),
                value: fl(*value),
                dst: fl(*dst),
                point: *point,
                deopt: *deopt,
            },
            BeginInlined { frame } => BeginInlined { frame: *frame },
            EndInlined { frame } => EndInlined { frame: *frame },
            Safepoint => Safepoint,
            Deopt { deopt } => Deopt { deopt: *deopt },
            Return { src, kind } => Return { src: fl(*src), kind: *kind },
        }
    }

    /// Visit operands: `(location, is_def)`. Uses are reported before defs.
    pub fn for_each_operand(&self, mut f: impl FnMut(L, bool)) {
        use Inst::*;
        match self {
            Move { dst, src } | Box { dst, src, .. } | Unbox { dst, src, .. } => {
                f(*src, false);
                f(*dst, true);
            }
            LoadConst { dst, .. } | LoadImm { dst, .. } | Clear { dst } => f(*dst, true),
            PrimBinary { dst, lhs, rhs, .. } | PrimCompare { dst, lhs, rhs, .. } => {
                f(*lhs, false);
                f(*rhs, false);
                f(*dst, true);
            }
            BranchBool { cond, .. } | BranchTruthy { cond, .. } => f(*cond, false),
            CheckBound { src, .. } | GuardIs { src, .. } | Return { src, .. } => f(*src, false),
            Call { dsts, args, .. } => {
                for a in args {
                    f(*a, false);
                }
                for d in dsts {
                    f(*d, true);
                }
            }
            ForIter { iter, dst, .. } => {
                f(*iter, false);
                f(*dst, true);
            }
            Yield { value, dst, .. } => {
                f(*value, false);
                f(*dst, true);
            }
            YieldFrom { iter, value, dst, .. } => {
                f(*iter, false);
                f(*value, false);
                f(*dst, true);
            }
            Jump { .. } | BeginInlined { .. } | EndInlined { .. } | Safepoint | Deopt { .. } => {}
        }
    }

    /// Branch target, if any.
    pub fn target(&self) -> Option<T> {
        match self {
            Inst::Jump { target }
            | Inst::BranchBool { target, .. }
            | Inst::BranchTruthy { target, .. } => Some(*target),
            Inst::ForIter { exhausted, .. } => Some(*exhausted),
            _ => None,
        }
    }

    /// Deopt points referenced by the instruction.
    pub fn deopt_ids(&self) -> SmallVec<[DeoptId; 2]> {
        use Inst::*;
        let mut ids = SmallVec::new();
        match self {
            PrimBinary { deopt: Some(deopt), .. } => ids.push(*deopt),
            Unbox { deopt, .. }
            | BranchTruthy { deopt, .. }
            | CheckBound { deopt, .. }
            | GuardIs { deopt, .. }
            | Call { deopt, .. }
            | ForIter { deopt, .. }
            | Deopt { deopt } => ids.push(*deopt),
            Yield { point, .. } => ids.push(*point),
            YieldFrom { point, deopt, .. } => {
                ids.push(*point);
                ids.push(*deopt);
            }
            _ => {}
        }
        ids
    }

    /// Whether control never falls through.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Inst::Jump { .. } | Inst::Return { .. } | Inst::Deopt { .. })
    }
}

impl<L: fmt::Display + Copy, T: fmt::Debug + Copy> fmt::Display for Inst<L, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Inst::*;
        match self {
            Move { dst, src } => write!(f, "{} = {}", dst, src),
            LoadConst { dst, index } => write!(f, "{} = const[{}]", dst, index),
            LoadImm { dst, imm } => write!(f, "{} = imm {:?}", dst, imm),
            Clear { dst } => write!(f, "clear {}", dst),
            Box { dst, src, kind } => write!(f, "{} = box.{} {}", dst, kind.name(), src),
            Unbox { dst, src, kind, deopt } => {
                write!(f, "{} = unbox.{} {} (deopt {})", dst, kind.name(), src, deopt)
            }
            PrimBinary { dst, lhs, rhs, kind, op, .. } => {
                write!(f, "{} = {} {}.{} {}", dst, lhs, op, kind.name(), rhs)
            }
            PrimCompare { dst, lhs, rhs, kind, op } => {
                write!(f, "{} = {} {}.{} {}", dst, lhs, op, kind.name(), rhs)
            }
            Jump { target } => write!(f, "jump {:?}", target),
            BranchBool { cond, target, jump_if } => {
                write!(f, "branch_bool {} == {} -> {:?}", cond, jump_if, target)
            }
            BranchTruthy { cond, target, jump_if, .. } => {
                write!(f, "branch_truthy {} == {} -> {:?}", cond, jump_if, target)
            }
            CheckBound { src, deopt } => write!(f, "check_bound {} (deopt {})", src, deopt),
            GuardIs { src, index, deopt } => {
                write!(f, "guard {} is const[{}] (deopt {})", src, index, deopt)
            }
            Call { helper, dsts, args, .. } => {
                for (i, d) in dsts.iter().enumerate() {
                    write!(f, "{}{}", if i > 0 { ", " } else { "" }, d)?;
                }
                if !dsts.is_empty() {
                    f.write_str(" = ")?;
                }
                write!(f, "call {}(", helper.name())?;
                for (i, a) in args.iter().enumerate() {
                    write!(f, "{}{}", if i > 0 { ", " } else { "" }, a)?;
                }
                f.write_str(")")
            }
            ForIter { iter, dst, exhausted, .. } => {
                write!(f, "{} = for_iter {} else {:?}", dst, iter, exhausted)
            }
            Yield { value, dst, point } => write!(f, "{} = yield {} (point {})", dst, value, point),
            YieldFrom { iter, value, dst, point, .. } => {
                write!(f, "{} = yield_from {} <- {} (point {})", dst, iter, value, point)
            }
            BeginInlined { frame } => write!(f, "begin_inlined {}", frame),
            EndInlined { frame } => write!(f, "end_inlined {}", frame),
            Safepoint => f.write_str("safepoint"),
            Deopt { deopt } => write!(f, "deopt {}", deopt),
            Return { src, kind } => write!(f, "return.{} {}", kind, src),
        }
    }
}

// =============================================================================
// Lowered Function
// =============================================================================

/// Bytecode position an instruction was lowered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Origin {
    /// Inline frame whose code contains `offset`.
    pub frame: FrameId,
    /// Bytecode offset.
    pub offset: u32,
}

/// Output of lowering: one function's LIR plus its side tables.
#[derive(Debug, Default)]
pub struct LirFunction {
    /// Instruction stream.
    pub insts: Vec<LirInst>,
    /// Origin of each instruction (parallel to `insts`).
    pub origins: Vec<Origin>,
    /// Instruction index of each label.
    pub labels: Vec<Option<usize>>,
    /// Deopt points, indexed by [`DeoptId`].
    pub deopts: Vec<DeoptMetadata<VReg>>,
    /// Boxed constant pool (`LoadConst`, `GuardIs`).
    pub constants: Vec<Value>,
    /// Inline frames; frame 0 is the compiled function.
    pub inline_frames: Vec<InlineFrame>,
    /// Parameter registers in argument order.
    pub params: Vec<(VReg, ValueKind)>,
    /// Registers live for the whole function.
    pub pinned: Vec<VReg>,
    /// Number of virtual registers created.
    pub num_vregs: u32,
    /// Inlining outcome.
    pub inline_stats: InlineStats,
}

impl LirFunction {
    /// Instruction index bound to `label`.
    #[inline]
    pub fn label_pos(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0 as usize).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_operand_order() {
        let inst: LirInst = Inst::Call {
            helper: Helper::BinaryOp(BinOp::Add),
            dsts: smallvec![VReg::new(0)],
            args: smallvec![VReg::new(0), VReg::new(1)],
            deopt: 3,
        };
        let mut seen = Vec::new();
        inst.for_each_operand(|v, def| seen.push((v.index(), def)));
        assert_eq!(seen, [(0, false), (1, false), (0, true)]);
        assert_eq!(inst.deopt_ids().as_slice(), &[3]);
    }

    #[test]
    fn test_map_rewrites_targets() {
        let inst: LirInst = Inst::BranchBool {
            cond: VReg::new(4),
            target: Label(2),
            jump_if: false,
        };
        let m: MInst = inst.map(|_| Loc::Reg(1), |l| l.0 as usize * 10);
        assert_eq!(m.target(), Some(20));
        assert_eq!(m.to_string(), "branch_bool r1 == false -> 20");
    }
}
