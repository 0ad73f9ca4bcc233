//! Bytecode to LIR lowering.
//!
//! Each frame being lowered (the compiled function plus every inlined
//! callee) gets one fixed virtual register per local slot and per
//! evaluation-stack depth. Basic blocks are lowered once, in offset order,
//! from a worklist; every edge carries an abstract state (representation of
//! each stack slot and the handler block stack) that must agree with the
//! state already recorded for its target.
//!
//! ```text
//! bytecode               abstract state        LIR
//! LOAD_FAST  x           [obj]                 v3 = v0
//! LOAD_FAST  y           [obj, obj]            v4 = v1
//! BINARY_OP  +           [obj]                 v3 = call binary_op(v3, v4)
//! RETURN_VALUE           []                    return.obj v3
//! ```
//!
//! Handler blocks are not lowered. Any exception leaves compiled code
//! through a deopt with the `Unwind` action, and the interpreter finds the
//! handler using the block stack recorded in the deopt metadata.

use crate::deopt_meta::{
    BlockSpec, DeoptAction, DeoptId, DeoptMetadata, DeoptReason, FrameMeta, InlineFrame,
    LiveValue, ValueKind,
};
use crate::error::{CompileError, CompileResult};
use crate::inliner::{can_inline, InlineFailureType, InlineStats};
use crate::lir::{FrameId, Helper, Imm, Inst, Label, LirFunction, LirInst, Origin};
use crate::preload::Preloader;
use crate::regalloc::VReg;
use ember_bytecode::{BinOp, CodeObject, Constant, Instruction, Opcode, PrimitiveKind};
use ember_runtime::{FrameMode, FunctionObject, Value};
use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Lowering options.
#[derive(Debug, Clone)]
pub struct LowerConfig {
    /// Inline statically known callees.
    pub inliner: bool,
    /// Maximum nesting of inline frames.
    pub max_inline_depth: usize,
}

impl Default for LowerConfig {
    fn default() -> Self {
        Self {
            inliner: true,
            max_inline_depth: crate::inliner::DEFAULT_MAX_INLINE_DEPTH,
        }
    }
}

/// Lower `func` (and its inlined callees) to LIR.
pub fn lower(func: &Arc<FunctionObject>, config: &LowerConfig) -> CompileResult<LirFunction> {
    let mut lowerer = Lowerer {
        config,
        out: LirFunction::default(),
        next_vreg: 0,
    };
    let code = func.code.clone();
    lowerer.out.inline_frames.push(InlineFrame {
        code: code.clone(),
        func: func.clone(),
        parent: None,
        call_offset: 0,
    });

    let mut ctx = FrameCtx::new(&mut lowerer, 0, func.clone(), Vec::new(), 0, FrameExit::Return)?;
    let origin = Origin { frame: 0, offset: 0 };
    let nparams = code.param_slots();
    for slot in 0..ctx.locals.len() {
        let vreg = ctx.locals[slot];
        lowerer.out.pinned.push(vreg);
        if slot < nparams {
            lowerer.out.params.push((vreg, ctx.local_kinds[slot]));
        } else {
            lowerer.emit(origin, Inst::Clear { dst: vreg });
        }
    }
    lowerer.lower_frame(&mut ctx)?;
    lowerer.out.num_vregs = lowerer.next_vreg;
    Ok(lowerer.out)
}

// =============================================================================
// Lowering State
// =============================================================================

/// Abstract state on a control-flow edge.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BlockState {
    kinds: Vec<ValueKind>,
    blocks: Vec<BlockSpec>,
}

/// State while walking a block.
struct Cursor {
    state: BlockState,
    /// Unit constant index of a function known to be in each stack slot.
    known: Vec<Option<u32>>,
}

impl Cursor {
    #[inline]
    fn depth(&self) -> usize {
        self.state.kinds.len()
    }

    #[inline]
    fn push(&mut self, kind: ValueKind) -> usize {
        self.state.kinds.push(kind);
        self.known.push(None);
        self.depth() - 1
    }

    #[inline]
    fn truncate(&mut self, depth: usize) {
        self.state.kinds.truncate(depth);
        self.known.truncate(depth);
    }

    #[inline]
    fn top_kind(&self, n: usize) -> Option<ValueKind> {
        self.state
            .kinds
            .len()
            .checked_sub(n + 1)
            .map(|i| self.state.kinds[i])
    }
}

enum FrameExit {
    Return,
    Inline { result: VReg, cont: Label },
}

enum Flow {
    Next,
    End,
}

/// One frame being lowered.
struct FrameCtx {
    id: FrameId,
    code: Arc<CodeObject>,
    func: Arc<FunctionObject>,
    locals: Vec<VReg>,
    local_kinds: Vec<ValueKind>,
    stack: Vec<VReg>,
    tmp: VReg,
    consts: Vec<Option<u32>>,
    preload: Preloader,
    bound: Vec<Option<Vec<bool>>>,
    leaders: Vec<bool>,
    labels: FxHashMap<u32, Label>,
    entry_states: FxHashMap<u32, BlockState>,
    worklist: BTreeSet<u32>,
    /// Metadata of the enclosing frames at their call sites.
    outer: Vec<FrameMeta<VReg>>,
    /// Inline nesting level (0 for the compiled function).
    depth: usize,
    exit: FrameExit,
}

impl FrameCtx {
    fn new(
        lowerer: &mut Lowerer<'_>,
        id: FrameId,
        func: Arc<FunctionObject>,
        outer: Vec<FrameMeta<VReg>>,
        depth: usize,
        exit: FrameExit,
    ) -> CompileResult<Self> {
        let code = func.code.clone();
        ember_bytecode::stack_depths(&code)?;
        let nlocals = code.nlocals();
        let locals = (0..nlocals).map(|_| lowerer.new_vreg()).collect();
        let local_kinds = (0..nlocals)
            .map(|slot| ValueKind::from_local_type(code.local_type(slot)))
            .collect();
        let stack = (0..code.stack_size as usize + 1)
            .map(|_| lowerer.new_vreg())
            .collect();
        let tmp = lowerer.new_vreg();
        Ok(Self {
            id,
            consts: vec![None; code.constants.len()],
            preload: Preloader::new(&func, &code),
            bound: definite_assignment(&code),
            leaders: find_leaders(&code),
            code,
            func,
            locals,
            local_kinds,
            stack,
            tmp,
            labels: FxHashMap::default(),
            entry_states: FxHashMap::default(),
            worklist: BTreeSet::new(),
            outer,
            depth,
            exit,
        })
    }

    fn frame_meta(&self, offset: u32, state: &BlockState, depth: usize) -> FrameMeta<VReg> {
        FrameMeta {
            inline_frame: self.id,
            offset,
            locals: self
                .locals
                .iter()
                .zip(&self.local_kinds)
                .map(|(&loc, &kind)| LiveValue { loc, kind })
                .collect(),
            stack: (0..depth)
                .map(|i| LiveValue {
                    loc: self.stack[i],
                    kind: state.kinds[i],
                })
                .collect(),
            blocks: state.blocks.clone(),
        }
    }

    #[inline]
    fn is_bound(&self, offset: usize, slot: usize) -> bool {
        self.bound
            .get(offset)
            .and_then(|b| b.as_ref())
            .map_or(false, |b| b[slot])
    }

    fn describe(&self, offset: usize) -> String {
        format!("{} @ {}", self.code.instructions[offset], offset)
    }
}

// =============================================================================
// Lowerer
// =============================================================================

struct Lowerer<'c> {
    config: &'c LowerConfig,
    out: LirFunction,
    next_vreg: u32,
}

/// Lengths to restore when an inlining attempt is abandoned.
struct Snapshot {
    insts: usize,
    labels: usize,
    deopts: usize,
    constants: usize,
    inline_frames: usize,
    stats: InlineStats,
}

impl<'c> Lowerer<'c> {
    #[inline]
    fn new_vreg(&mut self) -> VReg {
        let v = VReg::new(self.next_vreg);
        self.next_vreg += 1;
        v
    }

    fn new_label(&mut self) -> Label {
        self.out.labels.push(None);
        Label(self.out.labels.len() as u32 - 1)
    }

    fn bind(&mut self, label: Label) {
        self.out.labels[label.0 as usize] = Some(self.out.insts.len());
    }

    #[inline]
    fn emit(&mut self, origin: Origin, inst: LirInst) {
        self.out.insts.push(inst);
        self.out.origins.push(origin);
    }

    fn add_const(&mut self, value: Value) -> u32 {
        self.out.constants.push(value);
        self.out.constants.len() as u32 - 1
    }

    fn code_const(&mut self, ctx: &mut FrameCtx, index: usize) -> u32 {
        if let Some(i) = ctx.consts[index] {
            return i;
        }
        let i = self.add_const(Value::from_constant(&ctx.code.constants[index]));
        ctx.consts[index] = Some(i);
        i
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            insts: self.out.insts.len(),
            labels: self.out.labels.len(),
            deopts: self.out.deopts.len(),
            constants: self.out.constants.len(),
            inline_frames: self.out.inline_frames.len(),
            stats: self.out.inline_stats.clone(),
        }
    }

    fn restore(&mut self, snap: Snapshot) {
        self.out.insts.truncate(snap.insts);
        self.out.origins.truncate(snap.insts);
        self.out.labels.truncate(snap.labels);
        self.out.deopts.truncate(snap.deopts);
        self.out.constants.truncate(snap.constants);
        self.out.inline_frames.truncate(snap.inline_frames);
        self.out.inline_stats = snap.stats;
    }

    #[allow(clippy::too_many_arguments)]
    fn deopt(
        &mut self,
        ctx: &FrameCtx,
        state: &BlockState,
        offset: usize,
        depth: usize,
        reason: DeoptReason,
        action: DeoptAction,
        guilty: Option<VReg>,
    ) -> DeoptId {
        let mut frames = ctx.outer.clone();
        frames.push(ctx.frame_meta(offset as u32, state, depth));
        self.out.deopts.push(DeoptMetadata {
            frames,
            reason,
            action,
            description: ctx.describe(offset),
            guilty,
        });
        self.out.deopts.len() as DeoptId - 1
    }

    fn label_for(&mut self, ctx: &mut FrameCtx, offset: u32) -> Label {
        if let Some(&l) = ctx.labels.get(&offset) {
            return l;
        }
        let l = self.new_label();
        ctx.labels.insert(offset, l);
        l
    }

    /// Record an edge into `target`, scheduling the block if it is new.
    fn edge(&mut self, ctx: &mut FrameCtx, target: u32, state: &BlockState) -> CompileResult<Label> {
        match ctx.entry_states.get(&target) {
            Some(existing) if existing != state => {
                return Err(CompileError::NotJittable(format!(
                    "inconsistent stack representations at offset {} of {}",
                    target, ctx.code.qualname
                )));
            }
            Some(_) => {}
            None => {
                ctx.entry_states.insert(target, state.clone());
                ctx.worklist.insert(target);
            }
        }
        Ok(self.label_for(ctx, target))
    }

    fn lower_frame(&mut self, ctx: &mut FrameCtx) -> CompileResult<()> {
        let entry = BlockState {
            kinds: Vec::new(),
            blocks: Vec::new(),
        };
        self.edge(ctx, 0, &entry)?;
        while let Some(start) = ctx.worklist.pop_first() {
            self.lower_block(ctx, start)?;
        }
        Ok(())
    }

    fn lower_block(&mut self, ctx: &mut FrameCtx, start: u32) -> CompileResult<()> {
        let state = ctx.entry_states[&start].clone();
        let label = self.label_for(ctx, start);
        self.bind(label);
        let mut cur = Cursor {
            known: vec![None; state.kinds.len()],
            state,
        };
        let mut pc = start as usize;
        loop {
            if pc >= ctx.code.instructions.len() {
                return Err(CompileError::Internal(format!(
                    "control falls off the end of {}",
                    ctx.code.qualname
                )));
            }
            if pc != start as usize && ctx.leaders[pc] {
                let origin = Origin {
                    frame: ctx.id,
                    offset: pc as u32,
                };
                let target = self.edge(ctx, pc as u32, &cur.state)?;
                self.emit(origin, Inst::Jump { target });
                return Ok(());
            }
            let inst = ctx.code.instructions[pc];
            match self.lower_inst(ctx, &mut cur, pc, inst)? {
                Flow::Next => pc += 1,
                Flow::End => return Ok(()),
            }
        }
    }

    // =========================================================================
    // Instructions
    // =========================================================================

    fn lower_inst(
        &mut self,
        ctx: &mut FrameCtx,
        cur: &mut Cursor,
        pc: usize,
        inst: Instruction,
    ) -> CompileResult<Flow> {
        use Opcode::*;
        let origin = Origin {
            frame: ctx.id,
            offset: pc as u32,
        };
        let arg = inst.arg;
        let d = cur.depth();
        let not_jittable = |what: &str| {
            Err(CompileError::NotJittable(format!(
                "{} in {} at offset {}",
                what, ctx.code.qualname, pc
            )))
        };

        match inst.opcode {
            Nop => {}
            PopTop => {
                let dst = ctx.stack[d - 1];
                self.emit(origin, Inst::Clear { dst });
                self.emit(origin, Inst::Safepoint);
                cur.truncate(d - 1);
            }
            RotTwo => {
                let (a, b) = (ctx.stack[d - 2], ctx.stack[d - 1]);
                let tmp = ctx.tmp;
                self.emit(origin, Inst::Move { dst: tmp, src: b });
                self.emit(origin, Inst::Move { dst: b, src: a });
                self.emit(origin, Inst::Move { dst: a, src: tmp });
                self.emit(origin, Inst::Clear { dst: tmp });
                cur.state.kinds.swap(d - 2, d - 1);
                cur.known.swap(d - 2, d - 1);
            }
            RotThree => {
                let (a, b, c) = (ctx.stack[d - 3], ctx.stack[d - 2], ctx.stack[d - 1]);
                let tmp = ctx.tmp;
                self.emit(origin, Inst::Move { dst: tmp, src: c });
                self.emit(origin, Inst::Move { dst: c, src: b });
                self.emit(origin, Inst::Move { dst: b, src: a });
                self.emit(origin, Inst::Move { dst: a, src: tmp });
                self.emit(origin, Inst::Clear { dst: tmp });
                cur.state.kinds[d - 3..].rotate_right(1);
                cur.known[d - 3..].rotate_right(1);
            }
            DupTop => {
                let kind = cur.state.kinds[d - 1];
                let known = cur.known[d - 1];
                let i = cur.push(kind);
                cur.known[i] = known;
                self.emit(
                    origin,
                    Inst::Move {
                        dst: ctx.stack[i],
                        src: ctx.stack[d - 1],
                    },
                );
            }
            DupTopTwo => {
                for src in [d - 2, d - 1] {
                    let i = cur.push(cur.state.kinds[src]);
                    cur.known[i] = cur.known[src];
                    self.emit(
                        origin,
                        Inst::Move {
                            dst: ctx.stack[i],
                            src: ctx.stack[src],
                        },
                    );
                }
            }

            LoadConst => {
                let index = self.code_const(ctx, arg as usize);
                let i = cur.push(ValueKind::Boxed);
                self.emit(origin, Inst::LoadConst { dst: ctx.stack[i], index });
            }
            LoadFast => {
                let slot = arg as usize;
                if !ctx.is_bound(pc, slot) {
                    let deopt = self.deopt(
                        ctx,
                        &cur.state,
                        pc,
                        d,
                        DeoptReason::UnhandledUnboundLocal,
                        DeoptAction::ResumeInInterpreter,
                        None,
                    );
                    self.emit(
                        origin,
                        Inst::CheckBound {
                            src: ctx.locals[slot],
                            deopt,
                        },
                    );
                }
                let i = cur.push(ctx.local_kinds[slot]);
                self.emit(
                    origin,
                    Inst::Move {
                        dst: ctx.stack[i],
                        src: ctx.locals[slot],
                    },
                );
            }
            StoreFast => {
                let slot = arg as usize;
                if cur.state.kinds[d - 1] != ctx.local_kinds[slot] {
                    return not_jittable(&format!(
                        "store of {} value into {} local '{}'",
                        cur.state.kinds[d - 1],
                        ctx.local_kinds[slot],
                        ctx.code.varnames[slot]
                    ));
                }
                self.emit(
                    origin,
                    Inst::Move {
                        dst: ctx.locals[slot],
                        src: ctx.stack[d - 1],
                    },
                );
                self.emit(origin, Inst::Clear { dst: ctx.stack[d - 1] });
                self.emit(origin, Inst::Safepoint);
                cur.truncate(d - 1);
            }
            DeleteFast => {
                let slot = arg as usize;
                if !ctx.is_bound(pc, slot) {
                    let deopt = self.deopt(
                        ctx,
                        &cur.state,
                        pc,
                        d,
                        DeoptReason::UnhandledUnboundLocal,
                        DeoptAction::ResumeInInterpreter,
                        None,
                    );
                    self.emit(
                        origin,
                        Inst::CheckBound {
                            src: ctx.locals[slot],
                            deopt,
                        },
                    );
                }
                self.emit(
                    origin,
                    Inst::Clear {
                        dst: ctx.locals[slot],
                    },
                );
                self.emit(origin, Inst::Safepoint);
            }
            LoadGlobal => {
                let helper = Helper::LoadGlobal {
                    frame: ctx.id,
                    offset: pc as u32,
                    name: arg,
                };
                self.call_helper(ctx, cur, pc, helper, 0, 1)?;
                if let Some(callee) = ctx.preload.function(arg).cloned() {
                    let index = self.add_const(Value::Function(callee));
                    cur.known[d] = Some(index);
                }
            }
            StoreGlobal => {
                let helper = Helper::StoreGlobal {
                    frame: ctx.id,
                    name: arg,
                };
                self.call_helper(ctx, cur, pc, helper, 1, 0)?;
            }
            LoadName | StoreName => return not_jittable("dynamic name access"),

            LoadAttr => {
                let helper = Helper::LoadAttr {
                    frame: ctx.id,
                    offset: pc as u32,
                    name: arg,
                };
                self.call_helper(ctx, cur, pc, helper, 1, 1)?;
            }
            StoreAttr => {
                let helper = Helper::StoreAttr {
                    frame: ctx.id,
                    offset: pc as u32,
                    name: arg,
                };
                self.call_helper(ctx, cur, pc, helper, 2, 0)?;
            }
            DeleteAttr => {
                let helper = Helper::DeleteAttr {
                    frame: ctx.id,
                    name: arg,
                };
                self.call_helper(ctx, cur, pc, helper, 1, 0)?;
            }
            LoadMethod => {
                let helper = Helper::LoadMethod {
                    frame: ctx.id,
                    offset: pc as u32,
                    name: arg,
                };
                self.call_helper(ctx, cur, pc, helper, 1, 2)?;
            }

            CallMethod => {
                let n = arg as usize + 2;
                self.call_helper(ctx, cur, pc, Helper::CallMethod { argc: arg }, n, 1)?;
            }
            CallFunction => self.lower_call(ctx, cur, pc, arg as usize)?,
            InvokeNative => {
                let Some(Constant::Native(sig)) = ctx.code.constants.get(arg as usize) else {
                    return not_jittable("native call without a signature");
                };
                let sig = sig.clone();
                let n = sig.params.len();
                for (i, kind) in sig.params.iter().enumerate() {
                    if cur.state.kinds[d - n + i] != ValueKind::from_primitive(*kind) {
                        return not_jittable("native call argument representation mismatch");
                    }
                }
                let deopt = self.deopt(
                    ctx,
                    &cur.state,
                    pc,
                    d,
                    DeoptReason::UnhandledException,
                    DeoptAction::Unwind,
                    None,
                );
                let args: SmallVec<[VReg; 4]> = ctx.stack[d - n..d].iter().copied().collect();
                cur.truncate(d - n);
                let i = cur.push(ValueKind::from_primitive(sig.ret));
                self.emit(
                    origin,
                    Inst::Call {
                        helper: Helper::InvokeNative {
                            frame: ctx.id,
                            constant: arg,
                        },
                        dsts: smallvec![ctx.stack[i]],
                        args,
                        deopt,
                    },
                );
            }
            ReturnValue => {
                let kind = cur.state.kinds[d - 1];
                let src = ctx.stack[d - 1];
                match ctx.exit {
                    FrameExit::Return => {
                        let declared = ValueKind::from_local_type(ctx.code.return_type);
                        if kind != declared {
                            return not_jittable("return representation mismatch");
                        }
                        self.emit(origin, Inst::Return { src, kind });
                    }
                    FrameExit::Inline { result, cont } => {
                        if kind != ValueKind::Boxed {
                            return not_jittable("inlined return of an unboxed value");
                        }
                        self.emit(origin, Inst::Move { dst: result, src });
                        self.emit(origin, Inst::Clear { dst: src });
                        for &local in &ctx.locals {
                            self.emit(origin, Inst::Clear { dst: local });
                        }
                        self.emit(origin, Inst::EndInlined { frame: ctx.id });
                        self.emit(origin, Inst::Safepoint);
                        self.emit(origin, Inst::Jump { target: cont });
                    }
                }
                return Ok(Flow::End);
            }
            MakeFunction => {
                let with_defaults = arg & 1 != 0;
                let helper = Helper::MakeFunction {
                    frame: ctx.id,
                    with_defaults,
                };
                let n = if with_defaults { 2 } else { 1 };
                self.call_helper(ctx, cur, pc, helper, n, 1)?;
            }

            BinaryOp => {
                let Some(op) = inst.bin_op() else {
                    return not_jittable("unknown binary operator");
                };
                self.call_helper(ctx, cur, pc, Helper::BinaryOp(op), 2, 1)?;
            }
            CompareOp => {
                let Some(op) = inst.cmp_op() else {
                    return not_jittable("unknown comparison");
                };
                self.call_helper(ctx, cur, pc, Helper::Compare(op), 2, 1)?;
            }
            UnaryNot => self.call_helper(ctx, cur, pc, Helper::UnaryNot, 1, 1)?,
            UnaryNegative => self.call_helper(ctx, cur, pc, Helper::UnaryNegative, 1, 1)?,

            PrimitiveLoadConst => {
                let imm = match ctx.code.constants.get(arg as usize) {
                    Some(Constant::Int(v)) => Imm::I64(*v),
                    Some(Constant::Float(v)) => Imm::F64(*v),
                    Some(Constant::Bool(v)) => Imm::Bool(*v),
                    _ => return not_jittable("primitive constant of non-primitive type"),
                };
                let i = cur.push(imm.kind());
                self.emit(origin, Inst::LoadImm { dst: ctx.stack[i], imm });
            }
            PrimitiveBinaryOp => {
                let (Some(kind), Some(op)) = (inst.primitive_kind(), inst.bin_op()) else {
                    return not_jittable("malformed primitive operator");
                };
                if !primitive_op_supported(kind, op) {
                    return not_jittable(&format!("{} not defined on {}", op, kind.name()));
                }
                let vk = ValueKind::from_primitive(kind);
                if cur.top_kind(0) != Some(vk) || cur.top_kind(1) != Some(vk) {
                    return not_jittable("primitive operand representation mismatch");
                }
                let deopt = matches!(op, BinOp::TrueDiv | BinOp::FloorDiv | BinOp::Mod).then(|| {
                    self.deopt(
                        ctx,
                        &cur.state,
                        pc,
                        d,
                        DeoptReason::PrimitiveDivideByZero,
                        DeoptAction::ResumeInInterpreter,
                        None,
                    )
                });
                let (lhs, rhs) = (ctx.stack[d - 2], ctx.stack[d - 1]);
                cur.truncate(d - 2);
                let i = cur.push(vk);
                self.emit(
                    origin,
                    Inst::PrimBinary {
                        dst: ctx.stack[i],
                        lhs,
                        rhs,
                        kind,
                        op,
                        deopt,
                    },
                );
            }
            PrimitiveCompareOp => {
                let (Some(kind), Some(op)) = (inst.primitive_kind(), inst.cmp_op()) else {
                    return not_jittable("malformed primitive comparison");
                };
                if !op.is_ordering() {
                    return not_jittable("non-ordering primitive comparison");
                }
                let vk = ValueKind::from_primitive(kind);
                if cur.top_kind(0) != Some(vk) || cur.top_kind(1) != Some(vk) {
                    return not_jittable("primitive operand representation mismatch");
                }
                let (lhs, rhs) = (ctx.stack[d - 2], ctx.stack[d - 1]);
                cur.truncate(d - 2);
                let i = cur.push(ValueKind::Bool);
                self.emit(
                    origin,
                    Inst::PrimCompare {
                        dst: ctx.stack[i],
                        lhs,
                        rhs,
                        kind,
                        op,
                    },
                );
            }
            PrimitiveBox => {
                let Some(kind) = inst.primitive_kind() else {
                    return not_jittable("malformed primitive box");
                };
                match cur.state.kinds[d - 1] {
                    ValueKind::Boxed => {}
                    k if k == ValueKind::from_primitive(kind) => {
                        let r = ctx.stack[d - 1];
                        self.emit(origin, Inst::Box { dst: r, src: r, kind });
                        cur.state.kinds[d - 1] = ValueKind::Boxed;
                    }
                    _ => return not_jittable("box of mismatched primitive"),
                }
            }
            PrimitiveUnbox => {
                let Some(kind) = inst.primitive_kind() else {
                    return not_jittable("malformed primitive unbox");
                };
                let target = ValueKind::from_primitive(kind);
                match cur.state.kinds[d - 1] {
                    k if k == target => {}
                    ValueKind::Boxed => {
                        let r = ctx.stack[d - 1];
                        let deopt = self.deopt(
                            ctx,
                            &cur.state,
                            pc,
                            d,
                            DeoptReason::PrimitiveUnboxFailed,
                            DeoptAction::ResumeInInterpreter,
                            Some(r),
                        );
                        self.emit(
                            origin,
                            Inst::Unbox {
                                dst: r,
                                src: r,
                                kind,
                                deopt,
                            },
                        );
                        cur.state.kinds[d - 1] = target;
                        cur.known[d - 1] = None;
                    }
                    _ => return not_jittable("unbox of mismatched primitive"),
                }
            }

            Jump => {
                let target = self.edge(ctx, arg, &cur.state)?;
                self.emit(origin, Inst::Jump { target });
                return Ok(Flow::End);
            }
            PopJumpIfFalse | PopJumpIfTrue => {
                let jump_if = inst.opcode == PopJumpIfTrue;
                let cond = ctx.stack[d - 1];
                let kind = cur.state.kinds[d - 1];
                let branch = match kind {
                    ValueKind::Bool => None,
                    ValueKind::Boxed => Some(self.deopt(
                        ctx,
                        &cur.state,
                        pc,
                        d,
                        DeoptReason::UnhandledException,
                        DeoptAction::Unwind,
                        None,
                    )),
                    _ => return not_jittable("branch on a numeric primitive"),
                };
                cur.truncate(d - 1);
                let target = self.edge(ctx, arg, &cur.state)?;
                let inst = match branch {
                    None => Inst::BranchBool {
                        cond,
                        target,
                        jump_if,
                    },
                    Some(deopt) => Inst::BranchTruthy {
                        cond,
                        target,
                        jump_if,
                        deopt,
                    },
                };
                self.emit(origin, inst);
            }
            GetIter => self.call_helper(ctx, cur, pc, Helper::GetIter, 1, 1)?,
            ForIter => {
                if cur.top_kind(0) != Some(ValueKind::Boxed) {
                    return not_jittable("iteration over an unboxed value");
                }
                let deopt = self.deopt(
                    ctx,
                    &cur.state,
                    pc,
                    d,
                    DeoptReason::UnhandledException,
                    DeoptAction::Unwind,
                    None,
                );
                let iter = ctx.stack[d - 1];
                let mut exit_state = cur.state.clone();
                exit_state.kinds.truncate(d - 1);
                let target = self.edge(ctx, arg, &exit_state)?;
                let exhausted = self.new_label();
                let i = cur.push(ValueKind::Boxed);
                self.emit(
                    origin,
                    Inst::ForIter {
                        iter,
                        dst: ctx.stack[i],
                        exhausted,
                        deopt,
                    },
                );
                // The exhausted path pops the iterator before joining.
                let skip = self.new_label();
                self.emit(origin, Inst::Jump { target: skip });
                self.bind(exhausted);
                self.emit(origin, Inst::Clear { dst: iter });
                self.emit(origin, Inst::Jump { target });
                self.bind(skip);
            }

            BuildTuple => self.call_helper(ctx, cur, pc, Helper::BuildTuple, arg as usize, 1)?,
            BuildList => self.call_helper(ctx, cur, pc, Helper::BuildList, arg as usize, 1)?,
            BuildMap => self.call_helper(ctx, cur, pc, Helper::BuildMap, 2 * arg as usize, 1)?,
            BinarySubscr => self.call_helper(ctx, cur, pc, Helper::BinarySubscr, 2, 1)?,
            StoreSubscr => self.call_helper(ctx, cur, pc, Helper::StoreSubscr, 3, 0)?,
            UnpackSequence => {
                let helper = Helper::UnpackSequence { count: arg };
                self.call_helper(ctx, cur, pc, helper, 1, arg as usize)?;
            }

            SetupFinally => cur.state.blocks.push(BlockSpec {
                handler: arg,
                level: d as u32,
            }),
            PopBlock => {
                if cur.state.blocks.pop().is_none() {
                    return not_jittable("PopBlock without a handler block");
                }
            }
            PopExcept | JumpIfNotExcMatch => {
                return not_jittable("exception-handler opcode on the normal path")
            }
            Raise | Reraise => {
                let reason = if inst.opcode == Raise && arg != 0 {
                    DeoptReason::Raise
                } else {
                    DeoptReason::Reraise
                };
                let deopt = self.deopt(
                    ctx,
                    &cur.state,
                    pc,
                    d,
                    reason,
                    DeoptAction::ResumeInInterpreter,
                    None,
                );
                self.emit(origin, Inst::Deopt { deopt });
                return Ok(Flow::End);
            }

            YieldValue => {
                if cur.top_kind(0) != Some(ValueKind::Boxed) {
                    return not_jittable("yield of an unboxed value");
                }
                let point = self.deopt(
                    ctx,
                    &cur.state,
                    pc,
                    d - 1,
                    DeoptReason::Forced,
                    DeoptAction::ResumeInInterpreter,
                    None,
                );
                let r = ctx.stack[d - 1];
                self.emit(
                    origin,
                    Inst::Yield {
                        value: r,
                        dst: r,
                        point,
                    },
                );
                cur.known[d - 1] = None;
            }
            GetYieldFromIter => self.call_helper(ctx, cur, pc, Helper::GetYieldFromIter, 1, 1)?,
            GetAwaitable => self.call_helper(ctx, cur, pc, Helper::GetAwaitable, 1, 1)?,
            YieldFrom => {
                if cur.top_kind(0) != Some(ValueKind::Boxed)
                    || cur.top_kind(1) != Some(ValueKind::Boxed)
                {
                    return not_jittable("delegation with an unboxed value");
                }
                let point = self.deopt(
                    ctx,
                    &cur.state,
                    pc,
                    d - 1,
                    DeoptReason::YieldFrom,
                    DeoptAction::ResumeInInterpreter,
                    None,
                );
                let deopt = self.deopt(
                    ctx,
                    &cur.state,
                    pc,
                    d,
                    DeoptReason::UnhandledException,
                    DeoptAction::Unwind,
                    None,
                );
                let (iter, value) = (ctx.stack[d - 2], ctx.stack[d - 1]);
                cur.truncate(d - 1);
                cur.known[d - 2] = None;
                self.emit(
                    origin,
                    Inst::YieldFrom {
                        iter,
                        value,
                        dst: iter,
                        point,
                        deopt,
                    },
                );
            }

            GetLen => self.call_helper_keep(ctx, cur, pc, Helper::GetLen)?,
            MatchSequence => self.call_helper_keep(ctx, cur, pc, Helper::MatchSequence)?,
            MatchMapping => self.call_helper_keep(ctx, cur, pc, Helper::MatchMapping)?,
            MatchClass => {
                let helper = Helper::MatchClass { count: arg };
                self.call_helper(ctx, cur, pc, helper, 2, 1)?;
            }
        }

        if inst.opcode.is_terminator() {
            return Ok(Flow::End);
        }
        Ok(Flow::Next)
    }

    /// Emit a helper call consuming the top `nargs` boxed slots and pushing
    /// `nresults` boxed results.
    fn call_helper(
        &mut self,
        ctx: &mut FrameCtx,
        cur: &mut Cursor,
        pc: usize,
        helper: Helper,
        nargs: usize,
        nresults: usize,
    ) -> CompileResult<()> {
        let d = cur.depth();
        if nargs > d {
            return Err(CompileError::Internal(format!(
                "stack underflow lowering {}",
                ctx.describe(pc)
            )));
        }
        if cur.state.kinds[d - nargs..].iter().any(|k| *k != ValueKind::Boxed) {
            return Err(CompileError::NotJittable(format!(
                "unboxed operand to {} in {}",
                ctx.describe(pc),
                ctx.code.qualname
            )));
        }
        let deopt = self.deopt(
            ctx,
            &cur.state,
            pc,
            d,
            DeoptReason::UnhandledException,
            DeoptAction::Unwind,
            None,
        );
        let args = ctx.stack[d - nargs..d].iter().copied().collect();
        cur.truncate(d - nargs);
        let mut dsts = SmallVec::new();
        for _ in 0..nresults {
            let i = cur.push(ValueKind::Boxed);
            dsts.push(ctx.stack[i]);
        }
        let origin = Origin {
            frame: ctx.id,
            offset: pc as u32,
        };
        self.emit(
            origin,
            Inst::Call {
                helper,
                dsts,
                args,
                deopt,
            },
        );
        for &dead in &ctx.stack[d - nargs + nresults.min(nargs)..d] {
            self.emit(origin, Inst::Clear { dst: dead });
        }
        Ok(())
    }

    /// Helper reading TOS and pushing one result above it.
    fn call_helper_keep(
        &mut self,
        ctx: &mut FrameCtx,
        cur: &mut Cursor,
        pc: usize,
        helper: Helper,
    ) -> CompileResult<()> {
        let d = cur.depth();
        if cur.top_kind(0) != Some(ValueKind::Boxed) {
            return Err(CompileError::NotJittable(format!(
                "unboxed operand to {} in {}",
                ctx.describe(pc),
                ctx.code.qualname
            )));
        }
        let deopt = self.deopt(
            ctx,
            &cur.state,
            pc,
            d,
            DeoptReason::UnhandledException,
            DeoptAction::Unwind,
            None,
        );
        let src = ctx.stack[d - 1];
        let i = cur.push(ValueKind::Boxed);
        let origin = Origin {
            frame: ctx.id,
            offset: pc as u32,
        };
        self.emit(
            origin,
            Inst::Call {
                helper,
                dsts: smallvec![ctx.stack[i]],
                args: smallvec![src],
                deopt,
            },
        );
        Ok(())
    }

    // =========================================================================
    // Calls and Inlining
    // =========================================================================

    fn lower_call(
        &mut self,
        ctx: &mut FrameCtx,
        cur: &mut Cursor,
        pc: usize,
        argc: usize,
    ) -> CompileResult<()> {
        let d = cur.depth();
        let base = d - argc - 1;
        let known = cur.known[base].and_then(|index| match &self.out.constants[index as usize] {
            Value::Function(f) => Some((index, f.clone())),
            _ => None,
        });
        let Some((index, callee)) = known else {
            return self.call_helper(ctx, cur, pc, Helper::Call { argc: argc as u32 }, argc + 1, 1);
        };

        if self.config.inliner {
            let chain = self.inline_chain(ctx);
            match can_inline(&callee, argc, &chain, ctx.depth + 1, self.config.max_inline_depth) {
                Ok(()) => {
                    let snap = self.snapshot();
                    match self.inline_call(ctx, cur, pc, argc, index, &callee) {
                        Ok(()) => return Ok(()),
                        Err(CompileError::NotJittable(reason)) => {
                            tracing::debug!(
                                callee = %callee.full_name(),
                                %reason,
                                "inlining abandoned"
                            );
                            self.restore(snap);
                            self.out
                                .inline_stats
                                .record_failure(InlineFailureType::NotJittable, &callee);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(reason) => self.out.inline_stats.record_failure(reason, &callee),
            }
        }

        if callee.frame_mode() == FrameMode::Shadow && callee.native().is_none() {
            self.guard_callee(ctx, cur, pc, base, index);
            return self.call_helper(
                ctx,
                cur,
                pc,
                Helper::CallStatic { argc: argc as u32 },
                argc + 1,
                1,
            );
        }
        self.call_helper(ctx, cur, pc, Helper::Call { argc: argc as u32 }, argc + 1, 1)
    }

    fn guard_callee(&mut self, ctx: &FrameCtx, cur: &Cursor, pc: usize, base: usize, index: u32) {
        let src = ctx.stack[base];
        let deopt = self.deopt(
            ctx,
            &cur.state,
            pc,
            cur.depth(),
            DeoptReason::GuardFailure,
            DeoptAction::ResumeInInterpreter,
            Some(src),
        );
        let origin = Origin {
            frame: ctx.id,
            offset: pc as u32,
        };
        self.emit(origin, Inst::GuardIs { src, index, deopt });
    }

    /// Code ids of `ctx` and every frame enclosing it.
    fn inline_chain(&self, ctx: &FrameCtx) -> Vec<u64> {
        let mut chain = Vec::new();
        let mut frame = Some(ctx.id);
        while let Some(id) = frame {
            let f = &self.out.inline_frames[id as usize];
            chain.push(f.code.id);
            frame = f.parent;
        }
        chain
    }

    fn inline_call(
        &mut self,
        ctx: &mut FrameCtx,
        cur: &mut Cursor,
        pc: usize,
        argc: usize,
        index: u32,
        callee: &Arc<FunctionObject>,
    ) -> CompileResult<()> {
        let d = cur.depth();
        let base = d - argc - 1;
        if cur.state.kinds[base..].iter().any(|k| *k != ValueKind::Boxed) {
            return Err(CompileError::NotJittable("unboxed call argument".into()));
        }
        let origin = Origin {
            frame: ctx.id,
            offset: pc as u32,
        };
        self.guard_callee(ctx, cur, pc, base, index);

        let id = FrameId::try_from(self.out.inline_frames.len())
            .map_err(|_| CompileError::NotJittable("too many inline frames".into()))?;
        self.out.inline_frames.push(InlineFrame {
            code: callee.code.clone(),
            func: callee.clone(),
            parent: Some(ctx.id),
            call_offset: pc as u32,
        });

        let mut outer = ctx.outer.clone();
        outer.push(ctx.frame_meta(pc as u32, &cur.state, base));
        let result = ctx.stack[base];
        let cont = self.new_label();
        let mut callee_ctx = FrameCtx::new(
            self,
            id,
            callee.clone(),
            outer,
            ctx.depth + 1,
            FrameExit::Inline { result, cont },
        )?;

        self.emit(origin, Inst::BeginInlined { frame: id });
        let callee_origin = Origin { frame: id, offset: 0 };
        for slot in 0..callee_ctx.locals.len() {
            let dst = callee_ctx.locals[slot];
            let inst = if slot < argc {
                Inst::Move {
                    dst,
                    src: ctx.stack[base + 1 + slot],
                }
            } else {
                Inst::Clear { dst }
            };
            self.emit(callee_origin, inst);
        }
        for &arg in &ctx.stack[base + 1..d] {
            self.emit(callee_origin, Inst::Clear { dst: arg });
        }
        self.lower_frame(&mut callee_ctx)?;
        self.bind(cont);

        cur.truncate(base);
        cur.push(ValueKind::Boxed);
        self.out.inline_stats.num_inlined += 1;
        tracing::debug!(
            caller = %ctx.func.full_name(),
            callee = %callee.full_name(),
            "inlined call"
        );
        Ok(())
    }
}

// =============================================================================
// Analyses
// =============================================================================

/// Primitive operators defined on each kind.
fn primitive_op_supported(kind: PrimitiveKind, op: BinOp) -> bool {
    match kind {
        PrimitiveKind::Int64 => true,
        PrimitiveKind::Float64 => matches!(
            op,
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::TrueDiv | BinOp::FloorDiv | BinOp::Mod
        ),
        PrimitiveKind::Bool => matches!(op, BinOp::And | BinOp::Or | BinOp::Xor),
    }
}

/// Normal-path successors of the instruction at `pc`.
fn successors(pc: usize, inst: Instruction) -> SmallVec<[usize; 2]> {
    use Opcode::*;
    match inst.opcode {
        Jump => smallvec![inst.arg as usize],
        ReturnValue | Raise | Reraise => SmallVec::new(),
        PopJumpIfFalse | PopJumpIfTrue | ForIter | JumpIfNotExcMatch => {
            smallvec![pc + 1, inst.arg as usize]
        }
        _ => smallvec![pc + 1],
    }
}

/// Offsets that start a basic block.
fn find_leaders(code: &CodeObject) -> Vec<bool> {
    let n = code.instructions.len();
    let mut leaders = vec![false; n + 1];
    if n > 0 {
        leaders[0] = true;
    }
    for (pc, inst) in code.instructions.iter().enumerate() {
        if inst.opcode.has_jump_target() && inst.opcode != Opcode::SetupFinally {
            if let Some(l) = leaders.get_mut(inst.arg as usize) {
                *l = true;
            }
            leaders[pc + 1] = true;
        } else if inst.opcode.is_terminator() {
            leaders[pc + 1] = true;
        }
    }
    leaders.truncate(n);
    leaders
}

/// For each reachable offset, which locals are bound on every path to it.
fn definite_assignment(code: &CodeObject) -> Vec<Option<Vec<bool>>> {
    let n = code.instructions.len();
    let nlocals = code.nlocals();
    let mut bound: Vec<Option<Vec<bool>>> = vec![None; n];
    if n == 0 {
        return bound;
    }
    let nparams = code.param_slots().min(nlocals);
    bound[0] = Some((0..nlocals).map(|slot| slot < nparams).collect());
    let mut worklist = vec![0usize];

    while let Some(pc) = worklist.pop() {
        let Some(mut state) = bound[pc].clone() else {
            continue;
        };
        let inst = code.instructions[pc];
        match inst.opcode {
            Opcode::StoreFast => state[inst.arg as usize] = true,
            Opcode::DeleteFast => state[inst.arg as usize] = false,
            _ => {}
        }
        for succ in successors(pc, inst) {
            if succ >= n {
                continue;
            }
            match &mut bound[succ] {
                slot @ None => {
                    *slot = Some(state.clone());
                    worklist.push(succ);
                }
                Some(existing) => {
                    let mut changed = false;
                    for (e, s) in existing.iter_mut().zip(&state) {
                        if *e && !*s {
                            *e = false;
                            changed = true;
                        }
                    }
                    if changed {
                        worklist.push(succ);
                    }
                }
            }
        }
    }
    bound
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_bytecode::{CmpOp, FunctionBuilder, LocalType};
    use ember_runtime::DictObject;

    fn make(globals: &Arc<DictObject>, build: impl FnOnce(&mut FunctionBuilder)) -> Arc<FunctionObject> {
        let mut b = FunctionBuilder::new("f");
        build(&mut b);
        let code = Arc::new(b.finish().unwrap());
        Arc::new(FunctionObject::new(code, globals.clone(), Arc::new(DictObject::new())))
    }

    fn count(lir: &LirFunction, pred: impl Fn(&LirInst) -> bool) -> usize {
        lir.insts.iter().filter(|i| pred(i)).count()
    }

    #[test]
    fn test_lower_add() {
        let globals = Arc::new(DictObject::new());
        let f = make(&globals, |b| {
            b.set_params(&["x", "y"]);
            b.load_fast("x");
            b.load_fast("y");
            b.binary(BinOp::Add);
            b.return_value();
        });
        let lir = lower(&f, &LowerConfig::default()).unwrap();
        assert_eq!(lir.params.len(), 2);
        assert_eq!(count(&lir, |i| matches!(i, Inst::CheckBound { .. })), 0);
        assert_eq!(count(&lir, |i| matches!(i, Inst::Call { helper: Helper::BinaryOp(BinOp::Add), .. })), 1);
        assert!(matches!(lir.insts.last(), Some(Inst::Return { kind: ValueKind::Boxed, .. })));
        assert_eq!(lir.origins.len(), lir.insts.len());
    }

    #[test]
    fn test_maybe_unbound_local_is_checked() {
        let globals = Arc::new(DictObject::new());
        let f = make(&globals, |b| {
            b.set_params(&["flag"]);
            let skip = b.new_label();
            b.load_fast("flag");
            b.emit_jump(Opcode::PopJumpIfFalse, skip);
            b.load_int(1);
            b.store_fast("x");
            b.bind_label(skip);
            b.load_fast("x");
            b.return_value();
        });
        let lir = lower(&f, &LowerConfig::default()).unwrap();
        assert_eq!(count(&lir, |i| matches!(i, Inst::CheckBound { .. })), 1);
        let meta = lir
            .deopts
            .iter()
            .find(|m| m.reason == DeoptReason::UnhandledUnboundLocal)
            .unwrap();
        assert_eq!(meta.action, DeoptAction::ResumeInInterpreter);
        assert_eq!(meta.frames.len(), 1);
    }

    #[test]
    fn test_load_name_is_not_jittable() {
        let globals = Arc::new(DictObject::new());
        let f = make(&globals, |b| {
            let n = b.add_name("x");
            b.emit(Opcode::LoadName, n);
            b.return_value();
        });
        assert!(matches!(
            lower(&f, &LowerConfig::default()),
            Err(CompileError::NotJittable(_))
        ));
    }

    #[test]
    fn test_redundant_unbox_is_elided() {
        let globals = Arc::new(DictObject::new());
        let f = make(&globals, |b| {
            b.set_params(&["n"]);
            b.set_local_type("n", LocalType::Primitive(PrimitiveKind::Int64));
            b.set_return_type(LocalType::Primitive(PrimitiveKind::Int64));
            b.load_fast("n");
            b.primitive_unbox(PrimitiveKind::Int64);
            b.primitive_const(Constant::Int(1));
            b.primitive_binary(PrimitiveKind::Int64, BinOp::Add);
            b.return_value();
        });
        let lir = lower(&f, &LowerConfig::default()).unwrap();
        assert_eq!(count(&lir, |i| matches!(i, Inst::Unbox { .. })), 0);
        assert_eq!(count(&lir, |i| matches!(i, Inst::PrimBinary { deopt: None, .. })), 1);
        assert_eq!(lir.params[0].1, ValueKind::I64);
    }

    #[test]
    fn test_inconsistent_merge_is_refused() {
        let globals = Arc::new(DictObject::new());
        let f = make(&globals, |b| {
            b.set_params(&["flag"]);
            let other = b.new_label();
            let join = b.new_label();
            b.load_fast("flag");
            b.emit_jump(Opcode::PopJumpIfFalse, other);
            b.primitive_const(Constant::Int(1));
            b.emit_jump(Opcode::Jump, join);
            b.bind_label(other);
            b.load_int(1);
            b.bind_label(join);
            b.primitive_box(PrimitiveKind::Int64);
            b.return_value();
        });
        let err = lower(&f, &LowerConfig::default()).unwrap_err();
        assert!(err.to_string().contains("inconsistent stack representations"));
    }

    #[test]
    fn test_inline_known_callee() {
        let globals = Arc::new(DictObject::new());
        let g = make(&globals, |b| {
            b.set_params(&["a", "b"]);
            b.load_fast("a");
            b.load_fast("b");
            b.binary(BinOp::Add);
            b.return_value();
        });
        globals.set_str("g", Value::Function(g.clone()));
        let f = make(&globals, |b| {
            b.load_global("g");
            b.load_int(2);
            b.load_int(3);
            b.call(2);
            b.return_value();
        });

        let lir = lower(&f, &LowerConfig::default()).unwrap();
        assert_eq!(lir.inline_stats.num_inlined, 1);
        assert_eq!(lir.inline_frames.len(), 2);
        assert_eq!(lir.inline_frames[1].call_offset, 3);
        assert_eq!(count(&lir, |i| matches!(i, Inst::GuardIs { .. })), 1);
        assert_eq!(count(&lir, |i| matches!(i, Inst::BeginInlined { frame: 1 })), 1);
        assert_eq!(count(&lir, |i| matches!(i, Inst::EndInlined { frame: 1 })), 1);

        // A failure inside the callee rebuilds both frames.
        let add = lir
            .insts
            .iter()
            .position(|i| matches!(i, Inst::Call { helper: Helper::BinaryOp(_), .. }))
            .unwrap();
        let meta = &lir.deopts[lir.insts[add].deopt_ids()[0] as usize];
        assert_eq!(meta.frames.len(), 2);
        assert_eq!(meta.frames[0].offset, 3);
        assert!(meta.frames[0].stack.is_empty());
        assert_eq!(meta.frames[1].inline_frame, 1);
        assert_eq!(lir.origins[add], Origin { frame: 1, offset: 2 });

        let no_inline = LowerConfig {
            inliner: false,
            ..LowerConfig::default()
        };
        let lir = lower(&f, &no_inline).unwrap();
        assert_eq!(lir.inline_stats.num_inlined, 0);
        assert_eq!(count(&lir, |i| matches!(i, Inst::Call { helper: Helper::Call { argc: 2 }, .. })), 1);
    }

    #[test]
    fn test_inline_failure_is_recorded() {
        let globals = Arc::new(DictObject::new());
        let g = make(&globals, |b| {
            b.set_params(&["a"]);
            b.set_varargs("rest");
            b.return_none();
        });
        globals.set_str("g", Value::Function(g));
        let f = make(&globals, |b| {
            b.load_global("g");
            b.load_int(1);
            b.call(1);
            b.return_value();
        });
        let lir = lower(&f, &LowerConfig::default()).unwrap();
        assert_eq!(lir.inline_stats.num_inlined, 0);
        assert!(lir.inline_stats.failures[&InlineFailureType::HasVarargs].contains("__main__:f"));
    }

    #[test]
    fn test_releases_are_followed_by_safepoints() {
        let globals = Arc::new(DictObject::new());
        let f = make(&globals, |b| {
            b.load_global("C");
            b.call(0);
            b.store_fast("o");
            b.delete_fast("o");
            b.load_none();
            b.pop_top();
            b.return_none();
        });
        let lir = lower(&f, &LowerConfig::default()).unwrap();
        assert_eq!(count(&lir, |i| matches!(i, Inst::Safepoint)), 3);

        // The stored temporary does not keep the object alive.
        let store = lir
            .insts
            .iter()
            .position(|i| matches!(i, Inst::Move { .. }))
            .unwrap();
        let Inst::Move { src, .. } = &lir.insts[store] else { unreachable!() };
        assert!(matches!(&lir.insts[store + 1], Inst::Clear { dst } if dst == src));
        assert!(matches!(lir.insts[store + 2], Inst::Safepoint));
    }

    #[test]
    fn test_primitive_compare_branch() {
        let globals = Arc::new(DictObject::new());
        let f = make(&globals, |b| {
            b.set_params(&["n"]);
            b.set_local_type("n", LocalType::Primitive(PrimitiveKind::Int64));
            let neg = b.new_label();
            b.load_fast("n");
            b.primitive_const(Constant::Int(0));
            b.primitive_compare(PrimitiveKind::Int64, CmpOp::Lt);
            b.emit_jump(Opcode::PopJumpIfTrue, neg);
            b.load_int(1);
            b.return_value();
            b.bind_label(neg);
            b.load_int(-1);
            b.return_value();
        });
        let lir = lower(&f, &LowerConfig::default()).unwrap();
        assert_eq!(count(&lir, |i| matches!(i, Inst::BranchBool { jump_if: true, .. })), 1);
        assert_eq!(count(&lir, |i| matches!(i, Inst::Return { .. })), 2);
    }
}
