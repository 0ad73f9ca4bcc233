//! Deoptimization metadata.
//!
//! Every point where compiled code may hand control back to the interpreter
//! carries a [`DeoptMetadata`] record describing how to rebuild the
//! interpreter's view of each active (possibly inlined) frame:
//!
//! ```text
//! DeoptMetadata
//! ├── reason / action / description
//! ├── guilty: location of the value that failed a guard
//! └── frames (outermost first)
//!     ├── FrameMeta { inline_frame: 0, offset: call site, locals, stack, blocks }
//!     └── FrameMeta { inline_frame: 2, offset: failing insn, locals, stack, blocks }
//! ```
//!
//! Values are recorded as a location plus a [`ValueKind`] so unboxed
//! primitives are reboxed on the way out.

use crate::lir::FrameId;
use crate::regalloc::Loc;
use ember_bytecode::{CodeObject, LocalType, PrimitiveKind};
use ember_runtime::FunctionObject;
use std::fmt;
use std::sync::Arc;

/// Index into a unit's deopt table.
pub type DeoptId = u32;

// =============================================================================
// Value Kind
// =============================================================================

/// Representation of a live value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueKind {
    /// Object reference.
    Boxed = 0,
    I64 = 1,
    F64 = 2,
    Bool = 3,
}

impl ValueKind {
    /// Representation of a primitive kind.
    #[inline]
    pub const fn from_primitive(kind: PrimitiveKind) -> Self {
        match kind {
            PrimitiveKind::Int64 => ValueKind::I64,
            PrimitiveKind::Float64 => ValueKind::F64,
            PrimitiveKind::Bool => ValueKind::Bool,
        }
    }

    /// Representation of a declared local type.
    #[inline]
    pub const fn from_local_type(ty: LocalType) -> Self {
        match ty {
            LocalType::Object => ValueKind::Boxed,
            LocalType::Primitive(kind) => Self::from_primitive(kind),
        }
    }

    /// Primitive kind, if unboxed.
    #[inline]
    pub const fn primitive(self) -> Option<PrimitiveKind> {
        match self {
            ValueKind::Boxed => None,
            ValueKind::I64 => Some(PrimitiveKind::Int64),
            ValueKind::F64 => Some(PrimitiveKind::Float64),
            ValueKind::Bool => Some(PrimitiveKind::Bool),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueKind::Boxed => "obj",
            ValueKind::I64 => "i64",
            ValueKind::F64 => "f64",
            ValueKind::Bool => "bool",
        })
    }
}

// =============================================================================
// Reason and Action
// =============================================================================

/// Why compiled code deoptimized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeoptReason {
    /// A speculative guard failed.
    GuardFailure = 0,
    /// Explicit `raise`.
    Raise = 1,
    /// Re-raise of the handled exception.
    Reraise = 2,
    /// A runtime helper raised.
    UnhandledException = 3,
    /// A local was read before assignment.
    UnhandledUnboundLocal = 4,
    /// Primitive division or modulo by zero.
    PrimitiveDivideByZero = 5,
    /// A boxed value did not unbox to the declared primitive kind.
    PrimitiveUnboxFailed = 6,
    /// A suspended generator was deoptimized while delegating.
    YieldFrom = 7,
    /// Deoptimization was requested explicitly.
    Forced = 8,
}

impl DeoptReason {
    /// Convert from raw u8 value.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DeoptReason::GuardFailure),
            1 => Some(DeoptReason::Raise),
            2 => Some(DeoptReason::Reraise),
            3 => Some(DeoptReason::UnhandledException),
            4 => Some(DeoptReason::UnhandledUnboundLocal),
            5 => Some(DeoptReason::PrimitiveDivideByZero),
            6 => Some(DeoptReason::PrimitiveUnboxFailed),
            7 => Some(DeoptReason::YieldFrom),
            8 => Some(DeoptReason::Forced),
            _ => None,
        }
    }

    /// Stable name used in runtime statistics.
    pub const fn name(self) -> &'static str {
        match self {
            DeoptReason::GuardFailure => "GuardFailure",
            DeoptReason::Raise => "Raise",
            DeoptReason::Reraise => "Reraise",
            DeoptReason::UnhandledException => "UnhandledException",
            DeoptReason::UnhandledUnboundLocal => "UnhandledUnboundLocal",
            DeoptReason::PrimitiveDivideByZero => "PrimitiveDivideByZero",
            DeoptReason::PrimitiveUnboxFailed => "PrimitiveUnboxFailed",
            DeoptReason::YieldFrom => "YieldFrom",
            DeoptReason::Forced => "Forced",
        }
    }
}

impl fmt::Display for DeoptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the interpreter does after reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeoptAction {
    /// Re-execute the instruction at the recorded offset.
    ResumeInInterpreter,
    /// Raise the pending exception at the recorded offset and unwind.
    Unwind,
}

// =============================================================================
// Frame Layout
// =============================================================================

/// A live value: where it lives and how it is represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveValue<L> {
    pub loc: L,
    pub kind: ValueKind,
}

/// An entry of the interpreter's block stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpec {
    /// Handler offset.
    pub handler: u32,
    /// Stack depth to unwind to.
    pub level: u32,
}

/// Interpreter state of one frame at a deopt point.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMeta<L> {
    /// Inline frame the state belongs to.
    pub inline_frame: FrameId,
    /// Bytecode offset. For every frame but the innermost this is the call
    /// site of the next frame.
    pub offset: u32,
    /// Every local slot, in slot order. An empty location is unbound.
    pub locals: Vec<LiveValue<L>>,
    /// Evaluation stack, bottom first.
    pub stack: Vec<LiveValue<L>>,
    /// Active handler blocks, outermost first.
    pub blocks: Vec<BlockSpec>,
}

/// Everything needed to leave compiled code at one point.
#[derive(Debug, Clone, PartialEq)]
pub struct DeoptMetadata<L = Loc> {
    /// Frames, outermost first.
    pub frames: Vec<FrameMeta<L>>,
    pub reason: DeoptReason,
    pub action: DeoptAction,
    /// Human-readable description of the failing operation.
    pub description: String,
    /// Value whose type caused the deopt.
    pub guilty: Option<L>,
}

impl<L: Copy> DeoptMetadata<L> {
    /// Rewrite every location.
    pub fn map<L2>(&self, mut f: impl FnMut(L) -> L2) -> DeoptMetadata<L2> {
        let mut frames = Vec::with_capacity(self.frames.len());
        for fm in &self.frames {
            let mut convert = |vals: &[LiveValue<L>]| -> Vec<LiveValue<L2>> {
                vals.iter()
                    .map(|v| LiveValue {
                        loc: f(v.loc),
                        kind: v.kind,
                    })
                    .collect()
            };
            let locals = convert(&fm.locals);
            let stack = convert(&fm.stack);
            frames.push(FrameMeta {
                inline_frame: fm.inline_frame,
                offset: fm.offset,
                locals,
                stack,
                blocks: fm.blocks.clone(),
            });
        }
        DeoptMetadata {
            frames,
            reason: self.reason,
            action: self.action,
            description: self.description.clone(),
            guilty: self.guilty.map(f),
        }
    }

    /// Visit every location read by reconstruction.
    pub fn for_each_loc(&self, mut f: impl FnMut(L)) {
        for fm in &self.frames {
            for v in fm.locals.iter().chain(&fm.stack) {
                f(v.loc);
            }
        }
        if let Some(g) = self.guilty {
            f(g);
        }
    }

    /// The frame that was executing.
    #[inline]
    pub fn innermost(&self) -> Option<&FrameMeta<L>> {
        self.frames.last()
    }
}

// =============================================================================
// Inline Frames
// =============================================================================

/// A function body that was lowered into a unit.
#[derive(Debug, Clone)]
pub struct InlineFrame {
    pub code: Arc<CodeObject>,
    pub func: Arc<FunctionObject>,
    /// Calling frame; `None` for the unit's own function.
    pub parent: Option<FrameId>,
    /// Offset of the call instruction in the parent.
    pub call_offset: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_roundtrip() {
        for raw in 0..=8u8 {
            let reason = DeoptReason::from_u8(raw).unwrap();
            assert_eq!(reason as u8, raw);
        }
        assert_eq!(DeoptReason::from_u8(9), None);
        assert_eq!(DeoptReason::GuardFailure.to_string(), "GuardFailure");
    }

    #[test]
    fn test_map_and_visit() {
        let meta = DeoptMetadata {
            frames: vec![FrameMeta {
                inline_frame: 0,
                offset: 4,
                locals: vec![LiveValue { loc: 1u32, kind: ValueKind::I64 }],
                stack: vec![LiveValue { loc: 2u32, kind: ValueKind::Boxed }],
                blocks: vec![],
            }],
            reason: DeoptReason::GuardFailure,
            action: DeoptAction::ResumeInInterpreter,
            description: "guard".into(),
            guilty: Some(2u32),
        };
        let mapped = meta.map(|l| l * 10);
        let mut seen = Vec::new();
        mapped.for_each_loc(|l| seen.push(l));
        assert_eq!(seen, [10, 20, 20]);
        assert_eq!(mapped.innermost().unwrap().locals[0].kind, ValueKind::I64);
    }

    #[test]
    fn test_value_kind_from_local_type() {
        assert_eq!(ValueKind::from_local_type(LocalType::Object), ValueKind::Boxed);
        assert_eq!(
            ValueKind::from_local_type(LocalType::Primitive(PrimitiveKind::Float64)),
            ValueKind::F64
        );
        assert_eq!(ValueKind::Bool.primitive(), Some(PrimitiveKind::Bool));
    }
}
