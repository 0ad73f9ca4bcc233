//! Deoptimization controller.
//!
//! Compiled code leaves through a deopt point whenever it cannot continue:
//! a guard failed, a primitive precondition was violated, a helper raised,
//! or deoptimization was forced. The controller rebuilds one interpreter
//! [`Frame`] per active inline level from the point's metadata:
//!
//! ```text
//! registers + DeoptMetadata ──reconstruct──▶ [outer Frame, ..., inner Frame]
//!                                               │
//! shadow entries [owner, owner+1, ...] ──convert in place──▶ Interpreted
//!                                               │
//! inner frames run to completion, innermost first, feeding their
//! results (or exceptions) to the call site in their parent
//!                                               ▼
//!                                  outermost Frame + how to continue it
//! ```
//!
//! Shadow entries keep their materialized frame objects, so frames observed
//! before the deopt are the frames observed after it.
//!
//! Values released by dropping the register file may queue finalizers; the
//! queue is drained only once every frame is in a consistent interpreted
//! state. A point that cannot be reconstructed is a fatal error.

use crate::executor::{slot, Word};
use crate::interpreter::{self, Frame, FrameExit, Resume};
use crate::vm::Vm;
use ember_jit::{
    CompiledUnit, DeoptAction, DeoptId, DeoptMetadata, DeoptReason, FrameId, ValueKind,
};
use ember_runtime::{FunctionObject, PyErr, PyResult, Value};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;

use crate::shadow::FrameKind;

// =============================================================================
// Errors
// =============================================================================

/// Unrecoverable inconsistency between compiled state and its metadata.
#[derive(Debug, Error)]
pub enum DeoptError {
    #[error("'{func}' has no deopt point {id}")]
    UnknownPoint { func: String, id: DeoptId },

    #[error("'{func}': expected a {expected} value, found {found}")]
    Representation {
        func: String,
        expected: ValueKind,
        found: &'static str,
    },

    #[error("'{func}': native pc {pc} is out of range")]
    PcOutOfRange { func: String, pc: usize },

    #[error("'{func}': failing primitive at native pc {pc} has no deopt point")]
    MissingDeopt { func: String, pc: usize },

    #[error("'{func}': unknown inline frame {frame}")]
    UnknownInlineFrame { func: String, frame: FrameId },

    #[error("'{func}': expected {expected} shadow entries, found {found}")]
    ShadowMismatch {
        func: String,
        expected: usize,
        found: usize,
    },

    #[error("helper operand holds {found}, expected an object")]
    HelperOperand { found: &'static str },

    #[error("'{func}': stack slot {index} of inline frame {frame} is empty")]
    EmptyStackSlot {
        func: String,
        frame: FrameId,
        index: usize,
    },

    #[error("'{func}': unwinding deopt point {id} without a pending exception")]
    MissingException { func: String, id: DeoptId },

    #[error("'{func}': inlined frame suspended during deoptimization")]
    InlinedSuspension { func: String },
}

/// Abort after logging a deopt failure.
#[cold]
pub fn fatal(err: DeoptError) -> ! {
    tracing::error!(error = %err, "deoptimization failed");
    panic!("deoptimization failed: {}", err)
}

// =============================================================================
// Statistics
// =============================================================================

/// Identity of a class of deopt events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeoptKey {
    pub func_qualname: Arc<str>,
    pub filename: Arc<str>,
    pub lineno: u32,
    pub reason: DeoptReason,
    pub description: String,
    pub guilty_type: Option<String>,
}

/// Deopt event counters, reset on read.
#[derive(Debug, Default)]
pub struct DeoptStats {
    events: Mutex<FxHashMap<DeoptKey, u64>>,
}

impl DeoptStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one event.
    pub fn record(&self, key: DeoptKey) {
        *self.events.lock().entry(key).or_insert(0) += 1;
    }

    /// Count an event at deopt point `meta` of `unit`.
    pub fn record_point(&self, unit: &CompiledUnit, meta: &DeoptMetadata, regs: &[Word]) {
        let Some(inner) = meta.innermost() else {
            return;
        };
        let Some(inline) = unit.inline_frames.get(inner.inline_frame as usize) else {
            return;
        };
        let guilty_type = meta
            .guilty
            .and_then(|loc| regs.get(slot(unit, loc)))
            .map(Word::type_name);
        self.record(DeoptKey {
            func_qualname: inline.code.qualname.clone(),
            filename: inline.code.filename.clone(),
            lineno: inline.code.line_or_first(inner.offset),
            reason: meta.reason,
            description: meta.description.clone(),
            guilty_type,
        });
    }

    /// Count a forced deopt of a function that never started running.
    pub fn record_unstarted(&self, func: &FunctionObject) {
        self.record(DeoptKey {
            func_qualname: func.qualname.clone(),
            filename: func.code.filename.clone(),
            lineno: func.code.first_lineno,
            reason: DeoptReason::Forced,
            description: "not started".to_string(),
            guilty_type: None,
        });
    }

    /// Take every counter, most frequent first.
    pub fn get_and_clear(&self) -> Vec<(DeoptKey, u64)> {
        let mut events: Vec<_> = std::mem::take(&mut *self.events.lock()).into_iter().collect();
        events.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.lineno.cmp(&b.0.lineno)));
        events
    }

    /// Total events recorded since the last reset.
    pub fn total(&self) -> u64 {
        self.events.lock().values().sum()
    }
}

// =============================================================================
// Reconstruction
// =============================================================================

fn live_value(unit: &CompiledUnit, regs: &[Word], loc: ember_jit::Loc, kind: ValueKind) -> Result<Option<Value>, DeoptError> {
    let word = &regs[slot(unit, loc)];
    if matches!(word, Word::Empty) {
        return Ok(None);
    }
    word.to_value(kind)
        .map(Some)
        .ok_or_else(|| DeoptError::Representation {
            func: unit.full_name.clone(),
            expected: kind,
            found: word.kind_name(),
        })
}

/// Interpreter frames described by `meta`, outermost first.
pub fn reconstruct(unit: &CompiledUnit, meta: &DeoptMetadata, regs: &[Word]) -> Result<Vec<Frame>, DeoptError> {
    let mut frames = Vec::with_capacity(meta.frames.len());
    for fm in &meta.frames {
        let inline = unit.inline_frames.get(fm.inline_frame as usize).ok_or_else(|| {
            DeoptError::UnknownInlineFrame {
                func: unit.full_name.clone(),
                frame: fm.inline_frame,
            }
        })?;
        let mut frame = Frame::for_code(inline.func.clone(), inline.code.clone());
        for (i, lv) in fm.locals.iter().enumerate() {
            if let Some(local) = frame.locals.get_mut(i) {
                *local = live_value(unit, regs, lv.loc, lv.kind)?;
            }
        }
        for (index, lv) in fm.stack.iter().enumerate() {
            let value = live_value(unit, regs, lv.loc, lv.kind)?.ok_or_else(|| {
                DeoptError::EmptyStackSlot {
                    func: unit.full_name.clone(),
                    frame: fm.inline_frame,
                    index,
                }
            })?;
            frame.stack.push(value);
        }
        frame.blocks = fm.blocks.clone();
        frame.pc = fm.offset as usize;
        frames.push(frame);
    }
    Ok(frames)
}

/// Turn the shadow entries `owner..` into interpreted entries for `frames`.
fn convert_shadow(vm: &mut Vm, unit: &CompiledUnit, frames: &[Frame], owner: usize) {
    let expected = owner + frames.len();
    if vm.shadow.len() != expected {
        fatal(DeoptError::ShadowMismatch {
            func: unit.full_name.clone(),
            expected,
            found: vm.shadow.len(),
        });
    }
    for (i, frame) in frames.iter().enumerate() {
        if let Some(entry) = vm.shadow.get_mut(owner + i) {
            entry.kind = FrameKind::Interpreted;
            entry.pc = frame.pc;
        }
    }
}

/// Leave `unit` through deopt point `id`.
///
/// Inlined frames are finished here; the returned frame is the unit's own
/// function together with how the interpreter should continue it.
pub fn resume_frames<R: Deref<Target = [Word]>>(
    vm: &mut Vm,
    unit: &Arc<CompiledUnit>,
    id: DeoptId,
    err: Option<PyErr>,
    regs: R,
    owner: usize,
) -> (Frame, Resume) {
    let Some(meta) = unit.deopt(id) else {
        fatal(DeoptError::UnknownPoint {
            func: unit.full_name.clone(),
            id,
        });
    };
    vm.runtime().deopt_stats().record_point(unit, meta, &regs);
    tracing::debug!(
        func = %unit.full_name,
        id,
        reason = %meta.reason,
        description = %meta.description,
        "deoptimizing"
    );

    let mut frames = reconstruct(unit, meta, &regs).unwrap_or_else(|e| fatal(e));
    drop(regs);
    convert_shadow(vm, unit, &frames, owner);
    vm.safepoint();

    let mut resume = match (meta.action, err) {
        (_, Some(e)) => Resume::Raise(e),
        (DeoptAction::ResumeInInterpreter, None) => Resume::Start,
        (DeoptAction::Unwind, None) => fatal(DeoptError::MissingException {
            func: unit.full_name.clone(),
            id,
        }),
    };

    let Some(mut current) = frames.pop() else {
        fatal(DeoptError::UnknownPoint {
            func: unit.full_name.clone(),
            id,
        });
    };
    while let Some(mut parent) = frames.pop() {
        let idx = owner + frames.len() + 1;
        let result = interpreter::run_frame(vm, &mut current, idx, resume);
        vm.shadow.truncate(idx);
        drop(current);
        vm.safepoint();
        resume = match result {
            Ok(FrameExit::Return(v)) => {
                parent.pc += 1;
                vm.shadow.set_pc(idx - 1, parent.pc);
                Resume::Send(v)
            }
            Ok(_) => fatal(DeoptError::InlinedSuspension {
                func: unit.full_name.clone(),
            }),
            Err(e) => Resume::Raise(e),
        };
        current = parent;
    }
    (current, resume)
}

/// Leave a non-resumable activation of `unit` and finish it in the
/// interpreter.
pub fn resume_function<R: Deref<Target = [Word]>>(
    vm: &mut Vm,
    unit: &Arc<CompiledUnit>,
    id: DeoptId,
    err: Option<PyErr>,
    regs: R,
    owner: usize,
) -> PyResult<Value> {
    let (mut frame, resume) = resume_frames(vm, unit, id, err, regs, owner);
    match interpreter::run_frame(vm, &mut frame, owner, resume)? {
        FrameExit::Return(v) => Ok(v),
        FrameExit::Yield(_) | FrameExit::Delegate(_) => Err(PyErr::runtime_error(format!(
            "'{}' suspended outside a generator",
            unit.full_name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(line: u32, reason: DeoptReason) -> DeoptKey {
        DeoptKey {
            func_qualname: Arc::from("f"),
            filename: Arc::from("t.py"),
            lineno: line,
            reason,
            description: "LoadAttr".to_string(),
            guilty_type: Some("C".to_string()),
        }
    }

    #[test]
    fn test_stats_aggregate_and_reset() {
        let stats = DeoptStats::new();
        stats.record(key(3, DeoptReason::GuardFailure));
        stats.record(key(3, DeoptReason::GuardFailure));
        stats.record(key(4, DeoptReason::Forced));
        assert_eq!(stats.total(), 3);
        let events = stats.get_and_clear();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].1, 2);
        assert_eq!(events[0].0.reason, DeoptReason::GuardFailure);
        assert_eq!(stats.total(), 0);
    }

    #[test]
    #[should_panic(expected = "deoptimization failed")]
    fn test_fatal_panics() {
        fatal(DeoptError::HelperOperand { found: "i64" });
    }
}
