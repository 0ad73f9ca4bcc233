//! Shadow stack and lazily materialized frames.
//!
//! Every activation, whether interpreted, compiled or inlined into a
//! compiled unit, pushes a [`ShadowFrame`]. The shadow frame is cheap: it
//! records the function, how it is executing and where it currently is.
//! A full [`FrameObject`] is only built when something asks for one
//! (`_getframe`, `gi_frame`, `f_back`) or when the function runs in
//! normal frame mode.
//!
//! ```text
//! shadow stack (bottom first)            materialized frames
//! ┌──────────────────────────────┐
//! │ 0 Interpreted  main  pc=12   │ ──▶ FrameObject(main)  back=None
//! │ 1 Compiled     g     pc=37   │ ──▶ FrameObject(g)     back=main
//! │ 2 Inlined      f     owner=1 │ ──▶ FrameObject(f)     back=g
//! └──────────────────────────────┘
//! ```
//!
//! Once built, a frame object is cached on its shadow frame, so repeated
//! requests return the same object. Materialization relinks every `back`
//! pointer from the bottom up, which makes the chain consistent again
//! after generators were parked and resumed under a different caller.
//!
//! Offsets of compiled and inlined entries come from the unit's line
//! table: the owner's native pc names an inline origin, and walking the
//! inline frame parents yields the call site of each enclosing frame.

use ember_bytecode::CodeObject;
use ember_jit::{CompiledUnit, FrameId};
use ember_runtime::{builtin_types, FunctionObject, NativeObject, TypeObject, Value};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// =============================================================================
// Frame Object
// =============================================================================

/// Materialized frame visible to the program.
pub struct FrameObject {
    func: Arc<FunctionObject>,
    code: Arc<CodeObject>,
    back: Mutex<Option<Arc<FrameObject>>>,
    offset: AtomicU32,
    line: AtomicU32,
}

impl FrameObject {
    /// Frame of `func` positioned at its first line.
    pub fn new(func: Arc<FunctionObject>, code: Arc<CodeObject>) -> Self {
        let line = code.first_lineno;
        Self {
            func,
            code,
            back: Mutex::new(None),
            offset: AtomicU32::new(0),
            line: AtomicU32::new(line),
        }
    }

    #[inline]
    pub fn func(&self) -> &Arc<FunctionObject> {
        &self.func
    }

    #[inline]
    pub fn code(&self) -> &Arc<CodeObject> {
        &self.code
    }

    /// Calling frame.
    pub fn back(&self) -> Option<Arc<FrameObject>> {
        self.back.lock().clone()
    }

    pub fn set_back(&self, back: Option<Arc<FrameObject>>) {
        *self.back.lock() = back;
    }

    /// Last bytecode offset.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset.load(Ordering::Relaxed)
    }

    /// Current line number.
    #[inline]
    pub fn line(&self) -> u32 {
        self.line.load(Ordering::Relaxed)
    }

    /// Move to bytecode `offset`.
    pub fn set_offset(&self, offset: u32) {
        self.offset.store(offset, Ordering::Relaxed);
        self.line
            .store(self.code.line_or_first(offset), Ordering::Relaxed);
    }
}

impl fmt::Debug for FrameObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<frame of {} line {}>",
            self.code.qualname,
            self.line()
        )
    }
}

impl NativeObject for FrameObject {
    fn type_name(&self) -> &'static str {
        "frame"
    }

    fn class(&self) -> Arc<TypeObject> {
        builtin_types().frame.clone()
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        match name {
            "f_back" => Some(match self.back() {
                Some(back) => Value::Native(back),
                None => Value::None,
            }),
            "f_lineno" => Some(Value::Int(self.line() as i64)),
            "f_lasti" => Some(Value::Int(self.offset() as i64)),
            "f_code" => Some(Value::Code(self.code.clone())),
            "f_globals" => Some(Value::Dict(self.func.globals.clone())),
            _ => None,
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
// Shadow Frames
// =============================================================================

/// How an activation is executing.
#[derive(Debug, Clone)]
pub enum FrameKind {
    /// Bytecode interpreter; `pc` is a bytecode offset.
    Interpreted,
    /// Compiled unit; `pc` is a native instruction index.
    Compiled { unit: Arc<CompiledUnit> },
    /// Inlined into the unit running at shadow index `owner`.
    Inlined {
        unit: Arc<CompiledUnit>,
        frame: FrameId,
        owner: usize,
    },
}

/// One activation on the shadow stack.
#[derive(Debug, Clone)]
pub struct ShadowFrame {
    pub func: Arc<FunctionObject>,
    pub code: Arc<CodeObject>,
    pub kind: FrameKind,
    pub pc: usize,
    /// Materialized frame, once built.
    pub frame: Option<Arc<FrameObject>>,
}

impl ShadowFrame {
    /// Entry for an activation of `func`.
    pub fn new(func: Arc<FunctionObject>, kind: FrameKind) -> Self {
        let code = func.code.clone();
        Self {
            func,
            code,
            kind,
            pc: 0,
            frame: None,
        }
    }

    /// Whether this entry runs compiled code (directly or inlined).
    #[inline]
    pub fn is_compiled(&self) -> bool {
        !matches!(self.kind, FrameKind::Interpreted)
    }

    /// Bytecode offset of an entry that is not inlined.
    pub fn own_offset(&self) -> u32 {
        match &self.kind {
            FrameKind::Interpreted => self.pc as u32,
            FrameKind::Compiled { unit } => offset_in(unit, self.pc, 0).unwrap_or(0),
            FrameKind::Inlined { .. } => 0,
        }
    }

    /// Frame object of a detached entry (a parked generator), built on
    /// demand and unlinked from any caller.
    pub fn materialize_detached(&mut self) -> Arc<FrameObject> {
        let offset = self.own_offset();
        let frame = self.frame_object();
        frame.set_offset(offset);
        frame
    }

    /// Refresh the cached frame before the entry leaves the stack.
    pub fn park(&mut self) {
        let offset = self.own_offset();
        if let Some(frame) = &self.frame {
            frame.set_offset(offset);
            frame.set_back(None);
        }
    }

    fn frame_object(&mut self) -> Arc<FrameObject> {
        if let Some(frame) = &self.frame {
            return frame.clone();
        }
        let frame = Arc::new(FrameObject::new(self.func.clone(), self.code.clone()));
        self.frame = Some(frame.clone());
        frame
    }
}

/// Bytecode offset, within inline frame `target`, of native instruction
/// `pc` of `unit`.
pub fn offset_in(unit: &CompiledUnit, pc: usize, target: FrameId) -> Option<u32> {
    let origin = unit.line_table.origin(pc)?;
    let (mut frame, mut offset) = (origin.frame, origin.offset);
    while frame != target {
        let inline = unit.inline_frames.get(frame as usize)?;
        offset = inline.call_offset;
        frame = inline.parent?;
    }
    Some(offset)
}

// =============================================================================
// Shadow Stack
// =============================================================================

/// Per-thread stack of activations.
#[derive(Debug, Default)]
pub struct ShadowStack {
    entries: Vec<ShadowFrame>,
}

impl ShadowStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an entry, returning its index.
    #[inline]
    pub fn push(&mut self, entry: ShadowFrame) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    /// Pop the top entry, leaving its frame object at its last position.
    pub fn pop(&mut self) -> Option<ShadowFrame> {
        let index = self.entries.len().checked_sub(1)?;
        let offset = self.offset(index);
        let entry = self.entries.pop()?;
        if let Some(frame) = &entry.frame {
            frame.set_offset(offset);
        }
        Some(entry)
    }

    /// Pop every entry at or above `len`.
    pub fn truncate(&mut self, len: usize) {
        while self.entries.len() > len {
            self.pop();
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&ShadowFrame> {
        self.entries.get(index)
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut ShadowFrame> {
        self.entries.get_mut(index)
    }

    #[inline]
    pub fn top(&self) -> Option<&ShadowFrame> {
        self.entries.last()
    }

    /// Record the position of entry `index`.
    #[inline]
    pub fn set_pc(&mut self, index: usize, pc: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.pc = pc;
        }
    }

    /// Bytecode offset of entry `index`.
    pub fn offset(&self, index: usize) -> u32 {
        let Some(entry) = self.entries.get(index) else {
            return 0;
        };
        match &entry.kind {
            FrameKind::Inlined { unit, frame, owner } => {
                let pc = self.entries.get(*owner).map_or(0, |o| o.pc);
                offset_in(unit, pc, *frame).unwrap_or(0)
            }
            _ => entry.own_offset(),
        }
    }

    /// Frame object of entry `index`, linking every frame below it.
    pub fn materialize(&mut self, index: usize) -> Option<Arc<FrameObject>> {
        if index >= self.entries.len() {
            return None;
        }
        let mut back: Option<Arc<FrameObject>> = None;
        for i in 0..=index {
            let offset = self.offset(i);
            let frame = self.entries[i].frame_object();
            frame.set_offset(offset);
            frame.set_back(back.take());
            back = Some(frame);
        }
        back
    }

    /// Frame object of entry `index`, linked to its caller.
    ///
    /// Walks down only until an entry whose frame is already linked to the
    /// one below it. The caller is always refreshed, and so is the owner of
    /// an inlined caller, since their positions moved since they were
    /// linked.
    pub fn link(&mut self, index: usize) -> Option<Arc<FrameObject>> {
        if index >= self.entries.len() {
            return None;
        }
        let mut start = index;
        while start > 0 && !self.is_linked(start - 1) {
            start -= 1;
        }
        if let Some(caller) = index.checked_sub(1) {
            let refresh = match &self.entries[caller].kind {
                FrameKind::Inlined { owner, .. } => (*owner).min(caller),
                _ => caller,
            };
            start = start.min(refresh);
        }
        let mut back = start.checked_sub(1).and_then(|i| self.entries[i].frame.clone());
        for i in start..=index {
            let offset = self.offset(i);
            let frame = self.entries[i].frame_object();
            frame.set_offset(offset);
            frame.set_back(back.take());
            back = Some(frame);
        }
        back
    }

    /// Whether entry `i` has a frame whose back link is the frame below it.
    fn is_linked(&self, i: usize) -> bool {
        let Some(frame) = &self.entries[i].frame else {
            return false;
        };
        let below = match i.checked_sub(1) {
            None => None,
            Some(j) => match &self.entries[j].frame {
                Some(f) => Some(f),
                None => return false,
            },
        };
        match (frame.back(), below) {
            (None, None) => true,
            (Some(back), Some(below)) => Arc::ptr_eq(&back, below),
            _ => false,
        }
    }

    /// Frame `depth` levels below the top (0 is the top).
    pub fn frame_at_depth(&mut self, depth: usize) -> Option<Arc<FrameObject>> {
        let index = self.entries.len().checked_sub(depth + 1)?;
        self.materialize(index)
    }

    /// Materialized frames, innermost first. Does not build new frames.
    pub fn existing_frames(&self) -> impl Iterator<Item = &Arc<FrameObject>> {
        self.entries.iter().rev().filter_map(|e| e.frame.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_bytecode::FunctionBuilder;
    use ember_runtime::DictObject;

    fn function(name: &str, first_line: u32) -> Arc<FunctionObject> {
        let mut b = FunctionBuilder::new(name);
        b.set_first_lineno(first_line);
        b.set_line(first_line + 1);
        b.load_none();
        b.set_line(first_line + 2);
        b.return_value();
        Arc::new(FunctionObject::new(
            Arc::new(b.finish().unwrap()),
            Arc::new(DictObject::new()),
            Arc::new(DictObject::new()),
        ))
    }

    #[test]
    fn test_materialize_is_identity_stable() {
        let mut stack = ShadowStack::new();
        stack.push(ShadowFrame::new(function("a", 1), FrameKind::Interpreted));
        stack.push(ShadowFrame::new(function("b", 10), FrameKind::Interpreted));
        let first = stack.materialize(1).unwrap();
        let second = stack.frame_at_depth(0).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let back = first.back().unwrap();
        assert!(Arc::ptr_eq(&back, &stack.materialize(0).unwrap()));
        assert!(back.back().is_none());
    }

    #[test]
    fn test_lines_follow_pc() {
        let mut stack = ShadowStack::new();
        let idx = stack.push(ShadowFrame::new(function("a", 5), FrameKind::Interpreted));
        let frame = stack.materialize(idx).unwrap();
        assert_eq!(frame.line(), 6);
        stack.set_pc(idx, 1);
        stack.materialize(idx);
        assert_eq!(frame.line(), 7);
        assert_eq!(frame.get_attr("f_lineno").and_then(|v| v.as_int()), Some(7));
    }

    #[test]
    fn test_link_stops_at_linked_frames() {
        let mut stack = ShadowStack::new();
        let a = stack.push(ShadowFrame::new(function("a", 1), FrameKind::Interpreted));
        let b = stack.push(ShadowFrame::new(function("b", 10), FrameKind::Interpreted));
        let frame_b = stack.link(b).unwrap();
        let frame_a = frame_b.back().unwrap();
        assert_eq!(frame_a.line(), 2);

        // `a` is suspended below its callee; only `b` moved.
        stack.set_pc(a, 1);
        stack.set_pc(b, 1);
        let c = stack.push(ShadowFrame::new(function("c", 20), FrameKind::Interpreted));
        let frame_c = stack.link(c).unwrap();
        assert!(Arc::ptr_eq(&frame_c.back().unwrap(), &frame_b));
        assert!(Arc::ptr_eq(&frame_b.back().unwrap(), &frame_a));
        assert_eq!(frame_b.line(), 12);
        assert_eq!(frame_a.line(), 2);

        // Full materialization refreshes every frame.
        stack.materialize(c);
        assert_eq!(frame_a.line(), 3);
    }

    #[test]
    fn test_relinks_after_reparenting() {
        let mut stack = ShadowStack::new();
        stack.push(ShadowFrame::new(function("caller1", 1), FrameKind::Interpreted));
        let mut parked = ShadowFrame::new(function("gen", 20), FrameKind::Interpreted);
        let frame = parked.materialize_detached();
        assert!(frame.back().is_none());

        let idx = stack.push(parked);
        stack.link(idx);
        let caller = frame.back().unwrap();
        assert_eq!(&*caller.code().qualname, "caller1");

        let mut entry = stack.pop().unwrap();
        entry.park();
        assert!(frame.back().is_none());
        assert!(stack.frame_at_depth(5).is_none());
    }
}
