//! Native offset to source line mapping.
//!
//! Every machine instruction of a unit records the inline origin it was
//! lowered from. The table stores only the points where the origin changes,
//! so lookups are a binary search.
//!
//! Resolving an origin produces the whole inline stack: the innermost frame
//! reports the line of the executing instruction, and each enclosing frame
//! reports the line of its call site. Two inlined calls of the same callee
//! therefore resolve to distinct caller lines.

use crate::deopt_meta::InlineFrame;
use crate::lir::Origin;
use ember_bytecode::CodeObject;
use std::sync::Arc;

/// Start of a run of instructions with the same origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LineEntry {
    start: usize,
    origin: Origin,
}

/// Source position of one frame of an inline stack.
#[derive(Debug, Clone)]
pub struct SourceLocation {
    pub code: Arc<CodeObject>,
    /// Bytecode offset within `code`.
    pub offset: u32,
    pub line: u32,
}

/// Run-compressed origin table of a compiled unit.
#[derive(Debug, Clone, Default)]
pub struct LineTable {
    entries: Vec<LineEntry>,
    len: usize,
}

impl LineTable {
    /// Build from per-instruction origins.
    pub fn from_origins(origins: &[Origin]) -> Self {
        let mut entries: Vec<LineEntry> = Vec::new();
        for (pc, &origin) in origins.iter().enumerate() {
            if entries.last().map_or(true, |e| e.origin != origin) {
                entries.push(LineEntry { start: pc, origin });
            }
        }
        Self {
            entries,
            len: origins.len(),
        }
    }

    /// Number of runs.
    #[inline]
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// Origin of the instruction at `pc`.
    pub fn origin(&self, pc: usize) -> Option<Origin> {
        if pc >= self.len {
            return None;
        }
        let idx = self.entries.partition_point(|e| e.start <= pc);
        idx.checked_sub(1).map(|i| self.entries[i].origin)
    }

    /// Inline stack at `pc`, innermost frame first.
    pub fn locations(&self, pc: usize, frames: &[InlineFrame]) -> Vec<SourceLocation> {
        match self.origin(pc) {
            Some(origin) => resolve(origin, frames),
            None => Vec::new(),
        }
    }
}

/// Expand an origin into its inline stack, innermost frame first.
pub fn resolve(origin: Origin, frames: &[InlineFrame]) -> Vec<SourceLocation> {
    let mut out = Vec::new();
    let mut frame = Some(origin.frame);
    let mut offset = origin.offset;
    while let Some(id) = frame {
        let Some(f) = frames.get(id as usize) else {
            break;
        };
        out.push(SourceLocation {
            code: f.code.clone(),
            offset,
            line: f.code.line_or_first(offset),
        });
        offset = f.call_offset;
        frame = f.parent;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_bytecode::FunctionBuilder;
    use ember_runtime::{DictObject, FunctionObject};

    fn frame(name: &str, lines: &[u32], parent: Option<u16>, call_offset: u32) -> InlineFrame {
        let mut b = FunctionBuilder::new(name);
        b.set_filename(format!("{}.py", name));
        for &line in lines {
            b.set_line(line);
            b.load_none();
            b.pop_top();
        }
        b.return_none();
        let code = Arc::new(b.finish().unwrap());
        let func = Arc::new(FunctionObject::new(
            code.clone(),
            Arc::new(DictObject::new()),
            Arc::new(DictObject::new()),
        ));
        InlineFrame {
            code,
            func,
            parent,
            call_offset,
        }
    }

    #[test]
    fn test_runs_are_compressed() {
        let o = |frame, offset| Origin { frame, offset };
        let table = LineTable::from_origins(&[o(0, 0), o(0, 0), o(0, 1), o(1, 0), o(1, 0)]);
        assert_eq!(table.num_entries(), 3);
        assert_eq!(table.origin(1), Some(o(0, 0)));
        assert_eq!(table.origin(2), Some(o(0, 1)));
        assert_eq!(table.origin(4), Some(o(1, 0)));
        assert_eq!(table.origin(5), None);
    }

    #[test]
    fn test_inlined_frames_report_call_site_lines() {
        // The caller's instruction at offset 2 is on line 11.
        let frames = vec![
            frame("caller", &[10, 11], None, 0),
            frame("callee", &[20], Some(0), 2),
        ];
        let table = LineTable::from_origins(&[Origin { frame: 1, offset: 0 }]);
        let locs = table.locations(0, &frames);
        assert_eq!(locs.len(), 2);
        assert_eq!(&*locs[0].code.name, "callee");
        assert_eq!(&*locs[0].code.filename, "callee.py");
        assert_eq!(locs[0].line, 20);
        assert_eq!(&*locs[1].code.name, "caller");
        assert_eq!(locs[1].line, 11);
    }
}
