//! Compiled units.
//!
//! A unit is the immutable result of compiling one function: its machine
//! instructions and every side table needed to run them, leave them, and
//! describe them to introspection. Units are published through the
//! [`CodeCache`](crate::code_cache::CodeCache) and replaced wholesale.

use crate::deopt_meta::{DeoptId, DeoptMetadata, InlineFrame, ValueKind};
use crate::inliner::InlineStats;
use crate::lir::MInst;
use crate::line_table::{LineTable, SourceLocation};
use crate::regalloc::Loc;
use ember_bytecode::CodeObject;
use ember_runtime::{FunctionObject, Value};
use std::fmt::Write;
use std::sync::Arc;

/// Encoded size of one machine instruction in the code region.
pub const INST_SIZE: usize = 8;

/// Machine code and side tables of one compiled function.
#[derive(Debug)]
pub struct CompiledUnit {
    /// Identity of the compiled function.
    pub func_id: u64,
    /// `module:qualname` of the compiled function.
    pub full_name: String,
    /// Address of the first instruction; assigned when published.
    pub entry: usize,
    /// Size in bytes.
    pub size: usize,
    pub code: Box<[MInst]>,
    pub line_table: LineTable,
    pub deopts: Box<[DeoptMetadata]>,
    /// Frame 0 is the compiled function; the rest were inlined.
    pub inline_frames: Box<[InlineFrame]>,
    /// Boxed constants referenced by `LoadConst` and `GuardIs`.
    pub constants: Box<[Value]>,
    /// Where each argument is placed on entry.
    pub params: Box<[(Loc, ValueKind)]>,
    pub num_regs: u8,
    pub num_spill_slots: u16,
    pub inline_stats: InlineStats,
}

impl CompiledUnit {
    /// Code object of the compiled function.
    #[inline]
    pub fn code_object(&self) -> &Arc<CodeObject> {
        &self.inline_frames[0].code
    }

    /// The compiled function.
    #[inline]
    pub fn function(&self) -> &Arc<FunctionObject> {
        &self.inline_frames[0].func
    }

    /// Whether the unit runs a generator or coroutine body.
    #[inline]
    pub fn is_resumable(&self) -> bool {
        self.code_object().is_resumable()
    }

    /// Register file size of one activation.
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.num_regs as usize + self.num_spill_slots as usize
    }

    /// Deopt metadata by id.
    #[inline]
    pub fn deopt(&self, id: DeoptId) -> Option<&DeoptMetadata> {
        self.deopts.get(id as usize)
    }

    /// Inline stack at instruction `pc`, innermost frame first.
    pub fn locations(&self, pc: usize) -> Vec<SourceLocation> {
        self.line_table.locations(pc, &self.inline_frames)
    }

    /// Whether `addr` falls in this unit's code.
    #[inline]
    pub fn contains_address(&self, addr: usize) -> bool {
        addr >= self.entry && addr < self.entry + self.size
    }

    /// Instruction index of a code address.
    #[inline]
    pub fn pc_of(&self, addr: usize) -> Option<usize> {
        self.contains_address(addr)
            .then(|| (addr - self.entry) / INST_SIZE)
    }

    /// Listing of the machine code with origins.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "unit {} @ {:#x} ({} bytes, {} regs, {} spill slots)",
            self.full_name, self.entry, self.size, self.num_regs, self.num_spill_slots
        );
        for (pc, inst) in self.code.iter().enumerate() {
            let origin = self
                .line_table
                .origin(pc)
                .map(|o| format!("{}:{}", o.frame, o.offset))
                .unwrap_or_default();
            let _ = writeln!(out, "{:5} {:>8}  {}", pc, origin, inst);
        }
        out
    }
}
