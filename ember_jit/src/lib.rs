//! Bytecode-to-native compiler for the Ember VM.
//!
//! The compiler turns one function (plus any callees it inlines) into a
//! [`CompiledUnit`]:
//!
//! - Global preloading and inlining of statically known callees
//! - Unboxed primitive locals with box/unbox only at representation changes
//! - Lowering to a register-based LIR with deopt metadata at every exit
//! - Linear scan register allocation
//! - Machine instruction emission with line and deopt tables
//!
//! Published units live in the [`CodeCache`]; the VM crate executes them.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod code_cache;
pub mod codegen;
pub mod compiler;
pub mod deopt_meta;
pub mod error;
pub mod inliner;
pub mod jit_list;
pub mod line_table;
pub mod lir;
pub mod lower;
pub mod perf_map;
pub mod preload;
pub mod regalloc;
pub mod unit;

pub use code_cache::{CodeCache, CodeCacheStats};
pub use compiler::{Compiler, CompilerConfig};
pub use deopt_meta::{
    BlockSpec, DeoptAction, DeoptId, DeoptMetadata, DeoptReason, FrameMeta, InlineFrame,
    LiveValue, ValueKind,
};
pub use error::{CompileError, CompileResult};
pub use inliner::{InlineFailureType, InlineStats};
pub use jit_list::{JitList, JitListError};
pub use line_table::{LineTable, SourceLocation};
pub use lir::{FrameId, Helper, Imm, Inst, MInst, Origin};
pub use lower::LowerConfig;
pub use perf_map::PerfMap;
pub use regalloc::Loc;
pub use unit::CompiledUnit;
