//! Compilation pipeline.
//!
//! ```text
//! FunctionObject ──▶ eligibility ──▶ lower ──▶ intervals ──▶ linear scan ──▶ emit
//!                    (suppressed,     (LIR +     (live        (locations)     (CompiledUnit)
//!                     not jittable,    deopts)    ranges)
//!                     JIT list)
//! ```
//!
//! A permanent refusal marks the function `NOT_JITTABLE` so the driver never
//! attempts it again. Refusals are not errors from the program's point of
//! view; they are logged at debug level and the function keeps running in
//! the interpreter.

use crate::codegen;
use crate::error::{CompileError, CompileResult};
use crate::jit_list::JitList;
use crate::lower::{lower, LowerConfig};
use crate::regalloc::{build_intervals, AllocatorConfig, LinearScanAllocator, NUM_REGS};
use crate::unit::CompiledUnit;
use ember_runtime::{FunctionFlags, FunctionObject};
use std::sync::Arc;

/// Compiler configuration.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    pub lower: LowerConfig,
    /// Machine registers available to the allocator.
    pub num_regs: u8,
    /// When set, only listed functions compile.
    pub jit_list: Option<Arc<JitList>>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            lower: LowerConfig::default(),
            num_regs: NUM_REGS,
            jit_list: None,
        }
    }
}

/// Bytecode-to-native compiler.
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    config: CompilerConfig,
}

impl Compiler {
    /// Create a compiler.
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    /// Configuration in use.
    #[inline]
    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Check whether `func` may be compiled at all.
    pub fn check_eligible(&self, func: &FunctionObject) -> CompileResult<()> {
        let flags = func.flags();
        if flags.contains(FunctionFlags::JIT_SUPPRESSED) {
            return Err(CompileError::Suppressed(func.full_name()));
        }
        if flags.contains(FunctionFlags::NOT_JITTABLE) {
            return Err(CompileError::NotJittable(format!(
                "{} was refused earlier",
                func.full_name()
            )));
        }
        if func.native().is_some() {
            return Err(CompileError::NotJittable(format!(
                "{} has a native body",
                func.full_name()
            )));
        }
        if let Some(list) = &self.config.jit_list {
            if !list.contains(func) {
                return Err(CompileError::NotOnJitList(func.full_name()));
            }
        }
        Ok(())
    }

    /// Compile `func` into an unpublished unit.
    pub fn compile(&self, func: &Arc<FunctionObject>) -> CompileResult<CompiledUnit> {
        let result = self.check_eligible(func).and_then(|()| self.run_passes(func));
        if let Err(err) = &result {
            if err.is_permanent() {
                func.add_flags(FunctionFlags::NOT_JITTABLE);
            }
            tracing::debug!(func = %func.full_name(), reason = %err, "not compiled");
        }
        result
    }

    fn run_passes(&self, func: &Arc<FunctionObject>) -> CompileResult<CompiledUnit> {
        let lir = lower(func, &self.config.lower)?;
        let intervals = build_intervals(&lir);
        let allocator = LinearScanAllocator::new(AllocatorConfig {
            num_regs: self.config.num_regs,
        });
        let (allocs, stats) = allocator.allocate(intervals);
        tracing::debug!(
            func = %func.full_name(),
            vregs = stats.num_vregs,
            spilled = stats.num_spilled,
            inlined = lir.inline_stats.num_inlined,
            "allocated registers"
        );
        codegen::emit(lir, &allocs, self.config.num_regs)
    }
}
