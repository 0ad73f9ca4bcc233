//! Compilation errors.

use ember_bytecode::BytecodeError;
use thiserror::Error;

/// Why a function was not compiled.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    /// The function uses a construct the compiler does not translate.
    /// The function is marked so it is never attempted again.
    #[error("not jittable: {0}")]
    NotJittable(String),

    /// Compilation was suppressed for this function.
    #[error("compilation suppressed for {0}")]
    Suppressed(String),

    /// The function is excluded by the JIT list.
    #[error("{0} is not on the JIT list")]
    NotOnJitList(String),

    /// The function object died before its scheduled compilation.
    #[error("function was destroyed before compilation")]
    TargetDestroyed,

    /// The bytecode failed validation.
    #[error("invalid bytecode: {0}")]
    Bytecode(#[from] BytecodeError),

    /// Internal failure in a compiler pass.
    #[error("internal compiler error: {0}")]
    Internal(String),
}

impl CompileError {
    /// Whether retrying later can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, CompileError::NotJittable(_) | CompileError::Bytecode(_))
    }
}

/// Result type for compiler passes.
pub type CompileResult<T> = Result<T, CompileError>;
