//! Bytecode construction and validation errors.

use thiserror::Error;

/// Error produced while building or analyzing bytecode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BytecodeError {
    #[error("label {label} was never bound")]
    UnboundLabel { label: u32 },

    #[error("jump at offset {offset} targets out-of-range instruction {target}")]
    BadJumpTarget { offset: u32, target: u32 },

    #[error("operand {index} at offset {offset} is out of range")]
    IndexOutOfRange { offset: u32, index: u32 },

    #[error("stack underflow at offset {offset}")]
    StackUnderflow { offset: u32 },

    #[error("inconsistent stack depth at offset {offset}: {expected} vs {found}")]
    StackDepthMismatch { offset: u32, expected: u32, found: u32 },

    #[error("control falls off the end of the code at offset {offset}")]
    FallsOffEnd { offset: u32 },

    #[error("parameter '{name}' declared after a non-parameter local")]
    ParamAfterLocal { name: String },
}
