//! Stack-based bytecode consumed by the Ember interpreter and JIT.
//!
//! This crate defines the contract between the front-end that produces
//! bytecode and the execution engines that consume it:
//!
//! - [`Opcode`] / [`Instruction`] - the instruction set
//! - [`CodeObject`] - an immutable, shareable unit of bytecode
//! - [`FunctionBuilder`] - a high-level API for bytecode construction
//! - [`stack_depths`] - static stack-depth analysis

mod analysis;
mod builder;
mod code_object;
mod error;
mod opcode;

pub use analysis::{max_stack_depth, stack_depths, stack_effect};
pub use builder::{FunctionBuilder, Label};
pub use code_object::{
    disassemble, CodeExtra, CodeFlags, CodeObject, Constant, LineTableEntry, NativeSignature,
};
pub use error::BytecodeError;
pub use opcode::{BinOp, CmpOp, Instruction, LocalType, Opcode, PrimitiveKind};
