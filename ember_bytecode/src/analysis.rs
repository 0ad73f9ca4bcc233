//! Static stack-depth analysis.
//!
//! Computes the evaluation stack depth at entry to each reachable
//! instruction. The builder uses it to size frames; the JIT uses it to lay
//! out one virtual register per stack slot.

use crate::code_object::{CodeObject, Constant};
use crate::error::BytecodeError;
use crate::opcode::{Instruction, Opcode};

/// Stack effect of an instruction: `(fallthrough, branch)`.
///
/// `branch` is the effect along the jump edge for instructions with a jump
/// target.
pub fn stack_effect(inst: Instruction, constants: &[Constant]) -> (i32, Option<i32>) {
    use Opcode::*;
    let arg = inst.arg as i32;
    let fall = match inst.opcode {
        Nop | RotTwo | RotThree | DeleteFast | LoadAttr | UnaryNot | UnaryNegative
        | PrimitiveBox | PrimitiveUnbox | GetIter | GetYieldFromIter | GetAwaitable
        | PopBlock | PopExcept | Jump | YieldValue => 0,
        PopTop | StoreFast | StoreGlobal | StoreName | DeleteAttr | BinaryOp | CompareOp
        | PrimitiveBinaryOp | PrimitiveCompareOp | BinarySubscr | ReturnValue | Reraise
        | PopJumpIfFalse | PopJumpIfTrue | YieldFrom | MatchClass => -1,
        DupTop | LoadConst | LoadFast | LoadGlobal | LoadName | LoadMethod
        | PrimitiveLoadConst | GetLen | MatchSequence | MatchMapping => 1,
        DupTopTwo => 2,
        StoreAttr | JumpIfNotExcMatch => -2,
        StoreSubscr => -3,
        CallMethod => -(arg + 1),
        CallFunction => -arg,
        InvokeNative => match constants.get(inst.arg as usize) {
            Some(Constant::Native(sig)) => 1 - sig.params.len() as i32,
            _ => 0,
        },
        MakeFunction => -(arg & 1),
        BuildTuple | BuildList => 1 - arg,
        BuildMap => 1 - 2 * arg,
        UnpackSequence => arg - 1,
        Raise => -arg,
        ForIter => 1,
        SetupFinally => 0,
    };
    let branch = match inst.opcode {
        Jump => Some(0),
        PopJumpIfFalse | PopJumpIfTrue => Some(-1),
        JumpIfNotExcMatch => Some(-2),
        ForIter => Some(-1),
        // The handler starts with the raised exception pushed.
        SetupFinally => Some(1),
        _ => None,
    };
    (fall, branch)
}

/// Compute the entry depth of each instruction.
///
/// Returns `None` for instructions unreachable from offset 0 along normal
/// and handler edges.
pub fn stack_depths(code: &CodeObject) -> Result<Vec<Option<u32>>, BytecodeError> {
    let n = code.instructions.len();
    let mut depths: Vec<Option<u32>> = vec![None; n];
    let mut worklist: Vec<(usize, u32)> = Vec::new();
    if n > 0 {
        worklist.push((0, 0));
    }

    while let Some((mut pc, mut depth)) = worklist.pop() {
        loop {
            if pc >= n {
                return Err(BytecodeError::FallsOffEnd { offset: pc as u32 });
            }
            match depths[pc] {
                Some(seen) if seen == depth => break,
                Some(seen) => {
                    return Err(BytecodeError::StackDepthMismatch {
                        offset: pc as u32,
                        expected: seen,
                        found: depth,
                    })
                }
                None => depths[pc] = Some(depth),
            }

            let inst = code.instructions[pc];
            let (fall, branch) = stack_effect(inst, &code.constants);
            if let Some(effect) = branch {
                let target = inst.arg as usize;
                if target >= n {
                    return Err(BytecodeError::BadJumpTarget {
                        offset: pc as u32,
                        target: inst.arg,
                    });
                }
                let target_depth = apply(depth, effect, pc)?;
                worklist.push((target, target_depth));
            }
            if inst.opcode.is_terminator() {
                break;
            }
            depth = apply(depth, fall, pc)?;
            pc += 1;
        }
    }
    Ok(depths)
}

#[inline]
fn apply(depth: u32, effect: i32, pc: usize) -> Result<u32, BytecodeError> {
    let next = depth as i64 + effect as i64;
    if next < 0 {
        return Err(BytecodeError::StackUnderflow { offset: pc as u32 });
    }
    Ok(next as u32)
}

/// Maximum depth over all reachable instructions, including the pushes
/// performed by each instruction.
pub fn max_stack_depth(code: &CodeObject, depths: &[Option<u32>]) -> u32 {
    let mut max = 0u32;
    for (pc, depth) in depths.iter().enumerate() {
        if let Some(depth) = *depth {
            let (fall, branch) = stack_effect(code.instructions[pc], &code.constants);
            let peak = depth as i64 + fall.max(branch.unwrap_or(0)).max(0) as i64;
            max = max.max(peak as u32).max(depth);
        }
    }
    max
}
