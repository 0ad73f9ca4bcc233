//! Machine code emission.
//!
//! Rewrites an allocated LIR function into the machine instruction stream
//! of a [`CompiledUnit`]:
//!
//! 1. Resolve every virtual register to its allocated location
//! 2. Drop moves whose source and destination coincide
//! 3. Drop jumps to the next surviving instruction
//! 4. Resolve labels to instruction indices
//! 5. Rewrite deopt metadata to locations and build the line table

use crate::error::{CompileError, CompileResult};
use crate::lir::{Inst, LirFunction, MInst};
use crate::line_table::LineTable;
use crate::regalloc::{AllocationMap, Loc, VReg};
use crate::unit::{CompiledUnit, INST_SIZE};

/// Emit the unit for `lir` using `allocs`.
///
/// The returned unit has no address yet; the code cache assigns one when
/// it is published.
pub fn emit(lir: LirFunction, allocs: &AllocationMap, num_regs: u8) -> CompileResult<CompiledUnit> {
    let n = lir.insts.len();
    let locs = resolve_locations(&lir, allocs)?;
    let loc = |v: VReg| locs[v.index() as usize].unwrap_or(Loc::Reg(0));

    // Instructions that survive emission.
    let mut kept = vec![true; n];
    for (i, inst) in lir.insts.iter().enumerate() {
        if let Inst::Move { dst, src } = inst {
            if loc(*dst) == loc(*src) {
                kept[i] = false;
            }
        }
    }
    let mut next_kept = vec![n; n + 1];
    loop {
        for i in (0..n).rev() {
            next_kept[i] = if kept[i] { i } else { next_kept[i + 1] };
        }
        let mut changed = false;
        for (i, inst) in lir.insts.iter().enumerate() {
            if !kept[i] {
                continue;
            }
            if let Inst::Jump { target } = inst {
                let pos = lir.label_pos(*target).ok_or_else(|| unbound(target.0))?;
                if next_kept[i + 1] == next_kept[pos] {
                    kept[i] = false;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    // Old index -> new index, for both instructions and labels.
    let mut new_index = vec![0usize; n + 1];
    let mut count = 0;
    for i in 0..n {
        new_index[i] = count;
        if kept[i] {
            count += 1;
        }
    }
    new_index[n] = count;
    let mut label_index = Vec::with_capacity(lir.labels.len());
    for (l, pos) in lir.labels.iter().enumerate() {
        let pos = pos.ok_or_else(|| unbound(l as u32))?;
        label_index.push(new_index[next_kept[pos]]);
    }

    let mut code: Vec<MInst> = Vec::with_capacity(count);
    let mut origins = Vec::with_capacity(count);
    for (i, inst) in lir.insts.iter().enumerate() {
        if kept[i] {
            code.push(inst.map(loc, |l| label_index[l.0 as usize]));
            origins.push(lir.origins[i]);
        }
    }

    let deopts = lir.deopts.iter().map(|d| d.map(loc)).collect();
    let params = lir.params.iter().map(|&(v, kind)| (loc(v), kind)).collect();
    let num_spill_slots = allocs.spill_slot_count();
    let func = &lir.inline_frames[0].func;
    tracing::debug!(
        func = %func.full_name(),
        lir = n,
        emitted = code.len(),
        spill_slots = num_spill_slots,
        "emitted unit"
    );

    Ok(CompiledUnit {
        func_id: func.id(),
        full_name: func.full_name(),
        entry: 0,
        size: code.len() * INST_SIZE,
        line_table: LineTable::from_origins(&origins),
        code: code.into_boxed_slice(),
        deopts,
        constants: lir.constants.into_boxed_slice(),
        inline_frames: lir.inline_frames.into_boxed_slice(),
        params,
        num_regs,
        num_spill_slots,
        inline_stats: lir.inline_stats,
    })
}

fn unbound(label: u32) -> CompileError {
    CompileError::Internal(format!("label {} was never bound", label))
}

/// Dense vreg -> location table; every mentioned register must be allocated.
fn resolve_locations(lir: &LirFunction, allocs: &AllocationMap) -> CompileResult<Vec<Option<Loc>>> {
    let mut locs = vec![None; lir.num_vregs as usize];
    let mut missing = None;
    let mut visit = |v: VReg| {
        let idx = v.index() as usize;
        if idx >= locs.len() {
            locs.resize(idx + 1, None);
        }
        if locs[idx].is_none() {
            locs[idx] = allocs.get(v);
            if locs[idx].is_none() {
                missing = Some(v);
            }
        }
    };
    for inst in &lir.insts {
        inst.for_each_operand(|v, _| visit(v));
    }
    for meta in &lir.deopts {
        meta.for_each_loc(&mut visit);
    }
    for &(v, _) in &lir.params {
        visit(v);
    }
    match missing {
        Some(v) => Err(CompileError::Internal(format!("{} has no location", v))),
        None => Ok(locs),
    }
}
