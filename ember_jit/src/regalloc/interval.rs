//! Live intervals.
//!
//! Each virtual register gets a single closed interval `[start, end]` of
//! program points. Within instruction `i`, operands are read at `2i` and
//! results written at `2i + 1`, so a register whose last use is at `i` can
//! share a location with one defined by `i`.
//!
//! Intervals are conservative: they span from the first to the last
//! mention of a register in the linear instruction order, deopt metadata
//! counts as a use, and any interval that touches a loop is widened to
//! cover the whole loop (repeated until nothing changes, for nested
//! loops).

use super::VReg;
use crate::lir::LirFunction;
use std::fmt;

// =============================================================================
// Program Point
// =============================================================================

/// A position in the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProgPoint(u32);

impl ProgPoint {
    /// Point where instruction `i` reads its operands.
    #[inline]
    pub const fn use_of(inst: u32) -> Self {
        ProgPoint(inst * 2)
    }

    /// Point where instruction `i` writes its results.
    #[inline]
    pub const fn def_of(inst: u32) -> Self {
        ProgPoint(inst * 2 + 1)
    }

    /// Instruction index.
    #[inline]
    pub const fn inst_index(self) -> u32 {
        self.0 / 2
    }

    /// Raw value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProgPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = if self.0 % 2 == 0 { "u" } else { "d" };
        write!(f, "{}{}", self.inst_index(), suffix)
    }
}

// =============================================================================
// Live Interval
// =============================================================================

/// The closed range of points where a register must keep its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveInterval {
    pub vreg: VReg,
    pub start: ProgPoint,
    pub end: ProgPoint,
}

impl LiveInterval {
    /// Create an interval.
    #[inline]
    pub fn new(vreg: VReg, start: ProgPoint, end: ProgPoint) -> Self {
        debug_assert!(start <= end);
        Self { vreg, start, end }
    }

    /// Whether two intervals share a point.
    #[inline]
    pub fn overlaps(&self, other: &LiveInterval) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    #[inline]
    fn extend(&mut self, point: ProgPoint) {
        if point < self.start {
            self.start = point;
        }
        if point > self.end {
            self.end = point;
        }
    }
}

// =============================================================================
// Construction
// =============================================================================

/// Compute an interval for every register mentioned by `func`.
///
/// The result is sorted by start point.
pub fn build_intervals(func: &LirFunction) -> Vec<LiveInterval> {
    let mut slots: Vec<Option<LiveInterval>> = vec![None; func.num_vregs as usize];

    for (i, inst) in func.insts.iter().enumerate() {
        let i = i as u32;
        inst.for_each_operand(|vreg, is_def| {
            let point = if is_def {
                ProgPoint::def_of(i)
            } else {
                ProgPoint::use_of(i)
            };
            note(&mut slots, vreg, point);
        });
        for id in inst.deopt_ids() {
            if let Some(meta) = func.deopts.get(id as usize) {
                meta.for_each_loc(|vreg| note(&mut slots, vreg, ProgPoint::use_of(i)));
            }
        }
    }

    if let Some(last) = func.insts.len().checked_sub(1) {
        let last = ProgPoint::def_of(last as u32);
        for &vreg in &func.pinned {
            note(&mut slots, vreg, ProgPoint::use_of(0));
            note(&mut slots, vreg, last);
        }
    }
    for &(vreg, _) in &func.params {
        note(&mut slots, vreg, ProgPoint::use_of(0));
    }

    let loops = loop_ranges(func);
    let mut intervals: Vec<LiveInterval> = slots.into_iter().flatten().collect();
    extend_over_loops(&mut intervals, &loops);
    intervals.sort_by_key(|i| (i.start, i.vreg));
    intervals
}

fn note(slots: &mut Vec<Option<LiveInterval>>, vreg: VReg, point: ProgPoint) {
    let idx = vreg.index() as usize;
    if idx >= slots.len() {
        slots.resize(idx + 1, None);
    }
    match &mut slots[idx] {
        Some(interval) => interval.extend(point),
        slot @ None => *slot = Some(LiveInterval::new(vreg, point, point)),
    }
}

/// `(header, latch)` point ranges of every backward branch.
fn loop_ranges(func: &LirFunction) -> Vec<(ProgPoint, ProgPoint)> {
    let mut loops = Vec::new();
    for (i, inst) in func.insts.iter().enumerate() {
        if let Some(target) = inst.target().and_then(|l| func.label_pos(l)) {
            if target <= i {
                loops.push((
                    ProgPoint::use_of(target as u32),
                    ProgPoint::def_of(i as u32),
                ));
            }
        }
    }
    loops
}

fn extend_over_loops(intervals: &mut [LiveInterval], loops: &[(ProgPoint, ProgPoint)]) {
    if loops.is_empty() {
        return;
    }
    let mut changed = true;
    while changed {
        changed = false;
        for interval in intervals.iter_mut() {
            for &(head, latch) in loops {
                let touches = interval.start <= latch && head <= interval.end;
                if touches && (interval.start > head || interval.end < latch) {
                    interval.extend(head);
                    interval.extend(latch);
                    changed = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deopt_meta::ValueKind;
    use crate::lir::{Imm, Inst, Label};

    fn v(n: u32) -> VReg {
        VReg::new(n)
    }

    fn func(insts: Vec<crate::lir::LirInst>, labels: Vec<Option<usize>>, num_vregs: u32) -> LirFunction {
        LirFunction {
            insts,
            labels,
            num_vregs,
            ..Default::default()
        }
    }

    #[test]
    fn test_straight_line() {
        let f = func(
            vec![
                Inst::LoadImm { dst: v(0), imm: Imm::I64(1) },
                Inst::LoadImm { dst: v(1), imm: Imm::I64(2) },
                Inst::Move { dst: v(2), src: v(0) },
                Inst::Return { src: v(2), kind: ValueKind::I64 },
            ],
            vec![],
            3,
        );
        let intervals = build_intervals(&f);
        assert_eq!(intervals.len(), 3);
        assert_eq!(intervals[0], LiveInterval::new(v(0), ProgPoint::def_of(0), ProgPoint::use_of(2)));
        assert_eq!(intervals[1], LiveInterval::new(v(1), ProgPoint::def_of(1), ProgPoint::def_of(1)));
        assert_eq!(intervals[2].end, ProgPoint::use_of(3));
        assert!(!intervals[0].overlaps(&intervals[2]));
    }

    #[test]
    fn test_loop_widening() {
        // 0: v0 = 1
        // 1: v1 = v0          <- loop header
        // 2: v0 = 2
        // 3: jump 1
        let f = func(
            vec![
                Inst::LoadImm { dst: v(0), imm: Imm::I64(1) },
                Inst::Move { dst: v(1), src: v(0) },
                Inst::LoadImm { dst: v(0), imm: Imm::I64(2) },
                Inst::Jump { target: Label(0) },
            ],
            vec![Some(1)],
            2,
        );
        let intervals = build_intervals(&f);
        let v0 = intervals.iter().find(|i| i.vreg == v(0)).unwrap();
        let v1 = intervals.iter().find(|i| i.vreg == v(1)).unwrap();
        assert_eq!(v0.end, ProgPoint::def_of(3));
        assert_eq!(v1.start, ProgPoint::use_of(1));
        assert_eq!(v1.end, ProgPoint::def_of(3));
    }

    #[test]
    fn test_pinned_span_whole_function() {
        let mut f = func(
            vec![
                Inst::LoadImm { dst: v(1), imm: Imm::Bool(true) },
                Inst::Return { src: v(1), kind: ValueKind::Bool },
            ],
            vec![],
            2,
        );
        f.pinned.push(v(0));
        let intervals = build_intervals(&f);
        let v0 = intervals.iter().find(|i| i.vreg == v(0)).unwrap();
        assert_eq!(v0.start, ProgPoint::use_of(0));
        assert_eq!(v0.end, ProgPoint::def_of(1));
    }

    #[test]
    fn test_prog_point_display() {
        assert_eq!(ProgPoint::use_of(3).to_string(), "3u");
        assert_eq!(ProgPoint::def_of(3).to_string(), "3d");
    }
}
