//! Linear Scan Register Allocator
//!
//! A fast register allocator using the linear scan algorithm.
//!
//! # Algorithm Overview
//!
//! 1. Sort intervals by start position
//! 2. Maintain active set of currently live intervals
//! 3. At each interval start, expire old intervals and allocate
//! 4. If no register available, spill the interval with the furthest end
//!
//! # References
//!
//! - Poletto & Sarkar, "Linear Scan Register Allocation" (1999)

use super::interval::{LiveInterval, ProgPoint};
use super::{AllocationMap, AllocatorConfig, AllocatorStats, Loc, VReg};
use std::collections::BinaryHeap;

// =============================================================================
// Active Interval
// =============================================================================

/// An interval in the active set, ordered by end position.
#[derive(Debug, Clone)]
struct ActiveInterval {
    vreg: VReg,
    end: ProgPoint,
    reg: u8,
}

impl PartialEq for ActiveInterval {
    fn eq(&self, other: &Self) -> bool {
        self.end == other.end
    }
}

impl Eq for ActiveInterval {}

impl PartialOrd for ActiveInterval {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ActiveInterval {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse order for min-heap (earliest end first)
        other.end.cmp(&self.end)
    }
}

// =============================================================================
// Linear Scan Allocator
// =============================================================================

/// The linear scan register allocator.
pub struct LinearScanAllocator {
    allocations: AllocationMap,
    active: BinaryHeap<ActiveInterval>,
    /// Free registers as a bitmask.
    free: u32,
    stats: AllocatorStats,
}

impl LinearScanAllocator {
    /// Create a new allocator with the given configuration.
    pub fn new(config: AllocatorConfig) -> Self {
        let num_regs = config.num_regs.min(32) as u32;
        let free = if num_regs == 32 {
            u32::MAX
        } else {
            (1u32 << num_regs) - 1
        };
        LinearScanAllocator {
            allocations: AllocationMap::new(),
            active: BinaryHeap::new(),
            free,
            stats: AllocatorStats::default(),
        }
    }

    /// Allocate locations for a set of intervals.
    pub fn allocate(mut self, mut intervals: Vec<LiveInterval>) -> (AllocationMap, AllocatorStats) {
        self.stats.num_vregs = intervals.len();
        intervals.sort_by_key(|i| (i.start, i.vreg));

        for interval in &intervals {
            self.expire_old_intervals(interval.start);
            if !self.try_allocate(interval) {
                self.allocate_with_spill(interval);
            }
        }

        (self.allocations, self.stats)
    }

    /// Release registers of intervals that ended before `pos`.
    fn expire_old_intervals(&mut self, pos: ProgPoint) {
        while let Some(active) = self.active.peek() {
            if active.end >= pos {
                break;
            }
            if let Some(expired) = self.active.pop() {
                self.free |= 1 << expired.reg;
            }
        }
    }

    fn try_allocate(&mut self, interval: &LiveInterval) -> bool {
        if self.free == 0 {
            return false;
        }
        let reg = self.free.trailing_zeros() as u8;
        self.free &= !(1 << reg);
        self.allocations.set(interval.vreg, Loc::Reg(reg));
        self.active.push(ActiveInterval {
            vreg: interval.vreg,
            end: interval.end,
            reg,
        });
        self.stats.num_allocated += 1;
        true
    }

    /// Spill whichever of `interval` and the active intervals ends last.
    fn allocate_with_spill(&mut self, interval: &LiveInterval) {
        let candidate = self
            .active
            .iter()
            .filter(|a| a.end > interval.end)
            .max_by_key(|a| a.end)
            .map(|a| (a.vreg, a.reg));

        let slot = self.allocations.alloc_spill_slot();
        match candidate {
            Some((spill_vreg, reg)) => {
                self.allocations.set(spill_vreg, slot);
                self.allocations.set(interval.vreg, Loc::Reg(reg));
                self.active.retain(|a| a.vreg != spill_vreg);
                self.active.push(ActiveInterval {
                    vreg: interval.vreg,
                    end: interval.end,
                    reg,
                });
            }
            None => self.allocations.set(interval.vreg, slot),
        }
        self.stats.num_spilled += 1;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn make_interval(vreg: u32, start: u32, end: u32) -> LiveInterval {
        LiveInterval::new(VReg::new(vreg), ProgPoint::use_of(start), ProgPoint::use_of(end))
    }

    fn allocate(intervals: Vec<LiveInterval>, num_regs: u8) -> (AllocationMap, AllocatorStats) {
        LinearScanAllocator::new(AllocatorConfig { num_regs }).allocate(intervals)
    }

    #[test]
    fn test_simple_allocation() {
        let intervals = vec![
            make_interval(0, 0, 10),
            make_interval(1, 5, 15),
            make_interval(2, 20, 30),
        ];
        let (map, stats) = allocate(intervals, 12);
        for v in 0..3 {
            assert!(matches!(map.get(VReg::new(v)), Some(Loc::Reg(_))));
        }
        assert_eq!(stats.num_spilled, 0);
    }

    #[test]
    fn test_different_registers_for_overlapping() {
        let (map, _) = allocate(vec![make_interval(0, 0, 20), make_interval(1, 10, 30)], 12);
        assert_ne!(map.get(VReg::new(0)), map.get(VReg::new(1)));
    }

    #[test]
    fn test_register_reuse() {
        let (map, _) = allocate(vec![make_interval(0, 0, 10), make_interval(1, 20, 30)], 12);
        assert_eq!(map.get(VReg::new(0)), map.get(VReg::new(1)));
    }

    #[test]
    fn test_use_and_def_at_same_instruction_share() {
        let a = LiveInterval::new(VReg::new(0), ProgPoint::def_of(0), ProgPoint::use_of(3));
        let b = LiveInterval::new(VReg::new(1), ProgPoint::def_of(3), ProgPoint::use_of(5));
        let (map, _) = allocate(vec![a, b], 1);
        assert_eq!(map.get(VReg::new(0)), Some(Loc::Reg(0)));
        assert_eq!(map.get(VReg::new(1)), Some(Loc::Reg(0)));
    }

    #[test]
    fn test_spill_furthest_end() {
        let intervals = vec![
            make_interval(0, 0, 100),
            make_interval(1, 1, 10),
            make_interval(2, 2, 20),
        ];
        let (map, stats) = allocate(intervals, 2);
        assert_eq!(stats.num_spilled, 1);
        assert_eq!(map.get(VReg::new(0)), Some(Loc::Stack(0)));
        assert!(matches!(map.get(VReg::new(2)), Some(Loc::Reg(_))));
        assert_eq!(map.spill_slot_count(), 1);
    }
}
