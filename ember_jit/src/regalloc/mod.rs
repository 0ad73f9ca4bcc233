//! Register Allocation
//!
//! Assigns every virtual register of a lowered function a machine
//! location: one of a small set of registers, or a frame spill slot.
//!
//! # Architecture
//!
//! - `interval.rs`: program points and conservative live intervals
//! - `linear_scan.rs`: the linear scan allocator
//!
//! Virtual registers produced by lowering are not SSA: each bytecode local
//! and each evaluation-stack depth has one fixed virtual register that is
//! redefined many times. An interval therefore covers every definition and
//! use of its register (deopt points count as uses), widened across any
//! loop it overlaps, and the register keeps one location for its whole
//! lifetime. No resolution moves are needed.

pub mod interval;
pub mod linear_scan;

pub use interval::{build_intervals, LiveInterval, ProgPoint};
pub use linear_scan::LinearScanAllocator;

use rustc_hash::FxHashMap;
use std::fmt;

// =============================================================================
// Virtual Register
// =============================================================================

/// A virtual register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(u32);

impl VReg {
    /// Create a virtual register from a raw index.
    #[inline]
    pub const fn new(index: u32) -> Self {
        VReg(index)
    }

    /// Get the raw index.
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for VReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// =============================================================================
// Machine Location
// =============================================================================

/// Number of machine registers available to the allocator.
pub const NUM_REGS: u8 = 12;

/// A machine location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Loc {
    /// Register `r0..r{NUM_REGS}`.
    Reg(u8),
    /// Frame spill slot.
    Stack(u16),
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Loc::Reg(r) => write!(f, "r{}", r),
            Loc::Stack(s) => write!(f, "[sp+{}]", s),
        }
    }
}

// =============================================================================
// Allocation Map
// =============================================================================

/// Maps virtual registers to their locations.
#[derive(Debug, Clone, Default)]
pub struct AllocationMap {
    locations: FxHashMap<VReg, Loc>,
    num_spill_slots: u16,
}

impl AllocationMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the location of a virtual register.
    #[inline]
    pub fn set(&mut self, vreg: VReg, loc: Loc) {
        self.locations.insert(vreg, loc);
    }

    /// Location of a virtual register, if it was ever live.
    #[inline]
    pub fn get(&self, vreg: VReg) -> Option<Loc> {
        self.locations.get(&vreg).copied()
    }

    /// Allocate a new spill slot.
    pub fn alloc_spill_slot(&mut self) -> Loc {
        let slot = Loc::Stack(self.num_spill_slots);
        self.num_spill_slots += 1;
        slot
    }

    /// Number of spill slots used.
    #[inline]
    pub fn spill_slot_count(&self) -> u16 {
        self.num_spill_slots
    }
}

// =============================================================================
// Configuration and Statistics
// =============================================================================

/// Configuration for the register allocator.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Registers available for allocation.
    pub num_regs: u8,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self { num_regs: NUM_REGS }
    }
}

/// Statistics from register allocation.
#[derive(Debug, Clone, Default)]
pub struct AllocatorStats {
    /// Number of virtual registers with a non-empty interval.
    pub num_vregs: usize,
    /// Number assigned to registers.
    pub num_allocated: usize,
    /// Number spilled.
    pub num_spilled: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_map() {
        let mut map = AllocationMap::new();
        map.set(VReg::new(0), Loc::Reg(3));
        let slot = map.alloc_spill_slot();
        map.set(VReg::new(1), slot);
        assert_eq!(map.get(VReg::new(0)), Some(Loc::Reg(3)));
        assert_eq!(map.get(VReg::new(1)), Some(Loc::Stack(0)));
        assert_eq!(map.get(VReg::new(2)), None);
        assert_eq!(map.spill_slot_count(), 1);
    }

    #[test]
    fn test_display() {
        assert_eq!(VReg::new(7).to_string(), "v7");
        assert_eq!(Loc::Reg(2).to_string(), "r2");
        assert_eq!(Loc::Stack(4).to_string(), "[sp+4]");
    }
}
