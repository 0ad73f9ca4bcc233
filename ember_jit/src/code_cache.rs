//! Code cache for storing and indexing compiled units.
//!
//! The code cache provides:
//! - O(1) lookup of the unit of a function by function id
//! - Address assignment in a process-wide code region
//! - Lookup of the unit containing a code address
//! - Statistics for introspection

use crate::unit::CompiledUnit;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Base of the code region.
const CODE_REGION_BASE: usize = 0x7e00_0000_0000;

/// Alignment of each unit's entry.
const CODE_ALIGN: usize = 16;

/// Code cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub removals: u64,
}

/// Published units, keyed by function id.
#[derive(Debug)]
pub struct CodeCache {
    units: DashMap<u64, Arc<CompiledUnit>>,
    next_addr: AtomicUsize,
    total_size: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    removals: AtomicU64,
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            units: DashMap::new(),
            next_addr: AtomicUsize::new(CODE_REGION_BASE),
            total_size: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            removals: AtomicU64::new(0),
        }
    }

    /// Assign an address to `unit` and publish it, replacing any previous
    /// unit of the same function.
    pub fn publish(&self, mut unit: CompiledUnit) -> Arc<CompiledUnit> {
        let reserved = unit.size.max(1).div_ceil(CODE_ALIGN) * CODE_ALIGN;
        unit.entry = self.next_addr.fetch_add(reserved, Ordering::Relaxed);
        let unit = Arc::new(unit);
        self.total_size.fetch_add(unit.size, Ordering::Relaxed);
        if let Some(old) = self.units.insert(unit.func_id, unit.clone()) {
            self.total_size.fetch_sub(old.size, Ordering::Relaxed);
        }
        self.insertions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(func = %unit.full_name, entry = unit.entry, size = unit.size, "published unit");
        unit
    }

    /// Unit of function `func_id`.
    #[inline]
    pub fn lookup(&self, func_id: u64) -> Option<Arc<CompiledUnit>> {
        let result = self.units.get(&func_id).map(|u| u.value().clone());
        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Whether function `func_id` has a unit, without touching statistics.
    #[inline]
    pub fn contains(&self, func_id: u64) -> bool {
        self.units.contains_key(&func_id)
    }

    /// Unpublish the unit of `func_id`. Running activations keep their own
    /// reference and finish in it.
    pub fn remove(&self, func_id: u64) -> Option<Arc<CompiledUnit>> {
        let (_, unit) = self.units.remove(&func_id)?;
        self.total_size.fetch_sub(unit.size, Ordering::Relaxed);
        self.removals.fetch_add(1, Ordering::Relaxed);
        Some(unit)
    }

    /// Unit whose code contains `addr`.
    pub fn find_by_address(&self, addr: usize) -> Option<Arc<CompiledUnit>> {
        self.units
            .iter()
            .find(|u| u.value().contains_address(addr))
            .map(|u| u.value().clone())
    }

    /// Number of published units.
    #[inline]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether no unit is published.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Bytes of published code.
    #[inline]
    pub fn total_size(&self) -> usize {
        self.total_size.load(Ordering::Relaxed)
    }

    /// Snapshot of every published unit.
    pub fn units(&self) -> Vec<Arc<CompiledUnit>> {
        self.units.iter().map(|u| u.value().clone()).collect()
    }

    /// Unpublish everything.
    pub fn clear(&self) {
        let n = self.units.len() as u64;
        self.units.clear();
        self.total_size.store(0, Ordering::Relaxed);
        self.removals.fetch_add(n, Ordering::Relaxed);
    }

    /// Current statistics.
    pub fn stats(&self) -> CodeCacheStats {
        CodeCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{Compiler, CompilerConfig};
    use ember_bytecode::FunctionBuilder;
    use ember_runtime::{DictObject, FunctionObject};

    fn unit(name: &str) -> CompiledUnit {
        let mut b = FunctionBuilder::new(name);
        b.load_int(1);
        b.return_value();
        let func = Arc::new(FunctionObject::new(
            Arc::new(b.finish().unwrap()),
            Arc::new(DictObject::new()),
            Arc::new(DictObject::new()),
        ));
        Compiler::new(CompilerConfig::default()).compile(&func).unwrap()
    }

    #[test]
    fn test_publish_and_lookup() {
        let cache = CodeCache::new();
        let a = cache.publish(unit("a"));
        let b = cache.publish(unit("b"));
        assert_ne!(a.entry, b.entry);
        assert_eq!(a.entry % CODE_ALIGN, 0);
        assert!(Arc::ptr_eq(&cache.lookup(a.func_id).unwrap(), &a));
        assert!(cache.lookup(12345678).is_none());
        assert!(Arc::ptr_eq(&cache.find_by_address(b.entry).unwrap(), &b));
        assert_eq!(cache.total_size(), a.size + b.size);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.insertions), (1, 1, 2));
    }

    #[test]
    fn test_remove_keeps_running_reference() {
        let cache = CodeCache::new();
        let a = cache.publish(unit("a"));
        let removed = cache.remove(a.func_id).unwrap();
        assert!(Arc::ptr_eq(&removed, &a));
        assert!(!cache.contains(a.func_id));
        assert_eq!(cache.total_size(), 0);
        assert_eq!(a.code.len(), removed.code.len());
    }
}
