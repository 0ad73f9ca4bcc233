//! Register storage for suspended compiled generators.
//!
//! A compiled generator keeps its whole register file alive across a
//! suspension. The buffers come from per-thread free lists bucketed by
//! power-of-two size class so yield/resume cycles do not allocate.
//!
//! ```text
//! class 0 (≤8 words)   ──▶ [Vec, Vec, ...]
//! class 1 (≤16 words)  ──▶ [Vec, ...]
//! ...
//! class 7 (≤1024 words) ──▶ []
//! larger               ──▶ plain heap allocation, never pooled
//! ```
//!
//! Buffers are cleared before they go back on a free list, so a retained
//! buffer never keeps a value alive and a heap traversal of a recycled
//! buffer visits nothing.
//!
//! The pool is NOT thread-safe; each thread owns one.

use crate::executor::Word;
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};

// =============================================================================
// Constants
// =============================================================================

/// Capacity of the smallest size class.
const MIN_CLASS_SIZE: usize = 8;

/// Number of size classes (8 words up to 1024 words).
const NUM_CLASSES: usize = 8;

/// Maximum buffers retained per class.
const MAX_PER_CLASS: usize = 32;

// =============================================================================
// Pool Statistics
// =============================================================================

/// Statistics for monitoring pool behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers handed out.
    pub allocations: u64,
    /// Buffers returned.
    pub releases: u64,
    /// Allocations served from a free list.
    pub pool_hits: u64,
    /// Allocations that needed a fresh buffer.
    pub pool_misses: u64,
    /// Returned buffers dropped because their class was full.
    pub evictions: u64,
    /// Requests larger than the biggest class.
    pub oversized: u64,
    /// Buffers currently retained.
    pub retained: usize,
}

// =============================================================================
// Spill Pool
// =============================================================================

/// Size-classed free lists of register buffers.
#[derive(Debug)]
pub struct SpillPool {
    classes: [Vec<Vec<Word>>; NUM_CLASSES],
    stats: PoolStats,
}

impl Default for SpillPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Size class serving `len` words, if any.
#[inline]
fn size_class(len: usize) -> Option<usize> {
    let cap = len.max(MIN_CLASS_SIZE).next_power_of_two();
    let idx = (cap.trailing_zeros() - MIN_CLASS_SIZE.trailing_zeros()) as usize;
    (idx < NUM_CLASSES).then_some(idx)
}

#[inline]
fn class_capacity(class: usize) -> usize {
    MIN_CLASS_SIZE << class
}

impl SpillPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            classes: Default::default(),
            stats: PoolStats::default(),
        }
    }

    /// A buffer of `len` empty words.
    pub fn acquire(&mut self, len: usize) -> Vec<Word> {
        self.stats.allocations += 1;
        let Some(class) = size_class(len) else {
            self.stats.oversized += 1;
            self.stats.pool_misses += 1;
            return vec![Word::Empty; len];
        };
        let mut buf = match self.classes[class].pop() {
            Some(buf) => {
                self.stats.pool_hits += 1;
                self.stats.retained -= 1;
                buf
            }
            None => {
                self.stats.pool_misses += 1;
                Vec::with_capacity(class_capacity(class))
            }
        };
        buf.resize(len, Word::Empty);
        buf
    }

    /// Return a buffer. It must already be empty.
    fn recycle(&mut self, buf: Vec<Word>) {
        debug_assert!(buf.is_empty());
        self.stats.releases += 1;
        let class = size_class(buf.capacity()).filter(|&c| class_capacity(c) == buf.capacity());
        match class {
            Some(c) if self.classes[c].len() < MAX_PER_CLASS => {
                self.classes[c].push(buf);
                self.stats.retained += 1;
            }
            _ => self.stats.evictions += 1,
        }
    }

    /// Statistics snapshot.
    #[inline]
    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Whether every retained buffer is empty.
    pub fn is_clean(&self) -> bool {
        self.classes.iter().flatten().all(Vec::is_empty)
    }
}

thread_local! {
    static POOL: RefCell<SpillPool> = RefCell::new(SpillPool::new());
}

/// Take a buffer of `len` empty words from this thread's pool.
pub fn acquire(len: usize) -> Vec<Word> {
    POOL.try_with(|p| p.borrow_mut().acquire(len))
        .unwrap_or_else(|_| vec![Word::Empty; len])
}

/// Clear `buf` and return it to this thread's pool.
pub fn release(mut buf: Vec<Word>) {
    // Dropping values may queue finalizers but never re-enters the pool
    // while it is borrowed.
    buf.clear();
    let _ = POOL.try_with(|p| p.borrow_mut().recycle(buf));
}

/// Statistics of this thread's pool.
pub fn stats() -> PoolStats {
    POOL.try_with(|p| p.borrow().stats()).unwrap_or_default()
}

/// Whether this thread's retained buffers are all empty.
pub fn is_clean() -> bool {
    POOL.try_with(|p| p.borrow().is_clean()).unwrap_or(true)
}

// =============================================================================
// Spilled Registers
// =============================================================================

/// A register file borrowed from the pool; returned on drop.
#[derive(Debug)]
pub struct SpillRegs(Vec<Word>);

impl SpillRegs {
    /// Acquire `len` empty words.
    pub fn acquire(len: usize) -> Self {
        Self(acquire(len))
    }
}

impl Deref for SpillRegs {
    type Target = [Word];

    #[inline]
    fn deref(&self) -> &[Word] {
        &self.0
    }
}

impl DerefMut for SpillRegs {
    #[inline]
    fn deref_mut(&mut self) -> &mut [Word] {
        &mut self.0
    }
}

impl Drop for SpillRegs {
    fn drop(&mut self) {
        release(std::mem::take(&mut self.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_runtime::Value;

    #[test]
    fn test_size_classes() {
        assert_eq!(size_class(0), Some(0));
        assert_eq!(size_class(8), Some(0));
        assert_eq!(size_class(9), Some(1));
        assert_eq!(size_class(1024), Some(7));
        assert_eq!(size_class(1025), None);
    }

    #[test]
    fn test_reuse_and_clearing() {
        let mut pool = SpillPool::new();
        let mut buf = pool.acquire(5);
        assert_eq!(buf.len(), 5);
        buf[2] = Word::Obj(Value::str("live"));
        buf.clear();
        pool.recycle(buf);
        assert!(pool.is_clean());

        let again = pool.acquire(7);
        assert!(again.iter().all(|w| matches!(w, Word::Empty)));
        let stats = pool.stats();
        assert_eq!(stats.pool_hits, 1);
        assert_eq!(stats.pool_misses, 1);
        assert_eq!(stats.retained, 0);
    }

    #[test]
    fn test_class_limit_evicts() {
        let mut pool = SpillPool::new();
        let bufs: Vec<_> = (0..MAX_PER_CLASS + 2).map(|_| pool.acquire(3)).collect();
        for mut b in bufs {
            b.clear();
            pool.recycle(b);
        }
        let stats = pool.stats();
        assert_eq!(stats.retained, MAX_PER_CLASS);
        assert_eq!(stats.evictions, 2);
    }

    #[test]
    fn test_spill_regs_return_cleared() {
        {
            let mut regs = SpillRegs::acquire(12);
            regs[0] = Word::Obj(Value::new_list(vec![Value::Int(1)]));
        }
        assert!(is_clean());
        assert!(stats().retained >= 1);
    }
}
