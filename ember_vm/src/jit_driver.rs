//! Compilation policy.
//!
//! ```text
//!  call ──▶ JIT enabled? ──no──▶ interpreter
//!              │ yes
//!              ▼
//!          code cache ──hit──▶ compiled unit
//!              │ miss
//!              ▼
//!   suppressed / not jittable? ──yes──▶ interpreter
//!              │ no
//!              ▼
//!     call count ≥ threshold? ──no──▶ interpreter
//!              │ yes
//!              ▼
//!          compile ──refused──▶ interpreter (permanent refusals are remembered)
//!              │
//!              ▼
//!     publish + perf map ──▶ compiled unit
//! ```
//!
//! Disabling the JIT only affects calls that start afterwards: activations
//! already running keep their unit alive and run it to completion.
//! `precompile_all` compiles every live registered function on a pool of
//! scoped worker threads; functions that died since registration are
//! skipped.

use crate::config::{ConfigError, JitConfig};
use dashmap::DashMap;
use ember_jit::{CodeCache, CompileError, CompileResult, CompiledUnit, Compiler, InlineStats, JitList, PerfMap};
use ember_runtime::{FunctionFlags, FunctionObject};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Registrations between sweeps of dead functions.
const SWEEP_INTERVAL: usize = 1024;

/// Outcome of a batch compilation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub compiled: usize,
    pub refused: usize,
    /// Targets destroyed before their turn.
    pub dead: usize,
}

/// Decides what to compile and when, and owns the published units.
#[derive(Debug)]
pub struct JitDriver {
    compiler: Compiler,
    cache: CodeCache,
    perf_map: Option<PerfMap>,
    enabled: AtomicBool,
    threshold: u32,
    batch_workers: usize,
    call_counts: DashMap<u64, u32>,
    inline_stats: DashMap<u64, InlineStats>,
    functions: Mutex<Vec<Weak<FunctionObject>>>,
    registrations: AtomicUsize,
}

impl JitDriver {
    pub fn new(config: &JitConfig) -> Result<Self, ConfigError> {
        let compiler = Compiler::new(config.compiler_config()?);
        let perf_map = config.perf_map.then(|| PerfMap::new(config.perf_map_dir.clone()));
        Ok(Self {
            compiler,
            cache: CodeCache::new(),
            perf_map,
            enabled: AtomicBool::new(config.enabled),
            threshold: config.compile_threshold.max(1),
            batch_workers: config.batch_workers.max(1),
            call_counts: DashMap::new(),
            inline_stats: DashMap::new(),
            functions: Mutex::new(Vec::new()),
            registrations: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Published units.
    #[inline]
    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    pub fn perf_map(&self) -> Option<&PerfMap> {
        self.perf_map.as_ref()
    }

    /// The list restricting compilation, if one was loaded.
    pub fn jit_list(&self) -> Option<&JitList> {
        self.compiler.config().jit_list.as_deref()
    }

    /// Track `func` for batch compilation.
    pub fn register(&self, func: &Arc<FunctionObject>) {
        let mut functions = self.functions.lock();
        functions.push(Arc::downgrade(func));
        if self.registrations.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            functions.retain(|f| f.strong_count() > 0);
        }
    }

    /// Unit to run for a call of `func`, compiling it when it became hot.
    pub fn unit_for_call(&self, func: &Arc<FunctionObject>) -> Option<Arc<CompiledUnit>> {
        if !self.is_enabled() {
            return None;
        }
        if let Some(unit) = self.cache.lookup(func.id()) {
            return Some(unit);
        }
        if func
            .flags()
            .intersects(FunctionFlags::JIT_SUPPRESSED | FunctionFlags::NOT_JITTABLE)
            || func.native().is_some()
        {
            return None;
        }
        let count = {
            let mut count = self.call_counts.entry(func.id()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        if count < self.threshold {
            return None;
        }
        self.compile(func).ok()
    }

    /// Compile and publish `func`, replacing any existing unit.
    pub fn compile(&self, func: &Arc<FunctionObject>) -> CompileResult<Arc<CompiledUnit>> {
        self.call_counts.remove(&func.id());
        let unit = self.compiler.compile(func)?;
        self.inline_stats.insert(func.id(), unit.inline_stats.clone());
        let unit = self.cache.publish(unit);
        if let Some(perf_map) = &self.perf_map {
            if let Err(err) = perf_map.record(&unit) {
                tracing::warn!(error = %err, path = %perf_map.path().display(), "cannot write perf map");
            }
        }
        tracing::debug!(
            func = %unit.full_name,
            size = unit.size,
            inlined = unit.inline_stats.num_inlined,
            "compiled"
        );
        Ok(unit)
    }

    /// Compile `func` now, unless it is already compiled. `false` when the
    /// JIT is disabled or the function is refused.
    pub fn force_compile(&self, func: &Arc<FunctionObject>) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.cache.contains(func.id()) || self.compile(func).is_ok()
    }

    #[inline]
    pub fn is_compiled(&self, func: &FunctionObject) -> bool {
        self.cache.contains(func.id())
    }

    /// Drop the unit of `func`. Running activations finish in it; the next
    /// call interprets and may compile again.
    pub fn deopt_function(&self, func: &FunctionObject) -> bool {
        self.call_counts.remove(&func.id());
        let removed = self.cache.remove(func.id()).is_some();
        if removed {
            tracing::debug!(func = %func.full_name(), "dropped compiled unit");
        }
        removed
    }

    /// Never compile `func`.
    pub fn suppress(&self, func: &FunctionObject) {
        func.add_flags(FunctionFlags::JIT_SUPPRESSED);
        self.deopt_function(func);
    }

    #[inline]
    pub fn is_suppressed(&self, func: &FunctionObject) -> bool {
        func.flags().contains(FunctionFlags::JIT_SUPPRESSED)
    }

    /// Stop compiling and stop entering compiled code. With `deopt_all`
    /// every published unit is dropped as well.
    pub fn disable(&self, deopt_all: bool) {
        self.enabled.store(false, Ordering::Release);
        if deopt_all {
            self.cache.clear();
            self.call_counts.clear();
        }
        tracing::debug!(deopt_all, "JIT disabled");
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
        tracing::debug!("JIT enabled");
    }

    /// Call sites inlined into the last unit compiled for `func`.
    pub fn num_inlined(&self, func: &FunctionObject) -> usize {
        self.inline_stats
            .get(&func.id())
            .map_or(0, |s| s.num_inlined)
    }

    /// Inlining record of the last unit compiled for `func`.
    pub fn inline_stats(&self, func: &FunctionObject) -> Option<InlineStats> {
        self.inline_stats.get(&func.id()).map(|s| s.value().clone())
    }

    /// Functions with a published unit, ordered by name.
    pub fn compiled_functions(&self) -> Vec<Arc<FunctionObject>> {
        let mut funcs: Vec<_> = self
            .cache
            .units()
            .iter()
            .map(|u| u.function().clone())
            .collect();
        funcs.sort_by(|a, b| a.full_name().cmp(&b.full_name()));
        funcs
    }

    /// Qualified names of every code object compiled code refers to,
    /// reading each unit's line and inline tables so they are resident.
    pub fn page_in_profiler_dependencies(&self) -> Vec<String> {
        let mut names = Vec::new();
        for unit in self.cache.units() {
            for pc in 0..unit.code.len() {
                for loc in unit.locations(pc) {
                    names.push(loc.code.qualname.to_string());
                }
            }
            names.extend(unit.inline_frames.iter().map(|f| f.code.qualname.to_string()));
            names.push(unit.code_object().qualname.to_string());
        }
        names.sort();
        names.dedup();
        names
    }

    /// Compile every live registered function on `workers` threads
    /// (the configured count when `None`).
    pub fn precompile_all(&self, workers: Option<usize>) -> BatchStats {
        let targets: Vec<Weak<FunctionObject>> = {
            let mut functions = self.functions.lock();
            functions.retain(|f| f.strong_count() > 0);
            functions.clone()
        };
        let workers = workers.unwrap_or(self.batch_workers).clamp(1, targets.len().max(1));
        tracing::debug!(targets = targets.len(), workers, "batch compile");

        let next = AtomicUsize::new(0);
        let totals = Mutex::new(BatchStats::default());
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    let mut stats = BatchStats::default();
                    loop {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        let Some(target) = targets.get(i) else { break };
                        match self.compile_target(target) {
                            Ok(()) => stats.compiled += 1,
                            Err(CompileError::TargetDestroyed) => stats.dead += 1,
                            Err(_) => stats.refused += 1,
                        }
                    }
                    let mut totals = totals.lock();
                    totals.compiled += stats.compiled;
                    totals.refused += stats.refused;
                    totals.dead += stats.dead;
                });
            }
        });
        let totals = totals.into_inner();
        tracing::debug!(
            compiled = totals.compiled,
            refused = totals.refused,
            dead = totals.dead,
            "batch compile finished"
        );
        totals
    }

    fn compile_target(&self, target: &Weak<FunctionObject>) -> CompileResult<()> {
        let func = target.upgrade().ok_or(CompileError::TargetDestroyed)?;
        if self.cache.contains(func.id()) {
            return Ok(());
        }
        self.compile(&func).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_bytecode::FunctionBuilder;
    use ember_runtime::DictObject;

    fn function(name: &str) -> Arc<FunctionObject> {
        let mut b = FunctionBuilder::new(name);
        b.load_int(1);
        b.return_value();
        Arc::new(FunctionObject::new(
            Arc::new(b.finish().unwrap()),
            Arc::new(DictObject::new()),
            Arc::new(DictObject::new()),
        ))
    }

    fn driver(config: JitConfig) -> JitDriver {
        JitDriver::new(&config).unwrap()
    }

    #[test]
    fn test_threshold() {
        let d = driver(JitConfig {
            compile_threshold: 3,
            ..JitConfig::enabled()
        });
        let f = function("f");
        assert!(d.unit_for_call(&f).is_none());
        assert!(d.unit_for_call(&f).is_none());
        assert!(d.unit_for_call(&f).is_some());
        assert!(d.is_compiled(&f));
    }

    #[test]
    fn test_disabled_never_compiles() {
        let d = driver(JitConfig::default());
        let f = function("f");
        assert!(d.unit_for_call(&f).is_none());
        assert!(!d.force_compile(&f));
        assert!(!d.is_compiled(&f));
    }

    #[test]
    fn test_suppress_drops_unit() {
        let d = driver(JitConfig::enabled());
        let f = function("f");
        assert!(d.force_compile(&f));
        d.suppress(&f);
        assert!(!d.is_compiled(&f));
        assert!(d.is_suppressed(&f));
        assert!(d.unit_for_call(&f).is_none());
    }

    #[test]
    fn test_disable_keeps_units_unless_deopt_all() {
        let d = driver(JitConfig::enabled());
        let f = function("f");
        d.force_compile(&f);
        d.disable(false);
        assert!(d.is_compiled(&f));
        assert!(d.unit_for_call(&f).is_none());
        d.enable();
        assert!(d.unit_for_call(&f).is_some());
        d.disable(true);
        assert!(!d.is_compiled(&f));
    }

    #[test]
    fn test_precompile_skips_dead_functions() {
        let d = driver(JitConfig::enabled());
        let live: Vec<_> = (0..6).map(|i| function(&format!("f{}", i))).collect();
        for f in &live {
            d.register(f);
        }
        let dead = function("dead");
        d.register(&dead);
        drop(dead);
        let stats = d.precompile_all(Some(3));
        assert_eq!(stats.compiled, 6);
        assert!(live.iter().all(|f| d.is_compiled(f)));
        assert_eq!(d.compiled_functions().len(), 6);
    }

    #[test]
    fn test_perf_map_written() {
        let dir = tempfile::tempdir().unwrap();
        let d = driver(JitConfig {
            perf_map: true,
            perf_map_dir: dir.path().to_path_buf(),
            ..JitConfig::enabled()
        });
        let f = function("mapped");
        d.force_compile(&f);
        let text = std::fs::read_to_string(d.perf_map().unwrap().path()).unwrap();
        assert!(text.contains("__main__:mapped"));
    }
}
