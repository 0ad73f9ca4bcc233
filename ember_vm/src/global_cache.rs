//! Cached global and builtin loads.
//!
//! A cached entry maps `(globals, builtins, name)` to the value the slow
//! path found. Both dicts are subscribed through the process-wide watch
//! registry, so a mutation removes exactly the entries that depend on the
//! mutated key:
//!
//! ```text
//! globals["x"] = 1 ──▶ DictEvent::Set("x") ──▶ drop entries (globals, *, "x")
//!                                                   and (*, globals, "x")
//! builtins[1] = 0  ──▶ DictEvent::Unwatchable ──▶ drop every entry of builtins;
//!                                                  loads stay on the slow path
//! ```
//!
//! Entries are only filled when neither dict changed while the slow path
//! ran. Lazy-import values are resolved at the load and never cached.

use crate::vm::Vm;
use ember_bytecode::CodeObject;
use ember_runtime::watch::{self, DictEvent, DictWatcher};
use ember_runtime::{DictObject, FunctionObject, LazyImport, PyErr, PyResult, Value};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GlobalKey {
    globals: u64,
    builtins: u64,
    name: Arc<str>,
}

impl GlobalKey {
    #[inline]
    fn depends_on(&self, dict_id: u64) -> bool {
        self.globals == dict_id || self.builtins == dict_id
    }
}

/// Counters of the global cache.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GlobalCacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Loads that could not be cached because a dict is unwatchable.
    pub unwatchable: u64,
    pub invalidations: u64,
}

/// Process-wide cache of global loads.
pub struct GlobalCacheManager {
    entries: RwLock<FxHashMap<GlobalKey, Value>>,
    this: Weak<GlobalCacheManager>,
    hits: AtomicU64,
    misses: AtomicU64,
    unwatchable: AtomicU64,
    invalidations: AtomicU64,
}

impl std::fmt::Debug for GlobalCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalCacheManager")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

impl GlobalCacheManager {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            entries: RwLock::new(FxHashMap::default()),
            this: this.clone(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            unwatchable: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        })
    }

    /// Cached value of `name`, if any.
    fn get(&self, key: &GlobalKey) -> Option<Value> {
        self.entries.read().get(key).cloned()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Whether `name` is cached for the given namespaces.
    pub fn is_cached(&self, globals: &DictObject, builtins: &DictObject, name: &str) -> bool {
        self.entries.read().contains_key(&GlobalKey {
            globals: globals.id(),
            builtins: builtins.id(),
            name: Arc::from(name),
        })
    }

    pub fn stats(&self) -> GlobalCacheStats {
        GlobalCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            unwatchable: self.unwatchable.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    /// Subscribe to both dicts; `false` when either cannot be watched.
    fn subscribe(&self, globals: &DictObject, builtins: &DictObject) -> bool {
        let Some(this) = self.this.upgrade() else {
            return false;
        };
        let watcher: Arc<dyn DictWatcher> = this;
        watch::watch(globals, &watcher) && watch::watch(builtins, &watcher)
    }

    fn fill(
        &self,
        key: GlobalKey,
        value: Value,
        globals: &DictObject,
        builtins: &DictObject,
        versions: (u64, u64),
    ) {
        if !self.subscribe(globals, builtins) {
            self.unwatchable.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut entries = self.entries.write();
        if (globals.version(), builtins.version()) == versions {
            tracing::trace!(name = %key.name, "global cache install");
            entries.insert(key, value);
        }
    }

    fn invalidate(&self, pred: impl Fn(&GlobalKey) -> bool) {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|k, _| !pred(k));
        let removed = before - entries.len();
        if removed > 0 {
            self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl DictWatcher for GlobalCacheManager {
    fn dict_changed(&self, dict_id: u64, event: &DictEvent<'_>) {
        match *event {
            DictEvent::Set(name) | DictEvent::Deleted(name) => {
                self.invalidate(|k| k.depends_on(dict_id) && &*k.name == name)
            }
            DictEvent::Cleared | DictEvent::Unwatchable | DictEvent::Dropped => {
                self.invalidate(|k| k.depends_on(dict_id))
            }
        }
    }
}

// =============================================================================
// Loads
// =============================================================================

fn name_error(name: &str) -> PyErr {
    PyErr::name_error(format!("name '{}' is not defined", name))
}

/// `LoadGlobal` of name index `name_index` in `code`, run by `func`.
pub fn load_global(
    vm: &mut Vm,
    func: &Arc<FunctionObject>,
    code: &Arc<CodeObject>,
    offset: u32,
    name_index: u32,
) -> PyResult<Value> {
    let Some(name) = code.names.get(name_index as usize) else {
        return Err(PyErr::runtime_error(format!(
            "bad name index {} at offset {}",
            name_index, offset
        )));
    };
    let manager = vm.runtime().globals().clone();
    let key = GlobalKey {
        globals: func.globals.id(),
        builtins: func.builtins.id(),
        name: name.clone(),
    };
    if let Some(value) = manager.get(&key) {
        manager.hits.fetch_add(1, Ordering::Relaxed);
        return Ok(value);
    }
    manager.misses.fetch_add(1, Ordering::Relaxed);

    let versions = (func.globals.version(), func.builtins.version());
    let value = func
        .globals
        .get_str(name)
        .or_else(|| func.builtins.get_str(name))
        .ok_or_else(|| name_error(name))?;
    if let Value::Lazy(lazy) = &value {
        return resolve_lazy(vm, &func.globals, name, lazy);
    }
    manager.fill(key, value.clone(), &func.globals, &func.builtins, versions);
    Ok(value)
}

/// `LoadName`: an uncached lookup in the function's namespaces.
pub fn load_name(vm: &mut Vm, func: &Arc<FunctionObject>, name: &str) -> PyResult<Value> {
    let value = func
        .globals
        .get_str(name)
        .or_else(|| func.builtins.get_str(name))
        .ok_or_else(|| name_error(name))?;
    match &value {
        Value::Lazy(lazy) => resolve_lazy(vm, &func.globals, name, lazy),
        _ => Ok(value),
    }
}

/// Run a lazy import and publish its result under `name`.
///
/// The binding is replaced only while it still holds the same lazy value,
/// so a loader that rebinds `name` itself wins.
pub fn resolve_lazy(
    vm: &mut Vm,
    globals: &DictObject,
    name: &str,
    lazy: &Arc<LazyImport>,
) -> PyResult<Value> {
    if let Some(value) = lazy.resolved() {
        return Ok(value);
    }
    tracing::debug!(name, module = %lazy.name, "resolving lazy import");
    let value = vm.call(&lazy.loader, vec![Value::Str(lazy.name.clone())])?;
    lazy.set_resolved(value.clone());
    let still_lazy = matches!(globals.get_str(name), Some(Value::Lazy(l)) if Arc::ptr_eq(&l, lazy));
    if still_lazy {
        globals.set_str(name, value.clone());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitConfig;
    use crate::vm::Runtime;
    use ember_bytecode::FunctionBuilder;

    fn reader(vm: &Vm, globals: &Arc<DictObject>, name: &str) -> Arc<FunctionObject> {
        let mut b = FunctionBuilder::new("read");
        b.load_global(name);
        b.return_value();
        vm.new_function(Arc::new(b.finish().unwrap()), globals.clone())
    }

    #[test]
    fn test_hit_after_first_load() {
        let mut vm = Vm::new(Runtime::new(JitConfig::default()).unwrap());
        let globals = Arc::new(DictObject::from_pairs([("x", Value::Int(1))]));
        let f = reader(&vm, &globals, "x");
        assert_eq!(vm.call_function(&f, vec![]).unwrap().as_int(), Some(1));
        assert!(vm.runtime().globals().is_cached(&globals, &f.builtins, "x"));
        assert_eq!(vm.call_function(&f, vec![]).unwrap().as_int(), Some(1));
        assert!(vm.runtime().globals().stats().hits >= 1);
    }

    #[test]
    fn test_set_invalidates() {
        let mut vm = Vm::new(Runtime::new(JitConfig::default()).unwrap());
        let globals = Arc::new(DictObject::from_pairs([("x", Value::Int(1))]));
        let f = reader(&vm, &globals, "x");
        vm.call_function(&f, vec![]).unwrap();
        globals.set_str("x", Value::Int(2));
        assert!(!vm.runtime().globals().is_cached(&globals, &f.builtins, "x"));
        assert_eq!(vm.call_function(&f, vec![]).unwrap().as_int(), Some(2));
    }

    #[test]
    fn test_missing_name() {
        let mut vm = Vm::new(Runtime::new(JitConfig::default()).unwrap());
        let globals = Arc::new(DictObject::new());
        let f = reader(&vm, &globals, "nope");
        let err = vm.call_function(&f, vec![]).unwrap_err();
        assert_eq!(err.message(), "name 'nope' is not defined");
    }

    #[test]
    fn test_unwatchable_globals_stay_uncached() {
        let mut vm = Vm::new(Runtime::new(JitConfig::default()).unwrap());
        let globals = Arc::new(DictObject::from_pairs([("x", Value::Int(1))]));
        globals.set(Value::Int(7), Value::None).unwrap();
        let f = reader(&vm, &globals, "x");
        assert_eq!(vm.call_function(&f, vec![]).unwrap().as_int(), Some(1));
        assert!(!vm.runtime().globals().is_cached(&globals, &f.builtins, "x"));
        assert!(vm.runtime().globals().stats().unwatchable >= 1);
    }
}
