//! Inline caches for attribute loads, stores and method loads.
//!
//! Each `(code, bytecode offset)` site owns a small polymorphic cache behind
//! its own `RwLock`. An entry is guarded by the receiver type's identity and
//! version tag; a type's tag changes whenever it, a base, or its MRO
//! changes, so a stale entry can never match again. Entries that depend on
//! a descriptor also record the descriptor type's tag.
//!
//! | Trigger | Detected by |
//! |---------|-------------|
//! | `__dict__` reassignment | split-keys identity / live dict read |
//! | in-place dict mutation | live dict read, shadow check |
//! | split to combined transition | `split_value` rejects the keys id |
//! | `__bases__` reassignment | type version |
//! | method replaced on a base | type version (propagates to subclasses) |
//! | data descriptor added over a cached attribute | type version |
//! | descriptor type mutated | descriptor type version |
//! | instance attribute shadowing a class attribute | shadow check |
//!
//! A miss always runs the slow path in [`crate::attr`] and then reinstalls.

use crate::attr::{self, DescrKind};
use crate::vm::Vm;
use ember_bytecode::CodeObject;
use ember_runtime::{BoundMethod, Instance, PyResult, TypeObject, Value};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Entries per site before it goes megamorphic.
pub const POLY_IC_SIZE: usize = 4;

// =============================================================================
// Entries
// =============================================================================

/// What a hit does.
#[derive(Debug, Clone)]
enum Action {
    /// Value in slot `index` of a split dict with keys `keys_id`.
    SplitSlot { keys_id: u64, index: usize },
    /// Value in the instance dict, whatever its layout.
    InstanceDict,
    /// Class attribute not shadowed by the instance.
    ClassAttr(Value),
    /// Function on the type, bound to the receiver.
    Method(Value),
    /// Descriptor object on the type; a non-data one yields to the
    /// instance dict.
    Descriptor { descr: Value, data: bool },
    /// Store into the instance dict.
    StoreDict,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    type_id: u64,
    type_version: u64,
    /// Type id and version of a descriptor object the action relies on.
    descr_guard: Option<(u64, u64)>,
    action: Action,
}

#[derive(Debug, Default)]
struct SiteCache {
    entries: SmallVec<[CacheEntry; POLY_IC_SIZE]>,
    megamorphic: bool,
}

impl SiteCache {
    fn find(&self, class: &TypeObject) -> Option<&CacheEntry> {
        self.entries.iter().find(|e| e.type_id == class.id())
    }

    fn install(&mut self, entry: CacheEntry) {
        if let Some(slot) = self.entries.iter_mut().find(|e| e.type_id == entry.type_id) {
            *slot = entry;
        } else if self.entries.len() < POLY_IC_SIZE {
            self.entries.push(entry);
        } else {
            self.entries.clear();
            self.megamorphic = true;
        }
    }
}

/// Per-code-object cache table, one site per instruction.
#[derive(Debug)]
struct CodeCaches {
    sites: Box<[RwLock<SiteCache>]>,
}

impl CodeCaches {
    fn new(len: usize) -> Self {
        Self {
            sites: (0..len).map(|_| RwLock::new(SiteCache::default())).collect(),
        }
    }
}

fn caches(code: &CodeObject) -> Option<Arc<CodeCaches>> {
    code.extra
        .get_or_init(|| CodeCaches::new(code.instructions.len()))
}

// =============================================================================
// Statistics
// =============================================================================

/// Why a cached access missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MissReason {
    Uncached,
    WrongType,
    TypeModified,
    DescriptorModified,
    Shadowed,
    LayoutChanged,
    Megamorphic,
    Uncacheable,
}

impl MissReason {
    pub const fn name(self) -> &'static str {
        match self {
            MissReason::Uncached => "uncached",
            MissReason::WrongType => "wrong_type",
            MissReason::TypeModified => "type_modified",
            MissReason::DescriptorModified => "descriptor_modified",
            MissReason::Shadowed => "shadowed",
            MissReason::LayoutChanged => "layout_changed",
            MissReason::Megamorphic => "megamorphic",
            MissReason::Uncacheable => "uncacheable",
        }
    }
}

/// Kind of cached access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SiteKind {
    LoadAttr,
    StoreAttr,
    LoadMethod,
}

impl SiteKind {
    pub const fn name(self) -> &'static str {
        match self {
            SiteKind::LoadAttr => "load_attr",
            SiteKind::StoreAttr => "store_attr",
            SiteKind::LoadMethod => "load_method",
        }
    }
}

/// Hit and miss counters, reset on read.
#[derive(Debug, Default)]
pub struct IcStats {
    hits: AtomicU64,
    misses: Mutex<FxHashMap<(SiteKind, MissReason), u64>>,
}

impl IcStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self, kind: SiteKind, reason: MissReason) {
        *self.misses.lock().entry((kind, reason)).or_insert(0) += 1;
    }

    /// Hits since the last reset.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Misses of `kind` for `reason` since the last reset.
    pub fn misses(&self, kind: SiteKind, reason: MissReason) -> u64 {
        self.misses.lock().get(&(kind, reason)).copied().unwrap_or(0)
    }

    /// Take every counter.
    pub fn get_and_clear(&self) -> (u64, Vec<((SiteKind, MissReason), u64)>) {
        let hits = self.hits.swap(0, Ordering::Relaxed);
        let mut misses: Vec<_> = std::mem::take(&mut *self.misses.lock()).into_iter().collect();
        misses.sort();
        (hits, misses)
    }
}

// =============================================================================
// Guards
// =============================================================================

fn descr_guard(descr: &Value) -> Option<(u64, u64)> {
    match descr {
        Value::Instance(d) => {
            let class = d.class();
            Some((class.id(), class.version()))
        }
        _ => None,
    }
}

fn descr_guard_holds(entry: &CacheEntry, descr: &Value) -> bool {
    match (entry.descr_guard, descr) {
        (None, _) => true,
        (Some((id, version)), Value::Instance(d)) => {
            let class = d.class();
            class.id() == id && class.version() == version
        }
        (Some(_), _) => false,
    }
}

/// Check an entry's guards against `inst`; the action runs only on `Ok`.
fn check(entry: Option<&CacheEntry>, class: &TypeObject, megamorphic: bool) -> Result<CacheEntry, MissReason> {
    let Some(entry) = entry else {
        return Err(if megamorphic {
            MissReason::Megamorphic
        } else {
            MissReason::Uncached
        });
    };
    if entry.type_version != class.version() {
        return Err(MissReason::TypeModified);
    }
    Ok(entry.clone())
}

fn lookup_site(code: &CodeObject, offset: u32, class: &TypeObject) -> (Option<Arc<CodeCaches>>, Result<CacheEntry, MissReason>) {
    let Some(table) = caches(code) else {
        return (None, Err(MissReason::Uncacheable));
    };
    let result = match table.sites.get(offset as usize) {
        Some(site) => {
            let site = site.read();
            match site.find(class) {
                Some(e) => check(Some(e), class, site.megamorphic),
                None if site.entries.is_empty() => check(None, class, site.megamorphic),
                None => Err(MissReason::WrongType),
            }
        }
        None => Err(MissReason::Uncacheable),
    };
    (Some(table), result)
}

fn install(table: Option<Arc<CodeCaches>>, offset: u32, entry: CacheEntry) {
    let Some(table) = table else { return };
    if let Some(site) = table.sites.get(offset as usize) {
        let mut site = site.write();
        if site.megamorphic {
            return;
        }
        tracing::trace!(offset, type_id = entry.type_id, "inline cache install");
        site.install(entry);
    }
}

/// Cacheable action for reading `name` from `inst`, computed from the
/// current state. `None` when the access must stay on the slow path.
fn classify_load(inst: &Instance, class: &Arc<TypeObject>, name: &str) -> Option<(Action, Option<(u64, u64)>)> {
    if name.starts_with("__") || class.lookup("__getattr__").is_some() {
        return None;
    }
    let descr = class.lookup(name);
    match descr {
        Some(d) => match attr::descr_kind(&d) {
            DescrKind::Data => {
                let guard = descr_guard(&d);
                Some((Action::Descriptor { descr: d, data: true }, guard))
            }
            _ if inst.dict().contains_str(name) => Some((instance_action(inst, name), None)),
            DescrKind::NonData => match d {
                Value::Function(_) => Some((Action::Method(d), None)),
                Value::StaticMethod(s) => Some((Action::ClassAttr(s.func.clone()), None)),
                _ => {
                    let guard = descr_guard(&d);
                    Some((Action::Descriptor { descr: d, data: false }, guard))
                }
            },
            DescrKind::Plain => Some((Action::ClassAttr(d), None)),
        },
        None => Some((instance_action(inst, name), None)),
    }
}

fn instance_action(inst: &Instance, name: &str) -> Action {
    let dict = inst.dict();
    match dict.split_keys() {
        Some(keys) => match keys.index_of(name) {
            Some(index) => Action::SplitSlot {
                keys_id: keys.id(),
                index,
            },
            None => Action::InstanceDict,
        },
        None => Action::InstanceDict,
    }
}

/// Run a cached load action. `Err` means the entry no longer applies.
fn run_load(vm: &mut Vm, entry: &CacheEntry, obj: &Value, inst: &Instance, name: &str) -> Result<PyResult<Value>, MissReason> {
    match &entry.action {
        Action::SplitSlot { keys_id, index } => inst
            .dict()
            .split_value(*keys_id, *index)
            .map(Ok)
            .ok_or(MissReason::LayoutChanged),
        Action::InstanceDict => inst.dict().get_str(name).map(Ok).ok_or(MissReason::LayoutChanged),
        Action::ClassAttr(v) => {
            if inst.dict().contains_str(name) {
                Err(MissReason::Shadowed)
            } else {
                Ok(Ok(v.clone()))
            }
        }
        Action::Method(f) => {
            if inst.dict().contains_str(name) {
                Err(MissReason::Shadowed)
            } else {
                Ok(Ok(Value::BoundMethod(Arc::new(BoundMethod {
                    func: f.clone(),
                    receiver: obj.clone(),
                }))))
            }
        }
        Action::Descriptor { descr, data } => {
            if !descr_guard_holds(entry, descr) {
                return Err(MissReason::DescriptorModified);
            }
            if !*data && inst.dict().contains_str(name) {
                return Err(MissReason::Shadowed);
            }
            let class = inst.class();
            Ok(attr::bind(vm, descr, Some(obj), &class))
        }
        Action::StoreDict => Err(MissReason::WrongType),
    }
}

// =============================================================================
// Cached Operations
// =============================================================================

/// `LoadAttr` at `offset` of `code`.
pub fn load_attr(vm: &mut Vm, code: &CodeObject, offset: u32, obj: &Value, name: &str) -> PyResult<Value> {
    let Value::Instance(inst) = obj else {
        return attr::get_attr(vm, obj, name);
    };
    let class = inst.class();
    let stats = vm.runtime().ic_stats().clone();
    let (table, found) = lookup_site(code, offset, &class);
    let reason = match found {
        Ok(entry) => match run_load(vm, &entry, obj, inst, name) {
            Ok(result) => {
                stats.hit();
                return result;
            }
            Err(reason) => reason,
        },
        Err(reason) => reason,
    };
    stats.miss(SiteKind::LoadAttr, reason);
    // Read before the lookup so that a racing mutation invalidates the entry.
    let version = class.version();
    let value = attr::get_attr(vm, obj, name)?;
    if let Some((action, descr_guard)) = classify_load(inst, &class, name) {
        install(
            table,
            offset,
            CacheEntry {
                type_id: class.id(),
                type_version: version,
                descr_guard,
                action,
            },
        );
    }
    Ok(value)
}

/// `StoreAttr` at `offset` of `code`.
pub fn store_attr(vm: &mut Vm, code: &CodeObject, offset: u32, obj: &Value, name: &str, value: Value) -> PyResult<()> {
    let Value::Instance(inst) = obj else {
        return attr::set_attr(vm, obj, name, value);
    };
    let class = inst.class();
    let stats = vm.runtime().ic_stats().clone();
    let (table, found) = lookup_site(code, offset, &class);
    let reason = match found {
        Ok(CacheEntry {
            action: Action::StoreDict,
            ..
        }) => {
            stats.hit();
            inst.dict().set_str(name, value);
            return Ok(());
        }
        Ok(_) => MissReason::WrongType,
        Err(reason) => reason,
    };
    stats.miss(SiteKind::StoreAttr, reason);
    let version = class.version();
    attr::set_attr(vm, obj, name, value)?;
    let plain = !name.starts_with("__")
        && class
            .lookup(name)
            .map_or(true, |d| attr::descr_kind(&d) != DescrKind::Data);
    if plain {
        install(
            table,
            offset,
            CacheEntry {
                type_id: class.id(),
                type_version: version,
                descr_guard: None,
                action: Action::StoreDict,
            },
        );
    }
    Ok(())
}

/// `LoadMethod` at `offset` of `code`. Returns `(method, receiver)` or
/// `(Null, attribute)` like [`attr::load_method`].
pub fn load_method(vm: &mut Vm, code: &CodeObject, offset: u32, obj: &Value, name: &str) -> PyResult<(Value, Value)> {
    let Value::Instance(inst) = obj else {
        return attr::load_method(vm, obj, name);
    };
    let class = inst.class();
    let stats = vm.runtime().ic_stats().clone();
    let (table, found) = lookup_site(code, offset, &class);
    let reason = match found {
        Ok(entry) => match &entry.action {
            Action::Method(f) if !inst.dict().contains_str(name) => {
                stats.hit();
                return Ok((f.clone(), obj.clone()));
            }
            Action::Method(_) => MissReason::Shadowed,
            _ => match run_load(vm, &entry, obj, inst, name) {
                Ok(result) => {
                    stats.hit();
                    return result.map(|v| (Value::Null, v));
                }
                Err(reason) => reason,
            },
        },
        Err(reason) => reason,
    };
    stats.miss(SiteKind::LoadMethod, reason);
    let version = class.version();
    let result = attr::load_method(vm, obj, name)?;
    if let Some((action, descr_guard)) = classify_load(inst, &class, name) {
        install(
            table,
            offset,
            CacheEntry {
                type_id: class.id(),
                type_version: version,
                descr_guard,
                action,
            },
        );
    }
    Ok(result)
}

/// Number of entries at a site, for tests and introspection.
pub fn site_len(code: &CodeObject, offset: u32) -> usize {
    code.extra
        .get::<CodeCaches>()
        .and_then(|t| t.sites.get(offset as usize).map(|s| s.read().entries.len()))
        .unwrap_or(0)
}

/// Whether the site at `offset` gave up caching.
pub fn is_megamorphic(code: &CodeObject, offset: u32) -> bool {
    code.extra
        .get::<CodeCaches>()
        .and_then(|t| t.sites.get(offset as usize).map(|s| s.read().megamorphic))
        .unwrap_or(false)
}
