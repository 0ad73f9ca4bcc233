//! Dictionary object implementation.
//!
//! Dicts come in two layouts:
//!
//! ```text
//! Split (instance dicts)                 Combined (everything else)
//! ┌───────────────────────────┐          ┌──────────────────────────────┐
//! │ keys ──▶ SharedKeys (type) │          │ entries: [(key, value)?, ..] │
//! │          ["x", "y", "z"]   │          │ index:   DictKey -> slot     │
//! │ values: [1, 2]            │          └──────────────────────────────┘
//! └───────────────────────────┘
//! ```
//!
//! A split dict contains key `k` iff `k`'s index in the shared layout is
//! below `values.len()`. Deleting a key, inserting a key that does not fit
//! the shared layout, or inserting a non-string key converts the dict to the
//! combined layout for good.
//!
//! Every mutation bumps the dict's version. Dicts registered with the watch
//! registry notify their subscribers after the mutation is visible.

use crate::exception::{PyErr, PyResult};
use crate::object::next_object_id;
use crate::value::Value;
use crate::watch::{self, DictEvent};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Maximum number of keys in a shared layout.
pub const MAX_SHARED_KEYS: usize = 30;

static NEXT_DICT_VERSION: AtomicU64 = AtomicU64::new(1);

#[inline]
fn next_dict_version() -> u64 {
    NEXT_DICT_VERSION.fetch_add(1, Ordering::Relaxed)
}

// =============================================================================
// Keys
// =============================================================================

/// Hashable projection of a key value.
///
/// Numerically equal keys (`1`, `1.0`, `True`) project to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DictKey {
    None,
    Int(i64),
    Float(u64),
    Str(Arc<str>),
    Tuple(Box<[DictKey]>),
    /// Identity-hashed object.
    Identity(usize),
}

impl DictKey {
    /// Project a value to a key, failing for unhashable values.
    pub fn from_value(value: &Value) -> PyResult<DictKey> {
        Ok(match value {
            Value::None => DictKey::None,
            Value::Bool(b) => DictKey::Int(*b as i64),
            Value::Int(i) => DictKey::Int(*i),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() && f.abs() < 9.0e15 {
                    DictKey::Int(*f as i64)
                } else {
                    DictKey::Float(f.to_bits())
                }
            }
            Value::Str(s) => DictKey::Str(s.clone()),
            Value::Tuple(items) => DictKey::Tuple(
                items
                    .iter()
                    .map(DictKey::from_value)
                    .collect::<PyResult<Vec<_>>>()?
                    .into_boxed_slice(),
            ),
            Value::List(_) | Value::Dict(_) => {
                return Err(PyErr::type_error(format!(
                    "unhashable type: '{}'",
                    value.type_name()
                )))
            }
            other => DictKey::Identity(other.identity()),
        })
    }
}

/// Key layout shared by the split dicts of one type's instances.
///
/// Append-only: an index, once assigned, always names the same key.
pub struct SharedKeys {
    id: u64,
    inner: RwLock<SharedKeysInner>,
}

#[derive(Default)]
struct SharedKeysInner {
    names: Vec<Arc<str>>,
    index: FxHashMap<Arc<str>, usize>,
}

impl SharedKeys {
    /// Create an empty layout.
    pub fn new() -> Self {
        Self {
            id: next_object_id(),
            inner: RwLock::new(SharedKeysInner::default()),
        }
    }

    /// Layout identity.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Index of `key` in the layout.
    #[inline]
    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.inner.read().index.get(key).copied()
    }

    /// Number of keys in the layout.
    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    /// Whether the layout is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Key at `index`.
    pub fn key_at(&self, index: usize) -> Option<Arc<str>> {
        self.inner.read().names.get(index).cloned()
    }

    /// Append `key` if the layout currently has exactly `expected_len` keys.
    fn try_append(&self, key: &str, expected_len: usize) -> Option<usize> {
        let mut inner = self.inner.write();
        if let Some(&idx) = inner.index.get(key) {
            return Some(idx);
        }
        if inner.names.len() != expected_len || expected_len >= MAX_SHARED_KEYS {
            return None;
        }
        let key: Arc<str> = Arc::from(key);
        inner.names.push(key.clone());
        inner.index.insert(key, expected_len);
        Some(expected_len)
    }
}

impl Default for SharedKeys {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SharedKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.inner.read().names.iter()).finish()
    }
}

// =============================================================================
// Storage
// =============================================================================

enum DictStorage {
    Split {
        keys: Arc<SharedKeys>,
        values: Vec<Value>,
    },
    Combined(CombinedTable),
}

#[derive(Default)]
struct CombinedTable {
    entries: Vec<Option<(Value, Value)>>,
    index: FxHashMap<DictKey, usize>,
    len: usize,
}

impl CombinedTable {
    fn get(&self, key: &DictKey) -> Option<&Value> {
        let slot = *self.index.get(key)?;
        self.entries[slot].as_ref().map(|(_, v)| v)
    }

    fn insert(&mut self, key: DictKey, key_value: Value, value: Value) -> Option<Value> {
        if let Some(&slot) = self.index.get(&key) {
            if let Some((_, old)) = &mut self.entries[slot] {
                return Some(std::mem::replace(old, value));
            }
        }
        self.index.insert(key, self.entries.len());
        self.entries.push(Some((key_value, value)));
        self.len += 1;
        None
    }

    fn remove(&mut self, key: &DictKey) -> Option<(Value, Value)> {
        let slot = self.index.remove(key)?;
        let removed = self.entries[slot].take();
        self.len -= 1;
        if self.entries.len() > 16 && self.len * 2 < self.entries.len() {
            self.compact();
        }
        removed
    }

    fn compact(&mut self) {
        let entries: Vec<_> = std::mem::take(&mut self.entries)
            .into_iter()
            .flatten()
            .collect();
        self.index.clear();
        for (slot, (k, _)) in entries.iter().enumerate() {
            if let Ok(key) = DictKey::from_value(k) {
                self.index.insert(key, slot);
            }
        }
        self.entries = entries.into_iter().map(Some).collect();
    }

    fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter().flatten()
    }
}

// =============================================================================
// Dictionary Object
// =============================================================================

/// Insertion-ordered dict.
pub struct DictObject {
    id: u64,
    storage: RwLock<DictStorage>,
    version: AtomicU64,
    watched: AtomicBool,
    /// Cleared for good once a non-string key is inserted.
    watchable: AtomicBool,
}

impl DictObject {
    /// Create an empty combined dict.
    pub fn new() -> Self {
        Self::with_storage(DictStorage::Combined(CombinedTable::default()))
    }

    /// Create an empty split dict sharing `keys`.
    pub fn new_split(keys: Arc<SharedKeys>) -> Self {
        Self::with_storage(DictStorage::Split {
            keys,
            values: Vec::new(),
        })
    }

    fn with_storage(storage: DictStorage) -> Self {
        Self {
            id: next_object_id(),
            storage: RwLock::new(storage),
            version: AtomicU64::new(next_dict_version()),
            watched: AtomicBool::new(false),
            watchable: AtomicBool::new(true),
        }
    }

    /// Build a combined dict from string-keyed pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        let dict = Self::new();
        for (k, v) in pairs {
            dict.set_str(k, v);
        }
        dict
    }

    /// Unique identity.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current version; changes on every mutation.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Whether the dict can still be watched.
    #[inline]
    pub fn is_watchable(&self) -> bool {
        self.watchable.load(Ordering::Acquire)
    }

    /// Whether the dict has subscribers in the watch registry.
    #[inline]
    pub fn is_watched(&self) -> bool {
        self.watched.load(Ordering::Acquire)
    }

    pub(crate) fn set_watched(&self, watched: bool) {
        self.watched.store(watched, Ordering::Release);
    }

    /// Whether the dict uses the split layout.
    pub fn is_split(&self) -> bool {
        matches!(&*self.storage.read(), DictStorage::Split { .. })
    }

    /// Shared keys of a split dict.
    pub fn split_keys(&self) -> Option<Arc<SharedKeys>> {
        match &*self.storage.read() {
            DictStorage::Split { keys, .. } => Some(keys.clone()),
            DictStorage::Combined(_) => None,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        match &*self.storage.read() {
            DictStorage::Split { values, .. } => values.len(),
            DictStorage::Combined(table) => table.len,
        }
    }

    /// Whether the dict is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Look up a string key.
    pub fn get_str(&self, key: &str) -> Option<Value> {
        match &*self.storage.read() {
            DictStorage::Split { keys, values } => {
                keys.index_of(key).and_then(|i| values.get(i).cloned())
            }
            DictStorage::Combined(table) => table.get(&DictKey::Str(Arc::from(key))).cloned(),
        }
    }

    /// Whether a string key is present.
    pub fn contains_str(&self, key: &str) -> bool {
        self.get_str(key).is_some()
    }

    /// Look up an arbitrary key.
    pub fn get(&self, key: &Value) -> PyResult<Option<Value>> {
        if let Value::Str(s) = key {
            return Ok(self.get_str(s));
        }
        let key = DictKey::from_value(key)?;
        Ok(match &*self.storage.read() {
            DictStorage::Split { .. } => None,
            DictStorage::Combined(table) => table.get(&key).cloned(),
        })
    }

    /// Value at `index` of a split dict using layout `keys_id`.
    ///
    /// Returns `None` if the dict is no longer split with that layout or the
    /// slot is not populated.
    #[inline]
    pub fn split_value(&self, keys_id: u64, index: usize) -> Option<Value> {
        match &*self.storage.read() {
            DictStorage::Split { keys, values } if keys.id() == keys_id => values.get(index).cloned(),
            _ => None,
        }
    }

    /// Snapshot of the keys.
    pub fn keys(&self) -> Vec<Value> {
        self.items().into_iter().map(|(k, _)| k).collect()
    }

    /// Snapshot of the values.
    pub fn values(&self) -> Vec<Value> {
        self.items().into_iter().map(|(_, v)| v).collect()
    }

    /// Snapshot of the entries in insertion order.
    pub fn items(&self) -> Vec<(Value, Value)> {
        match &*self.storage.read() {
            DictStorage::Split { keys, values } => values
                .iter()
                .enumerate()
                .filter_map(|(i, v)| keys.key_at(i).map(|k| (Value::Str(k), v.clone())))
                .collect(),
            DictStorage::Combined(table) => table.iter().cloned().collect(),
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Set a string key.
    pub fn set_str(&self, key: &str, value: Value) {
        let old = {
            let mut storage = self.storage.write();
            let old = Self::insert_str(&mut storage, key, value);
            self.bump();
            old
        };
        drop(old);
        self.notify(DictEvent::Set(key));
    }

    fn insert_str(storage: &mut DictStorage, key: &str, value: Value) -> Option<Value> {
        if let DictStorage::Split { keys, values } = storage {
            match keys.index_of(key) {
                Some(i) if i < values.len() => {
                    return Some(std::mem::replace(&mut values[i], value));
                }
                Some(i) if i == values.len() => {
                    values.push(value);
                    return None;
                }
                Some(_) => {}
                None => {
                    if let Some(i) = keys.try_append(key, values.len()) {
                        if i == values.len() {
                            values.push(value);
                            return None;
                        }
                    }
                }
            }
            Self::make_combined(storage);
        }
        match storage {
            DictStorage::Combined(table) => {
                let key: Arc<str> = Arc::from(key);
                table.insert(DictKey::Str(key.clone()), Value::Str(key), value)
            }
            DictStorage::Split { .. } => None,
        }
    }

    fn make_combined(storage: &mut DictStorage) {
        if let DictStorage::Split { keys, values } = storage {
            let mut table = CombinedTable::default();
            for (i, v) in std::mem::take(values).into_iter().enumerate() {
                if let Some(k) = keys.key_at(i) {
                    table.insert(DictKey::Str(k.clone()), Value::Str(k), v);
                }
            }
            *storage = DictStorage::Combined(table);
        }
    }

    /// Set an arbitrary key.
    pub fn set(&self, key: Value, value: Value) -> PyResult<()> {
        if let Value::Str(s) = &key {
            self.set_str(s, value);
            return Ok(());
        }
        let dict_key = DictKey::from_value(&key)?;
        let old = {
            let mut storage = self.storage.write();
            Self::make_combined(&mut storage);
            let old = match &mut *storage {
                DictStorage::Combined(table) => table.insert(dict_key, key, value),
                DictStorage::Split { .. } => None,
            };
            self.bump();
            old
        };
        drop(old);
        if self.watchable.swap(false, Ordering::AcqRel) {
            self.notify(DictEvent::Unwatchable);
        }
        Ok(())
    }

    /// Remove a string key; returns whether it was present.
    pub fn del_str(&self, key: &str) -> bool {
        let removed = {
            let mut storage = self.storage.write();
            if !matches!(&*storage, DictStorage::Combined(_)) {
                let present = match &*storage {
                    DictStorage::Split { keys, values } => {
                        keys.index_of(key).map_or(false, |i| i < values.len())
                    }
                    DictStorage::Combined(_) => false,
                };
                if !present {
                    return false;
                }
                Self::make_combined(&mut storage);
            }
            let removed = match &mut *storage {
                DictStorage::Combined(table) => table.remove(&DictKey::Str(Arc::from(key))),
                DictStorage::Split { .. } => None,
            };
            if removed.is_some() {
                self.bump();
            }
            removed
        };
        let present = removed.is_some();
        drop(removed);
        if present {
            self.notify(DictEvent::Deleted(key));
        }
        present
    }

    /// Remove an arbitrary key; returns whether it was present.
    pub fn del(&self, key: &Value) -> PyResult<bool> {
        if let Value::Str(s) = key {
            return Ok(self.del_str(s));
        }
        let dict_key = DictKey::from_value(key)?;
        let removed = {
            let mut storage = self.storage.write();
            let removed = match &mut *storage {
                DictStorage::Combined(table) => table.remove(&dict_key),
                DictStorage::Split { .. } => None,
            };
            if removed.is_some() {
                self.bump();
            }
            removed
        };
        Ok(removed.is_some())
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let old = {
            let mut storage = self.storage.write();
            let old = std::mem::replace(&mut *storage, DictStorage::Combined(CombinedTable::default()));
            self.bump();
            old
        };
        drop(old);
        self.notify(DictEvent::Cleared);
    }

    #[inline]
    fn bump(&self) {
        self.version.store(next_dict_version(), Ordering::Release);
    }

    #[inline]
    fn notify(&self, event: DictEvent<'_>) {
        if self.watched.load(Ordering::Acquire) {
            watch::notify(self, &event);
        }
    }
}

impl Default for DictObject {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DictObject {
    fn drop(&mut self) {
        if *self.watched.get_mut() {
            watch::forget(self.id);
        }
    }
}

impl fmt::Debug for DictObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<dict id={} len={}>", self.id, self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_insert_and_lookup() {
        let d = DictObject::new();
        d.set_str("a", Value::Int(1));
        d.set(Value::Int(2), Value::Int(3)).unwrap();
        assert!(matches!(d.get_str("a"), Some(Value::Int(1))));
        assert!(matches!(d.get(&Value::Float(2.0)).unwrap(), Some(Value::Int(3))));
        assert!(matches!(d.get(&Value::Bool(true)).unwrap(), None));
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn test_split_dicts_share_layout() {
        let keys = Arc::new(SharedKeys::new());
        let a = DictObject::new_split(keys.clone());
        let b = DictObject::new_split(keys.clone());
        a.set_str("x", Value::Int(1));
        a.set_str("y", Value::Int(2));
        b.set_str("x", Value::Int(10));
        assert!(a.is_split() && b.is_split());
        assert_eq!(keys.len(), 2);
        assert!(matches!(b.split_value(keys.id(), 0), Some(Value::Int(10))));
        assert!(b.split_value(keys.id(), 1).is_none());
    }

    #[test]
    fn test_split_out_of_order_insert_combines() {
        let keys = Arc::new(SharedKeys::new());
        let a = DictObject::new_split(keys.clone());
        a.set_str("x", Value::Int(1));
        a.set_str("y", Value::Int(2));
        let b = DictObject::new_split(keys.clone());
        b.set_str("y", Value::Int(3));
        assert!(!b.is_split());
        assert!(matches!(b.get_str("y"), Some(Value::Int(3))));
    }

    #[test]
    fn test_delete_combines() {
        let keys = Arc::new(SharedKeys::new());
        let a = DictObject::new_split(keys.clone());
        a.set_str("x", Value::Int(1));
        let version = a.version();
        assert!(a.del_str("x"));
        assert!(!a.is_split());
        assert!(a.split_value(keys.id(), 0).is_none());
        assert_ne!(a.version(), version);
        assert!(!a.del_str("x"));
    }

    #[test]
    fn test_non_string_key_makes_unwatchable() {
        let d = DictObject::new();
        d.set_str("a", Value::Int(1));
        assert!(d.is_watchable());
        d.set(Value::Int(42), Value::Int(42)).unwrap();
        assert!(!d.is_watchable());
    }

    #[test]
    fn test_unhashable_key() {
        let d = DictObject::new();
        let err = d.set(Value::new_list(vec![]), Value::None).unwrap_err();
        assert!(err.message().contains("unhashable"));
    }

    #[test]
    fn test_items_preserve_order() {
        let d = DictObject::new();
        for (i, k) in ["c", "a", "b"].iter().enumerate() {
            d.set_str(k, Value::Int(i as i64));
        }
        d.del_str("a");
        let keys: Vec<String> = d.keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, ["c", "b"]);
    }
}
