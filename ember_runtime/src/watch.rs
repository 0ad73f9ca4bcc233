//! Dict watch registry.
//!
//! Subscribers register interest in a dict and are called after every
//! mutation of it. The global cache uses this to keep cached global values
//! coherent without checking dict versions on the fast path.

use crate::object::DictObject;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::{Arc, OnceLock, Weak};

/// A mutation of a watched dict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictEvent<'a> {
    /// A string key was inserted or overwritten.
    Set(&'a str),
    /// A string key was removed.
    Deleted(&'a str),
    /// Every key was removed.
    Cleared,
    /// A non-string key was inserted; the dict will never notify again.
    Unwatchable,
    /// The dict was deallocated.
    Dropped,
}

/// Subscriber to dict mutations.
pub trait DictWatcher: Send + Sync {
    /// Called after the mutation is visible. Must not block on the dict.
    fn dict_changed(&self, dict_id: u64, event: &DictEvent<'_>);
}

type Watchers = SmallVec<[Weak<dyn DictWatcher>; 2]>;

fn registry() -> &'static RwLock<FxHashMap<u64, Watchers>> {
    static REGISTRY: OnceLock<RwLock<FxHashMap<u64, Watchers>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(FxHashMap::default()))
}

/// Subscribe `watcher` to `dict`. Returns `false` when the dict is
/// unwatchable.
pub fn watch(dict: &DictObject, watcher: &Arc<dyn DictWatcher>) -> bool {
    if !dict.is_watchable() {
        return false;
    }
    let weak = Arc::downgrade(watcher);
    let mut reg = registry().write();
    let entry = reg.entry(dict.id()).or_default();
    entry.retain(|w| w.strong_count() > 0);
    if !entry.iter().any(|w| Weak::ptr_eq(w, &weak)) {
        entry.push(weak);
    }
    dict.set_watched(true);
    true
}

/// Unsubscribe `watcher` from `dict`.
pub fn unwatch(dict: &DictObject, watcher: &Arc<dyn DictWatcher>) {
    let weak = Arc::downgrade(watcher);
    let mut reg = registry().write();
    if let Some(entry) = reg.get_mut(&dict.id()) {
        entry.retain(|w| w.strong_count() > 0 && !Weak::ptr_eq(w, &weak));
        if entry.is_empty() {
            reg.remove(&dict.id());
            dict.set_watched(false);
        }
    }
}

fn subscribers(dict_id: u64) -> Watchers {
    registry()
        .read()
        .get(&dict_id)
        .cloned()
        .unwrap_or_default()
}

pub(crate) fn notify(dict: &DictObject, event: &DictEvent<'_>) {
    // Callbacks run without the registry lock so they may re-subscribe.
    for watcher in subscribers(dict.id()) {
        if let Some(watcher) = watcher.upgrade() {
            watcher.dict_changed(dict.id(), event);
        }
    }
    if *event == DictEvent::Unwatchable {
        registry().write().remove(&dict.id());
        dict.set_watched(false);
    }
}

pub(crate) fn forget(dict_id: u64) {
    let watchers = registry().write().remove(&dict_id).unwrap_or_default();
    for watcher in watchers {
        if let Some(watcher) = watcher.upgrade() {
            watcher.dict_changed(dict_id, &DictEvent::Dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl DictWatcher for Recorder {
        fn dict_changed(&self, _dict_id: u64, event: &DictEvent<'_>) {
            self.events.lock().push(format!("{:?}", event));
        }
    }

    #[test]
    fn test_events_are_delivered() {
        let rec = Arc::new(Recorder::default());
        let watcher: Arc<dyn DictWatcher> = rec.clone();
        let dict = DictObject::new();
        assert!(watch(&dict, &watcher));
        assert!(watch(&dict, &watcher));
        dict.set_str("a", Value::Int(1));
        dict.del_str("a");
        dict.clear();
        drop(dict);
        assert_eq!(
            *rec.events.lock(),
            ["Set(\"a\")", "Deleted(\"a\")", "Cleared", "Dropped"]
        );
    }

    #[test]
    fn test_non_string_key_makes_unwatchable() {
        let rec = Arc::new(Recorder::default());
        let watcher: Arc<dyn DictWatcher> = rec.clone();
        let dict = DictObject::new();
        assert!(watch(&dict, &watcher));
        dict.set(Value::Int(1), Value::None).unwrap();
        assert!(!dict.is_watched());
        assert!(!watch(&dict, &watcher));
        dict.set_str("b", Value::None);
        assert_eq!(*rec.events.lock(), ["Unwatchable"]);
    }

    #[test]
    fn test_unwatch() {
        let rec = Arc::new(Recorder::default());
        let watcher: Arc<dyn DictWatcher> = rec.clone();
        let dict = DictObject::new();
        watch(&dict, &watcher);
        unwatch(&dict, &watcher);
        dict.set_str("a", Value::None);
        assert!(rec.events.lock().is_empty());
    }
}
