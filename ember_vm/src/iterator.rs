//! Native iterators over builtin sequences and ranges.

use ember_runtime::{builtin_types, ListObject, NativeObject, TypeObject, Value};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

#[derive(Debug)]
enum SeqSource {
    Tuple(Arc<[Value]>),
    /// Lists are iterated live, so appends during iteration are observed.
    List(Arc<ListObject>),
    Values(Vec<Value>),
}

/// Iterator over a tuple, list, string or dict keys.
#[derive(Debug)]
pub struct SeqIterator {
    source: SeqSource,
    index: Mutex<usize>,
}

impl SeqIterator {
    /// Iterator over a tuple.
    pub fn tuple(items: Arc<[Value]>) -> Self {
        Self::from_source(SeqSource::Tuple(items))
    }

    /// Iterator over a live list.
    pub fn list(list: Arc<ListObject>) -> Self {
        Self::from_source(SeqSource::List(list))
    }

    /// Iterator over a snapshot.
    pub fn values(items: Vec<Value>) -> Self {
        Self::from_source(SeqSource::Values(items))
    }

    fn from_source(source: SeqSource) -> Self {
        Self {
            source,
            index: Mutex::new(0),
        }
    }

    /// Next item, or `None` when exhausted.
    pub fn next_value(&self) -> Option<Value> {
        let mut index = self.index.lock();
        let item = match &self.source {
            SeqSource::Tuple(items) => items.get(*index).cloned(),
            SeqSource::List(list) => list.get(*index),
            SeqSource::Values(items) => items.get(*index).cloned(),
        }?;
        *index += 1;
        Some(item)
    }
}

impl NativeObject for SeqIterator {
    fn type_name(&self) -> &'static str {
        "iterator"
    }

    fn class(&self) -> Arc<TypeObject> {
        builtin_types().iterator.clone()
    }

    fn traverse(&self, visit: &mut dyn FnMut(&Value)) {
        match &self.source {
            SeqSource::Tuple(items) => items.iter().for_each(|v| visit(v)),
            SeqSource::List(list) => list.snapshot().iter().for_each(|v| visit(v)),
            SeqSource::Values(items) => items.iter().for_each(|v| visit(v)),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// `range(start, stop, step)` iterator.
#[derive(Debug)]
pub struct RangeIterator {
    state: Mutex<RangeState>,
}

#[derive(Debug, Clone, Copy)]
struct RangeState {
    next: i64,
    stop: i64,
    step: i64,
}

impl RangeIterator {
    /// Create a range. `step` must be non-zero.
    pub fn new(start: i64, stop: i64, step: i64) -> Self {
        Self {
            state: Mutex::new(RangeState {
                next: start,
                stop,
                step,
            }),
        }
    }

    /// Next integer, or `None` when exhausted.
    pub fn next_value(&self) -> Option<Value> {
        let mut s = self.state.lock();
        let live = if s.step > 0 { s.next < s.stop } else { s.next > s.stop };
        if !live {
            return None;
        }
        let current = s.next;
        match current.checked_add(s.step) {
            Some(n) => s.next = n,
            None => s.next = s.stop,
        }
        Some(Value::Int(current))
    }
}

impl NativeObject for RangeIterator {
    fn type_name(&self) -> &'static str {
        "range_iterator"
    }

    fn class(&self) -> Arc<TypeObject> {
        builtin_types().iterator.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_directions() {
        let up = RangeIterator::new(0, 3, 1);
        let items: Vec<_> = std::iter::from_fn(|| up.next_value()).collect();
        assert_eq!(items.len(), 3);
        let down = RangeIterator::new(3, 0, -2);
        let items: Vec<i64> = std::iter::from_fn(|| down.next_value())
            .filter_map(|v| v.as_int())
            .collect();
        assert_eq!(items, vec![3, 1]);
    }

    #[test]
    fn test_list_iteration_is_live() {
        let list = Arc::new(ListObject::new(vec![Value::Int(1)]));
        let it = SeqIterator::list(list.clone());
        assert!(it.next_value().is_some());
        list.push(Value::Int(2));
        assert_eq!(it.next_value().and_then(|v| v.as_int()), Some(2));
        assert!(it.next_value().is_none());
    }
}
