//! Deferred finalizers.
//!
//! Dropping the last reference to an object whose class defines `__del__`
//! must not run user code at the drop site (which may be in the middle of a
//! frame transition). The object is revived and queued here instead; the
//! VM drains the queue at its next safepoint.

use crate::value::Value;
use std::cell::RefCell;

/// A revived object waiting for its `__del__` call.
#[derive(Debug)]
pub struct PendingFinalizer {
    /// The revived object.
    pub object: Value,
    /// The `__del__` attribute found on its class.
    pub method: Value,
}

thread_local! {
    static PENDING: RefCell<Vec<PendingFinalizer>> = const { RefCell::new(Vec::new()) };
}

/// Queue a finalizer on the current thread.
pub fn enqueue(object: Value, method: Value) {
    // During thread teardown the queue is gone; the object is dropped quietly.
    let _ = PENDING.try_with(|q| q.borrow_mut().push(PendingFinalizer { object, method }));
}

/// Take every queued finalizer.
pub fn take_pending() -> Vec<PendingFinalizer> {
    PENDING
        .try_with(|q| std::mem::take(&mut *q.borrow_mut()))
        .unwrap_or_default()
}

/// Whether any finalizer is queued.
#[inline]
pub fn has_pending() -> bool {
    PENDING
        .try_with(|q| !q.borrow().is_empty())
        .unwrap_or(false)
}
