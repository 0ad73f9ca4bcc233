//! Instances of heap types.
//!
//! An instance owns a reassignable `__class__` and a reassignable
//! `__dict__`. New instances start with a split dict sharing their type's
//! key layout.
//!
//! # Finalization
//!
//! When the last reference to an instance whose class defines `__del__`
//! goes away, the instance is resurrected into the thread's pending
//! finalizer queue instead of running user code inside `Drop`. The VM
//! drains the queue at safepoints, so `__del__` never observes a
//! half-updated interpreter state and runs exactly once per instance.

use crate::exception::{PyErr, PyResult};
use crate::finalize;
use crate::object::class::{InstanceLayout, TypeObject};
use crate::object::dict::DictObject;
use crate::value::Value;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An instance of a heap type.
pub struct Instance {
    class: RwLock<Arc<TypeObject>>,
    dict: RwLock<Arc<DictObject>>,
    /// Set once `__del__` has been scheduled.
    finalized: AtomicBool,
}

impl Instance {
    /// Create an instance with an empty split dict.
    pub fn new(class: Arc<TypeObject>) -> Self {
        let dict = Arc::new(DictObject::new_split(class.shared_keys()));
        Self {
            class: RwLock::new(class),
            dict: RwLock::new(dict),
            finalized: AtomicBool::new(false),
        }
    }

    /// Current class.
    #[inline]
    pub fn class(&self) -> Arc<TypeObject> {
        self.class.read().clone()
    }

    /// Current attribute dict.
    #[inline]
    pub fn dict(&self) -> Arc<DictObject> {
        self.dict.read().clone()
    }

    /// Replace `__dict__`.
    pub fn set_dict(&self, dict: Arc<DictObject>) {
        let old = std::mem::replace(&mut *self.dict.write(), dict);
        drop(old);
    }

    /// Replace `__class__`.
    pub fn set_class(&self, class: Arc<TypeObject>) -> PyResult<()> {
        if class.layout() != InstanceLayout::Plain {
            return Err(PyErr::type_error(format!(
                "__class__ assignment only supported for heap types, not '{}'",
                class.name()
            )));
        }
        let old = std::mem::replace(&mut *self.class.write(), class);
        drop(old);
        Ok(())
    }

    /// Whether `__del__` already ran (or is scheduled).
    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if *self.finalized.get_mut() {
            return;
        }
        let class = self.class.get_mut().clone();
        let Some(del) = class.lookup("__del__") else {
            return;
        };
        let dict = std::mem::replace(self.dict.get_mut(), Arc::new(DictObject::new()));
        let revived = Arc::new(Instance {
            class: RwLock::new(class),
            dict: RwLock::new(dict),
            finalized: AtomicBool::new(true),
        });
        finalize::enqueue(Value::Instance(revived), del);
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} object>", self.class.read().name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::builtin_types;

    #[test]
    fn test_instances_share_split_layout() {
        let cls = TypeObject::new_class("Point", "test", vec![], vec![]).unwrap();
        let a = Instance::new(cls.clone());
        let b = Instance::new(cls.clone());
        a.dict().set_str("x", Value::Int(1));
        b.dict().set_str("x", Value::Int(2));
        let keys = a.dict().split_keys().unwrap();
        assert!(Arc::ptr_eq(&keys, &b.dict().split_keys().unwrap()));
    }

    #[test]
    fn test_del_is_queued_once() {
        let _ = finalize::take_pending();
        let del = Value::Str(Arc::from("marker"));
        let cls = TypeObject::new_class(
            "WithDel",
            "test",
            vec![],
            vec![(Arc::from("__del__"), del)],
        )
        .unwrap();
        let inst = Instance::new(cls);
        inst.dict().set_str("payload", Value::Int(7));
        drop(inst);

        let pending = finalize::take_pending();
        assert_eq!(pending.len(), 1);
        let Value::Instance(revived) = &pending[0].object else {
            panic!("expected instance");
        };
        assert!(revived.is_finalized());
        assert!(matches!(revived.dict().get_str("payload"), Some(Value::Int(7))));
        drop(pending);
        assert!(finalize::take_pending().is_empty());
    }

    #[test]
    fn test_set_class_rejects_builtin_layout() {
        let cls = TypeObject::new_class("A", "test", vec![], vec![]).unwrap();
        let inst = Instance::new(cls);
        assert!(inst.set_class(builtin_types().int.clone()).is_err());
    }
}
