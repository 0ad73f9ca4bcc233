//! Function and bound-method objects.

use crate::exception::{PyErr, PyResult};
use crate::object::dict::DictObject;
use crate::object::next_object_id;
use crate::value::Value;
use ember_bytecode::{CodeFlags, CodeObject, NativeSignature};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

bitflags::bitflags! {
    /// Per-function execution flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FunctionFlags: u32 {
        /// Never compile (set by `jit_suppress`).
        const JIT_SUPPRESSED = 1 << 0;
        /// The compiler refused this function; do not retry.
        const NOT_JITTABLE = 1 << 1;
        /// Run with a shadow-only frame and allow direct calls from compiled code.
        const SHADOW_FRAME = 1 << 2;
    }
}

/// Frame representation used for activations of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameMode {
    /// A frame object is allocated eagerly at entry.
    Normal,
    /// Only a shadow frame is pushed; the frame object is built on demand.
    Shadow,
}

/// A function: code plus the namespaces it executes in.
pub struct FunctionObject {
    id: u64,
    /// Body.
    pub code: Arc<CodeObject>,
    /// Module globals.
    pub globals: Arc<DictObject>,
    /// Builtins namespace.
    pub builtins: Arc<DictObject>,
    /// Qualified name.
    pub qualname: Arc<str>,
    /// Defining module name.
    pub module: Arc<str>,
    defaults: RwLock<Option<Arc<[Value]>>>,
    flags: AtomicU32,
    native: Option<Arc<NativeSignature>>,
}

impl FunctionObject {
    /// Create a function.
    pub fn new(
        code: Arc<CodeObject>,
        globals: Arc<DictObject>,
        builtins: Arc<DictObject>,
    ) -> Self {
        let module = match globals.get_str("__name__") {
            Some(Value::Str(name)) => name,
            _ => Arc::from("__main__"),
        };
        Self {
            id: next_object_id(),
            qualname: code.qualname.clone(),
            code,
            globals,
            builtins,
            module,
            defaults: RwLock::new(None),
            flags: AtomicU32::new(0),
            native: None,
        }
    }

    /// Create a function whose body lives in a native library.
    ///
    /// The parameters of `code` must be plain positional primitives matching
    /// `sig`.
    pub fn new_native(
        code: Arc<CodeObject>,
        globals: Arc<DictObject>,
        builtins: Arc<DictObject>,
        sig: Arc<NativeSignature>,
    ) -> PyResult<Self> {
        if code
            .flags
            .intersects(CodeFlags::VARARGS | CodeFlags::VARKEYWORDS)
        {
            return Err(PyErr::type_error(format!(
                "native function '{}' cannot take variadic arguments",
                code.qualname
            )));
        }
        if code.kwonlyarg_count > 0 || code.posonlyarg_count > 0 {
            return Err(PyErr::type_error(format!(
                "native function '{}' may only take plain positional parameters",
                code.qualname
            )));
        }
        if code.arg_count as usize != sig.params.len() {
            return Err(PyErr::type_error(format!(
                "native function '{}' declares {} parameters but its signature has {}",
                code.qualname,
                code.arg_count,
                sig.params.len()
            )));
        }
        for (slot, kind) in sig.params.iter().enumerate() {
            if code.local_type(slot).primitive() != Some(*kind) {
                return Err(PyErr::type_error(format!(
                    "native function '{}' parameter '{}' must be declared {}",
                    code.qualname,
                    code.varnames[slot],
                    kind.name()
                )));
            }
        }
        if code.return_type.primitive() != Some(sig.ret) {
            return Err(PyErr::type_error(format!(
                "native function '{}' must return {}",
                code.qualname,
                sig.ret.name()
            )));
        }
        let mut func = Self::new(code, globals, builtins);
        func.native = Some(sig);
        Ok(func)
    }

    /// Unique identity (never reused).
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Simple name.
    #[inline]
    pub fn name(&self) -> &Arc<str> {
        &self.code.name
    }

    /// `module:qualname`, the key used by JIT lists.
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.module, self.qualname)
    }

    /// Positional defaults.
    pub fn defaults(&self) -> Option<Arc<[Value]>> {
        self.defaults.read().clone()
    }

    /// Replace positional defaults.
    pub fn set_defaults(&self, defaults: Option<Arc<[Value]>>) {
        *self.defaults.write() = defaults.filter(|d| !d.is_empty());
    }

    /// Native signature, if the body is a native library symbol.
    #[inline]
    pub fn native(&self) -> Option<&Arc<NativeSignature>> {
        self.native.as_ref()
    }

    /// Current flags.
    #[inline]
    pub fn flags(&self) -> FunctionFlags {
        FunctionFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Set flags.
    #[inline]
    pub fn add_flags(&self, flags: FunctionFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clear flags.
    #[inline]
    pub fn remove_flags(&self, flags: FunctionFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Frame representation for activations.
    #[inline]
    pub fn frame_mode(&self) -> FrameMode {
        if self.flags().contains(FunctionFlags::SHADOW_FRAME) {
            FrameMode::Shadow
        } else {
            FrameMode::Normal
        }
    }
}

impl fmt::Debug for FunctionObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.qualname)
    }
}

/// A callable bound to a receiver.
#[derive(Debug, Clone)]
pub struct BoundMethod {
    /// Underlying callable.
    pub func: Value,
    /// Receiver passed as the first argument.
    pub receiver: Value,
}
