//! Calls into native libraries.
//!
//! A function declared with a [`NativeSignature`] has no bytecode body; it
//! is invoked through `InvokeNative` with unboxed primitive arguments. The
//! library is opened with `dlopen` on first use (an empty library name
//! means the running process) and the symbol address is cached.
//!
//! Arguments are passed by register class: `int64`/`bool` arguments fill
//! the integer argument registers in order and `double` arguments fill the
//! floating-point ones. On the supported targets (System V x86-64 and
//! AArch64) that assignment does not depend on how the two classes are
//! interleaved, so one call shape covers every signature that fits in
//! registers.

use crate::executor::Word;
use ember_bytecode::{NativeSignature, PrimitiveKind};
use ember_runtime::{PyErr, PyResult};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use thiserror::Error;

/// Integer argument registers available to a native call.
pub const MAX_INT_ARGS: usize = 6;

/// Floating-point argument registers available to a native call.
pub const MAX_FLOAT_ARGS: usize = 8;

/// Failure to bind a native function.
#[derive(Debug, Error)]
pub enum NativeError {
    #[error("cannot load native library '{library}': {reason}")]
    LibraryNotFound { library: String, reason: String },

    #[error("native library '{library}' has no symbol '{symbol}'")]
    SymbolNotFound { library: String, symbol: String },

    #[error("unsupported native signature for '{symbol}': {reason}")]
    UnsupportedSignature { symbol: String, reason: String },
}

impl From<NativeError> for PyErr {
    fn from(err: NativeError) -> Self {
        match err {
            NativeError::UnsupportedSignature { .. } => PyErr::type_error(err.to_string()),
            _ => PyErr::import_error(err.to_string()),
        }
    }
}

/// Loaded libraries and resolved symbols, shared by every thread.
#[derive(Debug, Default)]
pub struct NativeLibraries {
    /// Library name to `dlopen` handle.
    handles: Mutex<FxHashMap<Arc<str>, usize>>,
    /// `(library, symbol)` to function address.
    symbols: Mutex<FxHashMap<(Arc<str>, Arc<str>), usize>>,
}

impl NativeLibraries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address of the function named by `sig`.
    pub fn resolve(&self, sig: &NativeSignature) -> Result<usize, NativeError> {
        let key = (sig.library.clone(), sig.symbol.clone());
        if let Some(&addr) = self.symbols.lock().get(&key) {
            return Ok(addr);
        }
        let handle = self.open(&sig.library)?;
        let addr = sys::symbol(handle, &sig.symbol).ok_or_else(|| NativeError::SymbolNotFound {
            library: sig.library.to_string(),
            symbol: sig.symbol.to_string(),
        })?;
        tracing::debug!(library = %sig.library, symbol = %sig.symbol, "resolved native symbol");
        self.symbols.lock().insert(key, addr);
        Ok(addr)
    }

    fn open(&self, library: &Arc<str>) -> Result<usize, NativeError> {
        let mut handles = self.handles.lock();
        if let Some(&handle) = handles.get(library) {
            return Ok(handle);
        }
        let handle = sys::open(library).map_err(|reason| NativeError::LibraryNotFound {
            library: library.to_string(),
            reason,
        })?;
        handles.insert(library.clone(), handle);
        Ok(handle)
    }

    /// Call the function named by `sig` with `args`.
    pub fn invoke(&self, sig: &NativeSignature, args: &[Word]) -> PyResult<Word> {
        if args.len() != sig.params.len() {
            return Err(PyErr::type_error(format!(
                "{}() takes {} arguments ({} given)",
                sig.symbol,
                sig.params.len(),
                args.len()
            )));
        }
        let mut ints: SmallVec<[i64; MAX_INT_ARGS]> = SmallVec::new();
        let mut floats: SmallVec<[f64; MAX_FLOAT_ARGS]> = SmallVec::new();
        for (i, (kind, word)) in sig.params.iter().zip(args).enumerate() {
            match (kind, word) {
                (PrimitiveKind::Int64, Word::I64(v)) => ints.push(*v),
                (PrimitiveKind::Bool, Word::Bool(b)) => ints.push(*b as i64),
                (PrimitiveKind::Float64, Word::F64(f)) => floats.push(*f),
                (kind, word) => {
                    return Err(PyErr::type_error(format!(
                        "{}() argument {}: expected {}, got {}",
                        sig.symbol,
                        i + 1,
                        kind.name(),
                        word.kind_name()
                    )))
                }
            }
        }
        if ints.len() > MAX_INT_ARGS || floats.len() > MAX_FLOAT_ARGS {
            return Err(NativeError::UnsupportedSignature {
                symbol: sig.symbol.to_string(),
                reason: "too many arguments to pass in registers".to_string(),
            }
            .into());
        }
        let addr = self.resolve(sig)?;
        sys::call(addr, &ints, &floats, sig.ret).ok_or_else(|| {
            NativeError::UnsupportedSignature {
                symbol: sig.symbol.to_string(),
                reason: "native calls are not supported on this target".to_string(),
            }
            .into()
        })
    }
}

#[cfg(unix)]
mod sys {
    use ember_bytecode::PrimitiveKind;
    use std::ffi::{CStr, CString};

    use crate::executor::Word;

    fn last_error() -> String {
        // SAFETY: dlerror returns null or a NUL-terminated thread-local string.
        unsafe {
            let msg = libc::dlerror();
            if msg.is_null() {
                "unknown error".to_string()
            } else {
                CStr::from_ptr(msg).to_string_lossy().into_owned()
            }
        }
    }

    pub(super) fn open(library: &str) -> Result<usize, String> {
        let name = if library.is_empty() {
            None
        } else {
            Some(CString::new(library).map_err(|e| e.to_string())?)
        };
        let ptr = name.as_ref().map_or(std::ptr::null(), |n| n.as_ptr());
        // SAFETY: `ptr` is null or a valid C string that outlives the call.
        let handle = unsafe { libc::dlopen(ptr, libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            Err(last_error())
        } else {
            Ok(handle as usize)
        }
    }

    pub(super) fn symbol(handle: usize, symbol: &str) -> Option<usize> {
        let name = CString::new(symbol).ok()?;
        // SAFETY: `handle` came from a successful dlopen and is never closed.
        let addr = unsafe { libc::dlsym(handle as *mut libc::c_void, name.as_ptr()) };
        (!addr.is_null()).then_some(addr as usize)
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    pub(super) fn call(addr: usize, ints: &[i64], floats: &[f64], ret: PrimitiveKind) -> Option<Word> {
        type IntFn = unsafe extern "C" fn(
            i64, i64, i64, i64, i64, i64,
            f64, f64, f64, f64, f64, f64, f64, f64,
        ) -> i64;
        type FloatFn = unsafe extern "C" fn(
            i64, i64, i64, i64, i64, i64,
            f64, f64, f64, f64, f64, f64, f64, f64,
        ) -> f64;

        let i = |n: usize| ints.get(n).copied().unwrap_or(0);
        let f = |n: usize| floats.get(n).copied().unwrap_or(0.0);
        // SAFETY: `addr` is a function whose integer and floating-point
        // parameters are exactly `ints` and `floats`; unused argument
        // registers are ignored by the callee.
        unsafe {
            match ret {
                PrimitiveKind::Float64 => {
                    let func: FloatFn = std::mem::transmute(addr);
                    Some(Word::F64(func(i(0), i(1), i(2), i(3), i(4), i(5), f(0), f(1), f(2), f(3), f(4), f(5), f(6), f(7))))
                }
                PrimitiveKind::Int64 | PrimitiveKind::Bool => {
                    let func: IntFn = std::mem::transmute(addr);
                    let r = func(i(0), i(1), i(2), i(3), i(4), i(5), f(0), f(1), f(2), f(3), f(4), f(5), f(6), f(7));
                    Some(match ret {
                        PrimitiveKind::Bool => Word::Bool(r as u8 != 0),
                        _ => Word::I64(r),
                    })
                }
            }
        }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub(super) fn call(_addr: usize, _ints: &[i64], _floats: &[f64], _ret: PrimitiveKind) -> Option<Word> {
        None
    }
}

#[cfg(not(unix))]
mod sys {
    use crate::executor::Word;
    use ember_bytecode::PrimitiveKind;

    pub(super) fn open(_library: &str) -> Result<usize, String> {
        Err("dynamic loading is not supported on this platform".to_string())
    }

    pub(super) fn symbol(_handle: usize, _symbol: &str) -> Option<usize> {
        None
    }

    pub(super) fn call(_addr: usize, _ints: &[i64], _floats: &[f64], _ret: PrimitiveKind) -> Option<Word> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(library: &str, symbol: &str, params: &[PrimitiveKind], ret: PrimitiveKind) -> NativeSignature {
        NativeSignature::new(library, symbol, params.to_vec(), ret)
    }

    #[cfg(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")))]
    #[test]
    fn test_labs_from_process() {
        let libs = NativeLibraries::new();
        let labs = sig("", "labs", &[PrimitiveKind::Int64], PrimitiveKind::Int64);
        let r = libs.invoke(&labs, &[Word::I64(-17)]).unwrap();
        assert!(matches!(r, Word::I64(17)));
    }

    #[test]
    fn test_argument_kind_mismatch() {
        let libs = NativeLibraries::new();
        let labs = sig("", "labs", &[PrimitiveKind::Int64], PrimitiveKind::Int64);
        let err = libs.invoke(&labs, &[Word::F64(1.0)]).unwrap_err();
        assert!(err.matches(&ember_runtime::builtin_types().type_error));
    }

    #[test]
    fn test_missing_library_is_import_error() {
        let libs = NativeLibraries::new();
        let f = sig("libdoes-not-exist.so", "f", &[], PrimitiveKind::Int64);
        let err = libs.invoke(&f, &[]).unwrap_err();
        assert!(err.matches(&ember_runtime::builtin_types().import_error));
    }
}
