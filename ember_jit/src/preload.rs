//! Compile-time snapshot of the globals a function reads.
//!
//! The compiler reads each `LoadGlobal` name once before lowering. A name
//! bound to a plain function becomes a statically known callee, which
//! enables inlining and direct calls behind an identity guard. Nothing is
//! baked into the generated code: the load still goes through the global
//! cache at run time and the guard checks the result.
//!
//! Lazy-import values are skipped. Resolving them runs arbitrary code,
//! which must happen at the program point of the load and no earlier.

use ember_bytecode::{CodeObject, Opcode};
use ember_runtime::{FunctionObject, Value};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Globals of one code object, resolved at compile time.
#[derive(Debug, Default)]
pub struct Preloader {
    functions: FxHashMap<u32, Arc<FunctionObject>>,
}

impl Preloader {
    /// Read every global loaded by `code` from `func`'s namespaces.
    pub fn new(func: &FunctionObject, code: &CodeObject) -> Self {
        let mut functions = FxHashMap::default();
        for inst in code.instructions.iter() {
            if inst.opcode != Opcode::LoadGlobal || functions.contains_key(&inst.arg) {
                continue;
            }
            let Some(name) = code.names.get(inst.arg as usize) else {
                continue;
            };
            let value = func
                .globals
                .get_str(name)
                .or_else(|| func.builtins.get_str(name));
            if let Some(Value::Function(callee)) = value {
                functions.insert(inst.arg, callee);
            }
        }
        Self { functions }
    }

    /// Function bound to name `name_index` when the snapshot was taken.
    #[inline]
    pub fn function(&self, name_index: u32) -> Option<&Arc<FunctionObject>> {
        self.functions.get(&name_index)
    }

    /// Number of names resolved to functions.
    #[inline]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether no name resolved to a function.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
