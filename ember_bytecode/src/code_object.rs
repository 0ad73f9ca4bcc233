//! Code object representation for compiled functions.
//!
//! A `CodeObject` contains all the bytecode and metadata needed to execute
//! a function body. It is the fundamental unit of both interpretation and
//! JIT compilation.

use crate::opcode::{Instruction, LocalType, PrimitiveKind};
use bitflags::bitflags;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

static NEXT_CODE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique code object id.
#[inline]
pub(crate) fn next_code_id() -> u64 {
    NEXT_CODE_ID.fetch_add(1, Ordering::Relaxed)
}

bitflags! {
    /// Code object flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CodeFlags: u32 {
        /// Function uses *args.
        const VARARGS = 1 << 0;
        /// Function uses **kwargs.
        const VARKEYWORDS = 1 << 1;
        /// Function is a generator.
        const GENERATOR = 1 << 2;
        /// Function is a coroutine.
        const COROUTINE = 1 << 3;
        /// Function is an async generator.
        const ASYNC_GENERATOR = 1 << 4;
        /// Body was produced by the static compiler (primitive opcodes allowed).
        const STATIC = 1 << 5;
        /// This is module-level code.
        const MODULE = 1 << 6;
        /// Generator usable as an awaitable.
        const ITERABLE_COROUTINE = 1 << 7;
    }
}

/// Line table entry mapping instruction ranges to source lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTableEntry {
    /// Starting instruction index (inclusive).
    pub start_pc: u32,
    /// Ending instruction index (exclusive).
    pub end_pc: u32,
    /// Source line number.
    pub line: u32,
}

/// Calling convention of a function implemented in a native library.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NativeSignature {
    /// Library path or soname passed to the dynamic loader.
    pub library: Arc<str>,
    /// Exported symbol name.
    pub symbol: Arc<str>,
    /// Parameter representations.
    pub params: Box<[PrimitiveKind]>,
    /// Return representation.
    pub ret: PrimitiveKind,
}

impl NativeSignature {
    /// Create a new signature.
    pub fn new(
        library: impl Into<Arc<str>>,
        symbol: impl Into<Arc<str>>,
        params: impl Into<Box<[PrimitiveKind]>>,
        ret: PrimitiveKind,
    ) -> Self {
        Self {
            library: library.into(),
            symbol: symbol.into(),
            params: params.into(),
            ret,
        }
    }
}

/// Compile-time constant stored in a code object's constant pool.
#[derive(Debug, Clone)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Tuple(Arc<[Constant]>),
    Code(Arc<CodeObject>),
    Native(Arc<NativeSignature>),
}

impl Constant {
    /// Build a string constant.
    #[inline]
    pub fn str(s: &str) -> Self {
        Constant::Str(Arc::from(s))
    }
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::None, Constant::None) => true,
            (Constant::Bool(a), Constant::Bool(b)) => a == b,
            (Constant::Int(a), Constant::Int(b)) => a == b,
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (Constant::Str(a), Constant::Str(b)) => a == b,
            (Constant::Tuple(a), Constant::Tuple(b)) => a == b,
            (Constant::Code(a), Constant::Code(b)) => Arc::ptr_eq(a, b),
            (Constant::Native(a), Constant::Native(b)) => a == b,
            _ => false,
        }
    }
}

/// Per-code runtime slot owned by the VM (inline caches, hit counters).
///
/// The bytecode layer never inspects it; the VM installs its own state on
/// first execution.
#[derive(Default)]
pub struct CodeExtra(OnceLock<Arc<dyn Any + Send + Sync>>);

impl CodeExtra {
    /// Get the installed state, installing it with `init` on first use.
    pub fn get_or_init<T: Any + Send + Sync>(&self, init: impl FnOnce() -> T) -> Option<Arc<T>> {
        self.0
            .get_or_init(|| Arc::new(init()) as Arc<dyn Any + Send + Sync>)
            .clone()
            .downcast::<T>()
            .ok()
    }

    /// Get the installed state if present and of type `T`.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.0.get()?.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for CodeExtra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.get().is_some() {
            "CodeExtra(installed)"
        } else {
            "CodeExtra(empty)"
        })
    }
}

/// A compiled code object representing a function or module body.
///
/// Code objects are immutable once created and shared across threads
/// through `Arc`. They contain:
/// - Bytecode instructions
/// - Constant pool
/// - Name tables
/// - Declared local representations (static extension)
/// - Line table
#[derive(Debug)]
pub struct CodeObject {
    /// Process-unique identity.
    pub id: u64,

    /// Function name (or `<module>` for module-level code).
    pub name: Arc<str>,

    /// Qualified name (includes enclosing class/function names).
    pub qualname: Arc<str>,

    /// Filename where this code was defined.
    pub filename: Arc<str>,

    /// First line number in source.
    pub first_lineno: u32,

    /// Bytecode instructions.
    pub instructions: Box<[Instruction]>,

    /// Constant pool (indexed by LoadConst).
    pub constants: Box<[Constant]>,

    /// Local variable names; parameters come first.
    pub varnames: Box<[Arc<str>]>,

    /// Global/attribute name strings (indexed by LoadGlobal, LoadAttr, etc).
    pub names: Box<[Arc<str>]>,

    /// Declared representation of each local slot.
    pub local_types: Box<[LocalType]>,

    /// Declared representation of the return value.
    pub return_type: LocalType,

    /// Number of positional parameters.
    pub arg_count: u16,

    /// Number of positional-only parameters.
    pub posonlyarg_count: u16,

    /// Number of keyword-only parameters.
    pub kwonlyarg_count: u16,

    /// Maximum evaluation stack depth.
    pub stack_size: u32,

    /// Code flags.
    pub flags: CodeFlags,

    /// Line number table (instruction index -> line number).
    pub line_table: Box<[LineTableEntry]>,

    /// VM-owned runtime state.
    pub extra: CodeExtra,
}

impl CodeObject {
    /// Create a new empty code object.
    pub fn new(name: impl Into<Arc<str>>, filename: impl Into<Arc<str>>) -> Self {
        let name = name.into();
        CodeObject {
            id: next_code_id(),
            qualname: name.clone(),
            name,
            filename: filename.into(),
            first_lineno: 1,
            instructions: Box::new([]),
            constants: Box::new([]),
            varnames: Box::new([]),
            names: Box::new([]),
            local_types: Box::new([]),
            return_type: LocalType::Object,
            arg_count: 0,
            posonlyarg_count: 0,
            kwonlyarg_count: 0,
            stack_size: 0,
            flags: CodeFlags::empty(),
            line_table: Box::new([]),
            extra: CodeExtra::default(),
        }
    }

    /// Get the line number for a given instruction index.
    pub fn line_for_pc(&self, pc: u32) -> Option<u32> {
        let idx = self.line_table.partition_point(|entry| entry.end_pc <= pc);
        self.line_table
            .get(idx)
            .filter(|entry| entry.start_pc <= pc)
            .map(|entry| entry.line)
    }

    /// Line for an instruction, falling back to the first line.
    #[inline]
    pub fn line_or_first(&self, pc: u32) -> u32 {
        self.line_for_pc(pc).unwrap_or(self.first_lineno)
    }

    /// Number of local slots.
    #[inline]
    pub fn nlocals(&self) -> usize {
        self.varnames.len()
    }

    /// Declared representation of local `slot`.
    #[inline]
    pub fn local_type(&self, slot: usize) -> LocalType {
        self.local_types.get(slot).copied().unwrap_or_default()
    }

    /// Number of parameter slots, including `*args` and `**kwargs`.
    #[inline]
    pub fn param_slots(&self) -> usize {
        let mut n = self.arg_count as usize + self.kwonlyarg_count as usize;
        if self.flags.contains(CodeFlags::VARARGS) {
            n += 1;
        }
        if self.flags.contains(CodeFlags::VARKEYWORDS) {
            n += 1;
        }
        n
    }

    /// Check if this is a generator function.
    #[inline]
    pub fn is_generator(&self) -> bool {
        self.flags.contains(CodeFlags::GENERATOR)
    }

    /// Check if this is a coroutine.
    #[inline]
    pub fn is_coroutine(&self) -> bool {
        self.flags.contains(CodeFlags::COROUTINE)
    }

    /// Check if this is an async generator.
    #[inline]
    pub fn is_async_generator(&self) -> bool {
        self.flags.contains(CodeFlags::ASYNC_GENERATOR)
    }

    /// Whether calling this code produces a suspendable object.
    #[inline]
    pub fn is_resumable(&self) -> bool {
        self.flags
            .intersects(CodeFlags::GENERATOR | CodeFlags::COROUTINE | CodeFlags::ASYNC_GENERATOR)
    }

    /// Whether any local or the return value is declared primitive.
    pub fn has_primitive_signature(&self) -> bool {
        self.return_type.primitive().is_some()
            || self.local_types[..self.param_slots().min(self.local_types.len())]
                .iter()
                .any(|t| t.primitive().is_some())
    }
}

/// Disassemble a code object to a string.
pub fn disassemble(code: &CodeObject) -> String {
    use std::fmt::Write;

    let mut output = String::new();

    let _ = writeln!(output, "Code object: {}", code.qualname);
    let _ = writeln!(output, "  File: {}", code.filename);
    let _ = writeln!(output, "  First line: {}", code.first_lineno);
    let _ = writeln!(
        output,
        "  Args: {} (pos-only: {}, kw-only: {})",
        code.arg_count, code.posonlyarg_count, code.kwonlyarg_count
    );
    let _ = writeln!(output, "  Stack size: {}", code.stack_size);
    let _ = writeln!(output, "  Flags: {:?}", code.flags);

    if !code.constants.is_empty() {
        let _ = writeln!(output, "\nConstants:");
        for (i, c) in code.constants.iter().enumerate() {
            match c {
                Constant::Code(inner) => {
                    let _ = writeln!(output, "  {:4}: <code {}>", i, inner.qualname);
                }
                other => {
                    let _ = writeln!(output, "  {:4}: {:?}", i, other);
                }
            }
        }
    }

    if !code.names.is_empty() {
        let _ = writeln!(output, "\nNames:");
        for (i, n) in code.names.iter().enumerate() {
            let _ = writeln!(output, "  {:4}: {}", i, n);
        }
    }

    if !code.varnames.is_empty() {
        let _ = writeln!(output, "\nLocals:");
        for (i, l) in code.varnames.iter().enumerate() {
            let _ = writeln!(output, "  {:4}: {} ({:?})", i, l, code.local_type(i));
        }
    }

    let _ = writeln!(output, "\nDisassembly:");
    for (i, inst) in code.instructions.iter().enumerate() {
        let line = code.line_for_pc(i as u32);
        let line_str = line.map_or("    ".to_string(), |l| format!("{:4}", l));
        let _ = writeln!(output, "{} {:4}: {}", line_str, i, inst);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_flags() {
        let flags = CodeFlags::GENERATOR | CodeFlags::STATIC;
        assert!(flags.contains(CodeFlags::GENERATOR));
        assert!(flags.contains(CodeFlags::STATIC));
        assert!(!flags.contains(CodeFlags::COROUTINE));
    }

    #[test]
    fn test_code_object_new() {
        let code = CodeObject::new("test_func", "test.py");
        assert_eq!(&*code.name, "test_func");
        assert_eq!(&*code.filename, "test.py");
        assert_eq!(code.instructions.len(), 0);
        assert_ne!(code.id, CodeObject::new("other", "test.py").id);
    }

    #[test]
    fn test_line_table_lookup() {
        let mut code = CodeObject::new("test", "test.py");
        code.line_table = vec![
            LineTableEntry {
                start_pc: 0,
                end_pc: 5,
                line: 10,
            },
            LineTableEntry {
                start_pc: 5,
                end_pc: 10,
                line: 15,
            },
        ]
        .into_boxed_slice();

        assert_eq!(code.line_for_pc(0), Some(10));
        assert_eq!(code.line_for_pc(4), Some(10));
        assert_eq!(code.line_for_pc(5), Some(15));
        assert_eq!(code.line_for_pc(9), Some(15));
        assert_eq!(code.line_for_pc(10), None);
        assert_eq!(code.line_or_first(10), 1);
    }

    #[test]
    fn test_code_extra_installs_once() {
        let code = CodeObject::new("test", "test.py");
        assert!(code.extra.get::<u32>().is_none());
        let first = code.extra.get_or_init(|| 7u32).unwrap();
        let second = code.extra.get_or_init(|| 9u32).unwrap();
        assert_eq!(*first, 7);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(code.extra.get::<String>().is_none());
    }
}
