//! Function builder for bytecode emission.
//!
//! The `FunctionBuilder` provides a high-level API for constructing bytecode
//! with named locals, label resolution, constant deduplication and line
//! table bookkeeping.
//!
//! # Example
//! ```
//! use ember_bytecode::{BinOp, FunctionBuilder};
//!
//! let mut b = FunctionBuilder::new("add");
//! b.set_params(&["x", "y"]);
//! b.load_fast("x");
//! b.load_fast("y");
//! b.binary(BinOp::Add);
//! b.return_value();
//! let code = b.finish().unwrap();
//! assert_eq!(code.arg_count, 2);
//! ```

use crate::analysis::{max_stack_depth, stack_depths};
use crate::code_object::{
    next_code_id, CodeExtra, CodeFlags, CodeObject, Constant, LineTableEntry, NativeSignature,
};
use crate::error::BytecodeError;
use crate::opcode::{BinOp, CmpOp, Instruction, LocalType, Opcode, PrimitiveKind};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A label for jump targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// A forward reference to a label that needs patching.
#[derive(Debug)]
struct ForwardRef {
    /// Instruction index containing the jump.
    instruction_index: usize,
    /// The label being jumped to.
    label: Label,
}

/// Key type for constant deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstantKey {
    None,
    Bool(bool),
    Int(i64),
    /// Float bits for exact comparison.
    Float(u64),
    Str(Arc<str>),
}

impl ConstantKey {
    fn from_constant(value: &Constant) -> Option<Self> {
        // Only scalar constants are deduplicated.
        match value {
            Constant::None => Some(ConstantKey::None),
            Constant::Bool(b) => Some(ConstantKey::Bool(*b)),
            Constant::Int(i) => Some(ConstantKey::Int(*i)),
            Constant::Float(f) => Some(ConstantKey::Float(f.to_bits())),
            Constant::Str(s) => Some(ConstantKey::Str(s.clone())),
            _ => None,
        }
    }
}

/// Builder for constructing code objects.
pub struct FunctionBuilder {
    name: Arc<str>,
    qualname: Arc<str>,
    filename: Arc<str>,
    first_lineno: u32,
    current_line: u32,

    instructions: Vec<Instruction>,

    constants: Vec<Constant>,
    constant_map: FxHashMap<ConstantKey, u32>,

    varnames: Vec<Arc<str>>,
    local_map: FxHashMap<Arc<str>, u32>,
    local_types: Vec<LocalType>,
    return_type: LocalType,

    names: Vec<Arc<str>>,
    name_map: FxHashMap<Arc<str>, u32>,

    arg_count: u16,
    posonlyarg_count: u16,
    kwonlyarg_count: u16,
    /// Set once a non-parameter local has been defined.
    params_sealed: bool,
    param_error: Option<BytecodeError>,

    flags: CodeFlags,

    next_label: u32,
    labels: FxHashMap<Label, usize>,
    forward_refs: Vec<ForwardRef>,

    line_table: Vec<LineTableEntry>,
    line_start_pc: u32,
}

impl FunctionBuilder {
    /// Create a new function builder.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        let name = name.into();
        Self {
            qualname: name.clone(),
            name,
            filename: "<unknown>".into(),
            first_lineno: 1,
            current_line: 1,
            instructions: Vec::new(),
            constants: Vec::new(),
            constant_map: FxHashMap::default(),
            varnames: Vec::new(),
            local_map: FxHashMap::default(),
            local_types: Vec::new(),
            return_type: LocalType::Object,
            names: Vec::new(),
            name_map: FxHashMap::default(),
            arg_count: 0,
            posonlyarg_count: 0,
            kwonlyarg_count: 0,
            params_sealed: false,
            param_error: None,
            flags: CodeFlags::empty(),
            next_label: 0,
            labels: FxHashMap::default(),
            forward_refs: Vec::new(),
            line_table: Vec::new(),
            line_start_pc: 0,
        }
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Set the qualified name.
    pub fn set_qualname(&mut self, qualname: impl Into<Arc<str>>) {
        self.qualname = qualname.into();
    }

    /// Set the filename.
    pub fn set_filename(&mut self, filename: impl Into<Arc<str>>) {
        self.filename = filename.into();
    }

    /// Set the first line number.
    pub fn set_first_lineno(&mut self, line: u32) {
        self.first_lineno = line;
        if self.instructions.is_empty() {
            self.current_line = line;
        }
    }

    /// Set the current line number for subsequent instructions.
    pub fn set_line(&mut self, line: u32) {
        if line != self.current_line {
            let current_pc = self.instructions.len() as u32;
            if current_pc > self.line_start_pc {
                self.line_table.push(LineTableEntry {
                    start_pc: self.line_start_pc,
                    end_pc: current_pc,
                    line: self.current_line,
                });
            }
            self.current_line = line;
            self.line_start_pc = current_pc;
        }
    }

    /// Add code flags.
    pub fn add_flags(&mut self, flags: CodeFlags) {
        self.flags |= flags;
    }

    fn define_param(&mut self, name: &str) {
        if self.params_sealed {
            self.param_error
                .get_or_insert(BytecodeError::ParamAfterLocal { name: name.into() });
        }
        self.define_local_slot(name);
    }

    /// Declare positional parameters. Must precede any other local.
    pub fn set_params(&mut self, params: &[&str]) {
        for p in params {
            self.define_param(p);
        }
        self.arg_count += params.len() as u16;
    }

    /// Declare how many leading positional parameters are positional-only.
    pub fn set_posonly_count(&mut self, count: u16) {
        self.posonlyarg_count = count;
    }

    /// Declare keyword-only parameters (after the positional ones).
    pub fn set_kwonly_params(&mut self, params: &[&str]) {
        for p in params {
            self.define_param(p);
        }
        self.kwonlyarg_count += params.len() as u16;
    }

    /// Declare a `*args` parameter.
    pub fn set_varargs(&mut self, name: &str) {
        self.define_param(name);
        self.flags |= CodeFlags::VARARGS;
    }

    /// Declare a `**kwargs` parameter.
    pub fn set_varkeywords(&mut self, name: &str) {
        self.define_param(name);
        self.flags |= CodeFlags::VARKEYWORDS;
    }

    /// Declare the representation of a local.
    pub fn set_local_type(&mut self, name: &str, ty: LocalType) {
        let slot = self.local(name) as usize;
        self.local_types[slot] = ty;
        if ty.primitive().is_some() {
            self.flags |= CodeFlags::STATIC;
        }
    }

    /// Declare the representation of the return value.
    pub fn set_return_type(&mut self, ty: LocalType) {
        self.return_type = ty;
        if ty.primitive().is_some() {
            self.flags |= CodeFlags::STATIC;
        }
    }

    // =========================================================================
    // Pools
    // =========================================================================

    /// Add a constant, deduplicating scalars.
    pub fn add_const(&mut self, value: Constant) -> u32 {
        let key = ConstantKey::from_constant(&value);
        if let Some(key) = &key {
            if let Some(&idx) = self.constant_map.get(key) {
                return idx;
            }
        }
        let idx = self.constants.len() as u32;
        self.constants.push(value);
        if let Some(key) = key {
            self.constant_map.insert(key, idx);
        }
        idx
    }

    /// Add a name to the name table.
    pub fn add_name(&mut self, name: &str) -> u32 {
        if let Some(&idx) = self.name_map.get(name) {
            return idx;
        }
        let name: Arc<str> = Arc::from(name);
        let idx = self.names.len() as u32;
        self.names.push(name.clone());
        self.name_map.insert(name, idx);
        idx
    }

    fn define_local_slot(&mut self, name: &str) -> u32 {
        if let Some(&slot) = self.local_map.get(name) {
            return slot;
        }
        let name: Arc<str> = Arc::from(name);
        let slot = self.varnames.len() as u32;
        self.varnames.push(name.clone());
        self.local_types.push(LocalType::Object);
        self.local_map.insert(name, slot);
        slot
    }

    /// Get or define the slot of a local.
    pub fn local(&mut self, name: &str) -> u32 {
        if let Some(&slot) = self.local_map.get(name) {
            return slot;
        }
        self.params_sealed = true;
        self.define_local_slot(name)
    }

    // =========================================================================
    // Labels
    // =========================================================================

    /// Create a new, unbound label.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Bind a label to the next emitted instruction.
    pub fn bind_label(&mut self, label: Label) {
        self.labels.insert(label, self.instructions.len());
    }

    /// Index of the next instruction.
    #[inline]
    pub fn current_offset(&self) -> u32 {
        self.instructions.len() as u32
    }

    // =========================================================================
    // Emission
    // =========================================================================

    /// Emit a raw instruction.
    pub fn emit(&mut self, opcode: Opcode, arg: u32) -> u32 {
        let offset = self.current_offset();
        self.instructions.push(Instruction::new(opcode, arg));
        offset
    }

    /// Emit an instruction whose argument is a label.
    pub fn emit_jump(&mut self, opcode: Opcode, label: Label) -> u32 {
        let offset = self.emit(opcode, 0);
        self.forward_refs.push(ForwardRef {
            instruction_index: offset as usize,
            label,
        });
        offset
    }

    /// Push a constant.
    pub fn load_const(&mut self, value: Constant) -> u32 {
        let idx = self.add_const(value);
        self.emit(Opcode::LoadConst, idx)
    }

    /// Push an integer constant.
    pub fn load_int(&mut self, value: i64) -> u32 {
        self.load_const(Constant::Int(value))
    }

    /// Push a string constant.
    pub fn load_str(&mut self, value: &str) -> u32 {
        self.load_const(Constant::str(value))
    }

    /// Push `None`.
    pub fn load_none(&mut self) -> u32 {
        self.load_const(Constant::None)
    }

    /// Push a local.
    pub fn load_fast(&mut self, name: &str) -> u32 {
        let slot = self.local(name);
        self.emit(Opcode::LoadFast, slot)
    }

    /// Pop into a local.
    pub fn store_fast(&mut self, name: &str) -> u32 {
        let slot = self.local(name);
        self.emit(Opcode::StoreFast, slot)
    }

    /// Unbind a local.
    pub fn delete_fast(&mut self, name: &str) -> u32 {
        let slot = self.local(name);
        self.emit(Opcode::DeleteFast, slot)
    }

    /// Push a global.
    pub fn load_global(&mut self, name: &str) -> u32 {
        let idx = self.add_name(name);
        self.emit(Opcode::LoadGlobal, idx)
    }

    /// Pop into a global.
    pub fn store_global(&mut self, name: &str) -> u32 {
        let idx = self.add_name(name);
        self.emit(Opcode::StoreGlobal, idx)
    }

    /// Replace TOS with one of its attributes.
    pub fn load_attr(&mut self, name: &str) -> u32 {
        let idx = self.add_name(name);
        self.emit(Opcode::LoadAttr, idx)
    }

    /// `TOS.name = TOS1`.
    pub fn store_attr(&mut self, name: &str) -> u32 {
        let idx = self.add_name(name);
        self.emit(Opcode::StoreAttr, idx)
    }

    /// `del TOS.name`.
    pub fn delete_attr(&mut self, name: &str) -> u32 {
        let idx = self.add_name(name);
        self.emit(Opcode::DeleteAttr, idx)
    }

    /// Method lookup for a following `call_method`.
    pub fn load_method(&mut self, name: &str) -> u32 {
        let idx = self.add_name(name);
        self.emit(Opcode::LoadMethod, idx)
    }

    /// Call a method loaded by `load_method`.
    pub fn call_method(&mut self, argc: u32) -> u32 {
        self.emit(Opcode::CallMethod, argc)
    }

    /// Call with positional arguments.
    pub fn call(&mut self, argc: u32) -> u32 {
        self.emit(Opcode::CallFunction, argc)
    }

    /// Generic binary operator.
    pub fn binary(&mut self, op: BinOp) -> u32 {
        self.emit(Opcode::BinaryOp, op as u32)
    }

    /// Generic comparison.
    pub fn compare(&mut self, op: CmpOp) -> u32 {
        self.emit(Opcode::CompareOp, op as u32)
    }

    /// Discard TOS.
    pub fn pop_top(&mut self) -> u32 {
        self.emit(Opcode::PopTop, 0)
    }

    /// Return TOS.
    pub fn return_value(&mut self) -> u32 {
        self.emit(Opcode::ReturnValue, 0)
    }

    /// Return `None`.
    pub fn return_none(&mut self) -> u32 {
        self.load_none();
        self.emit(Opcode::ReturnValue, 0)
    }

    /// Yield TOS.
    pub fn yield_value(&mut self) -> u32 {
        self.emit(Opcode::YieldValue, 0)
    }

    /// Delegate to the iterable on TOS (`yield from`).
    pub fn yield_from(&mut self) -> u32 {
        self.emit(Opcode::GetYieldFromIter, 0);
        self.load_none();
        self.emit(Opcode::YieldFrom, 0)
    }

    /// Await the awaitable on TOS.
    pub fn await_value(&mut self) -> u32 {
        self.emit(Opcode::GetAwaitable, 0);
        self.load_none();
        self.emit(Opcode::YieldFrom, 0)
    }

    /// Push an unboxed constant.
    pub fn primitive_const(&mut self, value: Constant) -> u32 {
        let idx = self.add_const(value);
        self.flags |= CodeFlags::STATIC;
        self.emit(Opcode::PrimitiveLoadConst, idx)
    }

    /// Primitive binary operator.
    pub fn primitive_binary(&mut self, kind: PrimitiveKind, op: BinOp) -> u32 {
        self.flags |= CodeFlags::STATIC;
        self.emit(Opcode::PrimitiveBinaryOp, kind.encode_binary(op))
    }

    /// Primitive comparison.
    pub fn primitive_compare(&mut self, kind: PrimitiveKind, op: CmpOp) -> u32 {
        self.flags |= CodeFlags::STATIC;
        self.emit(Opcode::PrimitiveCompareOp, kind.encode_compare(op))
    }

    /// Box the primitive on TOS.
    pub fn primitive_box(&mut self, kind: PrimitiveKind) -> u32 {
        self.flags |= CodeFlags::STATIC;
        self.emit(Opcode::PrimitiveBox, kind as u32)
    }

    /// Unbox TOS.
    pub fn primitive_unbox(&mut self, kind: PrimitiveKind) -> u32 {
        self.flags |= CodeFlags::STATIC;
        self.emit(Opcode::PrimitiveUnbox, kind as u32)
    }

    /// Call a native function.
    pub fn invoke_native(&mut self, sig: NativeSignature) -> u32 {
        let idx = self.add_const(Constant::Native(Arc::new(sig)));
        self.flags |= CodeFlags::STATIC;
        self.emit(Opcode::InvokeNative, idx)
    }

    /// Create a function from a nested code object.
    pub fn make_function(&mut self, code: Arc<CodeObject>) -> u32 {
        self.load_const(Constant::Code(code));
        self.emit(Opcode::MakeFunction, 0)
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Finish building and return the code object.
    pub fn finish(mut self) -> Result<CodeObject, BytecodeError> {
        if let Some(err) = self.param_error.take() {
            return Err(err);
        }

        let final_pc = self.instructions.len() as u32;
        if final_pc > self.line_start_pc {
            self.line_table.push(LineTableEntry {
                start_pc: self.line_start_pc,
                end_pc: final_pc,
                line: self.current_line,
            });
        }

        for fwd in &self.forward_refs {
            let target = *self
                .labels
                .get(&fwd.label)
                .ok_or(BytecodeError::UnboundLabel { label: fwd.label.0 })?;
            self.instructions[fwd.instruction_index].arg = target as u32;
        }

        for (offset, inst) in self.instructions.iter().enumerate() {
            let limit = if inst.opcode.uses_name() {
                self.names.len()
            } else {
                match inst.opcode {
                    Opcode::LoadConst | Opcode::PrimitiveLoadConst | Opcode::InvokeNative => {
                        self.constants.len()
                    }
                    Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => {
                        self.varnames.len()
                    }
                    _ => continue,
                }
            };
            if inst.arg as usize >= limit {
                return Err(BytecodeError::IndexOutOfRange {
                    offset: offset as u32,
                    index: inst.arg,
                });
            }
        }

        let mut code = CodeObject {
            id: next_code_id(),
            name: self.name,
            qualname: self.qualname,
            filename: self.filename,
            first_lineno: self.first_lineno,
            instructions: self.instructions.into_boxed_slice(),
            constants: self.constants.into_boxed_slice(),
            varnames: self.varnames.into_boxed_slice(),
            names: self.names.into_boxed_slice(),
            local_types: self.local_types.into_boxed_slice(),
            return_type: self.return_type,
            arg_count: self.arg_count,
            posonlyarg_count: self.posonlyarg_count,
            kwonlyarg_count: self.kwonlyarg_count,
            stack_size: 0,
            flags: self.flags,
            line_table: self.line_table.into_boxed_slice(),
            extra: CodeExtra::default(),
        };
        let depths = stack_depths(&code)?;
        code.stack_size = max_stack_depth(&code, &depths);
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_function() {
        let mut builder = FunctionBuilder::new("add");
        builder.set_filename("test.py");
        builder.set_params(&["x", "y"]);
        builder.load_fast("x");
        builder.load_fast("y");
        builder.binary(BinOp::Add);
        builder.return_value();

        let code = builder.finish().unwrap();

        assert_eq!(&*code.name, "add");
        assert_eq!(code.instructions.len(), 4);
        assert_eq!(code.nlocals(), 2);
        assert_eq!(code.stack_size, 2);
    }

    #[test]
    fn test_constant_deduplication() {
        let mut builder = FunctionBuilder::new("test");

        let idx1 = builder.add_const(Constant::Int(42));
        let idx2 = builder.add_const(Constant::Int(42));
        let idx3 = builder.add_const(Constant::Int(100));

        assert_eq!(idx1, idx2);
        assert_ne!(idx1, idx3);
    }

    #[test]
    fn test_labels() {
        let mut builder = FunctionBuilder::new("loop");
        builder.set_params(&["flag"]);

        let loop_start = builder.new_label();
        let loop_end = builder.new_label();

        builder.bind_label(loop_start);
        builder.load_fast("flag");
        builder.emit_jump(Opcode::PopJumpIfFalse, loop_end);
        builder.emit_jump(Opcode::Jump, loop_start);
        builder.bind_label(loop_end);
        builder.return_none();

        let code = builder.finish().unwrap();
        assert_eq!(code.instructions.len(), 5);
        assert_eq!(code.instructions[1].arg, 3);
        assert_eq!(code.instructions[2].arg, 0);
    }

    #[test]
    fn test_unbound_label() {
        let mut builder = FunctionBuilder::new("bad");
        let label = builder.new_label();
        builder.emit_jump(Opcode::Jump, label);
        assert!(matches!(
            builder.finish(),
            Err(BytecodeError::UnboundLabel { .. })
        ));
    }

    #[test]
    fn test_line_table() {
        let mut builder = FunctionBuilder::new("lines");
        builder.set_first_lineno(10);
        builder.set_line(11);
        builder.load_int(1);
        builder.pop_top();
        builder.set_line(12);
        builder.return_none();
        let code = builder.finish().unwrap();
        assert_eq!(code.line_for_pc(0), Some(11));
        assert_eq!(code.line_for_pc(1), Some(11));
        assert_eq!(code.line_for_pc(2), Some(12));
        assert_eq!(code.line_for_pc(3), Some(12));
    }

    #[test]
    fn test_params_must_come_first() {
        let mut builder = FunctionBuilder::new("bad");
        builder.local("tmp");
        builder.set_params(&["x"]);
        builder.return_none();
        assert!(matches!(
            builder.finish(),
            Err(BytecodeError::ParamAfterLocal { .. })
        ));
    }

    #[test]
    fn test_primitive_local_marks_static() {
        let mut builder = FunctionBuilder::new("prim");
        builder.set_params(&["n"]);
        builder.set_local_type("n", LocalType::Primitive(PrimitiveKind::Int64));
        builder.load_fast("n");
        builder.primitive_box(PrimitiveKind::Int64);
        builder.return_value();
        let code = builder.finish().unwrap();
        assert!(code.flags.contains(CodeFlags::STATIC));
        assert!(code.has_primitive_signature());
    }
}
