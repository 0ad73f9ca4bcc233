//! Stack-machine instruction set.
//!
//! Every instruction is an [`Opcode`] plus a 32-bit argument. Offsets are
//! instruction indices, so a jump argument names the absolute index of the
//! target instruction.
//!
//! # Argument encoding
//!
//! | Opcode family | Argument |
//! |---------------|----------|
//! | `LoadConst`, `PrimitiveLoadConst`, `InvokeNative` | constant index |
//! | `LoadFast`, `StoreFast`, `DeleteFast` | local slot |
//! | `LoadGlobal`, `LoadAttr`, `LoadMethod`, ... | name index |
//! | `CallFunction`, `CallMethod`, `Build*`, `Raise` | count |
//! | `Jump`, `PopJump*`, `ForIter`, `SetupFinally` | target instruction index |
//! | `BinaryOp` / `CompareOp` | [`BinOp`] / [`CmpOp`] discriminant |
//! | `Primitive*` | `(kind << 8) \| op` (see [`PrimitiveKind`]) |

use std::fmt;

// =============================================================================
// Opcodes
// =============================================================================

/// Bytecode operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // --- Stack manipulation ---
    /// Do nothing.
    Nop = 0,
    /// Discard TOS.
    PopTop = 1,
    /// Swap the two top-most stack items.
    RotTwo = 2,
    /// Lift second and third items up one position, move TOS to third.
    RotThree = 3,
    /// Duplicate TOS.
    DupTop = 4,
    /// Duplicate the two top-most items, keeping order.
    DupTopTwo = 5,

    // --- Locals, constants and names ---
    /// Push `constants[arg]`.
    LoadConst = 10,
    /// Push local `arg`; raises `UnboundLocalError` if unbound.
    LoadFast = 11,
    /// Pop into local `arg`.
    StoreFast = 12,
    /// Unbind local `arg`.
    DeleteFast = 13,
    /// Push global `names[arg]`, falling back to builtins.
    LoadGlobal = 14,
    /// Pop into global `names[arg]`.
    StoreGlobal = 15,
    /// Dynamic-scope name lookup (module and class bodies only).
    LoadName = 16,
    /// Dynamic-scope name store (module and class bodies only).
    StoreName = 17,

    // --- Attributes ---
    /// Replace TOS with `TOS.names[arg]`.
    LoadAttr = 20,
    /// `TOS.names[arg] = TOS1`, popping both.
    StoreAttr = 21,
    /// `del TOS.names[arg]`.
    DeleteAttr = 22,
    /// Replace TOS with `(method, self)` or `(NULL, attribute)`.
    LoadMethod = 23,

    // --- Calls ---
    /// Call with `arg` positional arguments: `[..., method, self_or_null, args]`.
    CallMethod = 30,
    /// Call with `arg` positional arguments: `[..., callable, args]`.
    CallFunction = 31,
    /// Call the native function described by `constants[arg]`.
    InvokeNative = 32,
    /// Return TOS to the caller.
    ReturnValue = 33,
    /// Build a function from a code object on TOS (bit 0 of `arg`: defaults tuple below it).
    MakeFunction = 34,

    // --- Generic operators ---
    /// Binary operator on two boxed objects.
    BinaryOp = 40,
    /// Rich comparison or identity/containment test.
    CompareOp = 41,
    /// Logical not.
    UnaryNot = 42,
    /// Arithmetic negation.
    UnaryNegative = 43,

    // --- Primitive (static) operators ---
    /// Push an unboxed constant.
    PrimitiveLoadConst = 50,
    /// Binary operator on two unboxed values of the same kind.
    PrimitiveBinaryOp = 51,
    /// Comparison on two unboxed values, producing an unboxed bool.
    PrimitiveCompareOp = 52,
    /// Box an unboxed value.
    PrimitiveBox = 53,
    /// Unbox a boxed value; raises `TypeError` on mismatch.
    PrimitiveUnbox = 54,

    // --- Control flow ---
    /// Jump to `arg`.
    Jump = 60,
    /// Pop TOS, jump to `arg` when falsy.
    PopJumpIfFalse = 61,
    /// Pop TOS, jump to `arg` when truthy.
    PopJumpIfTrue = 62,
    /// Replace TOS with `iter(TOS)`.
    GetIter = 63,
    /// Push `next(TOS)`; when exhausted pop the iterator and jump to `arg`.
    ForIter = 64,

    // --- Containers ---
    /// Build a tuple from the top `arg` items.
    BuildTuple = 70,
    /// Build a list from the top `arg` items.
    BuildList = 71,
    /// Build a dict from the top `2 * arg` items (key, value pairs).
    BuildMap = 72,
    /// Replace TOS1, TOS with `TOS1[TOS]`.
    BinarySubscr = 73,
    /// `TOS1[TOS] = TOS2`.
    StoreSubscr = 74,
    /// Unpack TOS into `arg` items, first item on top.
    UnpackSequence = 75,

    // --- Exceptions ---
    /// Push a handler block targeting `arg`.
    SetupFinally = 80,
    /// Pop the innermost handler block.
    PopBlock = 81,
    /// Leave an except handler, restoring the previously handled exception.
    PopExcept = 82,
    /// Raise: `arg` 0 re-raises, 1 raises TOS, 2 raises TOS1 from TOS.
    Raise = 83,
    /// Re-raise the exception on TOS keeping its traceback.
    Reraise = 84,
    /// Pop TOS (type or tuple) and TOS1 (exception); jump to `arg` if no match.
    JumpIfNotExcMatch = 85,

    // --- Generators and coroutines ---
    /// Suspend, producing TOS; the sent value is pushed on resume.
    YieldValue = 90,
    /// Replace TOS with an iterator suitable for delegation.
    GetYieldFromIter = 91,
    /// Delegate to TOS1 sending TOS; repeats until the delegate finishes.
    YieldFrom = 92,
    /// Replace TOS with its awaitable iterator.
    GetAwaitable = 93,

    // --- Structural pattern matching ---
    /// Push `len(TOS)`.
    GetLen = 100,
    /// Push whether TOS is a sequence.
    MatchSequence = 101,
    /// Push whether TOS is a mapping.
    MatchMapping = 102,
    /// Pop class and subject, push a tuple of `arg` positional attributes or `None`.
    MatchClass = 103,
}

impl Opcode {
    /// Convert from raw u8 value.
    pub const fn from_u8(value: u8) -> Option<Self> {
        use Opcode::*;
        Some(match value {
            0 => Nop,
            1 => PopTop,
            2 => RotTwo,
            3 => RotThree,
            4 => DupTop,
            5 => DupTopTwo,
            10 => LoadConst,
            11 => LoadFast,
            12 => StoreFast,
            13 => DeleteFast,
            14 => LoadGlobal,
            15 => StoreGlobal,
            16 => LoadName,
            17 => StoreName,
            20 => LoadAttr,
            21 => StoreAttr,
            22 => DeleteAttr,
            23 => LoadMethod,
            30 => CallMethod,
            31 => CallFunction,
            32 => InvokeNative,
            33 => ReturnValue,
            34 => MakeFunction,
            40 => BinaryOp,
            41 => CompareOp,
            42 => UnaryNot,
            43 => UnaryNegative,
            50 => PrimitiveLoadConst,
            51 => PrimitiveBinaryOp,
            52 => PrimitiveCompareOp,
            53 => PrimitiveBox,
            54 => PrimitiveUnbox,
            60 => Jump,
            61 => PopJumpIfFalse,
            62 => PopJumpIfTrue,
            63 => GetIter,
            64 => ForIter,
            70 => BuildTuple,
            71 => BuildList,
            72 => BuildMap,
            73 => BinarySubscr,
            74 => StoreSubscr,
            75 => UnpackSequence,
            80 => SetupFinally,
            81 => PopBlock,
            82 => PopExcept,
            83 => Raise,
            84 => Reraise,
            85 => JumpIfNotExcMatch,
            90 => YieldValue,
            91 => GetYieldFromIter,
            92 => YieldFrom,
            93 => GetAwaitable,
            100 => GetLen,
            101 => MatchSequence,
            102 => MatchMapping,
            103 => MatchClass,
            _ => return None,
        })
    }

    /// Whether the argument is an absolute jump target.
    #[inline]
    pub const fn has_jump_target(self) -> bool {
        matches!(
            self,
            Opcode::Jump
                | Opcode::PopJumpIfFalse
                | Opcode::PopJumpIfTrue
                | Opcode::ForIter
                | Opcode::SetupFinally
                | Opcode::JumpIfNotExcMatch
        )
    }

    /// Whether control never falls through to the next instruction.
    #[inline]
    pub const fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Jump | Opcode::ReturnValue | Opcode::Raise | Opcode::Reraise
        )
    }

    /// Whether the argument indexes the name table.
    #[inline]
    pub const fn uses_name(self) -> bool {
        matches!(
            self,
            Opcode::LoadGlobal
                | Opcode::StoreGlobal
                | Opcode::LoadName
                | Opcode::StoreName
                | Opcode::LoadAttr
                | Opcode::StoreAttr
                | Opcode::DeleteAttr
                | Opcode::LoadMethod
        )
    }

    /// Whether this instruction can suspend the running frame.
    #[inline]
    pub const fn is_suspension_point(self) -> bool {
        matches!(self, Opcode::YieldValue | Opcode::YieldFrom)
    }
}

// =============================================================================
// Instruction
// =============================================================================

/// A single bytecode instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    /// Operation.
    pub opcode: Opcode,
    /// Operation argument.
    pub arg: u32,
}

impl Instruction {
    /// Create an instruction with an argument.
    #[inline]
    pub const fn new(opcode: Opcode, arg: u32) -> Self {
        Self { opcode, arg }
    }

    /// Create an instruction without an argument.
    #[inline]
    pub const fn op(opcode: Opcode) -> Self {
        Self { opcode, arg: 0 }
    }

    /// Decode the binary operator of a `BinaryOp`/`PrimitiveBinaryOp`.
    #[inline]
    pub fn bin_op(self) -> Option<BinOp> {
        BinOp::from_u8((self.arg & 0xff) as u8)
    }

    /// Decode the comparison of a `CompareOp`/`PrimitiveCompareOp`.
    #[inline]
    pub fn cmp_op(self) -> Option<CmpOp> {
        CmpOp::from_u8((self.arg & 0xff) as u8)
    }

    /// Decode the primitive kind of a `Primitive*` instruction.
    #[inline]
    pub fn primitive_kind(self) -> Option<PrimitiveKind> {
        match self.opcode {
            Opcode::PrimitiveBinaryOp | Opcode::PrimitiveCompareOp => {
                PrimitiveKind::from_u8((self.arg >> 8) as u8)
            }
            _ => PrimitiveKind::from_u8(self.arg as u8),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode {
            Opcode::BinaryOp => match self.bin_op() {
                Some(op) => write!(f, "{:?} {}", self.opcode, op),
                None => write!(f, "{:?} ?{}", self.opcode, self.arg),
            },
            Opcode::CompareOp => match self.cmp_op() {
                Some(op) => write!(f, "{:?} {}", self.opcode, op),
                None => write!(f, "{:?} ?{}", self.opcode, self.arg),
            },
            Opcode::PrimitiveBinaryOp => write!(
                f,
                "{:?} {:?} {}",
                self.opcode,
                self.primitive_kind(),
                self.bin_op().map_or("?", BinOp::symbol)
            ),
            Opcode::PrimitiveCompareOp => write!(
                f,
                "{:?} {:?} {}",
                self.opcode,
                self.primitive_kind(),
                self.cmp_op().map_or("?", CmpOp::symbol)
            ),
            _ => write!(f, "{:?} {}", self.opcode, self.arg),
        }
    }
}

// =============================================================================
// Operators
// =============================================================================

/// Binary arithmetic and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BinOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    TrueDiv = 3,
    FloorDiv = 4,
    Mod = 5,
    And = 6,
    Or = 7,
    Xor = 8,
    LShift = 9,
    RShift = 10,
}

impl BinOp {
    /// Convert from raw u8 value.
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => BinOp::Add,
            1 => BinOp::Sub,
            2 => BinOp::Mul,
            3 => BinOp::TrueDiv,
            4 => BinOp::FloorDiv,
            5 => BinOp::Mod,
            6 => BinOp::And,
            7 => BinOp::Or,
            8 => BinOp::Xor,
            9 => BinOp::LShift,
            10 => BinOp::RShift,
            _ => return None,
        })
    }

    /// Source-level operator symbol.
    pub const fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::TrueDiv => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::And => "&",
            BinOp::Or => "|",
            BinOp::Xor => "^",
            BinOp::LShift => "<<",
            BinOp::RShift => ">>",
        }
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CmpOp {
    Lt = 0,
    Le = 1,
    Eq = 2,
    Ne = 3,
    Gt = 4,
    Ge = 5,
    Is = 6,
    IsNot = 7,
    In = 8,
    NotIn = 9,
}

impl CmpOp {
    /// Convert from raw u8 value.
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => CmpOp::Lt,
            1 => CmpOp::Le,
            2 => CmpOp::Eq,
            3 => CmpOp::Ne,
            4 => CmpOp::Gt,
            5 => CmpOp::Ge,
            6 => CmpOp::Is,
            7 => CmpOp::IsNot,
            8 => CmpOp::In,
            9 => CmpOp::NotIn,
            _ => return None,
        })
    }

    /// Source-level operator symbol.
    pub const fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Is => "is",
            CmpOp::IsNot => "is not",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
        }
    }

    /// Whether the comparison is defined on primitive values.
    #[inline]
    pub const fn is_ordering(self) -> bool {
        (self as u8) <= CmpOp::Ge as u8
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

// =============================================================================
// Primitive kinds
// =============================================================================

/// Unboxed machine representation declared by the static extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PrimitiveKind {
    /// Signed 64-bit integer (wrapping arithmetic).
    Int64 = 0,
    /// IEEE-754 double.
    Float64 = 1,
    /// Machine boolean.
    Bool = 2,
}

impl PrimitiveKind {
    /// Convert from raw u8 value.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PrimitiveKind::Int64),
            1 => Some(PrimitiveKind::Float64),
            2 => Some(PrimitiveKind::Bool),
            _ => None,
        }
    }

    /// Source-level type name.
    pub const fn name(self) -> &'static str {
        match self {
            PrimitiveKind::Int64 => "int64",
            PrimitiveKind::Float64 => "double",
            PrimitiveKind::Bool => "cbool",
        }
    }

    /// Argument for `PrimitiveBinaryOp`.
    #[inline]
    pub const fn encode_binary(self, op: BinOp) -> u32 {
        ((self as u32) << 8) | op as u32
    }

    /// Argument for `PrimitiveCompareOp`.
    #[inline]
    pub const fn encode_compare(self, op: CmpOp) -> u32 {
        ((self as u32) << 8) | op as u32
    }
}

/// Declared type of a local slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LocalType {
    /// Boxed object reference.
    #[default]
    Object,
    /// Unboxed primitive.
    Primitive(PrimitiveKind),
}

impl LocalType {
    /// Primitive kind, if unboxed.
    #[inline]
    pub const fn primitive(self) -> Option<PrimitiveKind> {
        match self {
            LocalType::Object => None,
            LocalType::Primitive(kind) => Some(kind),
        }
    }
}
