//! Instruction opcodes and the instruction record.
//!
//! There is no class hierarchy here: one opcode tag plus a shared header
//! (result type, operands, parent, name, use list) covers every
//! instruction, and behavior is selected by matching on the tag.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use smallvec::SmallVec;

use crate::ir::types::Type;
use crate::ir::{BlockId, Use, ValueRef};

/// Instruction opcodes. The discriminants are the stable wire encoding
/// of function bodies, so existing values must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    // Terminators.
    Ret = 0,
    Br = 1,
    CondBr = 2,
    Switch = 3,
    Invoke = 4,

    // Binary operations.
    Add = 10,
    Sub = 11,
    Mul = 12,
    Div = 13,
    Rem = 14,
    And = 15,
    Or = 16,
    Xor = 17,

    // Comparisons (result is always `bool`).
    SetEq = 20,
    SetNe = 21,
    SetLt = 22,
    SetGt = 23,
    SetLe = 24,
    SetGe = 25,

    // Unary.
    Not = 30,
    Cast = 31,

    // Shifts (shift amount is a `u8` operand).
    Shl = 35,
    Shr = 36,

    // Memory.
    Alloca = 40,
    Malloc = 41,
    Free = 42,
    Load = 43,
    Store = 44,
    Gep = 45,

    // Other.
    Phi = 50,
    Call = 51,

    /// Stand-in for a value referenced before its definition while a
    /// function body is being materialized from bytecode. Never present
    /// in a verified function.
    Placeholder = 63,
}

impl Opcode {
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Self::Ret | Self::Br | Self::CondBr | Self::Switch | Self::Invoke
        )
    }

    /// Binary operations in the `A = B op C` shape, including compares
    /// and shifts.
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            Self::Add
                | Self::Sub
                | Self::Mul
                | Self::Div
                | Self::Rem
                | Self::And
                | Self::Or
                | Self::Xor
                | Self::Shl
                | Self::Shr
        ) || self.is_compare()
    }

    pub fn is_compare(self) -> bool {
        matches!(
            self,
            Self::SetEq | Self::SetNe | Self::SetLt | Self::SetGt | Self::SetLe | Self::SetGe
        )
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Mul | Self::And | Self::Or | Self::Xor | Self::SetEq | Self::SetNe
        )
    }

    /// Whether the operation may read or write memory or otherwise have
    /// effects beyond producing its result. Side-effect-free instructions
    /// with no uses are dead.
    pub fn has_side_effects(self) -> bool {
        matches!(
            self,
            Self::Store | Self::Free | Self::Call | Self::Invoke | Self::Malloc | Self::Alloca
        ) || self.is_terminator()
    }

    /// The comparison with the operand order swapped, e.g. `<` ↔ `>`.
    pub fn swapped_compare(self) -> Option<Opcode> {
        Some(match self {
            Self::SetEq => Self::SetEq,
            Self::SetNe => Self::SetNe,
            Self::SetLt => Self::SetGt,
            Self::SetGt => Self::SetLt,
            Self::SetLe => Self::SetGe,
            Self::SetGe => Self::SetLe,
            _ => return None,
        })
    }

    /// The logically negated comparison, e.g. `<` ↔ `>=`.
    pub fn inverted_compare(self) -> Option<Opcode> {
        Some(match self {
            Self::SetEq => Self::SetNe,
            Self::SetNe => Self::SetEq,
            Self::SetLt => Self::SetGe,
            Self::SetGt => Self::SetLe,
            Self::SetLe => Self::SetGt,
            Self::SetGe => Self::SetLt,
            _ => return None,
        })
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Ret => "ret",
            Self::Br => "br",
            Self::CondBr => "condbr",
            Self::Switch => "switch",
            Self::Invoke => "invoke",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Rem => "rem",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::SetEq => "seteq",
            Self::SetNe => "setne",
            Self::SetLt => "setlt",
            Self::SetGt => "setgt",
            Self::SetLe => "setle",
            Self::SetGe => "setge",
            Self::Not => "not",
            Self::Cast => "cast",
            Self::Shl => "shl",
            Self::Shr => "shr",
            Self::Alloca => "alloca",
            Self::Malloc => "malloc",
            Self::Free => "free",
            Self::Load => "load",
            Self::Store => "store",
            Self::Gep => "getelementptr",
            Self::Phi => "phi",
            Self::Call => "call",
            Self::Placeholder => "placeholder",
        }
    }
}

/// One instruction: an opcode, a result type (`void` when the operation
/// produces nothing) and an ordered list of operand slots.
///
/// Operand conventions per opcode:
/// * `Ret`: `[]` or `[value]`
/// * `Br`: `[dest]`; `CondBr`: `[cond, iftrue, iffalse]`
/// * `Switch`: `[value, default, case0, dest0, case1, dest1, ...]`
/// * `Invoke`: `[callee, normal, unwind, args...]`
/// * `Phi`: `[value0, pred0, value1, pred1, ...]`
/// * `Call`: `[callee, args...]`
/// * `Alloca`/`Malloc`: `[]` or `[count]`
/// * `Load`: `[ptr]`; `Store`: `[value, ptr]`; `Free`: `[ptr]`
/// * `Gep`: `[base, indices...]`
/// * binary/compare/shift: `[lhs, rhs]`; `Not`/`Cast`: `[operand]`
#[derive(Debug, Clone)]
pub struct InstData {
    pub opcode: Opcode,
    pub ty: Type,
    pub operands: SmallVec<[ValueRef; 2]>,
    pub parent: Option<BlockId>,
    pub name: Option<String>,
    pub(crate) uses: Vec<Use>,
    pub(crate) dead: bool,
}

impl InstData {
    pub fn new(opcode: Opcode, ty: Type, operands: impl Into<SmallVec<[ValueRef; 2]>>) -> Self {
        Self {
            opcode,
            ty,
            operands: operands.into(),
            parent: None,
            name: None,
            uses: Vec::new(),
            dead: false,
        }
    }

    pub fn uses(&self) -> &[Use] {
        &self.uses
    }

    /// The incoming (value, predecessor) pairs of a phi.
    pub fn phi_incoming(&self) -> impl Iterator<Item = (ValueRef, BlockId)> + '_ {
        debug_assert_eq!(self.opcode, Opcode::Phi);
        self.operands.chunks_exact(2).map(|pair| {
            let block = pair[1]
                .as_block()
                .expect("phi operands alternate value, block");
            (pair[0], block)
        })
    }

    /// The (case constant, destination) pairs of a switch.
    pub fn switch_cases(&self) -> impl Iterator<Item = (ValueRef, BlockId)> + '_ {
        debug_assert_eq!(self.opcode, Opcode::Switch);
        self.operands[2..].chunks_exact(2).map(|pair| {
            let block = pair[1]
                .as_block()
                .expect("switch operands alternate case, destination");
            (pair[0], block)
        })
    }

    /// Successor blocks of a terminator, in operand order.
    pub fn successors(&self) -> Vec<BlockId> {
        match self.opcode {
            Opcode::Br => vec![self.operands[0].as_block().expect("br target")],
            Opcode::CondBr => self.operands[1..]
                .iter()
                .map(|v| v.as_block().expect("condbr target"))
                .collect(),
            Opcode::Switch => {
                let mut out = vec![self.operands[1].as_block().expect("switch default")];
                out.extend(self.switch_cases().map(|(_, b)| b));
                out
            }
            Opcode::Invoke => self.operands[1..3]
                .iter()
                .map(|v| v.as_block().expect("invoke destination"))
                .collect(),
            _ => Vec::new(),
        }
    }
}
