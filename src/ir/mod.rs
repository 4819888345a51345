//! The SSA object model.
//!
//! Ownership follows the module → function → block → instruction tree;
//! every entity is addressed by a typed index into the arena of its
//! owner. Operands are [`ValueRef`]s; every function-local definition
//! keeps a use list of `(instruction, operand-index)` back-edges so that
//! replace-all-uses-with is a single list walk.

pub mod builder;
pub mod constant;
pub mod function;
pub mod instruction;
pub mod module;
pub mod printer;
pub mod types;
pub mod verifier;

pub use self::builder::Builder;
pub use self::constant::{Constant, ConstantKind};
pub use self::function::{BasicBlockData, Function};
pub use self::instruction::{InstData, Opcode};
pub use self::module::{GlobalData, GlobalKind, Linkage, Module, Slots};
pub use self::types::{Layout, Type, TypeKind, TypeTag};

index_vec::define_index_type! {
    /// A global value (variable or function) within its module.
    pub struct GlobalId = u32;
}

index_vec::define_index_type! {
    /// A function body within its module.
    pub struct FuncId = u32;
}

index_vec::define_index_type! {
    /// A basic block within its function.
    pub struct BlockId = u32;
}

index_vec::define_index_type! {
    /// An instruction within its function.
    pub struct InstId = u32;
}

index_vec::define_index_type! {
    /// A formal argument within its function.
    pub struct ArgId = u32;
}

/// A reference to any SSA value usable as an operand.
///
/// `Arg`, `Block` and `Inst` are local to the function that owns the
/// using instruction; `Const` and `Global` resolve through the `Context`
/// and `Module` respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueRef {
    Const(Constant),
    Global(GlobalId),
    Arg(ArgId),
    Block(BlockId),
    Inst(InstId),
}

impl ValueRef {
    pub fn as_inst(self) -> Option<InstId> {
        match self {
            Self::Inst(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_block(self) -> Option<BlockId> {
        match self {
            Self::Block(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_const(self) -> Option<Constant> {
        match self {
            Self::Const(c) => Some(c),
            _ => None,
        }
    }

    /// Whether this reference is owned by a function body (and therefore
    /// carries a use list there).
    pub fn is_local(self) -> bool {
        matches!(self, Self::Arg(_) | Self::Block(_) | Self::Inst(_))
    }
}

/// One operand slot of one instruction; the unit entry of a use list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Use {
    pub inst: InstId,
    pub index: u32,
}
