//! Stable wire tags of the bytecode format.
//!
//! These discriminants are what is on disk; renumbering any of them
//! breaks compatibility with existing files. Type tags reuse
//! [`TypeTag`](crate::ir::TypeTag) and instruction opcodes reuse
//! [`Opcode`](crate::ir::Opcode) discriminants directly.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 4-byte ASCII tag opening every bytecode file.
pub const MAGIC: [u8; 4] = *b"mdbc";

/// Current format version. Readers reject anything newer.
pub const VERSION: u64 = 1;

/// 8-byte tag opening an archive file.
pub const ARCHIVE_MAGIC: [u8; 8] = *b"!<mdar>\n";

/// Name of the distinguished symbol-index archive member.
pub const SYMTAB_MEMBER: &str = "/SYMTAB";

/// Top-level block tags inside a module file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum BlockTag {
    /// Module header: name, target signature, dependent libraries.
    Module = 1,
    /// The uniqued type table, leaf-first.
    Types = 2,
    /// Global variables and function declarations.
    Globals = 3,
    /// The constant pool, operands before users.
    Constants = 4,
    /// Global-initializer references (emitted after the pool so
    /// initializers can use any constant).
    Inits = 5,
    /// One function body. The block length enables lazy skipping.
    Function = 6,
}

/// Constant payload tags inside the constant pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ConstTag {
    Bool = 0,
    Int = 1,
    Float = 2,
    Null = 3,
    Aggregate = 4,
    GlobalAddr = 5,
    Expr = 6,
}

/// Operand reference kinds inside function bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OperandTag {
    /// Constant-pool index.
    Const = 0,
    /// Global table index.
    Global = 1,
    /// Block index within the current function.
    Block = 2,
    /// (type index, value slot) within the current function; the slot
    /// may be a forward reference.
    Value = 3,
}

/// Global kinds inside the globals block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum GlobalTag {
    Variable = 0,
    Function = 1,
}

/// Linkage encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum LinkageTag {
    External = 0,
    Internal = 1,
}

/// Compression of a function-body payload. Only `None` is produced
/// today; the tag exists so a compressor can be added without a format
/// break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Compression {
    None = 0,
}
