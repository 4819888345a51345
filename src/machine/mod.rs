//! The machine-level IR.
//!
//! Much closer to a hardware ISA than the SSA IR: instructions carry
//! target-specific opcodes (opaque `u16`s interpreted through a
//! [`MachineTarget`](self::target::MachineTarget)) and operate on
//! virtual or physical registers. Instructions live in an arena with
//! per-block id lists, so analyses can hold instruction ids across
//! insertions.

pub mod emitter;
pub mod liveness;
pub mod select;
pub mod target;
pub mod two_address;

use bitflags::bitflags;
use index_vec::IndexVec;
use smallvec::SmallVec;

pub use self::emitter::{BufferEmitter, MachineCodeEmitter, Relocation, RelocationKind, RelocationTarget};
pub use self::liveness::LiveVariables;
pub use self::target::{GenericTarget, MachineTarget};
pub use self::two_address::lower_two_address;

index_vec::define_index_type! {
    /// A virtual register.
    pub struct VReg = u32;
}

index_vec::define_index_type! {
    /// A machine basic block.
    pub struct MBlockId = u32;
}

index_vec::define_index_type! {
    /// A machine instruction.
    pub struct MInstId = u32;
}

/// A register reference: virtual until allocation, physical afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Virtual(VReg),
    Physical(u8),
}

impl Reg {
    pub fn is_virtual(self) -> bool {
        matches!(self, Self::Virtual(_))
    }

    pub fn as_virtual(self) -> Option<VReg> {
        match self {
            Self::Virtual(v) => Some(v),
            Self::Physical(_) => None,
        }
    }
}

bitflags! {
    /// Per-register-operand facts. `KILL` marks the last use of a value;
    /// `DEAD` marks a def that is never used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RegFlags: u8 {
        const DEF  = 1 << 0;
        const USE  = 1 << 1;
        const KILL = 1 << 2;
        const DEAD = 1 << 3;
    }
}

/// One machine operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MOperand {
    Reg { reg: Reg, flags: RegFlags },
    Imm(i64),
    Block(MBlockId),
    /// A named external symbol (call targets, global addresses).
    Symbol(Box<str>),
}

impl MOperand {
    pub fn def(reg: Reg) -> Self {
        Self::Reg {
            reg,
            flags: RegFlags::DEF,
        }
    }

    pub fn use_(reg: Reg) -> Self {
        Self::Reg {
            reg,
            flags: RegFlags::USE,
        }
    }

    pub fn reg(&self) -> Option<Reg> {
        match self {
            Self::Reg { reg, .. } => Some(*reg),
            _ => None,
        }
    }

    pub fn flags(&self) -> RegFlags {
        match self {
            Self::Reg { flags, .. } => *flags,
            _ => RegFlags::empty(),
        }
    }

    pub fn is_reg_use(&self) -> bool {
        matches!(self, Self::Reg { flags, .. } if flags.contains(RegFlags::USE))
    }

    pub fn is_reg_def(&self) -> bool {
        matches!(self, Self::Reg { flags, .. } if flags.contains(RegFlags::DEF))
    }
}

/// One machine instruction: a target opcode plus operands. By
/// convention operand 0 is the def (when the opcode defines a
/// register) and the remaining operands are uses.
#[derive(Debug, Clone)]
pub struct MachineInst {
    pub opcode: u16,
    pub operands: SmallVec<[MOperand; 3]>,
}

impl MachineInst {
    pub fn new(opcode: u16, operands: impl IntoIterator<Item = MOperand>) -> Self {
        Self {
            opcode,
            operands: operands.into_iter().collect(),
        }
    }

    /// The defined register, when operand 0 is a def.
    pub fn def_reg(&self) -> Option<Reg> {
        match self.operands.first() {
            Some(MOperand::Reg { reg, flags }) if flags.contains(RegFlags::DEF) => Some(*reg),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MachineBlock {
    pub insts: Vec<MInstId>,
}

/// A function of machine instructions over virtual registers.
#[derive(Debug, Clone, Default)]
pub struct MachineFunction {
    pub name: String,
    pub blocks: IndexVec<MBlockId, MachineBlock>,
    pub insts: IndexVec<MInstId, MachineInst>,
    next_vreg: u32,
}

impl MachineFunction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn new_vreg(&mut self) -> VReg {
        let v = VReg::from_raw(self.next_vreg);
        self.next_vreg += 1;
        v
    }

    pub fn num_vregs(&self) -> u32 {
        self.next_vreg
    }

    pub fn add_block(&mut self) -> MBlockId {
        self.blocks.push(MachineBlock::default())
    }

    pub fn push(&mut self, block: MBlockId, inst: MachineInst) -> MInstId {
        let id = self.insts.push(inst);
        self.blocks[block].insts.push(id);
        id
    }

    /// Insert `inst` immediately before `before` in `block`.
    pub fn insert_before(&mut self, block: MBlockId, before: MInstId, inst: MachineInst) -> MInstId {
        let id = self.insts.push(inst);
        let pos = self.blocks[block]
            .insts
            .iter()
            .position(|&i| i == before)
            .expect("instruction is in the block");
        self.blocks[block].insts.insert(pos, id);
        id
    }

    pub fn inst(&self, id: MInstId) -> &MachineInst {
        &self.insts[id]
    }

    pub fn inst_mut(&mut self, id: MInstId) -> &mut MachineInst {
        &mut self.insts[id]
    }

    pub fn block_ids(&self) -> impl Iterator<Item = MBlockId> + '_ {
        self.blocks.iter_enumerated().map(|(id, _)| id)
    }
}
