//! The code-emission interface.
//!
//! A machine-code emitter is an observer the target drives during
//! instruction selection: bytes and words stream in, relocations are
//! recorded against the current offset, and after `finish_function` the
//! recorded relocations are resolved by patching the emitted bytes.
//! Function stubs (small trampolines a JIT patches later) go through
//! the same interface between `start_function_stub` and
//! `finish_function_stub`.

use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};
use log::trace;

use crate::error::{Error, Result};
use crate::ir::GlobalId;

use super::MBlockId;

/// What a relocation refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocationTarget {
    /// A named external symbol.
    Symbol(String),
    /// A global value of the module being compiled.
    Global(GlobalId),
    /// A basic block of the function being emitted.
    Block(MBlockId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    /// Patch in the target's absolute address as a 32-bit word.
    Absolute32,
    /// Patch in target minus end-of-word, as a signed 32-bit word.
    Relative32,
}

#[derive(Debug, Clone)]
pub struct Relocation {
    /// Byte offset within the emitted stream to patch.
    pub offset: usize,
    pub kind: RelocationKind,
    pub target: RelocationTarget,
}

/// The observer interface the target calls while emitting.
pub trait MachineCodeEmitter {
    fn start_function(&mut self, name: &str);

    /// Resolve this function's relocations and finish it. Fails if a
    /// relocation target cannot be resolved.
    fn finish_function(&mut self) -> Result<()>;

    fn start_function_stub(&mut self, name: &str);
    fn finish_function_stub(&mut self) -> Result<()>;

    fn emit_byte(&mut self, byte: u8);

    fn emit_word(&mut self, word: u32);

    /// Lay down the constant pool; entry addresses become queryable via
    /// [`MachineCodeEmitter::constant_pool_entry_address`].
    fn emit_constant_pool(&mut self, pool: &[Vec<u8>]);

    fn add_relocation(&mut self, relocation: Relocation);

    /// The address the next emitted byte will have.
    fn current_pc_value(&self) -> u64;

    /// The offset of the next emitted byte within the current function.
    fn current_pc_offset(&self) -> usize;

    fn constant_pool_entry_address(&self, index: usize) -> u64;

    /// Record where a basic block starts (branch relocation target).
    fn mark_block(&mut self, block: MBlockId);
}

/// An in-memory emitter: everything lands in one byte buffer based at a
/// caller-chosen address. Symbols and globals resolve through address
/// maps the driver fills in (a JIT would point unresolved calls at a
/// lazy-compilation stub instead; that policy lives behind this trait,
/// not in it).
pub struct BufferEmitter {
    base_address: u64,
    buffer: Vec<u8>,
    function_start: usize,
    relocations: Vec<Relocation>,
    block_addresses: HashMap<MBlockId, u64>,
    constant_pool: Vec<u64>,
    pub symbol_addresses: HashMap<String, u64>,
    pub global_addresses: HashMap<GlobalId, u64>,
}

impl BufferEmitter {
    pub fn new(base_address: u64) -> Self {
        Self {
            base_address,
            buffer: Vec::new(),
            function_start: 0,
            relocations: Vec::new(),
            block_addresses: HashMap::new(),
            constant_pool: Vec::new(),
            symbol_addresses: HashMap::new(),
            global_addresses: HashMap::new(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    fn resolve(&self, target: &RelocationTarget) -> Result<u64> {
        match target {
            RelocationTarget::Symbol(name) => self
                .symbol_addresses
                .get(name)
                .copied()
                .ok_or_else(|| Error::Unresolved(name.clone())),
            RelocationTarget::Global(g) => self
                .global_addresses
                .get(g)
                .copied()
                .ok_or_else(|| Error::Unresolved(format!("global {}", g.raw()))),
            RelocationTarget::Block(b) => self
                .block_addresses
                .get(b)
                .copied()
                .ok_or_else(|| Error::Unresolved(format!("block {}", b.raw()))),
        }
    }
}

impl MachineCodeEmitter for BufferEmitter {
    fn start_function(&mut self, name: &str) {
        trace!("emitting function {name} at {:#x}", self.current_pc_value());
        self.function_start = self.buffer.len();
        self.relocations.clear();
        self.block_addresses.clear();
    }

    fn finish_function(&mut self) -> Result<()> {
        for relocation in std::mem::take(&mut self.relocations) {
            let address = self.resolve(&relocation.target)?;
            let at = relocation.offset;
            let end = at + 4;
            if end > self.buffer.len() {
                return Err(Error::Unresolved(format!(
                    "relocation at {at} beyond emitted code"
                )));
            }
            let patch = match relocation.kind {
                RelocationKind::Absolute32 => address as u32,
                RelocationKind::Relative32 => {
                    let pc = self.base_address + end as u64;
                    (address.wrapping_sub(pc)) as u32
                }
            };
            LittleEndian::write_u32(&mut self.buffer[at..end], patch);
        }
        Ok(())
    }

    fn start_function_stub(&mut self, name: &str) {
        self.start_function(name);
    }

    fn finish_function_stub(&mut self) -> Result<()> {
        self.finish_function()
    }

    fn emit_byte(&mut self, byte: u8) {
        self.buffer.push(byte);
    }

    fn emit_word(&mut self, word: u32) {
        let mut bytes = [0u8; 4];
        LittleEndian::write_u32(&mut bytes, word);
        self.buffer.extend_from_slice(&bytes);
    }

    fn emit_constant_pool(&mut self, pool: &[Vec<u8>]) {
        self.constant_pool.clear();
        for entry in pool {
            self.constant_pool.push(self.current_pc_value());
            self.buffer.extend_from_slice(entry);
        }
    }

    fn add_relocation(&mut self, relocation: Relocation) {
        self.relocations.push(relocation);
    }

    fn current_pc_value(&self) -> u64 {
        self.base_address + self.buffer.len() as u64
    }

    fn current_pc_offset(&self) -> usize {
        self.buffer.len() - self.function_start
    }

    fn constant_pool_entry_address(&self, index: usize) -> u64 {
        self.constant_pool[index]
    }

    fn mark_block(&mut self, block: MBlockId) {
        self.block_addresses.insert(block, self.current_pc_value());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relocations_patch_after_finish() {
        let mut e = BufferEmitter::new(0x1000);
        e.symbol_addresses.insert("callee".into(), 0x2000);
        e.start_function("caller");
        e.emit_byte(0x90);
        let at = e.buffer.len();
        e.add_relocation(Relocation {
            offset: at,
            kind: RelocationKind::Absolute32,
            target: RelocationTarget::Symbol("callee".into()),
        });
        e.emit_word(0); // placeholder patched later
        e.finish_function().unwrap();
        assert_eq!(&e.bytes()[at..at + 4], &0x2000u32.to_le_bytes());
    }

    #[test]
    fn relative_relocation_is_pc_relative() {
        let mut e = BufferEmitter::new(0x1000);
        e.start_function("f");
        let b = MBlockId::from_raw(0);
        e.mark_block(b);
        e.emit_byte(0xeb);
        let at = e.buffer.len();
        e.add_relocation(Relocation {
            offset: at,
            kind: RelocationKind::Relative32,
            target: RelocationTarget::Block(b),
        });
        e.emit_word(0);
        e.finish_function().unwrap();
        // Target is the block start (0x1000); word ends at 0x1005.
        let patched = u32::from_le_bytes(e.bytes()[at..at + 4].try_into().unwrap());
        assert_eq!(patched as i32, -5);
    }

    #[test]
    fn unresolved_target_fails() {
        let mut e = BufferEmitter::new(0);
        e.start_function("f");
        e.add_relocation(Relocation {
            offset: 0,
            kind: RelocationKind::Absolute32,
            target: RelocationTarget::Symbol("missing".into()),
        });
        e.emit_word(0);
        assert!(e.finish_function().is_err());
    }

    #[test]
    fn constant_pool_addresses() {
        let mut e = BufferEmitter::new(0x100);
        e.start_function("f");
        e.emit_constant_pool(&[vec![1, 2, 3, 4], vec![5, 6]]);
        assert_eq!(e.constant_pool_entry_address(0), 0x100);
        assert_eq!(e.constant_pool_entry_address(1), 0x104);
    }
}
