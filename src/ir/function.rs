//! Functions and basic blocks.
//!
//! A [`Function`] owns three arenas (arguments, blocks, instructions)
//! plus a layout vector giving block order; the entry block is the first
//! layout entry. Instruction slots are never reused: erasing unlinks the
//! instruction and tombstones its slot, which keeps every outstanding
//! `InstId` meaningful for the lifetime of the function.

use std::collections::HashMap;
use std::mem;

use index_vec::IndexVec;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::ir::instruction::{InstData, Opcode};
use crate::ir::module::{Globals, Linkage};
use crate::ir::types::{Type, TypeKind};
use crate::ir::{ArgId, BlockId, InstId, Use, ValueRef};

#[derive(Debug, Clone)]
pub struct ArgData {
    pub ty: Type,
    pub name: Option<String>,
    pub(crate) uses: Vec<Use>,
}

#[derive(Debug, Clone, Default)]
pub struct BasicBlockData {
    pub name: Option<String>,
    /// Instructions in execution order. The terminator, when present, is
    /// last.
    pub insts: Vec<InstId>,
    pub(crate) uses: Vec<Use>,
    pub(crate) dead: bool,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    /// The function signature type (`TypeKind::Function`).
    pub ty: Type,
    pub linkage: Linkage,
    pub(crate) args: IndexVec<ArgId, ArgData>,
    pub(crate) blocks: IndexVec<BlockId, BasicBlockData>,
    pub(crate) insts: IndexVec<InstId, InstData>,
    /// Block order; `layout[0]` is the entry block.
    pub(crate) layout: Vec<BlockId>,
    symtab: HashMap<(Type, String), ValueRef>,
    /// Cached `label` type; blocks are keyed under it in the symbol table.
    label_ty: Type,
}

impl Function {
    /// Create an empty function (a declaration until blocks are added).
    /// Arguments are materialized from the signature's parameter list.
    pub fn new(name: impl Into<String>, ty: Type, linkage: Linkage, cx: &Context) -> Result<Self> {
        let params = match cx.kind(ty) {
            TypeKind::Function { params, .. } => params,
            _ => {
                return Err(Error::TypeMismatch {
                    context: "function signature",
                    expected: "function type".into(),
                    found: cx.type_name(ty),
                });
            }
        };
        let args = params
            .iter()
            .map(|&ty| ArgData {
                ty,
                name: None,
                uses: Vec::new(),
            })
            .collect();
        Ok(Self {
            name: name.into(),
            ty,
            linkage,
            args,
            blocks: IndexVec::new(),
            insts: IndexVec::new(),
            layout: Vec::new(),
            symtab: HashMap::new(),
            label_ty: cx.label_ty(),
        })
    }

    /// The declared return type.
    pub fn return_ty(&self, cx: &Context) -> Type {
        match cx.kind(self.ty) {
            TypeKind::Function { ret, .. } => ret,
            _ => unreachable!("function carries a function type"),
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.layout.is_empty()
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.layout.first().copied()
    }

    pub fn layout(&self) -> &[BlockId] {
        &self.layout
    }

    pub fn args(&self) -> impl Iterator<Item = (ArgId, &ArgData)> {
        self.args.iter_enumerated()
    }

    pub fn arg(&self, a: ArgId) -> &ArgData {
        &self.args[a]
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    pub fn block(&self, b: BlockId) -> &BasicBlockData {
        &self.blocks[b]
    }

    pub fn inst(&self, i: InstId) -> &InstData {
        &self.insts[i]
    }

    /// All live instruction ids, in layout order.
    pub fn inst_ids(&self) -> Vec<InstId> {
        self.layout
            .iter()
            .flat_map(|&b| self.blocks[b].insts.iter().copied())
            .collect()
    }

    // ---- blocks ----------------------------------------------------------

    /// Append a new empty block to the end of the function.
    pub fn add_block(&mut self) -> BlockId {
        let b = self.blocks.push(BasicBlockData::default());
        self.layout.push(b);
        b
    }

    /// The block terminator, if the block currently ends in one.
    pub fn terminator(&self, b: BlockId) -> Option<InstId> {
        let &last = self.blocks[b].insts.last()?;
        self.insts[last].opcode.is_terminator().then_some(last)
    }

    /// Successor blocks of `b` in terminator operand order.
    pub fn successors(&self, b: BlockId) -> Vec<BlockId> {
        self.terminator(b)
            .map(|t| self.insts[t].successors())
            .unwrap_or_default()
    }

    /// Predecessor blocks of `b`, deduplicated, in discovery order.
    pub fn predecessors(&self, b: BlockId) -> Vec<BlockId> {
        let mut preds = Vec::new();
        for u in &self.blocks[b].uses {
            let user = &self.insts[u.inst];
            if user.opcode.is_terminator() {
                if let Some(parent) = user.parent {
                    if !preds.contains(&parent) {
                        preds.push(parent);
                    }
                }
            }
        }
        preds
    }

    /// Erase an empty-of-uses, already-unreferenced block. All its
    /// instructions must have been erased first.
    pub fn erase_block(&mut self, b: BlockId) -> Result<()> {
        if self.blocks[b].dead {
            return Ok(());
        }
        if !self.blocks[b].insts.is_empty() {
            return Err(Error::Structural {
                value: format!("block {}", b.raw()),
                message: "cannot erase a block that still contains instructions".into(),
            });
        }
        if !self.blocks[b].uses.is_empty() {
            return Err(Error::Structural {
                value: format!("block {}", b.raw()),
                message: "cannot erase a block that still has uses".into(),
            });
        }
        if let Some(name) = self.blocks[b].name.take() {
            self.symtab.remove(&(self.label_ty, name));
        }
        self.layout.retain(|&x| x != b);
        self.blocks[b].dead = true;
        Ok(())
    }

    // ---- use lists -------------------------------------------------------

    pub fn uses_of(&self, v: ValueRef) -> &[Use] {
        match v {
            ValueRef::Inst(i) => &self.insts[i].uses,
            ValueRef::Arg(a) => &self.args[a].uses,
            ValueRef::Block(b) => &self.blocks[b].uses,
            _ => &[],
        }
    }

    fn uses_mut(&mut self, v: ValueRef) -> Option<&mut Vec<Use>> {
        match v {
            ValueRef::Inst(i) => Some(&mut self.insts[i].uses),
            ValueRef::Arg(a) => Some(&mut self.args[a].uses),
            ValueRef::Block(b) => Some(&mut self.blocks[b].uses),
            _ => None,
        }
    }

    fn add_use(&mut self, v: ValueRef, u: Use) {
        if let Some(uses) = self.uses_mut(v) {
            uses.push(u);
        }
    }

    fn remove_use(&mut self, v: ValueRef, u: Use) {
        if let Some(uses) = self.uses_mut(v) {
            if let Some(pos) = uses.iter().position(|&x| x == u) {
                uses.swap_remove(pos);
            }
        }
    }

    // ---- instructions ----------------------------------------------------

    /// Create a detached instruction, registering a use for every
    /// operand. The caller inserts it into a block (or leaves it detached,
    /// as clones start out).
    pub fn create_inst(&mut self, data: InstData) -> InstId {
        let operands = data.operands.clone();
        let id = self.insts.push(data);
        for (idx, &op) in operands.iter().enumerate() {
            self.add_use(
                op,
                Use {
                    inst: id,
                    index: idx as u32,
                },
            );
        }
        id
    }

    /// Append an instruction to the end of a block.
    pub fn append_inst(&mut self, block: BlockId, data: InstData) -> InstId {
        let id = self.create_inst(data);
        self.insts[id].parent = Some(block);
        self.blocks[block].insts.push(id);
        id
    }

    /// Insert a detached instruction immediately before `before`.
    pub fn insert_before(&mut self, before: InstId, data: InstData) -> InstId {
        let block = self.insts[before].parent.expect("insertion point is linked");
        let id = self.create_inst(data);
        self.insts[id].parent = Some(block);
        let pos = self.blocks[block]
            .insts
            .iter()
            .position(|&i| i == before)
            .expect("instruction is in its parent block");
        self.blocks[block].insts.insert(pos, id);
        id
    }

    /// A fresh, parentless, unnamed copy of an instruction. The copy
    /// shares the original's operands (and so registers new uses).
    pub fn clone_inst(&mut self, inst: InstId) -> InstId {
        let data = InstData::new(
            self.insts[inst].opcode,
            self.insts[inst].ty,
            self.insts[inst].operands.clone(),
        );
        self.create_inst(data)
    }

    /// Rewrite one operand slot, maintaining both use lists.
    pub fn set_operand(&mut self, inst: InstId, index: usize, value: ValueRef) {
        let old = self.insts[inst].operands[index];
        if old == value {
            return;
        }
        let u = Use {
            inst,
            index: index as u32,
        };
        self.remove_use(old, u);
        self.insts[inst].operands[index] = value;
        self.add_use(value, u);
    }

    /// Redirect every use of `old` to `new`. Cost is proportional to the
    /// use count of `old`. The caller guarantees `type(old) == type(new)`;
    /// the typed wrapper on [`Builder`](crate::ir::Builder) checks it.
    pub fn replace_all_uses(&mut self, old: ValueRef, new: ValueRef) {
        debug_assert_ne!(old, new, "replacing a value with itself");
        let uses = match self.uses_mut(old) {
            Some(uses) => mem::take(uses),
            None => return,
        };
        for &u in &uses {
            self.insts[u.inst].operands[u.index as usize] = new;
        }
        if let Some(new_uses) = self.uses_mut(new) {
            new_uses.extend_from_slice(&uses);
        }
    }

    /// Unlink an instruction from its block without destroying it.
    pub fn remove_from_block(&mut self, inst: InstId) {
        if let Some(block) = self.insts[inst].parent.take() {
            self.blocks[block].insts.retain(|&i| i != inst);
        }
    }

    /// Destroy an instruction. Its use list must be empty; replace or
    /// drop the uses first (dead phis may RAUW to a null constant).
    pub fn erase_inst(&mut self, inst: InstId) -> Result<()> {
        if !self.insts[inst].uses.is_empty() {
            return Err(Error::Structural {
                value: self.describe_value(ValueRef::Inst(inst)),
                message: format!(
                    "cannot erase an instruction with {} remaining use(s)",
                    self.insts[inst].uses.len()
                ),
            });
        }
        self.remove_from_block(inst);
        let operands = mem::take(&mut self.insts[inst].operands);
        for (idx, op) in operands.into_iter().enumerate() {
            self.remove_use(
                op,
                Use {
                    inst,
                    index: idx as u32,
                },
            );
        }
        if let Some(name) = self.insts[inst].name.take() {
            let ty = self.insts[inst].ty;
            self.symtab.remove(&(ty, name));
        }
        self.insts[inst].dead = true;
        Ok(())
    }

    // ---- phi maintenance -------------------------------------------------

    /// Append an incoming (value, predecessor) pair to a phi.
    pub fn add_phi_incoming(&mut self, phi: InstId, value: ValueRef, pred: BlockId) {
        debug_assert_eq!(self.insts[phi].opcode, Opcode::Phi);
        let n = self.insts[phi].operands.len();
        self.insts[phi].operands.push(value);
        self.insts[phi].operands.push(ValueRef::Block(pred));
        self.add_use(
            value,
            Use {
                inst: phi,
                index: n as u32,
            },
        );
        self.add_use(
            ValueRef::Block(pred),
            Use {
                inst: phi,
                index: (n + 1) as u32,
            },
        );
    }

    /// Remove the incoming pair for `pred`.
    ///
    /// If that pair was the phi's only incoming and `delete_if_empty` is
    /// set, the phi is replaced by the removed value and erased.
    /// Otherwise a phi left with zero operands stays behind for the
    /// caller to deal with.
    pub fn remove_phi_incoming(
        &mut self,
        phi: InstId,
        pred: BlockId,
        delete_if_empty: bool,
    ) -> Result<()> {
        debug_assert_eq!(self.insts[phi].opcode, Opcode::Phi);
        let pair = self.insts[phi]
            .phi_incoming()
            .position(|(_, b)| b == pred)
            .ok_or_else(|| Error::Structural {
                value: self.describe_value(ValueRef::Inst(phi)),
                message: format!("phi has no incoming for block {}", pred.raw()),
            })?;
        let value = self.insts[phi].operands[pair * 2];
        if self.insts[phi].operands.len() == 2 && delete_if_empty {
            self.drop_operand_pair(phi, pair);
            if value != ValueRef::Inst(phi) {
                self.replace_all_uses(ValueRef::Inst(phi), value);
            }
            return self.erase_inst(phi);
        }
        self.drop_operand_pair(phi, pair);
        Ok(())
    }

    /// Remove operand slots `pair*2` and `pair*2 + 1`, shifting the
    /// remaining use indices down.
    fn drop_operand_pair(&mut self, inst: InstId, pair: usize) {
        let base = pair * 2;
        for offset in [1usize, 0] {
            let idx = base + offset;
            let op = self.insts[inst].operands[idx];
            self.remove_use(
                op,
                Use {
                    inst,
                    index: idx as u32,
                },
            );
            self.insts[inst].operands.remove(idx);
        }
        // Uses past the removed pair shifted down by two.
        let operands = self.insts[inst].operands.clone();
        for (idx, &op) in operands.iter().enumerate().skip(base) {
            if let Some(uses) = self.uses_mut(op) {
                for u in uses.iter_mut() {
                    if u.inst == inst && u.index as usize == idx + 2 {
                        u.index = idx as u32;
                    }
                }
            }
        }
    }

    // ---- typing & names --------------------------------------------------

    /// The type of any value as seen from inside this function.
    pub fn value_ty(&self, v: ValueRef, globals: &Globals, cx: &Context) -> Type {
        match v {
            ValueRef::Const(c) => cx.const_type(c),
            ValueRef::Global(g) => cx.pointer_to(globals[g].ty),
            ValueRef::Arg(a) => self.args[a].ty,
            ValueRef::Block(_) => cx.label_ty(),
            ValueRef::Inst(i) => self.insts[i].ty,
        }
    }

    /// Assign or clear a name on a local value. Names are unique per
    /// (type, name) in the function scope; a colliding name gets a
    /// numeric suffix. Returns the name actually assigned.
    pub fn set_value_name(
        &mut self,
        v: ValueRef,
        name: Option<&str>,
        globals: &Globals,
        cx: &Context,
    ) -> Option<String> {
        let ty = match v {
            ValueRef::Block(_) => self.label_ty,
            _ => self.value_ty(v, globals, cx),
        };
        // Drop the previous entry, if any.
        if let Some(old) = self.name_of(v).map(str::to_owned) {
            self.symtab.remove(&(ty, old));
        }
        let assigned = name.map(|base| {
            let mut candidate = base.to_owned();
            let mut counter = 0u32;
            while self.symtab.contains_key(&(ty, candidate.clone())) {
                candidate = format!("{base}.{counter}");
                counter += 1;
            }
            self.symtab.insert((ty, candidate.clone()), v);
            candidate
        });
        match v {
            ValueRef::Inst(i) => self.insts[i].name = assigned.clone(),
            ValueRef::Arg(a) => self.args[a].name = assigned.clone(),
            ValueRef::Block(b) => self.blocks[b].name = assigned.clone(),
            _ => {}
        }
        assigned
    }

    pub fn name_of(&self, v: ValueRef) -> Option<&str> {
        match v {
            ValueRef::Inst(i) => self.insts[i].name.as_deref(),
            ValueRef::Arg(a) => self.args[a].name.as_deref(),
            ValueRef::Block(b) => self.blocks[b].name.as_deref(),
            _ => None,
        }
    }

    /// Look up a named local value by (type, name).
    pub fn lookup(&self, ty: Type, name: &str) -> Option<ValueRef> {
        self.symtab.get(&(ty, name.to_owned())).copied()
    }

    /// Look up a named block.
    pub fn lookup_block(&self, name: &str) -> Option<BlockId> {
        self.symtab
            .get(&(self.label_ty, name.to_owned()))
            .and_then(|v| v.as_block())
    }

    /// A short human-readable identity for diagnostics.
    pub fn describe_value(&self, v: ValueRef) -> String {
        match v {
            ValueRef::Inst(i) => match &self.insts[i].name {
                Some(name) => format!("%{name}"),
                None => format!("{} (inst {})", self.insts[i].opcode.mnemonic(), i.raw()),
            },
            ValueRef::Arg(a) => match &self.args[a].name {
                Some(name) => format!("%{name}"),
                None => format!("argument {}", a.raw()),
            },
            ValueRef::Block(b) => match &self.blocks[b].name {
                Some(name) => format!("%{name}"),
                None => format!("block {}", b.raw()),
            },
            ValueRef::Global(g) => format!("global {}", g.raw()),
            ValueRef::Const(_) => "constant".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::Builder;
    use crate::ir::module::Module;
    use crate::ir::verifier;

    fn one_function(cx: &Context) -> (Module, crate::ir::FuncId) {
        let mut module = Module::new("t", cx);
        let sig = cx.function_ty(cx.i32_ty(), &[cx.i32_ty()], false);
        let g = module
            .add_function("f", sig, Linkage::External, cx)
            .unwrap();
        let f = module.globals[g].function_id().unwrap();
        (module, f)
    }

    #[test]
    fn rauw_moves_every_use() {
        let cx = Context::new();
        let (mut module, f) = one_function(&cx);
        let Module {
            globals, functions, ..
        } = &mut module;
        let func = &mut functions[f];
        let mut b = Builder::new(&cx, globals, func);
        b.start_block();
        let x = ValueRef::Arg(ArgId::from_raw(0));
        let one = ValueRef::Const(cx.const_int(cx.i32_ty(), 1).unwrap());
        let a = b.binary(Opcode::Add, x, one).unwrap();
        let m = b.binary(Opcode::Mul, a, a).unwrap();
        b.ret(Some(m)).unwrap();

        assert_eq!(func.uses_of(a).len(), 2);
        func.replace_all_uses(a, x);
        assert!(func.uses_of(a).is_empty());
        let mul = m.as_inst().unwrap();
        assert_eq!(func.inst(mul).operands[0], x);
        assert_eq!(func.inst(mul).operands[1], x);
        // The add is now dead and erasable.
        func.erase_inst(a.as_inst().unwrap()).unwrap();
        verifier::verify_function(func, globals, &cx).unwrap();
    }

    #[test]
    fn erase_with_live_uses_is_refused() {
        let cx = Context::new();
        let (mut module, f) = one_function(&cx);
        let Module {
            globals, functions, ..
        } = &mut module;
        let func = &mut functions[f];
        let mut b = Builder::new(&cx, globals, func);
        b.start_block();
        let x = ValueRef::Arg(ArgId::from_raw(0));
        let one = ValueRef::Const(cx.const_int(cx.i32_ty(), 1).unwrap());
        let a = b.binary(Opcode::Add, x, one).unwrap();
        b.ret(Some(a)).unwrap();
        assert!(func.erase_inst(a.as_inst().unwrap()).is_err());
    }

    #[test]
    fn builder_rejects_type_mismatches() {
        let cx = Context::new();
        let (mut module, f) = one_function(&cx);
        let Module {
            globals, functions, ..
        } = &mut module;
        let func = &mut functions[f];
        let before = func.insts.len();
        let mut b = Builder::new(&cx, globals, func);
        b.start_block();
        let x = ValueRef::Arg(ArgId::from_raw(0));
        let wide = ValueRef::Const(cx.const_int(cx.i64_ty(), 1).unwrap());
        assert!(b.binary(Opcode::Add, x, wide).is_err());
        assert!(b.ret(None).is_err());
        // Failed builds leave no partial instruction behind.
        assert_eq!(func.insts.len(), before);
    }

    #[test]
    fn removing_the_last_phi_incoming() {
        let cx = Context::new();
        let (mut module, f) = one_function(&cx);
        let Module {
            globals, functions, ..
        } = &mut module;
        let func = &mut functions[f];
        let mut b = Builder::new(&cx, globals, func);
        let entry = b.start_block();
        let exit = b.func.add_block();
        b.br(exit).unwrap();
        b.position_at_end(exit);
        let x = ValueRef::Arg(ArgId::from_raw(0));
        let phi = b.phi(cx.i32_ty()).unwrap();
        b.add_incoming(phi, x, entry).unwrap();
        b.ret(Some(phi)).unwrap();

        // With delete-if-empty, the phi folds to its only incoming.
        let phi_inst = phi.as_inst().unwrap();
        func.remove_phi_incoming(phi_inst, entry, true).unwrap();
        let ret = func.terminator(exit).unwrap();
        assert_eq!(func.inst(ret).operands[0], x);
        verifier::verify_function(func, globals, &cx).unwrap();
    }

    #[test]
    fn phi_left_empty_without_delete_flag() {
        let cx = Context::new();
        let (mut module, f) = one_function(&cx);
        let Module {
            globals, functions, ..
        } = &mut module;
        let func = &mut functions[f];
        let mut b = Builder::new(&cx, globals, func);
        let entry = b.start_block();
        let exit = b.func.add_block();
        b.br(exit).unwrap();
        b.position_at_end(exit);
        let x = ValueRef::Arg(ArgId::from_raw(0));
        let phi = b.phi(cx.i32_ty()).unwrap();
        b.add_incoming(phi, x, entry).unwrap();
        b.ret(Some(phi)).unwrap();

        let phi_inst = phi.as_inst().unwrap();
        func.remove_phi_incoming(phi_inst, entry, false).unwrap();
        // Zero operands; the caller is responsible for cleanup.
        assert!(func.inst(phi_inst).operands.is_empty());
    }

    #[test]
    fn names_relocate_in_the_symbol_table() {
        let cx = Context::new();
        let (mut module, f) = one_function(&cx);
        let Module {
            globals, functions, ..
        } = &mut module;
        let func = &mut functions[f];
        let x = ValueRef::Arg(ArgId::from_raw(0));
        func.set_value_name(x, Some("count"), globals, &cx);
        assert_eq!(func.lookup(cx.i32_ty(), "count"), Some(x));
        func.set_value_name(x, Some("n"), globals, &cx);
        assert_eq!(func.lookup(cx.i32_ty(), "count"), None);
        assert_eq!(func.lookup(cx.i32_ty(), "n"), Some(x));
    }

    #[test]
    fn colliding_names_get_suffixes() {
        let cx = Context::new();
        let (mut module, f) = one_function(&cx);
        let Module {
            globals, functions, ..
        } = &mut module;
        let func = &mut functions[f];
        let mut b = Builder::new(&cx, globals, func);
        b.start_block();
        let x = ValueRef::Arg(ArgId::from_raw(0));
        let one = ValueRef::Const(cx.const_int(cx.i32_ty(), 1).unwrap());
        let a = b.binary(Opcode::Add, x, one).unwrap();
        let c = b.binary(Opcode::Add, x, one).unwrap();
        let first = func.set_value_name(a, Some("sum"), globals, &cx).unwrap();
        let second = func.set_value_name(c, Some("sum"), globals, &cx).unwrap();
        assert_eq!(first, "sum");
        assert_ne!(first, second);
        // Same name under a different type coexists.
        let entry = func.entry().unwrap();
        let mut b = Builder::new(&cx, globals, func);
        b.position_at_end(entry);
        let narrow = b.cast(x, cx.i8_ty()).unwrap();
        let third = func
            .set_value_name(narrow, Some("sum"), globals, &cx)
            .unwrap();
        assert_eq!(third, "sum");
    }

    #[test]
    fn cloned_instructions_are_detached_and_unnamed() {
        let cx = Context::new();
        let (mut module, f) = one_function(&cx);
        let Module {
            globals, functions, ..
        } = &mut module;
        let func = &mut functions[f];
        let mut b = Builder::new(&cx, globals, func);
        b.start_block();
        let x = ValueRef::Arg(ArgId::from_raw(0));
        let one = ValueRef::Const(cx.const_int(cx.i32_ty(), 1).unwrap());
        let a = b.binary(Opcode::Add, x, one).unwrap();
        func.set_value_name(a, Some("a"), globals, &cx);

        let clone = func.clone_inst(a.as_inst().unwrap());
        assert!(func.inst(clone).parent.is_none());
        assert!(func.inst(clone).name.is_none());
        assert_eq!(func.inst(clone).operands[0], x);
        // The clone registered uses of its operands.
        assert!(func
            .uses_of(x)
            .iter()
            .any(|u| u.inst == clone && u.index == 0));
    }
}
