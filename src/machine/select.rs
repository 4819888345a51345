//! A simple instruction selector for the generic target.
//!
//! One IR instruction maps to one machine instruction (plus immediate
//! materializations); phis are eliminated with copies in the
//! predecessors. The selector covers the register subset of the IR:
//! arithmetic, comparisons, shifts, casts, loads and stores through
//! register pointers, direct calls, branches and returns. Promote
//! allocas (mem2reg) before selecting; address-forming instructions are
//! not in the subset.

use std::collections::HashMap;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::ir::function::Function;
use crate::ir::instruction::Opcode;
use crate::ir::module::Module;
use crate::ir::{BlockId, FuncId, ValueRef};

use super::target::generic_ops as ops;
use super::{MBlockId, MOperand, MachineFunction, MachineInst, Reg};

pub fn select_function(f: FuncId, module: &Module, cx: &Context) -> Result<MachineFunction> {
    let func = &module.functions[f];
    let mut sel = Selector {
        mf: MachineFunction::new(func.name.clone()),
        func,
        module,
        cx,
        regs: HashMap::new(),
        blocks: HashMap::new(),
    };
    sel.run()?;
    Ok(sel.mf)
}

struct Selector<'a> {
    mf: MachineFunction,
    func: &'a Function,
    module: &'a Module,
    cx: &'a Context,
    regs: HashMap<ValueRef, Reg>,
    blocks: HashMap<BlockId, MBlockId>,
}

impl Selector<'_> {
    fn run(&mut self) -> Result<()> {
        for &b in self.func.layout() {
            let mb = self.mf.add_block();
            self.blocks.insert(b, mb);
        }
        // Arguments arrive in fresh virtual registers.
        for (a, _) in self.func.args() {
            let r = Reg::Virtual(self.mf.new_vreg());
            self.regs.insert(ValueRef::Arg(a), r);
        }
        // Pre-assign phi results so predecessors can copy into them.
        for &b in self.func.layout() {
            for &i in &self.func.block(b).insts {
                if self.func.inst(i).opcode == Opcode::Phi {
                    let r = Reg::Virtual(self.mf.new_vreg());
                    self.regs.insert(ValueRef::Inst(i), r);
                }
            }
        }
        for &b in self.func.layout() {
            self.select_block(b)?;
        }
        Ok(())
    }

    fn unsupported(&self, op: Opcode) -> Error {
        Error::TypeMismatch {
            context: "generic instruction selection",
            expected: "register-subset instruction".into(),
            found: op.mnemonic().into(),
        }
    }

    /// The register holding `v`, materializing constants as immediates.
    fn reg_of(&mut self, block: MBlockId, v: ValueRef) -> Result<Reg> {
        if let Some(&r) = self.regs.get(&v) {
            return Ok(r);
        }
        match v {
            ValueRef::Const(c) => {
                let value = self
                    .cx
                    .const_int_value(c)
                    .ok_or_else(|| self.unsupported(Opcode::Cast))?;
                let r = Reg::Virtual(self.mf.new_vreg());
                self.mf.push(
                    block,
                    MachineInst::new(ops::IMM, [MOperand::def(r), MOperand::Imm(value)]),
                );
                // Immediates are re-materialized per use site on purpose;
                // don't cache across blocks.
                Ok(r)
            }
            _ => {
                let r = Reg::Virtual(self.mf.new_vreg());
                self.regs.insert(v, r);
                Ok(r)
            }
        }
    }

    fn select_block(&mut self, b: BlockId) -> Result<()> {
        let mb = self.blocks[&b];
        for &i in &self.func.block(b).insts.clone() {
            let data = self.func.inst(i).clone();
            let result = ValueRef::Inst(i);
            match data.opcode {
                Opcode::Phi => {} // handled from the predecessors
                op if op.is_binary() => {
                    let opcode = match op {
                        Opcode::Add => ops::ADD,
                        Opcode::Sub => ops::SUB,
                        Opcode::Mul => ops::MUL,
                        Opcode::Div => ops::DIV,
                        Opcode::Rem => ops::REM,
                        Opcode::And => ops::AND,
                        Opcode::Or => ops::OR,
                        Opcode::Xor => ops::XOR,
                        Opcode::Shl => ops::SHL,
                        Opcode::Shr => ops::SHR,
                        _ => ops::CMP,
                    };
                    let lhs = self.reg_of(mb, data.operands[0])?;
                    let rhs = self.reg_of(mb, data.operands[1])?;
                    let dst = self.def_reg(result);
                    let mut inst = MachineInst::new(
                        opcode,
                        [MOperand::def(dst), MOperand::use_(lhs), MOperand::use_(rhs)],
                    );
                    if opcode == ops::CMP {
                        // The comparison sense rides along as an immediate.
                        inst.operands.push(MOperand::Imm(i64::from(u8::from(op))));
                    }
                    self.mf.push(mb, inst);
                }
                Opcode::Not | Opcode::Cast => {
                    let src = self.reg_of(mb, data.operands[0])?;
                    let dst = self.def_reg(result);
                    let opcode = if data.opcode == Opcode::Not {
                        ops::XOR
                    } else {
                        ops::COPY
                    };
                    let mut operands = vec![MOperand::def(dst), MOperand::use_(src)];
                    if data.opcode == Opcode::Not {
                        operands.push(MOperand::Imm(-1));
                    }
                    self.mf.push(mb, MachineInst::new(opcode, operands));
                }
                Opcode::Load => {
                    let ptr = self.reg_of(mb, data.operands[0])?;
                    let dst = self.def_reg(result);
                    self.mf.push(
                        mb,
                        MachineInst::new(ops::LOAD, [MOperand::def(dst), MOperand::use_(ptr)]),
                    );
                }
                Opcode::Store => {
                    let value = self.reg_of(mb, data.operands[0])?;
                    let ptr = self.reg_of(mb, data.operands[1])?;
                    self.mf.push(
                        mb,
                        MachineInst::new(ops::STORE, [MOperand::use_(value), MOperand::use_(ptr)]),
                    );
                }
                Opcode::Call => {
                    let ValueRef::Global(g) = data.operands[0] else {
                        return Err(self.unsupported(Opcode::Call));
                    };
                    let mut operands = Vec::new();
                    if data.ty != self.cx.void_ty() {
                        operands.push(MOperand::def(self.def_reg(result)));
                    }
                    operands.push(MOperand::Symbol(
                        self.module.globals[g].name.clone().into_boxed_str(),
                    ));
                    for &a in &data.operands[1..] {
                        let r = self.reg_of(mb, a)?;
                        operands.push(MOperand::use_(r));
                    }
                    self.mf.push(mb, MachineInst::new(ops::CALL, operands));
                }
                Opcode::Br => {
                    self.emit_phi_copies(b, data.operands[0].as_block().unwrap())?;
                    let target = self.blocks[&data.operands[0].as_block().unwrap()];
                    self.mf
                        .push(mb, MachineInst::new(ops::JUMP, [MOperand::Block(target)]));
                }
                Opcode::CondBr => {
                    let t = data.operands[1].as_block().unwrap();
                    let e = data.operands[2].as_block().unwrap();
                    self.emit_phi_copies(b, t)?;
                    self.emit_phi_copies(b, e)?;
                    let cond = self.reg_of(mb, data.operands[0])?;
                    self.mf.push(
                        mb,
                        MachineInst::new(
                            ops::BRANCH,
                            [
                                MOperand::use_(cond),
                                MOperand::Block(self.blocks[&t]),
                                MOperand::Block(self.blocks[&e]),
                            ],
                        ),
                    );
                }
                Opcode::Ret => {
                    let mut operands = Vec::new();
                    if let Some(&v) = data.operands.first() {
                        let r = self.reg_of(mb, v)?;
                        operands.push(MOperand::use_(r));
                    }
                    self.mf.push(mb, MachineInst::new(ops::RET, operands));
                }
                op => return Err(self.unsupported(op)),
            }
        }
        Ok(())
    }

    fn def_reg(&mut self, v: ValueRef) -> Reg {
        if let Some(&r) = self.regs.get(&v) {
            return r;
        }
        let r = Reg::Virtual(self.mf.new_vreg());
        self.regs.insert(v, r);
        r
    }

    /// Copies into the phi registers of `succ` for the edge from `pred`.
    fn emit_phi_copies(&mut self, pred: BlockId, succ: BlockId) -> Result<()> {
        let mb = self.blocks[&pred];
        for &i in &self.func.block(succ).insts.clone() {
            if self.func.inst(i).opcode != Opcode::Phi {
                break;
            }
            let incoming: Vec<_> = self.func.inst(i).phi_incoming().collect();
            for (value, from) in incoming {
                if from == pred {
                    let src = self.reg_of(mb, value)?;
                    let dst = self.regs[&ValueRef::Inst(i)];
                    self.mf.push(
                        mb,
                        MachineInst::new(ops::COPY, [MOperand::def(dst), MOperand::use_(src)]),
                    );
                }
            }
        }
        Ok(())
    }
}
