//! Sparse constant propagation.
//!
//! Worklist-driven: any instruction whose operands are all constants is
//! folded through the algebra in [`crate::fold`], its uses are rewritten
//! to the folded constant, and its users are requeued. Runs to fixpoint,
//! so chains like `add 1, 2` feeding `mul _, 3` collapse in one pass.

use log::trace;

use crate::context::Context;
use crate::error::Result;
use crate::fold;
use crate::ir::constant::Constant;
use crate::ir::instruction::Opcode;
use crate::ir::module::Module;
use crate::ir::{FuncId, InstId, ValueRef};
use crate::pass::{AnalysisCache, AnalysisUsage, FunctionPass, Preserved};

pub struct ConstantPropagation;

impl FunctionPass for ConstantPropagation {
    fn name(&self) -> &'static str {
        "Constant Propagation"
    }

    fn usage(&self) -> AnalysisUsage {
        AnalysisUsage::new().preserves(Preserved::AllCfgOnly)
    }

    fn run(
        &mut self,
        func: FuncId,
        module: &mut Module,
        cx: &Context,
        _am: &mut AnalysisCache,
    ) -> Result<bool> {
        let func = &mut module.functions[func];
        let mut worklist: Vec<InstId> = func.inst_ids();
        let mut changed = false;

        while let Some(i) = worklist.pop() {
            if func.inst(i).parent.is_none() {
                continue; // erased by an earlier iteration
            }
            let Some(folded) = try_fold(func.inst(i).opcode, &func.inst(i).operands, cx, func.inst(i).ty)
            else {
                continue;
            };
            trace!(
                "constprop: {} -> constant",
                func.inst(i).opcode.mnemonic()
            );
            // Users become fold candidates once this result is a constant.
            worklist.extend(func.uses_of(ValueRef::Inst(i)).iter().map(|u| u.inst));
            func.replace_all_uses(ValueRef::Inst(i), ValueRef::Const(folded));
            func.erase_inst(i)?;
            changed = true;
        }
        Ok(changed)
    }
}

fn try_fold(
    opcode: Opcode,
    operands: &[ValueRef],
    cx: &Context,
    result_ty: crate::ir::Type,
) -> Option<Constant> {
    let consts: Option<Vec<Constant>> = operands.iter().map(|v| v.as_const()).collect();
    let consts = consts?;
    match opcode {
        Opcode::Cast => fold::fold_cast(cx, consts[0], result_ty),
        Opcode::Not => fold::fold_unary(cx, Opcode::Not, consts[0]),
        op if op.is_binary() => fold::fold_binary(cx, op, consts[0], consts[1]),
        _ => None,
    }
}
