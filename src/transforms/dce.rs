//! Dead code elimination.
//!
//! Two granularities, matching how cheap the work is:
//! * [`DeadInstElimination`] is a basic-block pass that sweeps a block
//!   once, erasing side-effect-free instructions with no uses;
//! * [`DeadCodeElimination`] is the worklist version over a whole
//!   function, which also catches chains (erasing one instruction makes
//!   its operands' definitions dead).

use crate::context::Context;
use crate::error::Result;
use crate::ir::function::Function;
use crate::ir::module::Module;
use crate::ir::{BlockId, FuncId, InstId};
use crate::pass::{AnalysisCache, AnalysisUsage, BasicBlockPass, FunctionPass, Preserved};

fn is_trivially_dead(func: &Function, inst: InstId) -> bool {
    let data = func.inst(inst);
    data.parent.is_some()
        && data.uses().is_empty()
        && !data.opcode.has_side_effects()
}

pub struct DeadInstElimination;

impl BasicBlockPass for DeadInstElimination {
    fn name(&self) -> &'static str {
        "Dead Instruction Elimination"
    }

    fn usage(&self) -> AnalysisUsage {
        AnalysisUsage::new().preserves(Preserved::AllCfgOnly)
    }

    fn run(
        &mut self,
        block: BlockId,
        func: FuncId,
        module: &mut Module,
        _cx: &Context,
        _am: &mut AnalysisCache,
    ) -> Result<bool> {
        let func = &mut module.functions[func];
        let mut changed = false;
        // Capture ids first: erasing mutates the block's list.
        let insts: Vec<InstId> = func.block(block).insts.clone();
        for i in insts {
            if is_trivially_dead(func, i) {
                func.erase_inst(i)?;
                changed = true;
            }
        }
        Ok(changed)
    }
}

pub struct DeadCodeElimination;

impl FunctionPass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "Dead Code Elimination"
    }

    fn usage(&self) -> AnalysisUsage {
        AnalysisUsage::new().preserves(Preserved::AllCfgOnly)
    }

    fn run(
        &mut self,
        func: FuncId,
        module: &mut Module,
        _cx: &Context,
        _am: &mut AnalysisCache,
    ) -> Result<bool> {
        let func = &mut module.functions[func];
        let mut worklist: Vec<InstId> = func.inst_ids();
        let mut changed = false;
        while let Some(i) = worklist.pop() {
            if !is_trivially_dead(func, i) {
                continue;
            }
            // Operand definitions may become dead once the edge is gone.
            worklist.extend(
                func.inst(i)
                    .operands
                    .iter()
                    .filter_map(|v| v.as_inst()),
            );
            func.erase_inst(i)?;
            changed = true;
        }
        Ok(changed)
    }
}
