//! Promotion of allocas to SSA registers.
//!
//! An alloca is promotable when its address never escapes: every use is
//! a `load` or a `store` storing *through* it (never storing the address
//! itself). Two shapes are rewritten:
//!
//! * all loads and stores in one block: a forward sweep replaces each
//!   load with the most recent stored value;
//! * exactly one store anywhere: loads dominated by the store read the
//!   stored value.
//!
//! Anything else (including loads that may execute before any store) is
//! left alone. Once every load is rewritten, the stores and the alloca
//! itself are erased.

use std::collections::HashMap;

use log::trace;

use crate::analysis::dominance::{DominatorInfo, DOMINATORS};
use crate::context::Context;
use crate::error::Result;
use crate::ir::function::Function;
use crate::ir::instruction::Opcode;
use crate::ir::module::Module;
use crate::ir::{FuncId, InstId, ValueRef};
use crate::pass::{AnalysisCache, AnalysisUsage, FunctionPass, Preserved};

pub struct PromoteMem2Reg;

impl FunctionPass for PromoteMem2Reg {
    fn name(&self) -> &'static str {
        "Promote Memory to Register"
    }

    fn usage(&self) -> AnalysisUsage {
        AnalysisUsage::new()
            .requires(DOMINATORS)
            .preserves(Preserved::AllCfgOnly)
    }

    fn run(
        &mut self,
        func: FuncId,
        module: &mut Module,
        _cx: &Context,
        am: &mut AnalysisCache,
    ) -> Result<bool> {
        let dom = am
            .get::<DominatorInfo>(DOMINATORS)
            .expect("scheduler provides required analyses");
        let func = &mut module.functions[func];
        let mut changed = false;
        for alloca in allocas(func) {
            if let Some(plan) = plan_promotion(func, alloca, &dom) {
                apply(func, alloca, plan)?;
                changed = true;
            }
        }
        Ok(changed)
    }
}

fn allocas(func: &Function) -> Vec<InstId> {
    func.inst_ids()
        .into_iter()
        .filter(|&i| func.inst(i).opcode == Opcode::Alloca && func.inst(i).operands.is_empty())
        .collect()
}

/// load -> replacement value, for every load of the alloca.
type Plan = HashMap<InstId, ValueRef>;

fn plan_promotion(func: &Function, alloca: InstId, dom: &DominatorInfo) -> Option<Plan> {
    let addr = ValueRef::Inst(alloca);
    let mut loads = Vec::new();
    let mut stores = Vec::new();
    for u in func.uses_of(addr) {
        let user = func.inst(u.inst);
        match user.opcode {
            Opcode::Load => loads.push(u.inst),
            // The address must be the store destination, not the value.
            Opcode::Store if u.index == 1 => stores.push(u.inst),
            _ => return None, // address escapes
        }
    }

    if loads.is_empty() {
        // Only stores (or nothing): every one is dead.
        return Some(Plan::new());
    }

    let mut use_blocks = loads
        .iter()
        .chain(&stores)
        .filter_map(|&i| func.inst(i).parent);
    let first_block = use_blocks.next();
    let single_block = match first_block {
        Some(b) if use_blocks.all(|x| x == b) => Some(b),
        _ => None,
    };

    if let Some(block) = single_block {
        // One forward sweep; a load before the first store blocks the
        // whole promotion.
        let mut plan = Plan::new();
        let mut current: Option<ValueRef> = None;
        for &i in &func.block(block).insts {
            let data = func.inst(i);
            if stores.contains(&i) {
                current = Some(data.operands[0]);
            } else if loads.contains(&i) {
                plan.insert(i, current?);
            }
        }
        return Some(plan);
    }

    if stores.len() == 1 {
        let store = stores[0];
        let value = func.inst(store).operands[0];
        let mut plan = Plan::new();
        for &load in &loads {
            let store_block = func.inst(store).parent?;
            let load_block = func.inst(load).parent?;
            let dominated = if store_block == load_block {
                let insts = &func.block(store_block).insts;
                insts.iter().position(|&x| x == store)? < insts.iter().position(|&x| x == load)?
            } else {
                dom.dominates(store_block, load_block)
            };
            if !dominated {
                return None;
            }
            plan.insert(load, value);
        }
        return Some(plan);
    }

    None
}

fn apply(func: &mut Function, alloca: InstId, plan: Plan) -> Result<()> {
    trace!("mem2reg: promoting alloca {}", alloca.raw());
    for (load, value) in plan {
        func.replace_all_uses(ValueRef::Inst(load), value);
        func.erase_inst(load)?;
    }
    // Remaining uses are stores; drop them, then the alloca.
    let stores: Vec<InstId> = func
        .uses_of(ValueRef::Inst(alloca))
        .iter()
        .map(|u| u.inst)
        .collect();
    for store in stores {
        func.erase_inst(store)?;
    }
    func.erase_inst(alloca)
}
