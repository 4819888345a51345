//! Dominator sets.
//!
//! Straightforward iterative dataflow over the CFG: `dom(entry) =
//! {entry}`, `dom(b) = {b} ∪ ⋂ dom(preds(b))`, iterated to fixpoint.
//! Unreachable blocks are recorded as such and dominate nothing.

use bit_set::BitSet;
use index_vec::IndexVec;

use crate::ir::function::Function;
use crate::ir::instruction::Opcode;
use crate::ir::{BlockId, InstId, ValueRef};

#[derive(Debug, Clone)]
pub struct DominatorInfo {
    sets: IndexVec<BlockId, BitSet>,
    reachable: BitSet,
}

impl DominatorInfo {
    pub fn compute(func: &Function) -> Self {
        let n = func.blocks.len();
        let mut sets: IndexVec<BlockId, BitSet> =
            (0..n).map(|_| BitSet::with_capacity(n)).collect();
        let mut reachable = BitSet::with_capacity(n);
        let Some(entry) = func.entry() else {
            return Self { sets, reachable };
        };

        // Reachability first, so unreachable preds don't poison the meet.
        let mut stack = vec![entry];
        while let Some(b) = stack.pop() {
            if reachable.insert(b.index()) {
                stack.extend(func.successors(b));
            }
        }

        // Initialize: entry = {entry}, everything reachable = all.
        let all: BitSet = reachable.clone();
        for &b in func.layout() {
            if !reachable.contains(b.index()) {
                continue;
            }
            if b == entry {
                sets[b].insert(b.index());
            } else {
                sets[b] = all.clone();
            }
        }

        let mut changed = true;
        while changed {
            changed = false;
            for &b in func.layout() {
                if b == entry || !reachable.contains(b.index()) {
                    continue;
                }
                let mut meet: Option<BitSet> = None;
                for p in func.predecessors(b) {
                    if !reachable.contains(p.index()) {
                        continue;
                    }
                    meet = Some(match meet {
                        None => sets[p].clone(),
                        Some(mut m) => {
                            m.intersect_with(&sets[p]);
                            m
                        }
                    });
                }
                let mut new = meet.unwrap_or_default();
                new.insert(b.index());
                if new != sets[b] {
                    sets[b] = new;
                    changed = true;
                }
            }
        }
        Self { sets, reachable }
    }

    pub fn is_reachable(&self, b: BlockId) -> bool {
        self.reachable.contains(b.index())
    }

    /// Does `a` dominate `b`? Unreachable blocks dominate nothing and
    /// are dominated by everything (vacuous truth over no paths).
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.reachable.contains(b.index()) {
            return true;
        }
        self.sets[b].contains(a.index())
    }

    /// Does the definition `def` dominate the use at operand `index` of
    /// `user`? Phi uses are considered to occur at the end of the
    /// incoming predecessor block.
    pub fn def_dominates_use(
        &self,
        func: &Function,
        def: ValueRef,
        user: InstId,
        index: usize,
    ) -> bool {
        let def_inst = match def {
            ValueRef::Inst(i) => i,
            // Arguments, constants, globals and blocks dominate everything.
            _ => return true,
        };
        let Some(def_block) = func.inst(def_inst).parent else {
            return false;
        };
        let user_data = func.inst(user);
        let Some(use_block) = user_data.parent else {
            return false;
        };

        let effective_use_block = if user_data.opcode == Opcode::Phi {
            // The matching incoming block is the next operand slot.
            match user_data.operands.get(index + 1).and_then(|v| v.as_block()) {
                Some(pred) => pred,
                None => use_block,
            }
        } else {
            use_block
        };

        if user_data.opcode == Opcode::Phi {
            // Use at end of predecessor: block-level dominance suffices.
            return self.dominates(def_block, effective_use_block);
        }
        if def_block != effective_use_block {
            return self.dominates(def_block, effective_use_block);
        }
        // Same block: definition must come first.
        let insts = &func.block(def_block).insts;
        let def_pos = insts.iter().position(|&i| i == def_inst);
        let use_pos = insts.iter().position(|&i| i == user);
        matches!((def_pos, use_pos), (Some(d), Some(u)) if d < u)
    }
}

/// Analysis id under which [`DominatorInfo`] is cached.
pub const DOMINATORS: crate::pass::AnalysisId = "domset";

/// The analysis pass computing dominator sets for the current function.
#[derive(Default)]
pub struct DominatorAnalysis;

impl crate::pass::FunctionPass for DominatorAnalysis {
    fn name(&self) -> &'static str {
        "Dominator Set Construction"
    }

    fn usage(&self) -> crate::pass::AnalysisUsage {
        crate::pass::AnalysisUsage::new()
            .provides(DOMINATORS)
            .preserves(crate::pass::Preserved::All)
    }

    fn run(
        &mut self,
        func: crate::ir::FuncId,
        module: &mut crate::ir::Module,
        _cx: &crate::context::Context,
        am: &mut crate::pass::AnalysisCache,
    ) -> crate::error::Result<bool> {
        am.put(DOMINATORS, DominatorInfo::compute(&module.functions[func]));
        Ok(false)
    }
}

pub fn register(registry: &mut crate::pass::PassRegistry) {
    registry.register(crate::pass::PassInfo {
        name: "Dominator Set Construction",
        argument: DOMINATORS,
        kind: crate::pass::PassKind::Analysis,
        cfg_only: true,
        ctor: || crate::pass::AnyPass::Function(Box::new(DominatorAnalysis)),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::ir::module::Module;
    use crate::ir::Builder;

    #[test]
    fn diamond_dominance() {
        let cx = Context::new();
        let mut module = Module::new("t", &cx);
        let sig = cx.function_ty(cx.void_ty(), &[], false);
        let g = module.add_function("f", sig, Default::default(), &cx).unwrap();
        let f = module.globals[g].function_id().unwrap();
        let Module {
            globals, functions, ..
        } = &mut module;
        let func = &mut functions[f];
        let mut b = Builder::new(&cx, globals, func);
        let entry = b.start_block();
        let left = b.func.add_block();
        let right = b.func.add_block();
        let join = b.func.add_block();
        let c = cx.const_bool(true);
        b.position_at_end(entry);
        b.cond_br(ValueRef::Const(c), left, right).unwrap();
        b.position_at_end(left);
        b.br(join).unwrap();
        b.position_at_end(right);
        b.br(join).unwrap();
        b.position_at_end(join);
        b.ret(None).unwrap();

        let dom = DominatorInfo::compute(func);
        assert!(dom.dominates(entry, join));
        assert!(dom.dominates(entry, left));
        assert!(!dom.dominates(left, join));
        assert!(!dom.dominates(join, left));
        assert!(dom.dominates(join, join));
    }
}
