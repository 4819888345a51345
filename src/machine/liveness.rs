//! Live-variable analysis over machine functions.
//!
//! Tracks, per virtual register: the defining instruction, the
//! instructions at which the value is killed (last used), and defs that
//! are never used (dead). The two-address rewrite updates this in place
//! when it inserts copies, so a register allocator downstream sees a
//! consistent picture without recomputation.

use std::collections::HashMap;

use bit_set::BitSet;

use super::{MBlockId, MInstId, MachineFunction, VReg};

#[derive(Debug, Clone, Default)]
pub struct LiveVariables {
    /// Defining instruction per virtual register.
    def_inst: HashMap<VReg, MInstId>,
    /// Instructions at which the register's live range ends.
    kills: HashMap<VReg, Vec<MInstId>>,
    /// Defs whose value is never used, by defining instruction.
    dead: HashMap<VReg, Vec<MInstId>>,
}

impl LiveVariables {
    /// Compute liveness with a backward walk per block, merging
    /// live-out over successors until a fixpoint. (Machine blocks don't
    /// carry explicit successor edges; block-terminating jumps name
    /// their targets, which is all the walk needs.)
    pub fn compute(mf: &MachineFunction) -> Self {
        let num_vregs = mf.num_vregs() as usize;
        // live-in sets per block, as vreg bit sets
        let mut live_in: HashMap<MBlockId, BitSet> = mf
            .block_ids()
            .map(|b| (b, BitSet::with_capacity(num_vregs)))
            .collect();

        let successors = |b: MBlockId| -> Vec<MBlockId> {
            mf.blocks[b]
                .insts
                .iter()
                .flat_map(|&i| {
                    mf.inst(i).operands.iter().filter_map(|op| match op {
                        super::MOperand::Block(target) => Some(*target),
                        _ => None,
                    })
                })
                .collect()
        };

        let mut lv = LiveVariables::default();
        let mut changed = true;
        while changed {
            changed = false;
            // Reverse block order converges fastest for forward layouts.
            let blocks: Vec<MBlockId> = mf.block_ids().collect();
            for &b in blocks.iter().rev() {
                let mut live = BitSet::with_capacity(num_vregs);
                for s in successors(b) {
                    live.union_with(&live_in[&s]);
                }
                for &i in mf.blocks[b].insts.iter().rev() {
                    let inst = mf.inst(i);
                    for op in &inst.operands {
                        if op.is_reg_def() {
                            if let Some(v) = op.reg().and_then(|r| r.as_virtual()) {
                                live.remove(v.index());
                            }
                        }
                    }
                    for op in &inst.operands {
                        if op.is_reg_use() {
                            if let Some(v) = op.reg().and_then(|r| r.as_virtual()) {
                                live.insert(v.index());
                            }
                        }
                    }
                }
                let entry = live_in.get_mut(&b).expect("all blocks seeded");
                if *entry != live {
                    *entry = live;
                    changed = true;
                }
            }
        }

        // Final pass: record defs, kills and dead defs.
        for b in mf.block_ids() {
            let mut live_out = BitSet::with_capacity(num_vregs);
            for s in successors(b) {
                live_out.union_with(&live_in[&s]);
            }
            // Walk backwards: the first use seen of a not-live register
            // is its kill point.
            let mut live = live_out;
            for &i in mf.blocks[b].insts.iter().rev() {
                let inst = mf.inst(i).clone();
                for op in &inst.operands {
                    if op.is_reg_def() {
                        if let Some(v) = op.reg().and_then(|r| r.as_virtual()) {
                            lv.def_inst.insert(v, i);
                            if !live.contains(v.index()) {
                                lv.dead.entry(v).or_default().push(i);
                            }
                            live.remove(v.index());
                        }
                    }
                }
                for op in &inst.operands {
                    if op.is_reg_use() {
                        if let Some(v) = op.reg().and_then(|r| r.as_virtual()) {
                            if !live.contains(v.index()) {
                                lv.kills.entry(v).or_default().push(i);
                            }
                            live.insert(v.index());
                        }
                    }
                }
            }
        }
        lv
    }

    pub fn def_of(&self, v: VReg) -> Option<MInstId> {
        self.def_inst.get(&v).copied()
    }

    pub fn set_def(&mut self, v: VReg, at: MInstId) {
        self.def_inst.insert(v, at);
    }

    pub fn is_killed_at(&self, v: VReg, at: MInstId) -> bool {
        self.kills.get(&v).is_some_and(|k| k.contains(&at))
    }

    /// Remove a kill record; true if one was present.
    pub fn remove_kill(&mut self, v: VReg, at: MInstId) -> bool {
        match self.kills.get_mut(&v) {
            Some(k) => match k.iter().position(|&i| i == at) {
                Some(pos) => {
                    k.swap_remove(pos);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    pub fn add_kill(&mut self, v: VReg, at: MInstId) {
        self.kills.entry(v).or_default().push(at);
    }

    pub fn is_dead_at(&self, v: VReg, at: MInstId) -> bool {
        self.dead.get(&v).is_some_and(|d| d.contains(&at))
    }

    /// Remove a dead-def record; true if one was present.
    pub fn remove_dead(&mut self, v: VReg, at: MInstId) -> bool {
        match self.dead.get_mut(&v) {
            Some(d) => match d.iter().position(|&i| i == at) {
                Some(pos) => {
                    d.swap_remove(pos);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    pub fn add_dead(&mut self, v: VReg, at: MInstId) {
        self.dead.entry(v).or_default().push(at);
    }
}
