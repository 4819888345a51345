//! Rewriting three-address instructions into two-address form.
//!
//! Many instruction sets require a binary operation's destination to be
//! its first source. For every instruction the target tags two-address,
//!
//! ```text
//!     a = b op c
//! ```
//!
//! becomes
//!
//! ```text
//!     a = b
//!     a = a op c
//! ```
//!
//! and the duplicate operand slot is removed (the def slot becomes
//! def-and-use). When the def and first use already coincide, only the
//! demotion happens. Live-variable information, when supplied, is
//! updated in place: the copy becomes `a`'s def, and any kill/dead
//! record `b` had at the instruction migrates to the copy.
//!
//! Register allocators running after this pass must cope with the
//! non-SSA registers it produces.

use log::{debug, trace};

use super::target::MachineTarget;
use super::{LiveVariables, MOperand, MachineFunction, RegFlags};

/// Run the rewrite over a whole function. Returns true if anything
/// changed. Running it again is a no-op: an already-demoted def slot
/// (def-and-use) marks the instruction as done.
pub fn lower_two_address(
    mf: &mut MachineFunction,
    target: &dyn MachineTarget,
    mut lv: Option<&mut LiveVariables>,
) -> bool {
    let mut changed = false;
    debug!("two-address rewrite: {}", mf.name);

    let blocks: Vec<_> = mf.block_ids().collect();
    for block in blocks {
        let insts = mf.blocks[block].insts.clone();
        for mi in insts {
            if !target.is_two_address(mf.inst(mi).opcode) {
                continue;
            }
            let Some(MOperand::Reg {
                reg: reg_a,
                flags: def_flags,
            }) = mf.inst(mi).operands.first().cloned()
            else {
                continue;
            };
            if !def_flags.contains(RegFlags::DEF) || def_flags.contains(RegFlags::USE) {
                // Not a pure def: either malformed or already rewritten.
                continue;
            }
            let Some(MOperand::Reg { reg: reg_b, .. }) = mf.inst(mi).operands.get(1).cloned()
            else {
                continue;
            };

            trace!(
                "  rewriting {} (two-address)",
                target.mnemonic(mf.inst(mi).opcode)
            );

            if reg_a != reg_b {
                // Only virtual registers can have their liveness rewritten.
                let (Some(va), Some(vb)) = (reg_a.as_virtual(), reg_b.as_virtual()) else {
                    continue;
                };
                // An SSA front-end can never feed us `a = b op a`.
                debug_assert!(
                    mf.inst(mi).operands[1..]
                        .iter()
                        .all(|op| op.reg() != Some(reg_a)),
                    "two-address rewrite requires SSA input"
                );

                let copy = mf.insert_before(block, mi, target.make_copy(reg_a, reg_b));
                if let Some(lv) = lv.as_deref_mut() {
                    lv.set_def(va, copy);
                    if lv.remove_kill(vb, mi) {
                        lv.add_kill(vb, copy);
                    }
                    if lv.remove_dead(vb, mi) {
                        lv.add_dead(vb, copy);
                    }
                }

                // Rewrite every remaining use of b in this instruction.
                for op in mf.inst_mut(mi).operands[1..].iter_mut() {
                    if let MOperand::Reg { reg, .. } = op {
                        if *reg == reg_b {
                            *reg = reg_a;
                        }
                    }
                }
            }

            // Demote the def slot to def-and-use, drop the duplicate.
            match &mut mf.inst_mut(mi).operands[0] {
                MOperand::Reg { flags, .. } => *flags |= RegFlags::USE,
                _ => unreachable!("checked above"),
            }
            mf.inst_mut(mi).operands.remove(1);
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::super::target::{generic_ops, GenericTarget};
    use super::super::{MOperand, MachineFunction, MachineInst, Reg};
    use super::*;

    fn three_address_add(mf: &mut MachineFunction) -> (super::super::MBlockId, super::super::MInstId) {
        let block = mf.add_block();
        let a = Reg::Virtual(mf.new_vreg());
        let b = Reg::Virtual(mf.new_vreg());
        let c = Reg::Virtual(mf.new_vreg());
        // b and c get defined by immediates so liveness makes sense.
        mf.push(
            block,
            MachineInst::new(generic_ops::IMM, [MOperand::def(b), MOperand::Imm(1)]),
        );
        mf.push(
            block,
            MachineInst::new(generic_ops::IMM, [MOperand::def(c), MOperand::Imm(2)]),
        );
        let add = mf.push(
            block,
            MachineInst::new(
                generic_ops::ADD,
                [MOperand::def(a), MOperand::use_(b), MOperand::use_(c)],
            ),
        );
        (block, add)
    }

    #[test]
    fn inserts_copy_and_drops_operand() {
        let mut mf = MachineFunction::new("f");
        let (block, add) = three_address_add(&mut mf);
        let target = GenericTarget;

        assert!(lower_two_address(&mut mf, &target, None));

        // The copy sits immediately before the add.
        let insts = &mf.blocks[block].insts;
        let add_pos = insts.iter().position(|&i| i == add).unwrap();
        let copy = insts[add_pos - 1];
        assert!(target.is_copy(mf.inst(copy)));
        // The add now has one fewer operand and reads its own def.
        let add_inst = mf.inst(add);
        assert_eq!(add_inst.operands.len(), 2);
        let def = &add_inst.operands[0];
        assert!(def.is_reg_def() && def.is_reg_use());
        assert_eq!(mf.inst(copy).operands[0].reg(), def.reg());
    }

    #[test]
    fn rewrite_is_idempotent() {
        let mut mf = MachineFunction::new("f");
        three_address_add(&mut mf);
        let target = GenericTarget;
        assert!(lower_two_address(&mut mf, &target, None));
        let snapshot: Vec<Vec<_>> = mf
            .block_ids()
            .map(|b| mf.blocks[b].insts.clone())
            .collect();
        assert!(!lower_two_address(&mut mf, &target, None));
        let after: Vec<Vec<_>> = mf
            .block_ids()
            .map(|b| mf.blocks[b].insts.clone())
            .collect();
        assert_eq!(snapshot, after);
    }

    #[test]
    fn same_register_only_demotes() {
        let mut mf = MachineFunction::new("f");
        let block = mf.add_block();
        let a = Reg::Virtual(mf.new_vreg());
        let c = Reg::Virtual(mf.new_vreg());
        let add = mf.push(
            block,
            MachineInst::new(
                generic_ops::ADD,
                [MOperand::def(a), MOperand::use_(a), MOperand::use_(c)],
            ),
        );
        assert!(lower_two_address(&mut mf, &GenericTarget, None));
        // No copy inserted; operand dropped in place.
        assert_eq!(mf.blocks[block].insts.len(), 1);
        assert_eq!(mf.inst(add).operands.len(), 2);
    }

    #[test]
    fn liveness_moves_to_the_copy() {
        let mut mf = MachineFunction::new("f");
        let (_, add) = three_address_add(&mut mf);
        let mut lv = LiveVariables::compute(&mf);
        let b = super::super::VReg::from_raw(1);
        assert!(lv.is_killed_at(b, add));

        assert!(lower_two_address(&mut mf, &GenericTarget, Some(&mut lv)));

        let a = super::super::VReg::from_raw(0);
        let copy = lv.def_of(a).unwrap();
        assert!(GenericTarget.is_copy(mf.inst(copy)));
        assert!(!lv.is_killed_at(b, add));
        assert!(lv.is_killed_at(b, copy));
    }
}
