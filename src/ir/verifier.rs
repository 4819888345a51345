//! The IR verifier.
//!
//! Checks every structural invariant the rest of the library is allowed
//! to assume: terminator placement, phi shape, use-list symmetry, SSA
//! dominance, operand typing and symbol-table consistency. The bytecode
//! reader runs this on every materialized function; pipelines should end
//! with it.

use std::collections::HashSet;

use crate::analysis::dominance::DominatorInfo;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::ir::function::Function;
use crate::ir::instruction::Opcode;
use crate::ir::module::{GlobalKind, Globals, Module};
use crate::ir::types::{TypeKind, TypeTag};
use crate::ir::{Use, ValueRef};

/// Verify a whole module, stopping at the first violation.
pub fn verify_module(module: &Module, cx: &Context) -> Result<()> {
    let violations = module_violations(module, cx);
    match violations.into_iter().next() {
        Some(v) => Err(v),
        None => Ok(()),
    }
}

/// Verify one function body.
pub fn verify_function(func: &Function, globals: &Globals, cx: &Context) -> Result<()> {
    let mut violations = Vec::new();
    function_violations(func, globals, cx, &mut violations);
    match violations.into_iter().next() {
        Some(v) => Err(v),
        None => Ok(()),
    }
}

/// All violations in the module, in discovery order.
pub fn module_violations(module: &Module, cx: &Context) -> Vec<Error> {
    let mut out = Vec::new();
    for (_, global) in module.globals.iter_enumerated() {
        if let GlobalKind::Variable {
            init: Some(init), ..
        } = &global.kind
        {
            if cx.const_type(*init) != global.ty {
                out.push(structural(
                    format!("@{}", global.name),
                    format!(
                        "initializer type {} does not match contents type {}",
                        cx.type_name(cx.const_type(*init)),
                        cx.type_name(global.ty)
                    ),
                ));
            }
        }
    }
    for func in module.functions.iter() {
        function_violations(func, &module.globals, cx, &mut out);
    }
    out
}

fn structural(value: String, message: String) -> Error {
    Error::Structural { value, message }
}

fn function_violations(func: &Function, globals: &Globals, cx: &Context, out: &mut Vec<Error>) {
    if func.is_declaration() {
        return;
    }
    let id = |v: ValueRef| format!("{} in @{}", func.describe_value(v), func.name);

    // Entry block must have no predecessors.
    if let Some(entry) = func.entry() {
        if !func.predecessors(entry).is_empty() {
            out.push(structural(
                id(ValueRef::Block(entry)),
                "entry block has predecessors".into(),
            ));
        }
    }

    for &b in func.layout() {
        let insts = &func.block(b).insts;

        // Exactly one terminator, and it is last.
        match func.terminator(b) {
            None => out.push(structural(
                id(ValueRef::Block(b)),
                "block does not end with a terminator".into(),
            )),
            Some(_) => {
                for &i in &insts[..insts.len() - 1] {
                    if func.inst(i).opcode.is_terminator() {
                        out.push(structural(
                            id(ValueRef::Inst(i)),
                            "terminator in the middle of a block".into(),
                        ));
                    }
                }
            }
        }

        // Phis only at the head; shape checked below.
        let mut past_phis = false;
        for &i in insts {
            let is_phi = func.inst(i).opcode == Opcode::Phi;
            if !is_phi {
                past_phis = true;
            } else if past_phis {
                out.push(structural(
                    id(ValueRef::Inst(i)),
                    "phi is not at the head of its block".into(),
                ));
            }
        }

        for &i in insts {
            let data = func.inst(i);
            if data.opcode == Opcode::Placeholder {
                out.push(structural(
                    id(ValueRef::Inst(i)),
                    "unresolved placeholder value".into(),
                ));
                continue;
            }
            if data.parent != Some(b) {
                out.push(structural(
                    id(ValueRef::Inst(i)),
                    "instruction parent link disagrees with block membership".into(),
                ));
            }
            check_operand_types(func, globals, cx, i, out);
            if data.opcode == Opcode::Phi {
                check_phi(func, globals, cx, i, b, out);
            }
        }
    }

    check_use_symmetry(func, out);
    check_dominance(func, out);
}

fn check_phi(
    func: &Function,
    globals: &Globals,
    cx: &Context,
    phi: crate::ir::InstId,
    block: crate::ir::BlockId,
    out: &mut Vec<Error>,
) {
    let data = func.inst(phi);
    let id = || format!("{} in @{}", func.describe_value(ValueRef::Inst(phi)), func.name);
    if data.operands.len() % 2 != 0 {
        out.push(structural(id(), "phi operand list is not in pairs".into()));
        return;
    }
    let preds: HashSet<_> = func.predecessors(block).into_iter().collect();
    let mut seen = HashSet::new();
    for (value, pred) in data.phi_incoming() {
        if func.value_ty(value, globals, cx) != data.ty {
            out.push(structural(
                id(),
                format!(
                    "incoming value type {} does not match phi type {}",
                    cx.type_name(func.value_ty(value, globals, cx)),
                    cx.type_name(data.ty)
                ),
            ));
        }
        if !preds.contains(&pred) {
            out.push(structural(
                id(),
                "incoming block is not a predecessor".into(),
            ));
        }
        if !seen.insert(pred) {
            out.push(structural(
                id(),
                "two incoming entries for one predecessor".into(),
            ));
        }
    }
    if seen.len() != preds.len() {
        out.push(structural(
            id(),
            format!(
                "phi covers {} of {} predecessors",
                seen.len(),
                preds.len()
            ),
        ));
    }
}

fn check_operand_types(
    func: &Function,
    globals: &Globals,
    cx: &Context,
    inst: crate::ir::InstId,
    out: &mut Vec<Error>,
) {
    let data = func.inst(inst);
    let id = || format!("{} in @{}", func.describe_value(ValueRef::Inst(inst)), func.name);
    let ty_of = |v: ValueRef| func.value_ty(v, globals, cx);
    let mut expect = |ok: bool, msg: String| {
        if !ok {
            out.push(structural(id(), msg));
        }
    };

    match data.opcode {
        op if op.is_binary() => {
            let (l, r) = (ty_of(data.operands[0]), ty_of(data.operands[1]));
            if matches!(op, Opcode::Shl | Opcode::Shr) {
                expect(r == cx.u8_ty(), "shift amount is not u8".into());
                expect(data.ty == l, "shift result type differs from value".into());
            } else {
                expect(l == r, "binary operand types differ".into());
                if op.is_compare() {
                    expect(data.ty == cx.bool_ty(), "comparison result is not bool".into());
                } else {
                    expect(data.ty == l, "binary result type differs from operands".into());
                }
            }
        }
        Opcode::Not => {
            expect(
                data.ty == ty_of(data.operands[0]),
                "not result type differs from operand".into(),
            );
        }
        Opcode::Cast => {
            expect(
                cx.is_first_class(data.ty) && cx.is_first_class(ty_of(data.operands[0])),
                "cast between non-first-class types".into(),
            );
        }
        Opcode::Load => {
            let src = ty_of(data.operands[0]);
            expect(
                cx.pointee(src) == Some(data.ty),
                format!(
                    "load of {} through {}",
                    cx.type_name(data.ty),
                    cx.type_name(src)
                ),
            );
        }
        Opcode::Store => {
            let (v, p) = (ty_of(data.operands[0]), ty_of(data.operands[1]));
            expect(
                cx.pointee(p) == Some(v),
                format!(
                    "store of {} through {}",
                    cx.type_name(v),
                    cx.type_name(p)
                ),
            );
        }
        Opcode::Alloca | Opcode::Malloc => {
            expect(
                cx.tag(data.ty) == TypeTag::Pointer,
                "allocation result is not a pointer".into(),
            );
        }
        Opcode::Free => {
            expect(
                cx.tag(ty_of(data.operands[0])) == TypeTag::Pointer,
                "free of a non-pointer".into(),
            );
        }
        Opcode::Ret => {
            let expected = func.return_ty(cx);
            match data.operands.first() {
                None => expect(expected == cx.void_ty(), "missing return value".into()),
                Some(&v) => expect(
                    ty_of(v) == expected,
                    format!(
                        "return of {} from a {} function",
                        cx.type_name(ty_of(v)),
                        cx.type_name(expected)
                    ),
                ),
            }
        }
        Opcode::CondBr => {
            expect(
                ty_of(data.operands[0]) == cx.bool_ty(),
                "branch condition is not bool".into(),
            );
        }
        Opcode::Call | Opcode::Invoke => {
            let callee_ty = ty_of(data.operands[0]);
            let sig = cx.pointee(callee_ty);
            match sig.map(|s| cx.kind(s)) {
                Some(TypeKind::Function { ret, .. }) => {
                    expect(data.ty == ret, "call result type differs from signature".into());
                }
                _ => expect(false, "callee is not pointer-to-function".into()),
            }
        }
        _ => {}
    }
}

fn check_use_symmetry(func: &Function, out: &mut Vec<Error>) {
    // operand -> entry in def's use list
    for &i in &func.inst_ids() {
        for (idx, &op) in func.inst(i).operands.iter().enumerate() {
            if !op.is_local() {
                continue;
            }
            let u = Use {
                inst: i,
                index: idx as u32,
            };
            if !func.uses_of(op).contains(&u) {
                out.push(structural(
                    format!("{} in @{}", func.describe_value(op), func.name),
                    "operand edge missing from use list".into(),
                ));
            }
        }
    }
    // entry in use list -> matching operand
    let mut check_list = |value: ValueRef| {
        for &u in func.uses_of(value) {
            let data = func.inst(u.inst);
            if data.dead || data.operands.get(u.index as usize) != Some(&value) {
                out.push(structural(
                    format!("{} in @{}", func.describe_value(value), func.name),
                    "use-list entry does not resolve back to the value".into(),
                ));
            }
        }
    };
    for (a, _) in func.args() {
        check_list(ValueRef::Arg(a));
    }
    for &b in func.layout() {
        check_list(ValueRef::Block(b));
        for &i in &func.block(b).insts {
            check_list(ValueRef::Inst(i));
        }
    }
}

fn check_dominance(func: &Function, out: &mut Vec<Error>) {
    let dom = DominatorInfo::compute(func);
    for &i in &func.inst_ids() {
        for (idx, &op) in func.inst(i).operands.iter().enumerate() {
            if op.as_inst().is_none() {
                continue;
            }
            if !dom.def_dominates_use(func, op, i, idx) {
                out.push(structural(
                    format!("{} in @{}", func.describe_value(op), func.name),
                    "use is not dominated by its definition".into(),
                ));
            }
        }
    }
}
