//! Canonical text output.
//!
//! There is no parser for this form in the library; the printed text is
//! the observable canonical form used by diagnostics and round-trip
//! tests. Unnamed values print as `%N` positional slots from the slot
//! calculator, so two structurally equal functions print identically.

use std::fmt::Write;

use itertools::Itertools;

use crate::context::Context;
use crate::ir::constant::{Constant, ConstantKind};
use crate::ir::function::Function;
use crate::ir::instruction::Opcode;
use crate::ir::module::{GlobalKind, Linkage, Module, Slots};
use crate::ir::types::TypeTag;
use crate::ir::{BlockId, ValueRef};

pub fn print_module(module: &Module, cx: &Context) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "; module '{}'", module.name);
    let _ = writeln!(out, "target = \"{}\"", module.target.signature());
    if !module.deplibs.is_empty() {
        let libs = module.deplibs.iter().map(|l| format!("\"{l}\"")).join(", ");
        let _ = writeln!(out, "deplibs = [ {libs} ]");
    }
    let mut wrote_globals = false;
    for (_, global) in module.globals.iter_enumerated() {
        if let GlobalKind::Variable { init, is_const } = &global.kind {
            wrote_globals = true;
            let linkage = match global.linkage {
                Linkage::Internal => "internal ",
                Linkage::External => "",
            };
            let decl = if *is_const { "constant" } else { "global" };
            match init {
                Some(init) => {
                    let _ = writeln!(
                        out,
                        "@{} = {}{} {}",
                        global.name,
                        linkage,
                        decl,
                        print_constant(*init, cx, module)
                    );
                }
                None => {
                    let _ = writeln!(
                        out,
                        "@{} = external {} {}",
                        global.name,
                        decl,
                        cx.type_name(global.ty)
                    );
                }
            }
        }
    }
    if wrote_globals {
        out.push('\n');
    }
    for (_, global) in module.globals.iter_enumerated() {
        if let GlobalKind::Function(f) = global.kind {
            out.push('\n');
            out.push_str(&print_function(&module.functions[f], module, cx));
        }
    }
    out
}

pub fn print_function(func: &Function, module: &Module, cx: &Context) -> String {
    let slots = Slots::for_function(func, cx);
    let mut out = String::new();
    let ret = cx.type_name(func.return_ty(cx));
    let params = func
        .args()
        .map(|(a, data)| {
            format!(
                "{} {}",
                cx.type_name(data.ty),
                value_name(ValueRef::Arg(a), func, &slots, module, cx)
            )
        })
        .join(", ");
    let linkage = match func.linkage {
        Linkage::Internal => "internal ",
        Linkage::External => "",
    };
    if func.is_declaration() {
        let _ = writeln!(out, "declare {}{} @{}({})", linkage, ret, func.name, params);
        return out;
    }
    let _ = writeln!(out, "define {}{} @{}({}) {{", linkage, ret, func.name, params);
    for &b in func.layout() {
        let _ = writeln!(out, "{}:", block_name(b, func, &slots));
        for &i in &func.block(b).insts {
            let _ = writeln!(out, "    {}", print_inst(i, func, &slots, module, cx));
        }
    }
    out.push_str("}\n");
    out
}

fn print_inst(
    inst: crate::ir::InstId,
    func: &Function,
    slots: &Slots,
    module: &Module,
    cx: &Context,
) -> String {
    let data = func.inst(inst);
    let mut s = String::new();
    if data.ty != cx.void_ty() {
        let _ = write!(
            s,
            "{} = ",
            value_name(ValueRef::Inst(inst), func, slots, module, cx)
        );
    }
    let _ = write!(s, "{}", data.opcode.mnemonic());
    match data.opcode {
        Opcode::Cast => {
            let _ = write!(
                s,
                " {} to {}",
                typed_operand(data.operands[0], func, slots, module, cx),
                cx.type_name(data.ty)
            );
        }
        Opcode::Phi => {
            let pairs = data
                .phi_incoming()
                .map(|(v, b)| {
                    format!(
                        "[ {}, %{} ]",
                        value_name(v, func, slots, module, cx),
                        block_name(b, func, slots)
                    )
                })
                .join(", ");
            let _ = write!(s, " {} {}", cx.type_name(data.ty), pairs);
        }
        Opcode::Alloca | Opcode::Malloc => {
            let pointee = cx.pointee(data.ty).expect("allocation yields a pointer");
            let _ = write!(s, " {}", cx.type_name(pointee));
            if let Some(&count) = data.operands.first() {
                let _ = write!(s, ", {}", typed_operand(count, func, slots, module, cx));
            }
        }
        Opcode::Call | Opcode::Invoke => {
            let arg_start = if data.opcode == Opcode::Call { 1 } else { 3 };
            let args = data.operands[arg_start..]
                .iter()
                .map(|&a| typed_operand(a, func, slots, module, cx))
                .join(", ");
            let _ = write!(
                s,
                " {} {}({})",
                cx.type_name(data.ty),
                value_name(data.operands[0], func, slots, module, cx),
                args
            );
            if data.opcode == Opcode::Invoke {
                let _ = write!(
                    s,
                    " to label %{} unwind label %{}",
                    block_name(data.operands[1].as_block().unwrap(), func, slots),
                    block_name(data.operands[2].as_block().unwrap(), func, slots)
                );
            }
        }
        Opcode::Switch => {
            let _ = write!(
                s,
                " {}, label %{} [ {} ]",
                typed_operand(data.operands[0], func, slots, module, cx),
                block_name(data.operands[1].as_block().unwrap(), func, slots),
                data.switch_cases()
                    .map(|(c, b)| format!(
                        "{}, label %{}",
                        typed_operand(c, func, slots, module, cx),
                        block_name(b, func, slots)
                    ))
                    .join("; ")
            );
        }
        _ if !data.operands.is_empty() => {
            // Result-typed opcodes show the common operand type once.
            let first_ty = func.value_ty(data.operands[0], &module.globals, cx);
            let homogeneous = data
                .operands
                .iter()
                .all(|&o| func.value_ty(o, &module.globals, cx) == first_ty);
            if homogeneous {
                let names = data
                    .operands
                    .iter()
                    .map(|&o| value_name(o, func, slots, module, cx))
                    .join(", ");
                let _ = write!(s, " {} {}", cx.type_name(first_ty), names);
            } else {
                let each = data
                    .operands
                    .iter()
                    .map(|&o| typed_operand(o, func, slots, module, cx))
                    .join(", ");
                let _ = write!(s, " {each}");
            }
        }
        _ => {
            if data.opcode == Opcode::Ret {
                let _ = write!(s, " void");
            }
        }
    }
    s
}

fn typed_operand(
    v: ValueRef,
    func: &Function,
    slots: &Slots,
    module: &Module,
    cx: &Context,
) -> String {
    match v {
        ValueRef::Block(b) => format!("label %{}", block_name(b, func, slots)),
        _ => format!(
            "{} {}",
            cx.type_name(func.value_ty(v, &module.globals, cx)),
            value_name(v, func, slots, module, cx)
        ),
    }
}

fn value_name(
    v: ValueRef,
    func: &Function,
    slots: &Slots,
    module: &Module,
    cx: &Context,
) -> String {
    match v {
        ValueRef::Const(c) => print_constant_payload(c, cx, module),
        ValueRef::Global(g) => format!("@{}", module.globals[g].name),
        ValueRef::Block(b) => format!("%{}", block_name(b, func, slots)),
        _ => match func.name_of(v) {
            Some(name) => format!("%{name}"),
            None => match slots.value_slot(v) {
                Some(slot) => format!("%{slot}"),
                None => "%?".into(),
            },
        },
    }
}

fn block_name(b: BlockId, func: &Function, slots: &Slots) -> String {
    match func.block(b).name.as_deref() {
        Some(name) => name.to_owned(),
        None => format!("bb{}", slots.block_slot(b).unwrap_or(u32::MAX)),
    }
}

/// A constant with its type prefix, e.g. `i32 7`.
pub fn print_constant(c: Constant, cx: &Context, module: &Module) -> String {
    format!(
        "{} {}",
        cx.type_name(cx.const_type(c)),
        print_constant_payload(c, cx, module)
    )
}

fn print_constant_payload(c: Constant, cx: &Context, module: &Module) -> String {
    let data = cx.const_data(c);
    match data.kind {
        ConstantKind::Bool(b) => b.to_string(),
        ConstantKind::Int(_) => {
            if cx.tag(data.ty).is_signed() {
                cx.const_int_value(c).unwrap().to_string()
            } else {
                cx.const_uint_value(c).unwrap().to_string()
            }
        }
        ConstantKind::Float(_) => {
            let v = cx.const_float_value(c).unwrap();
            if cx.tag(data.ty) == TypeTag::F32 {
                format!("{:?}", v as f32)
            } else {
                format!("{v:?}")
            }
        }
        ConstantKind::Null => "null".into(),
        ConstantKind::Aggregate(members) => {
            let inner = members
                .iter()
                .map(|&m| print_constant(m, cx, module))
                .join(", ");
            format!("[ {inner} ]")
        }
        ConstantKind::GlobalAddr { global, .. } => {
            format!("@{}", module.globals[global].name)
        }
        ConstantKind::Expr { op, args } => {
            let inner = args
                .iter()
                .map(|&a| print_constant(a, cx, module))
                .join(", ");
            format!("{} ({})", op.mnemonic(), inner)
        }
    }
}

/// Render a single value the way the printer would.
pub fn print_value(v: ValueRef, func: &Function, module: &Module, cx: &Context) -> String {
    let slots = Slots::for_function(func, cx);
    value_name(v, func, &slots, module, cx)
}
