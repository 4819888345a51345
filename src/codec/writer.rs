//! The bytecode writer.

use std::collections::HashMap;
use std::io::Write as IoWrite;

use crate::context::Context;
use crate::error::Result;
use crate::ir::constant::{Constant, ConstantKind};
use crate::ir::function::Function;
use crate::ir::module::{GlobalKind, Linkage, Module, Slots};
use crate::ir::types::{Type, TypeKind};
use crate::ir::ValueRef;

use super::bytes::Writer;
use super::codes::{BlockTag, Compression, ConstTag, GlobalTag, LinkageTag, OperandTag, MAGIC, VERSION};

/// Serialize a module to bytes.
pub fn write_module(module: &Module, cx: &Context) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_bytes(&MAGIC);
    w.write_vbr(VERSION);

    w.write_block(BlockTag::Module.into(), |p| {
        p.write_str(&module.name);
        p.write_str(&module.target.signature());
        p.write_vbr(module.deplibs.len() as u64);
        for lib in &module.deplibs {
            p.write_str(lib);
        }
    });

    let types = TypeTable::collect(module, cx);
    w.write_block(BlockTag::Types.into(), |p| types.write(p, cx));

    w.write_block(BlockTag::Globals.into(), |p| {
        p.write_vbr(module.globals.len() as u64);
        for (_, global) in module.globals.iter_enumerated() {
            p.write_str(&global.name);
            p.write_vbr(u64::from(types.index(global.ty)));
            p.write_u8(
                match global.linkage {
                    Linkage::External => LinkageTag::External,
                    Linkage::Internal => LinkageTag::Internal,
                }
                .into(),
            );
            match &global.kind {
                GlobalKind::Variable { is_const, .. } => {
                    p.write_u8(GlobalTag::Variable.into());
                    p.write_u8(u8::from(*is_const));
                }
                GlobalKind::Function(_) => p.write_u8(GlobalTag::Function.into()),
            }
        }
    });

    let consts = ConstTable::collect_global(module, cx);
    w.write_block(BlockTag::Constants.into(), |p| consts.write(p, cx, &types));

    w.write_block(BlockTag::Inits.into(), |p| {
        let inits: Vec<_> = module
            .globals
            .iter_enumerated()
            .filter_map(|(g, data)| match &data.kind {
                GlobalKind::Variable { init: Some(c), .. } => Some((g, *c)),
                _ => None,
            })
            .collect();
        p.write_vbr(inits.len() as u64);
        for (g, c) in inits {
            p.write_vbr(u64::from(g.raw()));
            p.write_vbr(u64::from(consts.index(c)));
        }
    });

    for (g, global) in module.globals.iter_enumerated() {
        let Some(f) = global.function_id() else {
            continue;
        };
        let func = &module.functions[f];
        if func.is_declaration() {
            continue;
        }
        let local_consts = consts.extended_for(func, cx);
        w.write_block(BlockTag::Function.into(), |p| {
            p.write_vbr(u64::from(g.raw()));
            p.write_u8(Compression::None.into());
            // The function-scope constant pool precedes the body.
            local_consts.write(p, cx, &types);
            write_function_body(p, func, module, cx, &types, &local_consts);
        });
    }

    w.into_bytes()
}

/// Serialize a module into any writer.
pub fn write_module_to(out: &mut impl IoWrite, module: &Module, cx: &Context) -> Result<()> {
    out.write_all(&write_module(module, cx))?;
    Ok(())
}

fn write_function_body(
    p: &mut Writer,
    func: &Function,
    module: &Module,
    cx: &Context,
    types: &TypeTable,
    consts: &ConstTable,
) {
    let slots = Slots::for_function(func, cx);
    p.write_vbr(func.layout().len() as u64);
    for &b in func.layout() {
        let insts = &func.block(b).insts;
        p.write_vbr(insts.len() as u64);
        for &i in insts {
            let data = func.inst(i);
            p.write_u8(data.opcode.into());
            p.write_vbr(u64::from(types.index(data.ty)));
            p.write_vbr(data.operands.len() as u64);
            for &op in &data.operands {
                write_operand(p, op, func, module, cx, types, consts, &slots);
            }
        }
    }
    // Value and block symbol tables.
    let named_values: Vec<(u32, &str)> = func
        .args()
        .map(|(a, data)| (ValueRef::Arg(a), data.name.as_deref()))
        .chain(func.inst_ids().into_iter().map(|i| {
            (ValueRef::Inst(i), func.inst(i).name.as_deref())
        }))
        .filter_map(|(v, name)| Some((slots.value_slot(v)?, name?)))
        .collect();
    p.write_vbr(named_values.len() as u64);
    for (slot, name) in named_values {
        p.write_vbr(u64::from(slot));
        p.write_str(name);
    }
    let named_blocks: Vec<(u32, &str)> = func
        .layout()
        .iter()
        .filter_map(|&b| Some((slots.block_slot(b)?, func.block(b).name.as_deref()?)))
        .collect();
    p.write_vbr(named_blocks.len() as u64);
    for (idx, name) in named_blocks {
        p.write_vbr(u64::from(idx));
        p.write_str(name);
    }
}

#[allow(clippy::too_many_arguments)]
fn write_operand(
    p: &mut Writer,
    op: ValueRef,
    func: &Function,
    module: &Module,
    cx: &Context,
    types: &TypeTable,
    consts: &ConstTable,
    slots: &Slots,
) {
    match op {
        ValueRef::Const(c) => {
            p.write_u8(OperandTag::Const.into());
            p.write_vbr(u64::from(consts.index(c)));
        }
        ValueRef::Global(g) => {
            p.write_u8(OperandTag::Global.into());
            p.write_vbr(u64::from(g.raw()));
        }
        ValueRef::Block(b) => {
            p.write_u8(OperandTag::Block.into());
            p.write_vbr(u64::from(slots.block_slot(b).expect("operand block is live")));
        }
        ValueRef::Arg(_) | ValueRef::Inst(_) => {
            p.write_u8(OperandTag::Value.into());
            let ty = func.value_ty(op, &module.globals, cx);
            p.write_vbr(u64::from(types.index(ty)));
            p.write_vbr(u64::from(
                slots.value_slot(op).expect("operand value has a slot"),
            ));
        }
    }
}

/// The uniqued type table in emission order (leaf-first: every derived
/// type's components precede it).
pub(super) struct TypeTable {
    order: Vec<Type>,
    index: HashMap<Type, u32>,
}

impl TypeTable {
    pub(super) fn collect(module: &Module, cx: &Context) -> Self {
        let mut table = Self {
            order: Vec::new(),
            index: HashMap::new(),
        };
        for (_, global) in module.globals.iter_enumerated() {
            table.add(global.ty, cx);
        }
        for func in module.functions.iter() {
            table.add(func.ty, cx);
            for &i in &func.inst_ids() {
                table.add(func.inst(i).ty, cx);
                for &op in &func.inst(i).operands {
                    table.add(func.value_ty(op, &module.globals, cx), cx);
                }
            }
        }
        table
    }

    fn add(&mut self, ty: Type, cx: &Context) {
        if self.index.contains_key(&ty) {
            return;
        }
        for sub in cx.kind(ty).contained() {
            self.add(sub, cx);
        }
        self.index.insert(ty, self.order.len() as u32);
        self.order.push(ty);
    }

    pub(super) fn index(&self, ty: Type) -> u32 {
        self.index[&ty]
    }

    fn write(&self, p: &mut Writer, cx: &Context) {
        p.write_vbr(self.order.len() as u64);
        for &ty in &self.order {
            let kind = cx.kind(ty);
            p.write_u8(kind.tag().into());
            match kind {
                TypeKind::Pointer(t) => p.write_vbr(u64::from(self.index(t))),
                TypeKind::Array(t, n) => {
                    p.write_vbr(u64::from(self.index(t)));
                    p.write_vbr(n);
                }
                TypeKind::Struct(fields) => {
                    p.write_vbr(fields.len() as u64);
                    for &f in fields.iter() {
                        p.write_vbr(u64::from(self.index(f)));
                    }
                }
                TypeKind::Function { ret, params, vararg } => {
                    p.write_vbr(u64::from(self.index(ret)));
                    p.write_vbr(params.len() as u64);
                    for &param in params.iter() {
                        p.write_vbr(u64::from(self.index(param)));
                    }
                    p.write_u8(u8::from(vararg));
                }
                TypeKind::Opaque(token) => p.write_vbr(u64::from(token)),
                _ => {} // primitives are just their tag
            }
        }
    }
}

/// One scope's constant pool in emission order (operands before
/// users). The module has a global pool; each function body extends it
/// with a local pool, continuing the same index space.
pub(super) struct ConstTable {
    /// Entries owned by this scope.
    order: Vec<Constant>,
    /// Combined index over the parent scope and this one.
    index: HashMap<Constant, u32>,
    /// First index owned by this scope.
    start: u32,
}

impl ConstTable {
    /// The global pool: constants reachable from initializers.
    pub(super) fn collect_global(module: &Module, cx: &Context) -> Self {
        let mut table = Self {
            order: Vec::new(),
            index: HashMap::new(),
            start: 0,
        };
        for (_, global) in module.globals.iter_enumerated() {
            if let GlobalKind::Variable { init: Some(c), .. } = &global.kind {
                table.add(*c, cx);
            }
        }
        table
    }

    /// A function-scope pool: the global pool plus whatever this body
    /// references beyond it.
    pub(super) fn extended_for(&self, func: &Function, cx: &Context) -> Self {
        let mut table = Self {
            order: Vec::new(),
            index: self.index.clone(),
            start: self.start + self.order.len() as u32,
        };
        for &i in &func.inst_ids() {
            for &op in &func.inst(i).operands {
                if let ValueRef::Const(c) = op {
                    table.add(c, cx);
                }
            }
        }
        table
    }

    fn add(&mut self, c: Constant, cx: &Context) {
        if self.index.contains_key(&c) {
            return;
        }
        match cx.const_data(c).kind {
            ConstantKind::Aggregate(members) => {
                for &m in members.iter() {
                    self.add(m, cx);
                }
            }
            ConstantKind::Expr { args, .. } => {
                for &a in args.iter() {
                    self.add(a, cx);
                }
            }
            _ => {}
        }
        self.index.insert(c, self.start + self.order.len() as u32);
        self.order.push(c);
    }

    pub(super) fn index(&self, c: Constant) -> u32 {
        self.index[&c]
    }

    fn write(&self, p: &mut Writer, cx: &Context, types: &TypeTable) {
        p.write_vbr(self.order.len() as u64);
        for &c in &self.order {
            let data = cx.const_data(c);
            p.write_vbr(u64::from(types.index(data.ty)));
            match data.kind {
                ConstantKind::Bool(b) => {
                    p.write_u8(ConstTag::Bool.into());
                    p.write_u8(u8::from(b));
                }
                ConstantKind::Int(bits) => {
                    p.write_u8(ConstTag::Int.into());
                    p.write_vbr(bits);
                }
                ConstantKind::Float(bits) => {
                    p.write_u8(ConstTag::Float.into());
                    p.write_vbr(bits);
                }
                ConstantKind::Null => p.write_u8(ConstTag::Null.into()),
                ConstantKind::Aggregate(members) => {
                    p.write_u8(ConstTag::Aggregate.into());
                    p.write_vbr(members.len() as u64);
                    for &m in members.iter() {
                        p.write_vbr(u64::from(self.index(m)));
                    }
                }
                ConstantKind::GlobalAddr { global, .. } => {
                    p.write_u8(ConstTag::GlobalAddr.into());
                    p.write_vbr(u64::from(global.raw()));
                }
                ConstantKind::Expr { op, args } => {
                    p.write_u8(ConstTag::Expr.into());
                    p.write_u8(op.into());
                    p.write_vbr(args.len() as u64);
                    for &a in args.iter() {
                        p.write_vbr(u64::from(self.index(a)));
                    }
                }
            }
        }
    }
}
