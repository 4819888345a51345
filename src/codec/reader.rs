//! The bytecode reader.
//!
//! [`read_module`] is the eager entry point: parse everything, verify,
//! hand back the module. The lazy path lives in
//! [`ModuleProvider`](super::provider::ModuleProvider), which uses the
//! skeleton and body parsers here.
//!
//! Forward references: within a function body an operand may name a
//! value slot that has not been defined yet (uses before defs are
//! normal in SSA). The reader allocates a placeholder of the declared
//! type, uses it as the operand, and replaces-all-uses on resolution;
//! placeholders still alive at the end of the body are a
//! [`CodecError::UnresolvedForwardRef`].

use std::collections::HashMap;
use std::ops::Range;

use log::trace;
use smallvec::SmallVec;

use crate::context::Context;
use crate::error::{CodecError, Error, Result};
use crate::ir::constant::{Constant, ConstantKind};
use crate::ir::instruction::{InstData, Opcode};
use crate::ir::module::{GlobalKind, Linkage, Module};
use crate::ir::types::{Type, TypeTag};
use crate::ir::verifier;
use crate::ir::{FuncId, GlobalId, InstId, ValueRef};
use crate::target::TargetData;

use super::bytes::Cursor;
use super::codes::{
    BlockTag, Compression, ConstTag, GlobalTag, LinkageTag, OperandTag, MAGIC, VERSION,
};
use super::provider::ModuleProvider;

/// Read a complete module from bytes, materializing and verifying every
/// function body.
pub fn read_module(bytes: &[u8], cx: &Context) -> Result<Module> {
    let provider = ModuleProvider::open(bytes.to_vec(), cx)?;
    provider.into_module(cx)
}

/// Everything the skeleton parse produces.
pub(super) struct Skeleton {
    pub module: Module,
    pub types: Vec<Type>,
    pub consts: Vec<Constant>,
    /// Unparsed body payload (after the global index and compression
    /// byte) per function.
    pub bodies: HashMap<FuncId, Range<usize>>,
}

pub(super) fn parse_skeleton(bytes: &[u8], cx: &Context) -> Result<Skeleton> {
    let mut cursor = Cursor::new(bytes);
    let magic: [u8; 4] = cursor
        .read_bytes(4)?
        .try_into()
        .map_err(|_| CodecError::Truncated)?;
    if magic != MAGIC {
        return Err(CodecError::BadMagic(u32::from_le_bytes(magic)).into());
    }
    let version = cursor.read_vbr()?;
    if version > VERSION {
        return Err(CodecError::UnsupportedVersion(version as u32).into());
    }

    let mut module = Module::new("", cx);
    let mut types: Vec<Type> = Vec::new();
    let mut consts: Vec<Constant> = Vec::new();
    let mut bodies = HashMap::new();
    let mut pending_inits: Vec<(GlobalId, u32)> = Vec::new();

    while !cursor.is_at_end() {
        let tag = cursor.read_u8()?;
        let len = cursor.read_vbr()? as usize;
        let start = cursor.position();
        let mut block = cursor.take_slice(len)?;
        let block_tag = BlockTag::try_from(tag).map_err(|_| CodecError::BadTag {
            block: "top level",
            tag: u64::from(tag),
        })?;
        trace!("reading {block_tag:?} block ({len} bytes)");
        match block_tag {
            BlockTag::Module => {
                module.name = block.read_str()?;
                module.target = TargetData::from_signature(&block.read_str()?)?;
                let n = block.read_vbr()? as usize;
                for _ in 0..n {
                    module.deplibs.push(block.read_str()?);
                }
            }
            BlockTag::Types => {
                types = parse_type_table(&mut block, cx)?;
            }
            BlockTag::Globals => {
                parse_globals(&mut block, &types, &mut module, cx)?;
            }
            BlockTag::Constants => {
                consts = parse_constants(&mut block, &types, &module, cx)?;
            }
            BlockTag::Inits => {
                let n = block.read_vbr()? as usize;
                for _ in 0..n {
                    let g = read_index(&mut block, module.globals.len(), "global")?;
                    let c = block.read_vbr()? as u32;
                    pending_inits.push((GlobalId::from_raw(g), c));
                }
            }
            BlockTag::Function => {
                let g = read_index(&mut block, module.globals.len(), "global")?;
                let compression = block.read_u8()?;
                Compression::try_from(compression).map_err(|_| CodecError::BadTag {
                    block: "function",
                    tag: u64::from(compression),
                })?;
                let f = module.globals[GlobalId::from_raw(g)]
                    .function_id()
                    .ok_or(CodecError::BadIndex {
                        table: "function global",
                        index: u64::from(g),
                    })?;
                let body_start = start + (len - block.remaining());
                bodies.insert(f, body_start..start + len);
            }
        }
    }

    for (g, c) in pending_inits {
        let init = *consts
            .get(c as usize)
            .ok_or(CodecError::BadIndex {
                table: "constant",
                index: u64::from(c),
            })?;
        let expected = module.globals[g].ty;
        if cx.const_type(init) != expected {
            return Err(Error::TypeMismatch {
                context: "global initializer",
                expected: cx.type_name(expected),
                found: cx.type_name(cx.const_type(init)),
            });
        }
        if let GlobalKind::Variable { init: slot, .. } = &mut module.globals[g].kind {
            *slot = Some(init);
        }
    }

    Ok(Skeleton {
        module,
        types,
        consts,
        bodies,
    })
}

fn read_index(cursor: &mut Cursor<'_>, limit: usize, table: &'static str) -> Result<u32> {
    let raw = cursor.read_vbr()?;
    if raw as usize >= limit {
        return Err(CodecError::BadIndex { table, index: raw }.into());
    }
    Ok(raw as u32)
}

/// Parse the type table. Entries may reference later entries (forward
/// references through a deferred-resolution slot): raw records are read
/// first and resolved recursively afterwards; a resolution cycle means
/// the table does not describe a finite DAG and is rejected.
fn parse_type_table(cursor: &mut Cursor<'_>, cx: &Context) -> Result<Vec<Type>> {
    enum Raw {
        Done(Type),
        Pointer(u32),
        Array(u32, u64),
        Struct(Vec<u32>),
        Function { ret: u32, params: Vec<u32>, vararg: bool },
    }

    let count = cursor.read_vbr()? as usize;
    let mut raw = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = cursor.read_u8()?;
        let tag = TypeTag::try_from(tag).map_err(|_| CodecError::BadTag {
            block: "type table",
            tag: u64::from(tag),
        })?;
        raw.push(match tag {
            TypeTag::Pointer => Raw::Pointer(cursor.read_vbr()? as u32),
            TypeTag::Array => {
                let elem = cursor.read_vbr()? as u32;
                let len = cursor.read_vbr()?;
                Raw::Array(elem, len)
            }
            TypeTag::Struct => {
                let n = cursor.read_vbr()? as usize;
                let mut fields = Vec::with_capacity(n);
                for _ in 0..n {
                    fields.push(cursor.read_vbr()? as u32);
                }
                Raw::Struct(fields)
            }
            TypeTag::Function => {
                let ret = cursor.read_vbr()? as u32;
                let n = cursor.read_vbr()? as usize;
                let mut params = Vec::with_capacity(n);
                for _ in 0..n {
                    params.push(cursor.read_vbr()? as u32);
                }
                let vararg = cursor.read_u8()? != 0;
                Raw::Function { ret, params, vararg }
            }
            TypeTag::Opaque => {
                let _token = cursor.read_vbr()?;
                Raw::Done(cx.opaque_ty())
            }
            primitive => Raw::Done(
                cx.primitive_ty(primitive)
                    .expect("non-derived tags are primitives"),
            ),
        });
    }

    // Resolve with an explicit in-progress set to reject cycles.
    fn resolve(
        idx: u32,
        raw: &[Raw],
        memo: &mut Vec<Option<Type>>,
        busy: &mut Vec<bool>,
        cx: &Context,
    ) -> Result<Type> {
        let i = idx as usize;
        if i >= raw.len() {
            return Err(CodecError::BadIndex {
                table: "type",
                index: u64::from(idx),
            }
            .into());
        }
        if let Some(ty) = memo[i] {
            return Ok(ty);
        }
        if busy[i] {
            return Err(CodecError::UnresolvedForwardRef {
                scope: "type table",
                count: 1,
            }
            .into());
        }
        busy[i] = true;
        let ty = match &raw[i] {
            Raw::Done(ty) => *ty,
            Raw::Pointer(t) => {
                let t = resolve(*t, raw, memo, busy, cx)?;
                cx.pointer_to(t)
            }
            Raw::Array(t, n) => {
                let t = resolve(*t, raw, memo, busy, cx)?;
                cx.array_of(t, *n)
            }
            Raw::Struct(fields) => {
                let fields = fields
                    .iter()
                    .map(|&f| resolve(f, raw, memo, busy, cx))
                    .collect::<Result<Vec<_>>>()?;
                cx.struct_of(&fields)
            }
            Raw::Function { ret, params, vararg } => {
                let ret = resolve(*ret, raw, memo, busy, cx)?;
                let params = params
                    .iter()
                    .map(|&p| resolve(p, raw, memo, busy, cx))
                    .collect::<Result<Vec<_>>>()?;
                cx.function_ty(ret, &params, *vararg)
            }
        };
        busy[i] = false;
        memo[i] = Some(ty);
        Ok(ty)
    }

    let mut memo = vec![None; raw.len()];
    let mut busy = vec![false; raw.len()];
    (0..raw.len() as u32)
        .map(|i| resolve(i, &raw, &mut memo, &mut busy, cx))
        .collect()
}

fn parse_globals(
    cursor: &mut Cursor<'_>,
    types: &[Type],
    module: &mut Module,
    cx: &Context,
) -> Result<()> {
    let count = cursor.read_vbr()? as usize;
    for _ in 0..count {
        let name = cursor.read_str()?;
        let ty_idx = read_index(cursor, types.len(), "type")?;
        let ty = types[ty_idx as usize];
        let linkage = cursor.read_u8()?;
        let linkage = match LinkageTag::try_from(linkage).map_err(|_| CodecError::BadTag {
            block: "globals",
            tag: u64::from(linkage),
        })? {
            LinkageTag::External => Linkage::External,
            LinkageTag::Internal => Linkage::Internal,
        };
        let kind = cursor.read_u8()?;
        match GlobalTag::try_from(kind).map_err(|_| CodecError::BadTag {
            block: "globals",
            tag: u64::from(kind),
        })? {
            GlobalTag::Variable => {
                let is_const = cursor.read_u8()? != 0;
                module.add_global(&name, ty, linkage, None, is_const, cx)?;
            }
            GlobalTag::Function => {
                module.add_function(&name, ty, linkage, cx)?;
            }
        }
    }
    Ok(())
}

fn parse_constants(
    cursor: &mut Cursor<'_>,
    types: &[Type],
    module: &Module,
    cx: &Context,
) -> Result<Vec<Constant>> {
    let mut consts = Vec::new();
    parse_pool(cursor, types, module, cx, &mut consts)?;
    Ok(consts)
}

/// Append one scope's pool entries to `consts`. Entries may reference
/// anything already decoded (outer scopes included): pools are
/// topologically sorted, so an operand's index is always smaller.
fn parse_pool(
    cursor: &mut Cursor<'_>,
    types: &[Type],
    module: &Module,
    cx: &Context,
    consts: &mut Vec<Constant>,
) -> Result<()> {
    let count = cursor.read_vbr()? as usize;
    consts.reserve(count);
    for _ in 0..count {
        let ty_idx = read_index(cursor, types.len(), "type")?;
        let ty = types[ty_idx as usize];
        let tag = cursor.read_u8()?;
        let tag = ConstTag::try_from(tag).map_err(|_| CodecError::BadTag {
            block: "constant pool",
            tag: u64::from(tag),
        })?;
        let c = match tag {
            ConstTag::Bool => {
                let b = cursor.read_u8()? != 0;
                cx.const_bool(b)
            }
            ConstTag::Int => {
                let bits = cursor.read_vbr()?;
                let int_tag = cx.tag(ty);
                if !int_tag.is_integer() {
                    return Err(Error::TypeMismatch {
                        context: "integer constant",
                        expected: "integer type".into(),
                        found: cx.type_name(ty),
                    });
                }
                if crate::ir::constant::truncate_bits(int_tag, bits) != bits {
                    return Err(Error::ConstantOutOfRange {
                        ty: cx.type_name(ty),
                        value: bits.to_string(),
                    });
                }
                cx.const_int_bits(ty, bits)
            }
            ConstTag::Float => {
                let bits = cursor.read_vbr()?;
                match cx.tag(ty) {
                    TypeTag::F32 => cx.const_float(ty, f64::from(f32::from_bits(bits as u32)))?,
                    TypeTag::F64 => cx.const_float(ty, f64::from_bits(bits))?,
                    _ => {
                        return Err(Error::TypeMismatch {
                            context: "floating constant",
                            expected: "f32 or f64".into(),
                            found: cx.type_name(ty),
                        });
                    }
                }
            }
            ConstTag::Null => cx.const_null(ty)?,
            ConstTag::Aggregate => {
                let n = cursor.read_vbr()? as usize;
                let mut members = Vec::with_capacity(n);
                for _ in 0..n {
                    // Topological order: members always precede users.
                    let idx = read_index(cursor, consts.len(), "constant")?;
                    members.push(consts[idx as usize]);
                }
                cx.const_aggregate(ty, &members)?
            }
            ConstTag::GlobalAddr => {
                let g = read_index(cursor, module.globals.len(), "global")?;
                let g = GlobalId::from_raw(g);
                let addr = module.global_addr(g, cx);
                if cx.const_type(addr) != ty {
                    return Err(Error::TypeMismatch {
                        context: "global address constant",
                        expected: cx.type_name(ty),
                        found: cx.type_name(cx.const_type(addr)),
                    });
                }
                addr
            }
            ConstTag::Expr => {
                let op = cursor.read_u8()?;
                let op = Opcode::try_from(op).map_err(|_| CodecError::BadTag {
                    block: "constant expression",
                    tag: u64::from(op),
                })?;
                let n = cursor.read_vbr()? as usize;
                let mut args = Vec::with_capacity(n);
                for _ in 0..n {
                    let idx = read_index(cursor, consts.len(), "constant")?;
                    args.push(consts[idx as usize]);
                }
                cx.intern_constant(
                    ty,
                    ConstantKind::Expr {
                        op,
                        args: args.into_boxed_slice(),
                    },
                )
            }
        };
        consts.push(c);
    }
    Ok(())
}

/// Parse one function body into its (currently declaration) function.
pub(super) fn parse_function_body(
    payload: &[u8],
    f: FuncId,
    module: &mut Module,
    types: &[Type],
    consts: &[Constant],
    cx: &Context,
) -> Result<()> {
    let mut cursor = Cursor::new(payload);

    // The function-scope constant pool extends the global one in the
    // same index space.
    let mut consts = consts.to_vec();
    parse_pool(&mut cursor, types, module, cx, &mut consts)?;
    let consts = &consts[..];

    let num_blocks = cursor.read_vbr()? as usize;

    // Value slots: arguments first, then non-void results in order.
    let mut values: Vec<ValueRef> = Vec::new();
    {
        let func = &module.functions[f];
        for (a, _) in func.args() {
            values.push(ValueRef::Arg(a));
        }
    }
    let mut blocks = Vec::with_capacity(num_blocks);
    for _ in 0..num_blocks {
        blocks.push(module.functions[f].add_block());
    }

    // slot -> placeholder created for a use before the definition
    let mut pending: HashMap<u32, InstId> = HashMap::new();

    for &block in &blocks {
        let num_insts = cursor.read_vbr()? as usize;
        for _ in 0..num_insts {
            let opcode = cursor.read_u8()?;
            let opcode = Opcode::try_from(opcode).map_err(|_| CodecError::BadTag {
                block: "function body",
                tag: u64::from(opcode),
            })?;
            if opcode == Opcode::Placeholder {
                return Err(CodecError::BadTag {
                    block: "function body",
                    tag: u64::from(u8::from(opcode)),
                }
                .into());
            }
            let ty_idx = read_index(&mut cursor, types.len(), "type")?;
            let ty = types[ty_idx as usize];
            let num_ops = cursor.read_vbr()? as usize;
            let mut operands: SmallVec<[ValueRef; 2]> = SmallVec::with_capacity(num_ops);
            for _ in 0..num_ops {
                operands.push(parse_operand(
                    &mut cursor,
                    f,
                    module,
                    types,
                    consts,
                    &values,
                    &blocks,
                    &mut pending,
                    cx,
                )?);
            }
            let func = &mut module.functions[f];
            let inst = func.append_inst(block, InstData::new(opcode, ty, operands));
            if ty != cx.void_ty() {
                let slot = values.len() as u32;
                values.push(ValueRef::Inst(inst));
                if let Some(placeholder) = pending.remove(&slot) {
                    let declared = func.inst(placeholder).ty;
                    if declared != ty {
                        return Err(Error::TypeMismatch {
                            context: "forward reference",
                            expected: cx.type_name(declared),
                            found: cx.type_name(ty),
                        });
                    }
                    func.replace_all_uses(ValueRef::Inst(placeholder), ValueRef::Inst(inst));
                    func.erase_inst(placeholder)?;
                }
            }
        }
    }

    if !pending.is_empty() {
        return Err(CodecError::UnresolvedForwardRef {
            scope: "function body",
            count: pending.len(),
        }
        .into());
    }

    // Names.
    let named_values = cursor.read_vbr()? as usize;
    for _ in 0..named_values {
        let slot = read_index(&mut cursor, values.len(), "value slot")?;
        let name = cursor.read_str()?;
        let value = values[slot as usize];
        let Module {
            functions, globals, ..
        } = module;
        functions[f].set_value_name(value, Some(&name), globals, cx);
    }
    let named_blocks = cursor.read_vbr()? as usize;
    for _ in 0..named_blocks {
        let idx = read_index(&mut cursor, blocks.len(), "block")?;
        let name = cursor.read_str()?;
        let Module {
            functions, globals, ..
        } = module;
        functions[f].set_value_name(ValueRef::Block(blocks[idx as usize]), Some(&name), globals, cx);
    }

    // The reader trusts nothing: every materialized body is verified.
    verifier::verify_function(&module.functions[f], &module.globals, cx)
}

#[allow(clippy::too_many_arguments)]
fn parse_operand(
    cursor: &mut Cursor<'_>,
    f: FuncId,
    module: &mut Module,
    types: &[Type],
    consts: &[Constant],
    values: &[ValueRef],
    blocks: &[crate::ir::BlockId],
    pending: &mut HashMap<u32, InstId>,
    cx: &Context,
) -> Result<ValueRef> {
    let tag = cursor.read_u8()?;
    let tag = OperandTag::try_from(tag).map_err(|_| CodecError::BadTag {
        block: "operand",
        tag: u64::from(tag),
    })?;
    Ok(match tag {
        OperandTag::Const => {
            let idx = read_index(cursor, consts.len(), "constant")?;
            ValueRef::Const(consts[idx as usize])
        }
        OperandTag::Global => {
            let idx = read_index(cursor, module.globals.len(), "global")?;
            ValueRef::Global(GlobalId::from_raw(idx))
        }
        OperandTag::Block => {
            let idx = read_index(cursor, blocks.len(), "block")?;
            ValueRef::Block(blocks[idx as usize])
        }
        OperandTag::Value => {
            let ty_idx = read_index(cursor, types.len(), "type")?;
            let ty = types[ty_idx as usize];
            let slot = cursor.read_vbr()? as u32;
            if let Some(&value) = values.get(slot as usize) {
                value
            } else {
                // Use before definition: allocate (or reuse) a
                // placeholder of the declared type.
                let placeholder = *pending.entry(slot).or_insert_with(|| {
                    module.functions[f].create_inst(InstData::new(
                        Opcode::Placeholder,
                        ty,
                        SmallVec::new(),
                    ))
                });
                ValueRef::Inst(placeholder)
            }
        }
    })
}
