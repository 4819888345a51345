//! Validated IR construction.
//!
//! Every factory checks its operand types against the opcode's signature
//! before anything is linked, so a failed build leaves no partial state
//! behind. The builder appends at the end of its current block.

use smallvec::{smallvec, SmallVec};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::ir::function::Function;
use crate::ir::instruction::{InstData, Opcode};
use crate::ir::module::Globals;
use crate::ir::types::{Type, TypeKind, TypeTag};
use crate::ir::{BlockId, InstId, ValueRef};

pub struct Builder<'a> {
    pub cx: &'a Context,
    pub globals: &'a Globals,
    pub func: &'a mut Function,
    block: Option<BlockId>,
}

impl<'a> Builder<'a> {
    pub fn new(cx: &'a Context, globals: &'a Globals, func: &'a mut Function) -> Self {
        Self {
            cx,
            globals,
            func,
            block: None,
        }
    }

    /// Point the builder at the end of `block`.
    pub fn position_at_end(&mut self, block: BlockId) -> &mut Self {
        self.block = Some(block);
        self
    }

    /// Create a block and point the builder at it.
    pub fn start_block(&mut self) -> BlockId {
        let b = self.func.add_block();
        self.block = Some(b);
        b
    }

    fn ty_of(&self, v: ValueRef) -> Type {
        self.func.value_ty(v, self.globals, self.cx)
    }

    fn mismatch(&self, context: &'static str, expected: String, found: Type) -> Error {
        Error::TypeMismatch {
            context,
            expected,
            found: self.cx.type_name(found),
        }
    }

    fn emit(&mut self, data: InstData) -> InstId {
        let block = self.block.expect("builder is positioned at a block");
        self.func.append_inst(block, data)
    }

    fn require(&self, ok: bool, context: &'static str, expected: &str, found: Type) -> Result<()> {
        if ok {
            Ok(())
        } else {
            Err(self.mismatch(context, expected.to_owned(), found))
        }
    }

    // ---- value-producing instructions ------------------------------------

    /// `A = B op C` for arithmetic, logical and comparison opcodes.
    pub fn binary(&mut self, op: Opcode, lhs: ValueRef, rhs: ValueRef) -> Result<ValueRef> {
        let (lt, rt) = (self.ty_of(lhs), self.ty_of(rhs));
        if lt != rt {
            return Err(self.mismatch("binary operand", self.cx.type_name(lt), rt));
        }
        let tag = self.cx.tag(lt);
        let result = match op {
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Rem => {
                self.require(
                    tag.is_integer() || tag.is_float(),
                    "arithmetic operand",
                    "integer or floating type",
                    lt,
                )?;
                lt
            }
            Opcode::And | Opcode::Or | Opcode::Xor => {
                self.require(
                    tag.is_integer() || tag == TypeTag::Bool,
                    "logical operand",
                    "integer or bool",
                    lt,
                )?;
                lt
            }
            Opcode::SetEq | Opcode::SetNe => {
                self.require(
                    self.cx.is_first_class(lt),
                    "comparison operand",
                    "first-class type",
                    lt,
                )?;
                self.cx.bool_ty()
            }
            Opcode::SetLt | Opcode::SetGt | Opcode::SetLe | Opcode::SetGe => {
                self.require(
                    tag.is_integer() || tag.is_float() || tag == TypeTag::Bool,
                    "ordering operand",
                    "integer, floating or bool",
                    lt,
                )?;
                self.cx.bool_ty()
            }
            _ => {
                return Err(Error::TypeMismatch {
                    context: "binary opcode",
                    expected: "a binary instruction opcode".into(),
                    found: op.mnemonic().into(),
                });
            }
        };
        let id = self.emit(InstData::new(op, result, smallvec![lhs, rhs]));
        Ok(ValueRef::Inst(id))
    }

    /// Bitwise (or boolean) complement.
    pub fn not(&mut self, v: ValueRef) -> Result<ValueRef> {
        let ty = self.ty_of(v);
        let tag = self.cx.tag(ty);
        self.require(
            tag.is_integer() || tag == TypeTag::Bool,
            "not operand",
            "integer or bool",
            ty,
        )?;
        let id = self.emit(InstData::new(Opcode::Not, ty, smallvec![v]));
        Ok(ValueRef::Inst(id))
    }

    /// Convert between first-class types.
    pub fn cast(&mut self, v: ValueRef, dst: Type) -> Result<ValueRef> {
        let src = self.ty_of(v);
        self.require(
            self.cx.is_first_class(src),
            "cast source",
            "first-class type",
            src,
        )?;
        self.require(
            self.cx.is_first_class(dst),
            "cast destination",
            "first-class type",
            dst,
        )?;
        let id = self.emit(InstData::new(Opcode::Cast, dst, smallvec![v]));
        Ok(ValueRef::Inst(id))
    }

    /// Shift left/right; the amount is a `u8`.
    pub fn shift(&mut self, op: Opcode, v: ValueRef, amount: ValueRef) -> Result<ValueRef> {
        debug_assert!(matches!(op, Opcode::Shl | Opcode::Shr));
        let ty = self.ty_of(v);
        self.require(self.cx.tag(ty).is_integer(), "shift value", "integer", ty)?;
        let at = self.ty_of(amount);
        self.require(at == self.cx.u8_ty(), "shift amount", "u8", at)?;
        let id = self.emit(InstData::new(op, ty, smallvec![v, amount]));
        Ok(ValueRef::Inst(id))
    }

    /// Stack allocation of one `ty` (or `count` of them); yields `ty*`.
    pub fn alloca(&mut self, ty: Type, count: Option<ValueRef>) -> Result<ValueRef> {
        self.alloc_like(Opcode::Alloca, ty, count)
    }

    /// Heap allocation; yields `ty*`.
    pub fn malloc(&mut self, ty: Type, count: Option<ValueRef>) -> Result<ValueRef> {
        self.alloc_like(Opcode::Malloc, ty, count)
    }

    fn alloc_like(&mut self, op: Opcode, ty: Type, count: Option<ValueRef>) -> Result<ValueRef> {
        self.require(self.cx.is_sized(ty), "allocation", "sized type", ty)?;
        let mut operands: SmallVec<[ValueRef; 2]> = SmallVec::new();
        if let Some(count) = count {
            let ct = self.ty_of(count);
            self.require(ct == self.cx.u32_ty(), "allocation count", "u32", ct)?;
            operands.push(count);
        }
        let id = self.emit(InstData::new(op, self.cx.pointer_to(ty), operands));
        Ok(ValueRef::Inst(id))
    }

    /// Release a heap allocation.
    pub fn free(&mut self, ptr: ValueRef) -> Result<InstId> {
        let pt = self.ty_of(ptr);
        self.require(
            self.cx.tag(pt) == TypeTag::Pointer,
            "free operand",
            "pointer",
            pt,
        )?;
        Ok(self.emit(InstData::new(Opcode::Free, self.cx.void_ty(), smallvec![ptr])))
    }

    /// Load a first-class value through a pointer.
    pub fn load(&mut self, ptr: ValueRef) -> Result<ValueRef> {
        let pt = self.ty_of(ptr);
        let pointee = self
            .cx
            .pointee(pt)
            .ok_or_else(|| self.mismatch("load address", "pointer".into(), pt))?;
        self.require(
            self.cx.is_first_class(pointee),
            "load result",
            "first-class type",
            pointee,
        )?;
        let id = self.emit(InstData::new(Opcode::Load, pointee, smallvec![ptr]));
        Ok(ValueRef::Inst(id))
    }

    /// Store a first-class value through a pointer.
    pub fn store(&mut self, value: ValueRef, ptr: ValueRef) -> Result<InstId> {
        let pt = self.ty_of(ptr);
        let pointee = self
            .cx
            .pointee(pt)
            .ok_or_else(|| self.mismatch("store address", "pointer".into(), pt))?;
        let vt = self.ty_of(value);
        if vt != pointee {
            return Err(self.mismatch("store value", self.cx.type_name(pointee), vt));
        }
        Ok(self.emit(InstData::new(
            Opcode::Store,
            self.cx.void_ty(),
            smallvec![value, ptr],
        )))
    }

    /// Symbolic address arithmetic. The first index steps the pointer
    /// itself; each further index selects a struct field (constant `u32`)
    /// or an array element (any integer).
    pub fn gep(&mut self, base: ValueRef, indices: &[ValueRef]) -> Result<ValueRef> {
        let bt = self.ty_of(base);
        let mut current = self
            .cx
            .pointee(bt)
            .ok_or_else(|| self.mismatch("getelementptr base", "pointer".into(), bt))?;
        let mut first = true;
        for &idx in indices {
            if first {
                first = false;
                let it = self.ty_of(idx);
                self.require(
                    self.cx.tag(it).is_integer(),
                    "getelementptr index",
                    "integer",
                    it,
                )?;
                continue;
            }
            current = self.walk_aggregate(current, idx)?;
        }
        let ty = self.cx.pointer_to(current);
        let mut operands: SmallVec<[ValueRef; 2]> = smallvec![base];
        operands.extend_from_slice(indices);
        let id = self.emit(InstData::new(Opcode::Gep, ty, operands));
        Ok(ValueRef::Inst(id))
    }

    fn walk_aggregate(&self, current: Type, idx: ValueRef) -> Result<Type> {
        match self.cx.kind(current) {
            TypeKind::Struct(fields) => {
                let c = idx.as_const().ok_or_else(|| Error::TypeMismatch {
                    context: "struct index",
                    expected: "constant u32".into(),
                    found: "non-constant value".into(),
                })?;
                let field = self.cx.const_uint_value(c).ok_or_else(|| {
                    self.mismatch("struct index", "constant u32".into(), self.cx.const_type(c))
                })? as usize;
                fields
                    .get(field)
                    .copied()
                    .ok_or_else(|| self.mismatch("struct index", format!("0..{}", fields.len()), current))
            }
            TypeKind::Array(elem, _) => {
                let it = self.ty_of(idx);
                self.require(self.cx.tag(it).is_integer(), "array index", "integer", it)?;
                Ok(elem)
            }
            _ => Err(self.mismatch(
                "getelementptr step",
                "struct or array".into(),
                current,
            )),
        }
    }

    /// An empty phi of the given type; add incomings afterwards.
    pub fn phi(&mut self, ty: Type) -> Result<ValueRef> {
        self.require(self.cx.is_first_class(ty), "phi type", "first-class type", ty)?;
        let id = self.emit(InstData::new(Opcode::Phi, ty, SmallVec::new()));
        Ok(ValueRef::Inst(id))
    }

    /// Add an incoming pair to a phi, checking the value type.
    pub fn add_incoming(&mut self, phi: ValueRef, value: ValueRef, pred: BlockId) -> Result<()> {
        let phi = phi.as_inst().ok_or_else(|| Error::TypeMismatch {
            context: "phi incoming",
            expected: "phi instruction".into(),
            found: "non-instruction value".into(),
        })?;
        let pt = self.func.inst(phi).ty;
        let vt = self.ty_of(value);
        if vt != pt {
            return Err(self.mismatch("phi incoming value", self.cx.type_name(pt), vt));
        }
        self.func.add_phi_incoming(phi, value, pred);
        Ok(())
    }

    /// Direct or indirect call. The callee must be pointer-to-function.
    pub fn call(&mut self, callee: ValueRef, args: &[ValueRef]) -> Result<ValueRef> {
        let ret = self.check_call(callee, args)?;
        let mut operands: SmallVec<[ValueRef; 2]> = smallvec![callee];
        operands.extend_from_slice(args);
        let id = self.emit(InstData::new(Opcode::Call, ret, operands));
        Ok(ValueRef::Inst(id))
    }

    /// A call with explicit normal/unwind continuations; a terminator.
    pub fn invoke(
        &mut self,
        callee: ValueRef,
        normal: BlockId,
        unwind: BlockId,
        args: &[ValueRef],
    ) -> Result<ValueRef> {
        let ret = self.check_call(callee, args)?;
        let mut operands: SmallVec<[ValueRef; 2]> =
            smallvec![callee, ValueRef::Block(normal), ValueRef::Block(unwind)];
        operands.extend_from_slice(args);
        let id = self.emit(InstData::new(Opcode::Invoke, ret, operands));
        Ok(ValueRef::Inst(id))
    }

    fn check_call(&self, callee: ValueRef, args: &[ValueRef]) -> Result<Type> {
        let ct = self.ty_of(callee);
        let sig = self
            .cx
            .pointee(ct)
            .ok_or_else(|| self.mismatch("callee", "pointer to function".into(), ct))?;
        let TypeKind::Function { ret, params, vararg } = self.cx.kind(sig) else {
            return Err(self.mismatch("callee", "pointer to function".into(), ct));
        };
        let fixed = params.len();
        let ok_count = if vararg {
            args.len() >= fixed
        } else {
            args.len() == fixed
        };
        if !ok_count {
            return Err(Error::TypeMismatch {
                context: "call arguments",
                expected: format!("{fixed}{} arguments", if vararg { "+" } else { "" }),
                found: args.len().to_string(),
            });
        }
        for (&arg, &param) in args.iter().zip(params.iter()) {
            let at = self.ty_of(arg);
            if at != param {
                return Err(self.mismatch("call argument", self.cx.type_name(param), at));
            }
        }
        Ok(ret)
    }

    // ---- terminators -----------------------------------------------------

    pub fn ret(&mut self, value: Option<ValueRef>) -> Result<InstId> {
        let expected = self.func.return_ty(self.cx);
        match value {
            None => {
                self.require(expected == self.cx.void_ty(), "return", "void", expected)?;
                Ok(self.emit(InstData::new(Opcode::Ret, self.cx.void_ty(), SmallVec::new())))
            }
            Some(v) => {
                let vt = self.ty_of(v);
                if vt != expected {
                    return Err(self.mismatch("return value", self.cx.type_name(expected), vt));
                }
                Ok(self.emit(InstData::new(Opcode::Ret, self.cx.void_ty(), smallvec![v])))
            }
        }
    }

    pub fn br(&mut self, dest: BlockId) -> Result<InstId> {
        Ok(self.emit(InstData::new(
            Opcode::Br,
            self.cx.void_ty(),
            smallvec![ValueRef::Block(dest)],
        )))
    }

    pub fn cond_br(&mut self, cond: ValueRef, iftrue: BlockId, iffalse: BlockId) -> Result<InstId> {
        let ct = self.ty_of(cond);
        self.require(ct == self.cx.bool_ty(), "branch condition", "bool", ct)?;
        Ok(self.emit(InstData::new(
            Opcode::CondBr,
            self.cx.void_ty(),
            smallvec![cond, ValueRef::Block(iftrue), ValueRef::Block(iffalse)],
        )))
    }

    pub fn switch(
        &mut self,
        value: ValueRef,
        default: BlockId,
        cases: &[(ValueRef, BlockId)],
    ) -> Result<InstId> {
        let vt = self.ty_of(value);
        self.require(self.cx.tag(vt).is_integer(), "switch value", "integer", vt)?;
        for &(case, _) in cases {
            let Some(c) = case.as_const() else {
                return Err(Error::TypeMismatch {
                    context: "switch case",
                    expected: "constant".into(),
                    found: "non-constant value".into(),
                });
            };
            let ct = self.cx.const_type(c);
            if ct != vt {
                return Err(self.mismatch("switch case", self.cx.type_name(vt), ct));
            }
        }
        let mut operands: SmallVec<[ValueRef; 2]> = smallvec![value, ValueRef::Block(default)];
        for &(case, dest) in cases {
            operands.push(case);
            operands.push(ValueRef::Block(dest));
        }
        Ok(self.emit(InstData::new(Opcode::Switch, self.cx.void_ty(), operands)))
    }

    // ---- graph surgery ---------------------------------------------------

    /// Typed replace-all-uses-with: both sides must have the same type.
    pub fn replace_all_uses_with(&mut self, old: ValueRef, new: ValueRef) -> Result<()> {
        let (ot, nt) = (self.ty_of(old), self.ty_of(new));
        if ot != nt {
            return Err(self.mismatch("replacement value", self.cx.type_name(ot), nt));
        }
        self.func.replace_all_uses(old, new);
        Ok(())
    }
}
