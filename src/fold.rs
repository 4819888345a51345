//! The constant-folding algebra.
//!
//! For each (opcode, operand type) pair this module either computes the
//! result constant or answers "no fold" (`None`). No entry point ever
//! errors: an unfoldable input is a normal outcome, not a failure.
//!
//! Dispatch goes through a per-type rule table selected by the operand
//! type's tag and cached as an annotation on the type, so the first fold
//! over e.g. `u16` pays the lookup once. The rule implementations are
//! generated over the native builtin representations (`i8`..`u64`,
//! `f32`/`f64`, `bool`, the null pointer).
//!
//! Semantics:
//! * integer arithmetic wraps (two's complement) at the width of the
//!   result type; signedness comes from the type;
//! * division or remainder by zero does not fold, and neither does
//!   signed `MIN / -1`;
//! * equality is defined for every first-class type; orderings derive
//!   from `lessthan` by swap and negation;
//! * pointer constants fold only when null or handle-identical;
//! * casting the null pointer yields the zero of the destination;
//! * a cast to the value's own type is the identity.

use std::any::Any;
use std::rc::Rc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::ir::constant::{Constant, ConstantKind};
use crate::ir::instruction::Opcode;
use crate::ir::types::{Type, TypeKind, TypeTag};

/// One type's slice of the algebra. Binary methods see both operands
/// pre-checked to this rule set's type (shifts excepted: the amount is
/// always `u8`).
trait ConstRules {
    fn op_not(&self, cx: &Context, v: Constant) -> Option<Constant>;
    fn add(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant>;
    fn sub(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant>;
    fn mul(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant>;
    fn div(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant>;
    fn rem(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant>;
    fn bit_and(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant>;
    fn bit_or(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant>;
    fn bit_xor(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant>;
    fn shl(&self, cx: &Context, a: Constant, amount: u32) -> Option<Constant>;
    fn shr(&self, cx: &Context, a: Constant, amount: u32) -> Option<Constant>;
    fn lessthan(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant>;
    fn equal(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant>;

    /// Convert to an arbitrary first-class destination type.
    fn cast_to(&self, cx: &Context, v: Constant, dst: Type) -> Option<Constant> {
        cast_constant(cx, v, dst)
    }
}

macro_rules! int_rules {
    ($name:ident, $prim:ty) => {
        struct $name;

        impl $name {
            fn get(cx: &Context, c: Constant) -> Option<$prim> {
                cx.const_uint_value(c).map(|bits| bits as $prim)
            }

            fn put(cx: &Context, ty: Type, v: $prim) -> Option<Constant> {
                Some(cx.const_int_bits(ty, v as u64))
            }
        }

        impl ConstRules for $name {
            fn op_not(&self, cx: &Context, v: Constant) -> Option<Constant> {
                let ty = cx.const_type(v);
                Self::put(cx, ty, !Self::get(cx, v)?)
            }
            fn add(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
                let ty = cx.const_type(a);
                Self::put(cx, ty, Self::get(cx, a)?.wrapping_add(Self::get(cx, b)?))
            }
            fn sub(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
                let ty = cx.const_type(a);
                Self::put(cx, ty, Self::get(cx, a)?.wrapping_sub(Self::get(cx, b)?))
            }
            fn mul(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
                let ty = cx.const_type(a);
                Self::put(cx, ty, Self::get(cx, a)?.wrapping_mul(Self::get(cx, b)?))
            }
            fn div(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
                let ty = cx.const_type(a);
                // `checked_div` rejects both /0 and signed MIN / -1.
                Self::put(cx, ty, Self::get(cx, a)?.checked_div(Self::get(cx, b)?)?)
            }
            fn rem(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
                let ty = cx.const_type(a);
                Self::put(cx, ty, Self::get(cx, a)?.checked_rem(Self::get(cx, b)?)?)
            }
            fn bit_and(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
                let ty = cx.const_type(a);
                Self::put(cx, ty, Self::get(cx, a)? & Self::get(cx, b)?)
            }
            fn bit_or(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
                let ty = cx.const_type(a);
                Self::put(cx, ty, Self::get(cx, a)? | Self::get(cx, b)?)
            }
            fn bit_xor(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
                let ty = cx.const_type(a);
                Self::put(cx, ty, Self::get(cx, a)? ^ Self::get(cx, b)?)
            }
            fn shl(&self, cx: &Context, a: Constant, amount: u32) -> Option<Constant> {
                let ty = cx.const_type(a);
                Self::put(cx, ty, Self::get(cx, a)?.checked_shl(amount)?)
            }
            fn shr(&self, cx: &Context, a: Constant, amount: u32) -> Option<Constant> {
                let ty = cx.const_type(a);
                // `>>` on a signed repr is arithmetic, on unsigned logical.
                Self::put(cx, ty, Self::get(cx, a)?.checked_shr(amount)?)
            }
            fn lessthan(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
                Some(cx.const_bool(Self::get(cx, a)? < Self::get(cx, b)?))
            }
            fn equal(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
                Some(cx.const_bool(Self::get(cx, a)? == Self::get(cx, b)?))
            }
        }
    };
}

int_rules!(I8Rules, i8);
int_rules!(U8Rules, u8);
int_rules!(I16Rules, i16);
int_rules!(U16Rules, u16);
int_rules!(I32Rules, i32);
int_rules!(U32Rules, u32);
int_rules!(I64Rules, i64);
int_rules!(U64Rules, u64);

macro_rules! float_rules {
    ($name:ident, $prim:ty) => {
        struct $name;

        impl $name {
            fn get(cx: &Context, c: Constant) -> Option<$prim> {
                cx.const_float_value(c).map(|v| v as $prim)
            }

            fn put(cx: &Context, ty: Type, v: $prim) -> Option<Constant> {
                cx.const_float(ty, v as f64).ok()
            }
        }

        impl ConstRules for $name {
            fn op_not(&self, _cx: &Context, _v: Constant) -> Option<Constant> {
                None
            }
            fn add(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
                let ty = cx.const_type(a);
                Self::put(cx, ty, Self::get(cx, a)? + Self::get(cx, b)?)
            }
            fn sub(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
                let ty = cx.const_type(a);
                Self::put(cx, ty, Self::get(cx, a)? - Self::get(cx, b)?)
            }
            fn mul(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
                let ty = cx.const_type(a);
                Self::put(cx, ty, Self::get(cx, a)? * Self::get(cx, b)?)
            }
            fn div(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
                let ty = cx.const_type(a);
                let d = Self::get(cx, b)?;
                if d == 0.0 {
                    return None;
                }
                Self::put(cx, ty, Self::get(cx, a)? / d)
            }
            fn rem(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
                let ty = cx.const_type(a);
                let d = Self::get(cx, b)?;
                if d == 0.0 {
                    return None;
                }
                Self::put(cx, ty, Self::get(cx, a)? % d)
            }
            fn bit_and(&self, _cx: &Context, _a: Constant, _b: Constant) -> Option<Constant> {
                None
            }
            fn bit_or(&self, _cx: &Context, _a: Constant, _b: Constant) -> Option<Constant> {
                None
            }
            fn bit_xor(&self, _cx: &Context, _a: Constant, _b: Constant) -> Option<Constant> {
                None
            }
            fn shl(&self, _cx: &Context, _a: Constant, _amount: u32) -> Option<Constant> {
                None
            }
            fn shr(&self, _cx: &Context, _a: Constant, _amount: u32) -> Option<Constant> {
                None
            }
            fn lessthan(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
                Some(cx.const_bool(Self::get(cx, a)? < Self::get(cx, b)?))
            }
            fn equal(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
                // IEEE equality: NaN is not equal to anything, zero signs
                // compare equal.
                Some(cx.const_bool(Self::get(cx, a)? == Self::get(cx, b)?))
            }
        }
    };
}

float_rules!(F32Rules, f32);
float_rules!(F64Rules, f64);

struct BoolRules;

impl BoolRules {
    fn get(cx: &Context, c: Constant) -> Option<bool> {
        match cx.const_data(c).kind {
            ConstantKind::Bool(b) => Some(b),
            _ => None,
        }
    }
}

impl ConstRules for BoolRules {
    fn op_not(&self, cx: &Context, v: Constant) -> Option<Constant> {
        Some(cx.const_bool(!Self::get(cx, v)?))
    }
    fn add(&self, _cx: &Context, _a: Constant, _b: Constant) -> Option<Constant> {
        None
    }
    fn sub(&self, _cx: &Context, _a: Constant, _b: Constant) -> Option<Constant> {
        None
    }
    fn mul(&self, _cx: &Context, _a: Constant, _b: Constant) -> Option<Constant> {
        None
    }
    fn div(&self, _cx: &Context, _a: Constant, _b: Constant) -> Option<Constant> {
        None
    }
    fn rem(&self, _cx: &Context, _a: Constant, _b: Constant) -> Option<Constant> {
        None
    }
    fn bit_and(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
        Some(cx.const_bool(Self::get(cx, a)? & Self::get(cx, b)?))
    }
    fn bit_or(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
        Some(cx.const_bool(Self::get(cx, a)? | Self::get(cx, b)?))
    }
    fn bit_xor(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
        Some(cx.const_bool(Self::get(cx, a)? ^ Self::get(cx, b)?))
    }
    fn shl(&self, _cx: &Context, _a: Constant, _amount: u32) -> Option<Constant> {
        None
    }
    fn shr(&self, _cx: &Context, _a: Constant, _amount: u32) -> Option<Constant> {
        None
    }
    fn lessthan(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
        Some(cx.const_bool(!Self::get(cx, a)? & Self::get(cx, b)?))
    }
    fn equal(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
        Some(cx.const_bool(Self::get(cx, a)? == Self::get(cx, b)?))
    }
}

struct PointerRules;

impl ConstRules for PointerRules {
    fn op_not(&self, _cx: &Context, _v: Constant) -> Option<Constant> {
        None
    }
    fn add(&self, _cx: &Context, _a: Constant, _b: Constant) -> Option<Constant> {
        None
    }
    fn sub(&self, _cx: &Context, _a: Constant, _b: Constant) -> Option<Constant> {
        None
    }
    fn mul(&self, _cx: &Context, _a: Constant, _b: Constant) -> Option<Constant> {
        None
    }
    fn div(&self, _cx: &Context, _a: Constant, _b: Constant) -> Option<Constant> {
        None
    }
    fn rem(&self, _cx: &Context, _a: Constant, _b: Constant) -> Option<Constant> {
        None
    }
    fn bit_and(&self, _cx: &Context, _a: Constant, _b: Constant) -> Option<Constant> {
        None
    }
    fn bit_or(&self, _cx: &Context, _a: Constant, _b: Constant) -> Option<Constant> {
        None
    }
    fn bit_xor(&self, _cx: &Context, _a: Constant, _b: Constant) -> Option<Constant> {
        None
    }
    fn shl(&self, _cx: &Context, _a: Constant, _amount: u32) -> Option<Constant> {
        None
    }
    fn shr(&self, _cx: &Context, _a: Constant, _amount: u32) -> Option<Constant> {
        None
    }
    fn lessthan(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
        (cx.const_is_null(a) && cx.const_is_null(b)).then(|| cx.const_bool(false))
    }
    fn equal(&self, cx: &Context, a: Constant, b: Constant) -> Option<Constant> {
        if a == b {
            // Handle identity: same null or same global address.
            return Some(cx.const_bool(true));
        }
        if cx.const_is_null(a) || cx.const_is_null(b) {
            // Null against a distinct global address: globals are never null.
            let other = if cx.const_is_null(a) { b } else { a };
            if matches!(cx.const_data(other).kind, ConstantKind::GlobalAddr { .. }) {
                return Some(cx.const_bool(false));
            }
        }
        None
    }
}

/// Convert any foldable constant to a first-class destination type.
fn cast_constant(cx: &Context, v: Constant, dst: Type) -> Option<Constant> {
    let data = cx.const_data(v);
    if data.ty == dst {
        return Some(v);
    }
    let dst_tag = cx.tag(dst);
    match data.kind {
        ConstantKind::Bool(_) | ConstantKind::Int(_) => {
            let src_tag = cx.tag(data.ty);
            let wide: i64 = cx.const_int_value(v)?;
            match dst_tag {
                TypeTag::Bool => Some(cx.const_bool(wide != 0)),
                t if t.is_integer() => Some(cx.const_int_bits(dst, wide as u64)),
                TypeTag::F32 | TypeTag::F64 => {
                    let f = if src_tag.is_unsigned() {
                        cx.const_uint_value(v)? as f64
                    } else {
                        wide as f64
                    };
                    cx.const_float(dst, f).ok()
                }
                TypeTag::Pointer if wide == 0 => cx.const_null(dst).ok(),
                _ => None,
            }
        }
        ConstantKind::Float(_) => {
            let f = cx.const_float_value(v)?;
            match dst_tag {
                TypeTag::Bool => Some(cx.const_bool(f != 0.0)),
                t if t.is_signed() => Some(cx.const_int_bits(dst, (f as i64) as u64)),
                t if t.is_unsigned() => Some(cx.const_int_bits(dst, f as u64)),
                TypeTag::F32 | TypeTag::F64 => cx.const_float(dst, f).ok(),
                _ => None,
            }
        }
        // The null pointer casts to the zero of any first-class type.
        ConstantKind::Null => match dst_tag {
            TypeTag::Bool => Some(cx.const_bool(false)),
            t if t.is_integer() => Some(cx.const_int_bits(dst, 0)),
            TypeTag::F32 | TypeTag::F64 => cx.const_float(dst, 0.0).ok(),
            TypeTag::Pointer => cx.const_null(dst).ok(),
            _ => None,
        },
        // A global's address survives pointer-to-pointer retyping only.
        ConstantKind::GlobalAddr { module, global } => match dst_tag {
            TypeTag::Pointer => Some(cx.intern_constant(
                dst,
                ConstantKind::GlobalAddr { module, global },
            )),
            _ => None,
        },
        _ => None,
    }
}

struct Dispatch(&'static dyn ConstRules);

fn rules_for(cx: &Context, ty: Type) -> Option<&'static dyn ConstRules> {
    let id = match cx.const_rules_id.get() {
        Some(id) => id,
        None => {
            let id = cx.register_annotation(|cx, host| {
                let ty = Type::from_raw(host as u32);
                let rules: &'static dyn ConstRules = match cx.tag(ty) {
                    TypeTag::Bool => &BoolRules,
                    TypeTag::I8 => &I8Rules,
                    TypeTag::U8 => &U8Rules,
                    TypeTag::I16 => &I16Rules,
                    TypeTag::U16 => &U16Rules,
                    TypeTag::I32 => &I32Rules,
                    TypeTag::U32 => &U32Rules,
                    TypeTag::I64 => &I64Rules,
                    TypeTag::U64 => &U64Rules,
                    TypeTag::F32 => &F32Rules,
                    TypeTag::F64 => &F64Rules,
                    _ => &PointerRules,
                };
                Rc::new(Dispatch(rules)) as Rc<dyn Any>
            });
            cx.const_rules_id.set(Some(id));
            id
        }
    };
    let tag = cx.tag(ty);
    if !(tag.is_integer() || tag.is_float() || tag == TypeTag::Bool || tag == TypeTag::Pointer) {
        return None;
    }
    let any = cx.annotation(id, ty.raw() as u64);
    any.downcast::<Dispatch>().ok().map(|d| d.0)
}

/// Fold a binary instruction over two constants. `None` means the
/// operation is not foldable for these inputs.
pub fn fold_binary(cx: &Context, op: Opcode, a: Constant, b: Constant) -> Option<Constant> {
    let rules = rules_for(cx, cx.const_type(a))?;
    match op {
        Opcode::Add => rules.add(cx, a, b),
        Opcode::Sub => rules.sub(cx, a, b),
        Opcode::Mul => rules.mul(cx, a, b),
        Opcode::Div => rules.div(cx, a, b),
        Opcode::Rem => rules.rem(cx, a, b),
        Opcode::And => rules.bit_and(cx, a, b),
        Opcode::Or => rules.bit_or(cx, a, b),
        Opcode::Xor => rules.bit_xor(cx, a, b),
        Opcode::Shl | Opcode::Shr => {
            let amount = cx.const_uint_value(b)? as u32;
            if op == Opcode::Shl {
                rules.shl(cx, a, amount)
            } else {
                rules.shr(cx, a, amount)
            }
        }
        Opcode::SetEq => rules.equal(cx, a, b),
        Opcode::SetNe => invert(cx, rules.equal(cx, a, b)?),
        Opcode::SetLt => rules.lessthan(cx, a, b),
        Opcode::SetGt => rules.lessthan(cx, b, a),
        Opcode::SetGe => invert(cx, rules.lessthan(cx, a, b)?),
        Opcode::SetLe => invert(cx, rules.lessthan(cx, b, a)?),
        _ => None,
    }
}

/// Fold a unary instruction over a constant.
pub fn fold_unary(cx: &Context, op: Opcode, v: Constant) -> Option<Constant> {
    match op {
        Opcode::Not => rules_for(cx, cx.const_type(v))?.op_not(cx, v),
        _ => None,
    }
}

/// Fold a cast of a constant to `dst`. Casting to the constant's own
/// type is the identity.
pub fn fold_cast(cx: &Context, v: Constant, dst: Type) -> Option<Constant> {
    if cx.const_type(v) == dst {
        return Some(v);
    }
    rules_for(cx, cx.const_type(v))?.cast_to(cx, v, dst)
}

fn invert(cx: &Context, b: Constant) -> Option<Constant> {
    match cx.const_data(b).kind {
        ConstantKind::Bool(v) => Some(cx.const_bool(!v)),
        _ => None,
    }
}

impl Context {
    /// A typed constant expression: eagerly folded when possible,
    /// interned symbolically otherwise.
    pub fn const_binary_expr(&self, op: Opcode, a: Constant, b: Constant) -> Result<Constant> {
        if !op.is_binary() {
            return Err(Error::TypeMismatch {
                context: "constant expression",
                expected: "binary opcode".into(),
                found: op.mnemonic().into(),
            });
        }
        let (at, bt) = (self.const_type(a), self.const_type(b));
        let shift = matches!(op, Opcode::Shl | Opcode::Shr);
        if !shift && at != bt {
            return Err(Error::TypeMismatch {
                context: "constant expression",
                expected: self.type_name(at),
                found: self.type_name(bt),
            });
        }
        if let Some(folded) = fold_binary(self, op, a, b) {
            return Ok(folded);
        }
        let ty = if op.is_compare() { self.bool_ty() } else { at };
        Ok(self.intern_constant(
            ty,
            ConstantKind::Expr {
                op,
                args: Box::new([a, b]),
            },
        ))
    }

    /// A cast constant expression, eagerly folded when possible.
    pub fn const_cast_expr(&self, v: Constant, dst: Type) -> Result<Constant> {
        if !self.is_first_class(dst) {
            return Err(Error::TypeMismatch {
                context: "constant cast",
                expected: "first-class destination".into(),
                found: self.type_name(dst),
            });
        }
        if let Some(folded) = fold_cast(self, v, dst) {
            return Ok(folded);
        }
        Ok(self.intern_constant(
            dst,
            ConstantKind::Expr {
                op: Opcode::Cast,
                args: Box::new([v]),
            },
        ))
    }

    /// A symbolic address-computation expression over a constant base
    /// pointer. Indices follow the same shape as the `getelementptr`
    /// instruction.
    pub fn const_gep_expr(&self, base: Constant, indices: &[Constant]) -> Result<Constant> {
        let base_ty = self.const_type(base);
        let mut current = self.pointee(base_ty).ok_or_else(|| Error::TypeMismatch {
            context: "constant getelementptr",
            expected: "pointer base".into(),
            found: self.type_name(base_ty),
        })?;
        for (n, &idx) in indices.iter().enumerate() {
            if n == 0 {
                continue; // first index steps the pointer itself
            }
            current = match self.kind(current) {
                TypeKind::Struct(fields) => {
                    let field = self.const_uint_value(idx).ok_or_else(|| Error::TypeMismatch {
                        context: "constant struct index",
                        expected: "constant integer".into(),
                        found: self.type_name(self.const_type(idx)),
                    })? as usize;
                    *fields.get(field).ok_or_else(|| Error::TypeMismatch {
                        context: "constant struct index",
                        expected: format!("0..{}", fields.len()),
                        found: field.to_string(),
                    })?
                }
                TypeKind::Array(elem, _) => elem,
                _ => {
                    return Err(Error::TypeMismatch {
                        context: "constant getelementptr",
                        expected: "struct or array step".into(),
                        found: self.type_name(current),
                    });
                }
            };
        }
        if indices.is_empty() {
            return Ok(base);
        }
        let ty = self.pointer_to(current);
        let mut args = vec![base];
        args.extend_from_slice(indices);
        Ok(self.intern_constant(
            ty,
            ConstantKind::Expr {
                op: Opcode::Gep,
                args: args.into_boxed_slice(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i32c(cx: &Context, v: i64) -> Constant {
        cx.const_int(cx.i32_ty(), v).unwrap()
    }

    #[test]
    fn integer_arith_wraps() {
        let cx = Context::new();
        let a = i32c(&cx, i64::from(i32::MAX));
        let one = i32c(&cx, 1);
        let sum = fold_binary(&cx, Opcode::Add, a, one).unwrap();
        assert_eq!(cx.const_int_value(sum), Some(i64::from(i32::MIN)));
    }

    #[test]
    fn division_edge_cases_do_not_fold() {
        let cx = Context::new();
        let zero = i32c(&cx, 0);
        assert!(fold_binary(&cx, Opcode::Div, zero, zero).is_none());
        assert!(fold_binary(&cx, Opcode::Rem, i32c(&cx, 7), zero).is_none());
        let min = i32c(&cx, i64::from(i32::MIN));
        let neg1 = i32c(&cx, -1);
        assert!(fold_binary(&cx, Opcode::Div, min, neg1).is_none());
        // The unsigned bit pattern of MIN/-1 divides fine.
        let umin = cx.const_uint(cx.u32_ty(), 0x8000_0000).unwrap();
        let uneg1 = cx.const_uint(cx.u32_ty(), 0xffff_ffff).unwrap();
        assert!(fold_binary(&cx, Opcode::Div, umin, uneg1).is_some());
    }

    #[test]
    fn signedness_drives_comparisons() {
        let cx = Context::new();
        let a = cx.const_int(cx.i8_ty(), -1).unwrap();
        let b = cx.const_int(cx.i8_ty(), 1).unwrap();
        let lt = fold_binary(&cx, Opcode::SetLt, a, b).unwrap();
        assert_eq!(lt, cx.const_bool(true));
        // Same bits, unsigned: 0xff > 1.
        let ua = cx.const_uint(cx.u8_ty(), 0xff).unwrap();
        let ub = cx.const_uint(cx.u8_ty(), 1).unwrap();
        let ult = fold_binary(&cx, Opcode::SetLt, ua, ub).unwrap();
        assert_eq!(ult, cx.const_bool(false));
    }

    #[test]
    fn derived_orderings() {
        let cx = Context::new();
        let (a, b) = (i32c(&cx, 3), i32c(&cx, 5));
        assert_eq!(fold_binary(&cx, Opcode::SetLe, a, b), Some(cx.const_bool(true)));
        assert_eq!(fold_binary(&cx, Opcode::SetGt, a, b), Some(cx.const_bool(false)));
        assert_eq!(fold_binary(&cx, Opcode::SetGe, a, a), Some(cx.const_bool(true)));
        assert_eq!(fold_binary(&cx, Opcode::SetNe, a, b), Some(cx.const_bool(true)));
    }

    #[test]
    fn null_pointer_casts_to_zero() {
        let cx = Context::new();
        let p = cx.pointer_to(cx.i8_ty());
        let null = cx.const_null(p).unwrap();
        let z = fold_cast(&cx, null, cx.i64_ty()).unwrap();
        assert_eq!(cx.const_int_value(z), Some(0));
        let b = fold_cast(&cx, null, cx.bool_ty()).unwrap();
        assert_eq!(b, cx.const_bool(false));
    }

    #[test]
    fn cast_to_own_type_is_identity() {
        let cx = Context::new();
        let c = i32c(&cx, 9);
        assert_eq!(fold_cast(&cx, c, cx.i32_ty()), Some(c));
    }

    #[test]
    fn int_casts_honor_signedness() {
        let cx = Context::new();
        let neg = cx.const_int(cx.i8_ty(), -1).unwrap();
        // Sign extension into i32.
        let wide = fold_cast(&cx, neg, cx.i32_ty()).unwrap();
        assert_eq!(cx.const_int_value(wide), Some(-1));
        // Zero extension from u8.
        let uneg = cx.const_uint(cx.u8_ty(), 0xff).unwrap();
        let uwide = fold_cast(&cx, uneg, cx.i32_ty()).unwrap();
        assert_eq!(cx.const_int_value(uwide), Some(255));
    }

    #[test]
    fn nan_never_compares_equal() {
        let cx = Context::new();
        let nan = cx.const_float(cx.f64_ty(), f64::NAN).unwrap();
        let eq = fold_binary(&cx, Opcode::SetEq, nan, nan).unwrap();
        assert_eq!(eq, cx.const_bool(false));
    }

    #[test]
    fn expression_folds_eagerly_or_stays_symbolic() {
        let cx = Context::new();
        let folded = cx.const_binary_expr(Opcode::Add, i32c(&cx, 1), i32c(&cx, 2)).unwrap();
        assert_eq!(cx.const_int_value(folded), Some(3));

        // Pointer arithmetic over a symbolic address stays an expression.
        let p = cx.pointer_to(cx.i32_ty());
        let null = cx.const_null(p).unwrap();
        let sym = cx.const_binary_expr(Opcode::Add, null, null).unwrap();
        assert!(matches!(cx.const_data(sym).kind, ConstantKind::Expr { .. }));
    }
}
