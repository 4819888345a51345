//! Content-uniqued constants.
//!
//! Like types, constants are interned in the [`Context`]: two constants
//! built from the same (type, payload) pair are handle-equal. Constants
//! are immutable and participate in the use/def graph only as operands;
//! they are never replaced or erased, so no use lists are kept for them.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::ir::instruction::Opcode;
use crate::ir::types::{Type, TypeKind, TypeTag};
use crate::ir::GlobalId;

index_vec::define_index_type! {
    /// Handle to an interned constant.
    pub struct Constant = u32;
}

/// Payload of a constant. Part of the interning key, so floats are kept
/// as IEEE bits and integers as raw bits zero-extended to 64.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstantKind {
    Bool(bool),
    /// Integer payload; the type fixes width and signedness.
    Int(u64),
    /// IEEE bits; the type fixes the width.
    Float(u64),
    /// The typed null pointer.
    Null,
    /// Array or struct of constants.
    Aggregate(Box<[Constant]>),
    /// Address of a global value. The module tag keeps addresses from
    /// distinct modules distinct inside one shared `Context`.
    GlobalAddr { module: u32, global: GlobalId },
    /// Symbolic expression over constants that could not be folded.
    Expr { op: Opcode, args: Box<[Constant]> },
}

#[derive(Debug, Clone)]
pub struct ConstantData {
    pub ty: Type,
    pub kind: ConstantKind,
}

/// Smallest and largest value representable in an integer type.
pub(crate) fn int_range(tag: TypeTag) -> Option<(i128, i128)> {
    let bits = tag.int_bits()?;
    Some(if tag.is_signed() {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    } else {
        (0, (1i128 << bits) - 1)
    })
}

/// Truncate raw bits to the width of `tag`.
pub(crate) fn truncate_bits(tag: TypeTag, bits: u64) -> u64 {
    match tag.int_bits() {
        Some(64) | None => bits,
        Some(w) => bits & ((1u64 << w) - 1),
    }
}

/// Sign- or zero-extend the stored bits of an integer to 64 bits wide,
/// honoring the signedness of `tag`.
pub(crate) fn extend_bits(tag: TypeTag, bits: u64) -> i64 {
    match tag.int_bits() {
        Some(64) | None => bits as i64,
        Some(w) => {
            if tag.is_signed() {
                let shift = 64 - w;
                ((bits as i64) << shift) >> shift
            } else {
                bits as i64
            }
        }
    }
}

impl Context {
    /// Intern a boolean constant.
    pub fn const_bool(&self, value: bool) -> Constant {
        self.intern_constant(self.bool_ty(), ConstantKind::Bool(value))
    }

    /// Intern an integer constant from a signed payload, checking range.
    pub fn const_int(&self, ty: Type, value: i64) -> Result<Constant> {
        let tag = self.tag(ty);
        let (lo, hi) = int_range(tag).ok_or_else(|| Error::TypeMismatch {
            context: "integer constant",
            expected: "integer type".into(),
            found: self.type_name(ty),
        })?;
        if i128::from(value) < lo || i128::from(value) > hi {
            return Err(Error::ConstantOutOfRange {
                ty: self.type_name(ty),
                value: value.to_string(),
            });
        }
        Ok(self.intern_constant(ty, ConstantKind::Int(truncate_bits(tag, value as u64))))
    }

    /// Intern an integer constant from an unsigned payload, checking range.
    pub fn const_uint(&self, ty: Type, value: u64) -> Result<Constant> {
        let tag = self.tag(ty);
        let (_, hi) = int_range(tag).ok_or_else(|| Error::TypeMismatch {
            context: "integer constant",
            expected: "integer type".into(),
            found: self.type_name(ty),
        })?;
        if i128::from(value) > hi {
            return Err(Error::ConstantOutOfRange {
                ty: self.type_name(ty),
                value: value.to_string(),
            });
        }
        Ok(self.intern_constant(ty, ConstantKind::Int(truncate_bits(tag, value))))
    }

    /// Intern an integer constant directly from truncated bits. The caller
    /// vouches that `ty` is an integer type; bits beyond its width are
    /// discarded, which is what the wrapping algebra wants.
    pub(crate) fn const_int_bits(&self, ty: Type, bits: u64) -> Constant {
        let tag = self.tag(ty);
        debug_assert!(tag.is_integer());
        self.intern_constant(ty, ConstantKind::Int(truncate_bits(tag, bits)))
    }

    /// Intern a floating constant of type `ty` (f32 payloads are rounded
    /// through `f32` before storing bits, so equal values unify).
    pub fn const_float(&self, ty: Type, value: f64) -> Result<Constant> {
        let bits = match self.tag(ty) {
            TypeTag::F32 => u64::from((value as f32).to_bits()),
            TypeTag::F64 => value.to_bits(),
            _ => {
                return Err(Error::TypeMismatch {
                    context: "floating constant",
                    expected: "f32 or f64".into(),
                    found: self.type_name(ty),
                });
            }
        };
        Ok(self.intern_constant(ty, ConstantKind::Float(bits)))
    }

    /// The null constant of a pointer type.
    pub fn const_null(&self, ptr_ty: Type) -> Result<Constant> {
        if self.tag(ptr_ty) != TypeTag::Pointer {
            return Err(Error::TypeMismatch {
                context: "null constant",
                expected: "pointer type".into(),
                found: self.type_name(ptr_ty),
            });
        }
        Ok(self.intern_constant(ptr_ty, ConstantKind::Null))
    }

    /// An array or struct of constants. Member types must match the
    /// aggregate's shape.
    pub fn const_aggregate(&self, ty: Type, members: &[Constant]) -> Result<Constant> {
        match self.kind(ty) {
            TypeKind::Array(elem, n) => {
                if members.len() as u64 != n {
                    return Err(Error::TypeMismatch {
                        context: "array constant",
                        expected: format!("{n} elements"),
                        found: members.len().to_string(),
                    });
                }
                for &m in members {
                    if self.const_type(m) != elem {
                        return Err(Error::TypeMismatch {
                            context: "array constant element",
                            expected: self.type_name(elem),
                            found: self.type_name(self.const_type(m)),
                        });
                    }
                }
            }
            TypeKind::Struct(fields) => {
                if members.len() != fields.len() {
                    return Err(Error::TypeMismatch {
                        context: "struct constant",
                        expected: format!("{} members", fields.len()),
                        found: members.len().to_string(),
                    });
                }
                for (&m, &f) in members.iter().zip(fields.iter()) {
                    if self.const_type(m) != f {
                        return Err(Error::TypeMismatch {
                            context: "struct constant member",
                            expected: self.type_name(f),
                            found: self.type_name(self.const_type(m)),
                        });
                    }
                }
            }
            _ => {
                return Err(Error::TypeMismatch {
                    context: "aggregate constant",
                    expected: "array or struct type".into(),
                    found: self.type_name(ty),
                });
            }
        }
        Ok(self.intern_constant(ty, ConstantKind::Aggregate(members.into())))
    }

    /// The address of a global, typed pointer-to-its-contents.
    pub fn const_global_addr(&self, module_tag: u32, global: GlobalId, value_ty: Type) -> Constant {
        debug_assert_eq!(self.tag(value_ty), TypeTag::Pointer);
        self.intern_constant(
            value_ty,
            ConstantKind::GlobalAddr {
                module: module_tag,
                global,
            },
        )
    }

    /// The zero value of any sized first-class or aggregate type.
    pub fn const_zero(&self, ty: Type) -> Result<Constant> {
        Ok(match self.kind(ty) {
            TypeKind::Bool => self.const_bool(false),
            k if k.tag().is_integer() => self.const_int_bits(ty, 0),
            TypeKind::F32 | TypeKind::F64 => self.const_float(ty, 0.0)?,
            TypeKind::Pointer(_) => self.const_null(ty)?,
            TypeKind::Array(elem, n) => {
                let zeros = vec![self.const_zero(elem)?; n as usize];
                self.const_aggregate(ty, &zeros)?
            }
            TypeKind::Struct(fields) => {
                let zeros = fields
                    .iter()
                    .map(|&f| self.const_zero(f))
                    .collect::<Result<Vec<_>>>()?;
                self.const_aggregate(ty, &zeros)?
            }
            _ => {
                return Err(Error::TypeMismatch {
                    context: "zero constant",
                    expected: "sized type".into(),
                    found: self.type_name(ty),
                });
            }
        })
    }

    /// The signed value of an integer or boolean constant.
    pub fn const_int_value(&self, c: Constant) -> Option<i64> {
        let data = self.const_data(c);
        match data.kind {
            ConstantKind::Int(bits) => Some(extend_bits(self.tag(data.ty), bits)),
            ConstantKind::Bool(b) => Some(i64::from(b)),
            _ => None,
        }
    }

    /// The raw (zero-extended) bits of an integer constant.
    pub fn const_uint_value(&self, c: Constant) -> Option<u64> {
        match self.const_data(c).kind {
            ConstantKind::Int(bits) => Some(bits),
            ConstantKind::Bool(b) => Some(u64::from(b)),
            _ => None,
        }
    }

    /// The value of a floating constant at full width.
    pub fn const_float_value(&self, c: Constant) -> Option<f64> {
        let data = self.const_data(c);
        match data.kind {
            ConstantKind::Float(bits) => Some(match self.tag(data.ty) {
                TypeTag::F32 => f64::from(f32::from_bits(bits as u32)),
                _ => f64::from_bits(bits),
            }),
            _ => None,
        }
    }

    pub fn const_is_null(&self, c: Constant) -> bool {
        matches!(self.const_data(c).kind, ConstantKind::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn uniquing_is_by_type_and_payload() {
        let cx = Context::new();
        let a = cx.const_int(cx.i32_ty(), 42).unwrap();
        let b = cx.const_int(cx.i32_ty(), 42).unwrap();
        let c = cx.const_int(cx.i64_ty(), 42).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn negative_bits_round_trip() {
        let cx = Context::new();
        let c = cx.const_int(cx.i8_ty(), -1).unwrap();
        assert_eq!(cx.const_int_value(c), Some(-1));
        assert_eq!(cx.const_uint_value(c), Some(0xff));
    }

    #[test]
    fn out_of_range_is_rejected() {
        let cx = Context::new();
        assert!(cx.const_int(cx.i8_ty(), 128).is_err());
        assert!(cx.const_int(cx.u8_ty(), -1).is_err());
        assert!(cx.const_uint(cx.u8_ty(), 256).is_err());
        assert!(cx.const_int(cx.i8_ty(), 127).is_ok());
        assert!(cx.const_uint(cx.u8_ty(), 255).is_ok());
    }
}
