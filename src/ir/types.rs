//! Content-uniqued types.
//!
//! A [`Type`] is an index into the [`Context`](crate::context::Context)
//! interning table; two types are structurally equal iff their handles are
//! equal. Types are immutable once interned. Derivations form finite DAGs;
//! a pointer chain never loops back onto its own container (opaque
//! placeholders exist so such shapes can be built in two phases, see
//! [`Context::refine_opaque`](crate::context::Context::refine_opaque)).

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::target::TargetData;

index_vec::define_index_type! {
    /// Handle to an interned type.
    pub struct Type = u32;
}

/// Tag used for switch dispatch over types. Also the stable wire tag of
/// the type table encoding, so the discriminants must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TypeTag {
    Void = 0,
    Bool = 1,
    I8 = 2,
    U8 = 3,
    I16 = 4,
    U16 = 5,
    I32 = 6,
    U32 = 7,
    I64 = 8,
    U64 = 9,
    F32 = 10,
    F64 = 11,
    Label = 12,
    Pointer = 13,
    Array = 14,
    Struct = 15,
    Function = 16,
    Opaque = 17,
}

impl TypeTag {
    pub fn is_primitive(self) -> bool {
        (self as u8) <= TypeTag::Label as u8
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::I8 | Self::U8 | Self::I16 | Self::U16 | Self::I32 | Self::U32 | Self::I64 | Self::U64
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, Self::U8 | Self::U16 | Self::U32 | Self::U64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// Width in bits of an integer tag.
    pub fn int_bits(self) -> Option<u32> {
        Some(match self {
            Self::I8 | Self::U8 => 8,
            Self::I16 | Self::U16 => 16,
            Self::I32 | Self::U32 => 32,
            Self::I64 | Self::U64 => 64,
            _ => return None,
        })
    }
}

/// Structural description of a type. This is both the interning key and
/// the stored representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void,
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// The type of basic blocks.
    Label,
    Pointer(Type),
    Array(Type, u64),
    Struct(Box<[Type]>),
    Function {
        ret: Type,
        params: Box<[Type]>,
        vararg: bool,
    },
    /// Placeholder for a type not yet completed; carries a uniquing token.
    Opaque(u32),
}

impl TypeKind {
    pub fn tag(&self) -> TypeTag {
        match self {
            Self::Void => TypeTag::Void,
            Self::Bool => TypeTag::Bool,
            Self::I8 => TypeTag::I8,
            Self::U8 => TypeTag::U8,
            Self::I16 => TypeTag::I16,
            Self::U16 => TypeTag::U16,
            Self::I32 => TypeTag::I32,
            Self::U32 => TypeTag::U32,
            Self::I64 => TypeTag::I64,
            Self::U64 => TypeTag::U64,
            Self::F32 => TypeTag::F32,
            Self::F64 => TypeTag::F64,
            Self::Label => TypeTag::Label,
            Self::Pointer(_) => TypeTag::Pointer,
            Self::Array(..) => TypeTag::Array,
            Self::Struct(_) => TypeTag::Struct,
            Self::Function { .. } => TypeTag::Function,
            Self::Opaque(_) => TypeTag::Opaque,
        }
    }

    pub fn primitive(tag: TypeTag) -> Option<TypeKind> {
        Some(match tag {
            TypeTag::Void => Self::Void,
            TypeTag::Bool => Self::Bool,
            TypeTag::I8 => Self::I8,
            TypeTag::U8 => Self::U8,
            TypeTag::I16 => Self::I16,
            TypeTag::U16 => Self::U16,
            TypeTag::I32 => Self::I32,
            TypeTag::U32 => Self::U32,
            TypeTag::I64 => Self::I64,
            TypeTag::U64 => Self::U64,
            TypeTag::F32 => Self::F32,
            TypeTag::F64 => Self::F64,
            TypeTag::Label => Self::Label,
            _ => return None,
        })
    }

    /// Sub-types this kind refers to, in a fixed order.
    pub fn contained(&self) -> Vec<Type> {
        match self {
            Self::Pointer(t) | Self::Array(t, _) => vec![*t],
            Self::Struct(fields) => fields.to_vec(),
            Self::Function { ret, params, .. } => {
                let mut v = vec![*ret];
                v.extend_from_slice(params);
                v
            }
            _ => Vec::new(),
        }
    }

    /// Rebuild this kind with every contained type passed through `map`.
    pub fn map_contained(&self, mut map: impl FnMut(Type) -> Type) -> TypeKind {
        match self {
            Self::Pointer(t) => Self::Pointer(map(*t)),
            Self::Array(t, n) => Self::Array(map(*t), *n),
            Self::Struct(fields) => Self::Struct(fields.iter().map(|&t| map(t)).collect()),
            Self::Function { ret, params, vararg } => Self::Function {
                ret: map(*ret),
                params: params.iter().map(|&t| map(t)).collect(),
                vararg: *vararg,
            },
            other => other.clone(),
        }
    }
}

/// Memory layout of a sized type under one [`TargetData`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub size: u64,
    pub align: u32,
    /// Byte offset of each member; empty unless the type is a struct.
    pub offsets: Box<[u64]>,
}

impl Layout {
    pub(crate) fn scalar(size: u32, align: u32) -> Self {
        Self {
            size: u64::from(size),
            align,
            offsets: Box::new([]),
        }
    }
}

pub(crate) fn primitive_layout(tag: TypeTag, td: &TargetData) -> Option<Layout> {
    let spec = match tag {
        TypeTag::Bool => td.bool_,
        TypeTag::I8 | TypeTag::U8 => td.i8,
        TypeTag::I16 | TypeTag::U16 => td.i16,
        TypeTag::I32 | TypeTag::U32 => td.i32,
        TypeTag::I64 | TypeTag::U64 => td.i64,
        TypeTag::F32 => td.f32,
        TypeTag::F64 => td.f64,
        TypeTag::Pointer => td.pointer,
        _ => return None,
    };
    Some(Layout::scalar(spec.size, spec.align))
}

pub(crate) fn align_to(offset: u64, align: u32) -> u64 {
    let align = u64::from(align.max(1));
    offset.div_ceil(align) * align
}
