//! The compilation context.
//!
//! A [`Context`] owns everything that outlives any single module: the
//! type and constant interning tables and the annotation side-tables.
//! Drivers create one at startup and thread a shared reference through
//! every constructor; several independent compilations can coexist in one
//! process by giving each its own `Context`. The whole library is
//! single-threaded (see the crate docs), so interior mutability here is
//! plain `RefCell`.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use index_vec::IndexVec;

use crate::error::{Error, Result};
use crate::ir::constant::{Constant, ConstantData, ConstantKind};
use crate::ir::types::{align_to, primitive_layout, Layout, Type, TypeKind, TypeTag};
use crate::target::TargetData;

/// Identifies one kind of annotation. See [`Context::register_annotation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnnotationId(u32);

type AnnotationFactory = Rc<dyn Fn(&Context, u64) -> Rc<dyn Any>>;

#[derive(Default)]
struct TypeTable {
    kinds: IndexVec<Type, TypeKind>,
    interned: HashMap<TypeKind, Type>,
}

#[derive(Default)]
struct ConstTable {
    data: IndexVec<Constant, ConstantData>,
    interned: HashMap<(Type, ConstantKind), Constant>,
}

#[derive(Default)]
struct AnnotationTables {
    factories: Vec<AnnotationFactory>,
    cache: HashMap<(u32, u64), Rc<dyn Any>>,
}

pub struct Context {
    types: RefCell<TypeTable>,
    consts: RefCell<ConstTable>,
    annotations: RefCell<AnnotationTables>,
    /// Layout annotations, one per distinct `TargetData` signature.
    layout_ids: RefCell<HashMap<String, AnnotationId>>,
    /// Annotation caching the per-type constant-folding rule table;
    /// registered on first fold (see `fold`).
    pub(crate) const_rules_id: Cell<Option<AnnotationId>>,
    next_module_tag: Cell<u32>,
    next_opaque: Cell<u32>,
    prim: [Type; 13],
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        let mut table = TypeTable::default();
        let mut intern = |kind: TypeKind| {
            let ty = table.kinds.push(kind.clone());
            table.interned.insert(kind, ty);
            ty
        };
        let prim = [
            intern(TypeKind::Void),
            intern(TypeKind::Bool),
            intern(TypeKind::I8),
            intern(TypeKind::U8),
            intern(TypeKind::I16),
            intern(TypeKind::U16),
            intern(TypeKind::I32),
            intern(TypeKind::U32),
            intern(TypeKind::I64),
            intern(TypeKind::U64),
            intern(TypeKind::F32),
            intern(TypeKind::F64),
            intern(TypeKind::Label),
        ];
        Self {
            types: RefCell::new(table),
            consts: RefCell::new(ConstTable::default()),
            annotations: RefCell::new(AnnotationTables::default()),
            layout_ids: RefCell::new(HashMap::new()),
            const_rules_id: Cell::new(None),
            next_module_tag: Cell::new(0),
            next_opaque: Cell::new(0),
            prim,
        }
    }

    pub(crate) fn fresh_module_tag(&self) -> u32 {
        let tag = self.next_module_tag.get();
        self.next_module_tag.set(tag + 1);
        tag
    }

    // ---- types -----------------------------------------------------------

    pub fn void_ty(&self) -> Type {
        self.prim[0]
    }
    pub fn bool_ty(&self) -> Type {
        self.prim[1]
    }
    pub fn i8_ty(&self) -> Type {
        self.prim[2]
    }
    pub fn u8_ty(&self) -> Type {
        self.prim[3]
    }
    pub fn i16_ty(&self) -> Type {
        self.prim[4]
    }
    pub fn u16_ty(&self) -> Type {
        self.prim[5]
    }
    pub fn i32_ty(&self) -> Type {
        self.prim[6]
    }
    pub fn u32_ty(&self) -> Type {
        self.prim[7]
    }
    pub fn i64_ty(&self) -> Type {
        self.prim[8]
    }
    pub fn u64_ty(&self) -> Type {
        self.prim[9]
    }
    pub fn f32_ty(&self) -> Type {
        self.prim[10]
    }
    pub fn f64_ty(&self) -> Type {
        self.prim[11]
    }
    pub fn label_ty(&self) -> Type {
        self.prim[12]
    }

    pub fn primitive_ty(&self, tag: TypeTag) -> Option<Type> {
        TypeKind::primitive(tag).map(|_| self.prim[tag as usize])
    }

    /// Intern any structural type description. This is the single entry
    /// point all the convenience constructors funnel through; equal
    /// descriptions yield equal handles.
    pub fn intern_type(&self, kind: TypeKind) -> Type {
        let mut table = self.types.borrow_mut();
        if let Some(&ty) = table.interned.get(&kind) {
            return ty;
        }
        let ty = table.kinds.push(kind.clone());
        table.interned.insert(kind, ty);
        ty
    }

    pub fn pointer_to(&self, pointee: Type) -> Type {
        self.intern_type(TypeKind::Pointer(pointee))
    }

    pub fn array_of(&self, element: Type, len: u64) -> Type {
        self.intern_type(TypeKind::Array(element, len))
    }

    pub fn struct_of(&self, fields: &[Type]) -> Type {
        self.intern_type(TypeKind::Struct(fields.into()))
    }

    pub fn function_ty(&self, ret: Type, params: &[Type], vararg: bool) -> Type {
        self.intern_type(TypeKind::Function {
            ret,
            params: params.into(),
            vararg,
        })
    }

    /// A fresh, unique placeholder type, to be completed later with
    /// [`Context::refine_opaque`].
    pub fn opaque_ty(&self) -> Type {
        let token = self.next_opaque.get();
        self.next_opaque.set(token + 1);
        self.intern_type(TypeKind::Opaque(token))
    }

    /// Structural description of `ty` (cloned out of the table).
    pub fn kind(&self, ty: Type) -> TypeKind {
        self.types.borrow().kinds[ty].clone()
    }

    pub fn tag(&self, ty: Type) -> TypeTag {
        self.types.borrow().kinds[ty].tag()
    }

    pub fn pointee(&self, ty: Type) -> Option<Type> {
        match &self.types.borrow().kinds[ty] {
            TypeKind::Pointer(t) => Some(*t),
            _ => None,
        }
    }

    /// Number of interned types. Handles are dense in `0..type_count()`.
    pub fn type_count(&self) -> usize {
        self.types.borrow().kinds.len()
    }

    /// A type is first-class iff a value of it fits in an SSA register.
    pub fn is_first_class(&self, ty: Type) -> bool {
        let tag = self.tag(ty);
        tag == TypeTag::Pointer || (tag.is_primitive() && tag != TypeTag::Void && tag != TypeTag::Label)
    }

    /// A type is sized iff `sizeof` is defined for it.
    pub fn is_sized(&self, ty: Type) -> bool {
        match self.kind(ty) {
            TypeKind::Void | TypeKind::Label | TypeKind::Function { .. } | TypeKind::Opaque(_) => {
                false
            }
            TypeKind::Array(elem, _) => self.is_sized(elem),
            TypeKind::Struct(fields) => fields.iter().all(|&f| self.is_sized(f)),
            _ => true,
        }
    }

    /// Substitute a completed type for an opaque placeholder everywhere.
    ///
    /// Returns the remapping of every interned type that changed. The
    /// completed type must not (transitively) contain the placeholder:
    /// derivations are finite DAGs, and a self-referential refinement
    /// would break that.
    pub fn refine_opaque(&self, placeholder: Type, real: Type) -> Result<HashMap<Type, Type>> {
        debug_assert_eq!(self.tag(placeholder), TypeTag::Opaque);
        if self.type_contains(real, placeholder) {
            return Err(Error::Structural {
                value: self.type_name(placeholder),
                message: "refinement would make the type graph cyclic".into(),
            });
        }
        let mut mapping = HashMap::new();
        mapping.insert(placeholder, real);
        loop {
            let snapshot: Vec<(Type, TypeKind)> = {
                let table = self.types.borrow();
                table
                    .kinds
                    .iter_enumerated()
                    .map(|(t, k)| (t, k.clone()))
                    .collect()
            };
            let mut changed = false;
            for (ty, kind) in snapshot {
                if mapping.contains_key(&ty) {
                    continue;
                }
                if kind.contained().iter().any(|t| mapping.contains_key(t)) {
                    let new_kind = kind.map_contained(|t| mapping.get(&t).copied().unwrap_or(t));
                    let new_ty = self.intern_type(new_kind);
                    mapping.insert(ty, new_ty);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        mapping.remove(&placeholder);
        Ok(mapping)
    }

    fn type_contains(&self, haystack: Type, needle: Type) -> bool {
        if haystack == needle {
            return true;
        }
        self.kind(haystack)
            .contained()
            .iter()
            .any(|&t| self.type_contains(t, needle))
    }

    /// Canonical textual form of a type, as used by the printer.
    pub fn type_name(&self, ty: Type) -> String {
        match self.kind(ty) {
            TypeKind::Void => "void".into(),
            TypeKind::Bool => "bool".into(),
            TypeKind::I8 => "i8".into(),
            TypeKind::U8 => "u8".into(),
            TypeKind::I16 => "i16".into(),
            TypeKind::U16 => "u16".into(),
            TypeKind::I32 => "i32".into(),
            TypeKind::U32 => "u32".into(),
            TypeKind::I64 => "i64".into(),
            TypeKind::U64 => "u64".into(),
            TypeKind::F32 => "f32".into(),
            TypeKind::F64 => "f64".into(),
            TypeKind::Label => "label".into(),
            TypeKind::Pointer(t) => format!("{}*", self.type_name(t)),
            TypeKind::Array(t, n) => format!("[{} x {}]", n, self.type_name(t)),
            TypeKind::Struct(fields) => {
                let inner: Vec<_> = fields.iter().map(|&f| self.type_name(f)).collect();
                format!("{{ {} }}", inner.join(", "))
            }
            TypeKind::Function { ret, params, vararg } => {
                let mut inner: Vec<_> = params.iter().map(|&p| self.type_name(p)).collect();
                if vararg {
                    inner.push("...".into());
                }
                format!("{} ({})", self.type_name(ret), inner.join(", "))
            }
            TypeKind::Opaque(token) => format!("opaque.{token}"),
        }
    }

    // ---- layout ----------------------------------------------------------

    /// Layout of a sized type under `td`. Computed once per (type,
    /// target) pair and cached through the annotation machinery, so the
    /// lazily built table hangs off the context rather than the type.
    pub fn layout_of(&self, ty: Type, td: &TargetData) -> Result<Rc<Layout>> {
        if !self.is_sized(ty) {
            return Err(Error::TypeMismatch {
                context: "layout query",
                expected: "sized type".into(),
                found: self.type_name(ty),
            });
        }
        let id = self.layout_annotation(td);
        let any = self.annotation(id, ty.raw() as u64);
        Ok(any
            .downcast::<Layout>()
            .ok()
            .expect("layout annotation holds a Layout"))
    }

    fn layout_annotation(&self, td: &TargetData) -> AnnotationId {
        let sig = td.signature();
        if let Some(&id) = self.layout_ids.borrow().get(&sig) {
            return id;
        }
        let captured = td.clone();
        let id = self.register_annotation(move |cx, host| {
            Rc::new(cx.compute_layout(Type::from_raw(host as u32), &captured))
        });
        self.layout_ids.borrow_mut().insert(sig, id);
        id
    }

    fn compute_layout(&self, ty: Type, td: &TargetData) -> Layout {
        match self.kind(ty) {
            TypeKind::Array(elem, n) => {
                let el = self
                    .layout_of(elem, td)
                    .expect("array element is sized if the array is");
                let stride = align_to(el.size, el.align);
                Layout {
                    size: stride * n,
                    align: el.align,
                    offsets: Box::new([]),
                }
            }
            TypeKind::Struct(fields) => {
                let mut offset = 0u64;
                let mut align = 1u32;
                let mut offsets = Vec::with_capacity(fields.len());
                for &f in fields.iter() {
                    let fl = self
                        .layout_of(f, td)
                        .expect("struct member is sized if the struct is");
                    offset = align_to(offset, fl.align);
                    offsets.push(offset);
                    offset += fl.size;
                    align = align.max(fl.align);
                }
                Layout {
                    size: align_to(offset, align),
                    align,
                    offsets: offsets.into_boxed_slice(),
                }
            }
            kind => primitive_layout(kind.tag(), td).expect("sized scalar"),
        }
    }

    // ---- constants -------------------------------------------------------

    /// Intern a (type, payload) constant. The typed constructors in
    /// `ir::constant` perform range validation and call down to this.
    pub fn intern_constant(&self, ty: Type, kind: ConstantKind) -> Constant {
        let mut table = self.consts.borrow_mut();
        let key = (ty, kind);
        if let Some(&c) = table.interned.get(&key) {
            return c;
        }
        let (ty, kind) = (key.0, key.1.clone());
        let c = table.data.push(ConstantData { ty, kind });
        table.interned.insert(key, c);
        c
    }

    pub fn const_data(&self, c: Constant) -> ConstantData {
        self.consts.borrow().data[c].clone()
    }

    pub fn const_type(&self, c: Constant) -> Type {
        self.consts.borrow().data[c].ty
    }

    /// Number of interned constants. Handles are dense in `0..const_count()`.
    pub fn const_count(&self) -> usize {
        self.consts.borrow().data.len()
    }

    // ---- annotations -----------------------------------------------------

    /// Register a factory that lazily builds the annotation for a host
    /// handle on first request.
    pub fn register_annotation(
        &self,
        factory: impl Fn(&Context, u64) -> Rc<dyn Any> + 'static,
    ) -> AnnotationId {
        let mut tables = self.annotations.borrow_mut();
        let id = AnnotationId(tables.factories.len() as u32);
        tables.factories.push(Rc::new(factory));
        id
    }

    /// Fetch the annotation `id` for `host`, building it through the
    /// registered factory if absent. The factory runs with the tables
    /// unborrowed, so it may recursively request other annotations.
    pub fn annotation(&self, id: AnnotationId, host: u64) -> Rc<dyn Any> {
        if let Some(hit) = self.find_annotation(id, host) {
            return hit;
        }
        let factory = self.annotations.borrow().factories[id.0 as usize].clone();
        let built = factory(self, host);
        self.annotations
            .borrow_mut()
            .cache
            .insert((id.0, host), built.clone());
        built
    }

    /// Fetch the annotation if it has already been built.
    pub fn find_annotation(&self, id: AnnotationId, host: u64) -> Option<Rc<dyn Any>> {
        self.annotations.borrow().cache.get(&(id.0, host)).cloned()
    }

    /// Drop one cached annotation.
    pub fn clear_annotation(&self, id: AnnotationId, host: u64) {
        self.annotations.borrow_mut().cache.remove(&(id.0, host));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn types_are_uniqued() {
        let cx = Context::new();
        let p1 = cx.pointer_to(cx.i32_ty());
        let p2 = cx.pointer_to(cx.i32_ty());
        assert_eq!(p1, p2);
        let s1 = cx.struct_of(&[cx.i32_ty(), p1]);
        let s2 = cx.struct_of(&[cx.i32_ty(), p2]);
        assert_eq!(s1, s2);
        assert_ne!(s1, cx.struct_of(&[p1, cx.i32_ty()]));
    }

    #[test]
    fn struct_layout_respects_alignment() {
        let cx = Context::new();
        let td = TargetData::default();
        let s = cx.struct_of(&[cx.i8_ty(), cx.i32_ty(), cx.i8_ty()]);
        let layout = cx.layout_of(s, &td).unwrap();
        assert_eq!(&*layout.offsets, &[0, 4, 8]);
        assert_eq!(layout.size, 12);
        assert_eq!(layout.align, 4);
        // Cached: second query returns the same Rc.
        let again = cx.layout_of(s, &td).unwrap();
        assert!(Rc::ptr_eq(&layout, &again));
    }

    #[test]
    fn ilp32_pointer_layout() {
        let cx = Context::new();
        let p = cx.pointer_to(cx.i8_ty());
        assert_eq!(cx.layout_of(p, &TargetData::default()).unwrap().size, 8);
        assert_eq!(cx.layout_of(p, &TargetData::ilp32()).unwrap().size, 4);
    }

    #[test]
    fn opaque_refinement_rewrites_users() {
        let cx = Context::new();
        let o = cx.opaque_ty();
        let po = cx.pointer_to(o);
        let real = cx.struct_of(&[cx.i32_ty(), cx.i32_ty()]);
        let mapping = cx.refine_opaque(o, real).unwrap();
        assert_eq!(mapping.get(&po), Some(&cx.pointer_to(real)));
    }

    #[test]
    fn cyclic_refinement_is_rejected() {
        let cx = Context::new();
        let o = cx.opaque_ty();
        let cyclic = cx.struct_of(&[cx.pointer_to(o)]);
        assert!(cx.refine_opaque(o, cyclic).is_err());
    }

    #[test]
    fn first_class_and_sized() {
        let cx = Context::new();
        assert!(cx.is_first_class(cx.i32_ty()));
        assert!(cx.is_first_class(cx.pointer_to(cx.f64_ty())));
        assert!(!cx.is_first_class(cx.void_ty()));
        assert!(!cx.is_first_class(cx.struct_of(&[cx.i32_ty()])));
        assert!(cx.is_sized(cx.array_of(cx.i16_ty(), 3)));
        assert!(!cx.is_sized(cx.void_ty()));
        assert!(!cx.is_sized(cx.function_ty(cx.void_ty(), &[], false)));
    }
}
