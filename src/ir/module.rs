//! Modules: the top of the ownership tree.

use std::collections::HashMap;

use index_vec::IndexVec;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::ir::constant::Constant;
use crate::ir::function::Function;
use crate::ir::types::Type;
use crate::ir::{BlockId, FuncId, GlobalId, ValueRef};
use crate::target::TargetData;

/// How a global value is visible to other modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Linkage {
    /// Defined here or elsewhere, visible everywhere.
    #[default]
    External,
    /// Private to this module; renameable at will by a linker.
    Internal,
}

#[derive(Debug, Clone)]
pub enum GlobalKind {
    Variable {
        init: Option<Constant>,
        is_const: bool,
    },
    Function(FuncId),
}

/// A module-level named value: a global variable or a function. Its
/// value type as an operand is pointer-to-`ty`.
#[derive(Debug, Clone)]
pub struct GlobalData {
    pub name: String,
    /// Contents type for variables, signature type for functions.
    pub ty: Type,
    pub linkage: Linkage,
    pub kind: GlobalKind,
}

impl GlobalData {
    pub fn function_id(&self) -> Option<FuncId> {
        match self.kind {
            GlobalKind::Function(f) => Some(f),
            _ => None,
        }
    }

    /// A declaration has no body (functions) or no initializer (variables).
    pub fn is_declaration(&self, functions: &IndexVec<FuncId, Function>) -> bool {
        match self.kind {
            GlobalKind::Function(f) => functions[f].is_declaration(),
            GlobalKind::Variable { ref init, .. } => init.is_none(),
        }
    }
}

pub type Globals = IndexVec<GlobalId, GlobalData>;

#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub target: TargetData,
    /// Libraries this module depends on; a linker resolves leftover
    /// external symbols against them.
    pub deplibs: Vec<String>,
    /// Context-assigned tag distinguishing this module's global-address
    /// constants from other modules'.
    pub(crate) tag: u32,
    pub globals: Globals,
    pub functions: IndexVec<FuncId, Function>,
    symtab: HashMap<(Type, String), GlobalId>,
}

impl Module {
    pub fn new(name: impl Into<String>, cx: &Context) -> Self {
        Self {
            name: name.into(),
            target: TargetData::default(),
            deplibs: Vec::new(),
            tag: cx.fresh_module_tag(),
            globals: IndexVec::new(),
            functions: IndexVec::new(),
            symtab: HashMap::new(),
        }
    }

    /// Add a function with the given signature type. The name is
    /// uniquified on collision within the (type, name) table; the name
    /// actually used is readable off the returned global.
    pub fn add_function(
        &mut self,
        name: &str,
        sig: Type,
        linkage: Linkage,
        cx: &Context,
    ) -> Result<GlobalId> {
        let unique = self.unique_name(sig, name);
        let func = Function::new(unique.clone(), sig, linkage, cx)?;
        let fid = self.functions.push(func);
        let gid = self.globals.push(GlobalData {
            name: unique.clone(),
            ty: sig,
            linkage,
            kind: GlobalKind::Function(fid),
        });
        self.symtab.insert((sig, unique), gid);
        Ok(gid)
    }

    /// Add a global variable of contents type `ty`.
    pub fn add_global(
        &mut self,
        name: &str,
        ty: Type,
        linkage: Linkage,
        init: Option<Constant>,
        is_const: bool,
        cx: &Context,
    ) -> Result<GlobalId> {
        if let Some(init) = init {
            let found = cx.const_type(init);
            if found != ty {
                return Err(Error::TypeMismatch {
                    context: "global initializer",
                    expected: cx.type_name(ty),
                    found: cx.type_name(found),
                });
            }
        }
        let unique = self.unique_name(ty, name);
        let gid = self.globals.push(GlobalData {
            name: unique.clone(),
            ty,
            linkage,
            kind: GlobalKind::Variable { init, is_const },
        });
        self.symtab.insert((ty, unique), gid);
        Ok(gid)
    }

    fn unique_name(&self, ty: Type, base: &str) -> String {
        let mut candidate = base.to_owned();
        let mut counter = 0u32;
        while self.symtab.contains_key(&(ty, candidate.clone())) {
            candidate = format!("{base}.{counter}");
            counter += 1;
        }
        candidate
    }

    /// Look up a global by (contents/signature type, name).
    pub fn lookup_global(&self, ty: Type, name: &str) -> Option<GlobalId> {
        self.symtab.get(&(ty, name.to_owned())).copied()
    }

    /// Look up a global by name alone (first match in id order).
    pub fn lookup_global_named(&self, name: &str) -> Option<GlobalId> {
        self.globals
            .iter_enumerated()
            .find(|(_, g)| g.name == name)
            .map(|(id, _)| id)
    }

    /// Rename a global, relocating its symbol-table entry. Returns the
    /// name actually assigned (uniquified on collision).
    pub fn rename_global(&mut self, g: GlobalId, name: &str) -> String {
        let ty = self.globals[g].ty;
        let old = self.globals[g].name.clone();
        self.symtab.remove(&(ty, old));
        let unique = self.unique_name(ty, name);
        self.symtab.insert((ty, unique.clone()), g);
        self.globals[g].name = unique.clone();
        if let GlobalKind::Function(f) = self.globals[g].kind {
            self.functions[f].name = unique.clone();
        }
        unique
    }

    /// The function body behind a global, if it is a function.
    pub fn function_of(&self, g: GlobalId) -> Option<&Function> {
        self.globals[g].function_id().map(|f| &self.functions[f])
    }

    /// The global entry for a function body.
    pub fn global_of_function(&self, f: FuncId) -> Option<GlobalId> {
        self.globals
            .iter_enumerated()
            .find(|(_, g)| g.function_id() == Some(f))
            .map(|(id, _)| id)
    }

    /// The address-of constant for a global, typed pointer-to-contents.
    pub fn global_addr(&self, g: GlobalId, cx: &Context) -> Constant {
        cx.const_global_addr(self.tag, g, cx.pointer_to(self.globals[g].ty))
    }

    /// Function bodies that are definitions, in id order.
    pub fn defined_functions(&self) -> impl Iterator<Item = FuncId> + '_ {
        self.functions
            .iter_enumerated()
            .filter(|(_, f)| !f.is_declaration())
            .map(|(id, _)| id)
    }
}

/// Deterministic positional numbering of a function's values and blocks,
/// used by the text printer and the bytecode codec.
///
/// Every argument and every non-void instruction gets a value slot, in
/// argument order then layout order; blocks are numbered separately in
/// layout order.
#[derive(Debug, Default)]
pub struct Slots {
    values: HashMap<ValueRef, u32>,
    blocks: HashMap<BlockId, u32>,
    value_count: u32,
}

impl Slots {
    pub fn for_function(func: &Function, cx: &Context) -> Self {
        let mut slots = Slots::default();
        for (a, _) in func.args() {
            slots.assign(ValueRef::Arg(a));
        }
        for &b in func.layout() {
            slots.blocks.insert(b, slots.blocks.len() as u32);
            for &i in &func.block(b).insts {
                if func.inst(i).ty != cx.void_ty() {
                    slots.assign(ValueRef::Inst(i));
                }
            }
        }
        slots
    }

    fn assign(&mut self, v: ValueRef) {
        let n = self.value_count;
        self.values.insert(v, n);
        self.value_count = n + 1;
    }

    pub fn value_slot(&self, v: ValueRef) -> Option<u32> {
        self.values.get(&v).copied()
    }

    pub fn block_slot(&self, b: BlockId) -> Option<u32> {
        self.blocks.get(&b).copied()
    }

    pub fn value_count(&self) -> u32 {
        self.value_count
    }

    /// The value assigned a given slot (linear scan; diagnostics only).
    pub fn value_at(&self, slot: u32) -> Option<ValueRef> {
        self.values
            .iter()
            .find(|&(_, &s)| s == slot)
            .map(|(&v, _)| v)
    }
}
