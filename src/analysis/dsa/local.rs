//! Local (intraprocedural) data-structure graph construction.
//!
//! One walk over each function. Allocations make fresh nodes; loads and
//! stores mark Read/Modified and thread the pointed-to handle through
//! one field; `getelementptr` adds constant byte offsets (a variable
//! array index collapses the node); phis and casts unify handles; calls
//! are recorded for the interprocedural closures; formal arguments,
//! returns and globals start out Incomplete.

use std::collections::HashMap;

use log::trace;

use crate::context::Context;
use crate::error::Result;
use crate::ir::function::Function;
use crate::ir::instruction::Opcode;
use crate::ir::module::{Globals, Module};
use crate::ir::types::{TypeKind, TypeTag};
use crate::ir::{FuncId, GlobalId, InstId, ValueRef};
use crate::pass::{
    AnalysisCache, AnalysisId, AnalysisUsage, AnyPass, ModulePass, PassInfo, PassKind,
    PassRegistry, Preserved,
};
use crate::target::TargetData;

use super::{CallSite, DSGraph, NodeFlags, NodeHandle};

pub const LOCAL_GRAPHS: AnalysisId = "dsa-local";

/// Result of the local pass: one graph per defined function plus the
/// globals graph.
#[derive(Debug, Clone, Default)]
pub struct GraphCollection {
    pub graphs: HashMap<FuncId, DSGraph>,
    pub globals_graph: DSGraph,
}

impl GraphCollection {
    pub fn graph(&self, f: FuncId) -> Option<&DSGraph> {
        self.graphs.get(&f)
    }
}

/// Build the local graph of one function.
pub fn build_local_graph(
    f: FuncId,
    func: &Function,
    globals: &Globals,
    td: &TargetData,
    cx: &Context,
) -> DSGraph {
    let mut b = LocalBuilder {
        graph: DSGraph::new(),
        f,
        func,
        globals,
        td,
        cx,
    };
    b.run();
    b.graph
}

struct LocalBuilder<'a> {
    graph: DSGraph,
    f: FuncId,
    func: &'a Function,
    globals: &'a Globals,
    td: &'a TargetData,
    cx: &'a Context,
}

impl LocalBuilder<'_> {
    fn run(&mut self) {
        for (a, data) in self.func.args() {
            if self.is_pointer(data.ty) {
                // Caller-provided memory: incomplete until closed over.
                let h = self.handle_for(ValueRef::Arg(a));
                self.graph.add_flags(h, NodeFlags::INCOMPLETE);
            }
        }
        for i in self.func.inst_ids() {
            self.visit(i);
        }
    }

    /// Record the handle of a pointer-typed result, unifying with any
    /// handle a forward use (a phi, typically) already created for it.
    fn set_result(&mut self, i: InstId, h: NodeHandle) {
        match self.graph.scalar(self.f, ValueRef::Inst(i)) {
            Some(existing) => self.graph.merge(existing, h),
            None => {
                self.graph.scalars.insert((self.f, ValueRef::Inst(i)), h);
            }
        }
    }

    fn is_pointer(&self, ty: crate::ir::Type) -> bool {
        self.cx.tag(ty) == TypeTag::Pointer
    }

    fn value_is_pointer(&self, v: ValueRef) -> bool {
        self.is_pointer(self.func.value_ty(v, self.globals, self.cx))
    }

    /// The points-to handle of a pointer-typed value, created on first
    /// sight.
    fn handle_for(&mut self, v: ValueRef) -> NodeHandle {
        if let Some(h) = self.graph.scalar(self.f, v) {
            return h;
        }
        let h = match v {
            ValueRef::Global(g) => self.global_handle(g),
            ValueRef::Const(c) => {
                let data = self.cx.const_data(c);
                match data.kind {
                    crate::ir::ConstantKind::GlobalAddr { global, .. } => {
                        self.global_handle(global)
                    }
                    // Null and symbolic expressions: unknown memory.
                    _ => {
                        let n = self.graph.add_node(NodeFlags::UNKNOWN, None, 0);
                        NodeHandle::new(n, 0)
                    }
                }
            }
            _ => {
                let n = self.graph.add_node(NodeFlags::empty(), None, 0);
                NodeHandle::new(n, 0)
            }
        };
        self.graph.scalars.insert((self.f, v), h);
        h
    }

    fn global_handle(&mut self, g: GlobalId) -> NodeHandle {
        if let Some(&h) = self.graph.globals.get(&g) {
            return self.graph.resolve(h);
        }
        let ty = self.globals[g].ty;
        let size = self.cx.layout_of(ty, self.td).map(|l| l.size).unwrap_or(0);
        let n = self.graph.add_node(
            NodeFlags::GLOBAL | NodeFlags::INCOMPLETE,
            Some(ty),
            size,
        );
        self.graph.node_mut(n).globals.push(g);
        let h = NodeHandle::new(n, 0);
        self.graph.globals.insert(g, h);
        h
    }

    fn visit(&mut self, i: InstId) {
        let data = self.func.inst(i).clone();
        match data.opcode {
            Opcode::Alloca | Opcode::Malloc => {
                let flag = if data.opcode == Opcode::Alloca {
                    NodeFlags::ALLOCA
                } else {
                    NodeFlags::HEAP
                };
                let pointee = self.cx.pointee(data.ty).expect("allocation is a pointer");
                let size = self
                    .cx
                    .layout_of(pointee, self.td)
                    .map(|l| l.size)
                    .unwrap_or(0);
                let n = self.graph.add_node(flag, Some(pointee), size);
                self.set_result(i, NodeHandle::new(n, 0));
            }
            Opcode::Load => {
                let ptr = self.handle_for(data.operands[0]);
                self.graph.add_flags(ptr, NodeFlags::READ);
                if self.is_pointer(data.ty) {
                    let target = self.graph.edge_or_new(ptr, 0);
                    self.set_result(i, target);
                }
            }
            Opcode::Store => {
                let ptr = self.handle_for(data.operands[1]);
                self.graph.add_flags(ptr, NodeFlags::MODIFIED);
                if self.value_is_pointer(data.operands[0]) {
                    let value = self.handle_for(data.operands[0]);
                    self.graph.set_edge(ptr, 0, value);
                }
            }
            Opcode::Gep => {
                let base = self.handle_for(data.operands[0]);
                match self.gep_offset(&data.operands) {
                    Some(offset) => {
                        self.set_result(i, NodeHandle::new(base.node, base.offset + offset));
                    }
                    None => {
                        // Variable array index: field structure is gone.
                        trace!("dsa: collapsing node for variable-index gep");
                        self.graph.collapse(base.node);
                        let h = self.graph.resolve(base);
                        self.set_result(i, h);
                    }
                }
            }
            Opcode::Cast => {
                if self.is_pointer(data.ty) {
                    let h = if self.value_is_pointer(data.operands[0]) {
                        self.handle_for(data.operands[0])
                    } else {
                        // Integer-to-pointer: memory we know nothing about.
                        let n = self.graph.add_node(NodeFlags::UNKNOWN, None, 0);
                        NodeHandle::new(n, 0)
                    };
                    self.set_result(i, h);
                }
            }
            Opcode::Phi => {
                if self.is_pointer(data.ty) {
                    let merged = self.handle_for(ValueRef::Inst(i));
                    for (value, _) in data.phi_incoming() {
                        let h = self.handle_for(value);
                        self.graph.merge(merged, h);
                    }
                }
            }
            Opcode::Call | Opcode::Invoke => {
                let arg_start = if data.opcode == Opcode::Call { 1 } else { 3 };
                let direct = match data.operands[0] {
                    ValueRef::Global(g) => Some(g),
                    _ => None,
                };
                let callee = if direct.is_none() {
                    Some(self.handle_for(data.operands[0]))
                } else {
                    None
                };
                let ret = self
                    .is_pointer(data.ty)
                    .then(|| self.handle_for(ValueRef::Inst(i)));
                let args = data.operands[arg_start..]
                    .iter()
                    .map(|&a| {
                        self.value_is_pointer(a).then(|| {
                            let h = self.handle_for(a);
                            // The callee may do anything with it.
                            self.graph.add_flags(h, NodeFlags::INCOMPLETE);
                            h
                        })
                    })
                    .collect();
                self.graph.calls.push(CallSite {
                    direct,
                    callee,
                    ret,
                    args,
                });
            }
            Opcode::Ret => {
                if let Some(&v) = data.operands.first() {
                    if self.value_is_pointer(v) {
                        let h = self.handle_for(v);
                        self.graph.add_flags(h, NodeFlags::INCOMPLETE);
                        match self.graph.returns.get(&self.f).copied() {
                            Some(existing) => self.graph.merge(existing, h),
                            None => {
                                self.graph.returns.insert(self.f, h);
                            }
                        }
                    }
                }
            }
            Opcode::Free => {
                let h = self.handle_for(data.operands[0]);
                self.graph.add_flags(h, NodeFlags::MODIFIED);
            }
            _ => {}
        }
    }

    /// Byte offset of a constant-index gep, or `None` when any array
    /// index is non-constant.
    fn gep_offset(&mut self, operands: &[ValueRef]) -> Option<u64> {
        let base_ty = self
            .func
            .value_ty(operands[0], self.globals, self.cx);
        let mut current = self.cx.pointee(base_ty)?;
        let mut offset = 0u64;
        for (n, &idx) in operands[1..].iter().enumerate() {
            let idx_value = idx
                .as_const()
                .and_then(|c| self.cx.const_uint_value(c));
            if n == 0 {
                // Stepping the base pointer by a non-zero (or unknown)
                // amount loses the object identity.
                match idx_value {
                    Some(0) => {}
                    _ => return None,
                }
                continue;
            }
            match self.cx.kind(current) {
                TypeKind::Struct(fields) => {
                    let field = idx_value? as usize;
                    let layout = self.cx.layout_of(current, self.td).ok()?;
                    offset += layout.offsets.get(field).copied()?;
                    current = *fields.get(field)?;
                }
                TypeKind::Array(elem, _) => {
                    let layout = self.cx.layout_of(elem, self.td).ok()?;
                    let stride = crate::ir::types::align_to(layout.size, layout.align);
                    offset += idx_value? * stride;
                    current = elem;
                }
                _ => return None,
            }
        }
        Some(offset)
    }
}

/// The module pass computing local graphs for every defined function.
#[derive(Default)]
pub struct LocalDataStructures;

impl ModulePass for LocalDataStructures {
    fn name(&self) -> &'static str {
        "Local Data Structure Graphs"
    }

    fn usage(&self) -> AnalysisUsage {
        AnalysisUsage::new()
            .provides(LOCAL_GRAPHS)
            .preserves(Preserved::All)
    }

    fn run(&mut self, module: &mut Module, cx: &Context, am: &mut AnalysisCache) -> Result<bool> {
        let mut collection = GraphCollection::default();
        for f in module.defined_functions() {
            let graph = build_local_graph(
                f,
                &module.functions[f],
                &module.globals,
                &module.target,
                cx,
            );
            trace!(
                "dsa-local: @{} has {} nodes, {} calls",
                module.functions[f].name,
                graph.num_nodes(),
                graph.calls.len()
            );
            collection.graphs.insert(f, graph);
        }
        // The globals graph holds one node per global with its
        // initializer edges, shared context for the closures.
        let mut gg = DSGraph::new();
        for (g, data) in module.globals.iter_enumerated() {
            let size = cx.layout_of(data.ty, &module.target).map(|l| l.size).unwrap_or(0);
            let n = gg.add_node(
                NodeFlags::GLOBAL | NodeFlags::INCOMPLETE,
                Some(data.ty),
                size,
            );
            gg.node_mut(n).globals.push(g);
            gg.globals.insert(g, NodeHandle::new(n, 0));
        }
        collection.globals_graph = gg;
        am.put(LOCAL_GRAPHS, collection);
        Ok(false)
    }
}

pub fn register(registry: &mut PassRegistry) {
    registry.register(PassInfo {
        name: "Local Data Structure Graphs",
        argument: LOCAL_GRAPHS,
        kind: PassKind::Analysis,
        cfg_only: false,
        ctor: || AnyPass::Module(Box::new(LocalDataStructures)),
    });
}
