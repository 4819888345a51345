//! The call graph.
//!
//! Direct calls between defined functions become edges; calls through
//! pointers and calls to external declarations are recorded as "calls
//! unknown", which the interprocedural analyses treat as reaching an
//! external node. SCCs come out in leaves-first (reverse topological)
//! order, which is exactly the order the bottom-up closure wants.

use std::collections::{HashMap, HashSet};

use crate::context::Context;
use crate::error::Result;
use crate::ir::instruction::Opcode;
use crate::ir::module::Module;
use crate::ir::{FuncId, ValueRef};
use crate::pass::{
    AnalysisCache, AnalysisId, AnalysisUsage, AnyPass, ModulePass, PassInfo, PassKind,
    PassRegistry, Preserved,
};

pub const CALL_GRAPH: AnalysisId = "callgraph";

#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    /// Direct callees (defined functions only), deduplicated.
    callees: HashMap<FuncId, Vec<FuncId>>,
    /// Functions that call through a pointer or into a declaration.
    calls_unknown: HashSet<FuncId>,
    /// Every defined function, in module order.
    functions: Vec<FuncId>,
}

impl CallGraph {
    pub fn compute(module: &Module) -> Self {
        let mut graph = CallGraph::default();
        for f in module.defined_functions() {
            graph.functions.push(f);
            let func = &module.functions[f];
            let entry = graph.callees.entry(f).or_default();
            for i in func.inst_ids() {
                let data = func.inst(i);
                if !matches!(data.opcode, Opcode::Call | Opcode::Invoke) {
                    continue;
                }
                match data.operands[0] {
                    ValueRef::Global(g) => match module.globals[g]
                        .function_id()
                        .filter(|&callee| !module.functions[callee].is_declaration())
                    {
                        Some(callee) => {
                            if !entry.contains(&callee) {
                                entry.push(callee);
                            }
                        }
                        None => {
                            graph.calls_unknown.insert(f);
                        }
                    },
                    _ => {
                        graph.calls_unknown.insert(f);
                    }
                }
            }
        }
        graph
    }

    /// A graph over explicit edges (used when indirect call targets have
    /// been resolved by an earlier analysis).
    pub fn from_edges(functions: Vec<FuncId>, callees: HashMap<FuncId, Vec<FuncId>>) -> Self {
        Self {
            callees,
            calls_unknown: HashSet::new(),
            functions,
        }
    }

    pub fn callees(&self, f: FuncId) -> &[FuncId] {
        self.callees.get(&f).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn calls_unknown(&self, f: FuncId) -> bool {
        self.calls_unknown.contains(&f)
    }

    pub fn functions(&self) -> &[FuncId] {
        &self.functions
    }

    /// Strongly connected components, leaves first: every callee SCC
    /// appears before any of its callers.
    pub fn sccs_postorder(&self) -> Vec<Vec<FuncId>> {
        // Tarjan with an explicit stack.
        #[derive(Default, Clone, Copy)]
        struct NodeState {
            index: u32,
            lowlink: u32,
            on_stack: bool,
            visited: bool,
        }

        let mut states: HashMap<FuncId, NodeState> = HashMap::new();
        let mut stack: Vec<FuncId> = Vec::new();
        let mut next_index = 0u32;
        let mut sccs: Vec<Vec<FuncId>> = Vec::new();

        enum Frame {
            Enter(FuncId),
            Continue(FuncId, usize),
        }

        for &root in &self.functions {
            if states.get(&root).is_some_and(|s| s.visited) {
                continue;
            }
            let mut work = vec![Frame::Enter(root)];
            while let Some(frame) = work.pop() {
                match frame {
                    Frame::Enter(f) => {
                        let state = states.entry(f).or_default();
                        if state.visited {
                            continue;
                        }
                        state.visited = true;
                        state.index = next_index;
                        state.lowlink = next_index;
                        state.on_stack = true;
                        next_index += 1;
                        stack.push(f);
                        work.push(Frame::Continue(f, 0));
                    }
                    Frame::Continue(f, child) => {
                        let callees = self.callees(f);
                        if let Some(&next) = callees.get(child) {
                            work.push(Frame::Continue(f, child + 1));
                            let next_state = states.entry(next).or_default();
                            if !next_state.visited {
                                work.push(Frame::Enter(next));
                            } else if next_state.on_stack {
                                let low = next_state.index;
                                let state = states.get_mut(&f).expect("visited");
                                state.lowlink = state.lowlink.min(low);
                            }
                        } else {
                            // All children done: fold lowlinks upward and
                            // maybe pop a component.
                            let lowlink = {
                                let mut low = states[&f].lowlink;
                                for &c in callees {
                                    let cs = states[&c];
                                    if cs.on_stack {
                                        low = low.min(cs.lowlink);
                                    }
                                }
                                low
                            };
                            states.get_mut(&f).expect("visited").lowlink = lowlink;
                            if lowlink == states[&f].index {
                                let mut component = Vec::new();
                                while let Some(member) = stack.pop() {
                                    states.get_mut(&member).expect("on stack").on_stack = false;
                                    component.push(member);
                                    if member == f {
                                        break;
                                    }
                                }
                                sccs.push(component);
                            }
                        }
                    }
                }
            }
        }
        sccs
    }
}

/// The analysis pass caching a [`CallGraph`].
#[derive(Default)]
pub struct CallGraphAnalysis;

impl ModulePass for CallGraphAnalysis {
    fn name(&self) -> &'static str {
        "Call Graph Construction"
    }

    fn usage(&self) -> AnalysisUsage {
        AnalysisUsage::new()
            .provides(CALL_GRAPH)
            .preserves(Preserved::All)
    }

    fn run(&mut self, module: &mut Module, _cx: &Context, am: &mut AnalysisCache) -> Result<bool> {
        am.put(CALL_GRAPH, CallGraph::compute(module));
        Ok(false)
    }
}

pub fn register(registry: &mut PassRegistry) {
    registry.register(PassInfo {
        name: "Call Graph Construction",
        argument: CALL_GRAPH,
        kind: PassKind::Analysis,
        cfg_only: false,
        ctor: || AnyPass::Module(Box::new(CallGraphAnalysis)),
    });
}
