//! Interprocedural closures over the local graphs.
//!
//! * **Bottom-up** (`dsa-bu`): walk call-graph SCCs leaves-first, merge
//!   each SCC's member graphs, then clone every defined direct callee's
//!   graph into the caller, mapping formals and return onto the actuals.
//!   Indirect calls stay unresolved.
//! * **Top-down** (`dsa-td`): the opposite direction; caller context is
//!   cloned into each callee.
//! * **Complete bottom-up** (`dsa-cbu`): bottom-up again, with indirect
//!   call targets resolved from the bottom-up results (functions whose
//!   address reaches the callee node).
//! * **Equivalence-class** (`dsa-eq`): functions callable from a common
//!   indirect site share one merged graph; the complete bottom-up
//!   closure then runs over the merged SCCs.

use std::collections::{HashMap, HashSet};

use log::{debug, trace};

use crate::analysis::callgraph::{CallGraph, CALL_GRAPH};
use crate::context::Context;
use crate::error::Result;
use crate::ir::module::Module;
use crate::ir::{ArgId, FuncId, ValueRef};
use crate::pass::{
    AnalysisCache, AnalysisId, AnalysisUsage, AnyPass, ModulePass, PassInfo, PassKind,
    PassRegistry, Preserved,
};

use super::local::{GraphCollection, LOCAL_GRAPHS};
use super::{CallSite, DSGraph, NodeHandle};

pub const BU_GRAPHS: AnalysisId = "dsa-bu";
pub const TD_GRAPHS: AnalysisId = "dsa-td";
pub const CBU_GRAPHS: AnalysisId = "dsa-cbu";
pub const EQ_GRAPHS: AnalysisId = "dsa-eq";

/// Merge several per-function graphs into one shared graph carrying all
/// their scalar, global, return and call metadata.
fn merge_graphs(members: &[(FuncId, &DSGraph)]) -> DSGraph {
    let mut merged = DSGraph::new();
    for &(f, src) in members {
        let map = merged.clone_nodes_into(src);
        for ((func, v), &h) in &src.scalars {
            debug_assert!(*func == f || members.iter().any(|(m, _)| m == func));
            let new = merged.translate(src, &map, h);
            match merged.scalars.get(&(*func, *v)).copied() {
                Some(existing) => merged.merge(existing, new),
                None => {
                    merged.scalars.insert((*func, *v), new);
                }
            }
        }
        for (&g, &h) in &src.globals {
            let new = merged.translate(src, &map, h);
            match merged.globals.get(&g).copied() {
                Some(existing) => merged.merge(existing, new),
                None => {
                    merged.globals.insert(g, new);
                }
            }
        }
        for (&func, &h) in &src.returns {
            let new = merged.translate(src, &map, h);
            match merged.returns.get(&func).copied() {
                Some(existing) => merged.merge(existing, new),
                None => {
                    merged.returns.insert(func, new);
                }
            }
        }
        for call in &src.calls {
            let translate = |h: NodeHandle| merged.translate(src, &map, h);
            let site = CallSite {
                direct: call.direct,
                callee: call.callee.map(translate),
                ret: call.ret.map(translate),
                args: call.args.iter().map(|a| a.map(translate)).collect(),
            };
            merged.calls.push(site);
        }
    }
    merged
}

/// Clone `callee_graph` into `g` and unify the callee's formals/return
/// with the call site's actuals.
fn inline_callee(g: &mut DSGraph, site: &CallSite, callee: FuncId, callee_graph: &DSGraph) {
    let map = g.clone_nodes_into(callee_graph);
    // Formal arguments onto actuals, by position.
    for (pos, actual) in site.args.iter().enumerate() {
        let Some(actual) = actual else { continue };
        let formal = callee_graph.scalar(callee, ValueRef::Arg(ArgId::from_raw(pos as u32)));
        if let Some(formal) = formal {
            let formal = g.translate(callee_graph, &map, formal);
            g.merge(formal, *actual);
        }
    }
    // Return value.
    if let (Some(site_ret), Some(&callee_ret)) = (site.ret, callee_graph.returns.get(&callee)) {
        let callee_ret = g.translate(callee_graph, &map, callee_ret);
        g.merge(callee_ret, site_ret);
    }
    // Globals unify by identity across graphs.
    for (&global, &h) in &callee_graph.globals {
        let new = g.translate(callee_graph, &map, h);
        match g.globals.get(&global).copied() {
            Some(existing) => g.merge(existing, new),
            None => {
                g.globals.insert(global, new);
            }
        }
    }
}

/// Unify the callee side of a call whose target lives in the *same*
/// graph (recursion within an SCC).
fn resolve_in_place(g: &mut DSGraph, site: &CallSite, callee: FuncId) {
    for (pos, actual) in site.args.iter().enumerate() {
        let Some(actual) = actual else { continue };
        if let Some(formal) = g.scalar(callee, ValueRef::Arg(ArgId::from_raw(pos as u32))) {
            g.merge(formal, *actual);
        }
    }
    if let (Some(site_ret), Some(&callee_ret)) = (site.ret, g.returns.get(&callee)) {
        g.merge(callee_ret, site_ret);
    }
}

/// The shared bottom-up engine, parameterized by the call edges to use.
fn bottom_up(
    module: &Module,
    local: &GraphCollection,
    cg: &CallGraph,
) -> HashMap<FuncId, DSGraph> {
    let mut finished: HashMap<FuncId, DSGraph> = HashMap::new();
    for scc in cg.sccs_postorder() {
        let members: Vec<(FuncId, &DSGraph)> = scc
            .iter()
            .filter_map(|&f| local.graph(f).map(|g| (f, g)))
            .collect();
        if members.is_empty() {
            continue;
        }
        let in_scc: HashSet<FuncId> = scc.iter().copied().collect();
        let mut g = merge_graphs(&members);

        let sites = std::mem::take(&mut g.calls);
        let mut unresolved = Vec::new();
        for site in sites {
            let callee = site.direct.and_then(|global| {
                module.globals[global]
                    .function_id()
                    .filter(|f| !module.functions[*f].is_declaration())
            });
            match callee {
                Some(callee) if in_scc.contains(&callee) => {
                    resolve_in_place(&mut g, &site, callee);
                }
                Some(callee) => match finished.get(&callee) {
                    Some(callee_graph) => inline_callee(&mut g, &site, callee, callee_graph),
                    None => unresolved.push(site),
                },
                None => unresolved.push(site),
            }
        }
        g.calls = unresolved;

        trace!(
            "dsa-bu: scc of {} function(s), {} node(s), {} unresolved call(s)",
            scc.len(),
            g.num_nodes(),
            g.calls.len()
        );
        for &f in &scc {
            finished.insert(f, g.clone());
        }
    }
    finished
}

/// Functions whose address reaches the callee handle of an indirect
/// call site, per the given graphs.
fn indirect_targets(module: &Module, g: &DSGraph, site: &CallSite) -> Vec<FuncId> {
    let Some(callee) = site.callee else {
        return Vec::new();
    };
    let node = g.resolve(callee).node;
    g.node(node)
        .globals
        .iter()
        .filter_map(|&global| {
            module.globals[global]
                .function_id()
                .filter(|f| !module.functions[*f].is_declaration())
        })
        .collect()
}

// ---------------------------------------------------------------------------
// passes
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct BottomUpDataStructures;

impl ModulePass for BottomUpDataStructures {
    fn name(&self) -> &'static str {
        "Bottom-Up Data Structure Graphs"
    }

    fn usage(&self) -> AnalysisUsage {
        AnalysisUsage::new()
            .requires(LOCAL_GRAPHS)
            .requires(CALL_GRAPH)
            .provides(BU_GRAPHS)
            .preserves(Preserved::All)
    }

    fn run(&mut self, module: &mut Module, _cx: &Context, am: &mut AnalysisCache) -> Result<bool> {
        let local = am
            .get::<GraphCollection>(LOCAL_GRAPHS)
            .expect("scheduler provides required analyses");
        let cg = am
            .get::<CallGraph>(CALL_GRAPH)
            .expect("scheduler provides required analyses");
        let graphs = bottom_up(module, &local, &cg);
        debug!("dsa-bu: closed {} function graph(s)", graphs.len());
        am.put(
            BU_GRAPHS,
            GraphCollection {
                graphs,
                globals_graph: local.globals_graph.clone(),
            },
        );
        Ok(false)
    }
}

#[derive(Default)]
pub struct TopDownDataStructures;

impl ModulePass for TopDownDataStructures {
    fn name(&self) -> &'static str {
        "Top-Down Data Structure Graphs"
    }

    fn usage(&self) -> AnalysisUsage {
        AnalysisUsage::new()
            .requires(BU_GRAPHS)
            .requires(CALL_GRAPH)
            .provides(TD_GRAPHS)
            .preserves(Preserved::All)
    }

    fn run(&mut self, module: &mut Module, _cx: &Context, am: &mut AnalysisCache) -> Result<bool> {
        let bu = am
            .get::<GraphCollection>(BU_GRAPHS)
            .expect("scheduler provides required analyses");
        let cg = am
            .get::<CallGraph>(CALL_GRAPH)
            .expect("scheduler provides required analyses");

        let mut td: HashMap<FuncId, DSGraph> = bu.graphs.clone();
        // Callers first: reverse of the leaves-first SCC order.
        let mut order = cg.sccs_postorder();
        order.reverse();
        for scc in order {
            for &caller in &scc {
                let Some(caller_graph) = td.get(&caller).cloned() else {
                    continue;
                };
                for site in caller_graph.calls.iter() {
                    let Some(callee) = site.direct.and_then(|g| {
                        module.globals[g]
                            .function_id()
                            .filter(|f| !module.functions[*f].is_declaration())
                    }) else {
                        continue;
                    };
                    if callee == caller {
                        continue;
                    }
                    let Some(callee_td) = td.get_mut(&callee) else {
                        continue;
                    };
                    // Caller context flows down: clone the caller's view
                    // and pin actuals onto the callee's formals.
                    let map = callee_td.clone_nodes_into(&caller_graph);
                    for (pos, actual) in site.args.iter().enumerate() {
                        let Some(actual) = actual else { continue };
                        let actual = callee_td.translate(&caller_graph, &map, *actual);
                        if let Some(formal) =
                            callee_td.scalar(callee, ValueRef::Arg(ArgId::from_raw(pos as u32)))
                        {
                            callee_td.merge(formal, actual);
                        }
                    }
                    if let Some(site_ret) = site.ret {
                        let site_ret = callee_td.translate(&caller_graph, &map, site_ret);
                        if let Some(&callee_ret) = callee_td.returns.get(&callee) {
                            callee_td.merge(callee_ret, site_ret);
                        }
                    }
                }
            }
        }
        am.put(
            TD_GRAPHS,
            GraphCollection {
                graphs: td,
                globals_graph: bu.globals_graph.clone(),
            },
        );
        Ok(false)
    }
}

#[derive(Default)]
pub struct CompleteBottomUpDataStructures;

impl ModulePass for CompleteBottomUpDataStructures {
    fn name(&self) -> &'static str {
        "Complete Bottom-Up Data Structure Graphs"
    }

    fn usage(&self) -> AnalysisUsage {
        AnalysisUsage::new()
            .requires(LOCAL_GRAPHS)
            .requires(BU_GRAPHS)
            .requires(CALL_GRAPH)
            .provides(CBU_GRAPHS)
            .preserves(Preserved::All)
    }

    fn run(&mut self, module: &mut Module, _cx: &Context, am: &mut AnalysisCache) -> Result<bool> {
        let local = am
            .get::<GraphCollection>(LOCAL_GRAPHS)
            .expect("scheduler provides required analyses");
        let bu = am
            .get::<GraphCollection>(BU_GRAPHS)
            .expect("scheduler provides required analyses");
        let cg = am
            .get::<CallGraph>(CALL_GRAPH)
            .expect("scheduler provides required analyses");

        // Augment the direct edges with targets the bottom-up graphs
        // discovered for indirect sites.
        let mut callees: HashMap<FuncId, Vec<FuncId>> = HashMap::new();
        for &f in cg.functions() {
            let mut edges: Vec<FuncId> = cg.callees(f).to_vec();
            if let Some(g) = bu.graph(f) {
                for site in &g.calls {
                    for target in indirect_targets(module, g, site) {
                        if !edges.contains(&target) {
                            edges.push(target);
                        }
                    }
                }
            }
            callees.insert(f, edges);
        }
        let augmented = CallGraph::from_edges(cg.functions().to_vec(), callees);
        let graphs = bottom_up_with_indirect(module, &local, &augmented, &bu);
        am.put(
            CBU_GRAPHS,
            GraphCollection {
                graphs,
                globals_graph: bu.globals_graph.clone(),
            },
        );
        Ok(false)
    }
}

/// Bottom-up over augmented edges, additionally inlining resolved
/// indirect targets at each site.
fn bottom_up_with_indirect(
    module: &Module,
    local: &GraphCollection,
    cg: &CallGraph,
    bu: &GraphCollection,
) -> HashMap<FuncId, DSGraph> {
    let mut finished: HashMap<FuncId, DSGraph> = HashMap::new();
    for scc in cg.sccs_postorder() {
        let members: Vec<(FuncId, &DSGraph)> = scc
            .iter()
            .filter_map(|&f| local.graph(f).map(|g| (f, g)))
            .collect();
        if members.is_empty() {
            continue;
        }
        let in_scc: HashSet<FuncId> = scc.iter().copied().collect();
        let mut g = merge_graphs(&members);

        let sites = std::mem::take(&mut g.calls);
        let mut unresolved = Vec::new();
        for site in sites {
            let mut targets: Vec<FuncId> = match site.direct.and_then(|global| {
                module.globals[global]
                    .function_id()
                    .filter(|f| !module.functions[*f].is_declaration())
            }) {
                Some(f) => vec![f],
                None => Vec::new(),
            };
            if targets.is_empty() {
                // Resolve through the bottom-up view of this SCC's
                // members.
                for &(f, _) in &members {
                    if let Some(bug) = bu.graph(f) {
                        targets.extend(indirect_targets(module, bug, &site));
                    }
                }
                targets.sort_unstable();
                targets.dedup();
            }
            if targets.is_empty() {
                unresolved.push(site);
                continue;
            }
            for callee in targets {
                if in_scc.contains(&callee) {
                    resolve_in_place(&mut g, &site, callee);
                } else if let Some(callee_graph) = finished.get(&callee) {
                    inline_callee(&mut g, &site, callee, callee_graph);
                } else {
                    unresolved.push(site.clone());
                }
            }
        }
        g.calls = unresolved;
        for &f in &scc {
            finished.insert(f, g.clone());
        }
    }
    finished
}

#[derive(Default)]
pub struct EquivClassDataStructures;

impl ModulePass for EquivClassDataStructures {
    fn name(&self) -> &'static str {
        "Equivalence-Class Data Structure Graphs"
    }

    fn usage(&self) -> AnalysisUsage {
        AnalysisUsage::new()
            .requires(LOCAL_GRAPHS)
            .requires(BU_GRAPHS)
            .requires(CALL_GRAPH)
            .provides(EQ_GRAPHS)
            .preserves(Preserved::All)
    }

    fn run(&mut self, module: &mut Module, _cx: &Context, am: &mut AnalysisCache) -> Result<bool> {
        let local = am
            .get::<GraphCollection>(LOCAL_GRAPHS)
            .expect("scheduler provides required analyses");
        let bu = am
            .get::<GraphCollection>(BU_GRAPHS)
            .expect("scheduler provides required analyses");
        let cg = am
            .get::<CallGraph>(CALL_GRAPH)
            .expect("scheduler provides required analyses");

        // Union functions callable from a common indirect site.
        let mut uf = UnionFind::new();
        for &f in cg.functions() {
            uf.ensure(f);
        }
        for &f in cg.functions() {
            if let Some(g) = bu.graph(f) {
                for site in &g.calls {
                    let targets = indirect_targets(module, g, site);
                    for pair in targets.windows(2) {
                        uf.union(pair[0], pair[1]);
                    }
                }
            }
        }

        // Merge each class's local graphs; every member shares the
        // class graph.
        let mut class_members: HashMap<FuncId, Vec<FuncId>> = HashMap::new();
        for &f in cg.functions() {
            class_members.entry(uf.find(f)).or_default().push(f);
        }
        let mut merged_local = GraphCollection {
            graphs: HashMap::new(),
            globals_graph: bu.globals_graph.clone(),
        };
        for members in class_members.values() {
            let with_graphs: Vec<(FuncId, &DSGraph)> = members
                .iter()
                .filter_map(|&f| local.graph(f).map(|g| (f, g)))
                .collect();
            if with_graphs.is_empty() {
                continue;
            }
            let class_graph = merge_graphs(&with_graphs);
            for &f in members {
                merged_local.graphs.insert(f, class_graph.clone());
            }
        }

        // Complete bottom-up over the merged classes.
        let graphs = bottom_up_with_indirect(module, &merged_local, &cg, &bu);
        am.put(
            EQ_GRAPHS,
            GraphCollection {
                graphs,
                globals_graph: bu.globals_graph.clone(),
            },
        );
        Ok(false)
    }
}

struct UnionFind {
    parent: HashMap<FuncId, FuncId>,
}

impl UnionFind {
    fn new() -> Self {
        Self {
            parent: HashMap::new(),
        }
    }

    fn ensure(&mut self, f: FuncId) {
        self.parent.entry(f).or_insert(f);
    }

    fn find(&mut self, f: FuncId) -> FuncId {
        self.ensure(f);
        let p = self.parent[&f];
        if p == f {
            return f;
        }
        let root = self.find(p);
        self.parent.insert(f, root);
        root
    }

    fn union(&mut self, a: FuncId, b: FuncId) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent.insert(ra, rb);
        }
    }
}

pub fn register(registry: &mut PassRegistry) {
    registry.register(PassInfo {
        name: "Bottom-Up Data Structure Graphs",
        argument: BU_GRAPHS,
        kind: PassKind::Analysis,
        cfg_only: false,
        ctor: || AnyPass::Module(Box::new(BottomUpDataStructures)),
    });
    registry.register(PassInfo {
        name: "Top-Down Data Structure Graphs",
        argument: TD_GRAPHS,
        kind: PassKind::Analysis,
        cfg_only: false,
        ctor: || AnyPass::Module(Box::new(TopDownDataStructures)),
    });
    registry.register(PassInfo {
        name: "Complete Bottom-Up Data Structure Graphs",
        argument: CBU_GRAPHS,
        kind: PassKind::Analysis,
        cfg_only: false,
        ctor: || AnyPass::Module(Box::new(CompleteBottomUpDataStructures)),
    });
    registry.register(PassInfo {
        name: "Equivalence-Class Data Structure Graphs",
        argument: EQ_GRAPHS,
        kind: PassKind::Analysis,
        cfg_only: false,
        ctor: || AnyPass::Module(Box::new(EquivClassDataStructures)),
    });
}
