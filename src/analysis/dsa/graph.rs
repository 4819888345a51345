//! Data-structure graphs: nodes, handles, unification, cloning.
//!
//! A node stands for a set of memory objects the analysis cannot tell
//! apart. Handles are (node, byte offset) pairs; the scalar map takes
//! every pointer-typed SSA value to the handle it points at. Merging is
//! unification: nodes forward to their merge target (union-find with an
//! offset delta), and a node whose fields cannot be reconciled collapses
//! to a single byte-0 field.

use std::collections::{BTreeMap, HashMap, HashSet};

use bitflags::bitflags;
use index_vec::IndexVec;

use crate::ir::types::Type;
use crate::ir::{FuncId, GlobalId, ValueRef};

index_vec::define_index_type! {
    /// A node within one [`DSGraph`].
    pub struct NodeId = u32;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u16 {
        /// Backed by at least one stack allocation.
        const ALLOCA     = 1 << 0;
        /// Backed by at least one heap allocation.
        const HEAP       = 1 << 1;
        /// Contains at least one global object.
        const GLOBAL     = 1 << 2;
        /// Merged with something the analysis cannot see (int-to-pointer
        /// casts, unknown external memory).
        const UNKNOWN    = 1 << 3;
        /// Written through.
        const MODIFIED   = 1 << 4;
        /// Read through.
        const READ       = 1 << 5;
        /// Callers/callees may still add edges; the picture is partial.
        const INCOMPLETE = 1 << 6;
        /// Field structure was abandoned; only offset 0 exists.
        const COLLAPSED  = 1 << 7;
    }
}

/// A (node, byte-offset) pair: where a pointer points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    pub node: NodeId,
    pub offset: u64,
}

impl NodeHandle {
    pub fn new(node: NodeId, offset: u64) -> Self {
        Self { node, offset }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DSNode {
    pub flags: NodeFlags,
    /// Best-known type overlay; `None` once collapsed or never typed.
    pub ty: Option<Type>,
    /// Size in bytes of the object this node describes (0 = unknown).
    pub size: u64,
    /// Outgoing pointer fields by byte offset.
    pub edges: BTreeMap<u64, NodeHandle>,
    /// Globals folded into this node.
    pub globals: Vec<GlobalId>,
    /// Union-find forwarding: set once this node merged into another.
    forward: Option<NodeHandle>,
}

/// One call recorded during local construction, resolved by the
/// interprocedural closures.
#[derive(Debug, Clone)]
pub struct CallSite {
    /// Direct target, when the callee operand is a known global.
    pub direct: Option<GlobalId>,
    /// Handle of the callee pointer for indirect calls.
    pub callee: Option<NodeHandle>,
    /// Handle the call's pointer result flows into, if pointer-typed.
    pub ret: Option<NodeHandle>,
    /// Pointer-typed actual arguments, in position order (`None` for
    /// non-pointer positions).
    pub args: Vec<Option<NodeHandle>>,
}

#[derive(Debug, Clone, Default)]
pub struct DSGraph {
    nodes: IndexVec<NodeId, DSNode>,
    /// Pointer-typed SSA value -> points-to handle, per function (graphs
    /// may describe several functions once SCCs merge).
    pub scalars: HashMap<(FuncId, ValueRef), NodeHandle>,
    /// Global -> node containing it.
    pub globals: HashMap<GlobalId, NodeHandle>,
    /// Pointer-typed return value handle per function.
    pub returns: HashMap<FuncId, NodeHandle>,
    /// Unresolved calls made by this graph's functions.
    pub calls: Vec<CallSite>,
}

impl DSGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, flags: NodeFlags, ty: Option<Type>, size: u64) -> NodeId {
        self.nodes.push(DSNode {
            flags,
            ty,
            size,
            ..DSNode::default()
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Resolve forwarding: the representative handle for `h`, with
    /// offsets accumulated along the chain. Collapsed targets absorb
    /// every offset to 0.
    pub fn resolve(&self, mut h: NodeHandle) -> NodeHandle {
        while let Some(fwd) = self.nodes[h.node].forward {
            h = NodeHandle::new(fwd.node, fwd.offset.saturating_add(h.offset));
        }
        if self.nodes[h.node].flags.contains(NodeFlags::COLLAPSED) {
            h.offset = 0;
        }
        h
    }

    pub fn node(&self, id: NodeId) -> &DSNode {
        debug_assert!(self.nodes[id].forward.is_none(), "unresolved node access");
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut DSNode {
        debug_assert!(self.nodes[id].forward.is_none(), "unresolved node access");
        &mut self.nodes[id]
    }

    /// Live (non-forwarded) node ids.
    pub fn live_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter_enumerated()
            .filter(|(_, n)| n.forward.is_none())
            .map(|(id, _)| id)
            .collect()
    }

    /// The outgoing edge at `offset` of the node behind `h`, creating a
    /// fresh empty target if absent.
    pub fn edge_or_new(&mut self, h: NodeHandle, field_offset: u64) -> NodeHandle {
        let h = self.resolve(h);
        let at = if self.nodes[h.node].flags.contains(NodeFlags::COLLAPSED) {
            0
        } else {
            h.offset + field_offset
        };
        if let Some(&existing) = self.nodes[h.node].edges.get(&at) {
            return self.resolve(existing);
        }
        let fresh = self.add_node(NodeFlags::empty(), None, 0);
        let handle = NodeHandle::new(fresh, 0);
        self.nodes[h.node].edges.insert(at, handle);
        handle
    }

    /// Point the field at `offset` of `h` at `target`, unifying with any
    /// existing edge.
    pub fn set_edge(&mut self, h: NodeHandle, field_offset: u64, target: NodeHandle) {
        let h = self.resolve(h);
        let at = if self.nodes[h.node].flags.contains(NodeFlags::COLLAPSED) {
            0
        } else {
            h.offset + field_offset
        };
        match self.nodes[h.node].edges.get(&at).copied() {
            Some(existing) => self.merge(existing, target),
            None => {
                self.nodes[h.node].edges.insert(at, target);
            }
        }
    }

    pub fn add_flags(&mut self, h: NodeHandle, flags: NodeFlags) {
        let h = self.resolve(h);
        self.nodes[h.node].flags |= flags;
    }

    /// Collapse a node: abandon field structure, retarget every edge to
    /// offset 0, unify all outgoing edges into one.
    pub fn collapse(&mut self, id: NodeId) {
        let id = self.resolve(NodeHandle::new(id, 0)).node;
        if self.nodes[id].flags.contains(NodeFlags::COLLAPSED) {
            return;
        }
        self.nodes[id].flags |= NodeFlags::COLLAPSED;
        self.nodes[id].ty = None;
        let edges = std::mem::take(&mut self.nodes[id].edges);
        let mut merged: Option<NodeHandle> = None;
        for (_, target) in edges {
            merged = Some(match merged {
                None => target,
                Some(prev) => {
                    self.merge(prev, target);
                    self.resolve(prev)
                }
            });
        }
        if let Some(target) = merged {
            self.nodes[id].edges.insert(0, target);
        }
    }

    /// Unify the objects behind two handles. Offset disagreement or
    /// irreconcilable types collapse the merged node. Amortized
    /// near-constant per operation via the forwarding chains.
    pub fn merge(&mut self, a: NodeHandle, b: NodeHandle) {
        let mut worklist = vec![(a, b)];
        while let Some((a, b)) = worklist.pop() {
            let a = self.resolve(a);
            let b = self.resolve(b);
            if a.node == b.node {
                if a.offset != b.offset {
                    // Same object reached at two offsets: the field
                    // structure is a lie.
                    self.collapse(a.node);
                }
                continue;
            }

            // Merge the smaller node into the larger.
            let (dst, src) = if self.nodes[a.node].edges.len() >= self.nodes[b.node].edges.len() {
                (a, b)
            } else {
                (b, a)
            };

            // Align: src.offset must land on dst.offset.
            let collapsed = self.nodes[dst.node].flags.contains(NodeFlags::COLLAPSED)
                || self.nodes[src.node].flags.contains(NodeFlags::COLLAPSED);
            let delta = if collapsed {
                0
            } else if dst.offset >= src.offset {
                dst.offset - src.offset
            } else {
                // The source object starts before the destination: keep
                // bytes addressable by collapsing.
                self.collapse(dst.node);
                0
            };

            let src_node = std::mem::take(&mut self.nodes[src.node]);
            let dst_id = self.resolve(NodeHandle::new(dst.node, 0)).node;
            self.nodes[src.node].forward = Some(NodeHandle::new(dst_id, delta));

            // Type overlay: disagreement at differing alignment collapses.
            match (self.nodes[dst_id].ty, src_node.ty) {
                (Some(dt), Some(st)) if dt != st || delta != 0 => {
                    self.collapse(dst_id);
                }
                (None, Some(st)) if delta == 0 => {
                    if !self.nodes[dst_id].flags.contains(NodeFlags::COLLAPSED) {
                        self.nodes[dst_id].ty = Some(st);
                    }
                }
                _ => {}
            }

            self.nodes[dst_id].flags |= src_node.flags & !NodeFlags::COLLAPSED;
            self.nodes[dst_id].size = self.nodes[dst_id].size.max(src_node.size + delta);
            for g in src_node.globals {
                if !self.nodes[dst_id].globals.contains(&g) {
                    self.nodes[dst_id].globals.push(g);
                }
            }

            // Fields of src land at src-offset + delta in dst.
            for (off, target) in src_node.edges {
                let at = if self.nodes[dst_id].flags.contains(NodeFlags::COLLAPSED) {
                    0
                } else {
                    off + delta
                };
                match self.nodes[dst_id].edges.get(&at).copied() {
                    Some(existing) => worklist.push((existing, target)),
                    None => {
                        self.nodes[dst_id].edges.insert(at, target);
                    }
                }
            }
        }
    }

    /// Copy every live node of `src` into `self`, returning the node
    /// map. Scalar/global/return/call metadata is *not* copied; callers
    /// merge what they need through the map.
    pub fn clone_nodes_into(&mut self, src: &DSGraph) -> HashMap<NodeId, NodeId> {
        let mut map: HashMap<NodeId, NodeId> = HashMap::new();
        for id in src.live_nodes() {
            let n = src.node(id);
            let new = self.add_node(n.flags, n.ty, n.size);
            self.nodes[new].globals = n.globals.clone();
            map.insert(id, new);
        }
        for id in src.live_nodes() {
            for (&off, &target) in &src.node(id).edges {
                let t = src.resolve(target);
                let new_target = NodeHandle::new(map[&t.node], t.offset);
                let dst = map[&id];
                match self.nodes[dst].edges.get(&off).copied() {
                    Some(existing) => self.merge(existing, new_target),
                    None => {
                        self.nodes[dst].edges.insert(off, new_target);
                    }
                }
            }
        }
        map
    }

    /// Translate a handle of `src` through a clone map into `self`.
    pub fn translate(&self, src: &DSGraph, map: &HashMap<NodeId, NodeId>, h: NodeHandle) -> NodeHandle {
        let h = src.resolve(h);
        self.resolve(NodeHandle::new(map[&h.node], h.offset))
    }

    /// Nodes reachable from globals, returns, or formal arguments: the
    /// escape set. Everything else is provably local to its function.
    pub fn escaping_nodes(&self) -> HashSet<NodeId> {
        let mut roots: Vec<NodeHandle> = Vec::new();
        roots.extend(self.globals.values().copied());
        roots.extend(self.returns.values().copied());
        for ((_, v), &h) in &self.scalars {
            if matches!(v, ValueRef::Arg(_)) {
                roots.push(h);
            }
        }
        let mut escaped = HashSet::new();
        let mut stack: Vec<NodeId> = roots
            .into_iter()
            .map(|h| self.resolve(h).node)
            .collect();
        while let Some(id) = stack.pop() {
            if !escaped.insert(id) {
                continue;
            }
            for &target in self.node(id).edges.values() {
                stack.push(self.resolve(target).node);
            }
        }
        escaped
    }

    /// Allocation nodes (stack or heap) that provably do not escape.
    pub fn non_escaping_allocations(&self) -> Vec<NodeId> {
        let escaped = self.escaping_nodes();
        self.live_nodes()
            .into_iter()
            .filter(|&id| {
                !escaped.contains(&id)
                    && self
                        .node(id)
                        .flags
                        .intersects(NodeFlags::ALLOCA | NodeFlags::HEAP)
            })
            .collect()
    }

    /// Resolve a scalar handle, if the value is tracked.
    pub fn scalar(&self, func: FuncId, v: ValueRef) -> Option<NodeHandle> {
        self.scalars.get(&(func, v)).map(|&h| self.resolve(h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_aligns_fields() {
        let mut g = DSGraph::new();
        let a = g.add_node(NodeFlags::ALLOCA, None, 16);
        let b = g.add_node(NodeFlags::HEAP, None, 16);
        let ta = g.add_node(NodeFlags::empty(), None, 8);
        let tb = g.add_node(NodeFlags::empty(), None, 8);
        g.set_edge(NodeHandle::new(a, 0), 8, NodeHandle::new(ta, 0));
        g.set_edge(NodeHandle::new(b, 0), 8, NodeHandle::new(tb, 0));
        g.merge(NodeHandle::new(a, 0), NodeHandle::new(b, 0));

        let rep = g.resolve(NodeHandle::new(a, 0));
        assert_eq!(rep, g.resolve(NodeHandle::new(b, 0)));
        let n = g.node(rep.node);
        assert!(n.flags.contains(NodeFlags::ALLOCA | NodeFlags::HEAP));
        // The two field targets were unified as well.
        assert_eq!(
            g.resolve(NodeHandle::new(ta, 0)),
            g.resolve(NodeHandle::new(tb, 0))
        );
    }

    #[test]
    fn offset_disagreement_collapses() {
        let mut g = DSGraph::new();
        let a = g.add_node(NodeFlags::empty(), None, 8);
        g.merge(NodeHandle::new(a, 0), NodeHandle::new(a, 4));
        let rep = g.resolve(NodeHandle::new(a, 0));
        assert!(g.node(rep.node).flags.contains(NodeFlags::COLLAPSED));
    }

    #[test]
    fn collapse_folds_fields_to_zero() {
        let mut g = DSGraph::new();
        let a = g.add_node(NodeFlags::empty(), None, 16);
        let t1 = g.add_node(NodeFlags::ALLOCA, None, 4);
        let t2 = g.add_node(NodeFlags::HEAP, None, 4);
        g.set_edge(NodeHandle::new(a, 0), 0, NodeHandle::new(t1, 0));
        g.set_edge(NodeHandle::new(a, 0), 8, NodeHandle::new(t2, 0));
        g.collapse(a);
        let n = g.node(a);
        assert!(n.flags.contains(NodeFlags::COLLAPSED));
        assert_eq!(n.edges.len(), 1);
        // Both old targets now resolve to the single remaining edge.
        assert_eq!(
            g.resolve(NodeHandle::new(t1, 0)).node,
            g.resolve(NodeHandle::new(t2, 0)).node
        );
    }

    #[test]
    fn cloning_remaps_nodes_and_edges() {
        let mut src = DSGraph::new();
        let a = src.add_node(NodeFlags::HEAP, None, 8);
        let b = src.add_node(NodeFlags::empty(), None, 8);
        src.set_edge(NodeHandle::new(a, 0), 0, NodeHandle::new(b, 0));

        let mut dst = DSGraph::new();
        let existing = dst.add_node(NodeFlags::ALLOCA, None, 8);
        let map = dst.clone_nodes_into(&src);
        assert_eq!(map.len(), 2);
        assert_ne!(map[&a], existing);
        let cloned = dst.translate(&src, &map, NodeHandle::new(a, 0));
        assert!(dst.node(cloned.node).flags.contains(NodeFlags::HEAP));
        assert_eq!(dst.node(cloned.node).edges.len(), 1);
    }
}
