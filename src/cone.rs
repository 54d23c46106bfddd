//! Per-fault cone extraction.
//!
//! For a set of fault roots the cone is the transitive fanout (where the
//! faulty and good circuits may differ) plus the transitive fanin of that
//! fanout (everything that constrains it). The workspace is allocated once
//! per engine and cleared by touched-id iteration, so repeated marking is
//! O(cone), not O(netlist).

use crate::graph::{GateGraph, NodeId};

const MARK_NONE: u8 = 0;
const MARK_TFO: u8 = 1;
const MARK_TFI: u8 = 2;

/// The node set of one ATPG problem. Rebuilt per engine call; nothing in it
/// outlives that call.
#[derive(Debug)]
pub struct Cone {
    // TFO nodes in [0..tfo_len), then TFI nodes; both in discovery order.
    nodes: Vec<NodeId>,
    tfo_len: usize,
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
    marks: Vec<u8>,
}

impl Cone {
    /// Allocates a workspace for node ids below `max_id`.
    pub fn new(max_id: usize) -> Cone {
        Cone {
            nodes: Vec::new(),
            tfo_len: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
            marks: vec![MARK_NONE; max_id],
        }
    }

    /// Marks the cone of `roots` under the graph's current activation.
    ///
    /// A node reachable both forward and backward keeps its TFO mark; TFO
    /// wins over TFI.
    pub fn mark(&mut self, graph: &GateGraph, roots: &[NodeId]) {
        self.clear();

        for &root in roots {
            if self.marks[root.idx] == MARK_NONE {
                self.marks[root.idx] = MARK_TFO;
                self.nodes.push(root);
            }
        }

        // Forward sweep over active fanouts.
        let mut rpos = 0;
        while rpos < self.nodes.len() {
            let id = self.nodes[rpos];
            rpos += 1;
            let node = graph.node(id);
            if node.is_input() {
                self.inputs.push(id);
            }
            if node.is_output() {
                self.outputs.push(id);
            }
            for &fo in node.active_fanouts() {
                if self.marks[fo.idx] == MARK_NONE {
                    self.marks[fo.idx] = MARK_TFO;
                    self.nodes.push(fo);
                }
            }
        }
        self.tfo_len = self.nodes.len();

        // Backward sweep: fanins of the entire TFO, then of every newly
        // discovered TFI node.
        let mut bpos = 0;
        while bpos < self.nodes.len() {
            let id = self.nodes[bpos];
            bpos += 1;
            self.push_fanins(graph, id);
        }

        self.outputs
            .sort_by_key(|&po| (graph.po_cone_size(graph.node(po).output_id()), po));
    }

    fn push_fanins(&mut self, graph: &GateGraph, id: NodeId) {
        for &fanin in graph.node(id).fanins() {
            if self.marks[fanin.idx] == MARK_NONE {
                self.marks[fanin.idx] = MARK_TFI;
                self.nodes.push(fanin);
                if graph.node(fanin).is_input() {
                    self.inputs.push(fanin);
                }
            }
        }
    }

    fn clear(&mut self) {
        for &id in &self.nodes {
            self.marks[id.idx] = MARK_NONE;
        }
        self.nodes.clear();
        self.tfo_len = 0;
        self.inputs.clear();
        self.outputs.clear();
    }

    /// All cone nodes: the TFO prefix, then the TFI.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn tfo(&self) -> &[NodeId] {
        &self.nodes[..self.tfo_len]
    }

    pub fn tfi(&self) -> &[NodeId] {
        &self.nodes[self.tfo_len..]
    }

    pub fn tfo_len(&self) -> usize {
        self.tfo_len
    }

    pub fn in_cone(&self, id: NodeId) -> bool {
        self.marks[id.idx] != MARK_NONE
    }

    pub fn in_tfo(&self, id: NodeId) -> bool {
        self.marks[id.idx] == MARK_TFO
    }

    /// Primary inputs feeding the cone.
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Primary outputs the fault may propagate to, narrowest TFI first.
    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NetlistBuilder;

    fn diamond() -> GateGraph {
        // s fans out, paths reconverge at z; extra input c only on one arm.
        let mut b = NetlistBuilder::new();
        b.input("a");
        b.input("b");
        b.input("c");
        b.and("s", &["a", "b"]);
        b.not1("p", "s");
        b.and("q", &["s", "c"]);
        b.or("z", &["p", "q"]);
        b.output("out", "z");
        b.build().unwrap()
    }

    #[test]
    fn test_tfo_and_tfi_disjoint() {
        let g = diamond();
        let mut cone = Cone::new(g.max_node_id());
        let s = g.find("s").unwrap();
        cone.mark(&g, &[s]);

        for &id in cone.tfo() {
            assert!(cone.in_tfo(id));
        }
        for &id in cone.tfi() {
            assert!(!cone.in_tfo(id));
            assert!(cone.in_cone(id));
        }
        // s, p, q, z, out forward; a, b, c backward.
        assert_eq!(cone.tfo_len(), 5);
        assert_eq!(cone.nodes().len(), 8);
        assert_eq!(cone.inputs().len(), 3);
        assert_eq!(cone.outputs(), &[g.find("out").unwrap()]);
    }

    #[test]
    fn test_mark_is_idempotent() {
        let g = diamond();
        let mut cone = Cone::new(g.max_node_id());
        let s = g.find("s").unwrap();
        cone.mark(&g, &[s]);
        let nodes1 = cone.nodes().to_vec();
        let inputs1 = cone.inputs().to_vec();
        let outputs1 = cone.outputs().to_vec();
        let tfo1 = cone.tfo_len();
        cone.mark(&g, &[s]);
        assert_eq!(cone.nodes(), nodes1.as_slice());
        assert_eq!(cone.inputs(), inputs1.as_slice());
        assert_eq!(cone.outputs(), outputs1.as_slice());
        assert_eq!(cone.tfo_len(), tfo1);
    }

    #[test]
    fn test_workspace_reuse_across_roots() {
        let g = diamond();
        let mut cone = Cone::new(g.max_node_id());
        cone.mark(&g, &[g.find("s").unwrap()]);
        cone.mark(&g, &[g.find("c").unwrap()]);
        // c's cone: c, q, z, out forward; s, p, a, b backward.
        assert_eq!(cone.tfo_len(), 4);
        assert!(cone.in_tfo(g.find("c").unwrap()));
        assert!(!cone.in_tfo(g.find("s").unwrap()));
        assert!(cone.in_cone(g.find("a").unwrap()));
    }

    #[test]
    fn test_respects_activation() {
        let mut b = NetlistBuilder::new();
        b.input("a");
        b.and("y", &["a", "a"]);
        b.output("o0", "y");
        b.output("o1", "a");
        let g = {
            let mut g = b.build().unwrap();
            // Restrict to the narrow cone (o1 is just the input).
            g.activate_po(0);
            g
        };
        let mut cone = Cone::new(g.max_node_id());
        cone.mark(&g, &[g.find("a").unwrap()]);
        assert_eq!(cone.outputs(), &[g.find("o1").unwrap()]);
    }
}
