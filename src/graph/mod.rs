//! Normalized gate-level design representation.
//!
//! A [GateGraph] is an arena of elementary gates in topological id order
//! with fanout lists, longest-path levels, per-output TFI bitmaps and, under
//! the current activation scope, immediate dominators. It is read-mostly
//! after construction; engines restrict it to one output's fanin cone with
//! [GateGraph::activate_po] and share it across workers read-only.

pub mod builder;
pub mod types;

pub use builder::{GateExpr, NetlistBuilder};
pub use types::{GateKind, GateNode, NodeId, Val3};

use crate::testvec::TestVector;
use num_integer::div_ceil;
use rustc_hash::FxHashMap;
use std::io::{self, Write};

#[inline(always)]
fn word_mask_64(index: usize) -> (usize, u64) {
    (index / 64, 1 << (index % 64))
}

/// Bit-packed per-node membership in each primary output's transitive
/// fanin, addressed `[node * stride + word]`.
#[derive(Debug, Clone)]
struct TfiBits {
    words: Vec<u64>,
    stride: usize,
}

impl TfiBits {
    fn new(node_count: usize, output_count: usize) -> TfiBits {
        let stride = div_ceil(output_count, 64).max(1);
        TfiBits {
            words: vec![0; node_count * stride],
            stride,
        }
    }

    fn set(&mut self, node: usize, po: usize) {
        let (word, mask) = word_mask_64(po);
        self.words[node * self.stride + word] |= mask;
    }

    fn get(&self, node: usize, po: usize) -> bool {
        let (word, mask) = word_mask_64(po);
        self.words[node * self.stride + word] & mask != 0
    }
}

/// The finished design. See the [module docs](self) for the big picture.
#[derive(Debug, Clone)]
pub struct GateGraph {
    nodes: Vec<GateNode>,
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
    // Output positions sorted by ascending TFI size, so that
    // output-at-a-time engines attack narrow cones first.
    outputs_by_cone: Vec<usize>,
    po_cone_sizes: Vec<usize>,
    active_order: Vec<NodeId>,
    tfi_bits: TfiBits,
    names: FxHashMap<String, NodeId>,
}

impl GateGraph {
    /// Called by [NetlistBuilder::build] with nodes already in topological
    /// id order. Computes the TFI bitmaps and activates everything.
    pub(super) fn finish(
        nodes: Vec<GateNode>,
        inputs: Vec<NodeId>,
        outputs: Vec<NodeId>,
    ) -> GateGraph {
        let names = nodes
            .iter()
            .map(|n| (n.name.clone(), n.id))
            .collect::<FxHashMap<_, _>>();

        let mut tfi_bits = TfiBits::new(nodes.len(), outputs.len());
        let mut po_cone_sizes = vec![0usize; outputs.len()];
        let mut stack = Vec::new();
        for (k, &po) in outputs.iter().enumerate() {
            stack.push(po);
            let mut count = 0;
            while let Some(id) = stack.pop() {
                if tfi_bits.get(id.idx, k) {
                    continue;
                }
                tfi_bits.set(id.idx, k);
                count += 1;
                stack.extend_from_slice(&nodes[id.idx].fanins);
            }
            po_cone_sizes[k] = count;
        }

        use itertools::Itertools;
        let outputs_by_cone = (0..outputs.len())
            .sorted_by_key(|&k| (po_cone_sizes[k], k))
            .collect();

        let mut graph = GateGraph {
            nodes,
            inputs,
            outputs,
            outputs_by_cone,
            po_cone_sizes,
            active_order: Vec::new(),
            tfi_bits,
            names,
        };
        graph.activate_all();
        graph
    }

    /// Total number of nodes; node ids are dense in `0..len()`.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// An exclusive upper bound on node ids, for sizing id-indexed scratch.
    pub fn max_node_id(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> &GateNode {
        &self.nodes[id.idx]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GateNode> {
        self.nodes.iter()
    }

    /// Looks a node up by its netlist name.
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn input(&self, pos: usize) -> NodeId {
        self.inputs[pos]
    }

    pub fn output(&self, pos: usize) -> NodeId {
        self.outputs[pos]
    }

    /// The `pos`-th output in ascending TFI-cone-size order.
    pub fn output_by_cone(&self, pos: usize) -> NodeId {
        self.outputs[self.outputs_by_cone[pos]]
    }

    /// Number of nodes in the output's transitive fanin.
    pub fn po_cone_size(&self, output_id: usize) -> usize {
        self.po_cone_sizes[output_id]
    }

    /// O(1) per-output TFI membership, valid for any activation scope.
    pub fn in_tfi_of(&self, node: NodeId, output_id: usize) -> bool {
        self.tfi_bits.get(node.idx, output_id)
    }

    /// Active nodes in topological order.
    pub fn active_nodes(&self) -> &[NodeId] {
        &self.active_order
    }

    /// Makes every node reachable backwards from some primary output
    /// active and recomputes active fanouts and immediate dominators.
    pub fn activate_all(&mut self) {
        let all: Vec<NodeId> = self.outputs.clone();
        self.activate_from(&all);
    }

    /// Restricts "active" to the TFI of one output, by position in the
    /// cone-size order (see [GateGraph::output_by_cone]).
    pub fn activate_po(&mut self, pos: usize) {
        let root = self.output_by_cone(pos);
        self.activate_from(&[root]);
    }

    fn activate_from(&mut self, roots: &[NodeId]) {
        let n = self.nodes.len();
        let mut mark = vec![false; n];
        let mut stack: Vec<NodeId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if mark[id.idx] {
                continue;
            }
            mark[id.idx] = true;
            stack.extend_from_slice(&self.nodes[id.idx].fanins);
        }

        self.active_order.clear();
        for i in 0..n {
            let active = mark[i];
            let node = &mut self.nodes[i];
            node.active = active;
            node.imm_dom = None;
            node.act_fanouts.clear();
            if active {
                self.active_order.push(NodeId::new(i));
            }
        }
        for i in 0..n {
            if !mark[i] {
                continue;
            }
            let fanouts = self.nodes[i].fanouts.clone();
            for fo in fanouts {
                if mark[fo.idx] {
                    self.nodes[i].act_fanouts.push(fo);
                }
            }
        }

        // Immediate dominators by a reverse topological sweep: the dominator
        // of a node is the iterated meet over its active fanouts, found by
        // the two-finger walk on already-final dominator pointers.
        let mut dom: Vec<Option<NodeId>> = vec![None; n];
        for &id in self.active_order.iter().rev() {
            let node = &self.nodes[id.idx];
            if node.act_fanouts.is_empty() {
                debug_assert!(node.is_output());
                dom[id.idx] = None;
                continue;
            }
            let mut meet = Some(node.act_fanouts[0]);
            for &fo in &node.act_fanouts[1..] {
                meet = match meet {
                    Some(a) => Self::merge_dom(&dom, a, fo),
                    None => break,
                };
            }
            dom[id.idx] = meet;
        }
        for i in 0..n {
            self.nodes[i].imm_dom = dom[i];
        }
    }

    /// Two-finger meet: ids are topological, so the smaller id climbs its
    /// dominator chain until the fingers match or a chain runs out.
    fn merge_dom(dom: &[Option<NodeId>], mut a: NodeId, mut b: NodeId) -> Option<NodeId> {
        loop {
            if a == b {
                return Some(a);
            }
            if a.idx < b.idx {
                a = dom[a.idx]?;
            } else {
                b = dom[b.idx]?;
            }
        }
    }

    /// Roots of fanout-free regions under the current activation: outputs
    /// and nodes with more than one active fanout.
    pub fn ffr_roots(&self) -> Vec<NodeId> {
        self.active_order
            .iter()
            .copied()
            .filter(|&id| {
                let n = &self.nodes[id.idx];
                n.is_output() || n.act_fanouts.len() > 1
            })
            .collect()
    }

    /// All nodes whose single-fanout chains end in `root`, root included.
    pub fn ffr_nodes(&self, root: NodeId) -> Vec<NodeId> {
        let mut list = Vec::new();
        self.ffr_dfs(root, &mut list);
        list
    }

    fn ffr_dfs(&self, id: NodeId, list: &mut Vec<NodeId>) {
        for &fanin in self.nodes[id.idx].fanins() {
            let fnode = &self.nodes[fanin.idx];
            if fnode.active && fnode.act_fanouts.len() == 1 {
                self.ffr_dfs(fanin, list);
            }
        }
        list.push(id);
    }

    /// Roots of maximal fanout-free cones: active nodes with no immediate
    /// dominator (outputs and reconvergence points whose paths diverge to
    /// different outputs).
    pub fn mffc_roots(&self) -> Vec<NodeId> {
        self.active_order
            .iter()
            .copied()
            .filter(|&id| self.nodes[id.idx].imm_dom.is_none())
            .collect()
    }

    /// All nodes of the maximal fanout-free cone rooted at `root`.
    pub fn mffc_nodes(&self, root: NodeId) -> Vec<NodeId> {
        let mut mark = vec![false; self.nodes.len()];
        let mut list = Vec::new();
        mark[root.idx] = true;
        self.mffc_dfs(root, &mut mark, &mut list);
        list
    }

    fn mffc_dfs(&self, id: NodeId, mark: &mut [bool], list: &mut Vec<NodeId>) {
        for &fanin in self.nodes[id.idx].fanins() {
            let fnode = &self.nodes[fanin.idx];
            if !mark[fanin.idx] && fnode.active && fnode.imm_dom.is_some() {
                mark[fanin.idx] = true;
                self.mffc_dfs(fanin, mark, list);
            }
        }
        list.push(id);
    }

    /// Ternary evaluation of the whole design under `tv`, optionally with a
    /// stuck pin: `(node, None, v)` forces the node's output, `(node,
    /// Some(pin), v)` forces one fanin pin. Returns one value per primary
    /// output in declaration order.
    pub fn eval(
        &self,
        tv: &TestVector,
        stuck: Option<(NodeId, Option<usize>, bool)>,
    ) -> Vec<Val3> {
        let mut vals = vec![Val3::X; self.nodes.len()];
        let mut ins: Vec<Val3> = Vec::new();
        for node in &self.nodes {
            let mut v = if node.is_input() {
                tv.val(node.input_id)
            } else {
                ins.clear();
                for (pin, &fanin) in node.fanins.iter().enumerate() {
                    let mut iv = vals[fanin.idx];
                    if let Some((snode, Some(spin), sval)) = stuck {
                        if snode == node.id && spin == pin {
                            iv = Val3::from_bool(sval);
                        }
                    }
                    ins.push(iv);
                }
                node.kind.eval(&ins)
            };
            if let Some((snode, None, sval)) = stuck {
                if snode == node.id {
                    v = Val3::from_bool(sval);
                }
            }
            vals[node.id.idx] = v;
        }
        self.outputs.iter().map(|&po| vals[po.idx]).collect()
    }

    /// Good-circuit evaluation.
    pub fn eval_good(&self, tv: &TestVector) -> Vec<Val3> {
        self.eval(tv, None)
    }

    /// Faulty-circuit evaluation with one stuck site forced, see
    /// [GateGraph::eval] for the site encoding.
    pub fn eval_faulty(&self, tv: &TestVector, stuck: (NodeId, Option<usize>, bool)) -> Vec<Val3> {
        self.eval(tv, Some(stuck))
    }

    /// Dumps the graph in [dot](https://en.wikipedia.org/wiki/DOT_(graph_description_language))
    /// format for visualization.
    pub fn dump_dot<W: Write>(&self, w: &mut W) -> io::Result<()> {
        use petgraph::dot::{Config, Dot};
        let mut graph = petgraph::Graph::<String, ()>::new();
        let mut index = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            index.push(graph.add_node(format!("{}:{}", node.kind, node.name)));
        }
        for node in &self.nodes {
            graph.extend_with_edges(
                node.fanins
                    .iter()
                    .map(|fanin| (index[fanin.idx], index[node.id.idx])),
            );
        }
        write!(w, "{:?}", Dot::with_config(&graph, &[Config::EdgeNoLabel]))
    }
}
