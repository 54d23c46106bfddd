//! Ternary forward/backward implication.
//!
//! Derives mandatory assignments: node values that hold in every test
//! detecting a given fault. A conflict during propagation proves the fault
//! untestable without touching the SAT solver, which is how the engines use
//! this as a pre-filter. The engine is pure: scratch values live here and
//! are cleared by touched-id iteration, nothing on the graph or in SAT
//! state is modified.

use crate::fault::Fault;
use crate::graph::{GateGraph, GateKind, NodeId, Val3};

#[derive(Debug)]
pub struct ImplyEngine {
    vals: Vec<Val3>,
    touched: Vec<NodeId>,
    tfo_mark: Vec<bool>,
    tfo_touched: Vec<NodeId>,
}

impl ImplyEngine {
    pub fn new(max_id: usize) -> ImplyEngine {
        ImplyEngine {
            vals: vec![Val3::X; max_id],
            touched: Vec::new(),
            tfo_mark: vec![false; max_id],
            tfo_touched: Vec::new(),
        }
    }

    fn set(&mut self, id: NodeId, val: Val3) {
        debug_assert!(!self.vals[id.idx].is_fixed());
        self.vals[id.idx] = val;
        self.touched.push(id);
    }

    fn val(&self, id: NodeId) -> Val3 {
        self.vals[id.idx]
    }

    fn clear(&mut self) {
        for &id in &self.touched {
            self.vals[id.idx] = Val3::X;
        }
        self.touched.clear();
    }

    /// Runs the given assignments to a fixed point. Returns the full set of
    /// implied `(node, value)` pairs sorted by id, or None on conflict.
    pub fn propagate(
        &mut self,
        graph: &GateGraph,
        assigns: &[(NodeId, bool)],
    ) -> Option<Vec<(NodeId, bool)>> {
        self.clear();
        for &(id, val) in assigns {
            if !self.bwd_prop(graph, id, None, Val3::from_bool(val)) {
                self.clear();
                return None;
            }
        }
        let out = self.harvest();
        self.clear();
        Some(out)
    }

    /// Mandatory assignments for detecting `fault`: the activation value at
    /// the fault source, non-controlling values on the other pins of an
    /// input fault, and non-controlling side inputs along the dominator
    /// chain (fault TFO masked out). None means untestable.
    pub fn mandatory_for(
        &mut self,
        graph: &GateGraph,
        fault: &Fault,
    ) -> Option<Vec<(NodeId, bool)>> {
        self.clear();
        let fsrc = fault.source_node(graph);
        let activation = Val3::from_bool(!fault.val());
        if !self.bwd_prop(graph, fsrc, None, activation) {
            self.clear();
            return None;
        }

        if fault.is_input_fault() {
            let node = graph.node(fault.node());
            let nval = node.kind().nval();
            if nval.is_fixed() {
                for (pos, &inode) in node.fanins().iter().enumerate() {
                    if pos == fault.pos() {
                        continue;
                    }
                    if !self.side_input(graph, inode, fault.node(), nval) {
                        self.clear();
                        return None;
                    }
                }
            }
        }

        self.mark_tfo(graph, fault.node());
        let mut dom = graph.node(fault.node()).imm_dom();
        while let Some(d) = dom {
            let dnode = graph.node(d);
            let nval = dnode.kind().nval();
            if nval.is_fixed() {
                for &inode in dnode.fanins() {
                    if self.tfo_mark[inode.idx] {
                        continue;
                    }
                    if !self.side_input(graph, inode, d, nval) {
                        self.clear_tfo();
                        self.clear();
                        return None;
                    }
                }
            }
            dom = dnode.imm_dom();
        }
        self.clear_tfo();

        let out = self.harvest();
        self.clear();
        Some(out)
    }

    fn side_input(&mut self, graph: &GateGraph, id: NodeId, gate: NodeId, nval: Val3) -> bool {
        match self.val(id) {
            Val3::X => self.bwd_prop(graph, id, Some(gate), nval),
            v => v == nval,
        }
    }

    fn harvest(&self) -> Vec<(NodeId, bool)> {
        let mut out: Vec<(NodeId, bool)> = self
            .touched
            .iter()
            .filter_map(|&id| self.vals[id.idx].to_bool().map(|b| (id, b)))
            .collect();
        out.sort();
        out
    }

    fn mark_tfo(&mut self, graph: &GateGraph, root: NodeId) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if self.tfo_mark[id.idx] {
                continue;
            }
            self.tfo_mark[id.idx] = true;
            self.tfo_touched.push(id);
            stack.extend_from_slice(graph.node(id).active_fanouts());
        }
    }

    fn clear_tfo(&mut self) {
        for &id in &self.tfo_touched {
            self.tfo_mark[id.idx] = false;
        }
        self.tfo_touched.clear();
    }

    /// Backward implication into `id` plus forward implication to its other
    /// fanouts.
    fn bwd_prop(&mut self, graph: &GateGraph, id: NodeId, from: Option<NodeId>, val: Val3) -> bool {
        self.bwd_imp(graph, id, val) && self.fanout_prop(graph, id, from, val)
    }

    fn fanout_prop(
        &mut self,
        graph: &GateGraph,
        id: NodeId,
        from: Option<NodeId>,
        val: Val3,
    ) -> bool {
        let fanouts: smallvec::SmallVec<[NodeId; 2]> =
            graph.node(id).active_fanouts().iter().copied().collect();
        for fo in fanouts {
            if Some(fo) == from {
                continue;
            }
            if !self.fwd_imp(graph, fo, val) {
                return false;
            }
        }
        true
    }

    fn bwd_imp(&mut self, graph: &GateGraph, id: NodeId, val: Val3) -> bool {
        use GateKind::*;
        match self.val(id) {
            Val3::X => {}
            v => return v == val,
        }
        self.set(id, val);

        let node = graph.node(id);
        let fanins: smallvec::SmallVec<[NodeId; 2]> = node.fanins().iter().copied().collect();
        match node.kind() {
            PrimaryInput => true,
            PrimaryOutput | Buf => self.bwd_prop(graph, fanins[0], Some(id), val),
            Not => self.bwd_prop(graph, fanins[0], Some(id), !val),
            And | Nand | Or | Nor => {
                // Output at the non-controlled value forces every input
                // non-controlling; the controlled value alone implies
                // nothing about individual inputs.
                let kind = node.kind();
                let forced_out = if kind.is_negated() {
                    !kind.nval()
                } else {
                    kind.nval()
                };
                if val == forced_out {
                    for fanin in fanins {
                        if !self.bwd_prop(graph, fanin, Some(id), kind.nval()) {
                            return false;
                        }
                    }
                }
                true
            }
            Xor | Xnor => true,
        }
    }

    /// Forward implication of a fanout gate after one of its fanins took
    /// `val`.
    fn fwd_imp(&mut self, graph: &GateGraph, id: NodeId, val: Val3) -> bool {
        use GateKind::*;
        let node = graph.node(id);
        let kind = node.kind();
        let fanins: smallvec::SmallVec<[NodeId; 2]> = node.fanins().iter().copied().collect();

        match kind {
            PrimaryInput => unreachable!("inputs have no fanins to imply from"),
            PrimaryOutput => match self.val(id) {
                Val3::X => {
                    self.set(id, val);
                    true
                }
                v => v == val,
            },
            Buf | Not => {
                let out = if kind == Not { !val } else { val };
                match self.val(id) {
                    Val3::X => {
                        self.set(id, out);
                        self.fanout_prop(graph, id, None, out)
                    }
                    v => v == out,
                }
            }
            And | Nand | Or | Nor => {
                let c = kind.cval();
                let controlled = if kind.is_negated() { !c } else { c };
                let uncontrolled = !controlled;
                match self.val(id) {
                    Val3::X => {
                        let mut has_c = false;
                        let mut has_x = false;
                        for &f in &fanins {
                            match self.val(f) {
                                v if v == c => {
                                    has_c = true;
                                    break;
                                }
                                Val3::X => has_x = true,
                                _ => {}
                            }
                        }
                        if has_c {
                            self.set(id, controlled);
                            self.fanout_prop(graph, id, None, controlled)
                        } else if !has_x {
                            self.set(id, uncontrolled);
                            self.fanout_prop(graph, id, None, uncontrolled)
                        } else {
                            true
                        }
                    }
                    v if v == controlled => {
                        // Must be justified by some controlling input; with
                        // a single X candidate left, that input is forced.
                        let mut has_c = false;
                        let mut x_node = None;
                        let mut x_count = 0;
                        for &f in &fanins {
                            match self.val(f) {
                                fv if fv == c => {
                                    has_c = true;
                                    break;
                                }
                                Val3::X => {
                                    x_count += 1;
                                    x_node = Some(f);
                                }
                                _ => {}
                            }
                        }
                        if has_c {
                            true
                        } else if x_count == 1 {
                            self.bwd_prop(graph, x_node.unwrap(), Some(id), c)
                        } else {
                            x_count > 0
                        }
                    }
                    _ => {
                        // Output already at the non-controlled value: a
                        // controlling fanin is a contradiction.
                        val != c
                    }
                }
            }
            Xor | Xnor => {
                let mut acc = Val3::V0;
                let mut x_node = None;
                let mut x_count = 0;
                for &f in &fanins {
                    match self.val(f) {
                        Val3::X => {
                            x_count += 1;
                            x_node = Some(f);
                        }
                        v => acc = acc.xor(v),
                    }
                }
                let invert = kind == Xnor;
                match self.val(id) {
                    Val3::X => {
                        if x_count == 0 {
                            let out = if invert { !acc } else { acc };
                            self.set(id, out);
                            self.fanout_prop(graph, id, None, out)
                        } else {
                            true
                        }
                    }
                    my => {
                        if x_count == 0 {
                            let out = if invert { !acc } else { acc };
                            my == out
                        } else if x_count == 1 {
                            let want = if invert { !my } else { my };
                            let forced = acc.xor(want);
                            self.bwd_prop(graph, x_node.unwrap(), Some(id), forced)
                        } else {
                            true
                        }
                    }
                }
            }
        }
    }
}
