use super::types::*;
use super::GateGraph;
use crate::error::BuildError;
use casey::pascal;
use indexmap::IndexMap;
use smallvec::{smallvec, SmallVec};

use GateKind::*;

/// Creates one constructor per variadic gate kind. The constructors take the
/// gate name and the fanin signal names in pin order.
macro_rules! gate_constructors {
    ($name:ident,$($rest:ident),*) => {
        gate_constructors!($name);
        gate_constructors!($($rest),*);
    };
    ($name:ident) => {
        /// Returns the [NodeId] of a new gate of this kind. Fanins are
        /// referenced by signal name and resolved in [NetlistBuilder::build],
        /// so forward references are fine.
        pub fn $name<S: Into<String>>(&mut self, name: S, fanins: &[&str]) -> NodeId {
            self.add_node(pascal!($name), name, fanins)
        }
    };
}

/// A multi-level logic expression over the pins of a complex cell.
///
/// `Input(i)`/`NotInput(i)` reference pin `i`; repeated references are not
/// shared, each one becomes its own fanin edge so that fault sites stay
/// 1-to-1 with the original pins.
#[derive(Debug, Clone)]
pub enum GateExpr {
    Input(usize),
    NotInput(usize),
    Not(Box<GateExpr>),
    And(Vec<GateExpr>),
    Or(Vec<GateExpr>),
    Xor(Vec<GateExpr>),
}

#[derive(Debug, Clone)]
pub(super) struct BuildNode {
    pub kind: GateKind,
    pub name: String,
    pub fanin_names: SmallVec<[String; NODE_TINYVEC_SIZE]>,
}

/// Assembles a flat gate list and turns it into a [GateGraph].
///
/// The builder accepts the netlist in any order; names are resolved and the
/// graph is validated (dangling references, cycles, arities) in
/// [build](NetlistBuilder::build).
///
/// # Examples
/// ```
/// # use patgen::graph::NetlistBuilder;
/// let mut b = NetlistBuilder::new();
/// b.input("in0");
/// b.input("in1");
/// b.and("y", &["in0", "in1"]);
/// b.output("out", "y");
/// let graph = b.build().unwrap();
/// assert_eq!(graph.input_count(), 2);
/// assert_eq!(graph.output_count(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct NetlistBuilder {
    nodes: Vec<BuildNode>,
    names: IndexMap<String, usize>,
    dup: Option<String>,
}

impl NetlistBuilder {
    pub fn new() -> NetlistBuilder {
        Default::default()
    }

    fn add_node<S: Into<String>>(&mut self, kind: GateKind, name: S, fanins: &[&str]) -> NodeId {
        let name = name.into();
        let idx = self.nodes.len();
        if self.names.insert(name.clone(), idx).is_some() && self.dup.is_none() {
            self.dup = Some(name.clone());
        }
        self.nodes.push(BuildNode {
            kind,
            name,
            fanin_names: fanins.iter().map(|s| (*s).to_string()).collect(),
        });
        NodeId::new(idx)
    }

    /// Returns the [NodeId] of a new primary input.
    pub fn input<S: Into<String>>(&mut self, name: S) -> NodeId {
        self.add_node(PrimaryInput, name, &[])
    }

    /// Returns the [NodeId] of a new primary output fed by `driver`.
    pub fn output<S: Into<String>>(&mut self, name: S, driver: &str) -> NodeId {
        self.add_node(PrimaryOutput, name, &[driver])
    }

    /// Returns the [NodeId] of a new buffer.
    pub fn buf1<S: Into<String>>(&mut self, name: S, fanin: &str) -> NodeId {
        self.add_node(Buf, name, &[fanin])
    }

    /// Returns the [NodeId] of a new inverter.
    pub fn not1<S: Into<String>>(&mut self, name: S, fanin: &str) -> NodeId {
        self.add_node(Not, name, &[fanin])
    }

    // Constructors for all gate kinds with variable fanin count.
    gate_constructors!(and, nand, or, nor, xor, xnor);

    /// Lowers a complex cell described by `expr` over the pins in `fanins`
    /// into elementary gates. The root gate carries `name`; internal gates
    /// get derived names. Returns the root's [NodeId].
    ///
    /// Every pin reference in the expression becomes the fanin of exactly
    /// one elementary gate, so input faults of the original cell map
    /// 1-to-1 onto pins of the lowered gates.
    pub fn expr_gate<S: Into<String>>(
        &mut self,
        name: S,
        expr: &GateExpr,
        fanins: &[&str],
    ) -> NodeId {
        let name = name.into();
        let mut counter = 0usize;
        match Self::trivial_expr(expr) {
            // A bare literal still becomes its own gate so the cell keeps a
            // fault site per pin.
            Some((pin, false)) => self.buf1(name, fanins[pin]),
            Some((pin, true)) => self.not1(name, fanins[pin]),
            None => {
                let operands = self.lower_operands(&name, &mut counter, expr, fanins);
                let refs: Vec<&str> = operands.iter().map(|s| s.as_str()).collect();
                match expr {
                    GateExpr::And(_) => self.and(name, &refs),
                    GateExpr::Or(_) => self.or(name, &refs),
                    GateExpr::Xor(_) => self.xor(name, &refs),
                    GateExpr::Not(inner) => {
                        debug_assert_eq!(refs.len(), 1);
                        let _ = inner;
                        self.not1(name, refs[0])
                    }
                    GateExpr::Input(_) | GateExpr::NotInput(_) => unreachable!(),
                }
            }
        }
    }

    fn trivial_expr(expr: &GateExpr) -> Option<(usize, bool)> {
        match expr {
            GateExpr::Input(i) => Some((*i, false)),
            GateExpr::NotInput(i) => Some((*i, true)),
            _ => None,
        }
    }

    /// Lowers the children of an operator expression, returning one operand
    /// signal name per child.
    fn lower_operands(
        &mut self,
        base: &str,
        counter: &mut usize,
        expr: &GateExpr,
        fanins: &[&str],
    ) -> Vec<String> {
        let children: &[GateExpr] = match expr {
            GateExpr::And(c) | GateExpr::Or(c) | GateExpr::Xor(c) => c,
            GateExpr::Not(inner) => std::slice::from_ref(inner),
            GateExpr::Input(_) | GateExpr::NotInput(_) => unreachable!(),
        };
        children
            .iter()
            .map(|child| self.lower_sub(base, counter, child, fanins))
            .collect()
    }

    fn lower_sub(
        &mut self,
        base: &str,
        counter: &mut usize,
        expr: &GateExpr,
        fanins: &[&str],
    ) -> String {
        match expr {
            GateExpr::Input(i) => fanins[*i].to_string(),
            GateExpr::NotInput(i) => {
                let name = self.sub_name(base, counter);
                self.not1(name.clone(), fanins[*i]);
                name
            }
            GateExpr::Not(inner) => {
                let operand = self.lower_sub(base, counter, inner, fanins);
                let name = self.sub_name(base, counter);
                self.not1(name.clone(), &operand);
                name
            }
            GateExpr::And(_) | GateExpr::Or(_) | GateExpr::Xor(_) => {
                let operands = self.lower_operands(base, counter, expr, fanins);
                let refs: Vec<&str> = operands.iter().map(|s| s.as_str()).collect();
                let name = self.sub_name(base, counter);
                match expr {
                    GateExpr::And(_) => self.and(name.clone(), &refs),
                    GateExpr::Or(_) => self.or(name.clone(), &refs),
                    GateExpr::Xor(_) => self.xor(name.clone(), &refs),
                    _ => unreachable!(),
                };
                name
            }
        }
    }

    fn sub_name(&self, base: &str, counter: &mut usize) -> String {
        let name = format!("{}#{}", base, counter);
        *counter += 1;
        name
    }

    /// Number of nodes added so far.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resolves names, validates the netlist and returns the finished
    /// [GateGraph].
    ///
    /// Node ids of the result are assigned in topological order (inputs
    /// first, outputs last); the ids handed out by the constructors are not
    /// preserved.
    pub fn build(self) -> Result<GateGraph, BuildError> {
        if let Some(name) = self.dup {
            return Err(BuildError::DuplicateName(name));
        }

        let n = self.nodes.len();

        // Resolve fanin names and check arities.
        let mut fanins: Vec<SmallVec<[usize; NODE_TINYVEC_SIZE]>> = Vec::with_capacity(n);
        for node in &self.nodes {
            let expected: &'static str = match node.kind {
                PrimaryInput => "0",
                PrimaryOutput | Buf | Not => "1",
                And | Nand | Or | Nor | Xor | Xnor => "2 or more",
            };
            let ok = match node.kind {
                PrimaryInput => node.fanin_names.is_empty(),
                PrimaryOutput | Buf | Not => node.fanin_names.len() == 1,
                _ => node.fanin_names.len() >= 2,
            };
            if !ok {
                return Err(BuildError::BadArity {
                    gate: node.name.clone(),
                    got: node.fanin_names.len(),
                    expected,
                });
            }
            let mut resolved = SmallVec::new();
            for fanin in &node.fanin_names {
                match self.names.get(fanin.as_str()) {
                    Some(&idx) => {
                        if self.nodes[idx].kind == PrimaryOutput {
                            return Err(BuildError::OutputDrives {
                                output: fanin.clone(),
                                gate: node.name.clone(),
                            });
                        }
                        resolved.push(idx)
                    }
                    None => {
                        return Err(BuildError::Dangling {
                            gate: node.name.clone(),
                            fanin: fanin.clone(),
                        })
                    }
                }
            }
            fanins.push(resolved);
        }

        // Longest-path levels via Kahn's algorithm; leftovers are on a cycle.
        let mut indegree: Vec<usize> = fanins.iter().map(|f| f.len()).collect();
        let mut levels = vec![0u32; n];
        let mut queue: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut seen = queue.len();
        let mut qpos = 0;
        let mut fanout_lists: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, f) in fanins.iter().enumerate() {
            for &src in f {
                fanout_lists[src].push(i);
            }
        }
        while qpos < queue.len() {
            let i = queue[qpos];
            qpos += 1;
            for &o in &fanout_lists[i] {
                levels[o] = levels[o].max(levels[i] + 1);
                indegree[o] -= 1;
                if indegree[o] == 0 {
                    queue.push(o);
                    seen += 1;
                }
            }
        }
        if seen < n {
            let culprit = (0..n)
                .find(|&i| indegree[i] > 0)
                .map(|i| self.nodes[i].name.clone())
                .unwrap_or_default();
            return Err(BuildError::Cycle(culprit));
        }

        // Renumber so that id order is topological: inputs in creation
        // order, logic by (level, creation order), outputs last. Engines
        // rely on this for dominator merging and fault ordering.
        let mut order: Vec<usize> = Vec::with_capacity(n);
        order.extend((0..n).filter(|&i| self.nodes[i].kind == PrimaryInput));
        let mut logic: Vec<usize> = (0..n)
            .filter(|&i| !matches!(self.nodes[i].kind, PrimaryInput | PrimaryOutput))
            .collect();
        logic.sort_by_key(|&i| (levels[i], i));
        order.extend(logic);
        order.extend((0..n).filter(|&i| self.nodes[i].kind == PrimaryOutput));

        let mut remap = vec![0usize; n];
        for (new_idx, &old_idx) in order.iter().enumerate() {
            remap[old_idx] = new_idx;
        }

        let mut nodes: Vec<GateNode> = Vec::with_capacity(n);
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for (new_idx, &old_idx) in order.iter().enumerate() {
            let src = &self.nodes[old_idx];
            let id = NodeId::new(new_idx);
            let mut node = GateNode {
                id,
                kind: src.kind,
                name: src.name.clone(),
                fanins: fanins[old_idx].iter().map(|&i| NodeId::new(remap[i])).collect(),
                fanouts: smallvec![],
                act_fanouts: smallvec![],
                level: levels[old_idx],
                active: false,
                imm_dom: None,
                input_id: 0,
                output_id: 0,
            };
            match src.kind {
                PrimaryInput => {
                    node.input_id = inputs.len();
                    inputs.push(id);
                }
                PrimaryOutput => {
                    node.output_id = outputs.len();
                    outputs.push(id);
                }
                _ => {}
            }
            nodes.push(node);
        }
        for i in 0..n {
            let fanin_ids: SmallVec<[NodeId; NODE_TINYVEC_SIZE]> = nodes[i].fanins.clone();
            for src in fanin_ids {
                nodes[src.idx].fanouts.push(NodeId::new(i));
            }
        }

        Ok(GateGraph::finish(nodes, inputs, outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nid;

    #[test]
    fn test_build_simple() {
        let mut b = NetlistBuilder::new();
        b.input("a");
        b.input("b");
        b.and("y", &["a", "b"]);
        b.output("out", "y");
        let g = b.build().unwrap();
        assert_eq!(g.len(), 4);
        // Inputs keep their creation order at the front of the id space.
        assert_eq!(g.find("a"), Some(nid!(0)));
        assert_eq!(g.input_count(), 2);
        assert_eq!(g.output_count(), 1);
        // Topological renumbering: inputs first, output last.
        let y = g.find("y").unwrap();
        let out = g.find("out").unwrap();
        assert!(y.idx > g.find("a").unwrap().idx);
        assert!(out.idx > y.idx);
        assert_eq!(g.node(out).fanins(), &[y]);
    }

    #[test]
    fn test_forward_reference() {
        let mut b = NetlistBuilder::new();
        b.output("out", "y");
        b.and("y", &["a", "b"]);
        b.input("a");
        b.input("b");
        assert!(b.build().is_ok());
    }

    #[test]
    fn test_dangling_fanin() {
        let mut b = NetlistBuilder::new();
        b.input("a");
        b.and("y", &["a", "nope"]);
        b.output("out", "y");
        match b.build() {
            Err(BuildError::Dangling { gate, fanin }) => {
                assert_eq!(gate, "y");
                assert_eq!(fanin, "nope");
            }
            other => panic!("expected dangling error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_cycle() {
        let mut b = NetlistBuilder::new();
        b.input("a");
        b.and("y", &["a", "z"]);
        b.and("z", &["a", "y"]);
        b.output("out", "y");
        assert!(matches!(b.build(), Err(BuildError::Cycle(_))));
    }

    #[test]
    fn test_output_cannot_drive() {
        let mut b = NetlistBuilder::new();
        b.input("a");
        b.output("o1", "a");
        b.not1("n", "o1");
        b.output("o2", "n");
        assert!(matches!(b.build(), Err(BuildError::OutputDrives { .. })));
    }

    #[test]
    fn test_duplicate_name() {
        let mut b = NetlistBuilder::new();
        b.input("a");
        b.input("a");
        assert!(matches!(b.build(), Err(BuildError::DuplicateName(_))));
    }

    #[test]
    fn test_expr_lowering_keeps_pins() {
        // y = AND(a, NOT(b)) as a complex cell.
        let mut b = NetlistBuilder::new();
        b.input("a");
        b.input("b");
        let expr = GateExpr::And(vec![GateExpr::Input(0), GateExpr::NotInput(1)]);
        b.expr_gate("y", &expr, &["a", "b"]);
        b.output("out", "y");
        let g = b.build().unwrap();

        let y = g.find("y").unwrap();
        assert_eq!(g.node(y).kind(), GateKind::And);
        // Pin 0 is the original input a, pin 1 the lowered inverter of b.
        let a = g.find("a").unwrap();
        let fanins = g.node(y).fanins();
        assert_eq!(fanins[0], a);
        assert_eq!(g.node(fanins[1]).kind(), GateKind::Not);
        assert_eq!(g.node(fanins[1]).fanins(), &[g.find("b").unwrap()]);
    }

    #[test]
    fn test_levels() {
        let mut b = NetlistBuilder::new();
        b.input("a");
        b.input("b");
        b.and("y", &["a", "b"]);
        b.not1("z", "y");
        b.output("out", "z");
        let g = b.build().unwrap();
        assert_eq!(g.node(g.find("a").unwrap()).level(), 0);
        assert_eq!(g.node(g.find("y").unwrap()).level(), 1);
        assert_eq!(g.node(g.find("z").unwrap()).level(), 2);
        assert_eq!(g.node(g.find("out").unwrap()).level(), 3);
    }
}
