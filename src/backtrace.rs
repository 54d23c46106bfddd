//! Projection of a satisfying assignment onto a primary-input test vector.
//!
//! The solver model fixes every cone variable; a backtracer keeps only the
//! input values actually needed to reproduce fault activation and one
//! observed discrepancy, leaving the rest X. More X bits mean a fault
//! simulator can squeeze extra detections out of the same vector.

use crate::cnf::ModelVals;
use crate::cone::Cone;
use crate::fault::Fault;
use crate::graph::{GateGraph, GateKind, NodeId};
use crate::testvec::TestVector;
use strum_macros::{Display, EnumString};

/// Turns a model into a test vector. Implementations are stateful scratch
/// holders and are reused across faults within a run.
pub trait BackTracer {
    fn backtrace(
        &mut self,
        graph: &GateGraph,
        fault: &Fault,
        cone: &Cone,
        vals: &ModelVals,
    ) -> TestVector;
}

/// Selector tag for [make_backtracer].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum BackTracerKind {
    Simple,
    Just1,
    Just2,
}

/// String-tag factory; `max_id` sizes the justification scratch.
pub fn make_backtracer(kind: BackTracerKind, max_id: usize) -> Box<dyn BackTracer> {
    match kind {
        BackTracerKind::Simple => Box::new(BtSimple),
        BackTracerKind::Just1 => Box::new(BtJust1::new(max_id)),
        BackTracerKind::Just2 => Box::new(BtJust2::new(max_id)),
    }
}

/// Copies the model's good value at every cone input. No X maximization
/// beyond inputs outside the cone.
pub struct BtSimple;

impl BackTracer for BtSimple {
    fn backtrace(
        &mut self,
        graph: &GateGraph,
        _fault: &Fault,
        cone: &Cone,
        vals: &ModelVals,
    ) -> TestVector {
        let mut tv = TestVector::new(graph.input_count());
        for &pi in cone.inputs() {
            if let Some(v) = vals.gval(pi) {
                tv.set(graph.node(pi).input_id(), v);
            }
        }
        tv
    }
}

fn gv(vals: &ModelVals, id: NodeId) -> bool {
    vals.gval(id).unwrap_or(false)
}

fn fv(vals: &ModelVals, id: NodeId) -> bool {
    vals.fval(id).unwrap_or(false)
}

/// Greedy single-pass justification: walk back from the fault site and one
/// observed output, keeping a whole fanin set only where the gate is
/// sensitized or at its non-controlled value, and a single controlling
/// fanin otherwise.
pub struct BtJust1 {
    mark: Vec<bool>,
    touched: Vec<NodeId>,
}

impl BtJust1 {
    pub fn new(max_id: usize) -> BtJust1 {
        BtJust1 {
            mark: vec![false; max_id],
            touched: Vec::new(),
        }
    }

    /// `counts` biases controlling-fanin choices toward nodes other walks
    /// already needed; None means plain greedy.
    fn justify(
        &mut self,
        graph: &GateGraph,
        vals: &ModelVals,
        tv: &mut TestVector,
        id: NodeId,
        counts: Option<&[u64]>,
    ) {
        use GateKind::*;
        if self.mark[id.idx] {
            return;
        }
        self.mark[id.idx] = true;
        self.touched.push(id);

        let node = graph.node(id);
        if node.is_input() {
            if let Some(v) = vals.gval(id) {
                tv.set(node.input_id(), v);
            }
            return;
        }

        let sensitized = gv(vals, id) != fv(vals, id);
        match node.kind() {
            PrimaryInput => unreachable!(),
            PrimaryOutput | Buf | Not => {
                let fanin = node.fanins()[0];
                self.justify(graph, vals, tv, fanin, counts);
            }
            Xor | Xnor => self.justify_all(graph, vals, tv, id, counts),
            And | Nand | Or | Nor => {
                let c = node.kind().cval().to_bool().unwrap();
                let controlled_out = c ^ node.kind().is_negated();
                if sensitized || gv(vals, id) != controlled_out {
                    // On the sensitized path, or at the non-controlled
                    // value: every fanin matters.
                    self.justify_all(graph, vals, tv, id, counts);
                } else {
                    self.justify_controlling(graph, vals, tv, id, c, counts);
                }
            }
        }
    }

    fn justify_all(
        &mut self,
        graph: &GateGraph,
        vals: &ModelVals,
        tv: &mut TestVector,
        id: NodeId,
        counts: Option<&[u64]>,
    ) {
        let fanins: smallvec::SmallVec<[NodeId; 4]> =
            graph.node(id).fanins().iter().copied().collect();
        for fanin in fanins {
            self.justify(graph, vals, tv, fanin, counts);
        }
    }

    /// Picks fanins that hold the controlling value in both circuit copies
    /// (falling back to one per copy when no fanin controls both), ranked
    /// by reference count, then proximity to an output, then id.
    fn justify_controlling(
        &mut self,
        graph: &GateGraph,
        vals: &ModelVals,
        tv: &mut TestVector,
        id: NodeId,
        c: bool,
        counts: Option<&[u64]>,
    ) {
        let score = |f: NodeId| counts.map(|cnt| cnt[f.idx]).unwrap_or(0);
        let fanins: smallvec::SmallVec<[NodeId; 4]> =
            graph.node(id).fanins().iter().copied().collect();
        let best_both = fanins
            .iter()
            .copied()
            .filter(|&f| gv(vals, f) == c && fv(vals, f) == c)
            .max_by_key(|&f| (score(f), graph.node(f).level(), f));
        if let Some(f) = best_both {
            self.justify(graph, vals, tv, f, counts);
            return;
        }
        // No single fanin controls both copies: justify one per copy.
        if let Some(f) = fanins.iter().copied().find(|&f| gv(vals, f) == c) {
            self.justify(graph, vals, tv, f, counts);
        }
        if let Some(f) = fanins.iter().copied().find(|&f| fv(vals, f) == c) {
            self.justify(graph, vals, tv, f, counts);
        }
    }

    fn clear(&mut self) {
        for &id in &self.touched {
            self.mark[id.idx] = false;
        }
        self.touched.clear();
    }

    /// The obligation set: the fault site itself plus the first output that
    /// observes the discrepancy.
    fn roots(fault: &Fault, cone: &Cone, vals: &ModelVals) -> smallvec::SmallVec<[NodeId; 2]> {
        let mut roots = smallvec::SmallVec::new();
        roots.push(fault.node());
        if let Some(&po) = cone.outputs().iter().find(|&&po| vals.dval(po)) {
            roots.push(po);
        }
        roots
    }
}

impl BackTracer for BtJust1 {
    fn backtrace(
        &mut self,
        graph: &GateGraph,
        fault: &Fault,
        cone: &Cone,
        vals: &ModelVals,
    ) -> TestVector {
        let mut tv = TestVector::new(graph.input_count());
        for root in Self::roots(fault, cone, vals) {
            self.justify(graph, vals, &mut tv, root, None);
        }
        self.clear();
        tv
    }
}

/// Two-pass justification: one counting walk per observed output first,
/// then a selection walk that prefers fanins already required by another
/// path, breaking ties toward nodes closer to an output.
pub struct BtJust2 {
    inner: BtJust1,
    counts: Vec<u64>,
}

impl BtJust2 {
    pub fn new(max_id: usize) -> BtJust2 {
        BtJust2 {
            inner: BtJust1::new(max_id),
            counts: vec![0; max_id],
        }
    }
}

impl BackTracer for BtJust2 {
    fn backtrace(
        &mut self,
        graph: &GateGraph,
        fault: &Fault,
        cone: &Cone,
        vals: &ModelVals,
    ) -> TestVector {
        // Counting pass: independent walks from the fault site and every
        // observed output; a node needed by several walks scores higher.
        let mut counted: Vec<NodeId> = Vec::new();
        let mut scratch = TestVector::new(graph.input_count());
        let mut pass_roots: Vec<NodeId> = vec![fault.node()];
        pass_roots.extend(cone.outputs().iter().copied().filter(|&po| vals.dval(po)));
        for &root in &pass_roots {
            self.inner.justify(graph, vals, &mut scratch, root, None);
            for &id in &self.inner.touched {
                if self.counts[id.idx] == 0 {
                    counted.push(id);
                }
                self.counts[id.idx] += 1;
            }
            self.inner.clear();
        }

        // Selection pass over the Just1 obligation set, scored by the
        // counts. The counts vector is moved out to keep the borrows
        // disjoint.
        let counts = std::mem::take(&mut self.counts);
        let mut tv = TestVector::new(graph.input_count());
        for root in BtJust1::roots(fault, cone, vals) {
            self.inner
                .justify(graph, vals, &mut tv, root, Some(&counts));
        }
        self.inner.clear();
        self.counts = counts;
        for id in counted {
            self.counts[id.idx] = 0;
        }
        tv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cnf::{CnfBuilder, Space, VarMap};
    use crate::cone::Cone;
    use crate::fault::{FaultDb, FaultId, FaultSite};
    use crate::graph::{NetlistBuilder, Val3};
    use crate::sat::{SatSolver, SolveResult, VarisatSolver};

    struct Solved {
        cone: Cone,
        vars: VarMap,
        model: Vec<bool>,
    }

    /// Builds and solves the single-fault problem for `fault`.
    fn solve_single(graph: &GateGraph, db: &FaultDb, fault: FaultId) -> Solved {
        let f = db.fault(fault);
        let mut cone = Cone::new(graph.max_node_id());
        cone.mark(graph, &[f.node()]);
        let mut solver = VarisatSolver::new();
        let mut vars = VarMap::new(graph.max_node_id());
        vars.assign_cone(&mut solver, &cone);
        {
            let mut cnf = CnfBuilder::new(&mut solver, &mut vars);
            for &id in cone.nodes() {
                cnf.make_node_cnf(graph, id, Space::Good).unwrap();
            }
            for &id in cone.tfo() {
                if id == f.node() {
                    cnf.make_fault_cnf(graph, f).unwrap();
                } else {
                    cnf.make_node_cnf(graph, id, Space::Faulty).unwrap();
                }
                cnf.make_dchain_cnf(graph, id, id == f.node()).unwrap();
            }
            let outs: Vec<NodeId> = cone.outputs().to_vec();
            cnf.make_observation_cnf(&outs).unwrap();
        }
        let dlit = vars.dlit(f.node()).unwrap();
        let mut model = Vec::new();
        assert_eq!(solver.solve(&[dlit], &mut model), SolveResult::Sat);
        Solved { cone, vars, model }
    }

    fn vector_for(
        graph: &GateGraph,
        db: &FaultDb,
        fault: FaultId,
        kind: BackTracerKind,
    ) -> TestVector {
        let s = solve_single(graph, db, fault);
        let vals = ModelVals::new(&s.model, &s.vars);
        let mut bt = make_backtracer(kind, graph.max_node_id());
        bt.backtrace(graph, db.fault(fault), &s.cone, &vals)
    }

    fn check_detects(graph: &GateGraph, db: &FaultDb, fault: FaultId, tv: &TestVector) {
        let f = db.fault(fault);
        let pin = match f.site() {
            FaultSite::Output => None,
            FaultSite::Input(p) => Some(p),
        };
        let good = graph.eval_good(tv);
        let bad = graph.eval_faulty(tv, (f.node(), pin, f.val()));
        let differs = good
            .iter()
            .zip(bad.iter())
            .any(|(g, b)| g.is_fixed() && b.is_fixed() && g != b);
        assert!(
            differs,
            "vector {} does not detect {}",
            tv,
            f.describe(graph)
        );
    }

    fn all_kinds() -> [BackTracerKind; 3] {
        [
            BackTracerKind::Simple,
            BackTracerKind::Just1,
            BackTracerKind::Just2,
        ]
    }

    #[test]
    fn test_and_output_fault_vectors() {
        let mut b = NetlistBuilder::new();
        b.input("in0");
        b.input("in1");
        b.and("y", &["in0", "in1"]);
        b.output("out", "y");
        let g = b.build().unwrap();
        let db = FaultDb::enumerate(&g);
        let y = g.find("y").unwrap();
        for kind in all_kinds() {
            let tv = vector_for(&g, &db, db.output_fault(y, false), kind);
            // Only (1,1) activates and propagates.
            assert_eq!(tv.val(0), Val3::V1);
            assert_eq!(tv.val(1), Val3::V1);
            check_detects(&g, &db, db.output_fault(y, false), &tv);
        }
    }

    #[test]
    fn test_justifiers_leave_x_on_wide_or() {
        // For or(a,b,c,d) stuck-at-0 a single 1 input activates; the
        // justifiers should leave the other three X.
        let mut b = NetlistBuilder::new();
        b.input("a");
        b.input("b");
        b.input("c");
        b.input("d");
        b.or("y", &["a", "b", "c", "d"]);
        b.output("out", "y");
        let g = b.build().unwrap();
        let db = FaultDb::enumerate(&g);
        let y = g.find("y").unwrap();
        let f = db.output_fault(y, false);

        for kind in [BackTracerKind::Just1, BackTracerKind::Just2] {
            let tv = vector_for(&g, &db, f, kind);
            check_detects(&g, &db, f, &tv);
            assert!(tv.x_count() >= 2, "{:?} kept too many bits: {}", kind, tv);
        }
    }

    #[test]
    fn test_nonx_bits_subset_of_model() {
        let mut b = NetlistBuilder::new();
        b.input("a");
        b.input("b");
        b.input("c");
        b.and("s", &["a", "b"]);
        b.or("z", &["s", "c"]);
        b.output("out", "z");
        let g = b.build().unwrap();
        let db = FaultDb::enumerate(&g);
        let s_node = g.find("s").unwrap();
        let fault = db.output_fault(s_node, false);
        let solved = solve_single(&g, &db, fault);
        let vals = ModelVals::new(&solved.model, &solved.vars);

        for kind in all_kinds() {
            let mut bt = make_backtracer(kind, g.max_node_id());
            let tv = bt.backtrace(&g, db.fault(fault), &solved.cone, &vals);
            for (pos, val) in tv.assigned() {
                let pi = g.input(pos);
                assert_eq!(vals.gval(pi), Some(val), "{:?} invented a bit", kind);
            }
            check_detects(&g, &db, fault, &tv);
        }
    }

    #[test]
    fn test_input_fault_vector() {
        let mut b = NetlistBuilder::new();
        b.input("in0");
        b.input("in1");
        b.and("y", &["in0", "in1"]);
        b.output("out", "y");
        let g = b.build().unwrap();
        let db = FaultDb::enumerate(&g);
        let y = g.find("y").unwrap();
        let f = db.input_fault(y, 0, true);
        for kind in all_kinds() {
            let tv = vector_for(&g, &db, f, kind);
            assert_eq!(tv.val(0), Val3::V0);
            assert_eq!(tv.val(1), Val3::V1);
            check_detects(&g, &db, f, &tv);
        }
    }
}
