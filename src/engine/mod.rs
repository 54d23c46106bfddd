//! Deterministic test generation driver.
//!
//! A [Dtpg] run iterates the active representative faults in reverse
//! topological order (outputs first, so dominated faults are usually
//! retired by drop before their turn), groups them per strategy, builds one
//! cone + solver + CNF per group and routes every SAT outcome through the
//! hook protocol. Faults already resolved keep their status when a run
//! aborts, so a second invocation with a different strategy continues where
//! the first stopped.

mod multi;
mod po_split;
mod single;

use crate::backtrace::BackTracer;
use crate::cnf::{ModelVals, VarMap};
use crate::cone::Cone;
use crate::error::RunError;
use crate::fault::{FaultDb, FaultId, FaultStatus};
use crate::graph::{GateGraph, NodeId};
use crate::hooks::{DetectHook, UntestHook};
use crate::imply::ImplyEngine;
use crate::sat::{Lit, SatSolver, SatStats, SolveBudget, SolveResult, VarisatSolver};
use crate::testvec::TestVector;
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};

/// How faults are batched into SAT problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One fault per SAT problem.
    Single,
    /// One shared CNF per fanout-free region, activation variable per
    /// fault.
    Ffr,
    /// One shared CNF per maximal fanout-free cone, solver reused across
    /// all its faults.
    Mffc,
    /// Single-fault problems iterated for up to k distinct vectors each.
    KDetect(u32),
    /// One output cone at a time per fault, narrowest first, up to the
    /// threshold before a catch-all pass.
    PoSingle(usize),
    /// The per-FFR engine with per-output incremental CNF.
    PoMulti(usize),
}

/// Orthogonal output partitioning: reruns the whole pass with the graph
/// activated per output, in cone-size order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoPartition {
    None,
    Ascending,
    Descending,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub strategy: Strategy,
    pub po_partition: PoPartition,
    /// Assume d=1 along the fault's dominator chain (unique
    /// sensitization). Completeness-preserving shortcut.
    pub use_dominators: bool,
    /// Prove untestability by ternary implication before touching SAT.
    pub use_mandatory: bool,
    pub budget: SolveBudget,
    /// Aborts per fault before it is marked Skipped. None retries forever.
    pub abort_skip_threshold: Option<u32>,
    /// Lift skip hints between output-partition passes.
    pub clear_skips_between_passes: bool,
}

impl Default for EngineOptions {
    fn default() -> EngineOptions {
        EngineOptions {
            strategy: Strategy::Single,
            po_partition: PoPartition::None,
            use_dominators: true,
            use_mandatory: true,
            budget: SolveBudget::default(),
            abort_skip_threshold: Some(3),
            clear_skips_between_passes: false,
        }
    }
}

/// Run counters, aggregated and per-call-maximum SAT statistics included.
#[derive(Debug, Clone, Default)]
pub struct DtpgStats {
    pub cnf_count: u64,
    pub cnf_time: Duration,
    pub sat_calls: u64,
    pub det_count: u64,
    pub det_time: Duration,
    pub det_stats: SatStats,
    pub det_stats_max: SatStats,
    pub untest_count: u64,
    pub untest_time: Duration,
    pub untest_stats: SatStats,
    pub untest_stats_max: SatStats,
    pub part_untest_count: u64,
    pub part_untest_time: Duration,
    pub abort_count: u64,
    pub abort_time: Duration,
}

/// The deterministic ATPG driver. Owns nothing long-lived: graph, fault
/// database, backtracer and hooks are lent by the caller for the run.
pub struct Dtpg<'a> {
    pub(crate) graph: &'a mut GateGraph,
    pub(crate) db: &'a mut FaultDb,
    pub(crate) bt: &'a mut dyn BackTracer,
    pub(crate) dop: &'a mut dyn DetectHook,
    pub(crate) uop: &'a mut dyn UntestHook,
    pub(crate) opts: EngineOptions,
    pub(crate) solver_factory: Box<dyn Fn() -> Box<dyn SatSolver> + 'a>,
    pub(crate) stats: DtpgStats,
    pub(crate) imply: ImplyEngine,
    pub(crate) cone: Cone,
    pub(crate) abort_counts: FxHashMap<FaultId, u32>,
}

impl<'a> Dtpg<'a> {
    pub fn new(
        graph: &'a mut GateGraph,
        db: &'a mut FaultDb,
        bt: &'a mut dyn BackTracer,
        dop: &'a mut dyn DetectHook,
        uop: &'a mut dyn UntestHook,
        opts: EngineOptions,
    ) -> Dtpg<'a> {
        let max_id = graph.max_node_id();
        Dtpg {
            graph,
            db,
            bt,
            dop,
            uop,
            opts,
            solver_factory: Box::new(|| Box::new(VarisatSolver::new()) as Box<dyn SatSolver>),
            stats: DtpgStats::default(),
            imply: ImplyEngine::new(max_id),
            cone: Cone::new(max_id),
            abort_counts: FxHashMap::default(),
        }
    }

    /// Swaps the SAT backend; the factory is called once per cone.
    pub fn with_solver_factory(
        mut self,
        factory: Box<dyn Fn() -> Box<dyn SatSolver> + 'a>,
    ) -> Dtpg<'a> {
        self.solver_factory = factory;
        self
    }

    pub fn stats(&self) -> &DtpgStats {
        &self.stats
    }

    /// Runs test generation over the remaining representative faults.
    pub fn run(&mut self) -> Result<(), RunError> {
        tracing::info!(
            strategy = ?self.opts.strategy,
            po_partition = ?self.opts.po_partition,
            remaining = self.db.remaining().len(),
            "dtpg run start"
        );
        match self.opts.po_partition {
            PoPartition::None => {
                self.graph.activate_all();
                self.run_pass()?;
            }
            PoPartition::Ascending => {
                for pos in 0..self.graph.output_count() {
                    self.graph.activate_po(pos);
                    self.run_pass()?;
                    // Sweep between scopes so faults aborted here are
                    // retryable under the remaining outputs; the abort
                    // counts live on the driver and keep accumulating.
                    self.db.update();
                    if self.opts.clear_skips_between_passes {
                        self.db.clear_skips();
                    }
                }
                self.graph.activate_all();
            }
            PoPartition::Descending => {
                for pos in (0..self.graph.output_count()).rev() {
                    self.graph.activate_po(pos);
                    self.run_pass()?;
                    self.db.update();
                    if self.opts.clear_skips_between_passes {
                        self.db.clear_skips();
                    }
                }
                self.graph.activate_all();
            }
        }
        self.db.update();
        tracing::info!(
            detected = self.db.detected_list().len(),
            untestable = self.db.untestable_list().len(),
            remaining = self.db.remaining().len(),
            "dtpg run done"
        );
        Ok(())
    }

    fn run_pass(&mut self) -> Result<(), RunError> {
        match self.opts.strategy {
            Strategy::Single => self.single_pass(1),
            Strategy::KDetect(k) => self.single_pass(k.max(1)),
            Strategy::Ffr => self.group_pass(false),
            Strategy::Mffc => self.group_pass(true),
            Strategy::PoSingle(th) => self.po_single_pass(th),
            Strategy::PoMulti(th) => self.po_multi_pass(th),
        }
    }

    /// Outputs first, then gates in reverse topological order; per node the
    /// output faults come before the input-pin faults.
    fn single_pass(&mut self, k: u32) -> Result<(), RunError> {
        let order = self.target_order();
        for fault in order {
            self.dtpg_single(fault, k)?;
        }
        Ok(())
    }

    fn group_pass(&mut self, mffc: bool) -> Result<(), RunError> {
        let roots = if mffc {
            self.graph.mffc_roots()
        } else {
            self.graph.ffr_roots()
        };
        for &root in roots.iter().rev() {
            let nodes = if mffc {
                self.graph.mffc_nodes(root)
            } else {
                self.graph.ffr_nodes(root)
            };
            let faults = self.group_faults(&nodes);
            if !faults.is_empty() {
                self.run_group(&faults)?;
            }
        }
        Ok(())
    }

    fn po_single_pass(&mut self, threshold: usize) -> Result<(), RunError> {
        let order = self.target_order();
        for fault in order {
            self.po_split_single(fault, threshold)?;
        }
        Ok(())
    }

    fn po_multi_pass(&mut self, threshold: usize) -> Result<(), RunError> {
        let roots = self.graph.ffr_roots();
        for &root in roots.iter().rev() {
            let nodes = self.graph.ffr_nodes(root);
            let faults = self.group_faults(&nodes);
            if !faults.is_empty() {
                self.po_split_multi(&faults, threshold)?;
            }
        }
        Ok(())
    }

    fn target_order(&self) -> Vec<FaultId> {
        let mut order = Vec::new();
        for &id in self.graph.active_nodes().iter().rev() {
            for fault in self.db.node_faults(id) {
                if eligible(self.db, self.graph, fault) {
                    order.push(fault);
                }
            }
        }
        order
    }

    fn group_faults(&self, nodes: &[NodeId]) -> Vec<FaultId> {
        let mut faults = Vec::new();
        for &id in nodes {
            for fault in self.db.node_faults(id) {
                if eligible(self.db, self.graph, fault) {
                    faults.push(fault);
                }
            }
        }
        faults
    }
}

/// A fault is a target when it represents its class, is still open, not
/// skip-hinted, and its site is in the current activation scope.
pub(crate) fn eligible(db: &FaultDb, graph: &GateGraph, id: FaultId) -> bool {
    let f = db.fault(id);
    f.is_rep()
        && f.status() == FaultStatus::Undetected
        && !f.is_skip()
        && graph.node(f.node()).is_active()
}

pub(crate) fn timed_solve(
    solver: &mut dyn SatSolver,
    assumptions: &[Lit],
    model: &mut Vec<bool>,
) -> (SolveResult, SatStats, Duration) {
    let before = solver.stats();
    let start = Instant::now();
    let result = solver.solve(assumptions, model);
    let time = start.elapsed();
    let delta = solver.stats().since(&before);
    (result, delta, time)
}

/// Sat outcome: backtrace, mark, hand the vector to the detect hook.
#[allow(clippy::too_many_arguments)]
pub(crate) fn detect_op(
    graph: &GateGraph,
    db: &mut FaultDb,
    bt: &mut dyn BackTracer,
    dop: &mut dyn DetectHook,
    stats: &mut DtpgStats,
    cone: &Cone,
    vars: &VarMap,
    model: &[bool],
    fault: FaultId,
    sat_delta: &SatStats,
    time: Duration,
) -> Result<TestVector, RunError> {
    let vals = ModelVals::new(model, vars);
    let tv = bt.backtrace(graph, db.fault(fault), cone, &vals);
    db.set_status(fault, FaultStatus::Detected);
    dop.detected(db, fault, &tv)?;
    stats.det_count += 1;
    stats.det_time += time;
    stats.det_stats.add(sat_delta);
    stats.det_stats_max.max(sat_delta);
    tracing::debug!(fault = fault.idx, vector = %tv, "detected");
    Ok(tv)
}

/// Detection found without any SAT call (trivial case analysis).
pub(crate) fn detect_trivial(
    db: &mut FaultDb,
    dop: &mut dyn DetectHook,
    stats: &mut DtpgStats,
    fault: FaultId,
    tv: &TestVector,
) -> Result<(), RunError> {
    db.set_status(fault, FaultStatus::Detected);
    dop.detected(db, fault, tv)?;
    stats.det_count += 1;
    tracing::debug!(fault = fault.idx, vector = %tv, "detected trivially");
    Ok(())
}

/// Proven-untestable outcome. Only called where the proof covers the whole
/// design (full activation), never from a restricted partition pass.
pub(crate) fn untest_op(
    db: &mut FaultDb,
    uop: &mut dyn UntestHook,
    stats: &mut DtpgStats,
    fault: FaultId,
    sat_delta: &SatStats,
    time: Duration,
) -> Result<(), RunError> {
    db.set_status(fault, FaultStatus::Untestable);
    uop.untestable(db, fault)?;
    stats.untest_count += 1;
    stats.untest_time += time;
    stats.untest_stats.add(sat_delta);
    stats.untest_stats_max.max(sat_delta);
    tracing::debug!(fault = fault.idx, "untestable");
    Ok(())
}

/// Unsat under a restricted observation scope: counted, no status change.
pub(crate) fn partial_untest_op(stats: &mut DtpgStats, fault: FaultId, time: Duration) {
    stats.part_untest_count += 1;
    stats.part_untest_time += time;
    tracing::debug!(fault = fault.idx, "partially untestable");
}

/// Solver abort: the fault stays retryable until the skip threshold.
pub(crate) fn abort_op(
    db: &mut FaultDb,
    stats: &mut DtpgStats,
    abort_counts: &mut FxHashMap<FaultId, u32>,
    threshold: Option<u32>,
    fault: FaultId,
    time: Duration,
) {
    db.set_status(fault, FaultStatus::Aborted);
    let count = abort_counts.entry(fault).or_insert(0);
    *count += 1;
    if let Some(th) = threshold {
        if *count >= th {
            db.set_skip(fault);
        }
    }
    stats.abort_count += 1;
    stats.abort_time += time;
    tracing::warn!(fault = fault.idx, aborts = *count, "solver aborted");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtrace::{make_backtracer, BackTracerKind};
    use crate::fault::FaultSite;
    use crate::graph::{NetlistBuilder, Val3};
    use crate::hooks::{DopTvList, DopVerify, ExhaustiveSim, FaultSim, UopBase};
    use proptest::prelude::{any, ProptestConfig};
    use proptest::strategy::Strategy as PropStrategy;
    use proptest::{prop_assert, prop_assert_eq, proptest};

    fn run_with(
        graph: &mut GateGraph,
        db: &mut FaultDb,
        opts: EngineOptions,
    ) -> (Vec<(FaultId, TestVector)>, DtpgStats) {
        let mut bt = make_backtracer(BackTracerKind::Just1, graph.max_node_id());
        let mut dop = DopTvList::new();
        let mut uop = UopBase::new();
        let stats = {
            let mut dtpg = Dtpg::new(graph, db, bt.as_mut(), &mut dop, &mut uop, opts);
            dtpg.run().unwrap();
            dtpg.stats().clone()
        };
        (dop.into_vectors(), stats)
    }

    fn detects(graph: &GateGraph, db: &FaultDb, fault: FaultId, tv: &TestVector) -> bool {
        let f = db.fault(fault);
        let pin = match f.site() {
            FaultSite::Output => None,
            FaultSite::Input(p) => Some(p),
        };
        let good = graph.eval_good(tv);
        let bad = graph.eval_faulty(tv, (f.node(), pin, f.val()));
        good.iter()
            .zip(bad.iter())
            .any(|(g, b)| g.is_fixed() && b.is_fixed() && g != b)
    }

    fn vector_of(vecs: &[(FaultId, TestVector)], fault: FaultId) -> &TestVector {
        &vecs
            .iter()
            .find(|(f, _)| *f == fault)
            .unwrap_or_else(|| panic!("no vector generated for fault {}", fault))
            .1
    }

    fn and_netlist() -> GateGraph {
        let mut b = NetlistBuilder::new();
        b.input("in0");
        b.input("in1");
        b.and("y", &["in0", "in1"]);
        b.output("out", "y");
        b.build().unwrap()
    }

    /// The ISCAS c17 benchmark: six Nands, five inputs, two outputs, every
    /// fault testable.
    fn c17() -> GateGraph {
        let mut b = NetlistBuilder::new();
        b.input("i1");
        b.input("i2");
        b.input("i3");
        b.input("i6");
        b.input("i7");
        b.nand("n10", &["i1", "i3"]);
        b.nand("n11", &["i3", "i6"]);
        b.nand("n16", &["i2", "n11"]);
        b.nand("n19", &["n11", "i7"]);
        b.nand("n22", &["n10", "n16"]);
        b.nand("n23", &["n16", "n19"]);
        b.output("o22", "n22");
        b.output("o23", "n23");
        b.build().unwrap()
    }

    fn assert_terminal_and_valid(graph: &GateGraph, db: &FaultDb, vecs: &[(FaultId, TestVector)]) {
        for &rep in db.representatives() {
            let status = db.status(rep);
            assert!(
                matches!(status, FaultStatus::Detected | FaultStatus::Untestable),
                "fault {} left {:?}",
                db.fault(rep).describe(graph),
                status
            );
        }
        for (fault, tv) in vecs {
            assert!(
                detects(graph, db, *fault, tv),
                "vector {} does not detect {}",
                tv,
                db.fault(*fault).describe(graph)
            );
        }
    }

    #[test]
    fn test_and_output_stuck_at_0() {
        let mut g = and_netlist();
        let mut db = FaultDb::enumerate(&g);
        let out = g.find("out").unwrap();
        let rep = db.output_fault(out, false);
        let (vecs, _) = run_with(&mut g, &mut db, EngineOptions::default());
        assert_eq!(db.status(rep), FaultStatus::Detected);
        let tv = vector_of(&vecs, rep);
        assert_eq!((tv.val(0), tv.val(1)), (Val3::V1, Val3::V1));
    }

    #[test]
    fn test_and_input_stuck_at_1() {
        let mut g = and_netlist();
        let mut db = FaultDb::enumerate(&g);
        let y = g.find("y").unwrap();
        let rep = db.input_fault(y, 0, true);
        assert!(db.fault(rep).is_rep());
        let (vecs, _) = run_with(&mut g, &mut db, EngineOptions::default());
        let tv = vector_of(&vecs, rep);
        assert_eq!((tv.val(0), tv.val(1)), (Val3::V0, Val3::V1));
    }

    #[test]
    fn test_or_output_stuck_at_1() {
        let mut b = NetlistBuilder::new();
        b.input("in0");
        b.input("in1");
        b.or("y", &["in0", "in1"]);
        b.output("out", "y");
        let mut g = b.build().unwrap();
        let mut db = FaultDb::enumerate(&g);
        let out = g.find("out").unwrap();
        let rep = db.output_fault(out, true);
        let (vecs, _) = run_with(&mut g, &mut db, EngineOptions::default());
        let tv = vector_of(&vecs, rep);
        assert_eq!((tv.val(0), tv.val(1)), (Val3::V0, Val3::V0));
    }

    #[test]
    fn test_xor_input_stuck_at_0() {
        let mut b = NetlistBuilder::new();
        b.input("in0");
        b.input("in1");
        b.xor("y", &["in0", "in1"]);
        b.output("out", "y");
        let mut g = b.build().unwrap();
        let mut db = FaultDb::enumerate(&g);
        let y = g.find("y").unwrap();
        let rep = db.input_fault(y, 0, false);
        let (vecs, _) = run_with(&mut g, &mut db, EngineOptions::default());
        let tv = vector_of(&vecs, rep);
        // in0 activates at 1; in1 may be either value but must be fixed for
        // the discrepancy to reach the output.
        assert_eq!(tv.val(0), Val3::V1);
        assert!(tv.val(1).is_fixed());
        assert!(detects(&g, &db, rep, tv));
    }

    #[test]
    fn test_constant_zero_cone_is_untestable() {
        // out = AND(in0, NOT(in0)) is constantly 0: stuck-at-0 cannot be
        // activated.
        let mut b = NetlistBuilder::new();
        b.input("in0");
        b.not1("n", "in0");
        b.and("y", &["in0", "n"]);
        b.output("out", "y");

        for use_mandatory in [true, false] {
            let mut g = b.clone().build().unwrap();
            let mut db = FaultDb::enumerate(&g);
            let out = g.find("out").unwrap();
            let rep = db.output_fault(out, false);
            let opts = EngineOptions {
                use_mandatory,
                ..Default::default()
            };
            let (vecs, _) = run_with(&mut g, &mut db, opts);
            assert_eq!(db.status(rep), FaultStatus::Untestable);
            assert!(vecs.iter().all(|(f, _)| *f != rep));
            // The opposite polarity is detected by any vector.
            assert_eq!(db.status(db.output_fault(out, true)), FaultStatus::Detected);
        }
    }

    #[test]
    fn test_fanout_stem_single_vector_covers_both_outputs() {
        // y = NAND(in0, in1) branches to both outputs; (1,1) flips both.
        let mut b = NetlistBuilder::new();
        b.input("in0");
        b.input("in1");
        b.nand("y", &["in0", "in1"]);
        b.buf1("u", "y");
        b.not1("v", "y");
        b.output("out0", "u");
        b.output("out1", "v");
        let mut g = b.build().unwrap();
        let mut db = FaultDb::enumerate(&g);
        let y = g.find("y").unwrap();
        let rep = db.output_fault(y, true);
        assert!(db.fault(rep).is_rep());

        let opts = EngineOptions {
            strategy: Strategy::Mffc,
            ..Default::default()
        };
        let (vecs, _) = run_with(&mut g, &mut db, opts);
        let tv = vector_of(&vecs, rep);
        assert_eq!((tv.val(0), tv.val(1)), (Val3::V1, Val3::V1));
        // One vector observes the discrepancy at both outputs.
        let good = g.eval_good(tv);
        let bad = g.eval_faulty(tv, (y, None, true));
        assert_ne!(good[0], bad[0]);
        assert_ne!(good[1], bad[1]);
        // The other polarity is also covered.
        assert_eq!(db.status(db.output_fault(y, false)), FaultStatus::Detected);
    }

    #[test]
    fn test_empty_netlist() {
        let mut g = NetlistBuilder::new().build().unwrap();
        let mut db = FaultDb::enumerate(&g);
        assert!(db.is_empty());
        let (vecs, stats) = run_with(&mut g, &mut db, EngineOptions::default());
        assert!(vecs.is_empty());
        assert_eq!(stats.sat_calls, 0);
    }

    #[test]
    fn test_wire_netlist_needs_no_sat() {
        let mut b = NetlistBuilder::new();
        b.input("in");
        b.output("out", "in");
        let mut g = b.build().unwrap();
        let mut db = FaultDb::enumerate(&g);
        assert_eq!(db.representatives().len(), 2);
        let (vecs, stats) = run_with(&mut g, &mut db, EngineOptions::default());
        assert_eq!(stats.sat_calls, 0);
        assert_eq!(vecs.len(), 2);
        assert_terminal_and_valid(&g, &db, &vecs);
    }

    #[test]
    fn test_c17_full_coverage_all_strategies() {
        let strategies = [
            Strategy::Single,
            Strategy::Ffr,
            Strategy::Mffc,
            Strategy::KDetect(2),
            Strategy::PoSingle(1),
            Strategy::PoMulti(1),
        ];
        for strategy in strategies {
            let mut g = c17();
            let mut db = FaultDb::enumerate(&g);
            let opts = EngineOptions {
                strategy,
                ..Default::default()
            };
            let (vecs, _) = run_with(&mut g, &mut db, opts);
            assert_terminal_and_valid(&g, &db, &vecs);
            // c17 has no redundant faults.
            for &rep in db.representatives() {
                assert_eq!(
                    db.status(rep),
                    FaultStatus::Detected,
                    "{:?} missed {}",
                    strategy,
                    db.fault(rep).describe(&g)
                );
            }
        }
    }

    #[test]
    fn test_c17_po_partitions() {
        for po_partition in [PoPartition::Ascending, PoPartition::Descending] {
            let mut g = c17();
            let mut db = FaultDb::enumerate(&g);
            let opts = EngineOptions {
                po_partition,
                ..Default::default()
            };
            let (vecs, _) = run_with(&mut g, &mut db, opts);
            for (fault, tv) in &vecs {
                assert!(detects(&g, &db, *fault, tv));
            }
            for &rep in db.representatives() {
                assert_eq!(db.status(rep), FaultStatus::Detected);
            }
        }
    }

    /// Delegates to varisat but returns Aborted while the shared fuse has
    /// charges left, to simulate budget exhaustion.
    struct AbortFirst {
        inner: VarisatSolver,
        fuse: std::rc::Rc<std::cell::Cell<u32>>,
    }

    impl SatSolver for AbortFirst {
        fn new_var(&mut self) -> crate::sat::VarId {
            self.inner.new_var()
        }
        fn add_clause(&mut self, lits: &[Lit]) {
            self.inner.add_clause(lits)
        }
        fn solve(&mut self, assumptions: &[Lit], model: &mut Vec<bool>) -> SolveResult {
            let left = self.fuse.get();
            if left > 0 {
                self.fuse.set(left - 1);
                return SolveResult::Aborted;
            }
            self.inner.solve(assumptions, model)
        }
        fn stats(&self) -> SatStats {
            self.inner.stats()
        }
        fn forget_learnt(&mut self) {
            self.inner.forget_learnt()
        }
        fn set_budget(&mut self, budget: SolveBudget) {
            self.inner.set_budget(budget)
        }
    }

    #[test]
    fn test_aborted_faults_retry_on_later_partition_passes() {
        // Both outputs observe every fault of the stem.
        let mut b = NetlistBuilder::new();
        b.input("a");
        b.input("b");
        b.nand("y", &["a", "b"]);
        b.buf1("u", "y");
        b.not1("v", "y");
        b.output("out0", "u");
        b.output("out1", "v");
        let mut g = b.build().unwrap();
        let mut db = FaultDb::enumerate(&g);
        let y = g.find("y").unwrap();
        let out0 = g.find("out0").unwrap();

        // The first partition pass issues one SAT call per eligible
        // representative (two output-wire classes, four classes at y);
        // burn exactly those so the whole pass aborts.
        let fuse = std::rc::Rc::new(std::cell::Cell::new(6u32));
        let factory_fuse = fuse.clone();

        let mut bt = make_backtracer(BackTracerKind::Just1, g.max_node_id());
        let mut dop = DopTvList::new();
        let mut uop = UopBase::new();
        let opts = EngineOptions {
            po_partition: PoPartition::Ascending,
            abort_skip_threshold: None,
            ..Default::default()
        };
        let stats = {
            let mut dtpg = Dtpg::new(&mut g, &mut db, bt.as_mut(), &mut dop, &mut uop, opts)
                .with_solver_factory(Box::new(move || {
                    Box::new(AbortFirst {
                        inner: VarisatSolver::new(),
                        fuse: factory_fuse.clone(),
                    }) as Box<dyn SatSolver>
                }));
            dtpg.run().unwrap();
            dtpg.stats().clone()
        };

        assert_eq!(fuse.get(), 0);
        assert_eq!(stats.abort_count, 6);
        // Aborted under the first scope, demoted between passes, resolved
        // under the second.
        for fault in [
            db.output_fault(y, false),
            db.output_fault(y, true),
            db.input_fault(y, 0, true),
            db.input_fault(y, 1, true),
        ] {
            assert_eq!(db.status(fault), FaultStatus::Detected);
        }
        assert_eq!(stats.det_count, 6);
        // The first output's own classes were only visible in the aborted
        // scope; they stay open for a later run.
        assert_eq!(
            db.status(db.output_fault(out0, false)),
            FaultStatus::Undetected
        );
    }

    #[test]
    fn test_kdetect_produces_distinct_vectors() {
        let mut b = NetlistBuilder::new();
        b.input("in0");
        b.input("in1");
        b.or("y", &["in0", "in1"]);
        b.output("out", "y");
        let mut g = b.build().unwrap();
        let mut db = FaultDb::enumerate(&g);
        let out = g.find("out").unwrap();
        let rep = db.output_fault(out, false);
        let opts = EngineOptions {
            strategy: Strategy::KDetect(3),
            ..Default::default()
        };
        let (vecs, _) = run_with(&mut g, &mut db, opts);
        let mine: Vec<&TestVector> = vecs
            .iter()
            .filter(|(f, _)| *f == rep)
            .map(|(_, tv)| tv)
            .collect();
        assert!(mine.len() >= 2, "expected several vectors, got {:?}", mine);
        for (i, a) in mine.iter().enumerate() {
            assert!(detects(&g, &db, rep, a));
            for b in &mine[i + 1..] {
                assert_ne!(a, b, "k-detect repeated a vector");
            }
        }
    }

    #[test]
    fn test_strategies_agree_on_verdicts() {
        // A redundant wire: z = OR(y, AND(a, b)) where y = AND(a, b)
        // duplicated makes some faults untestable.
        let build = || {
            let mut b = NetlistBuilder::new();
            b.input("a");
            b.input("b");
            b.and("y1", &["a", "b"]);
            b.and("y2", &["a", "b"]);
            b.or("z", &["y1", "y2"]);
            b.output("out", "z");
            b.build().unwrap()
        };

        let mut reference: Option<Vec<FaultStatus>> = None;
        for strategy in [Strategy::Single, Strategy::Ffr, Strategy::Mffc] {
            let mut g = build();
            let mut db = FaultDb::enumerate(&g);
            let opts = EngineOptions {
                strategy,
                ..Default::default()
            };
            let (vecs, _) = run_with(&mut g, &mut db, opts);
            assert_terminal_and_valid(&g, &db, &vecs);
            let statuses: Vec<FaultStatus> = db
                .representatives()
                .iter()
                .map(|&r| db.status(r))
                .collect();
            match &reference {
                None => reference = Some(statuses),
                Some(prev) => assert_eq!(prev, &statuses, "{:?} disagrees", strategy),
            }
        }
    }

    #[test]
    fn test_runs_are_deterministic() {
        let run = || {
            let mut g = c17();
            let mut db = FaultDb::enumerate(&g);
            run_with(&mut g, &mut db, EngineOptions::default()).0
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_failing_hook_aborts_run() {
        struct LyingSim;
        impl FaultSim for LyingSim {
            fn detects(&mut self, _tv: &TestVector) -> Vec<FaultId> {
                Vec::new()
            }
        }

        let mut g = and_netlist();
        let mut db = FaultDb::enumerate(&g);
        let mut bt = make_backtracer(BackTracerKind::Just1, g.max_node_id());
        let mut dop = DopVerify::new(Box::new(LyingSim));
        let mut uop = UopBase::new();
        let mut dtpg = Dtpg::new(
            &mut g,
            &mut db,
            bt.as_mut(),
            &mut dop,
            &mut uop,
            EngineOptions::default(),
        );
        assert!(matches!(dtpg.run(), Err(RunError::Hook(_))));
    }

    #[test]
    fn test_verify_hook_passes_on_real_vectors() {
        let mut g = c17();
        let mut db = FaultDb::enumerate(&g);
        let sim = ExhaustiveSim::new(&g, &db);
        let mut bt = make_backtracer(BackTracerKind::Just2, g.max_node_id());
        let mut dop = DopVerify::new(Box::new(sim));
        let mut uop = UopBase::new();
        let mut dtpg = Dtpg::new(
            &mut g,
            &mut db,
            bt.as_mut(),
            &mut dop,
            &mut uop,
            EngineOptions::default(),
        );
        dtpg.run().unwrap();
    }

    #[test]
    fn test_second_run_continues_from_first() {
        let mut g = c17();
        let mut db = FaultDb::enumerate(&g);
        let (_, stats1) = run_with(&mut g, &mut db, EngineOptions::default());
        assert!(stats1.det_count > 0);
        // Everything is terminal; a re-run with another strategy has no
        // work left.
        let opts = EngineOptions {
            strategy: Strategy::Mffc,
            ..Default::default()
        };
        let (vecs2, stats2) = run_with(&mut g, &mut db, opts);
        assert!(vecs2.is_empty());
        assert_eq!(stats2.sat_calls, 0);
    }

    /// Random flat netlists for the engine invariants.
    #[derive(Debug, Clone)]
    struct RandNet {
        inputs: usize,
        gates: Vec<(u8, [usize; 3], usize)>,
    }

    fn rand_net() -> impl PropStrategy<Value = RandNet> {
        (
            2usize..=4,
            proptest::collection::vec((0u8..6, any::<[usize; 3]>(), 2usize..=3), 1..8),
        )
            .prop_map(|(inputs, gates)| RandNet { inputs, gates })
    }

    fn build_rand(net: &RandNet) -> GateGraph {
        let mut b = NetlistBuilder::new();
        let mut signals: Vec<String> = Vec::new();
        for i in 0..net.inputs {
            let name = format!("i{}", i);
            b.input(name.clone());
            signals.push(name);
        }
        let mut driven = vec![false; net.inputs + net.gates.len()];
        for (gi, (kind, raw, arity)) in net.gates.iter().enumerate() {
            let name = format!("g{}", gi);
            let fanins: Vec<String> = (0..*arity)
                .map(|j| {
                    let pick = raw[j] % signals.len();
                    driven[pick] = true;
                    signals[pick].clone()
                })
                .collect();
            let refs: Vec<&str> = fanins.iter().map(|s| s.as_str()).collect();
            match kind % 6 {
                0 => b.and(name.clone(), &refs),
                1 => b.nand(name.clone(), &refs),
                2 => b.or(name.clone(), &refs),
                3 => b.nor(name.clone(), &refs),
                4 => b.xor(name.clone(), &refs),
                _ => b.xnor(name.clone(), &refs),
            };
            signals.push(name);
        }
        // Observe every undriven signal so no logic is dead.
        let mut po = 0;
        for (i, name) in signals.iter().enumerate() {
            if !driven[i] {
                b.output(format!("o{}", po), name);
                po += 1;
            }
        }
        b.build().unwrap()
    }

    /// Exhaustive untestability check over all fully-specified vectors.
    fn provably_untestable(graph: &GateGraph, db: &FaultDb, fault: FaultId) -> bool {
        let n = graph.input_count();
        for bits in 0..(1u32 << n) {
            let mut tv = TestVector::new(n);
            for i in 0..n {
                tv.set(i, bits & (1 << i) != 0);
            }
            if detects(graph, db, fault, &tv) {
                return false;
            }
        }
        true
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_engine_verdicts_are_sound(net in rand_net()) {
            let mut g = build_rand(&net);
            let mut db = FaultDb::enumerate(&g);
            let (vecs, _) = run_with(&mut g, &mut db, EngineOptions::default());

            for &rep in db.representatives() {
                match db.status(rep) {
                    FaultStatus::Detected => {}
                    FaultStatus::Untestable => {
                        prop_assert!(
                            provably_untestable(&g, &db, rep),
                            "fault {} wrongly called untestable",
                            db.fault(rep).describe(&g)
                        );
                    }
                    other => prop_assert!(false, "non-terminal status {:?}", other),
                }
            }
            for (fault, tv) in &vecs {
                prop_assert!(
                    detects(&g, &db, *fault, tv),
                    "vector {} misses {}",
                    tv,
                    db.fault(*fault).describe(&g)
                );
            }
        }

        #[test]
        fn prop_group_engines_match_single(net in rand_net()) {
            let statuses = |strategy: Strategy| {
                let mut g = build_rand(&net);
                let mut db = FaultDb::enumerate(&g);
                run_with(&mut g, &mut db, EngineOptions { strategy, ..Default::default() });
                db.representatives()
                    .iter()
                    .map(|&r| db.status(r))
                    .collect::<Vec<_>>()
            };
            let single = statuses(Strategy::Single);
            prop_assert_eq!(&single, &statuses(Strategy::Ffr));
            prop_assert_eq!(&single, &statuses(Strategy::Mffc));
        }
    }
}
