//! Single-fault engine, plus the k-detect iteration on top of it.

use super::{
    abort_op, detect_op, detect_trivial, eligible, partial_untest_op, timed_solve, untest_op,
    Dtpg, PoPartition,
};
use crate::cnf::{CnfBuilder, Space, VarMap};
use crate::error::RunError;
use crate::fault::{Fault, FaultSite};
use crate::graph::{GateGraph, GateKind, Val3};
use crate::sat::{Lit, SatSolver, SolveResult};
use crate::testvec::TestVector;
use std::time::{Duration, Instant};

impl Dtpg<'_> {
    /// One fault, one cone, one solver; `k` > 1 keeps re-solving with the
    /// previous vector's assigned bits blocked, yielding up to `k` distinct
    /// vectors.
    pub(crate) fn dtpg_single(&mut self, fault_id: crate::fault::FaultId, k: u32) -> Result<(), RunError> {
        let Dtpg {
            graph,
            db,
            bt,
            dop,
            uop,
            opts,
            solver_factory,
            stats,
            imply,
            cone,
            abort_counts,
        } = self;
        let graph: &GateGraph = graph;

        if !eligible(db, graph, fault_id) {
            return Ok(());
        }
        let terminal = opts.po_partition == PoPartition::None;

        if opts.use_mandatory && terminal && imply.mandatory_for(graph, db.fault(fault_id)).is_none()
        {
            return untest_op(db, &mut **uop, stats, fault_id, &Default::default(), Duration::ZERO);
        }

        if let Some(tv) = trivial_vector(graph, db.fault(fault_id)) {
            return detect_trivial(db, &mut **dop, stats, fault_id, &tv);
        }

        let fnode = db.fault(fault_id).node();
        cone.mark(graph, &[fnode]);
        if cone.outputs().is_empty() {
            return Ok(());
        }

        let cnf_start = Instant::now();
        let mut solver = (solver_factory)();
        solver.set_budget(opts.budget);
        let mut vars = VarMap::new(graph.max_node_id());
        vars.assign_cone(solver.as_mut(), cone);
        {
            let fault = db.fault(fault_id);
            let mut cnf = CnfBuilder::new(solver.as_mut(), &mut vars);
            for &id in cone.nodes() {
                cnf.make_node_cnf(graph, id, Space::Good)?;
            }
            for &id in cone.tfo() {
                if id == fnode {
                    cnf.make_fault_cnf(graph, fault)?;
                } else {
                    cnf.make_node_cnf(graph, id, Space::Faulty)?;
                }
                cnf.make_dchain_cnf(graph, id, id == fnode)?;
            }
            cnf.make_observation_cnf(cone.outputs())?;
            cnf.make_activation_cnf(graph, fault)?;
            cnf.make_sensitization_cnf(graph, fnode, opts.use_dominators)?;
        }
        stats.cnf_count += 1;
        stats.cnf_time += cnf_start.elapsed();

        let mut model = Vec::new();
        for round in 0..k {
            let (result, delta, time) = timed_solve(solver.as_mut(), &[], &mut model);
            stats.sat_calls += 1;
            match result {
                SolveResult::Sat => {
                    let tv = detect_op(
                        graph, db, &mut **bt, &mut **dop, stats, cone, &vars, &model, fault_id, &delta,
                        time,
                    )?;
                    if round + 1 == k {
                        break;
                    }
                    // Block exactly the assigned bits; X bits stay free for
                    // the next vector.
                    let mut blocking = Vec::new();
                    for (pos, val) in tv.assigned() {
                        let pi = graph.input(pos);
                        blocking.push(Lit::with_value(vars.gvar(pi)?, !val));
                    }
                    if blocking.is_empty() {
                        break;
                    }
                    solver.add_clause(&blocking);
                }
                SolveResult::Unsat => {
                    if round == 0 {
                        if terminal {
                            untest_op(db, &mut **uop, stats, fault_id, &delta, time)?;
                        } else {
                            partial_untest_op(stats, fault_id, time);
                        }
                    }
                    break;
                }
                SolveResult::Aborted => {
                    if round == 0 {
                        abort_op(
                            db,
                            stats,
                            abort_counts,
                            opts.abort_skip_threshold,
                            fault_id,
                            time,
                        );
                    }
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Case analysis for directly observable fault sites: every fanin is a
/// primary input and an active fanout is a primary output (or the site is
/// an input/output boundary wire). Returns the detecting vector without any
/// SAT work, or None when the shape does not apply.
pub(crate) fn trivial_vector(graph: &GateGraph, fault: &Fault) -> Option<TestVector> {
    use GateKind::*;
    let node = graph.node(fault.node());
    let mut tv = TestVector::new(graph.input_count());

    let try_set = |tv: &mut TestVector, pos: usize, val: bool| -> bool {
        match tv.val(pos) {
            Val3::X => {
                tv.set(pos, val);
                true
            }
            v => v == Val3::from_bool(val),
        }
    };

    match node.kind() {
        PrimaryOutput => {
            // Both the output pin and the input pin fault of an output
            // wire activate the same way.
            let driver = graph.node(node.fanins()[0]);
            if !driver.is_input() {
                return None;
            }
            if try_set(&mut tv, driver.input_id(), !fault.val()) {
                Some(tv)
            } else {
                None
            }
        }
        PrimaryInput => {
            let observed = node
                .active_fanouts()
                .iter()
                .any(|&fo| graph.node(fo).is_output());
            if !observed {
                return None;
            }
            if try_set(&mut tv, node.input_id(), !fault.val()) {
                Some(tv)
            } else {
                None
            }
        }
        _ => {
            let observed = node
                .active_fanouts()
                .iter()
                .any(|&fo| graph.node(fo).is_output());
            if !observed || !node.fanins().iter().all(|&f| graph.node(f).is_input()) {
                return None;
            }
            let kind = node.kind();
            let pins: Vec<usize> = node
                .fanins()
                .iter()
                .map(|&f| graph.node(f).input_id())
                .collect();

            match fault.site() {
                FaultSite::Input(pos) => {
                    // Activate the pin, hold the others non-controlling.
                    if !try_set(&mut tv, pins[pos], !fault.val()) {
                        return None;
                    }
                    for (i, &pin) in pins.iter().enumerate() {
                        if i == pos {
                            continue;
                        }
                        let side = match kind.nval() {
                            Val3::X => false, // xor family: any fixed value
                            v => v.to_bool().unwrap(),
                        };
                        if !try_set(&mut tv, pin, side) {
                            return None;
                        }
                    }
                    Some(tv)
                }
                FaultSite::Output => {
                    // Drive the good output to the opposite of the stuck
                    // value.
                    let want = !fault.val();
                    match kind {
                        Buf => {
                            try_set(&mut tv, pins[0], want).then(|| tv)
                        }
                        Not => try_set(&mut tv, pins[0], !want).then(|| tv),
                        And | Nand | Or | Nor => {
                            let c = kind.cval().to_bool().unwrap();
                            let controlled = c ^ kind.is_negated();
                            if want == controlled {
                                if try_set(&mut tv, pins[0], c) {
                                    Some(tv)
                                } else {
                                    None
                                }
                            } else {
                                let n = kind.nval().to_bool().unwrap();
                                for &pin in &pins {
                                    if !try_set(&mut tv, pin, n) {
                                        return None;
                                    }
                                }
                                Some(tv)
                            }
                        }
                        Xor | Xnor => {
                            let first = want ^ (kind == Xnor);
                            if !try_set(&mut tv, pins[0], first) {
                                return None;
                            }
                            for &pin in &pins[1..] {
                                if !try_set(&mut tv, pin, false) {
                                    return None;
                                }
                            }
                            Some(tv)
                        }
                        _ => None,
                    }
                }
            }
        }
    }
}
