//! Shared-CNF engines: one solver per fault group, per-fault activation
//! variables, per-fault intent through assumption swaps only. Worth it when
//! CNF build cost dominates solve cost.

use super::{
    abort_op, detect_op, eligible, partial_untest_op, timed_solve, untest_op, Dtpg, PoPartition,
};
use crate::cnf::{CnfBuilder, Space, VarMap};
use crate::error::{CnfError, RunError};
use crate::fault::{FaultId, FaultStatus};
use crate::graph::{GateGraph, NodeId};
use crate::sat::{Lit, SatSolver, SolveResult};
use std::time::Instant;

impl Dtpg<'_> {
    /// Targets all `faults` (one FFR's or one MFFC's worth) against a
    /// single shared CNF.
    pub(crate) fn run_group(&mut self, faults: &[FaultId]) -> Result<(), RunError> {
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
        let terminal = opts.po_partition == PoPartition::None;

        // Cheap untestability proofs first; survivors become SAT targets.
        let mut targets: Vec<FaultId> = Vec::new();
        for &fid in faults {
            if !eligible(db, graph, fid) {
                continue;
            }
            if opts.use_mandatory
                && terminal
                && imply.mandatory_for(graph, db.fault(fid)).is_none()
            {
                untest_op(
                    db,
                    &mut **uop,
                    stats,
                    fid,
                    &Default::default(),
                    Default::default(),
                )?;
                continue;
            }
            targets.push(fid);
        }
        if targets.is_empty() {
            return Ok(());
        }

        let mut roots: Vec<NodeId> = Vec::new();
        for &fid in &targets {
            let node = db.fault(fid).node();
            if !roots.contains(&node) {
                roots.push(node);
            }
        }
        cone.mark(graph, &roots);
        if cone.outputs().is_empty() {
            return Ok(());
        }
        tracing::debug!(
            faults = targets.len(),
            cone = cone.nodes().len(),
            "group cnf"
        );

        let cnf_start = Instant::now();
        let mut solver = (solver_factory)();
        solver.set_budget(opts.budget);
        let mut vars = VarMap::new(graph.max_node_id());
        vars.assign_cone(solver.as_mut(), cone);
        for &fid in &targets {
            vars.register_fault_act(solver.as_mut(), db.fault(fid));
        }
        {
            let mut cnf = CnfBuilder::new(solver.as_mut(), &mut vars);
            for &id in cone.nodes() {
                cnf.make_node_cnf(graph, id, Space::Good)?;
            }
            for &id in cone.tfo() {
                if cnf.node_has_acts(id) {
                    cnf.make_faulty_node_cnf(graph, id)?;
                } else {
                    cnf.make_node_cnf(graph, id, Space::Faulty)?;
                }
                cnf.make_dchain_cnf(graph, id, false)?;
            }
            cnf.make_observation_cnf(cone.outputs())?;
        }
        stats.cnf_count += 1;
        stats.cnf_time += cnf_start.elapsed();

        let mut fwd_mark = vec![false; graph.max_node_id()];
        let mut fwd_touched: Vec<NodeId> = Vec::new();
        let mut model = Vec::new();

        for &fid in &targets {
            // A drop hook may have retired this fault meanwhile.
            if db.status(fid) != FaultStatus::Undetected || db.fault(fid).is_skip() {
                continue;
            }

            let fnode = db.fault(fid).node();
            let mut assumptions: Vec<Lit> = Vec::new();
            for &other in &targets {
                let act = vars.act_var(other).ok_or(CnfError::MissingVar {
                    node: db.fault(other).node().idx,
                    space: "activation",
                })?;
                assumptions.push(Lit::with_value(act, other == fid));
            }

            // Zero the discrepancy outside the target's forward cone.
            let mut stack = vec![fnode];
            while let Some(id) = stack.pop() {
                if fwd_mark[id.idx] {
                    continue;
                }
                fwd_mark[id.idx] = true;
                fwd_touched.push(id);
                stack.extend_from_slice(graph.node(id).active_fanouts());
            }
            for &id in cone.tfo() {
                if !fwd_mark[id.idx] {
                    assumptions.push(!vars.dlit(id)?);
                }
            }
            for &id in &fwd_touched {
                fwd_mark[id.idx] = false;
            }
            fwd_touched.clear();

            // Unique sensitization along the dominator chain.
            let mut node = Some(fnode);
            while let Some(id) = node {
                assumptions.push(vars.dlit(id)?);
                if !opts.use_dominators {
                    break;
                }
                node = graph.node(id).imm_dom();
            }

            // Input faults also need their pin's driver at the activating
            // value in the good circuit.
            let fault = db.fault(fid);
            if fault.is_input_fault() {
                let src = fault.source_node(graph);
                assumptions.push(Lit::with_value(vars.gvar(src)?, !fault.val()));
            }

            let (result, delta, time) = timed_solve(solver.as_mut(), &assumptions, &mut model);
            stats.sat_calls += 1;
            match result {
                SolveResult::Sat => {
                    detect_op(
                        graph, db, &mut **bt, &mut **dop, stats, cone, &vars, &model, fid, &delta,
                        time,
                    )?;
                }
                SolveResult::Unsat => {
                    if terminal {
                        untest_op(db, &mut **uop, stats, fid, &delta, time)?;
                    } else {
                        partial_untest_op(stats, fid, time);
                    }
                }
                SolveResult::Aborted => {
                    abort_op(
                        db,
                        stats,
                        abort_counts,
                        opts.abort_skip_threshold,
                        fid,
                        time,
                    );
                }
            }
        }
        Ok(())
    }
}
