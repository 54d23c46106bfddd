//! Output-at-a-time engines: the cone's outputs are attacked in ascending
//! TFI-size order, the CNF grows incrementally per output, and Unsat on a
//! non-final output is only a partial verdict. A fault is terminally
//! untestable when every output of its cone refuses, detected as soon as
//! one accepts.

use super::{
    abort_op, detect_op, eligible, partial_untest_op, timed_solve, untest_op, Dtpg, PoPartition,
};
use crate::cnf::{CnfBuilder, Space, VarMap};
use crate::error::{CnfError, RunError};
use crate::fault::{FaultId, FaultStatus};
use crate::graph::{GateGraph, NodeId};
use crate::sat::{Lit, SatSolver, SolveResult};
use std::time::Instant;

/// Per-output incremental emission state: 0 = not emitted yet, otherwise
/// 1 + the index of the output pass that brought the node in.
struct EmitMarks {
    marks: Vec<u32>,
}

impl EmitMarks {
    fn new(max_id: usize) -> EmitMarks {
        EmitMarks {
            marks: vec![0; max_id],
        }
    }

    fn emitted(&self, id: NodeId) -> bool {
        self.marks[id.idx] != 0
    }

    fn mark(&mut self, id: NodeId, pass: usize) {
        self.marks[id.idx] = pass as u32 + 1;
    }

    fn in_pass(&self, id: NodeId, pass: usize) -> bool {
        self.marks[id.idx] == pass as u32 + 1
    }
}

impl Dtpg<'_> {
    /// Single-fault, one output cone at a time up to `threshold` outputs,
    /// then a catch-all pass over everything left.
    pub(crate) fn po_split_single(
        &mut self,
        fault_id: FaultId,
        threshold: usize,
    ) -> Result<(), RunError> {
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

        if !eligible(db, graph, fault_id) {
            return Ok(());
        }
        if opts.use_mandatory && terminal && imply.mandatory_for(graph, db.fault(fault_id)).is_none()
        {
            return untest_op(
                db,
                &mut **uop,
                stats,
                fault_id,
                &Default::default(),
                Default::default(),
            );
        }

        let fnode = db.fault(fault_id).node();
        cone.mark(graph, &[fnode]);
        let olist: Vec<NodeId> = cone.outputs().to_vec();
        let no = olist.len();
        if no == 0 {
            return Ok(());
        }
        let th = threshold.max(1).min(no);

        let mut solver = (solver_factory)();
        solver.set_budget(opts.budget);
        let mut vars = VarMap::new(graph.max_node_id());
        vars.assign_cone(solver.as_mut(), cone);
        let mut emit = EmitMarks::new(graph.max_node_id());

        let mut model = Vec::new();
        let mut resolved = false;
        let mut clean = true;
        let mut fault_remain = false;

        for opos in 0..th {
            let onode = olist[opos];
            let oid = graph.node(onode).output_id();

            let cnf_start = Instant::now();
            {
                let fault = db.fault(fault_id);
                let mut cnf = CnfBuilder::new(solver.as_mut(), &mut vars);
                for &id in cone.nodes() {
                    if graph.in_tfi_of(id, oid) && !emit.emitted(id) {
                        emit.mark(id, opos);
                        cnf.make_node_cnf(graph, id, Space::Good)?;
                    }
                }
                for &id in cone.tfo() {
                    if !emit.in_pass(id, opos) {
                        continue;
                    }
                    if id == fnode {
                        cnf.make_fault_cnf(graph, fault)?;
                    } else {
                        cnf.make_node_cnf(graph, id, Space::Faulty)?;
                    }
                    cnf.make_dchain_cnf(graph, id, id == fnode)?;
                }
                if opos == 0 {
                    // The discrepancy leaves the site in every pass.
                    cnf.make_sensitization_cnf(graph, fnode, false)?;
                    cnf.make_activation_cnf(graph, fault)?;
                }
            }
            stats.cnf_count += 1;
            stats.cnf_time += cnf_start.elapsed();

            // Not-yet-emitted TFO keeps d=0; this pass's own output must
            // observe.
            let mut assumptions: Vec<Lit> = Vec::new();
            for &id in cone.tfo() {
                if !emit.emitted(id) {
                    assumptions.push(!vars.dlit(id)?);
                }
            }
            assumptions.push(vars.dlit(onode)?);

            let (result, delta, time) = timed_solve(solver.as_mut(), &assumptions, &mut model);
            stats.sat_calls += 1;
            match result {
                SolveResult::Sat => {
                    detect_op(
                        graph, db, &mut **bt, &mut **dop, stats, cone, &vars, &model, fault_id,
                        &delta, time,
                    )?;
                    resolved = true;
                }
                SolveResult::Unsat => {
                    if opos == no - 1 && clean {
                        if terminal {
                            untest_op(db, &mut **uop, stats, fault_id, &delta, time)?;
                        } else {
                            partial_untest_op(stats, fault_id, time);
                        }
                        resolved = true;
                    } else {
                        partial_untest_op(stats, fault_id, time);
                        fault_remain = true;
                    }
                }
                SolveResult::Aborted => {
                    abort_op(
                        db,
                        stats,
                        abort_counts,
                        opts.abort_skip_threshold,
                        fault_id,
                        time,
                    );
                    clean = false;
                }
            }
            if resolved {
                break;
            }
        }

        if !resolved && fault_remain {
            // Catch-all pass over everything the threshold skipped, with
            // full observability.
            let cnf_start = Instant::now();
            {
                let fault = db.fault(fault_id);
                let mut cnf = CnfBuilder::new(solver.as_mut(), &mut vars);
                for &id in cone.nodes() {
                    if !emit.emitted(id) {
                        cnf.make_node_cnf(graph, id, Space::Good)?;
                    }
                }
                for &id in cone.tfo() {
                    if !emit.emitted(id) {
                        if id == fnode {
                            cnf.make_fault_cnf(graph, fault)?;
                        } else {
                            cnf.make_node_cnf(graph, id, Space::Faulty)?;
                        }
                        cnf.make_dchain_cnf(graph, id, id == fnode)?;
                    }
                }
                cnf.make_observation_cnf(&olist)?;
            }
            stats.cnf_count += 1;
            stats.cnf_time += cnf_start.elapsed();

            let mut assumptions: Vec<Lit> = Vec::new();
            let mut node = Some(fnode);
            while let Some(id) = node {
                assumptions.push(vars.dlit(id)?);
                if !opts.use_dominators {
                    break;
                }
                node = graph.node(id).imm_dom();
            }

            let (result, delta, time) = timed_solve(solver.as_mut(), &assumptions, &mut model);
            stats.sat_calls += 1;
            match result {
                SolveResult::Sat => {
                    detect_op(
                        graph, db, &mut **bt, &mut **dop, stats, cone, &vars, &model, fault_id,
                        &delta, time,
                    )?;
                }
                SolveResult::Unsat => {
                    if clean {
                        if terminal {
                            untest_op(db, &mut **uop, stats, fault_id, &delta, time)?;
                        } else {
                            partial_untest_op(stats, fault_id, time);
                        }
                    } else {
                        partial_untest_op(stats, fault_id, time);
                    }
                }
                SolveResult::Aborted => {
                    abort_op(
                        db,
                        stats,
                        abort_counts,
                        opts.abort_skip_threshold,
                        fault_id,
                        time,
                    );
                }
            }
        }
        Ok(())
    }

    /// The FFR group engine with per-output incremental CNF: activation
    /// variables as in [Dtpg::run_group], the observation clause emitted up
    /// front and narrowed through d=0 assumptions on not-yet-built nodes.
    pub(crate) fn po_split_multi(
        &mut self,
        faults: &[FaultId],
        threshold: usize,
    ) -> Result<(), RunError> {
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
        let olist: Vec<NodeId> = cone.outputs().to_vec();
        let no = olist.len();
        if no == 0 {
            return Ok(());
        }
        let th = threshold.max(1).min(no);

        let mut solver = (solver_factory)();
        solver.set_budget(opts.budget);
        let mut vars = VarMap::new(graph.max_node_id());
        vars.assign_cone(solver.as_mut(), cone);
        for &fid in &targets {
            vars.register_fault_act(solver.as_mut(), db.fault(fid));
        }
        {
            let mut cnf = CnfBuilder::new(solver.as_mut(), &mut vars);
            cnf.make_observation_cnf(cone.outputs())?;
        }
        let mut emit = EmitMarks::new(graph.max_node_id());

        let mut fwd_mark = vec![false; graph.max_node_id()];
        let mut fwd_touched: Vec<NodeId> = Vec::new();
        let mut clean = vec![true; targets.len()];
        let mut model = Vec::new();
        let mut faults_remain = false;

        for opos in 0..th {
            let onode = olist[opos];
            let oid = graph.node(onode).output_id();

            let cnf_start = Instant::now();
            {
                let mut cnf = CnfBuilder::new(solver.as_mut(), &mut vars);
                for &id in cone.nodes() {
                    if graph.in_tfi_of(id, oid) && !emit.emitted(id) {
                        emit.mark(id, opos);
                        cnf.make_node_cnf(graph, id, Space::Good)?;
                    }
                }
                for &id in cone.tfo() {
                    if !emit.in_pass(id, opos) {
                        continue;
                    }
                    if cnf.node_has_acts(id) {
                        cnf.make_faulty_node_cnf(graph, id)?;
                    } else {
                        cnf.make_node_cnf(graph, id, Space::Faulty)?;
                    }
                    cnf.make_dchain_cnf(graph, id, false)?;
                }
            }
            stats.cnf_count += 1;
            stats.cnf_time += cnf_start.elapsed();

            faults_remain = false;
            for (ti, &fid) in targets.iter().enumerate() {
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
                mask_outside_fwd_cone(
                    graph,
                    cone.tfo(),
                    fnode,
                    &vars,
                    &mut fwd_mark,
                    &mut fwd_touched,
                    &mut assumptions,
                )?;
                for &id in cone.tfo() {
                    if !emit.emitted(id) {
                        assumptions.push(!vars.dlit(id)?);
                    }
                }
                let mut node = Some(fnode);
                while let Some(id) = node {
                    assumptions.push(vars.dlit(id)?);
                    if !opts.use_dominators {
                        break;
                    }
                    node = graph.node(id).imm_dom();
                }
                let fault = db.fault(fid);
                if fault.is_input_fault() {
                    let src = fault.source_node(graph);
                    assumptions.push(Lit::with_value(vars.gvar(src)?, !fault.val()));
                }

                let (result, delta, time) =
                    timed_solve(solver.as_mut(), &assumptions, &mut model);
                stats.sat_calls += 1;
                match result {
                    SolveResult::Sat => {
                        detect_op(
                            graph, db, &mut **bt, &mut **dop, stats, cone, &vars, &model, fid,
                            &delta, time,
                        )?;
                    }
                    SolveResult::Unsat => {
                        if opos == no - 1 && clean[ti] {
                            if terminal {
                                untest_op(db, &mut **uop, stats, fid, &delta, time)?;
                            } else {
                                partial_untest_op(stats, fid, time);
                            }
                        } else {
                            partial_untest_op(stats, fid, time);
                            faults_remain = true;
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
                        clean[ti] = false;
                    }
                }
            }
            if !faults_remain && opos + 1 < th {
                // Everyone is resolved or aborted; no point widening.
                let open = targets
                    .iter()
                    .any(|&fid| db.status(fid) == FaultStatus::Undetected);
                if !open {
                    break;
                }
            }
        }

        if faults_remain {
            let cnf_start = Instant::now();
            {
                let mut cnf = CnfBuilder::new(solver.as_mut(), &mut vars);
                for &id in cone.nodes() {
                    if !emit.emitted(id) {
                        cnf.make_node_cnf(graph, id, Space::Good)?;
                    }
                }
                for &id in cone.tfo() {
                    if !emit.emitted(id) {
                        if cnf.node_has_acts(id) {
                            cnf.make_faulty_node_cnf(graph, id)?;
                        } else {
                            cnf.make_node_cnf(graph, id, Space::Faulty)?;
                        }
                        cnf.make_dchain_cnf(graph, id, false)?;
                    }
                }
            }
            stats.cnf_count += 1;
            stats.cnf_time += cnf_start.elapsed();

            for (ti, &fid) in targets.iter().enumerate() {
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
                mask_outside_fwd_cone(
                    graph,
                    cone.tfo(),
                    fnode,
                    &vars,
                    &mut fwd_mark,
                    &mut fwd_touched,
                    &mut assumptions,
                )?;
                let mut node = Some(fnode);
                while let Some(id) = node {
                    assumptions.push(vars.dlit(id)?);
                    if !opts.use_dominators {
                        break;
                    }
                    node = graph.node(id).imm_dom();
                }
                let fault = db.fault(fid);
                if fault.is_input_fault() {
                    let src = fault.source_node(graph);
                    assumptions.push(Lit::with_value(vars.gvar(src)?, !fault.val()));
                }

                let (result, delta, time) =
                    timed_solve(solver.as_mut(), &assumptions, &mut model);
                stats.sat_calls += 1;
                match result {
                    SolveResult::Sat => {
                        detect_op(
                            graph, db, &mut **bt, &mut **dop, stats, cone, &vars, &model, fid,
                            &delta, time,
                        )?;
                    }
                    SolveResult::Unsat => {
                        if clean[ti] {
                            if terminal {
                                untest_op(db, &mut **uop, stats, fid, &delta, time)?;
                            } else {
                                partial_untest_op(stats, fid, time);
                            }
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
        }
        Ok(())
    }
}

/// Assumes d=0 on every TFO node outside the fault node's forward cone,
/// shrinking the search to paths the fault can actually drive.
fn mask_outside_fwd_cone(
    graph: &GateGraph,
    tfo: &[NodeId],
    fnode: NodeId,
    vars: &VarMap,
    fwd_mark: &mut [bool],
    fwd_touched: &mut Vec<NodeId>,
    assumptions: &mut Vec<Lit>,
) -> Result<(), CnfError> {
    let mut stack = vec![fnode];
    while let Some(id) = stack.pop() {
        if fwd_mark[id.idx] {
            continue;
        }
        fwd_mark[id.idx] = true;
        fwd_touched.push(id);
        stack.extend_from_slice(graph.node(id).active_fanouts());
    }
    for &id in tfo {
        if !fwd_mark[id.idx] {
            assumptions.push(!vars.dlit(id)?);
        }
    }
    for &id in fwd_touched.iter() {
        fwd_mark[id.idx] = false;
    }
    fwd_touched.clear();
    Ok(())
}
