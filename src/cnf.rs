//! CNF emission over a per-cone variable map.
//!
//! Every cone node gets a good-circuit variable `g`; TFO nodes additionally
//! get a faulty-circuit variable `f` and a discrepancy variable
//! `d = g XOR f` (outside the TFO, `f` aliases `g`). Multi-fault engines
//! attach one activation variable per targeted fault to its site; the
//! injection clauses are gated on it.
//!
//! Emission order is fixed everywhere, so identical inputs produce
//! identical clause sequences.

use crate::cone::Cone;
use crate::error::CnfError;
use crate::fault::{Fault, FaultId, FaultSite};
use crate::graph::{GateGraph, GateKind, NodeId, Val3};
use crate::sat::{Lit, SatSolver, VarId};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Which circuit copy a clause talks about.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Space {
    Good,
    Faulty,
}

/// Partial map from node ids to SAT variables, plus the per-fault
/// activation variables of the multi engines.
#[derive(Debug)]
pub struct VarMap {
    gvar: Vec<Option<VarId>>,
    fvar: Vec<Option<VarId>>,
    dvar: Vec<Option<VarId>>,
    act_out: FxHashMap<(usize, bool), VarId>,
    act_in: FxHashMap<(usize, usize, bool), VarId>,
    // Activation variables per node in registration order, for the
    // deterministic d-chain clause.
    acts_by_node: FxHashMap<usize, SmallVec<[VarId; 4]>>,
    act_by_fault: FxHashMap<FaultId, VarId>,
}

impl VarMap {
    pub fn new(max_id: usize) -> VarMap {
        VarMap {
            gvar: vec![None; max_id],
            fvar: vec![None; max_id],
            dvar: vec![None; max_id],
            act_out: FxHashMap::default(),
            act_in: FxHashMap::default(),
            acts_by_node: FxHashMap::default(),
            act_by_fault: FxHashMap::default(),
        }
    }

    /// Standard allocation: `g` for every cone node, fresh `f` and `d` for
    /// TFO nodes only.
    pub fn assign_cone(&mut self, solver: &mut dyn SatSolver, cone: &Cone) {
        for &id in cone.nodes() {
            self.gvar[id.idx] = Some(solver.new_var());
        }
        for &id in cone.tfo() {
            self.fvar[id.idx] = Some(solver.new_var());
            self.dvar[id.idx] = Some(solver.new_var());
        }
    }

    /// Allocates the activation variable gating `fault`'s injection.
    pub fn register_fault_act(&mut self, solver: &mut dyn SatSolver, fault: &Fault) -> VarId {
        let var = solver.new_var();
        let node = fault.node().idx;
        match fault.site() {
            FaultSite::Output => {
                self.act_out.insert((node, fault.val()), var);
            }
            FaultSite::Input(pos) => {
                self.act_in.insert((node, pos, fault.val()), var);
            }
        }
        self.acts_by_node.entry(node).or_default().push(var);
        self.act_by_fault.insert(fault.id(), var);
        var
    }

    pub fn act_var(&self, fault: FaultId) -> Option<VarId> {
        self.act_by_fault.get(&fault).copied()
    }

    pub fn registered_faults(&self) -> usize {
        self.act_by_fault.len()
    }

    fn var(
        vars: &[Option<VarId>],
        id: NodeId,
        space: &'static str,
    ) -> Result<VarId, CnfError> {
        vars[id.idx].ok_or(CnfError::MissingVar {
            node: id.idx,
            space,
        })
    }

    pub fn gvar(&self, id: NodeId) -> Result<VarId, CnfError> {
        Self::var(&self.gvar, id, "good")
    }

    /// Faulty-space variable: the fresh one inside the TFO, the aliased
    /// good variable outside.
    pub fn fvar(&self, id: NodeId) -> Result<VarId, CnfError> {
        match self.fvar[id.idx] {
            Some(v) => Ok(v),
            None => Self::var(&self.gvar, id, "faulty"),
        }
    }

    pub fn dvar(&self, id: NodeId) -> Result<VarId, CnfError> {
        Self::var(&self.dvar, id, "dchain")
    }

    pub fn glit(&self, id: NodeId) -> Result<Lit, CnfError> {
        self.gvar(id).map(Lit::pos)
    }

    pub fn flit(&self, id: NodeId) -> Result<Lit, CnfError> {
        self.fvar(id).map(Lit::pos)
    }

    pub fn dlit(&self, id: NodeId) -> Result<Lit, CnfError> {
        self.dvar(id).map(Lit::pos)
    }

    /// True when the node carries a discrepancy variable of its own.
    pub fn has_fvar(&self, id: NodeId) -> bool {
        self.fvar[id.idx].is_some()
    }

    pub fn has_acts(&self, id: NodeId) -> bool {
        self.acts_by_node.contains_key(&id.idx)
    }

    fn act_lits(&self, id: NodeId, out: &mut Vec<Lit>) {
        if let Some(acts) = self.acts_by_node.get(&id.idx) {
            out.extend(acts.iter().map(|&v| Lit::pos(v)));
        }
    }

    fn out_act(&self, id: NodeId, val: bool) -> Option<VarId> {
        self.act_out.get(&(id.idx, val)).copied()
    }

    fn in_act(&self, id: NodeId, pos: usize, val: bool) -> Option<VarId> {
        self.act_in.get(&(id.idx, pos, val)).copied()
    }
}

/// Read-only projection of a SAT model onto node values.
pub struct ModelVals<'a> {
    model: &'a [bool],
    vars: &'a VarMap,
}

impl<'a> ModelVals<'a> {
    pub fn new(model: &'a [bool], vars: &'a VarMap) -> ModelVals<'a> {
        ModelVals { model, vars }
    }

    fn read(&self, var: Option<VarId>) -> Option<bool> {
        var.and_then(|v| self.model.get(v.idx as usize).copied())
    }

    /// Good-circuit value, None outside the cone.
    pub fn gval(&self, id: NodeId) -> Option<bool> {
        self.read(self.vars.gvar[id.idx])
    }

    /// Faulty-circuit value; aliases the good value outside the TFO.
    pub fn fval(&self, id: NodeId) -> Option<bool> {
        self.read(self.vars.fvar[id.idx])
            .or_else(|| self.gval(id))
    }

    /// Discrepancy value; false wherever no d variable exists.
    pub fn dval(&self, id: NodeId) -> bool {
        self.read(self.vars.dvar[id.idx]).unwrap_or(false)
    }
}

/// Emits gate, fault-injection and d-chain clauses into a solver.
pub struct CnfBuilder<'a> {
    solver: &'a mut dyn SatSolver,
    vars: &'a mut VarMap,
    clauses: u64,
}

impl<'a> CnfBuilder<'a> {
    pub fn new(solver: &'a mut dyn SatSolver, vars: &'a mut VarMap) -> CnfBuilder<'a> {
        CnfBuilder {
            solver,
            vars,
            clauses: 0,
        }
    }

    pub fn emitted_clauses(&self) -> u64 {
        self.clauses
    }

    /// Whether any activation variable is attached to this node.
    pub fn node_has_acts(&self, id: NodeId) -> bool {
        self.vars.has_acts(id)
    }

    fn add(&mut self, lits: &[Lit]) {
        self.solver.add_clause(lits);
        self.clauses += 1;
    }

    fn lit(&self, space: Space, id: NodeId) -> Result<Lit, CnfError> {
        match space {
            Space::Good => self.vars.glit(id),
            Space::Faulty => self.vars.flit(id),
        }
    }

    fn fanin_lits(
        &self,
        graph: &GateGraph,
        id: NodeId,
        space: Space,
    ) -> Result<SmallVec<[Lit; 4]>, CnfError> {
        graph
            .node(id)
            .fanins()
            .iter()
            .map(|&f| self.lit(space, f))
            .collect()
    }

    /// Truth-table clauses of one gate in the chosen space. Primary inputs
    /// have no clauses; primary outputs are buffers.
    pub fn make_node_cnf(
        &mut self,
        graph: &GateGraph,
        id: NodeId,
        space: Space,
    ) -> Result<(), CnfError> {
        let kind = graph.node(id).kind();
        if kind == GateKind::PrimaryInput {
            return Ok(());
        }
        let out = self.lit(space, id)?;
        let ins = self.fanin_lits(graph, id, space)?;
        self.gate_cnf(kind, out, &ins);
        Ok(())
    }

    fn gate_cnf(&mut self, kind: GateKind, out: Lit, ins: &[Lit]) {
        use GateKind::*;
        match kind {
            PrimaryInput => {}
            PrimaryOutput | Buf => {
                self.add(&[ins[0], !out]);
                self.add(&[!ins[0], out]);
            }
            Not => {
                self.add(&[ins[0], out]);
                self.add(&[!ins[0], !out]);
            }
            And | Nand | Or | Nor => {
                // One clause relating the controlled output to each input,
                // and one wide clause for the non-controlled case. The
                // narrow widths are laid out flat; the solver prefers the
                // short clauses anyway.
                let inv_ins = matches!(kind, And | Nand);
                let wide_out = match kind {
                    And | Nor => out,
                    Nand | Or => !out,
                    _ => unreachable!(),
                };
                let w = |l: Lit| if inv_ins { !l } else { l };
                match ins.len() {
                    2 => self.add(&[w(ins[0]), w(ins[1]), wide_out]),
                    3 => self.add(&[w(ins[0]), w(ins[1]), w(ins[2]), wide_out]),
                    4 => self.add(&[w(ins[0]), w(ins[1]), w(ins[2]), w(ins[3]), wide_out]),
                    _ => {
                        let mut tmp: Vec<Lit> = ins.iter().map(|&l| w(l)).collect();
                        tmp.push(wide_out);
                        self.add(&tmp);
                    }
                }
                for &i in ins {
                    let short = match kind {
                        And => [i, !out],
                        Nand => [i, out],
                        Or => [!i, out],
                        Nor => [!i, !out],
                        _ => unreachable!(),
                    };
                    self.add(&short);
                }
            }
            Xor => self.xor_cnf(out, ins, false),
            Xnor => self.xor_cnf(out, ins, true),
        }
    }

    /// `out = XOR(ins)` (or XNOR with `invert`). Width 2 is the four
    /// 3-clauses; wider gates are reduced by a pairwise chain with fresh
    /// intermediates.
    fn xor_cnf(&mut self, out: Lit, ins: &[Lit], invert: bool) {
        let o = if invert { !out } else { out };
        if ins.len() == 1 {
            self.add(&[ins[0], !o]);
            self.add(&[!ins[0], o]);
            return;
        }
        let mut acc = ins[0];
        for &next in &ins[1..ins.len() - 1] {
            let t = Lit::pos(self.solver.new_var());
            self.xor2(t, acc, next);
            acc = t;
        }
        self.xor2(o, acc, ins[ins.len() - 1]);
    }

    fn xor2(&mut self, o: Lit, a: Lit, b: Lit) {
        self.add(&[!a, !b, !o]);
        self.add(&[a, b, !o]);
        self.add(&[a, !b, o]);
        self.add(&[!a, b, o]);
    }

    /// Faulty-side clauses of the fault's own node, replacing
    /// `make_node_cnf(.., Faulty)` there.
    ///
    /// An output fault pins the faulty variable. An input fault folds the
    /// stuck pin into the gate: a controlling stuck value makes the output
    /// constant, a non-controlling one re-emits the gate at arity n-1.
    pub fn make_fault_cnf(&mut self, graph: &GateGraph, fault: &Fault) -> Result<(), CnfError> {
        use GateKind::*;
        let id = fault.node();
        let node = graph.node(id);
        let fout = self.vars.fvar(id)?;
        let pos = match fault.site() {
            FaultSite::Output => {
                self.add(&[Lit::with_value(fout, fault.val())]);
                return Ok(());
            }
            FaultSite::Input(pos) => pos,
        };

        let out = Lit::pos(fout);
        let mut rest: SmallVec<[Lit; 4]> = SmallVec::new();
        for (i, &fanin) in node.fanins().iter().enumerate() {
            if i != pos {
                rest.push(self.lit(Space::Faulty, fanin)?);
            }
        }

        match node.kind() {
            PrimaryOutput | Buf => self.add(&[Lit::with_value(fout, fault.val())]),
            Not => self.add(&[Lit::with_value(fout, !fault.val())]),
            And | Nand | Or | Nor => {
                let kind = node.kind();
                if Val3::from_bool(fault.val()) == kind.cval() {
                    // Stuck at the controlling value: constant output.
                    let const_out = match kind {
                        And | Nor => false,
                        Nand | Or => true,
                        _ => unreachable!(),
                    };
                    self.add(&[Lit::with_value(fout, const_out)]);
                } else if rest.len() == 1 {
                    let sub = match kind {
                        And | Or => Buf,
                        Nand | Nor => Not,
                        _ => unreachable!(),
                    };
                    self.gate_cnf(sub, out, &rest);
                } else {
                    self.gate_cnf(kind, out, &rest);
                }
            }
            Xor | Xnor => {
                // A constant input folds into the output polarity.
                let invert = (node.kind() == Xnor) ^ fault.val();
                self.xor_cnf(out, &rest, invert);
            }
            PrimaryInput => unreachable!("primary inputs have no input pins"),
        }
        Ok(())
    }

    /// Faulty-side clauses for a node that carries activation variables:
    /// every gated fault is spliced between the pristine pin/output signals
    /// and the gate function, so assumptions select which one is live.
    pub fn make_faulty_node_cnf(&mut self, graph: &GateGraph, id: NodeId) -> Result<(), CnfError> {
        use GateKind::*;
        let node = graph.node(id);

        let mut ins: SmallVec<[Lit; 4]> = SmallVec::new();
        for (pos, &fanin) in node.fanins().iter().enumerate() {
            let mut cur = self.lit(Space::Faulty, fanin)?;
            for &val in &[false, true] {
                if let Some(act) = self.vars.in_act(id, pos, val) {
                    let spliced = Lit::pos(self.solver.new_var());
                    self.flt_cnf(cur, Lit::pos(act), spliced, val);
                    cur = spliced;
                }
            }
            ins.push(cur);
        }

        let fout = self.vars.flit(id)?;
        let out_acts: SmallVec<[(VarId, bool); 2]> = [false, true]
            .iter()
            .filter_map(|&val| self.vars.out_act(id, val).map(|a| (a, val)))
            .collect();

        if out_acts.is_empty() {
            if node.kind() == PrimaryInput {
                // A non-targeted input site: the faulty copy follows the
                // good one.
                let g = self.vars.glit(id)?;
                self.add(&[g, !fout]);
                self.add(&[!g, fout]);
            } else {
                self.gate_cnf(node.kind(), fout, &ins);
            }
            return Ok(());
        }

        let mut cur = if node.kind() == PrimaryInput {
            self.vars.glit(id)?
        } else {
            let z = Lit::pos(self.solver.new_var());
            self.gate_cnf(node.kind(), z, &ins);
            z
        };
        let last = out_acts.len() - 1;
        for (i, &(act, val)) in out_acts.iter().enumerate() {
            let target = if i == last {
                fout
            } else {
                Lit::pos(self.solver.new_var())
            };
            self.flt_cnf(cur, Lit::pos(act), target, val);
            if i < last {
                cur = target;
            }
        }
        Ok(())
    }

    /// `out` is `sig` with a stuck-at-`val` spliced in when `act` holds:
    /// `out = sig AND NOT act` for stuck-at-0, `out = sig OR act` for
    /// stuck-at-1.
    fn flt_cnf(&mut self, sig: Lit, act: Lit, out: Lit, val: bool) {
        if val {
            self.add(&[!sig, out]);
            self.add(&[!act, out]);
            self.add(&[sig, act, !out]);
        } else {
            self.add(&[sig, !out]);
            self.add(&[!act, !out]);
            self.add(&[!sig, act, out]);
        }
    }

    /// The discrepancy coupling `d = g XOR f` plus the backward
    /// propagation-necessity clause: a discrepancy needs a discrepant fanin
    /// or a fault at this very node. `fault_root` suppresses the necessity
    /// clause where the single-fault engines inject the fault directly.
    pub fn make_dchain_cnf(
        &mut self,
        graph: &GateGraph,
        id: NodeId,
        fault_root: bool,
    ) -> Result<(), CnfError> {
        let g = self.vars.glit(id)?;
        let f = self.vars.flit(id)?;
        let d = self.vars.dlit(id)?;

        self.add(&[!g, !f, !d]);
        self.add(&[g, f, !d]);
        self.add(&[!g, f, d]);
        self.add(&[g, !f, d]);

        if fault_root {
            return Ok(());
        }
        let mut lits = vec![!d];
        self.vars.act_lits(id, &mut lits);
        for &fanin in graph.node(id).fanins() {
            if self.vars.has_fvar(fanin) {
                lits.push(self.vars.dlit(fanin)?);
            }
        }
        self.add(&lits);
        Ok(())
    }

    /// The detection condition: some cone output observes a discrepancy.
    pub fn make_observation_cnf(&mut self, outputs: &[NodeId]) -> Result<(), CnfError> {
        let lits: Vec<Lit> = outputs
            .iter()
            .map(|&po| self.vars.dlit(po))
            .collect::<Result<_, _>>()?;
        self.add(&lits);
        Ok(())
    }

    /// For an input fault, fixes the good value of the stuck pin's driver
    /// to the activating value. Output faults are activated by the d-chain
    /// alone.
    pub fn make_activation_cnf(&mut self, graph: &GateGraph, fault: &Fault) -> Result<(), CnfError> {
        if fault.is_input_fault() {
            let src = fault.source_node(graph);
            let g = self.vars.gvar(src)?;
            self.add(&[Lit::with_value(g, !fault.val())]);
        }
        Ok(())
    }

    /// Unit d clauses from the fault site along its dominator chain: every
    /// test must move the discrepancy through each dominator (unique
    /// sensitization). With `use_dominators` off only the site itself is
    /// pinned.
    pub fn make_sensitization_cnf(
        &mut self,
        graph: &GateGraph,
        from: NodeId,
        use_dominators: bool,
    ) -> Result<(), CnfError> {
        let mut node = Some(from);
        while let Some(id) = node {
            let d = self.vars.dlit(id)?;
            self.add(&[d]);
            if !use_dominators {
                break;
            }
            node = graph.node(id).imm_dom();
        }
        Ok(())
    }
}
