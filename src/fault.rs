//! Single stuck-at fault model and structural fault collapsing.
//!
//! Faults are enumerated once per netlist in reverse topological order so
//! that every fault's representative is already final when it is created:
//! the canonical member of an equivalence class is the one structurally
//! closest to a primary output.

use crate::graph::{GateGraph, GateKind, NodeId};
use smallvec::SmallVec;
use std::fmt::{self, Display, Formatter};

#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Ord, PartialOrd)]
pub struct FaultId {
    pub idx: usize,
}

impl FaultId {
    pub const fn new(idx: usize) -> FaultId {
        FaultId { idx }
    }
}

impl Display for FaultId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.idx)
    }
}

/// Where on the gate the defect sits.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum FaultSite {
    /// The output pin of the node.
    Output,
    /// Input pin `pos` of the node.
    Input(usize),
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum FaultStatus {
    Undetected,
    Detected,
    Untestable,
    Aborted,
    Skipped,
}

/// One stuck-at defect.
#[derive(Debug, Clone)]
pub struct Fault {
    id: FaultId,
    node: NodeId,
    site: FaultSite,
    val: bool,
    rep: FaultId,
    status: FaultStatus,
    skip: bool,
    // Faults this representative retires when it is detected.
    dominates: SmallVec<[FaultId; 2]>,
}

impl Fault {
    pub fn id(&self) -> FaultId {
        self.id
    }

    /// The node the fault is attached to.
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn site(&self) -> FaultSite {
        self.site
    }

    /// The stuck value.
    pub fn val(&self) -> bool {
        self.val
    }

    pub fn is_input_fault(&self) -> bool {
        matches!(self.site, FaultSite::Input(_))
    }

    /// Input pin index; panics for output faults.
    pub fn pos(&self) -> usize {
        match self.site {
            FaultSite::Input(pos) => pos,
            FaultSite::Output => panic!("output fault has no pin index"),
        }
    }

    /// The node whose signal value is disturbed: the fanin for an input
    /// fault, the fault node itself otherwise.
    pub fn source_node(&self, graph: &GateGraph) -> NodeId {
        match self.site {
            FaultSite::Output => self.node,
            FaultSite::Input(pos) => graph.node(self.node).fanins()[pos],
        }
    }

    /// The canonical fault of this fault's equivalence class.
    pub fn rep(&self) -> FaultId {
        self.rep
    }

    pub fn is_rep(&self) -> bool {
        self.rep == self.id
    }

    pub fn status(&self) -> FaultStatus {
        self.status
    }

    pub fn is_skip(&self) -> bool {
        self.skip
    }

    pub fn dominated(&self) -> &[FaultId] {
        &self.dominates
    }

    pub fn describe(&self, graph: &GateGraph) -> String {
        let v = if self.val { 1 } else { 0 };
        match self.site {
            FaultSite::Output => format!("{}:O:sa{}", graph.node(self.node).name(), v),
            FaultSite::Input(pos) => format!("{}:I{}:sa{}", graph.node(self.node).name(), pos, v),
        }
    }
}

/// Catalog of every single stuck-at fault of a netlist.
///
/// Only fault status is mutable after enumeration, and only through the
/// methods here; engines iterate [representatives](FaultDb::representatives)
/// and the remaining-work list stays deterministic across
/// [update](FaultDb::update) sweeps.
#[derive(Debug, Clone)]
pub struct FaultDb {
    faults: Vec<Fault>,
    // Per node: the two output faults, then two faults per input pin,
    // addressed [2 * pin + val].
    ofaults: Vec<[FaultId; 2]>,
    ifaults: Vec<SmallVec<[FaultId; 4]>>,
    reps: Vec<FaultId>,
    remain: Vec<FaultId>,
    detected: Vec<FaultId>,
    untestable: Vec<FaultId>,
    changed: bool,
}

// Representatives the input faults of `node` merge into, per stuck value:
// for And, an input stuck at the controlling 0 is equivalent to the output
// stuck at 0, and so on. None means no merge for that polarity.
fn input_rep_faults(
    kind: GateKind,
    f0: FaultId,
    f1: FaultId,
) -> (Option<FaultId>, Option<FaultId>) {
    use GateKind::*;
    match kind {
        PrimaryOutput | Buf => (Some(f0), Some(f1)),
        Not => (Some(f1), Some(f0)),
        And => (Some(f0), None),
        Nand => (Some(f1), None),
        Or => (None, Some(f1)),
        Nor => (None, Some(f0)),
        Xor | Xnor | PrimaryInput => (None, None),
    }
}

impl FaultDb {
    /// Enumerates and collapses all single stuck-at faults of `graph`.
    pub fn enumerate(graph: &GateGraph) -> FaultDb {
        let n = graph.len();
        let mut db = FaultDb {
            faults: Vec::new(),
            ofaults: vec![[FaultId::new(0); 2]; n],
            ifaults: vec![SmallVec::new(); n],
            reps: Vec::new(),
            remain: Vec::new(),
            detected: Vec::new(),
            untestable: Vec::new(),
            changed: false,
        };

        // Reverse topological order: when a node is processed, its fanout's
        // faults already carry final representatives.
        for idx in (0..n).rev() {
            let id = NodeId::new(idx);
            let node = graph.node(id);

            // A fanout-free wire's output faults merge into the branch pin
            // faults of its single fanout.
            let mut orep0 = None;
            let mut orep1 = None;
            if node.fanouts().len() == 1 {
                let onode = graph.node(node.fanouts()[0]);
                let ipos = onode
                    .fanins()
                    .iter()
                    .position(|&f| f == id)
                    .expect("fanout lists a node its fanins do not");
                orep0 = Some(db.ifaults[onode.id().idx][2 * ipos]);
                orep1 = Some(db.ifaults[onode.id().idx][2 * ipos + 1]);
            }

            let f0 = db.new_fault(id, FaultSite::Output, false, orep0);
            let f1 = db.new_fault(id, FaultSite::Output, true, orep1);
            db.ofaults[idx] = [f0, f1];

            let (irep0, irep1) = input_rep_faults(node.kind(), f0, f1);
            for pos in 0..node.fanins().len() {
                let i0 = db.new_fault(id, FaultSite::Input(pos), false, irep0);
                let i1 = db.new_fault(id, FaultSite::Input(pos), true, irep1);
                db.ifaults[idx].push(i0);
                db.ifaults[idx].push(i1);
            }
        }

        for f in &db.faults {
            if f.is_rep() {
                db.reps.push(f.id);
            }
        }
        db.remain = db.reps.clone();
        db
    }

    fn new_fault(
        &mut self,
        node: NodeId,
        site: FaultSite,
        val: bool,
        rep: Option<FaultId>,
    ) -> FaultId {
        let id = FaultId::new(self.faults.len());
        // Follow the merge target to its final representative.
        let rep = rep.map(|r| self.faults[r.idx].rep).unwrap_or(id);
        self.faults.push(Fault {
            id,
            node,
            site,
            val,
            rep,
            status: FaultStatus::Undetected,
            skip: false,
            dominates: SmallVec::new(),
        });
        if rep != id {
            self.faults[rep.idx].dominates.push(id);
        }
        id
    }

    pub fn len(&self) -> usize {
        self.faults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    pub fn fault(&self, id: FaultId) -> &Fault {
        &self.faults[id.idx]
    }

    pub fn faults(&self) -> impl Iterator<Item = &Fault> {
        self.faults.iter()
    }

    /// The canonical faults, one per equivalence class, in id order.
    pub fn representatives(&self) -> &[FaultId] {
        &self.reps
    }

    /// Output fault of `node` with the given stuck value.
    pub fn output_fault(&self, node: NodeId, val: bool) -> FaultId {
        self.ofaults[node.idx][val as usize]
    }

    /// Input-pin fault of `node`.
    pub fn input_fault(&self, node: NodeId, pos: usize, val: bool) -> FaultId {
        self.ifaults[node.idx][2 * pos + val as usize]
    }

    /// Every fault attached to `node`, outputs first then pins in order.
    pub fn node_faults(&self, node: NodeId) -> Vec<FaultId> {
        let mut out = vec![self.ofaults[node.idx][0], self.ofaults[node.idx][1]];
        out.extend_from_slice(&self.ifaults[node.idx]);
        out
    }

    pub fn status(&self, id: FaultId) -> FaultStatus {
        self.faults[id.idx].status
    }

    /// Status transition. Detecting a representative retires its whole
    /// equivalence class.
    pub fn set_status(&mut self, id: FaultId, status: FaultStatus) {
        self.faults[id.idx].status = status;
        self.changed = true;
        if status == FaultStatus::Detected && self.faults[id.idx].is_rep() {
            let dominated: SmallVec<[FaultId; 2]> = self.faults[id.idx].dominates.clone();
            for d in dominated {
                self.faults[d.idx].status = FaultStatus::Detected;
            }
        }
    }

    pub fn set_skip(&mut self, id: FaultId) {
        self.faults[id.idx].skip = true;
        self.faults[id.idx].status = FaultStatus::Skipped;
        self.changed = true;
    }

    /// Clears all skip hints, making the skipped faults targetable again.
    pub fn clear_skips(&mut self) {
        for f in &mut self.faults {
            if f.skip {
                f.skip = false;
                if f.status == FaultStatus::Skipped {
                    f.status = FaultStatus::Undetected;
                    if f.is_rep() {
                        self.remain.push(f.id);
                    }
                }
            }
        }
        self.remain.sort();
        self.remain.dedup();
    }

    /// The representatives still to be targeted, stable across sweeps.
    pub fn remaining(&self) -> &[FaultId] {
        &self.remain
    }

    pub fn detected_list(&self) -> &[FaultId] {
        &self.detected
    }

    pub fn untestable_list(&self) -> &[FaultId] {
        &self.untestable
    }

    /// Sweeps the remaining-work list: Detected and Untestable move to
    /// their terminal lists, Aborted is demoted back to Undetected for the
    /// next pass, Skipped entries are dropped from the sweep.
    pub fn update(&mut self) {
        if !self.changed {
            return;
        }
        let mut wpos = 0;
        for rpos in 0..self.remain.len() {
            let id = self.remain[rpos];
            match self.faults[id.idx].status {
                FaultStatus::Undetected => {
                    self.remain[wpos] = id;
                    wpos += 1;
                }
                FaultStatus::Detected => self.detected.push(id),
                FaultStatus::Untestable => self.untestable.push(id),
                FaultStatus::Aborted => {
                    self.faults[id.idx].status = FaultStatus::Undetected;
                    self.remain[wpos] = id;
                    wpos += 1;
                }
                FaultStatus::Skipped => {}
            }
        }
        self.remain.truncate(wpos);
        self.changed = false;
    }
}
