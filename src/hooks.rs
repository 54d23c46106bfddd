//! Per-outcome hook protocol.
//!
//! The driver invokes one detect hook per generated vector and one untest
//! hook per proven-untestable fault, in SAT-outcome order. Hooks hold no
//! ownership: the fault database is lent to each callback. All built-ins
//! are idempotent on identical `(fault, vector)` pairs.

use crate::error::HookError;
use crate::fault::{FaultDb, FaultId, FaultStatus};
use crate::testvec::TestVector;
use rustc_hash::FxHashMap;
use strum_macros::{Display, EnumString};

/// External fault simulator collaborator: which faults does this vector
/// detect?
pub trait FaultSim {
    fn detects(&mut self, tv: &TestVector) -> Vec<FaultId>;
}

pub trait DetectHook {
    fn detected(
        &mut self,
        db: &mut FaultDb,
        fault: FaultId,
        tv: &TestVector,
    ) -> Result<(), HookError>;
}

pub trait UntestHook {
    fn untestable(&mut self, db: &mut FaultDb, fault: FaultId) -> Result<(), HookError>;
}

/// Selector tag for [make_detect_hook].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum DetectHookKind {
    Base,
    TvList,
    Drop,
    Verify,
}

/// Selector tag for [make_untest_hook].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum UntestHookKind {
    Base,
    Skip,
}

/// String-tag factory for detect hooks. `Drop` and `Verify` need a fault
/// simulator; asking for them without one is an error.
pub fn make_detect_hook(
    kind: DetectHookKind,
    sim: Option<Box<dyn FaultSim>>,
) -> Result<Box<dyn DetectHook>, HookError> {
    match kind {
        DetectHookKind::Base => Ok(Box::new(DopBase::new())),
        DetectHookKind::TvList => Ok(Box::new(DopTvList::new())),
        DetectHookKind::Drop => match sim {
            Some(sim) => Ok(Box::new(DopDrop::new(sim))),
            None => Err(HookError::MissingSim("drop")),
        },
        DetectHookKind::Verify => match sim {
            Some(sim) => Ok(Box::new(DopVerify::new(sim))),
            None => Err(HookError::MissingSim("verify")),
        },
    }
}

/// String-tag factory for untest hooks. `threshold` only matters for
/// `Skip`.
pub fn make_untest_hook(kind: UntestHookKind, threshold: u32) -> Box<dyn UntestHook> {
    match kind {
        UntestHookKind::Base => Box::new(UopBase::new()),
        UntestHookKind::Skip => Box::new(UopSkip::new(threshold)),
    }
}

/// Counts detections.
#[derive(Debug, Default)]
pub struct DopBase {
    count: u64,
}

impl DopBase {
    pub fn new() -> DopBase {
        Default::default()
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl DetectHook for DopBase {
    fn detected(
        &mut self,
        _db: &mut FaultDb,
        _fault: FaultId,
        _tv: &TestVector,
    ) -> Result<(), HookError> {
        self.count += 1;
        Ok(())
    }
}

/// Collects every generated vector.
#[derive(Debug, Default)]
pub struct DopTvList {
    vectors: Vec<(FaultId, TestVector)>,
}

impl DopTvList {
    pub fn new() -> DopTvList {
        Default::default()
    }

    pub fn vectors(&self) -> &[(FaultId, TestVector)] {
        &self.vectors
    }

    pub fn into_vectors(self) -> Vec<(FaultId, TestVector)> {
        self.vectors
    }
}

impl DetectHook for DopTvList {
    fn detected(
        &mut self,
        _db: &mut FaultDb,
        fault: FaultId,
        tv: &TestVector,
    ) -> Result<(), HookError> {
        if self.vectors.last() != Some(&(fault, tv.clone())) {
            self.vectors.push((fault, tv.clone()));
        }
        Ok(())
    }
}

/// Forwards each vector to the fault simulator and retires every other
/// fault it happens to detect.
pub struct DopDrop {
    sim: Box<dyn FaultSim>,
    dropped: u64,
}

impl DopDrop {
    pub fn new(sim: Box<dyn FaultSim>) -> DopDrop {
        DopDrop { sim, dropped: 0 }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl DetectHook for DopDrop {
    fn detected(
        &mut self,
        db: &mut FaultDb,
        fault: FaultId,
        tv: &TestVector,
    ) -> Result<(), HookError> {
        for hit in self.sim.detects(tv) {
            if hit != fault && db.status(hit) == FaultStatus::Undetected {
                db.set_status(hit, FaultStatus::Detected);
                self.dropped += 1;
            }
        }
        Ok(())
    }
}

/// Re-simulates each vector and fails the run if it does not actually
/// detect its fault.
pub struct DopVerify {
    sim: Box<dyn FaultSim>,
}

impl DopVerify {
    pub fn new(sim: Box<dyn FaultSim>) -> DopVerify {
        DopVerify { sim }
    }
}

impl DetectHook for DopVerify {
    fn detected(
        &mut self,
        _db: &mut FaultDb,
        fault: FaultId,
        tv: &TestVector,
    ) -> Result<(), HookError> {
        if self.sim.detects(tv).contains(&fault) {
            Ok(())
        } else {
            Err(HookError::VerifyFailed { fault: fault.idx })
        }
    }
}

/// Counts untestable verdicts.
#[derive(Debug, Default)]
pub struct UopBase {
    count: u64,
}

impl UopBase {
    pub fn new() -> UopBase {
        Default::default()
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl UntestHook for UopBase {
    fn untestable(&mut self, _db: &mut FaultDb, _fault: FaultId) -> Result<(), HookError> {
        self.count += 1;
        Ok(())
    }
}

/// Tracks per-fault untestable verdicts and marks a fault Skipped once they
/// pass the threshold, suppressing retries in later passes.
///
/// The counts survive [FaultDb::update] sweeps; they only reset through
/// [UopSkip::clear].
pub struct UopSkip {
    threshold: u32,
    counts: FxHashMap<FaultId, u32>,
    skipped: Vec<FaultId>,
}

impl UopSkip {
    pub fn new(threshold: u32) -> UopSkip {
        UopSkip {
            threshold: threshold.max(1),
            counts: FxHashMap::default(),
            skipped: Vec::new(),
        }
    }

    pub fn skipped(&self) -> &[FaultId] {
        &self.skipped
    }

    /// Forgets all counts and lifts the skip marks.
    pub fn clear(&mut self, db: &mut FaultDb) {
        self.counts.clear();
        self.skipped.clear();
        db.clear_skips();
    }
}

impl UntestHook for UopSkip {
    fn untestable(&mut self, db: &mut FaultDb, fault: FaultId) -> Result<(), HookError> {
        let count = self.counts.entry(fault).or_insert(0);
        *count += 1;
        if *count >= self.threshold && !db.fault(fault).is_skip() {
            db.set_skip(fault);
            self.skipped.push(fault);
        }
        Ok(())
    }
}

/// Reference fault simulator: re-evaluates every fault against each vector.
///
/// Quadratic and oblivious, good enough for the verify hook on small
/// designs and for tests; production runs plug a real simulator into
/// [FaultSim] instead.
pub struct ExhaustiveSim {
    graph: crate::graph::GateGraph,
    faults: Vec<(FaultId, crate::graph::NodeId, Option<usize>, bool)>,
}

impl ExhaustiveSim {
    pub fn new(graph: &crate::graph::GateGraph, db: &FaultDb) -> ExhaustiveSim {
        use crate::fault::FaultSite;
        let faults = db
            .faults()
            .map(|f| {
                let pin = match f.site() {
                    FaultSite::Output => None,
                    FaultSite::Input(p) => Some(p),
                };
                (f.id(), f.node(), pin, f.val())
            })
            .collect();
        ExhaustiveSim {
            graph: graph.clone(),
            faults,
        }
    }
}

impl FaultSim for ExhaustiveSim {
    fn detects(&mut self, tv: &TestVector) -> Vec<FaultId> {
        let good = self.graph.eval_good(tv);
        self.faults
            .iter()
            .filter(|&&(_, node, pin, val)| {
                let bad = self.graph.eval_faulty(tv, (node, pin, val));
                good.iter()
                    .zip(bad.iter())
                    .any(|(g, b)| g.is_fixed() && b.is_fixed() && g != b)
            })
            .map(|&(id, ..)| id)
            .collect()
    }
}
