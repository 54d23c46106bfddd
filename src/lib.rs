//! SAT-based deterministic test pattern generation for combinational
//! logic.
//!
//! Given a gate-level netlist, `patgen` derives input vectors that excite
//! each single stuck-at fault and propagate its effect to an observable
//! output. The pipeline: build a [GateGraph](graph::GateGraph), enumerate
//! and collapse faults into a [FaultDb](fault::FaultDb), then let a
//! [Dtpg](engine::Dtpg) driver solve one CNF problem per fault (or fault
//! group) and turn each satisfying assignment into a three-valued
//! [TestVector](testvec::TestVector).
//!
//! ```
//! use patgen::backtrace::{make_backtracer, BackTracerKind};
//! use patgen::engine::{Dtpg, EngineOptions};
//! use patgen::fault::FaultDb;
//! use patgen::graph::NetlistBuilder;
//! use patgen::hooks::{DopTvList, UopBase};
//!
//! let mut b = NetlistBuilder::new();
//! b.input("in0");
//! b.input("in1");
//! b.and("y", &["in0", "in1"]);
//! b.output("out", "y");
//! let mut graph = b.build().unwrap();
//!
//! let mut db = FaultDb::enumerate(&graph);
//! let mut bt = make_backtracer(BackTracerKind::Just1, graph.max_node_id());
//! let mut dop = DopTvList::new();
//! let mut uop = UopBase::new();
//! let mut dtpg = Dtpg::new(
//!     &mut graph,
//!     &mut db,
//!     bt.as_mut(),
//!     &mut dop,
//!     &mut uop,
//!     EngineOptions::default(),
//! );
//! dtpg.run().unwrap();
//! assert!(!dop.vectors().is_empty());
//! ```

#[macro_use]
pub mod graph;
pub mod backtrace;
pub mod cnf;
pub mod cone;
pub mod engine;
pub mod error;
pub mod fault;
pub mod hooks;
pub mod imply;
pub mod sat;
pub mod testvec;

pub use backtrace::{make_backtracer, BackTracer, BackTracerKind};
pub use engine::{Dtpg, DtpgStats, EngineOptions, PoPartition, Strategy};
pub use error::{BuildError, CnfError, HookError, RunError};
pub use fault::{Fault, FaultDb, FaultId, FaultStatus};
pub use graph::{GateGraph, GateKind, NetlistBuilder, NodeId, Val3};
pub use testvec::TestVector;
