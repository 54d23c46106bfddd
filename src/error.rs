use thiserror::Error;

/// Errors raised while turning a flat gate list into a [GateGraph](crate::graph::GateGraph).
///
/// All of these are fatal at load time; a netlist that builds successfully
/// never fails activation or cone extraction later.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("duplicate signal name `{0}`")]
    DuplicateName(String),
    #[error("gate `{gate}` references unknown signal `{fanin}`")]
    Dangling { gate: String, fanin: String },
    #[error("combinational cycle through `{0}`")]
    Cycle(String),
    #[error("gate `{gate}` has {got} fanins, expected {expected}")]
    BadArity {
        gate: String,
        got: usize,
        expected: &'static str,
    },
    #[error("primary output `{output}` drives gate `{gate}`")]
    OutputDrives { output: String, gate: String },
}

/// Variable-map or clause-emission invariant breakage.
///
/// Unlike a solver abort this is not recoverable per fault; the run that hit
/// it is torn down.
#[derive(Debug, Error)]
pub enum CnfError {
    #[error("no {space} variable mapped for node {node}")]
    MissingVar { node: usize, space: &'static str },
}

/// Raised by a detect or untest hook.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("test vector for fault {fault} fails verification")]
    VerifyFailed { fault: usize },
    #[error("`{0}` hook needs a fault simulator")]
    MissingSim(&'static str),
}

/// Errors that abort a whole ATPG run.
///
/// Solver aborts are deliberately absent: they are per-fault events, routed
/// through the fault status instead. Faults already resolved before the
/// error keep their status.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("cnf build failed: {0}")]
    Cnf(#[from] CnfError),
    #[error("hook failed: {0}")]
    Hook(#[from] HookError),
}
