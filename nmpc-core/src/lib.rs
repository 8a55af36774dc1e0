//! Multi-stage nonlinear MPC solver with a primal-dual interior-point
//! core.
//!
//! The problem is a chain of stages, each holding its own decision
//! variables with a designated state sub-block. Stage `i` produces the
//! target for stage `i+1`'s state through a dynamics map, stage 0's
//! state is pinned to the measured `xinit`, and every stage may carry
//! nonlinear inequality constraints which the solver handles in slack
//! form. Callers describe their problem data through the
//! [`StageEvaluator`] trait; the solver owns sparsity, ordering,
//! factorization, and the iteration.
//!
//! ```no_run
//! use nmpc_core::{
//!     EvaluatorMap, ProblemDims, SolverParams, SolverSettings, StageDims,
//! };
//! # struct MyStage;
//! # impl nmpc_core::StageEvaluator for MyStage {
//! #     fn evaluate(&self, _: &nmpc_core::StageInputs<'_>, _: &mut nmpc_core::StageOutputs<'_>) {}
//! # }
//!
//! let dims = ProblemDims::uniform(
//!     10,
//!     StageDims { nvar: 3, nstate: 2, state_offset: 1, ndyn: 2, nineq: 1, nparam: 0 },
//! );
//! let stage = MyStage;
//! let evals = EvaluatorMap::uniform(&stage, dims.horizon());
//! let params = SolverParams {
//!     xinit: vec![0.5, -0.2],
//!     x0: vec![0.0; dims.num_vars()],
//!     all_parameters: vec![],
//! };
//! let result = nmpc_core::solve(&dims, &params, &evals, &SolverSettings::nlp()).unwrap();
//! println!("{} in {} iterations", result.status, result.info.it);
//! ```

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

pub mod assembler;
pub mod evaluator;
pub mod hessian;
pub mod ipm;
pub mod linalg;
pub mod problem;

pub use evaluator::{
    CcsPattern, EvaluatorMap, NonFiniteEval, StageEvaluator, StageInputs, StageOutputs,
};
pub use problem::{
    Method, ProblemDims, SolveInfo, SolveResult, SolveStatus, SolverError, SolverParams,
    SolverSettings, StageDims,
};

use std::io::Write;

/// Solves the problem, printing any requested tables to stdout.
pub fn solve(
    dims: &ProblemDims,
    params: &SolverParams,
    evals: &EvaluatorMap<'_>,
    settings: &SolverSettings,
) -> Result<SolveResult, SolverError> {
    let mut stdout = std::io::stdout();
    ipm::run(dims, params, evals, settings, &mut stdout)
}

/// Solves the problem, printing any requested tables to `sink`.
pub fn solve_to(
    dims: &ProblemDims,
    params: &SolverParams,
    evals: &EvaluatorMap<'_>,
    settings: &SolverSettings,
    sink: &mut dyn Write,
) -> Result<SolveResult, SolverError> {
    ipm::run(dims, params, evals, settings, sink)
}
