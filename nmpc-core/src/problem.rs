//! Problem description and solver-facing data types.
//!
//! A problem is a chain of `N` stages. Stage `i` owns a decision block
//! `z_i` of length `nvar`, contributes a separable objective term
//! `f_i(z_i, p_i)`, carries `nineq` inequality rows `h_i(z_i, p_i) <= 0`,
//! and (except for the terminal stage) an outgoing dynamics map
//! `c_i(z_i, p_i)` of length `ndyn` that pins the state block of stage
//! `i + 1` through the coupling rows `x_{i+1} - c_i(z_i, p_i) = 0`.

use thiserror::Error;

/// Dimensions of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDims {
    /// Length of the stage decision block `z_i`.
    pub nvar: usize,
    /// Length of the state sub-block inside `z_i`.
    pub nstate: usize,
    /// Offset of the state sub-block inside `z_i`.
    pub state_offset: usize,
    /// Length of the outgoing dynamics map `c_i` (0 for the terminal stage).
    pub ndyn: usize,
    /// Number of inequality rows `h_i`.
    pub nineq: usize,
    /// Length of the per-stage parameter slice.
    pub nparam: usize,
}

/// Stage-wise dimensions of the whole horizon.
#[derive(Debug, Clone)]
pub struct ProblemDims {
    pub stages: Vec<StageDims>,
}

impl ProblemDims {
    pub fn new(stages: Vec<StageDims>) -> Self {
        Self { stages }
    }

    /// Horizon with identical interior stages and a terminal stage that
    /// keeps the same variable layout but has no outgoing dynamics.
    pub fn uniform(horizon: usize, interior: StageDims) -> Self {
        let mut stages = vec![interior; horizon];
        if let Some(last) = stages.last_mut() {
            last.ndyn = 0;
        }
        Self { stages }
    }

    pub fn horizon(&self) -> usize {
        self.stages.len()
    }

    /// Total number of decision variables across all stages.
    pub fn num_vars(&self) -> usize {
        self.stages.iter().map(|s| s.nvar).sum()
    }

    /// Total number of equality rows: one block per stage pinning its
    /// state sub-block (to `xinit` for stage 0, to the predecessor's
    /// dynamics output otherwise).
    pub fn num_eq(&self) -> usize {
        self.stages.iter().map(|s| s.nstate).sum()
    }

    pub fn num_ineq(&self) -> usize {
        self.stages.iter().map(|s| s.nineq).sum()
    }

    pub fn num_params(&self) -> usize {
        self.stages.iter().map(|s| s.nparam).sum()
    }

    /// Checks internal consistency of the stage chain.
    pub fn validate(&self) -> Result<(), SolverError> {
        if self.stages.is_empty() {
            return Err(SolverError::NoStages);
        }
        for (i, s) in self.stages.iter().enumerate() {
            if s.nvar == 0 {
                return Err(SolverError::EmptyStage { stage: i });
            }
            if s.state_offset + s.nstate > s.nvar {
                return Err(SolverError::StateBlockOutOfRange {
                    stage: i,
                    offset: s.state_offset,
                    len: s.nstate,
                    nvar: s.nvar,
                });
            }
            let terminal = i + 1 == self.stages.len();
            if terminal {
                if s.ndyn != 0 {
                    return Err(SolverError::TerminalDynamics { ndyn: s.ndyn });
                }
            } else if s.ndyn != self.stages[i + 1].nstate {
                return Err(SolverError::DynamicsMismatch {
                    stage: i,
                    ndyn: s.ndyn,
                    next_nstate: self.stages[i + 1].nstate,
                });
            }
        }
        Ok(())
    }
}

/// Runtime inputs for one solve call.
#[derive(Debug, Clone)]
pub struct SolverParams {
    /// Measured state pinning the stage-0 state sub-block.
    pub xinit: Vec<f64>,
    /// Primal initial guess, stage blocks concatenated in order.
    pub x0: Vec<f64>,
    /// Per-stage parameter slices concatenated in order.
    pub all_parameters: Vec<f64>,
}

impl SolverParams {
    pub fn validate(&self, dims: &ProblemDims) -> Result<(), SolverError> {
        let want_xinit = dims.stages[0].nstate;
        if self.xinit.len() != want_xinit {
            return Err(SolverError::ParamLength {
                name: "xinit",
                got: self.xinit.len(),
                want: want_xinit,
            });
        }
        if self.x0.len() != dims.num_vars() {
            return Err(SolverError::ParamLength {
                name: "x0",
                got: self.x0.len(),
                want: dims.num_vars(),
            });
        }
        if self.all_parameters.len() != dims.num_params() {
            return Err(SolverError::ParamLength {
                name: "all_parameters",
                got: self.all_parameters.len(),
                want: dims.num_params(),
            });
        }
        Ok(())
    }
}

/// Which interior-point variant drives the iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Convex quadratic data, positivity backtracking line search.
    Qp,
    /// General nonlinear data, filter line search with second-order
    /// corrections.
    Nlp,
}

/// Solver configuration.
///
/// `qp()` and `nlp()` give the stock parameter sets; `Default` is the
/// NLP set. A few knobs can be overridden through `NMPC_*` environment
/// variables for experiments without recompiling callers.
#[derive(Debug, Clone)]
pub struct SolverSettings {
    pub method: Method,
    /// Iteration cap (200 for QP, 3000 for NLP).
    pub max_it: usize,
    /// Relative duality gap threshold.
    pub acc_rdgap: f64,
    /// Equality residual threshold (inf norm).
    pub acc_reseq: f64,
    /// Inequality residual threshold (inf norm).
    pub acc_resineq: f64,
    /// Complementarity threshold (inf norm of `s o l`).
    pub acc_kktcompl: f64,
    /// Backtracking scale for the affine step (QP only).
    pub ls_scale_aff: f64,
    /// Backtracking scale for the combined step (QP only).
    pub ls_scale: f64,
    /// Smallest acceptable line-search step.
    pub ls_min_step: f64,
    /// Largest combined step (QP only).
    pub ls_max_step: f64,
    /// Fraction-to-boundary scale (NLP only).
    pub ftb_scale: f64,
    /// Maximum second-order corrections per line search (NLP only).
    pub max_soc_it: usize,
    /// Filter capacity; additions beyond this are dropped (NLP only).
    pub max_filter_size: usize,
    /// Static diagonal regularization of the reduced KKT system.
    pub static_reg: f64,
    /// Pivots below this magnitude get bumped during factorization.
    pub dynamic_reg_min_pivot: f64,
    /// Iterative refinement sweeps per KKT backsolve.
    pub kkt_refine_iters: usize,
    /// Floor for the initial slack values.
    pub init_slack: f64,
    /// Initial inequality multiplier value.
    pub init_mult: f64,
    /// 0 = silent, 1 = summary line, 2 = per-iteration table.
    pub print_level: u8,
}

impl SolverSettings {
    pub fn qp() -> Self {
        Self {
            method: Method::Qp,
            max_it: 200,
            acc_rdgap: 1e-4,
            acc_reseq: 1e-6,
            acc_resineq: 1e-6,
            acc_kktcompl: 1e-6,
            ls_scale_aff: 0.9,
            ls_scale: 0.95,
            ls_min_step: 1e-8,
            ls_max_step: 0.995,
            ftb_scale: 0.99,
            max_soc_it: 4,
            max_filter_size: 3000,
            static_reg: 1e-8,
            dynamic_reg_min_pivot: 1e-13,
            kkt_refine_iters: env_usize("NMPC_REFINE_ITERS", 2),
            init_slack: 1.0,
            init_mult: 1.0,
            print_level: env_usize("NMPC_PRINT_LEVEL", 0) as u8,
        }
    }

    pub fn nlp() -> Self {
        Self {
            method: Method::Nlp,
            max_it: 3000,
            ..Self::qp()
        }
    }
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self::nlp()
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Terminal state of one solve call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// All four convergence measures below their thresholds.
    Optimal,
    /// Iteration cap hit first.
    MaxItReached,
    /// Line search collapsed below the minimum step.
    NoProgress,
    /// An evaluator produced a non-finite value.
    BadFuncEval,
    /// Non-finite values inside the linear-algebra core.
    NumericalError,
}

impl SolveStatus {
    /// Wire-compatible integer code reported alongside the status.
    pub fn exit_code(&self) -> i32 {
        match self {
            SolveStatus::Optimal => 1,
            SolveStatus::MaxItReached => 0,
            SolveStatus::BadFuncEval => -6,
            SolveStatus::NoProgress => -7,
            SolveStatus::NumericalError => -10,
        }
    }
}

impl std::fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SolveStatus::Optimal => "optimal",
            SolveStatus::MaxItReached => "max iterations reached",
            SolveStatus::NoProgress => "no progress",
            SolveStatus::BadFuncEval => "bad function evaluation",
            SolveStatus::NumericalError => "numerical error",
        };
        write!(f, "{}", s)
    }
}

/// Per-solve diagnostics, mirroring the fields embedded controllers
/// conventionally report.
#[derive(Debug, Clone, Default)]
pub struct SolveInfo {
    /// Iterations performed.
    pub it: usize,
    /// Iteration at which the optimum was found, -1 if not optimal.
    pub it2opt: i32,
    /// Inf norm of the equality residual.
    pub res_eq: f64,
    /// Inf norm of the inequality residual.
    pub res_ineq: f64,
    /// Primal objective.
    pub pobj: f64,
    /// Dual objective estimate.
    pub dobj: f64,
    /// Duality gap `s' l`.
    pub dgap: f64,
    /// Relative duality gap.
    pub rdgap: f64,
    /// Duality measure `s' l / m` at the last iterate.
    pub mu: f64,
    /// Duality measure after the affine step.
    pub mu_aff: f64,
    /// Last centering parameter.
    pub sigma: f64,
    /// Line-search iterations for the affine step (last iteration).
    pub lsit_aff: usize,
    /// Line-search iterations for the combined step (last iteration).
    pub lsit_cc: usize,
    /// Step size taken along the affine direction.
    pub step_aff: f64,
    /// Step size taken along the combined direction.
    pub step_cc: f64,
    /// Total wall-clock solve time in seconds.
    pub solvetime: f64,
    /// Time spent inside stage evaluators in seconds.
    pub fevalstime: f64,
}

/// Result of one solve call.
#[derive(Debug, Clone)]
pub struct SolveResult {
    pub status: SolveStatus,
    /// Primal solution split into per-stage blocks, in stage order.
    pub stage_output: Vec<Vec<f64>>,
    pub info: SolveInfo,
}

impl SolveResult {
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

/// Errors raised before the iteration loop starts. Failures inside the
/// loop are reported through [`SolveStatus`] instead.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("problem has no stages")]
    NoStages,
    #[error("stage {stage} has no decision variables")]
    EmptyStage { stage: usize },
    #[error("stage {stage}: state block at offset {offset} with length {len} exceeds nvar = {nvar}")]
    StateBlockOutOfRange {
        stage: usize,
        offset: usize,
        len: usize,
        nvar: usize,
    },
    #[error("stage {stage}: dynamics output length {ndyn} does not match next stage state length {next_nstate}")]
    DynamicsMismatch {
        stage: usize,
        ndyn: usize,
        next_nstate: usize,
    },
    #[error("terminal stage declares an outgoing dynamics map of length {ndyn}")]
    TerminalDynamics { ndyn: usize },
    #[error("{name} has length {got}, expected {want}")]
    ParamLength {
        name: &'static str,
        got: usize,
        want: usize,
    },
    #[error("evaluator map covers {got} stages, problem has {want}")]
    EvaluatorCount { got: usize, want: usize },
    #[error("KKT setup failed: {0}")]
    KktSetup(#[from] crate::linalg::kkt::KktError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_dims() -> ProblemDims {
        ProblemDims::new(vec![
            StageDims {
                nvar: 3,
                nstate: 2,
                state_offset: 1,
                ndyn: 2,
                nineq: 1,
                nparam: 0,
            },
            StageDims {
                nvar: 3,
                nstate: 2,
                state_offset: 1,
                ndyn: 0,
                nineq: 1,
                nparam: 0,
            },
        ])
    }

    #[test]
    fn test_validate_ok() {
        assert!(chain_dims().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_broken_chain() {
        let mut dims = chain_dims();
        dims.stages[0].ndyn = 3;
        assert!(matches!(
            dims.validate(),
            Err(SolverError::DynamicsMismatch { stage: 0, .. })
        ));

        let mut dims = chain_dims();
        dims.stages[1].ndyn = 1;
        assert!(matches!(
            dims.validate(),
            Err(SolverError::TerminalDynamics { ndyn: 1 })
        ));

        let mut dims = chain_dims();
        dims.stages[0].state_offset = 2;
        assert!(matches!(
            dims.validate(),
            Err(SolverError::StateBlockOutOfRange { stage: 0, .. })
        ));
    }

    #[test]
    fn test_uniform_terminates_chain() {
        let dims = ProblemDims::uniform(
            5,
            StageDims {
                nvar: 4,
                nstate: 2,
                state_offset: 2,
                ndyn: 2,
                nineq: 2,
                nparam: 1,
            },
        );
        assert_eq!(dims.horizon(), 5);
        assert_eq!(dims.stages[4].ndyn, 0);
        assert_eq!(dims.num_vars(), 20);
        assert_eq!(dims.num_eq(), 10);
        assert_eq!(dims.num_params(), 5);
        assert!(dims.validate().is_ok());
    }

    #[test]
    fn test_params_validate_lengths() {
        let dims = chain_dims();
        let params = SolverParams {
            xinit: vec![0.0; 2],
            x0: vec![0.0; 6],
            all_parameters: vec![],
        };
        assert!(params.validate(&dims).is_ok());

        let short = SolverParams {
            xinit: vec![0.0; 1],
            ..params.clone()
        };
        assert!(matches!(
            short.validate(&dims),
            Err(SolverError::ParamLength { name: "xinit", .. })
        ));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(SolveStatus::Optimal.exit_code(), 1);
        assert_eq!(SolveStatus::MaxItReached.exit_code(), 0);
        assert_eq!(SolveStatus::BadFuncEval.exit_code(), -6);
        assert_eq!(SolveStatus::NoProgress.exit_code(), -7);
        assert_eq!(SolveStatus::NumericalError.exit_code(), -10);
    }

    #[test]
    fn test_settings_presets() {
        let qp = SolverSettings::qp();
        assert_eq!(qp.max_it, 200);
        let nlp = SolverSettings::nlp();
        assert_eq!(nlp.max_it, 3000);
        assert_eq!(nlp.acc_rdgap, qp.acc_rdgap);
    }
}
