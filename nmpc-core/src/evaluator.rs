//! User-side evaluation contract.
//!
//! The solver never sees model expressions. Each stage exposes a
//! [`StageEvaluator`] that fills dense buffers with objective,
//! constraint, and derivative values at a query point; the solver
//! supplies the buffers and the current multipliers. Generated kernels
//! that emit compressed-column sparse outputs can expand them through
//! [`CcsPattern::scatter`].

/// Query point and multipliers handed to an evaluator.
///
/// `y` holds the multipliers of the outgoing coupling rows (empty for
/// the terminal stage), `l` the multipliers of this stage's inequality
/// rows. Both are only needed when a Lagrangian Hessian is requested.
pub struct StageInputs<'a> {
    pub stage: usize,
    pub z: &'a [f64],
    pub p: &'a [f64],
    pub y: &'a [f64],
    pub l: &'a [f64],
}

/// Output slots for one evaluation.
///
/// Slots the solver does not need are `None` and must be skipped.
/// Buffers arrive zero-filled; an evaluator only writes its nonzero
/// entries. The objective slot is cumulative: add the stage
/// contribution with `*f += ...`. Matrices are column-major, `jac_c`
/// is `ndyn x nvar`, `jac_h` is `nineq x nvar`, `hess` is
/// `nvar x nvar` and must contain the full symmetric matrix.
///
/// Because the coupling rows read `x_next - c(z) = 0`, the dynamics
/// curvature enters the Lagrangian with a minus sign:
/// `hess = d2f - sum_k y[k] d2c_k + sum_j l[j] d2h_j`.
#[derive(Default)]
pub struct StageOutputs<'a> {
    pub f: Option<&'a mut f64>,
    pub grad_f: Option<&'a mut [f64]>,
    pub c: Option<&'a mut [f64]>,
    pub jac_c: Option<&'a mut [f64]>,
    pub h: Option<&'a mut [f64]>,
    pub jac_h: Option<&'a mut [f64]>,
    pub hess: Option<&'a mut [f64]>,
}

/// Marker for an evaluation sweep that produced a non-finite value.
/// The solver maps it to the bad-function-evaluation exit status.
#[derive(Debug, Clone, Copy)]
pub struct NonFiniteEval;

/// Model callback for one stage.
///
/// Evaluation is infallible by signature; an evaluator signals failure
/// by writing a non-finite value, which the solver detects and reports
/// as a bad function evaluation.
pub trait StageEvaluator {
    fn evaluate(&self, inputs: &StageInputs<'_>, outputs: &mut StageOutputs<'_>);

    /// Whether `hess` requests are honored with an exact Lagrangian
    /// Hessian. When any stage answers `false` the solver builds
    /// quasi-Newton curvature for the whole horizon instead.
    fn provides_hessian(&self) -> bool {
        false
    }
}

/// Compressed-column sparsity pattern of a generated kernel output.
#[derive(Debug, Clone)]
pub struct CcsPattern {
    pub nrow: usize,
    pub ncol: usize,
    /// Length `ncol + 1`.
    pub colptr: Vec<usize>,
    /// Row index per stored entry, length `colptr[ncol]`.
    pub rowidx: Vec<usize>,
}

impl CcsPattern {
    pub fn new(nrow: usize, ncol: usize, colptr: Vec<usize>, rowidx: Vec<usize>) -> Self {
        debug_assert_eq!(colptr.len(), ncol + 1);
        debug_assert_eq!(rowidx.len(), colptr[ncol]);
        Self {
            nrow,
            ncol,
            colptr,
            rowidx,
        }
    }

    /// Dense pattern, stored column by column.
    pub fn dense(nrow: usize, ncol: usize) -> Self {
        let colptr = (0..=ncol).map(|c| c * nrow).collect();
        let rowidx = (0..ncol).flat_map(|_| 0..nrow).collect();
        Self {
            nrow,
            ncol,
            colptr,
            rowidx,
        }
    }

    pub fn nnz(&self) -> usize {
        self.colptr[self.ncol]
    }

    /// Expands packed nonzeros into a zero-filled column-major dense
    /// buffer: entry `j` of column `c` lands at `c * nrow + rowidx[j]`.
    pub fn scatter(&self, data: &[f64], out: &mut [f64]) {
        debug_assert_eq!(data.len(), self.nnz());
        debug_assert_eq!(out.len(), self.nrow * self.ncol);
        out.fill(0.0);
        for col in 0..self.ncol {
            for j in self.colptr[col]..self.colptr[col + 1] {
                out[col * self.nrow + self.rowidx[j]] = data[j];
            }
        }
    }
}

/// Stage-index to evaluator binding, resolved once before the solve.
pub struct EvaluatorMap<'a> {
    stages: Vec<&'a dyn StageEvaluator>,
}

impl<'a> EvaluatorMap<'a> {
    /// One entry per stage, in stage order.
    pub fn new(stages: Vec<&'a dyn StageEvaluator>) -> Self {
        Self { stages }
    }

    /// The same evaluator for every stage of the horizon.
    pub fn uniform(evaluator: &'a dyn StageEvaluator, horizon: usize) -> Self {
        Self {
            stages: vec![evaluator; horizon],
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, i: usize) -> &dyn StageEvaluator {
        self.stages[i]
    }

    /// True when every stage can produce an exact Lagrangian Hessian.
    pub fn all_provide_hessian(&self) -> bool {
        self.stages.iter().all(|e| e.provides_hessian())
    }
}
