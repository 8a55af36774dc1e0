//! Convergence measures and stopping tests.

use crate::linalg::sparse::inf_norm;
use crate::problem::SolverSettings;

/// Residual norms and gap measures of one iterate.
#[derive(Debug, Clone, Default)]
pub struct ConvergenceMeasures {
    pub res_eq: f64,
    pub res_ineq: f64,
    pub pobj: f64,
    pub dobj: f64,
    pub dgap: f64,
    pub rdgap: f64,
    pub compl: f64,
    pub mu: f64,
}

pub fn measure(pobj: f64, r_eq: &[f64], r_in: &[f64], s: &[f64], l: &[f64]) -> ConvergenceMeasures {
    let mut dgap = 0.0;
    let mut compl = 0.0_f64;
    for (&sj, &lj) in s.iter().zip(l) {
        dgap += sj * lj;
        compl = compl.max((sj * lj).abs());
    }
    let mu = if s.is_empty() {
        0.0
    } else {
        dgap / s.len() as f64
    };
    ConvergenceMeasures {
        res_eq: inf_norm(r_eq),
        res_ineq: inf_norm(r_in),
        pobj,
        dobj: pobj - dgap,
        dgap,
        rdgap: dgap.abs() / pobj.abs().max(1.0),
        compl,
        mu,
    }
}

/// All four tolerances must hold at once.
pub fn converged(m: &ConvergenceMeasures, settings: &SolverSettings) -> bool {
    m.res_eq <= settings.acc_reseq
        && m.res_ineq <= settings.acc_resineq
        && m.rdgap <= settings.acc_rdgap
        && m.compl <= settings.acc_kktcompl
}

pub fn any_non_finite(slices: &[&[f64]]) -> bool {
    slices
        .iter()
        .any(|s| s.iter().any(|v| !v.is_finite()))
}
