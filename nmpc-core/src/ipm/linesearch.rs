//! Step acceptance.
//!
//! The QP variant only needs strict positivity of slacks and
//! multipliers, found by geometric backtracking. The NLP variant runs
//! a filter line search on the pair (constraint violation `theta`,
//! barrier objective `psi`): a trial point must be undominated by the
//! filter history and either reduce `theta`, reduce `psi` by a margin
//! tied to `theta`, or satisfy an Armijo decrease along the direction.
//! When the first trial increases the violation, up to a handful of
//! second-order corrections re-solve the step against the constraint
//! values observed at the rejected point before backtracking resumes.

use crate::assembler::Assembler;
use crate::evaluator::EvaluatorMap;
use crate::ipm::perf::{PerfSection, PerfTimers};
use crate::ipm::predcorr::{ftb_step, solve_kkt_direction};
use crate::ipm::workspace::{step_into, IpmWorkspace};
use crate::linalg::kkt::KktSolver;
use crate::linalg::sparse::one_norm;
use crate::problem::{SolverParams, SolverSettings};

const GAMMA_THETA: f64 = 1e-5;
const GAMMA_PSI: f64 = 1e-5;
const ETA_ARMIJO: f64 = 1e-4;
/// A correction must shrink the violation by at least this factor to
/// earn another round.
const KAPPA_SOC: f64 = 0.99;
const BACKTRACK: f64 = 0.5;

/// Violation/objective pairs of past accepted iterates. A trial is
/// rejected when some entry beats it on both measures. Entries past
/// the capacity are dropped.
pub struct Filter {
    theta: Vec<f64>,
    psi: Vec<f64>,
    cap: usize,
}

impl Filter {
    pub fn new(cap: usize) -> Self {
        Self {
            theta: Vec::new(),
            psi: Vec::new(),
            cap,
        }
    }

    pub fn accepts(&self, theta: f64, psi: f64) -> bool {
        self.theta
            .iter()
            .zip(&self.psi)
            .all(|(&t, &p)| theta < t || psi < p)
    }

    pub fn push(&mut self, theta: f64, psi: f64) {
        if self.theta.len() < self.cap {
            self.theta.push(theta);
            self.psi.push(psi);
        }
    }
}

pub enum LsOutcome {
    Accepted {
        alpha: f64,
        lsit: usize,
        socs: usize,
        f_new: f64,
    },
    NoProgress,
}

pub enum LsFailure {
    BadEval,
    Numeric,
}

/// Geometric backtracking until `s + alpha ds` and `l + alpha dl` are
/// strictly positive. Returns the step and the number of shrinks, or
/// `None` once alpha falls below `min_step`.
pub fn positivity_backtrack(
    s: &[f64],
    l: &[f64],
    ds: &[f64],
    dl: &[f64],
    start: f64,
    scale: f64,
    min_step: f64,
) -> Option<(f64, usize)> {
    let mut alpha = start;
    let mut count = 0usize;
    loop {
        let positive = s.iter().zip(ds).all(|(&v, &d)| v + alpha * d > 0.0)
            && l.iter().zip(dl).all(|(&v, &d)| v + alpha * d > 0.0);
        if positive {
            return Some((alpha, count));
        }
        alpha *= scale;
        count += 1;
        if alpha < min_step {
            return None;
        }
    }
}

/// QP combined step: backtrack for positivity and promote the iterate.
/// The caller refreshes residuals at the new point afterwards.
pub fn qp_combined_step(
    ws: &mut IpmWorkspace,
    settings: &SolverSettings,
) -> Option<(f64, usize)> {
    let (alpha, lsit) = positivity_backtrack(
        &ws.cur.s,
        &ws.cur.l,
        &ws.cc.ds,
        &ws.cc.dl,
        settings.ls_max_step,
        settings.ls_scale,
        settings.ls_min_step,
    )?;
    step_into(&mut ws.trial, &ws.cur, alpha, &ws.cc);
    ws.cur.copy_from(&ws.trial);
    Some((alpha, lsit))
}

/// NLP filter line search over the combined direction. On acceptance
/// the workspace iterate and its constraint residuals are promoted.
#[allow(clippy::too_many_arguments)]
pub fn filter_search(
    asm: &Assembler,
    kkt: &mut KktSolver,
    evals: &EvaluatorMap<'_>,
    params: &SolverParams,
    ws: &mut IpmWorkspace,
    filter: &mut Filter,
    f_cur: f64,
    mu: f64,
    settings: &SolverSettings,
    timers: &mut PerfTimers,
) -> Result<LsOutcome, LsFailure> {
    let theta0 = one_norm(&ws.r_eq) + one_norm(&ws.r_in);
    let psi0 = barrier_psi(f_cur, mu, &ws.cur.s);
    let dpsi = directional_psi(asm.grad(), &ws.cc.dz, mu, &ws.cur.s, &ws.cc.ds);

    let mut alpha = ftb_step(&ws.cur.s, &ws.cc.ds, &ws.cur.l, &ws.cc.dl, settings.ftb_scale);
    let mut lsit = 0usize;
    let mut soc_tried = false;

    loop {
        step_into(&mut ws.trial, &ws.cur, alpha, &ws.cc);
        let theta_psi = eval_trial(asm, evals, params, ws, mu, timers)?;
        let (theta_t, psi_t, f_t) = theta_psi;

        if let Some(f_type) = accept(filter, theta0, psi0, dpsi, alpha, theta_t, psi_t) {
            if !f_type {
                filter.push((1.0 - GAMMA_THETA) * theta0, psi0 - GAMMA_PSI * theta0);
            }
            ws.commit_trial();
            return Ok(LsOutcome::Accepted {
                alpha,
                lsit,
                socs: 0,
                f_new: f_t,
            });
        }

        if !soc_tried && theta_t > theta0 && settings.max_soc_it > 0 {
            soc_tried = true;
            if let Some(outcome) = second_order_corrections(
                asm, kkt, evals, params, ws, filter, theta0, psi0, alpha, theta_t, mu, lsit,
                settings, timers,
            )? {
                return Ok(outcome);
            }
        }

        alpha *= BACKTRACK;
        lsit += 1;
        if alpha < settings.ls_min_step {
            return Ok(LsOutcome::NoProgress);
        }
    }
}

/// Evaluates constraints at `ws.trial`, fills the trial residuals, and
/// returns `(theta, psi, f)` there.
fn eval_trial(
    asm: &Assembler,
    evals: &EvaluatorMap<'_>,
    params: &SolverParams,
    ws: &mut IpmWorkspace,
    mu: f64,
    timers: &mut PerfTimers,
) -> Result<(f64, f64, f64), LsFailure> {
    let mut f_t = 0.0;
    {
        let _t = timers.scoped(PerfSection::FunctionEvals);
        asm.eval_constraints(
            evals,
            &ws.trial.z,
            &ws.trial.y,
            &ws.trial.l,
            params,
            &mut f_t,
            &mut ws.eq_target_trial,
            &mut ws.h_trial,
        )
        .map_err(|_| LsFailure::BadEval)?;
    }
    asm.eq_residual_with(&ws.trial.z, &ws.eq_target_trial, &mut ws.r_eq_trial);
    asm.ineq_residual_with(&ws.h_trial, &ws.trial.s, &mut ws.r_in_trial);
    let theta_t = one_norm(&ws.r_eq_trial) + one_norm(&ws.r_in_trial);
    let psi_t = barrier_psi(f_t, mu, &ws.trial.s);
    Ok((theta_t, psi_t, f_t))
}

/// `Some(f_type)` when the trial passes; `f_type` marks acceptance by
/// Armijo decrease alone, which leaves the filter untouched.
fn accept(
    filter: &Filter,
    theta0: f64,
    psi0: f64,
    dpsi: f64,
    alpha: f64,
    theta_t: f64,
    psi_t: f64,
) -> Option<bool> {
    if !filter.accepts(theta_t, psi_t) {
        return None;
    }
    if dpsi < 0.0 && psi_t <= psi0 + ETA_ARMIJO * alpha * dpsi {
        return Some(true);
    }
    if theta_t <= (1.0 - GAMMA_THETA) * theta0 || psi_t <= psi0 - GAMMA_PSI * theta0 {
        return Some(false);
    }
    None
}

/// Re-solves the step against the constraint values of the rejected
/// trial, at most `max_soc_it` times, reusing the iteration's
/// factorization and corrector right-hand side.
#[allow(clippy::too_many_arguments)]
fn second_order_corrections(
    asm: &Assembler,
    kkt: &mut KktSolver,
    evals: &EvaluatorMap<'_>,
    params: &SolverParams,
    ws: &mut IpmWorkspace,
    filter: &mut Filter,
    theta0: f64,
    psi0: f64,
    alpha_rejected: f64,
    theta_rejected: f64,
    mu: f64,
    lsit: usize,
    settings: &SolverSettings,
    timers: &mut PerfTimers,
) -> Result<Option<LsOutcome>, LsFailure> {
    for r in 0..ws.r_eq_soc.len() {
        ws.r_eq_soc[r] = alpha_rejected * ws.r_eq[r] + ws.r_eq_trial[r];
    }
    for j in 0..ws.r_in_soc.len() {
        ws.r_in_soc[j] = alpha_rejected * ws.r_in[j] + ws.r_in_trial[j];
    }

    let mut theta_old = theta_rejected;
    for k in 0..settings.max_soc_it {
        {
            let _t = timers.scoped(PerfSection::BackSolve);
            solve_kkt_direction(
                asm,
                kkt,
                &ws.cur.s,
                &ws.cur.l,
                &ws.rc,
                &ws.r_d,
                &ws.r_eq_soc,
                &ws.r_in_soc,
                &mut ws.tmp_mi,
                &mut ws.rhs_z,
                &mut ws.rhs_y,
                &mut ws.soc,
            )
            .map_err(|_| LsFailure::Numeric)?;
        }

        let alpha_soc = ftb_step(
            &ws.cur.s,
            &ws.soc.ds,
            &ws.cur.l,
            &ws.soc.dl,
            settings.ftb_scale,
        );
        step_into(&mut ws.trial, &ws.cur, alpha_soc, &ws.soc);
        let (theta_t, psi_t, f_t) = eval_trial(asm, evals, params, ws, mu, timers)?;
        let dpsi_soc = directional_psi(asm.grad(), &ws.soc.dz, mu, &ws.cur.s, &ws.soc.ds);

        if let Some(f_type) = accept(filter, theta0, psi0, dpsi_soc, alpha_soc, theta_t, psi_t) {
            if !f_type {
                filter.push((1.0 - GAMMA_THETA) * theta0, psi0 - GAMMA_PSI * theta0);
            }
            ws.commit_trial();
            return Ok(Some(LsOutcome::Accepted {
                alpha: alpha_soc,
                lsit,
                socs: k + 1,
                f_new: f_t,
            }));
        }

        if theta_t > KAPPA_SOC * theta_old {
            break;
        }
        theta_old = theta_t;
        for r in 0..ws.r_eq_soc.len() {
            ws.r_eq_soc[r] = alpha_soc * ws.r_eq_soc[r] + ws.r_eq_trial[r];
        }
        for j in 0..ws.r_in_soc.len() {
            ws.r_in_soc[j] = alpha_soc * ws.r_in_soc[j] + ws.r_in_trial[j];
        }
    }
    Ok(None)
}

fn barrier_psi(f: f64, mu: f64, s: &[f64]) -> f64 {
    let mut v = f;
    for &sj in s {
        v -= mu * sj.ln();
    }
    v
}

fn directional_psi(grad: &[f64], dz: &[f64], mu: f64, s: &[f64], ds: &[f64]) -> f64 {
    let mut v = 0.0;
    for (g, d) in grad.iter().zip(dz) {
        v += g * d;
    }
    for (sj, dj) in s.iter().zip(ds) {
        v -= mu * dj / sj;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_dominance() {
        let mut filter = Filter::new(10);
        assert!(filter.accepts(1.0, 1.0));

        filter.push(1.0, 1.0);
        // Worse on both measures: rejected.
        assert!(!filter.accepts(2.0, 2.0));
        assert!(!filter.accepts(1.0, 1.0));
        // Better on one measure: accepted.
        assert!(filter.accepts(0.5, 5.0));
        assert!(filter.accepts(5.0, 0.5));
    }

    #[test]
    fn test_filter_capacity_drops_overflow() {
        let mut filter = Filter::new(2);
        filter.push(3.0, 3.0);
        filter.push(2.0, 2.0);
        filter.push(1.0, 1.0);
        // The dropped entry (1, 1) does not reject this point, while
        // the retained (2, 2) still rejects one it dominates.
        assert!(filter.accepts(1.5, 1.5));
        assert!(!filter.accepts(2.5, 2.5));
    }

    #[test]
    fn test_positivity_backtrack_full_step() {
        let res = positivity_backtrack(&[1.0], &[1.0], &[-0.5], &[0.2], 0.995, 0.95, 1e-8);
        let (alpha, count) = res.unwrap();
        assert_eq!(alpha, 0.995);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_positivity_backtrack_shrinks() {
        let (alpha, count) =
            positivity_backtrack(&[1.0], &[1.0], &[-2.0], &[0.0], 0.995, 0.95, 1e-8).unwrap();
        assert!(count > 0);
        assert!(1.0 - 2.0 * alpha > 0.0);
        // One fewer shrink would still be blocked.
        assert!(1.0 - 2.0 * alpha / 0.95 <= 0.0);
    }

    #[test]
    fn test_positivity_backtrack_gives_up() {
        let res = positivity_backtrack(&[1e-12], &[1.0], &[-1.0], &[0.0], 0.995, 0.95, 1e-8);
        assert!(res.is_none());
    }

    #[test]
    fn test_accept_paths() {
        let mut filter = Filter::new(10);
        // Violation decrease passes and should augment the filter.
        assert_eq!(accept(&filter, 1.0, 10.0, 0.0, 1.0, 0.5, 10.0), Some(false));
        // Armijo decrease along a descent direction is f-type.
        assert_eq!(
            accept(&filter, 1.0, 10.0, -1.0, 1.0, 1.0, 9.0),
            Some(true)
        );
        // No decrease in either measure: rejected.
        assert_eq!(accept(&filter, 1.0, 10.0, 1.0, 1.0, 1.0, 10.0), None);
        // Dominated by a filter entry: rejected outright.
        filter.push(0.6, 11.0);
        assert_eq!(accept(&filter, 1.0, 10.0, 0.0, 1.0, 0.8, 12.0), None);
    }

    #[test]
    fn test_barrier_psi_and_slope() {
        let s = [1.0, 2.0];
        let psi = barrier_psi(3.0, 0.5, &s);
        assert!((psi - (3.0 - 0.5 * 2.0_f64.ln())).abs() < 1e-14);

        let slope = directional_psi(&[1.0, -1.0], &[2.0, 1.0], 0.5, &s, &[1.0, -2.0]);
        // grad'dz = 1, barrier part = -0.5 * (1/1 - 2/2) = 0.
        assert!((slope - 1.0 + 0.5 * (1.0 - 1.0)).abs() < 1e-14);
    }
}
