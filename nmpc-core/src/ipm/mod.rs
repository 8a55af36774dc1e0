//! Primal-dual interior-point iteration.
//!
//! Each iteration runs through four phases: an affine predictor solve,
//! a centering corrector solve with Mehrotra's second-order term, a
//! line search along the combined direction (positivity backtracking
//! for QPs, a filter search with second-order corrections for NLPs),
//! and a convergence check against the four tolerances. The phases
//! share one factorization of the reduced KKT system, whose sparsity
//! pattern, fill-reducing ordering, and symbolic factorization are
//! computed once per problem structure.

pub mod diagnostics;
pub mod linesearch;
pub mod perf;
pub mod predcorr;
pub mod termination;
pub mod workspace;

use std::io::Write;
use std::time::Instant;

use crate::assembler::Assembler;
use crate::evaluator::EvaluatorMap;
use crate::hessian::QuasiNewton;
use crate::linalg::kkt::KktSolver;
use crate::linalg::sparse::inf_norm;
use crate::problem::{
    Method, ProblemDims, SolveInfo, SolveResult, SolveStatus, SolverError, SolverParams,
    SolverSettings,
};

use diagnostics::DiagnosticsConfig;
use linesearch::{filter_search, positivity_backtrack, qp_combined_step, Filter, LsFailure, LsOutcome};
use perf::{PerfSection, PerfTimers};
use predcorr::{
    affine_rc, centering_sigma, corrector_rc, duality_measure, ftb_step, mu_after_step,
    solve_kkt_direction,
};
use termination::{any_non_finite, converged, measure, ConvergenceMeasures};
use workspace::IpmWorkspace;

#[derive(Clone, Copy)]
enum Phase {
    AffineStep,
    CenteringCorrector,
    LineSearch,
    ConvergenceCheck,
    Done(SolveStatus),
}

/// Runs the interior-point iteration to completion. Returns an error
/// only for structural problems caught before the loop starts; numeric
/// trouble inside the loop ends in a [`SolveStatus`] instead.
pub fn run(
    dims: &ProblemDims,
    params: &SolverParams,
    evals: &EvaluatorMap<'_>,
    settings: &SolverSettings,
    sink: &mut dyn Write,
) -> Result<SolveResult, SolverError> {
    dims.validate()?;
    params.validate(dims)?;
    if evals.len() != dims.horizon() {
        return Err(SolverError::EvaluatorCount {
            got: evals.len(),
            want: dims.horizon(),
        });
    }

    let t_start = Instant::now();
    let mut timers = PerfTimers::default();
    let diag = DiagnosticsConfig::from_env();

    let mut asm = Assembler::new(dims);
    asm.set_xinit(&params.xinit);
    let (nz, me, mi) = (asm.nz(), asm.me(), asm.mi());
    let mut ws = IpmWorkspace::new(nz, me, mi);
    let mut kkt = KktSolver::new(
        &asm,
        settings.static_reg,
        settings.dynamic_reg_min_pivot,
        settings.kkt_refine_iters,
    )?;

    let exact_hessian = evals.all_provide_hessian();
    let mut qn = if exact_hessian {
        None
    } else {
        Some(QuasiNewton::new(dims))
    };
    let mut filter = Filter::new(settings.max_filter_size);

    if settings.print_level >= 2 {
        banner(sink, &asm, settings);
    }

    // Initial point: primal guess as given, equality multipliers at
    // zero, slacks covering the initial constraint values.
    ws.cur.z.copy_from_slice(&params.x0);
    let mut phase = Phase::AffineStep;
    {
        let mut f0 = 0.0;
        let init = {
            let _t = timers.scoped(PerfSection::FunctionEvals);
            asm.eval_constraints(
                evals,
                &ws.cur.z,
                &ws.cur.y,
                &ws.cur.l,
                params,
                &mut f0,
                &mut ws.eq_target_trial,
                &mut ws.h_trial,
            )
        };
        match init {
            Ok(()) => {
                for j in 0..mi {
                    ws.cur.s[j] = settings.init_slack.max(-ws.h_trial[j]);
                    ws.cur.l[j] = settings.init_mult;
                }
            }
            Err(_) => phase = Phase::Done(SolveStatus::BadFuncEval),
        }
    }

    let mut info = SolveInfo::default();
    let mut m = ConvergenceMeasures::default();
    let mut it = 0usize;
    let mut pobj = 0.0;
    let mut mu = 0.0;
    let mut mu_aff = 0.0;
    let mut sigma = 0.0;
    let mut socs_last = 0usize;
    let mut kkt_eq_res = 0.0;

    let status = loop {
        match phase {
            Phase::AffineStep => {
                let eval = {
                    let _t = timers.scoped(PerfSection::FunctionEvals);
                    asm.eval_full(evals, &ws.cur.z, &ws.cur.y, &ws.cur.l, params, exact_hessian)
                };
                pobj = match eval {
                    Ok(f) => f,
                    Err(_) => {
                        phase = Phase::Done(SolveStatus::BadFuncEval);
                        continue;
                    }
                };

                {
                    let _t = timers.scoped(PerfSection::Residuals);
                    asm.dual_residual(&ws.cur.y, &ws.cur.l, &mut ws.r_d);
                    asm.eq_residual(&ws.cur.z, &mut ws.r_eq);
                    asm.ineq_residual(&ws.cur.s, &mut ws.r_in);
                }

                if let Some(qn) = qn.as_mut() {
                    qn.update(&ws.cur.z, &ws.r_d);
                    for i in 0..asm.horizon() {
                        asm.hess_mut(i).copy_from_slice(qn.block(i));
                    }
                }

                {
                    let _t = timers.scoped(PerfSection::KktAssembly);
                    for j in 0..mi {
                        ws.w[j] = ws.cur.l[j] / ws.cur.s[j];
                    }
                    asm.build_phi(&ws.w);
                }
                let factored = {
                    let _t = timers.scoped(PerfSection::Factorization);
                    kkt.factor(&asm)
                };
                if factored.is_err() {
                    phase = Phase::Done(SolveStatus::NumericalError);
                    continue;
                }

                mu = duality_measure(&ws.cur.s, &ws.cur.l);
                affine_rc(&ws.cur.s, &ws.cur.l, &mut ws.rc);
                let solved = {
                    let _t = timers.scoped(PerfSection::BackSolve);
                    solve_kkt_direction(
                        &asm,
                        &mut kkt,
                        &ws.cur.s,
                        &ws.cur.l,
                        &ws.rc,
                        &ws.r_d,
                        &ws.r_eq,
                        &ws.r_in,
                        &mut ws.tmp_mi,
                        &mut ws.rhs_z,
                        &mut ws.rhs_y,
                        &mut ws.aff,
                    )
                };
                if solved.is_err() {
                    phase = Phase::Done(SolveStatus::NumericalError);
                    continue;
                }

                if diag.enabled && diag.print_kkt_residuals {
                    // Equality rows of the predictor system: J_e dz
                    // should cancel r_eq up to the regularization term.
                    asm.jac_eq_apply(&ws.aff.dz, &mut ws.rhs_y);
                    for (v, r) in ws.rhs_y.iter_mut().zip(&ws.r_eq) {
                        *v += r;
                    }
                    kkt_eq_res = inf_norm(&ws.rhs_y);
                }

                let step_aff = match settings.method {
                    Method::Nlp => {
                        info.lsit_aff = 0;
                        ftb_step(
                            &ws.cur.s,
                            &ws.aff.ds,
                            &ws.cur.l,
                            &ws.aff.dl,
                            settings.ftb_scale,
                        )
                    }
                    Method::Qp => {
                        match positivity_backtrack(
                            &ws.cur.s,
                            &ws.cur.l,
                            &ws.aff.ds,
                            &ws.aff.dl,
                            settings.ls_max_step,
                            settings.ls_scale_aff,
                            settings.ls_min_step,
                        ) {
                            Some((alpha, lsit)) => {
                                info.lsit_aff = lsit;
                                alpha
                            }
                            None => {
                                phase = Phase::Done(SolveStatus::NoProgress);
                                continue;
                            }
                        }
                    }
                };
                info.step_aff = step_aff;
                mu_aff = mu_after_step(&ws.cur.s, &ws.cur.l, &ws.aff.ds, &ws.aff.dl, step_aff);
                phase = Phase::CenteringCorrector;
            }

            Phase::CenteringCorrector => {
                sigma = centering_sigma(mu, mu_aff);
                corrector_rc(&ws.cur.s, &ws.cur.l, &ws.aff, sigma * mu, &mut ws.rc);
                let solved = {
                    let _t = timers.scoped(PerfSection::BackSolve);
                    solve_kkt_direction(
                        &asm,
                        &mut kkt,
                        &ws.cur.s,
                        &ws.cur.l,
                        &ws.rc,
                        &ws.r_d,
                        &ws.r_eq,
                        &ws.r_in,
                        &mut ws.tmp_mi,
                        &mut ws.rhs_z,
                        &mut ws.rhs_y,
                        &mut ws.cc,
                    )
                };
                phase = if solved.is_ok() {
                    Phase::LineSearch
                } else {
                    Phase::Done(SolveStatus::NumericalError)
                };
            }

            Phase::LineSearch => {
                socs_last = 0;
                match settings.method {
                    Method::Qp => match qp_combined_step(&mut ws, settings) {
                        Some((alpha, lsit)) => {
                            info.step_cc = alpha;
                            info.lsit_cc = lsit;
                            let mut f_new = 0.0;
                            let refreshed = {
                                let _t = timers.scoped(PerfSection::FunctionEvals);
                                asm.eval_constraints(
                                    evals,
                                    &ws.cur.z,
                                    &ws.cur.y,
                                    &ws.cur.l,
                                    params,
                                    &mut f_new,
                                    &mut ws.eq_target_trial,
                                    &mut ws.h_trial,
                                )
                            };
                            if refreshed.is_err() {
                                phase = Phase::Done(SolveStatus::BadFuncEval);
                                continue;
                            }
                            asm.eq_residual_with(&ws.cur.z, &ws.eq_target_trial, &mut ws.r_eq);
                            asm.ineq_residual_with(&ws.h_trial, &ws.cur.s, &mut ws.r_in);
                            pobj = f_new;
                            phase = Phase::ConvergenceCheck;
                        }
                        None => phase = Phase::Done(SolveStatus::NoProgress),
                    },
                    Method::Nlp => {
                        match filter_search(
                            &asm,
                            &mut kkt,
                            evals,
                            params,
                            &mut ws,
                            &mut filter,
                            pobj,
                            mu,
                            settings,
                            &mut timers,
                        ) {
                            Ok(LsOutcome::Accepted {
                                alpha,
                                lsit,
                                socs,
                                f_new,
                            }) => {
                                info.step_cc = alpha;
                                info.lsit_cc = lsit;
                                socs_last = socs;
                                pobj = f_new;
                                phase = Phase::ConvergenceCheck;
                            }
                            Ok(LsOutcome::NoProgress) => {
                                phase = Phase::Done(SolveStatus::NoProgress)
                            }
                            Err(LsFailure::BadEval) => {
                                phase = Phase::Done(SolveStatus::BadFuncEval)
                            }
                            Err(LsFailure::Numeric) => {
                                phase = Phase::Done(SolveStatus::NumericalError)
                            }
                        }
                    }
                }
            }

            Phase::ConvergenceCheck => {
                it += 1;
                {
                    let _t = timers.scoped(PerfSection::Residuals);
                    m = measure(pobj, &ws.r_eq, &ws.r_in, &ws.cur.s, &ws.cur.l);
                }
                if any_non_finite(&[&ws.cur.z, &ws.cur.y, &ws.cur.l, &ws.cur.s]) {
                    phase = Phase::Done(SolveStatus::NumericalError);
                    continue;
                }
                if settings.print_level >= 2 {
                    iteration_row(sink, it, &m, sigma, info.step_aff, info.step_cc);
                }
                if diag.should_log(it) {
                    eprintln!(
                        "[nmpc] it {:4}  res_eq {:9.2e}  res_ineq {:9.2e}  mu {:9.2e}  sigma {:5.3}  step {:6.4}  socs {}  bumps {}",
                        it, m.res_eq, m.res_ineq, m.mu, sigma, info.step_cc, socs_last,
                        kkt.dynamic_bumps()
                    );
                    if diag.print_kkt_residuals {
                        eprintln!("[nmpc]       predictor eq rows off by {:9.2e}", kkt_eq_res);
                    }
                }
                phase = if converged(&m, settings) {
                    Phase::Done(SolveStatus::Optimal)
                } else if it >= settings.max_it {
                    Phase::Done(SolveStatus::MaxItReached)
                } else {
                    Phase::AffineStep
                };
            }

            Phase::Done(status) => break status,
        }
    };

    info.it = it;
    info.it2opt = if status == SolveStatus::Optimal {
        it as i32
    } else {
        -1
    };
    info.res_eq = m.res_eq;
    info.res_ineq = m.res_ineq;
    info.pobj = m.pobj;
    info.dobj = m.dobj;
    info.dgap = m.dgap;
    info.rdgap = m.rdgap;
    info.mu = m.mu;
    info.mu_aff = mu_aff;
    info.sigma = sigma;
    info.solvetime = t_start.elapsed().as_secs_f64();
    info.fevalstime = timers.function_evals.as_secs_f64();

    if settings.print_level >= 1 {
        summary(sink, status, &info);
    }

    Ok(SolveResult {
        status,
        stage_output: asm.split_stages(&ws.cur.z),
        info,
    })
}

fn banner(sink: &mut dyn Write, asm: &Assembler, settings: &SolverSettings) {
    let rule = "-".repeat(96);
    let _ = writeln!(sink, "{rule}");
    let _ = writeln!(sink, "nmpc-core primal-dual interior-point solver");
    let _ = writeln!(
        sink,
        "stages {:4}   vars {:6}   eq {:6}   ineq {:6}   method {:?}   max_it {}",
        asm.horizon(),
        asm.nz(),
        asm.me(),
        asm.mi(),
        settings.method,
        settings.max_it
    );
    let _ = writeln!(sink, "{rule}");
    let _ = writeln!(
        sink,
        "{:>4}  {:>10}  {:>10}  {:>12}  {:>10}  {:>10}  {:>8}  {:>6}  {:>6}",
        "it", "res_eq", "res_ineq", "pobj", "rdgap", "mu", "sigma", "a_aff", "a_cc"
    );
    let _ = writeln!(sink, "{rule}");
}

fn iteration_row(
    sink: &mut dyn Write,
    it: usize,
    m: &ConvergenceMeasures,
    sigma: f64,
    step_aff: f64,
    step_cc: f64,
) {
    let _ = writeln!(
        sink,
        "{:>4}  {:>10.3e}  {:>10.3e}  {:>12.5e}  {:>10.3e}  {:>10.3e}  {:>8.2e}  {:>6.4}  {:>6.4}",
        it, m.res_eq, m.res_ineq, m.pobj, m.rdgap, m.mu, sigma, step_aff, step_cc
    );
}

fn summary(sink: &mut dyn Write, status: SolveStatus, info: &SolveInfo) {
    let rule = "-".repeat(96);
    let _ = writeln!(sink, "{rule}");
    let _ = writeln!(sink, "status: {} (exit code {})", status, status.exit_code());
    let _ = writeln!(
        sink,
        "iterations {:5}   solve time {:9.3} ms   function evals {:9.3} ms",
        info.it,
        info.solvetime * 1e3,
        info.fevalstime * 1e3
    );
    let _ = writeln!(
        sink,
        "res_eq {:9.2e}   res_ineq {:9.2e}   rdgap {:9.2e}   pobj {:+.6e}",
        info.res_eq, info.res_ineq, info.rdgap, info.pobj
    );
    let _ = writeln!(sink, "{rule}");
}
