//! Predictor-corrector building blocks shared by both solver variants.
//!
//! With slacks and inequality multipliers eliminated, every direction
//! in one iteration solves the same reduced system against the same
//! factorization; only the complementarity right-hand side `rc` and
//! the constraint residuals change between the affine predictor, the
//! centering corrector, and second-order corrections:
//!
//! ```text
//!   rhs_z = -r_d - J_h' S^{-1} (rc + L r_in)
//!   rhs_y = -r_eq
//!   ds    = -r_in - J_h dz
//!   dl    = S^{-1} (rc - L ds)
//! ```

use crate::assembler::Assembler;
use crate::ipm::termination::any_non_finite;
use crate::ipm::workspace::Direction;
use crate::linalg::kkt::{KktError, KktSolver};

/// Average complementarity product `s' l / m`, zero without
/// inequalities.
pub fn duality_measure(s: &[f64], l: &[f64]) -> f64 {
    if s.is_empty() {
        return 0.0;
    }
    let dot: f64 = s.iter().zip(l).map(|(a, b)| a * b).sum();
    dot / s.len() as f64
}

/// Duality measure after moving `alpha` along the direction.
pub fn mu_after_step(s: &[f64], l: &[f64], ds: &[f64], dl: &[f64], alpha: f64) -> f64 {
    if s.is_empty() {
        return 0.0;
    }
    let mut acc = 0.0;
    for j in 0..s.len() {
        acc += (s[j] + alpha * ds[j]) * (l[j] + alpha * dl[j]);
    }
    acc / s.len() as f64
}

/// Mehrotra centering parameter `(mu_aff / mu)^3`, clamped to [0, 1].
pub fn centering_sigma(mu: f64, mu_aff: f64) -> f64 {
    if mu <= 0.0 {
        return 0.0;
    }
    let ratio = (mu_aff / mu.max(1e-10)).max(0.0);
    (ratio * ratio * ratio).clamp(0.0, 1.0)
}

/// Largest step that keeps `v + alpha dv` nonnegative, infinity when
/// no component decreases.
pub fn max_step_to_boundary(v: &[f64], dv: &[f64]) -> f64 {
    let mut alpha = f64::INFINITY;
    for (&vi, &dvi) in v.iter().zip(dv) {
        if dvi < 0.0 {
            alpha = alpha.min(-vi / dvi);
        }
    }
    alpha
}

/// Joint primal-dual fraction-to-boundary step, capped at 1.
pub fn ftb_step(s: &[f64], ds: &[f64], l: &[f64], dl: &[f64], fraction: f64) -> f64 {
    let alpha = max_step_to_boundary(s, ds).min(max_step_to_boundary(l, dl));
    if alpha.is_infinite() {
        1.0
    } else {
        (fraction * alpha).min(1.0)
    }
}

/// Complementarity right-hand side of the affine predictor.
pub fn affine_rc(s: &[f64], l: &[f64], rc: &mut [f64]) {
    for j in 0..s.len() {
        rc[j] = -s[j] * l[j];
    }
}

/// Complementarity right-hand side of the centering corrector,
/// including the Mehrotra second-order term from the affine direction.
pub fn corrector_rc(s: &[f64], l: &[f64], aff: &Direction, sigma_mu: f64, rc: &mut [f64]) {
    for j in 0..s.len() {
        rc[j] = sigma_mu - s[j] * l[j] - aff.ds[j] * aff.dl[j];
    }
}

/// One reduced-system solve plus slack and multiplier recovery.
#[allow(clippy::too_many_arguments)]
pub fn solve_kkt_direction(
    asm: &Assembler,
    kkt: &mut KktSolver,
    s: &[f64],
    l: &[f64],
    rc: &[f64],
    r_d: &[f64],
    r_eq: &[f64],
    r_in: &[f64],
    tmp_mi: &mut [f64],
    rhs_z: &mut [f64],
    rhs_y: &mut [f64],
    out: &mut Direction,
) -> Result<(), KktError> {
    for j in 0..s.len() {
        tmp_mi[j] = -(rc[j] + l[j] * r_in[j]) / s[j];
    }
    for (dst, &v) in rhs_z.iter_mut().zip(r_d) {
        *dst = -v;
    }
    asm.add_jac_ineq_t(tmp_mi, rhs_z);
    for (dst, &v) in rhs_y.iter_mut().zip(r_eq) {
        *dst = -v;
    }

    kkt.solve(rhs_z, rhs_y, &mut out.dz, &mut out.dy)?;

    asm.jac_ineq_apply(&out.dz, &mut out.ds);
    for j in 0..s.len() {
        out.ds[j] = -r_in[j] - out.ds[j];
        out.dl[j] = (rc[j] - l[j] * out.ds[j]) / s[j];
    }

    // `ldl` propagates NaN/Inf through factor and solve instead of
    // erroring, so a breakdown surfaces here, in the direction itself.
    if any_non_finite(&[&out.dz, &out.dy, &out.ds, &out.dl]) {
        return Err(KktError::NonFiniteDirection);
    }
    Ok(())
}
