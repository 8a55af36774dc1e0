//! Horizon assembly: turns per-stage evaluator output into the stacked
//! vectors and block matrices the interior-point iteration consumes.
//!
//! All offsets, the equality-selector indices, and every buffer size
//! are fixed when the assembler is built; evaluation sweeps only
//! rewrite values. Equality rows are ordered stage by stage: the block
//! of stage 0 pins its state sub-block to `xinit`, the block of stage
//! `i + 1` pins its state sub-block to the dynamics output of stage
//! `i`. `eq_target` holds the pinned values, so the equality residual
//! is always `z[sel_index[r]] - eq_target[r]`.

use crate::evaluator::{EvaluatorMap, NonFiniteEval, StageInputs, StageOutputs};
use crate::problem::{ProblemDims, SolverParams, StageDims};

pub struct Assembler {
    stages: Vec<StageDims>,
    nz: usize,
    me: usize,
    mi: usize,
    var_off: Vec<usize>,
    eq_off: Vec<usize>,
    ineq_off: Vec<usize>,
    par_off: Vec<usize>,
    /// Variable index pinned by each equality row.
    sel_index: Vec<usize>,
    grad: Vec<f64>,
    eq_target: Vec<f64>,
    h_all: Vec<f64>,
    jac_c: Vec<Vec<f64>>,
    jac_h: Vec<Vec<f64>>,
    hess: Vec<Vec<f64>>,
    phi: Vec<Vec<f64>>,
}

impl Assembler {
    pub fn new(dims: &ProblemDims) -> Self {
        let n = dims.horizon();
        let mut var_off = Vec::with_capacity(n + 1);
        let mut eq_off = Vec::with_capacity(n + 1);
        let mut ineq_off = Vec::with_capacity(n + 1);
        let mut par_off = Vec::with_capacity(n + 1);
        let (mut vo, mut eo, mut io, mut po) = (0, 0, 0, 0);
        for s in &dims.stages {
            var_off.push(vo);
            eq_off.push(eo);
            ineq_off.push(io);
            par_off.push(po);
            vo += s.nvar;
            eo += s.nstate;
            io += s.nineq;
            po += s.nparam;
        }
        var_off.push(vo);
        eq_off.push(eo);
        ineq_off.push(io);
        par_off.push(po);

        let mut sel_index = Vec::with_capacity(eo);
        for (i, s) in dims.stages.iter().enumerate() {
            for k in 0..s.nstate {
                sel_index.push(var_off[i] + s.state_offset + k);
            }
        }

        Self {
            stages: dims.stages.clone(),
            nz: vo,
            me: eo,
            mi: io,
            var_off,
            eq_off,
            ineq_off,
            par_off,
            sel_index,
            grad: vec![0.0; vo],
            eq_target: vec![0.0; eo],
            h_all: vec![0.0; io],
            jac_c: dims.stages.iter().map(|s| vec![0.0; s.ndyn * s.nvar]).collect(),
            jac_h: dims.stages.iter().map(|s| vec![0.0; s.nineq * s.nvar]).collect(),
            hess: dims.stages.iter().map(|s| vec![0.0; s.nvar * s.nvar]).collect(),
            phi: dims.stages.iter().map(|s| vec![0.0; s.nvar * s.nvar]).collect(),
        }
    }

    /// Stores the measured state into the stage-0 equality target.
    pub fn set_xinit(&mut self, xinit: &[f64]) {
        let ns0 = self.stages[0].nstate;
        debug_assert_eq!(xinit.len(), ns0);
        self.eq_target[..ns0].copy_from_slice(xinit);
    }

    pub fn horizon(&self) -> usize {
        self.stages.len()
    }

    pub fn nz(&self) -> usize {
        self.nz
    }

    pub fn me(&self) -> usize {
        self.me
    }

    pub fn mi(&self) -> usize {
        self.mi
    }

    pub fn stage_dims(&self, i: usize) -> &StageDims {
        &self.stages[i]
    }

    pub fn var_offset(&self, i: usize) -> usize {
        self.var_off[i]
    }

    pub fn eq_offset(&self, i: usize) -> usize {
        self.eq_off[i]
    }

    pub fn ineq_offset(&self, i: usize) -> usize {
        self.ineq_off[i]
    }

    pub fn sel_index(&self) -> &[usize] {
        &self.sel_index
    }

    pub fn grad(&self) -> &[f64] {
        &self.grad
    }

    pub fn eq_target(&self) -> &[f64] {
        &self.eq_target
    }

    pub fn ineq_values(&self) -> &[f64] {
        &self.h_all
    }

    pub fn phi(&self, i: usize) -> &[f64] {
        &self.phi[i]
    }

    pub fn jac_c(&self, i: usize) -> &[f64] {
        &self.jac_c[i]
    }

    pub fn jac_c_mut(&mut self, i: usize) -> &mut [f64] {
        &mut self.jac_c[i]
    }

    pub fn jac_h(&self, i: usize) -> &[f64] {
        &self.jac_h[i]
    }

    pub fn hess_mut(&mut self, i: usize) -> &mut [f64] {
        &mut self.hess[i]
    }

    /// Full evaluation sweep at `z`: objective, gradient, dynamics and
    /// inequality values with their Jacobians, and (when requested and
    /// offered) the exact Lagrangian Hessian. Returns the total
    /// objective, or the non-finite marker as soon as any stage writes
    /// one.
    pub fn eval_full(
        &mut self,
        evals: &EvaluatorMap<'_>,
        z: &[f64],
        y: &[f64],
        l: &[f64],
        params: &SolverParams,
        want_hessian: bool,
    ) -> Result<f64, NonFiniteEval> {
        debug_assert_eq!(z.len(), self.nz);
        debug_assert_eq!(y.len(), self.me);
        debug_assert_eq!(l.len(), self.mi);

        let mut f_total = 0.0;
        for i in 0..self.stages.len() {
            let sd = self.stages[i];
            let v0 = self.var_off[i];
            let q0 = self.ineq_off[i];
            {
                let grad = &mut self.grad[v0..v0 + sd.nvar];
                grad.fill(0.0);
                let jh = &mut self.jac_h[i];
                jh.fill(0.0);
                let jc = &mut self.jac_c[i];
                jc.fill(0.0);
                let hs = &mut self.hess[i];
                if want_hessian {
                    hs.fill(0.0);
                }
                let (c_slot, jc_slot) = if sd.ndyn > 0 {
                    let c = &mut self.eq_target[self.eq_off[i + 1]..self.eq_off[i + 1] + sd.ndyn];
                    c.fill(0.0);
                    (Some(c), Some(&mut jc[..]))
                } else {
                    (None, None)
                };
                let h_slot = if sd.nineq > 0 {
                    let h = &mut self.h_all[q0..q0 + sd.nineq];
                    h.fill(0.0);
                    Some(h)
                } else {
                    None
                };

                let inputs = StageInputs {
                    stage: i,
                    z: &z[v0..v0 + sd.nvar],
                    p: &params.all_parameters[self.par_off[i]..self.par_off[i] + sd.nparam],
                    y: if sd.ndyn > 0 {
                        &y[self.eq_off[i + 1]..self.eq_off[i + 1] + sd.ndyn]
                    } else {
                        &[]
                    },
                    l: &l[q0..q0 + sd.nineq],
                };
                let mut out = StageOutputs {
                    f: Some(&mut f_total),
                    grad_f: Some(&mut self.grad[v0..v0 + sd.nvar]),
                    c: c_slot,
                    jac_c: jc_slot,
                    h: h_slot,
                    jac_h: if sd.nineq > 0 { Some(&mut self.jac_h[i][..]) } else { None },
                    hess: if want_hessian { Some(&mut self.hess[i][..]) } else { None },
                };
                evals.stage(i).evaluate(&inputs, &mut out);
            }

            let finite = f_total.is_finite()
                && all_finite(&self.grad[v0..v0 + sd.nvar])
                && all_finite(&self.jac_c[i])
                && all_finite(&self.jac_h[i])
                && all_finite(&self.h_all[q0..q0 + sd.nineq])
                && (sd.ndyn == 0
                    || all_finite(
                        &self.eq_target[self.eq_off[i + 1]..self.eq_off[i + 1] + sd.ndyn],
                    ))
                && (!want_hessian || all_finite(&self.hess[i]));
            if !finite {
                return Err(NonFiniteEval);
            }
        }
        Ok(f_total)
    }

    /// Values-only sweep into caller-owned buffers, used for trial
    /// points during the line search without disturbing the iterate's
    /// own derivative data. `eq_target_out` gets the `xinit` block
    /// copied in front of the freshly evaluated dynamics outputs.
    pub fn eval_constraints(
        &self,
        evals: &EvaluatorMap<'_>,
        z: &[f64],
        y: &[f64],
        l: &[f64],
        params: &SolverParams,
        f_out: &mut f64,
        eq_target_out: &mut [f64],
        h_out: &mut [f64],
    ) -> Result<(), NonFiniteEval> {
        debug_assert_eq!(z.len(), self.nz);
        debug_assert_eq!(eq_target_out.len(), self.me);
        debug_assert_eq!(h_out.len(), self.mi);

        let ns0 = self.stages[0].nstate;
        eq_target_out[..ns0].copy_from_slice(&self.eq_target[..ns0]);
        *f_out = 0.0;

        for i in 0..self.stages.len() {
            let sd = self.stages[i];
            let v0 = self.var_off[i];
            let q0 = self.ineq_off[i];
            let c_slot = if sd.ndyn > 0 {
                let c = &mut eq_target_out[self.eq_off[i + 1]..self.eq_off[i + 1] + sd.ndyn];
                c.fill(0.0);
                Some(c)
            } else {
                None
            };
            let h_slot = if sd.nineq > 0 {
                let h = &mut h_out[q0..q0 + sd.nineq];
                h.fill(0.0);
                Some(h)
            } else {
                None
            };

            let inputs = StageInputs {
                stage: i,
                z: &z[v0..v0 + sd.nvar],
                p: &params.all_parameters[self.par_off[i]..self.par_off[i] + sd.nparam],
                y: if sd.ndyn > 0 {
                    &y[self.eq_off[i + 1]..self.eq_off[i + 1] + sd.ndyn]
                } else {
                    &[]
                },
                l: &l[q0..q0 + sd.nineq],
            };
            let mut out = StageOutputs {
                f: Some(&mut *f_out),
                c: c_slot,
                h: h_slot,
                ..Default::default()
            };
            evals.stage(i).evaluate(&inputs, &mut out);

            let finite = f_out.is_finite()
                && all_finite(&h_out[q0..q0 + sd.nineq])
                && (sd.ndyn == 0
                    || all_finite(
                        &eq_target_out[self.eq_off[i + 1]..self.eq_off[i + 1] + sd.ndyn],
                    ));
            if !finite {
                return Err(NonFiniteEval);
            }
        }
        Ok(())
    }

    /// Equality residual against the targets of the last full sweep.
    pub fn eq_residual(&self, z: &[f64], out: &mut [f64]) {
        self.eq_residual_with(z, &self.eq_target, out);
    }

    pub fn eq_residual_with(&self, z: &[f64], eq_target: &[f64], out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.me);
        for (r, &zi) in self.sel_index.iter().enumerate() {
            out[r] = z[zi] - eq_target[r];
        }
    }

    /// Inequality residual `h + s` against the last full sweep.
    pub fn ineq_residual(&self, s: &[f64], out: &mut [f64]) {
        self.ineq_residual_with(&self.h_all, s, out);
    }

    pub fn ineq_residual_with(&self, h: &[f64], s: &[f64], out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.mi);
        for j in 0..self.mi {
            out[j] = h[j] + s[j];
        }
    }

    /// Stationarity residual `grad f + J_e' y + J_h' l`.
    pub fn dual_residual(&self, y: &[f64], l: &[f64], out: &mut [f64]) {
        out.copy_from_slice(&self.grad);
        self.add_jac_eq_t(y, out);
        self.add_jac_ineq_t(l, out);
    }

    /// `out += J_e' y`.
    pub fn add_jac_eq_t(&self, y: &[f64], out: &mut [f64]) {
        debug_assert_eq!(y.len(), self.me);
        for (r, &zi) in self.sel_index.iter().enumerate() {
            out[zi] += y[r];
        }
        for i in 0..self.stages.len() {
            let nd = self.stages[i].ndyn;
            if nd == 0 {
                continue;
            }
            let n = self.stages[i].nvar;
            let off = self.var_off[i];
            let jc = &self.jac_c[i];
            let y_i = &y[self.eq_off[i + 1]..self.eq_off[i + 1] + nd];
            for j in 0..n {
                let mut acc = 0.0;
                for k in 0..nd {
                    acc += jc[j * nd + k] * y_i[k];
                }
                out[off + j] -= acc;
            }
        }
    }

    /// `out += J_h' l`.
    pub fn add_jac_ineq_t(&self, l: &[f64], out: &mut [f64]) {
        debug_assert_eq!(l.len(), self.mi);
        for i in 0..self.stages.len() {
            let q = self.stages[i].nineq;
            if q == 0 {
                continue;
            }
            let n = self.stages[i].nvar;
            let off = self.var_off[i];
            let jh = &self.jac_h[i];
            let l_i = &l[self.ineq_off[i]..self.ineq_off[i] + q];
            for j in 0..n {
                let mut acc = 0.0;
                for k in 0..q {
                    acc += jh[j * q + k] * l_i[k];
                }
                out[off + j] += acc;
            }
        }
    }

    /// `out = J_e dz`.
    pub fn jac_eq_apply(&self, dz: &[f64], out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.me);
        for (r, &zi) in self.sel_index.iter().enumerate() {
            out[r] = dz[zi];
        }
        for i in 0..self.stages.len() {
            let nd = self.stages[i].ndyn;
            if nd == 0 {
                continue;
            }
            let n = self.stages[i].nvar;
            let off = self.var_off[i];
            let jc = &self.jac_c[i];
            let r0 = self.eq_off[i + 1];
            for j in 0..n {
                for k in 0..nd {
                    out[r0 + k] -= jc[j * nd + k] * dz[off + j];
                }
            }
        }
    }

    /// `out = J_h dz`.
    pub fn jac_ineq_apply(&self, dz: &[f64], out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.mi);
        for i in 0..self.stages.len() {
            let q = self.stages[i].nineq;
            if q == 0 {
                continue;
            }
            let n = self.stages[i].nvar;
            let off = self.var_off[i];
            let jh = &self.jac_h[i];
            let r0 = self.ineq_off[i];
            for k in 0..q {
                let mut acc = 0.0;
                for j in 0..n {
                    acc += jh[j * q + k] * dz[off + j];
                }
                out[r0 + k] = acc;
            }
        }
    }

    /// Rebuilds the per-stage condensed blocks
    /// `Phi_i = H_i + J_h,i' diag(w_i) J_h,i` with `w = l / s`.
    pub fn build_phi(&mut self, w: &[f64]) {
        debug_assert_eq!(w.len(), self.mi);
        for i in 0..self.stages.len() {
            let sd = self.stages[i];
            let n = sd.nvar;
            let q = sd.nineq;
            let phi = &mut self.phi[i];
            phi.copy_from_slice(&self.hess[i]);
            if q == 0 {
                continue;
            }
            let jh = &self.jac_h[i];
            let w_i = &w[self.ineq_off[i]..self.ineq_off[i] + q];
            for c in 0..n {
                for r in 0..=c {
                    let mut acc = 0.0;
                    for k in 0..q {
                        acc += jh[r * q + k] * w_i[k] * jh[c * q + k];
                    }
                    phi[c * n + r] += acc;
                    if r != c {
                        phi[r * n + c] += acc;
                    }
                }
            }
        }
    }

    /// Splits a stacked primal vector into per-stage blocks.
    pub fn split_stages(&self, z: &[f64]) -> Vec<Vec<f64>> {
        (0..self.stages.len())
            .map(|i| z[self.var_off[i]..self.var_off[i] + self.stages[i].nvar].to_vec())
            .collect()
    }
}

fn all_finite(xs: &[f64]) -> bool {
    xs.iter().all(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::StageEvaluator;

    fn dims() -> ProblemDims {
        // Two stages of [control, state] with scalar coupling and one
        // inequality row each.
        ProblemDims::new(vec![
            StageDims {
                nvar: 2,
                nstate: 1,
                state_offset: 1,
                ndyn: 1,
                nineq: 1,
                nparam: 0,
            },
            StageDims {
                nvar: 2,
                nstate: 1,
                state_offset: 1,
                ndyn: 0,
                nineq: 1,
                nparam: 0,
            },
        ])
    }

    /// f = 0.5 |z|^2, c = u + x, h = u - 1.
    struct Toy;

    impl StageEvaluator for Toy {
        fn evaluate(&self, inputs: &StageInputs<'_>, out: &mut StageOutputs<'_>) {
            let (u, x) = (inputs.z[0], inputs.z[1]);
            if let Some(f) = out.f.as_deref_mut() {
                *f += 0.5 * (u * u + x * x);
            }
            if let Some(g) = out.grad_f.as_deref_mut() {
                g[0] = u;
                g[1] = x;
            }
            if let Some(c) = out.c.as_deref_mut() {
                c[0] = u + x;
            }
            if let Some(jc) = out.jac_c.as_deref_mut() {
                jc[0] = 1.0;
                jc[1] = 1.0;
            }
            if let Some(h) = out.h.as_deref_mut() {
                h[0] = u - 1.0;
            }
            if let Some(jh) = out.jac_h.as_deref_mut() {
                jh[0] = 1.0;
            }
        }
    }

    #[test]
    fn test_eval_full_and_residuals() {
        let dims = dims();
        let mut asm = Assembler::new(&dims);
        asm.set_xinit(&[5.0]);

        let ev = Toy;
        let evals = EvaluatorMap::uniform(&ev, 2);
        let params = SolverParams {
            xinit: vec![5.0],
            x0: vec![0.0; 4],
            all_parameters: vec![],
        };

        let z = [1.0, 2.0, 3.0, 4.0];
        let y = [1.0, -1.0];
        let l = [2.0, 3.0];
        let f = asm
            .eval_full(&evals, &z, &y, &l, &params, false)
            .unwrap();
        assert!((f - 15.0).abs() < 1e-14);

        assert_eq!(asm.sel_index(), &[1, 3]);
        assert_eq!(asm.eq_target(), &[5.0, 3.0]);
        assert_eq!(asm.ineq_values(), &[0.0, 2.0]);

        let mut r_eq = vec![0.0; 2];
        asm.eq_residual(&z, &mut r_eq);
        assert_eq!(r_eq, vec![-3.0, 1.0]);

        let mut r_in = vec![0.0; 2];
        asm.ineq_residual(&[1.0, 1.0], &mut r_in);
        assert_eq!(r_in, vec![1.0, 3.0]);

        let mut r_d = vec![0.0; 4];
        asm.dual_residual(&y, &l, &mut r_d);
        assert_eq!(r_d, vec![4.0, 4.0, 6.0, 3.0]);
    }

    #[test]
    fn test_jacobian_products() {
        let dims = dims();
        let mut asm = Assembler::new(&dims);
        asm.set_xinit(&[0.0]);
        let ev = Toy;
        let evals = EvaluatorMap::uniform(&ev, 2);
        let params = SolverParams {
            xinit: vec![0.0],
            x0: vec![0.0; 4],
            all_parameters: vec![],
        };
        let z = [1.0, 2.0, 3.0, 4.0];
        asm.eval_full(&evals, &z, &[0.0; 2], &[0.0; 2], &params, false)
            .unwrap();

        let mut out = vec![0.0; 2];
        asm.jac_eq_apply(&[1.0, 1.0, 1.0, 1.0], &mut out);
        assert_eq!(out, vec![1.0, -1.0]);

        asm.jac_ineq_apply(&z, &mut out);
        assert_eq!(out, vec![1.0, 3.0]);
    }

    #[test]
    fn test_build_phi_adds_barrier_curvature() {
        let dims = dims();
        let mut asm = Assembler::new(&dims);
        // jac_h = [1, 0] per stage.
        let ev = Toy;
        let evals = EvaluatorMap::uniform(&ev, 2);
        let params = SolverParams {
            xinit: vec![0.0],
            x0: vec![0.0; 4],
            all_parameters: vec![],
        };
        asm.set_xinit(&[0.0]);
        asm.eval_full(&evals, &[0.0; 4], &[0.0; 2], &[0.0; 2], &params, false)
            .unwrap();
        for i in 0..2 {
            asm.hess_mut(i).copy_from_slice(&[1.0, 0.0, 0.0, 1.0]);
        }

        asm.build_phi(&[2.0, 3.0]);
        assert_eq!(asm.phi(0), &[3.0, 0.0, 0.0, 1.0]);
        assert_eq!(asm.phi(1), &[4.0, 0.0, 0.0, 1.0]);
    }

    struct Poison;

    impl StageEvaluator for Poison {
        fn evaluate(&self, inputs: &StageInputs<'_>, out: &mut StageOutputs<'_>) {
            if let Some(h) = out.h.as_deref_mut() {
                h[0] = if inputs.stage == 1 { f64::NAN } else { 0.0 };
            }
        }
    }

    #[test]
    fn test_eval_full_reports_non_finite() {
        let dims = dims();
        let mut asm = Assembler::new(&dims);
        asm.set_xinit(&[0.0]);
        let ev = Poison;
        let evals = EvaluatorMap::uniform(&ev, 2);
        let params = SolverParams {
            xinit: vec![0.0],
            x0: vec![0.0; 4],
            all_parameters: vec![],
        };
        let res = asm.eval_full(&evals, &[0.0; 4], &[0.0; 2], &[0.0; 2], &params, false);
        assert!(res.is_err());
    }
}
