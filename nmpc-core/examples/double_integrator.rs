//! Double-integrator regulation over a receding horizon.
//!
//! Stage layout `z = [a, p, v]`: acceleration input first, then the
//! two states. Euler dynamics with a 0.1 s step drive the position
//! back to the origin under a symmetric acceleration bound.

use nmpc_core::{
    solve, EvaluatorMap, ProblemDims, SolverParams, SolverSettings, StageDims, StageEvaluator,
    StageInputs, StageOutputs,
};

const DT: f64 = 0.1;
const A_MAX: f64 = 1.5;

struct IntegratorStage {
    w_pos: f64,
    w_vel: f64,
    w_acc: f64,
}

impl StageEvaluator for IntegratorStage {
    fn evaluate(&self, inputs: &StageInputs<'_>, outputs: &mut StageOutputs<'_>) {
        let a = inputs.z[0];
        let p = inputs.z[1];
        let v = inputs.z[2];

        if let Some(f) = outputs.f.as_deref_mut() {
            *f += 0.5 * (self.w_acc * a * a + self.w_pos * p * p + self.w_vel * v * v);
        }
        if let Some(g) = outputs.grad_f.as_deref_mut() {
            g[0] = self.w_acc * a;
            g[1] = self.w_pos * p;
            g[2] = self.w_vel * v;
        }
        if let Some(c) = outputs.c.as_deref_mut() {
            c[0] = p + DT * v;
            c[1] = v + DT * a;
        }
        if let Some(jc) = outputs.jac_c.as_deref_mut() {
            jc[1] = DT;
            jc[2] = 1.0;
            jc[4] = DT;
            jc[5] = 1.0;
        }
        if let Some(h) = outputs.h.as_deref_mut() {
            h[0] = a - A_MAX;
            h[1] = -a - A_MAX;
        }
        if let Some(jh) = outputs.jac_h.as_deref_mut() {
            jh[0] = 1.0;
            jh[1] = -1.0;
        }
        if let Some(hess) = outputs.hess.as_deref_mut() {
            hess[0] = self.w_acc;
            hess[4] = self.w_pos;
            hess[8] = self.w_vel;
        }
    }

    fn provides_hessian(&self) -> bool {
        true
    }
}

fn main() {
    let horizon = 20;
    let dims = ProblemDims::uniform(
        horizon,
        StageDims {
            nvar: 3,
            nstate: 2,
            state_offset: 1,
            ndyn: 2,
            nineq: 2,
            nparam: 0,
        },
    );

    let stage = IntegratorStage {
        w_pos: 10.0,
        w_vel: 1.0,
        w_acc: 0.1,
    };
    let evals = EvaluatorMap::uniform(&stage, horizon);
    let params = SolverParams {
        xinit: vec![2.0, 0.0],
        x0: vec![0.0; dims.num_vars()],
        all_parameters: vec![],
    };
    let mut settings = SolverSettings::qp();
    settings.print_level = 2;

    match solve(&dims, &params, &evals, &settings) {
        Ok(result) => {
            println!();
            println!("{:>5}  {:>10}  {:>10}  {:>10}", "stage", "accel", "pos", "vel");
            println!("{}", "-".repeat(43));
            for (i, block) in result.stage_output.iter().enumerate() {
                println!(
                    "{:>5}  {:>10.5}  {:>10.5}  {:>10.5}",
                    i, block[0], block[1], block[2]
                );
            }
            println!("{}", "-".repeat(43));
            println!(
                "{} after {} iterations, {:.3} ms",
                result.status,
                result.info.it,
                result.info.solvetime * 1e3
            );
        }
        Err(err) => eprintln!("solve failed: {err}"),
    }
}
