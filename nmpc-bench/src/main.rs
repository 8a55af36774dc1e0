//! Benchmarking CLI for the nmpc-core solver.

use std::time::Instant;

use nmpc_core::{
    solve, EvaluatorMap, ProblemDims, SolverParams, SolverSettings, StageDims, StageEvaluator,
    StageInputs, StageOutputs,
};

/// Double-integrator regulation: `z = [a, p, v]`, Euler step 0.1 s,
/// acceleration bounded to [-1.5, 1.5].
struct IntegratorStage;

impl StageEvaluator for IntegratorStage {
    fn evaluate(&self, inputs: &StageInputs<'_>, outputs: &mut StageOutputs<'_>) {
        const DT: f64 = 0.1;
        let a = inputs.z[0];
        let p = inputs.z[1];
        let v = inputs.z[2];

        if let Some(f) = outputs.f.as_deref_mut() {
            *f += 0.5 * (0.1 * a * a + 10.0 * p * p + v * v);
        }
        if let Some(g) = outputs.grad_f.as_deref_mut() {
            g[0] = 0.1 * a;
            g[1] = 10.0 * p;
            g[2] = v;
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
            h[0] = a - 1.5;
            h[1] = -a - 1.5;
        }
        if let Some(jh) = outputs.jac_h.as_deref_mut() {
            jh[0] = 1.0;
            jh[1] = -1.0;
        }
        if let Some(hess) = outputs.hess.as_deref_mut() {
            hess[0] = 0.1;
            hess[4] = 10.0;
            hess[8] = 1.0;
        }
    }

    fn provides_hessian(&self) -> bool {
        true
    }
}

fn integrator_problem(horizon: usize) -> (ProblemDims, SolverParams) {
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
    let params = SolverParams {
        xinit: vec![2.0, 0.0],
        x0: vec![0.0; dims.num_vars()],
        all_parameters: vec![],
    };
    (dims, params)
}

/// Kinematic vehicle steered around a circular obstacle while staying
/// inside an annulus. `z = [force, steer, x, y, v, theta]`, curvature
/// only through the constraints, so the solver runs on BFGS.
struct VehicleStage;

impl VehicleStage {
    const DT: f64 = 0.1;
}

impl StageEvaluator for VehicleStage {
    fn evaluate(&self, inputs: &StageInputs<'_>, outputs: &mut StageOutputs<'_>) {
        let force = inputs.z[0];
        let steer = inputs.z[1];
        let x = inputs.z[2];
        let y = inputs.z[3];
        let v = inputs.z[4];
        let theta = inputs.z[5];

        if let Some(f) = outputs.f.as_deref_mut() {
            *f += -100.0 * y + 0.1 * force * force + 0.01 * steer * steer;
        }
        if let Some(g) = outputs.grad_f.as_deref_mut() {
            g[0] = 0.2 * force;
            g[1] = 0.02 * steer;
            g[3] = -100.0;
        }
        if let Some(c) = outputs.c.as_deref_mut() {
            c[0] = x + Self::DT * v * theta.cos();
            c[1] = y + Self::DT * v * theta.sin();
            c[2] = v + Self::DT * force;
            c[3] = theta + Self::DT * steer;
        }
        if let Some(jc) = outputs.jac_c.as_deref_mut() {
            // Column-major 4x6, columns [force, steer, x, y, v, theta].
            jc[2] = Self::DT;
            jc[7] = Self::DT;
            jc[8] = 1.0;
            jc[13] = 1.0;
            jc[16] = Self::DT * theta.cos();
            jc[17] = Self::DT * theta.sin();
            jc[18] = 1.0;
            jc[20] = -Self::DT * v * theta.sin();
            jc[21] = Self::DT * v * theta.cos();
            jc[23] = 1.0;
        }
        if let Some(h) = outputs.h.as_deref_mut() {
            h[0] = force - 5.0;
            h[1] = -force - 5.0;
            h[2] = steer - 1.0;
            h[3] = -steer - 1.0;
            h[4] = 1.0 - x * x - y * y;
            h[5] = x * x + y * y - 9.0;
            h[6] = 0.9025 - (x + 2.0) * (x + 2.0) - (y - 2.5) * (y - 2.5);
        }
        if let Some(jh) = outputs.jac_h.as_deref_mut() {
            // Column-major 7x6.
            jh[0] = 1.0;
            jh[1] = -1.0;
            jh[9] = 1.0;
            jh[10] = -1.0;
            jh[18] = -2.0 * x;
            jh[19] = 2.0 * x;
            jh[20] = -2.0 * (x + 2.0);
            jh[25] = -2.0 * y;
            jh[26] = 2.0 * y;
            jh[27] = -2.0 * (y - 2.5);
        }
    }
}

fn vehicle_problem(horizon: usize) -> (ProblemDims, SolverParams) {
    let dims = ProblemDims::uniform(
        horizon,
        StageDims {
            nvar: 6,
            nstate: 4,
            state_offset: 2,
            ndyn: 4,
            nineq: 7,
            nparam: 0,
        },
    );
    let xinit = vec![-2.0, 0.0, 0.0, 2.0944];
    let mut x0 = Vec::with_capacity(dims.num_vars());
    for _ in 0..horizon {
        x0.extend_from_slice(&[0.0, 0.0, -2.0, 0.0, 0.0, 2.0944]);
    }
    let params = SolverParams {
        xinit,
        x0,
        all_parameters: vec![],
    };
    (dims, params)
}

fn run_benchmark(
    name: &str,
    dims: &ProblemDims,
    evals: &EvaluatorMap<'_>,
    params: &SolverParams,
    settings: &SolverSettings,
) {
    println!("\n{}", "=".repeat(60));
    println!("{}", name);
    println!("{}", "=".repeat(60));
    println!("Stages:           {}", dims.horizon());
    println!("Variables:        {}", dims.num_vars());
    println!("Equality rows:    {}", dims.num_eq());
    println!("Inequality rows:  {}", dims.num_ineq());
    println!();

    let start = Instant::now();
    match solve(dims, params, evals, settings) {
        Ok(res) => {
            let elapsed = start.elapsed();
            println!("Status:           {}", res.status);
            println!("Iterations:       {}", res.info.it);
            println!("Objective:        {:.6e}", res.info.pobj);
            println!("res_eq:           {:.3e}", res.info.res_eq);
            println!("res_ineq:         {:.3e}", res.info.res_ineq);
            println!("Solve time:       {:.3} ms", elapsed.as_secs_f64() * 1000.0);
            if res.info.it > 0 {
                println!(
                    "Time/iteration:   {:.3} ms",
                    elapsed.as_secs_f64() * 1000.0 / res.info.it as f64
                );
            }
            println!(
                "Function evals:   {:.3} ms",
                res.info.fevalstime * 1000.0
            );
        }
        Err(e) => {
            println!("ERROR: {}", e);
        }
    }
}

fn main() {
    println!("nmpc-core Solver Benchmarks");
    println!("===========================\n");

    let mut qp = SolverSettings::qp();
    qp.print_level = 0;
    let mut nlp = SolverSettings::nlp();
    nlp.print_level = 0;

    let integrator = IntegratorStage;
    for &horizon in &[10, 50, 200] {
        let (dims, params) = integrator_problem(horizon);
        let evals = EvaluatorMap::uniform(&integrator, horizon);
        run_benchmark(
            &format!("Double integrator QP (N={})", horizon),
            &dims,
            &evals,
            &params,
            &qp,
        );
    }

    let vehicle = VehicleStage;
    for &horizon in &[20, 50] {
        let (dims, params) = vehicle_problem(horizon);
        let evals = EvaluatorMap::uniform(&vehicle, horizon);
        run_benchmark(
            &format!("Vehicle obstacle NLP (N={})", horizon),
            &dims,
            &evals,
            &params,
            &nlp,
        );
    }

    println!("\n{}", "=".repeat(60));
    println!("Benchmarks complete");
    println!("{}", "=".repeat(60));
}
