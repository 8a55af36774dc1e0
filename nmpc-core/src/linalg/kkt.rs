//! Reduced KKT system of the stage chain.
//!
//! After eliminating slacks and inequality multipliers the Newton step
//! solves
//!
//! ```text
//!   [ Phi   J_e' ] [ dz ]   [ rhs_z ]
//!   [ J_e  -d I  ] [ dy ] = [ rhs_y ]
//! ```
//!
//! where `Phi` is block diagonal with one dense block per stage and
//! `J_e` stacks a unit selector per equality row plus the negated
//! dynamics Jacobian of the preceding stage. Only the upper triangle is
//! stored. The sparsity pattern is fixed at construction: a CAMD
//! fill-reducing ordering is computed once, the permuted pattern is
//! assembled once, and every iteration only rewrites values through
//! cached slot indices before refactorizing.

use crate::assembler::Assembler;
use crate::linalg::ldlt::{LdltError, LdltSolver};
use crate::linalg::sparse::{symm_matvec_upper, SparseCsc};
use sprs::TriMat;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KktError {
    #[error("fill-reducing ordering failed: {0}")]
    Ordering(String),
    #[error("KKT pattern is missing entry ({row}, {col})")]
    Structure { row: usize, col: usize },
    #[error("Newton direction contains non-finite values")]
    NonFiniteDirection,
    #[error(transparent)]
    Factorization(#[from] LdltError),
}

pub struct KktSolver {
    nz: usize,
    me: usize,
    dim: usize,
    ldlt: LdltSolver,
    kkt: SparseCsc,
    /// `perm[new] = old`.
    perm: Vec<usize>,
    /// `perm_inv[old] = new`.
    perm_inv: Vec<usize>,
    /// Per stage, data slots of the dense block's upper triangle in
    /// column-major order.
    phi_slots: Vec<Vec<usize>>,
    /// Per stage, data slots of the negated dynamics Jacobian in
    /// column-major order (empty for the terminal stage).
    jac_slots: Vec<Vec<usize>>,
    static_reg: f64,
    refine_iters: usize,
    rhs_perm: Vec<f64>,
    sol_perm: Vec<f64>,
    kx: Vec<f64>,
    resid: Vec<f64>,
    delta: Vec<f64>,
}

impl KktSolver {
    /// Builds the pattern, computes the ordering, and runs the symbolic
    /// factorization. Call once per problem structure.
    pub fn new(
        asm: &Assembler,
        static_reg: f64,
        dynamic_reg_min_pivot: f64,
        refine_iters: usize,
    ) -> Result<Self, KktError> {
        let nz = asm.nz();
        let me = asm.me();
        let dim = nz + me;

        let identity: Vec<usize> = (0..dim).collect();
        let unordered = build_matrix(asm, static_reg, &identity);
        let (perm, perm_inv) = camd_ordering(&unordered)?;
        let kkt = build_matrix(asm, static_reg, &perm_inv);

        let mut phi_slots = Vec::with_capacity(asm.horizon());
        let mut jac_slots = Vec::with_capacity(asm.horizon());
        for i in 0..asm.horizon() {
            let off = asm.var_offset(i);
            let n = asm.stage_dims(i).nvar;
            let mut slots = Vec::with_capacity(n * (n + 1) / 2);
            for c in 0..n {
                for r in 0..=c {
                    slots.push(find_slot(&kkt, &perm_inv, off + r, off + c)?);
                }
            }
            phi_slots.push(slots);

            let nd = asm.stage_dims(i).ndyn;
            let mut slots = Vec::with_capacity(nd * n);
            if nd > 0 {
                let row0 = nz + asm.eq_offset(i + 1);
                for j in 0..n {
                    for k in 0..nd {
                        slots.push(find_slot(&kkt, &perm_inv, off + j, row0 + k)?);
                    }
                }
            }
            jac_slots.push(slots);
        }

        let mut ldlt = LdltSolver::new(dim, static_reg, dynamic_reg_min_pivot);
        ldlt.symbolic_factorization(&kkt)?;

        Ok(Self {
            nz,
            me,
            dim,
            ldlt,
            kkt,
            perm,
            perm_inv,
            phi_slots,
            jac_slots,
            static_reg,
            refine_iters,
            rhs_perm: vec![0.0; dim],
            sol_perm: vec![0.0; dim],
            kx: vec![0.0; dim],
            resid: vec![0.0; dim],
            delta: vec![0.0; dim],
        })
    }

    /// Rewrites the `Phi` and dynamics-Jacobian values from the current
    /// assembler state and refactorizes. Selector and regularization
    /// entries are constant and never rewritten.
    pub fn factor(&mut self, asm: &Assembler) -> Result<(), KktError> {
        {
            let data = self.kkt.data_mut();
            for i in 0..asm.horizon() {
                let n = asm.stage_dims(i).nvar;
                let phi = asm.phi(i);
                let slots = &self.phi_slots[i];
                let mut idx = 0;
                for c in 0..n {
                    for r in 0..=c {
                        data[slots[idx]] = phi[c * n + r];
                        idx += 1;
                    }
                }

                let jac = asm.jac_c(i);
                for (k, &slot) in self.jac_slots[i].iter().enumerate() {
                    data[slot] = -jac[k];
                }
            }
        }
        self.ldlt.numeric_factorization(&self.kkt)?;
        Ok(())
    }

    /// Backsolves `[rhs_z; rhs_y]` against the last factorization with
    /// iterative refinement, splitting the solution back into the
    /// variable and multiplier parts.
    pub fn solve(
        &mut self,
        rhs_z: &[f64],
        rhs_y: &[f64],
        sol_z: &mut [f64],
        sol_y: &mut [f64],
    ) -> Result<(), KktError> {
        debug_assert_eq!(rhs_z.len(), self.nz);
        debug_assert_eq!(rhs_y.len(), self.me);

        for new in 0..self.dim {
            let old = self.perm[new];
            self.rhs_perm[new] = if old < self.nz {
                rhs_z[old]
            } else {
                rhs_y[old - self.nz]
            };
        }

        self.sol_perm.copy_from_slice(&self.rhs_perm);
        self.ldlt.solve(&mut self.sol_perm)?;

        // The factorization carries the static shift on every diagonal,
        // so refine against the shifted operator, not the stored values.
        for _ in 0..self.refine_iters {
            symm_matvec_upper(&self.kkt, &self.sol_perm, &mut self.kx);
            let mut res_norm = 0.0_f64;
            for i in 0..self.dim {
                self.kx[i] += self.static_reg * self.sol_perm[i];
                self.resid[i] = self.rhs_perm[i] - self.kx[i];
                res_norm = res_norm.max(self.resid[i].abs());
            }
            if res_norm < 1e-12 {
                break;
            }
            self.delta.copy_from_slice(&self.resid);
            self.ldlt.solve(&mut self.delta)?;
            for i in 0..self.dim {
                self.sol_perm[i] += self.delta[i];
            }
        }

        for new in 0..self.dim {
            let old = self.perm[new];
            if old < self.nz {
                sol_z[old] = self.sol_perm[new];
            } else {
                sol_y[old - self.nz] = self.sol_perm[new];
            }
        }
        Ok(())
    }

    /// Pivots bumped by dynamic regularization since construction.
    pub fn dynamic_bumps(&self) -> usize {
        self.ldlt.dynamic_bumps()
    }
}

/// Assembles the permuted upper triangle. Entry order must stay in sync
/// with the slot recording in [`KktSolver::new`].
fn build_matrix(asm: &Assembler, static_reg: f64, perm_inv: &[usize]) -> SparseCsc {
    let nz = asm.nz();
    let dim = nz + asm.me();
    let mut tri = TriMat::new((dim, dim));
    let mut add = |r: usize, c: usize, v: f64| {
        let (pr, pc) = (perm_inv[r], perm_inv[c]);
        if pr <= pc {
            tri.add_triplet(pr, pc, v);
        } else {
            tri.add_triplet(pc, pr, v);
        }
    };

    for i in 0..asm.horizon() {
        let off = asm.var_offset(i);
        let n = asm.stage_dims(i).nvar;
        let phi = asm.phi(i);
        for c in 0..n {
            for r in 0..=c {
                add(off + r, off + c, phi[c * n + r]);
            }
        }

        let nd = asm.stage_dims(i).ndyn;
        if nd > 0 {
            let row0 = nz + asm.eq_offset(i + 1);
            let jac = asm.jac_c(i);
            for j in 0..n {
                for k in 0..nd {
                    add(off + j, row0 + k, -jac[j * nd + k]);
                }
            }
        }
    }

    for (r, &zi) in asm.sel_index().iter().enumerate() {
        add(zi, nz + r, 1.0);
    }
    for r in 0..asm.me() {
        add(nz + r, nz + r, -2.0 * static_reg);
    }

    tri.to_csc()
}

fn camd_ordering(kkt: &SparseCsc) -> Result<(Vec<usize>, Vec<usize>), KktError> {
    let perm = sprs_suitesparse_camd::try_camd(kkt.structure_view())
        .map_err(|e| KktError::Ordering(format!("{e:?}")))?;
    Ok((perm.vec(), perm.inv_vec()))
}

fn find_slot(kkt: &SparseCsc, perm_inv: &[usize], r: usize, c: usize) -> Result<usize, KktError> {
    let (pr, pc) = (perm_inv[r], perm_inv[c]);
    let (row, col) = if pr <= pc { (pr, pc) } else { (pc, pr) };
    let indptr = kkt.indptr();
    let colptr = indptr.raw_storage();
    let start = colptr[col];
    let end = colptr[col + 1];
    match kkt.indices()[start..end].binary_search(&row) {
        Ok(pos) => Ok(start + pos),
        Err(_) => Err(KktError::Structure { row, col }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::{ProblemDims, StageDims};

    #[test]
    fn test_kkt_single_stage_no_dynamics() {
        // One stage, two variables, first variable pinned by equality.
        let dims = ProblemDims::new(vec![StageDims {
            nvar: 2,
            nstate: 1,
            state_offset: 0,
            ndyn: 0,
            nineq: 0,
            nparam: 0,
        }]);
        let mut asm = Assembler::new(&dims);
        asm.hess_mut(0).copy_from_slice(&[1.0, 0.0, 0.0, 1.0]);
        asm.build_phi(&[]);

        let mut kkt = KktSolver::new(&asm, 1e-8, 1e-13, 3).unwrap();
        kkt.factor(&asm).unwrap();

        let mut dz = vec![0.0; 2];
        let mut dy = vec![0.0; 1];
        kkt.solve(&[1.0, 0.0], &[2.0], &mut dz, &mut dy).unwrap();

        // [[1, 0, 1], [0, 1, 0], [1, 0, 0]] [dz; dy] = [1, 0, 2]
        assert!((dz[0] - 2.0).abs() < 1e-6);
        assert!(dz[1].abs() < 1e-6);
        assert!((dy[0] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_kkt_two_stage_chain() {
        // Scalar stages coupled by c_0(z_0) = 2 z_0.
        let dims = ProblemDims::new(vec![
            StageDims {
                nvar: 1,
                nstate: 1,
                state_offset: 0,
                ndyn: 1,
                nineq: 0,
                nparam: 0,
            },
            StageDims {
                nvar: 1,
                nstate: 1,
                state_offset: 0,
                ndyn: 0,
                nineq: 0,
                nparam: 0,
            },
        ]);
        let mut asm = Assembler::new(&dims);
        asm.hess_mut(0).copy_from_slice(&[1.0]);
        asm.hess_mut(1).copy_from_slice(&[1.0]);
        asm.jac_c_mut(0).copy_from_slice(&[2.0]);
        asm.build_phi(&[]);

        let mut kkt = KktSolver::new(&asm, 1e-8, 1e-13, 3).unwrap();
        kkt.factor(&asm).unwrap();

        let mut dz = vec![0.0; 2];
        let mut dy = vec![0.0; 2];
        kkt.solve(&[0.0, 0.0], &[1.0, 0.0], &mut dz, &mut dy).unwrap();

        // Rows: z_0 + y_0 - 2 y_1 = 0, z_1 + y_1 = 0,
        //       z_0 = 1, -2 z_0 + z_1 = 0.
        assert!((dz[0] - 1.0).abs() < 1e-6);
        assert!((dz[1] - 2.0).abs() < 1e-6);
        assert!((dy[0] + 5.0).abs() < 1e-6);
        assert!((dy[1] + 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_kkt_value_update_changes_solution() {
        let dims = ProblemDims::new(vec![StageDims {
            nvar: 1,
            nstate: 1,
            state_offset: 0,
            ndyn: 0,
            nineq: 0,
            nparam: 0,
        }]);
        let mut asm = Assembler::new(&dims);
        asm.hess_mut(0).copy_from_slice(&[1.0]);
        asm.build_phi(&[]);

        let mut kkt = KktSolver::new(&asm, 1e-8, 1e-13, 3).unwrap();
        kkt.factor(&asm).unwrap();
        let mut dz = vec![0.0];
        let mut dy = vec![0.0];
        // [[1, 1], [1, 0]] [dz; dy] = [3, 1] has dz = 1, dy = 2.
        kkt.solve(&[3.0], &[1.0], &mut dz, &mut dy).unwrap();
        assert!((dz[0] - 1.0).abs() < 1e-6);
        assert!((dy[0] - 2.0).abs() < 1e-6);

        // Same pattern, new curvature value.
        asm.hess_mut(0).copy_from_slice(&[4.0]);
        asm.build_phi(&[]);
        kkt.factor(&asm).unwrap();
        // [[4, 1], [1, 0]] [dz; dy] = [3, 1] has dz = 1, dy = -1.
        kkt.solve(&[3.0], &[1.0], &mut dz, &mut dy).unwrap();
        assert!((dz[0] - 1.0).abs() < 1e-6);
        assert!((dy[0] + 1.0).abs() < 1e-6);
    }
}
