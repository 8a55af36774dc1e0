//! Regularized sparse LDL^T factorization.
//!
//! Wraps the `ldl` crate (a QDLDL port) for the quasi-definite systems
//! this solver produces. The input matrix is the upper triangle in CSC
//! form with every diagonal entry stored explicitly, even when zero.
//! Two safeguards keep the factorization usable on ill-conditioned
//! iterates: a static shift added to all diagonal entries before
//! factorization, and a sign-preserving bump applied to pivots whose
//! magnitude falls below a threshold.

use crate::linalg::sparse::SparseCsc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LdltError {
    #[error("matrix must be square, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("symbolic factorization failed: {0}")]
    Symbolic(String),
    #[error("numeric factorization failed: {0}")]
    Numeric(String),
    #[error("solve called before numeric factorization")]
    NotFactorized,
}

struct LdltFactor {
    l_p: Vec<usize>,
    l_i: Vec<usize>,
    l_x: Vec<f64>,
    d: Vec<f64>,
    d_inv: Vec<f64>,
}

pub struct LdltSolver {
    n: usize,
    etree: Vec<Option<usize>>,
    l_nz: Vec<usize>,
    factor: Option<LdltFactor>,
    static_reg: f64,
    dynamic_reg_min_pivot: f64,
    dynamic_bumps: usize,
    /// Data index of each diagonal entry, cached at symbolic time.
    diag_positions: Vec<usize>,
    a_x_work: Vec<f64>,
    bwork: Vec<ldl::Marker>,
    iwork: Vec<usize>,
    fwork: Vec<f64>,
}

impl LdltSolver {
    pub fn new(n: usize, static_reg: f64, dynamic_reg_min_pivot: f64) -> Self {
        Self {
            n,
            etree: Vec::new(),
            l_nz: Vec::new(),
            factor: None,
            static_reg,
            dynamic_reg_min_pivot,
            dynamic_bumps: 0,
            diag_positions: Vec::new(),
            a_x_work: Vec::new(),
            bwork: Vec::new(),
            iwork: Vec::new(),
            fwork: Vec::new(),
        }
    }

    /// Computes the elimination tree and per-column factor counts, and
    /// caches the data index of every diagonal entry. Must run once
    /// before [`numeric_factorization`](Self::numeric_factorization);
    /// the sparsity pattern is fixed from then on.
    pub fn symbolic_factorization(&mut self, a: &SparseCsc) -> Result<(), LdltError> {
        if a.rows() != a.cols() {
            return Err(LdltError::NotSquare {
                rows: a.rows(),
                cols: a.cols(),
            });
        }
        self.n = a.rows();
        let indptr = a.indptr();
        let a_p = indptr.raw_storage();
        let a_i = a.indices();

        self.etree = vec![None; self.n];
        self.l_nz = vec![0; self.n];
        let mut work = vec![0usize; self.n];
        ldl::etree(self.n, a_p, a_i, &mut work, &mut self.l_nz, &mut self.etree)
            .map_err(|e| LdltError::Symbolic(format!("{e:?}")))?;

        self.diag_positions.clear();
        for col in 0..self.n {
            let mut found = None;
            for idx in a_p[col]..a_p[col + 1] {
                if a_i[idx] == col {
                    found = Some(idx);
                }
            }
            match found {
                Some(idx) => self.diag_positions.push(idx),
                None => {
                    return Err(LdltError::Symbolic(format!(
                        "column {col} stores no diagonal entry"
                    )))
                }
            }
        }
        self.factor = None;
        Ok(())
    }

    /// Refactorizes with new values on the pattern fixed at symbolic
    /// time. Factor storage is reused across calls.
    pub fn numeric_factorization(&mut self, a: &SparseCsc) -> Result<(), LdltError> {
        if self.diag_positions.len() != self.n {
            return Err(LdltError::NotFactorized);
        }
        let indptr = a.indptr();
        let a_p = indptr.raw_storage();
        let a_i = a.indices();

        self.a_x_work.clear();
        self.a_x_work.extend_from_slice(a.data());
        for &pos in &self.diag_positions {
            self.a_x_work[pos] += self.static_reg;
        }

        let nnz_l: usize = self.l_nz.iter().sum();
        let mut fact = self.factor.take().unwrap_or(LdltFactor {
            l_p: Vec::new(),
            l_i: Vec::new(),
            l_x: Vec::new(),
            d: Vec::new(),
            d_inv: Vec::new(),
        });
        fact.l_p.resize(self.n + 1, 0);
        fact.l_i.resize(nnz_l, 0);
        fact.l_x.resize(nnz_l, 0.0);
        fact.d.resize(self.n, 0.0);
        fact.d_inv.resize(self.n, 0.0);

        self.bwork.clear();
        self.bwork.resize(self.n, ldl::Marker::Unused);
        self.iwork.clear();
        self.iwork.resize(3 * self.n, 0);
        self.fwork.clear();
        self.fwork.resize(self.n, 0.0);

        ldl::factor(
            self.n,
            a_p,
            a_i,
            &self.a_x_work,
            &mut fact.l_p,
            &mut fact.l_i,
            &mut fact.l_x,
            &mut fact.d,
            &mut fact.d_inv,
            &self.l_nz,
            &self.etree,
            &mut self.bwork,
            &mut self.iwork,
            &mut self.fwork,
        )
        .map_err(|e| LdltError::Numeric(format!("{e:?}")))?;

        // Sign-preserving bump of near-zero pivots.
        let replacement = (self.dynamic_reg_min_pivot * 2e6).min(1e-6);
        for i in 0..self.n {
            if fact.d[i].abs() < self.dynamic_reg_min_pivot {
                fact.d[i] = if fact.d[i] < 0.0 {
                    -replacement
                } else {
                    replacement
                };
                fact.d_inv[i] = 1.0 / fact.d[i];
                self.dynamic_bumps += 1;
            }
        }

        self.factor = Some(fact);
        Ok(())
    }

    /// In-place triangular solve: caller loads the right-hand side into
    /// `x` and reads the solution back out of it.
    pub fn solve(&self, x: &mut [f64]) -> Result<(), LdltError> {
        let fact = self.factor.as_ref().ok_or(LdltError::NotFactorized)?;
        ldl::solve(self.n, &fact.l_p, &fact.l_i, &fact.l_x, &fact.d_inv, x);
        Ok(())
    }

    /// Pivot values of the current factorization.
    pub fn d_values(&self) -> Option<&[f64]> {
        self.factor.as_ref().map(|f| f.d.as_slice())
    }

    /// Total pivots bumped by dynamic regularization so far.
    pub fn dynamic_bumps(&self) -> usize {
        self.dynamic_bumps
    }
}
