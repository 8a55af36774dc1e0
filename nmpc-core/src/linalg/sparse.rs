//! Thin helpers over `sprs` CSC matrices.

use sprs::{CsMat, TriMat};

/// Column-major sparse matrix used throughout the solver.
pub type SparseCsc = CsMat<f64>;

/// Builds a CSC matrix from triplets. Duplicate entries are summed.
pub fn from_triplets(nrows: usize, ncols: usize, entries: &[(usize, usize, f64)]) -> SparseCsc {
    let mut tri = TriMat::new((nrows, ncols));
    for &(r, c, v) in entries {
        tri.add_triplet(r, c, v);
    }
    tri.to_csc()
}

/// `y = A x` where `A` stores only the upper triangle of a symmetric
/// matrix. Off-diagonal entries contribute on both sides.
pub fn symm_matvec_upper(a: &SparseCsc, x: &[f64], y: &mut [f64]) {
    debug_assert_eq!(a.rows(), a.cols());
    debug_assert_eq!(x.len(), a.cols());
    debug_assert_eq!(y.len(), a.rows());
    y.fill(0.0);
    for (col, col_vec) in a.outer_iterator().enumerate() {
        for (row, &val) in col_vec.iter() {
            debug_assert!(row <= col);
            y[row] += val * x[col];
            if row != col {
                y[col] += val * x[row];
            }
        }
    }
}

/// Inf norm of a vector, 0 for empty input.
pub fn inf_norm(v: &[f64]) -> f64 {
    v.iter().fold(0.0_f64, |acc, &x| acc.max(x.abs()))
}

/// 1-norm of a vector.
pub fn one_norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x.abs()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_triplets_sums_duplicates() {
        let a = from_triplets(2, 2, &[(0, 0, 1.0), (0, 0, 2.0), (1, 1, 4.0)]);
        assert_eq!(a.nnz(), 2);
        assert_eq!(a.get(0, 0), Some(&3.0));
        assert_eq!(a.get(1, 1), Some(&4.0));
    }

    #[test]
    fn test_symm_matvec_upper() {
        // [[2, 1], [1, 3]] stored as upper triangle.
        let a = from_triplets(2, 2, &[(0, 0, 2.0), (0, 1, 1.0), (1, 1, 3.0)]);
        let mut y = vec![0.0; 2];
        symm_matvec_upper(&a, &[1.0, 2.0], &mut y);
        assert!((y[0] - 4.0).abs() < 1e-14);
        assert!((y[1] - 7.0).abs() < 1e-14);
    }

    #[test]
    fn test_norms() {
        assert_eq!(inf_norm(&[]), 0.0);
        assert_eq!(inf_norm(&[1.0, -3.0, 2.0]), 3.0);
        assert_eq!(one_norm(&[1.0, -3.0, 2.0]), 6.0);
    }
}
