//! Sparse linear algebra: CSC helpers, the regularized LDL^T
//! factorization, and the stage-structured KKT system built on top of
//! both.

pub mod kkt;
pub mod ldlt;
pub mod sparse;
