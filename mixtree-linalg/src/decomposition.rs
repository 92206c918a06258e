#![allow(clippy::needless_range_loop)]
//! Matrix decompositions and solvers.
//!
//! Cholesky factorisation (with a rank-revealing variant used to detect
//! collinear design matrices) and symmetric eigendecomposition via faer,
//! used for the score decorrelation in the instability tests.

use crate::dense::DenseMatrix;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinalgError {
    #[error("Matrix is not positive definite")]
    NotPositiveDefinite,

    #[error("Matrix is rank deficient: column {column} is linearly dependent on earlier columns")]
    RankDeficient { column: usize },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Result of a Cholesky decomposition.
#[derive(Debug, Clone)]
pub struct CholeskyDecomp {
    /// Lower triangular factor L such that A = L * L'.
    pub l: DenseMatrix,
}

impl CholeskyDecomp {
    /// Compute the Cholesky decomposition of a symmetric positive definite matrix.
    pub fn new(a: &DenseMatrix) -> Result<Self, LinalgError> {
        Self::factor(a, 0.0).map_err(|e| match e {
            LinalgError::RankDeficient { .. } => LinalgError::NotPositiveDefinite,
            other => other,
        })
    }

    /// Cholesky decomposition that reports rank deficiency.
    ///
    /// A pivot is rejected when it falls below `rel_tol` times the original
    /// diagonal entry, i.e. when the column is (numerically) a linear
    /// combination of the columns before it.
    pub fn with_rank_check(a: &DenseMatrix, rel_tol: f64) -> Result<Self, LinalgError> {
        Self::factor(a, rel_tol)
    }

    fn factor(a: &DenseMatrix, rel_tol: f64) -> Result<Self, LinalgError> {
        let n = a.nrows();
        if n != a.ncols() {
            return Err(LinalgError::DimensionMismatch {
                expected: n,
                got: a.ncols(),
            });
        }
        let mut l = DenseMatrix::zeros(n, n);

        for j in 0..n {
            let mut sum = 0.0;
            for k in 0..j {
                sum += l.get(j, k) * l.get(j, k);
            }
            let ajj = a.get(j, j);
            let diag = ajj - sum;
            if !diag.is_finite() || diag <= rel_tol * ajj.abs() || diag <= 0.0 {
                return Err(LinalgError::RankDeficient { column: j });
            }
            l.set(j, j, diag.sqrt());

            for i in (j + 1)..n {
                let mut sum = 0.0;
                for k in 0..j {
                    sum += l.get(i, k) * l.get(j, k);
                }
                l.set(i, j, (a.get(i, j) - sum) / l.get(j, j));
            }
        }

        Ok(CholeskyDecomp { l })
    }

    /// Dimension of the factored matrix.
    pub fn dim(&self) -> usize {
        self.l.nrows()
    }

    /// Solve L * L' * x = b.
    pub fn solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.l.nrows();
        assert_eq!(b.len(), n);

        // Forward substitution: L * y = b
        let mut y = vec![0.0; n];
        for i in 0..n {
            let mut sum = 0.0;
            for j in 0..i {
                sum += self.l.get(i, j) * y[j];
            }
            y[i] = (b[i] - sum) / self.l.get(i, i);
        }

        // Backward substitution: L' * x = y
        let mut x = vec![0.0; n];
        for i in (0..n).rev() {
            let mut sum = 0.0;
            for j in (i + 1)..n {
                sum += self.l.get(j, i) * x[j];
            }
            x[i] = (y[i] - sum) / self.l.get(i, i);
        }

        x
    }

    /// Solve A * X = B column by column.
    pub fn solve_matrix(&self, b: &DenseMatrix) -> DenseMatrix {
        assert_eq!(b.nrows(), self.dim());
        let mut out = DenseMatrix::zeros(b.nrows(), b.ncols());
        for j in 0..b.ncols() {
            let col: Vec<f64> = (0..b.nrows()).map(|i| b.get(i, j)).collect();
            out.set_col(j, &self.solve(&col));
        }
        out
    }

    /// log|A| = 2 * sum(log diag(L)).
    pub fn log_det(&self) -> f64 {
        2.0 * self.l.diag().iter().map(|d| d.ln()).sum::<f64>()
    }

    /// Compute the inverse of the original matrix A^{-1} = (L L')^{-1}.
    pub fn inverse(&self) -> DenseMatrix {
        let n = self.l.nrows();
        let mut inv = DenseMatrix::zeros(n, n);
        for j in 0..n {
            let mut e = vec![0.0; n];
            e[j] = 1.0;
            let col = self.solve(&e);
            inv.set_col(j, &col);
        }
        inv
    }
}

/// Eigendecomposition of a symmetric matrix: eigenvalues in descending order
/// and the matching eigenvectors as columns.
pub fn symmetric_eigen(a: &DenseMatrix) -> Result<(Vec<f64>, DenseMatrix), LinalgError> {
    let n = a.nrows();
    if n != a.ncols() {
        return Err(LinalgError::DimensionMismatch {
            expected: n,
            got: a.ncols(),
        });
    }

    let evd = a.as_faer().selfadjoint_eigendecomposition(faer::Side::Lower);
    let s = evd.s();
    let u = evd.u();

    // faer returns ascending eigenvalues
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| {
        s.column_vector()
            .read(j)
            .partial_cmp(&s.column_vector().read(i))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let values: Vec<f64> = order.iter().map(|&i| s.column_vector().read(i)).collect();
    let vectors = DenseMatrix::from_fn(n, n, |i, j| u.read(i, order[j]));
    Ok((values, vectors))
}

/// Inverse square root of a positive semi-definite matrix, restricted to
/// its numerical range.
///
/// Returns `T` of shape (r x n), `r` = numerical rank, with `T A T' = I_r`.
/// Eigenvalues below `rel_tol * max_eigenvalue` are dropped.
pub fn inverse_sqrt_psd(a: &DenseMatrix, rel_tol: f64) -> Result<DenseMatrix, LinalgError> {
    let n = a.nrows();
    let (values, vectors) = symmetric_eigen(a)?;
    let max_ev = values.first().copied().unwrap_or(0.0);
    if max_ev <= 0.0 {
        return Ok(DenseMatrix::zeros(0, n));
    }
    let kept: Vec<usize> = (0..n).filter(|&i| values[i] > rel_tol * max_ev).collect();
    Ok(DenseMatrix::from_fn(kept.len(), n, |r, j| {
        let k = kept[r];
        vectors.get(j, k) / values[k].sqrt()
    }))
}
