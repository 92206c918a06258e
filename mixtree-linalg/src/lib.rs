//! mixtree-linalg: Linear algebra wrappers for mixtree
//!
//! Provides the dense matrix type and the decompositions used by the
//! mixed-model fitter and the parameter instability tests.

pub mod dense;
pub mod decomposition;

pub use dense::DenseMatrix;
pub use decomposition::{CholeskyDecomp, LinalgError};
