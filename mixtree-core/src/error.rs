//! Error types for model fitting and tree growth.
//!
//! Only genuine failures live here. The valid terminal outcomes of a node
//! (no admissible split, insufficient size, truncation) are node statuses,
//! see [`crate::tree::node::NodeStatus`].

use thiserror::Error;

use crate::glmm::fit::FittedModel;

/// Failure of a single mixed-model fit.
#[derive(Error, Debug, Clone)]
pub enum FitError {
    #[error("design matrix is rank deficient: column '{column}' is collinear with earlier columns")]
    RankDeficiency { column: String },

    /// The iteration cap was reached. `last` holds the final estimates,
    /// which must not be treated as a converged fit.
    #[error("fit did not converge after {iterations} iterations")]
    ConvergenceFailure {
        iterations: usize,
        last: Box<FittedModel>,
    },

    #[error("invalid model input: {0}")]
    InvalidInput(String),

    #[error("optimizer failed: {0}")]
    Optimizer(String),
}

/// Failure of a whole tree-growing run.
#[derive(Error, Debug)]
pub enum MobError {
    #[error(transparent)]
    Data(#[from] anyhow::Error),

    #[error("fit failed at node {path}: {source}")]
    NodeFit {
        path: String,
        #[source]
        source: FitError,
    },

    #[error("global parameter estimation failed: {0}")]
    GlobalFit(#[source] FitError),
}
