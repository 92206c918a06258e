//! Tree nodes and their terminal statuses.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FitError;
use crate::glmm::fit::FittedModel;
use crate::instability::{CovariateTest, SplitRule};

/// Index of a node in the tree arena (pre-order, root = 0).
pub type NodeId = usize;

/// Why growth stopped at a node that still had an admissible split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TruncationReason {
    DepthLimit,
    Budget,
}

/// Fit failure recorded on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FailureKind {
    RankDeficiency { column: String },
    ConvergenceFailure { iterations: usize },
    Other(String),
}

impl From<&FitError> for FailureKind {
    fn from(err: &FitError) -> Self {
        match err {
            FitError::RankDeficiency { column } => FailureKind::RankDeficiency {
                column: column.clone(),
            },
            FitError::ConvergenceFailure { iterations, .. } => FailureKind::ConvergenceFailure {
                iterations: *iterations,
            },
            other => FailureKind::Other(other.to_string()),
        }
    }
}

/// Outcome of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Internal node with two children.
    Split,
    NoAdmissibleSplit,
    InsufficientNodeSize,
    Truncated(TruncationReason),
    Failed(FailureKind),
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeStatus::Split)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Split => write!(f, "split"),
            NodeStatus::NoAdmissibleSplit => write!(f, "no admissible split"),
            NodeStatus::InsufficientNodeSize => write!(f, "insufficient node size"),
            NodeStatus::Truncated(TruncationReason::DepthLimit) => write!(f, "truncated (depth limit)"),
            NodeStatus::Truncated(TruncationReason::Budget) => write!(f, "truncated (budget)"),
            NodeStatus::Failed(FailureKind::RankDeficiency { column }) => {
                write!(f, "failed (rank deficient at '{}')", column)
            }
            NodeStatus::Failed(FailureKind::ConvergenceFailure { iterations }) => {
                write!(f, "failed (no convergence after {} iterations)", iterations)
            }
            NodeStatus::Failed(FailureKind::Other(msg)) => write!(f, "failed ({})", msg),
        }
    }
}

/// Split of an internal node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub covariate: String,
    pub rule: SplitRule,
    /// Missing values and unseen levels go left when true.
    pub majority_left: bool,
    /// Human-readable conditions, e.g. "z <= 0.5" / "z > 0.5".
    pub left_label: String,
    pub right_label: String,
    /// Summed child weighted RSS at the chosen split point.
    pub objective: f64,
    pub left: NodeId,
    pub right: NodeId,
}

/// A node of the partition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub depth: usize,
    /// Dataset rows in this node.
    pub rows: Vec<usize>,
    pub n_clusters: usize,
    /// `None` only when the fit produced no estimates (rank deficiency).
    pub model: Option<FittedModel>,
    pub status: NodeStatus,
    pub split: Option<Split>,
    /// Instability tests run at this node, in candidate order.
    pub tests: Vec<CovariateTest>,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        self.split.is_none()
    }

    pub fn n_obs(&self) -> usize {
        self.rows.len()
    }

    /// Test of the covariate this node split on.
    pub fn split_test(&self) -> Option<&CovariateTest> {
        let split = self.split.as_ref()?;
        self.tests.iter().find(|t| t.covariate == split.covariate)
    }
}
