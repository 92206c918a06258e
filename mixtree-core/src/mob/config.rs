//! Configuration for tree growing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::glmm::fit::FitConfig;
use crate::instability::TestConfig;

/// How the global (non-partitioned) fixed effects are estimated.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum GlobalStrategy {
    /// One fit over all rows; the estimates are then frozen as an offset.
    #[default]
    Pretrain,
    /// Alternate tree growth and a joint fit over all rows until the joint
    /// log-likelihood changes by less than `tol`.
    Alternating { max_iter: usize, tol: f64 },
}

/// What a rank-deficient node design does to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RankDeficiencyPolicy {
    /// Fail the whole run.
    Abort,
    /// Make the node terminal with a failed status.
    #[default]
    MarkUnsplittable,
}

/// Limits on total growth. Exhaustion truncates the tree.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Budget {
    pub max_nodes: Option<usize>,
    pub time_limit: Option<Duration>,
}

/// Configuration for [`crate::mob::fit_tree`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MobConfig {
    /// Significance level for splitting.
    pub alpha: f64,
    /// Minimum rows per child.
    pub min_size: usize,
    /// Minimum clusters per child when the tests are cluster-aware.
    pub min_clusters: usize,
    /// Nodes at this depth (root = 0) are not split.
    pub max_depth: usize,
    /// Unordered factors with at most this many levels (capped at
    /// [`crate::instability::split::EXHAUSTIVE_LIMIT`]) are split exhaustively.
    pub max_exhaustive_levels: usize,
    pub test: TestConfig,
    pub fit: FitConfig,
    pub global_strategy: GlobalStrategy,
    pub rank_policy: RankDeficiencyPolicy,
    /// Grow sibling subtrees in parallel.
    pub parallel: bool,
    pub budget: Budget,
}

impl Default for MobConfig {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            min_size: 20,
            min_clusters: 5,
            max_depth: 6,
            max_exhaustive_levels: 10,
            test: TestConfig::default(),
            fit: FitConfig::default(),
            global_strategy: GlobalStrategy::Pretrain,
            rank_policy: RankDeficiencyPolicy::MarkUnsplittable,
            parallel: false,
            budget: Budget::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MobConfig = serde_json::from_str(r#"{"alpha": 0.01, "max_depth": 2}"#).unwrap();
        assert_eq!(config.alpha, 0.01);
        assert_eq!(config.max_depth, 2);
        assert_eq!(config.min_size, 20);
        assert_eq!(config.rank_policy, RankDeficiencyPolicy::MarkUnsplittable);
        assert!(config.test.bonferroni);
    }

    #[test]
    fn test_strategy_json() {
        let s: GlobalStrategy = serde_json::from_str(r#"{"Alternating": {"max_iter": 5, "tol": 1e-6}}"#).unwrap();
        assert_eq!(
            s,
            GlobalStrategy::Alternating {
                max_iter: 5,
                tol: 1e-6
            }
        );
    }
}
