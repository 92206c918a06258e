//! Audit report of a fitted tree.
//!
//! A flat, serialisable summary: per-node size, coefficients, covariance,
//! convergence diagnostics and the instability statistics that drove each
//! split, plus the global coefficients.

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::instability::CovariateTest;
use crate::tree::node::{Node, NodeId};
use crate::tree::partition::{GlobalEffects, PartitionTree};

/// One fixed-effect estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientReport {
    pub name: String,
    pub estimate: f64,
    pub std_error: f64,
}

/// Split summary of an internal node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitReport {
    pub covariate: String,
    pub left: String,
    pub right: String,
    pub statistic: f64,
    pub p_value: f64,
    pub p_adjusted: f64,
}

/// Per-node summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: NodeId,
    pub depth: usize,
    pub n_obs: usize,
    pub n_clusters: usize,
    pub status: String,
    pub children: Option<(NodeId, NodeId)>,
    pub split: Option<SplitReport>,
    pub coefficients: Vec<CoefficientReport>,
    /// Random-effect covariance (row-major).
    pub re_covariance: Vec<Vec<f64>>,
    pub dispersion: Option<f64>,
    pub log_likelihood: Option<f64>,
    pub converged: Option<bool>,
    pub iterations: Option<usize>,
    pub singular: Option<bool>,
    pub tests: Vec<CovariateTest>,
}

impl NodeReport {
    fn from_node(node: &Node) -> Self {
        let model = node.model.as_ref();
        let split = node.split.as_ref().map(|s| {
            let test = node.split_test();
            SplitReport {
                covariate: s.covariate.clone(),
                left: s.left_label.clone(),
                right: s.right_label.clone(),
                statistic: test.map(|t| t.statistic).unwrap_or(0.0),
                p_value: test.map(|t| t.p_value).unwrap_or(1.0),
                p_adjusted: test.map(|t| t.p_adjusted).unwrap_or(1.0),
            }
        });
        let coefficients = model
            .map(|m| {
                m.coef_names
                    .iter()
                    .zip(m.coefficients.iter().zip(m.std_errors.iter()))
                    .map(|(name, (&estimate, &std_error))| CoefficientReport {
                        name: name.clone(),
                        estimate,
                        std_error,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            id: node.id,
            depth: node.depth,
            n_obs: node.n_obs(),
            n_clusters: node.n_clusters,
            status: node.status.to_string(),
            children: node.split.as_ref().map(|s| (s.left, s.right)),
            split,
            coefficients,
            re_covariance: model.map(|m| m.re_covariance.clone()).unwrap_or_default(),
            dispersion: model.map(|m| m.dispersion),
            log_likelihood: model.map(|m| m.log_likelihood),
            converged: model.map(|m| m.converged),
            iterations: model.map(|m| m.iterations),
            singular: model.map(|m| m.singular),
            tests: node.tests.clone(),
        }
    }
}

/// Report of a whole tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeReport {
    pub n_nodes: usize,
    pub n_leaves: usize,
    pub depth: usize,
    pub n_obs: usize,
    pub n_excluded: usize,
    pub truncated: bool,
    pub global: Option<GlobalEffects>,
    /// Nodes in pre-order.
    pub nodes: Vec<NodeReport>,
}

impl TreeReport {
    pub fn new(tree: &PartitionTree) -> Self {
        Self {
            n_nodes: tree.len(),
            n_leaves: tree.leaves().len(),
            depth: tree.depth(),
            n_obs: tree.root().n_obs(),
            n_excluded: tree.n_excluded(),
            truncated: tree.truncated(),
            global: tree.global().cloned(),
            nodes: tree.pre_order().map(NodeReport::from_node).collect(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for TreeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "GLMM tree: {} nodes, {} terminal, depth {}, {} rows ({} excluded){}",
            self.n_nodes,
            self.n_leaves,
            self.depth,
            self.n_obs,
            self.n_excluded,
            if self.truncated { ", truncated" } else { "" }
        )?;
        if let Some(global) = &self.global {
            let terms: Vec<String> = global
                .names
                .iter()
                .zip(global.coefficients.iter())
                .map(|(n, c)| format!("{} = {:.4}", n, c))
                .collect();
            writeln!(f, "Global effects: {}", terms.join(", "))?;
        }
        let by_id = |id: NodeId| self.nodes.iter().find(|n| n.id == id);
        let mut stack: Vec<(NodeId, String)> = vec![(0, String::new())];
        while let Some((id, label)) = stack.pop() {
            let Some(node) = by_id(id) else { continue };
            let indent = "  ".repeat(node.depth);
            let prefix = if label.is_empty() { String::new() } else { format!("{}: ", label) };
            write!(f, "{}[{}] {}n = {}", indent, node.id, prefix, node.n_obs)?;
            if let Some(split) = &node.split {
                writeln!(f, ", split on {} (p = {:.3e})", split.covariate, split.p_adjusted)?;
            } else {
                let coefs: Vec<String> = node
                    .coefficients
                    .iter()
                    .map(|c| format!("{} = {:.4}", c.name, c.estimate))
                    .collect();
                writeln!(f, ", {}: {}", node.status, coefs.join(", "))?;
            }
            if let (Some((l, r)), Some(split)) = (node.children, &node.split) {
                stack.push((r, split.right.clone()));
                stack.push((l, split.left.clone()));
            }
        }
        Ok(())
    }
}
