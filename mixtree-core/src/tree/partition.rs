//! The fitted partition tree: an arena of nodes in pre-order.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::node::{Node, NodeId};
use crate::data::dataset::Dataset;
use crate::data::frame::{Candidate, ModelSpec, INTERCEPT};
use crate::glmm::family::Family;
use crate::glmm::fit::FittedModel;
use crate::mob::config::MobConfig;

/// Global fixed effects shared by all nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalEffects {
    pub names: Vec<String>,
    pub coefficients: Vec<f64>,
    pub std_errors: Vec<f64>,
    /// Log-likelihood of the last global (pretrain or joint) fit.
    pub log_likelihood: f64,
    /// Alternating rounds performed (0 for pretraining only).
    pub iterations: usize,
    pub converged: bool,
}

/// Fitted tree. Read-only after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionTree {
    pub magic: [u8; 4],
    pub version: u32,
    nodes: Vec<Node>,
    global: Option<GlobalEffects>,
    spec: ModelSpec,
    config: MobConfig,
    truncated: bool,
    n_excluded: usize,
}

impl PartitionTree {
    /// Magic bytes: "MXTR" (MiX TRee).
    pub const MAGIC: [u8; 4] = [b'M', b'X', b'T', b'R'];
    pub const VERSION: u32 = 1;

    pub(crate) fn new(
        nodes: Vec<Node>,
        global: Option<GlobalEffects>,
        spec: ModelSpec,
        config: MobConfig,
        n_excluded: usize,
    ) -> Self {
        let truncated = nodes
            .iter()
            .any(|n| matches!(n.status, super::node::NodeStatus::Truncated(_)));
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            nodes,
            global,
            spec,
            config,
            truncated,
            n_excluded,
        }
    }

    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn global(&self) -> Option<&GlobalEffects> {
        self.global.as_ref()
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn config(&self) -> &MobConfig {
        &self.config
    }

    /// Whether growth stopped early at any node (depth limit or budget).
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Rows dropped for missing model values.
    pub fn n_excluded(&self) -> usize {
        self.n_excluded
    }

    /// Maximum node depth (root = 0).
    pub fn depth(&self) -> usize {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    /// Depth-first, left-before-right traversal from the root.
    pub fn pre_order(&self) -> PreOrder<'_> {
        PreOrder {
            tree: self,
            stack: if self.nodes.is_empty() { Vec::new() } else { vec![0] },
        }
    }

    /// Terminal nodes in pre-order.
    pub fn leaves(&self) -> Vec<&Node> {
        self.pre_order().filter(|n| n.is_leaf()).collect()
    }

    /// Fitted models of the terminal nodes.
    pub fn leaf_models(&self) -> Vec<(NodeId, &FittedModel)> {
        self.leaves()
            .into_iter()
            .filter_map(|n| n.model.as_ref().map(|m| (n.id, m)))
            .collect()
    }

    /// Terminal node for `row` of `data`.
    ///
    /// Missing covariate values and categorical levels not seen when the
    /// split was made follow the larger child.
    pub fn route(&self, data: &Dataset, row: usize) -> Result<NodeId> {
        if row >= data.n_rows() {
            bail!("Row {} out of range ({} rows)", row, data.n_rows());
        }
        let mut id = 0;
        while let Some(split) = &self.nodes[id].split {
            let candidate = Candidate::from_column(&split.covariate, data.column(&split.covariate)?);
            let left = split.rule.goes_left(&candidate, row).unwrap_or(split.majority_left);
            id = if left { split.left } else { split.right };
        }
        Ok(id)
    }

    /// Population-level mean for `row`: the leaf's fixed effects plus the
    /// global effects, mapped through the inverse link. Random effects are 0.
    pub fn predict(&self, data: &Dataset, row: usize) -> Result<f64> {
        let leaf = self.route(data, row)?;
        let Some(model) = self.nodes[leaf].model.as_ref() else {
            bail!("Terminal node {} has no fitted model", leaf);
        };
        let mut eta = 0.0;
        for (name, beta) in model.coef_names.iter().zip(model.coefficients.iter()) {
            let value = if name == INTERCEPT { 1.0 } else { data.numeric(name)?[row] };
            eta += beta * value;
        }
        if let Some(global) = &self.global {
            for (name, gamma) in global.names.iter().zip(global.coefficients.iter()) {
                eta += gamma * data.numeric(name)?[row];
            }
        }
        if !eta.is_finite() {
            bail!("Missing regressor value at row {}", row);
        }
        Ok((Family::new(self.spec.family).link.inverse)(eta))
    }
}

/// Pre-order iterator over tree nodes.
pub struct PreOrder<'a> {
    tree: &'a PartitionTree,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for PreOrder<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        let node = &self.tree.nodes[id];
        if let Some(split) = &node.split {
            self.stack.push(split.right);
            self.stack.push(split.left);
        }
        Some(node)
    }
}
