//! mixtree-core: GLMM trees by model-based recursive partitioning
//!
//! Fits a (generalized) linear mixed model per tree node, tests the
//! fixed-effect scores for instability along candidate partitioning
//! covariates, and splits where the parameters change.
//!
//! - `data`: in-memory dataset and model specification
//! - `glmm`: REML/ML linear mixed models and PQL for binomial/Poisson
//! - `instability`: score fluctuation tests and split-point search
//! - `mob`: the recursive partitioning driver and global effects
//! - `tree`: the fitted partition tree
//! - `model`: audit report and tree serialization

pub mod data;
pub mod error;
pub mod glmm;
pub mod instability;
pub mod mob;
pub mod model;
pub mod tree;
pub mod util;

pub use data::{Dataset, ModelSpec, RandomEffects};
pub use error::{FitError, MobError};
pub use mob::{fit_tree, MobConfig};
pub use model::TreeReport;
pub use tree::PartitionTree;
