//! Model-based recursive partitioning.

pub mod config;
pub mod driver;
pub mod global;

pub use config::{Budget, GlobalStrategy, MobConfig, RankDeficiencyPolicy};
pub use driver::fit_tree;
