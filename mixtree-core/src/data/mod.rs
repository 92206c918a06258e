//! Tabular input and model specification.

pub mod dataset;
pub mod frame;

pub use dataset::{Column, Dataset};
pub use frame::{ModelFrame, ModelSpec, NodeDesign, RandomEffects};
