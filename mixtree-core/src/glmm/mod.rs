//! Generalized linear mixed model fitting.
//!
//! - Link functions and response families
//! - Profiled REML/ML for the linear mixed model
//! - PQL for binomial and Poisson responses

pub mod family;
pub mod fit;
pub mod link;
pub mod lmm;
