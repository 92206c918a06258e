//! Numerical helpers.

pub mod math;
