//! Parameter instability tests and split-point search.

pub mod fluctuation;
pub mod split;

pub use fluctuation::{select, test, CovariateTest, Functional, SupLmTable, TestConfig, TestLevel};
pub use split::{best_split, SplitCandidate, SplitRule};
