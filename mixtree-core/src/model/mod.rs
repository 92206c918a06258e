//! Tree reporting and serialization.

pub mod report;
pub mod serialization;

pub use report::{NodeReport, TreeReport};
pub use serialization::{decode_tree, encode_tree};
