//! Partition tree data structures.

pub mod node;
pub mod partition;

pub use node::{FailureKind, Node, NodeId, NodeStatus, Split, TruncationReason};
pub use partition::{GlobalEffects, PartitionTree};
