//! Tree serialization and deserialization.
//!
//! Uses bincode for fast, compact binary serialization to an in-memory
//! buffer. The encoded tree carries magic bytes (MXTR) and a version,
//! both validated on decode.

use anyhow::{bail, Result};

use crate::tree::partition::PartitionTree;

/// Encode a tree to bytes.
pub fn encode_tree(tree: &PartitionTree) -> Result<Vec<u8>> {
    Ok(bincode::serialize(tree)?)
}

/// Decode a tree from bytes produced by [`encode_tree`].
pub fn decode_tree(bytes: &[u8]) -> Result<PartitionTree> {
    let tree: PartitionTree = bincode::deserialize(bytes)?;

    // Validate magic bytes
    if tree.magic != PartitionTree::MAGIC {
        bail!(
            "Invalid tree encoding: expected magic bytes {:?}, got {:?}",
            PartitionTree::MAGIC,
            tree.magic
        );
    }
    if tree.version > PartitionTree::VERSION {
        bail!(
            "Tree encoding version {} is newer than supported version {}",
            tree.version,
            PartitionTree::VERSION
        );
    }

    Ok(tree)
}

/// JSON rendering of the full tree (nodes, models, configuration).
pub fn tree_json(tree: &PartitionTree) -> Result<String> {
    Ok(serde_json::to_string_pretty(tree)?)
}
