//! BLAKE3 Merkle tree over transaction ids.
//!
//! Hashing is domain separated:
//! - Leaf: `BLAKE3(0x00 || txid)`
//! - Node: `BLAKE3(0x01 || left || right)`
//!
//! Odd layers duplicate their last element. An empty tree has root
//! [`Hash256::ZERO`]. A branch is the list of sibling hashes from leaf to
//! root; the leaf's position decides which side each sibling sits on.

use crate::types::Hash256;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

pub fn leaf_hash(data: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(data.as_bytes());
    Hash256(hasher.finalize().into())
}

pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash256(hasher.finalize().into())
}

fn next_layer(layer: &[Hash256]) -> Vec<Hash256> {
    layer
        .chunks(2)
        .map(|pair| {
            let left = &pair[0];
            node_hash(left, pair.get(1).unwrap_or(left))
        })
        .collect()
}

pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::ZERO;
    }
    let mut current: Vec<Hash256> = leaves.iter().map(leaf_hash).collect();
    while current.len() > 1 {
        current = next_layer(&current);
    }
    current[0]
}

/// Sibling hashes proving inclusion of `leaves[index]`.
///
/// Returns `None` for an out-of-range index.
pub fn merkle_branch(leaves: &[Hash256], index: usize) -> Option<Vec<Hash256>> {
    if index >= leaves.len() {
        return None;
    }
    let mut branch = Vec::new();
    let mut layer: Vec<Hash256> = leaves.iter().map(leaf_hash).collect();
    let mut pos = index;
    while layer.len() > 1 {
        let sibling = layer.get(pos ^ 1).copied().unwrap_or(layer[pos]);
        branch.push(sibling);
        layer = next_layer(&layer);
        pos /= 2;
    }
    Some(branch)
}

/// Root implied by `leaf` at `index` with the given branch.
pub fn branch_root(leaf: &Hash256, branch: &[Hash256], index: usize) -> Hash256 {
    let mut current = leaf_hash(leaf);
    let mut pos = index;
    for sibling in branch {
        current = if pos % 2 == 0 {
            node_hash(&current, sibling)
        } else {
            node_hash(sibling, &current)
        };
        pos /= 2;
    }
    current
}

pub fn verify_branch(leaf: &Hash256, branch: &[Hash256], index: usize, root: &Hash256) -> bool {
    branch_root(leaf, branch, index) == *root
}
