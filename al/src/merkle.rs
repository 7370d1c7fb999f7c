//! Merkle tree over log lines
//!
//! Leaves are SHA-256 digests of the raw line bytes. Internal nodes hash
//! the concatenation of their children's lowercase hex digests. A level
//! with an odd node count pairs the last node with itself. The tree is
//! rebuilt from scratch on every checkpoint, so the root for a given
//! sequence of lines is identical across runs, processes and machines.

use sha2::{Digest, Sha256};

/// Hash raw bytes to a lowercase hex SHA-256 digest
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Merkle tree built from an ordered list of log lines
#[derive(Debug, Clone)]
pub struct MerkleTree {
    root: Option<String>,
    leaf_count: usize,
}

impl MerkleTree {
    /// Build a tree from an ordered sequence of lines
    ///
    /// An empty sequence produces a tree without a root.
    pub fn build<S: AsRef<[u8]>>(lines: &[S]) -> Self {
        if lines.is_empty() {
            return Self {
                root: None,
                leaf_count: 0,
            };
        }

        let mut level: Vec<String> = lines.iter().map(|l| sha256_hex(l.as_ref())).collect();

        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            for pair in level.chunks(2) {
                let left = &pair[0];
                // Odd node: pair with itself
                let right = pair.get(1).unwrap_or(left);
                next.push(sha256_hex(format!("{left}{right}").as_bytes()));
            }
            level = next;
        }

        Self {
            root: level.pop(),
            leaf_count: lines.len(),
        }
    }

    /// Root hash, if the tree has any leaves
    pub fn root_hash(&self) -> Option<&str> {
        self.root.as_deref()
    }

    /// Number of leaves the tree was built from
    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }
}
