//! Merkle tree over pending lock hashes.
//!
//! Each channel end commits to its set of pending locks through the
//! `locks_root` field of its balance proofs. The escrow contract
//! recomputes the same root when a lock is unlocked on chain, so leaf
//! ordering and interior hashing must match exactly: leaves are the
//! lock hashes in ascending byte order, interior nodes are
//! Keccak-256(left ‖ right), an odd node is promoted unchanged, and the
//! empty tree has the all-zero root.

use serde::{Deserialize, Serialize};

use hopnet_core::{keccak256_concat, LocksRoot, EMPTY_LOCKS_ROOT};

/// Merkle tree over a channel end's pending lock hashes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockTree {
    /// Leaves in ascending byte order.
    leaves: Vec<[u8; 32]>,
}

impl LockTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        LockTree { leaves: Vec::new() }
    }

    /// Build a tree from an unordered set of lock hashes.
    pub fn from_leaves(mut leaves: Vec<[u8; 32]>) -> Self {
        leaves.sort_unstable();
        LockTree { leaves }
    }

    /// Insert a lock hash. Returns false if it is already present.
    pub fn insert(&mut self, leaf: [u8; 32]) -> bool {
        match self.leaves.binary_search(&leaf) {
            Ok(_) => false,
            Err(pos) => {
                self.leaves.insert(pos, leaf);
                true
            }
        }
    }

    /// Remove a lock hash. Returns false if it was not present.
    pub fn remove(&mut self, leaf: &[u8; 32]) -> bool {
        match self.leaves.binary_search(leaf) {
            Ok(pos) => {
                self.leaves.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Whether the leaf is present.
    pub fn contains(&self, leaf: &[u8; 32]) -> bool {
        self.leaves.binary_search(leaf).is_ok()
    }

    /// Number of pending leaves.
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    /// Whether the tree has no leaves.
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Compute the merkle root.
    pub fn root(&self) -> LocksRoot {
        if self.leaves.is_empty() {
            return EMPTY_LOCKS_ROOT;
        }

        let mut level = self.leaves.clone();
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            for pair in level.chunks(2) {
                if pair.len() == 2 {
                    next.push(keccak256_concat(&[&pair[0], &pair[1]]));
                } else {
                    // Odd node is promoted unchanged.
                    next.push(pair[0]);
                }
            }
            level = next;
        }
        level[0]
    }

    /// The root the tree would have with `leaf` added.
    pub fn root_with(&self, leaf: [u8; 32]) -> LocksRoot {
        let mut tree = self.clone();
        tree.insert(leaf);
        tree.root()
    }

    /// The root the tree would have with `leaf` removed.
    pub fn root_without(&self, leaf: &[u8; 32]) -> LocksRoot {
        let mut tree = self.clone();
        tree.remove(leaf);
        tree.root()
    }

    /// Produce the membership proof for `leaf`: the sibling path from the
    /// leaf to the root, as the escrow contract's `unlock` expects.
    ///
    /// Returns None if the leaf is not in the tree.
    pub fn proof(&self, leaf: &[u8; 32]) -> Option<Vec<[u8; 32]>> {
        let mut index = self.leaves.binary_search(leaf).ok()?;
        let mut path = Vec::new();
        let mut level = self.leaves.clone();

        while level.len() > 1 {
            let sibling = if index % 2 == 0 { index + 1 } else { index - 1 };
            if sibling < level.len() {
                path.push(level[sibling]);
            }
            // Promoted odd nodes contribute no sibling at this level.

            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            for pair in level.chunks(2) {
                if pair.len() == 2 {
                    next.push(keccak256_concat(&[&pair[0], &pair[1]]));
                } else {
                    next.push(pair[0]);
                }
            }
            index /= 2;
            level = next;
        }

        Some(path)
    }

    /// Verify a membership proof produced by [`LockTree::proof`].
    ///
    /// The path does not encode sibling sides; both orders are tried at
    /// each step, mirroring the contract's verifier. The search is at
    /// worst 2^depth and channel trees are shallow (pending locks are
    /// bounded by distributable balance).
    pub fn verify_proof(root: &LocksRoot, leaf: &[u8; 32], path: &[[u8; 32]]) -> bool {
        fn walk(current: [u8; 32], rest: &[[u8; 32]], root: &LocksRoot) -> bool {
            match rest.split_first() {
                None => current == *root,
                Some((sibling, tail)) => {
                    walk(keccak256_concat(&[&current, sibling]), tail, root)
                        || walk(keccak256_concat(&[sibling, &current]), tail, root)
                }
            }
        }
        walk(*leaf, path, root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopnet_core::keccak256;

    fn leaves(n: usize) -> Vec<[u8; 32]> {
        (0..n).map(|i| keccak256(&[i as u8])).collect()
    }

    #[test]
    fn test_empty_root() {
        assert_eq!(LockTree::new().root(), EMPTY_LOCKS_ROOT);
    }

    #[test]
    fn test_single_leaf_root() {
        let leaf = keccak256(b"lock");
        let tree = LockTree::from_leaves(vec![leaf]);
        assert_eq!(tree.root(), leaf);
    }

    #[test]
    fn test_two_leaves() {
        let mut ls = leaves(2);
        ls.sort_unstable();
        let tree = LockTree::from_leaves(ls.clone());
        assert_eq!(tree.root(), keccak256_concat(&[&ls[0], &ls[1]]));
    }

    #[test]
    fn test_three_leaves_promotes_odd() {
        let mut ls = leaves(3);
        ls.sort_unstable();
        let tree = LockTree::from_leaves(ls.clone());

        let left = keccak256_concat(&[&ls[0], &ls[1]]);
        let expected = keccak256_concat(&[&left, &ls[2]]);
        assert_eq!(tree.root(), expected);
    }

    #[test]
    fn test_insert_order_irrelevant() {
        let ls = leaves(7);
        let mut forward = LockTree::new();
        for l in &ls {
            forward.insert(*l);
        }
        let mut backward = LockTree::new();
        for l in ls.iter().rev() {
            backward.insert(*l);
        }
        assert_eq!(forward.root(), backward.root());
    }

    #[test]
    fn test_insert_remove_roundtrip() {
        let ls = leaves(5);
        let mut tree = LockTree::from_leaves(ls[..4].to_vec());
        let before = tree.root();

        assert!(tree.insert(ls[4]));
        assert_ne!(tree.root(), before);
        assert!(tree.remove(&ls[4]));
        assert_eq!(tree.root(), before);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let leaf = keccak256(b"lock");
        let mut tree = LockTree::new();
        assert!(tree.insert(leaf));
        assert!(!tree.insert(leaf));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_root_with_without_are_previews() {
        let ls = leaves(4);
        let tree = LockTree::from_leaves(ls[..3].to_vec());

        let mut grown = tree.clone();
        grown.insert(ls[3]);
        assert_eq!(tree.root_with(ls[3]), grown.root());
        assert_eq!(grown.root_without(&ls[3]), tree.root());
    }

    #[test]
    fn test_proof_verifies() {
        for n in 1..9 {
            let ls = leaves(n);
            let tree = LockTree::from_leaves(ls.clone());
            let root = tree.root();
            for leaf in &ls {
                let path = tree.proof(leaf).expect("leaf is present");
                assert!(
                    LockTree::verify_proof(&root, leaf, &path),
                    "proof failed for tree of {} leaves",
                    n
                );
            }
        }
    }

    #[test]
    fn test_proof_for_missing_leaf() {
        let tree = LockTree::from_leaves(leaves(3));
        assert!(tree.proof(&keccak256(b"absent")).is_none());
    }

    #[test]
    fn test_wrong_proof_rejected() {
        let ls = leaves(4);
        let tree = LockTree::from_leaves(ls.clone());
        let root = tree.root();
        let mut path = tree.proof(&ls[0]).unwrap();
        path[0] = keccak256(b"corrupted");
        assert!(!LockTree::verify_proof(&root, &ls[0], &path));
    }
}
