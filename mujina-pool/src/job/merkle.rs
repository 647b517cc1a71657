//! Merkle branch computation for stratum jobs.
//!
//! Miners never see the full transaction set. They get a precomputed
//! branch and fold their own coinbase hash up it, so the pool must
//! compute the branch for a coinbase sitting at index zero and later
//! repeat the same fold to validate submitted shares.

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::TxMerkleNode;

/// Computes the merkle branch for a block whose first transaction is
/// the (not yet known) coinbase.
///
/// `hashes` holds the remaining transaction hashes in block order. The
/// returned branch has one node per tree level: the node a miner
/// combines with its running coinbase hash to climb toward the root.
/// An empty transaction list yields an empty branch.
pub fn merkle_branch(hashes: &[TxMerkleNode]) -> Vec<TxMerkleNode> {
    let mut branch = Vec::new();
    let mut level = hashes.to_vec();
    while !level.is_empty() {
        branch.push(level[0]);
        // Pair up the rest of the level, duplicating a trailing odd
        // node, exactly as the fold on the miner side expects.
        level = level[1..]
            .chunks(2)
            .map(|pair| combine(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
    }
    branch
}

/// Folds a coinbase transaction hash up `branch` to the merkle root,
/// with the running hash always on the left.
pub fn merkle_root_from_branch(
    coinbase_hash: sha256d::Hash,
    branch: &[TxMerkleNode],
) -> TxMerkleNode {
    let mut current = TxMerkleNode::from_byte_array(coinbase_hash.to_byte_array());
    for node in branch {
        current = combine(&current, node);
    }
    current
}

fn combine(left: &TxMerkleNode, right: &TxMerkleNode) -> TxMerkleNode {
    let mut combined = left.as_byte_array().to_vec();
    combined.extend_from_slice(right.as_byte_array());
    TxMerkleNode::from_byte_array(sha256d::Hash::hash(&combined).to_byte_array())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::test_blocks::block_881423;
    use bitcoin::consensus::deserialize;
    use bitcoin::Transaction;

    /// Root of a whole tree, the reference way: pairwise reduction with
    /// the odd tail duplicated at each level.
    fn reference_root(leaves: &[TxMerkleNode]) -> TxMerkleNode {
        let mut level = leaves.to_vec();
        while level.len() > 1 {
            if level.len() % 2 == 1 {
                level.push(level[level.len() - 1]);
            }
            level = level
                .chunks(2)
                .map(|pair| combine(&pair[0], &pair[1]))
                .collect();
        }
        level[0]
    }

    fn leaf(tag: u8) -> TxMerkleNode {
        TxMerkleNode::from_byte_array(sha256d::Hash::hash(&[tag]).to_byte_array())
    }

    #[test]
    fn branch_fold_matches_full_tree() {
        for tx_count in 0..=7 {
            let coinbase = sha256d::Hash::hash(&[0]);
            let hashes: Vec<TxMerkleNode> = (1..=tx_count).map(|i| leaf(i as u8)).collect();

            let branch = merkle_branch(&hashes);
            let folded = merkle_root_from_branch(coinbase, &branch);

            let mut leaves = vec![TxMerkleNode::from_byte_array(coinbase.to_byte_array())];
            leaves.extend_from_slice(&hashes);
            assert_eq!(
                folded,
                reference_root(&leaves),
                "fold mismatch with {tx_count} transactions"
            );
        }
    }

    #[test]
    fn branch_length_is_tree_depth() {
        for (tx_count, expected) in [(0, 0), (1, 1), (2, 2), (3, 2), (4, 3), (7, 3), (8, 4)] {
            let hashes: Vec<TxMerkleNode> = (1..=tx_count).map(|i| leaf(i as u8)).collect();
            assert_eq!(merkle_branch(&hashes).len(), expected);
        }
    }

    #[test]
    fn first_branch_node_is_first_transaction() {
        let hashes: Vec<TxMerkleNode> = (1..=5).map(leaf).collect();
        assert_eq!(merkle_branch(&hashes)[0], hashes[0]);
    }

    #[test]
    fn folds_a_mainnet_coinbase_to_its_merkle_root() {
        let coinbase: Transaction = deserialize(block_881423::COINBASE_TX).unwrap();
        let branch: Vec<TxMerkleNode> = block_881423::MERKLE_BRANCHES
            .iter()
            .map(|bytes| TxMerkleNode::from_byte_array(*bytes))
            .collect();

        let root = merkle_root_from_branch(coinbase.compute_txid().to_raw_hash(), &branch);
        assert_eq!(root, *block_881423::MERKLE_ROOT);
    }
}
