//! Mining jobs: prepared work broadcast to miners.

use std::collections::HashSet;

use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Target, TxMerkleNode};
use serde_json::{json, Value};

use crate::job::coinbase::{self, CoinbaseParams};
use crate::job::merkle;
use crate::job::template::{BlockTemplate, TemplateSource};

/// Version bits miners may roll, BIP 320.
pub const MAX_VERSION_MASK: u32 = 0x1fff_e000;

/// One unit of work offered to miners. Everything hashable is
/// precomputed at construction so share validation only reassembles
/// the coinbase and folds the merkle branch.
#[derive(Debug)]
pub struct MiningJob {
    pub id: String,
    pub template: BlockTemplate,
    /// Network difficulty of this job's target.
    pub difficulty: f64,
    pub coinbase_prefix: Vec<u8>,
    pub coinbase_suffix: Vec<u8>,
    pub merkle_branch: Vec<TxMerkleNode>,
    submissions: HashSet<String>,
}

impl MiningJob {
    pub fn new(id: String, template: BlockTemplate, coinbase: &CoinbaseParams) -> Self {
        let (coinbase_prefix, coinbase_suffix) = coinbase::build(coinbase, &template);
        let merkle_branch = match &template.source {
            TemplateSource::Transactions(transactions) => {
                let hashes: Vec<TxMerkleNode> = transactions
                    .iter()
                    .map(|tx| TxMerkleNode::from_byte_array(tx.txid.to_byte_array()))
                    .collect();
                merkle::merkle_branch(&hashes)
            }
            TemplateSource::Candidate { proof, .. } => proof.clone(),
        };
        let difficulty = difficulty_of(template.target);
        MiningJob {
            id,
            template,
            difficulty,
            coinbase_prefix,
            coinbase_suffix,
            merkle_branch,
            submissions: HashSet::new(),
        }
    }

    /// Version broadcast in `mining.notify`, with all rollable bits
    /// cleared so a miner ORing its rolled bits back in reproduces the
    /// header version the pool will validate.
    pub fn broadcast_version(&self) -> u32 {
        self.template.version & !MAX_VERSION_MASK
    }

    /// Header version for a submitted share.
    pub fn header_version(&self, version_bits: Option<u32>) -> u32 {
        self.broadcast_version() | version_bits.unwrap_or(0)
    }

    /// Records a submission fingerprint, returning false when it was
    /// already seen.
    pub fn register_submission(&mut self, fingerprint: String) -> bool {
        self.submissions.insert(fingerprint)
    }

    /// `mining.notify` params.
    pub fn notify_params(&self, clean_jobs: bool) -> Value {
        let branch: Vec<String> = self
            .merkle_branch
            .iter()
            .map(|node| hex::encode(node.as_byte_array()))
            .collect();
        json!([
            self.id,
            prev_hash_stratum_hex(&self.template.prev_blockhash),
            hex::encode(&self.coinbase_prefix),
            hex::encode(&self.coinbase_suffix),
            branch,
            format!("{:08x}", self.broadcast_version()),
            format!("{:08x}", self.template.bits.to_consensus()),
            format!("{:08x}", self.template.curtime),
            clean_jobs,
        ])
    }
}

/// A solved block in the shape its daemon API expects.
#[derive(Debug, Clone)]
pub enum BlockSolution {
    /// Raw block hex for `submitblock`.
    Block(String),
    /// Fields for `submitminingsolution`.
    Candidate {
        id: Value,
        nonce: u32,
        coinbase: String,
        time: u32,
        version: u32,
    },
}

/// Previous block hash in the odd encoding stratum notifications use.
///
/// A `BlockHash` displays as the reversal of its internal bytes. The
/// wire field is neither: it is the display-order hex with each of the
/// eight 4-byte words reversed. Miners write those words straight into
/// the header, so getting this wrong produces shares that never
/// validate.
pub fn prev_hash_stratum_hex(hash: &BlockHash) -> String {
    let mut bytes = hash.to_byte_array();
    for word in bytes.chunks_mut(4) {
        word.reverse();
    }
    hex::encode(bytes)
}

/// Difficulty of `target` relative to difficulty 1, truncated the way
/// it is reported in share logs.
pub fn difficulty_of(target: Target) -> f64 {
    (target.difficulty_float() * 1e9).round() / 1e9
}

/// Difficulty actually achieved by a solved header.
pub fn share_difficulty(hash: &BlockHash) -> f64 {
    Target::from_le_bytes(hash.to_byte_array()).difficulty_float()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::coinbase::Recipient;
    use crate::job::template::TemplateTransaction;
    use bitcoin::{CompactTarget, ScriptBuf};

    fn test_params() -> CoinbaseParams {
        CoinbaseParams {
            pool_script: ScriptBuf::from_bytes(vec![0x51]),
            recipients: vec![Recipient {
                script: ScriptBuf::from_bytes(vec![0x52]),
                percent: 0.01,
            }],
            tx_messages: false,
            payload: None,
        }
    }

    fn test_template(version: u32) -> BlockTemplate {
        BlockTemplate {
            height: 100,
            prev_blockhash: "0000000000000000000000000000000000000000000000000000000000000001"
                .parse()
                .unwrap(),
            version,
            bits: CompactTarget::from_consensus(0x1d00_ffff),
            curtime: 0x679a_c169,
            reward: 5_000_000_000,
            target: Target::from_compact(CompactTarget::from_consensus(0x1d00_ffff)),
            witness_commitment: None,
            aux_flags: Vec::new(),
            source: TemplateSource::Transactions(Vec::new()),
        }
    }

    #[test]
    fn notify_params_have_the_wire_shape() {
        let job = MiningJob::new("1".into(), test_template(0x2000_0000), &test_params());
        let params = job.notify_params(true);
        let params = params.as_array().unwrap();

        assert_eq!(params.len(), 9);
        assert_eq!(params[0], "1");
        // Internal byte 0x01 sits in the first word, reversed to its tail.
        assert_eq!(
            params[1].as_str().unwrap(),
            "0000000100000000000000000000000000000000000000000000000000000000"
        );
        assert_eq!(params[2].as_str().unwrap(), hex::encode(&job.coinbase_prefix));
        assert_eq!(params[3].as_str().unwrap(), hex::encode(&job.coinbase_suffix));
        assert_eq!(params[4], serde_json::json!([]));
        assert_eq!(params[5].as_str().unwrap(), "20000000");
        assert_eq!(params[6].as_str().unwrap(), "1d00ffff");
        assert_eq!(params[7].as_str().unwrap(), "679ac169");
        assert_eq!(params[8], true);
    }

    #[test]
    fn broadcast_version_clears_rollable_bits() {
        let job = MiningJob::new("1".into(), test_template(0x2e59_6000), &test_params());
        assert_eq!(job.broadcast_version(), 0x2000_0000);
    }

    #[test]
    fn header_version_merges_rolled_bits() {
        let job = MiningJob::new("1".into(), test_template(0x2000_0000), &test_params());
        assert_eq!(job.header_version(None), 0x2000_0000);
        assert_eq!(job.header_version(Some(0x0e59_6000)), 0x2e59_6000);
    }

    #[test]
    fn merkle_branch_built_from_template_transactions() {
        let mut template = test_template(0x2000_0000);
        template.source = TemplateSource::Transactions(vec![TemplateTransaction {
            data: "aa".into(),
            txid: "1111111111111111111111111111111111111111111111111111111111111111"
                .parse()
                .unwrap(),
        }]);
        let job = MiningJob::new("1".into(), template, &test_params());
        assert_eq!(job.merkle_branch.len(), 1);
        // Internal order: display hex reversed.
        assert_eq!(
            hex::encode(job.merkle_branch[0].as_byte_array()),
            "1111111111111111111111111111111111111111111111111111111111111111"
        );
    }

    #[test]
    fn repeat_submissions_are_flagged() {
        let mut job = MiningJob::new("1".into(), test_template(0x2000_0000), &test_params());
        assert!(job.register_submission("abcd".into()));
        assert!(!job.register_submission("abcd".into()));
        assert!(job.register_submission("abce".into()));
    }

    #[test]
    fn difficulty_one_for_the_maximum_attainable_target() {
        assert_eq!(
            difficulty_of(Target::from_compact(CompactTarget::from_consensus(
                0x1d00_ffff
            ))),
            1.0
        );
    }

    #[test]
    fn prev_hash_encoding_swaps_words_of_a_real_hash() {
        let hash: BlockHash = "00000000000000000001b04dd1c2f7e41fc3f5e2524d4e116aca4071e8d95f9a"
            .parse()
            .unwrap();
        let encoded = prev_hash_stratum_hex(&hash);
        // Internal bytes grouped in 4-byte words, each word reversed.
        let internal = hash.to_byte_array();
        for (word_index, word) in internal.chunks(4).enumerate() {
            let expected: Vec<u8> = word.iter().rev().copied().collect();
            let offset = word_index * 8;
            assert_eq!(encoded[offset..offset + 8], hex::encode(expected));
        }
    }
}
