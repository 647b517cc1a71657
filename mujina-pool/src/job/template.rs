//! Work template normalization.
//!
//! The two daemon work APIs describe the same thing differently:
//! `getblocktemplate` hands over full transactions, while
//! `getminingcandidate` sends only a merkle proof and expects solutions
//! back through its own submit call. Both collapse into one
//! [`BlockTemplate`] here so the rest of the pool never cares which
//! API fed it.

use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, CompactTarget, Target, Txid, TxMerkleNode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid template {field}")]
pub struct TemplateError {
    pub field: &'static str,
}

fn bad(field: &'static str) -> TemplateError {
    TemplateError { field }
}

/// Raw `getblocktemplate` response, reduced to the fields we consume.
#[derive(Debug, Clone, Deserialize)]
pub struct GetBlockTemplate {
    pub height: u32,
    pub previousblockhash: String,
    pub version: i32,
    pub bits: String,
    pub curtime: u32,
    pub coinbasevalue: u64,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub default_witness_commitment: Option<String>,
    #[serde(default)]
    pub coinbaseaux: Option<CoinbaseAux>,
    #[serde(default)]
    pub transactions: Vec<RawTransaction>,
}

/// The `coinbaseaux` object: hex flag bytes the daemon wants echoed in
/// the coinbase script sig. Modern daemons send it empty.
#[derive(Debug, Clone, Deserialize)]
pub struct CoinbaseAux {
    #[serde(default)]
    pub flags: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTransaction {
    pub data: String,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
}

/// Raw `getminingcandidate` response.
#[derive(Debug, Clone, Deserialize)]
pub struct MiningCandidate {
    pub id: Value,
    pub prevhash: String,
    #[serde(rename = "coinbaseValue")]
    pub coinbase_value: u64,
    #[serde(rename = "nBits")]
    pub n_bits: String,
    pub time: u32,
    pub height: u32,
    pub version: i32,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(rename = "merkleProof", default)]
    pub merkle_proof: Vec<String>,
}

/// A normalized unit of work from either API.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub height: u32,
    pub prev_blockhash: BlockHash,
    pub version: u32,
    pub bits: CompactTarget,
    pub curtime: u32,
    /// Block reward plus fees, in satoshis.
    pub reward: u64,
    pub target: Target,
    /// Raw witness commitment script, `getblocktemplate` only.
    pub witness_commitment: Option<Vec<u8>>,
    /// Decoded `coinbaseaux` flags, echoed into the script sig.
    pub aux_flags: Vec<u8>,
    pub source: TemplateSource,
}

#[derive(Debug, Clone)]
pub enum TemplateSource {
    /// Full transaction set; solved blocks are serialized locally and
    /// submitted as raw hex.
    Transactions(Vec<TemplateTransaction>),
    /// Merkle proof only; solutions go back as candidate solutions
    /// referencing `id`.
    Candidate { id: Value, proof: Vec<TxMerkleNode> },
}

#[derive(Debug, Clone)]
pub struct TemplateTransaction {
    /// Raw transaction hex, spliced verbatim into solved blocks.
    pub data: String,
    pub txid: Txid,
}

impl TryFrom<GetBlockTemplate> for BlockTemplate {
    type Error = TemplateError;

    fn try_from(raw: GetBlockTemplate) -> Result<Self, TemplateError> {
        let prev_blockhash: BlockHash = raw
            .previousblockhash
            .parse()
            .map_err(|_| bad("previousblockhash"))?;
        let bits = parse_bits(&raw.bits)?;
        let target = parse_target(raw.target.as_deref(), bits)?;
        let witness_commitment = raw
            .default_witness_commitment
            .as_deref()
            .map(hex::decode)
            .transpose()
            .map_err(|_| bad("default_witness_commitment"))?;
        let aux_flags = match raw.coinbaseaux.as_ref().and_then(|aux| aux.flags.as_deref()) {
            Some(flags) => hex::decode(flags).map_err(|_| bad("coinbaseaux"))?,
            None => Vec::new(),
        };

        let transactions = raw
            .transactions
            .into_iter()
            .map(|tx| {
                let id = tx
                    .txid
                    .as_deref()
                    .or(tx.hash.as_deref())
                    .ok_or_else(|| bad("transactions"))?;
                Ok(TemplateTransaction {
                    txid: id.parse().map_err(|_| bad("transactions"))?,
                    data: tx.data,
                })
            })
            .collect::<Result<Vec<_>, TemplateError>>()?;

        Ok(BlockTemplate {
            height: raw.height,
            prev_blockhash,
            version: raw.version as u32,
            bits,
            curtime: raw.curtime,
            reward: raw.coinbasevalue,
            target,
            witness_commitment,
            aux_flags,
            source: TemplateSource::Transactions(transactions),
        })
    }
}

impl TryFrom<MiningCandidate> for BlockTemplate {
    type Error = TemplateError;

    fn try_from(raw: MiningCandidate) -> Result<Self, TemplateError> {
        let prev_blockhash: BlockHash = raw.prevhash.parse().map_err(|_| bad("prevhash"))?;
        let bits = parse_bits(&raw.n_bits)?;
        let target = parse_target(raw.target.as_deref(), bits)?;

        // The proof arrives in display order; the fold works on
        // internal byte order.
        let proof = raw
            .merkle_proof
            .iter()
            .map(|node| {
                let mut bytes: [u8; 32] = hex::decode(node)
                    .map_err(|_| bad("merkleProof"))?
                    .try_into()
                    .map_err(|_| bad("merkleProof"))?;
                bytes.reverse();
                Ok(TxMerkleNode::from_byte_array(bytes))
            })
            .collect::<Result<Vec<_>, TemplateError>>()?;

        Ok(BlockTemplate {
            height: raw.height,
            prev_blockhash,
            version: raw.version as u32,
            bits,
            curtime: raw.time,
            reward: raw.coinbase_value,
            target,
            witness_commitment: None,
            aux_flags: Vec::new(),
            source: TemplateSource::Candidate { id: raw.id, proof },
        })
    }
}

fn parse_bits(bits: &str) -> Result<CompactTarget, TemplateError> {
    u32::from_str_radix(bits, 16)
        .map(CompactTarget::from_consensus)
        .map_err(|_| bad("bits"))
}

/// Explicit target when the daemon supplies one, otherwise expanded
/// from the compact bits.
fn parse_target(explicit: Option<&str>, bits: CompactTarget) -> Result<Target, TemplateError> {
    match explicit {
        None => Ok(Target::from_compact(bits)),
        Some(hex) => {
            let bytes: [u8; 32] = hex::decode(hex)
                .map_err(|_| bad("target"))?
                .try_into()
                .map_err(|_| bad("target"))?;
            Ok(Target::from_be_bytes(bytes))
        }
    }
}
