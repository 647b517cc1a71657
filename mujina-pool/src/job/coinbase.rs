//! Coinbase transaction assembly.
//!
//! Jobs carry a coinbase serialized in two halves with a gap for the
//! extranonce between them. Miners splice their extranonce bytes into
//! the gap, so both halves must be byte-stable for the life of a job.

use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::ScriptBuf;

use crate::job::extranonce;
use crate::job::template::BlockTemplate;

/// Coinbase script signature tag identifying blocks mined here.
pub const POOL_SIGNATURE: &str = "/mujina-pool/";

/// Trailing transaction comment, appended when `tx_messages` is set.
const POOL_COMMENT: &str = "mujina-pool";

/// A fee recipient paid a fixed fraction of each block reward.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub script: ScriptBuf,
    /// Fraction of the reward, `0.0..1.0`.
    pub percent: f64,
}

/// Everything the pool contributes to a coinbase besides the template.
#[derive(Debug, Clone)]
pub struct CoinbaseParams {
    pub pool_script: ScriptBuf,
    pub recipients: Vec<Recipient>,
    /// Use transaction version 2 and append `POOL_COMMENT`.
    pub tx_messages: bool,
    /// Opaque script for a trailing zero-value output.
    pub payload: Option<ScriptBuf>,
}

/// Serializes the two coinbase halves for `template`. The gap between
/// them is exactly `extranonce::PLACEHOLDER` bytes wide.
pub fn build(params: &CoinbaseParams, template: &BlockTemplate) -> (Vec<u8>, Vec<u8>) {
    let tx_version: u32 = if params.tx_messages { 2 } else { 1 };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let mut script_prefix = script_number(template.height as u64);
    script_prefix.extend_from_slice(&template.aux_flags);
    script_prefix.extend_from_slice(&script_number(now));
    script_prefix.push(extranonce::PLACEHOLDER.len() as u8);

    let script_suffix = serialize_string(POOL_SIGNATURE);
    let script_len = script_prefix.len() + extranonce::PLACEHOLDER.len() + script_suffix.len();

    let mut prefix = Vec::new();
    prefix.extend_from_slice(&tx_version.to_le_bytes());
    prefix.extend_from_slice(&var_int(1)); // input count
    prefix.extend_from_slice(&[0u8; 32]); // generation outpoint
    prefix.extend_from_slice(&u32::MAX.to_le_bytes()); // outpoint index
    prefix.extend_from_slice(&var_int(script_len as u64));
    prefix.extend_from_slice(&script_prefix);

    let mut suffix = Vec::new();
    suffix.extend_from_slice(&script_suffix);
    suffix.extend_from_slice(&0u32.to_le_bytes()); // input sequence
    suffix.extend_from_slice(&outputs(params, template));
    suffix.extend_from_slice(&0u32.to_le_bytes()); // locktime
    if params.tx_messages {
        suffix.extend_from_slice(&serialize_string(POOL_COMMENT));
    }

    (prefix, suffix)
}

/// Serializes the output list. The witness commitment (when the
/// template carries one) leads, then the pool reward, then fee
/// recipients, then an optional payload output.
fn outputs(params: &CoinbaseParams, template: &BlockTemplate) -> Vec<u8> {
    let reward = template.reward;
    let mut outputs: Vec<(u64, &[u8])> = Vec::new();

    let mut pool_reward = reward;
    for recipient in &params.recipients {
        let value = (recipient.percent * reward as f64).floor() as u64;
        pool_reward = pool_reward.saturating_sub(value);
        outputs.push((value, recipient.script.as_bytes()));
    }
    outputs.insert(0, (pool_reward, params.pool_script.as_bytes()));
    if let Some(commitment) = &template.witness_commitment {
        outputs.insert(0, (0, commitment.as_slice()));
    }
    if let Some(payload) = &params.payload {
        outputs.push((0, payload.as_bytes()));
    }

    let mut serialized = var_int(outputs.len() as u64);
    for (value, script) in outputs {
        serialized.extend_from_slice(&value.to_le_bytes());
        serialized.extend_from_slice(&var_int(script.len() as u64));
        serialized.extend_from_slice(script);
    }
    serialized
}

/// Script-style number serialization used in coinbase script sigs:
/// 1 through 16 become the OP_1..OP_16 opcodes, anything else a length
/// byte followed by little-endian digits.
pub(crate) fn script_number(value: u64) -> Vec<u8> {
    if (1..=16).contains(&value) {
        return vec![0x50 + value as u8];
    }
    let mut digits = Vec::new();
    let mut v = value;
    while v > 0x7f {
        digits.push((v & 0xff) as u8);
        v >>= 8;
    }
    digits.push(v as u8);
    let mut out = vec![digits.len() as u8];
    out.extend_from_slice(&digits);
    out
}

/// A length-prefixed string, as embedded in script sigs and comments.
pub(crate) fn serialize_string(s: &str) -> Vec<u8> {
    let mut out = var_int(s.len() as u64);
    out.extend_from_slice(s.as_bytes());
    out
}

/// Bitcoin compact-size integer.
pub(crate) fn var_int(n: u64) -> Vec<u8> {
    match n {
        0..=0xfc => vec![n as u8],
        0xfd..=0xffff => {
            let mut out = vec![0xfd];
            out.extend_from_slice(&(n as u16).to_le_bytes());
            out
        }
        0x1_0000..=0xffff_ffff => {
            let mut out = vec![0xfe];
            out.extend_from_slice(&(n as u32).to_le_bytes());
            out
        }
        _ => {
            let mut out = vec![0xff];
            out.extend_from_slice(&n.to_le_bytes());
            out
        }
    }
}
