//! The job registry: which jobs are valid, whether a template is
//! fresh, and whether a submitted share holds up.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::block::{Header, Version};
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::BlockHash;

use crate::job::coinbase::{var_int, CoinbaseParams};
use crate::job::extranonce::{ExtranonceCounter, JobCounter};
use crate::job::job::{difficulty_of, share_difficulty, BlockSolution, MiningJob};
use crate::job::merkle;
use crate::job::template::{BlockTemplate, TemplateSource};
use crate::stratum::ShareError;
use crate::stratum::version_rolling;
use crate::tracing::prelude::*;

/// Miner ntime may run ahead of our clock by at most this much.
const NTIME_FORWARD_SLACK: u64 = 7200;

/// A `mining.submit` with the session context validation needs.
#[derive(Debug, Clone)]
pub struct ShareSubmission {
    pub job_id: String,
    /// Pool-assigned at subscribe time, hex.
    pub extranonce1: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
    pub version_bits: Option<String>,
    /// Mask negotiated via `mining.configure`, if any.
    pub version_mask: Option<u32>,
    pub difficulty: f64,
    /// Difficulty before the last retarget, accepted for one grace
    /// window so shares in flight across a retarget are not burned.
    pub previous_difficulty: Option<f64>,
}

/// A share that passed validation.
#[derive(Debug, Clone)]
pub struct ShareAccepted {
    pub height: u32,
    pub reward: u64,
    /// Difficulty the share was credited at.
    pub difficulty: f64,
    pub share_difficulty: f64,
    pub block_difficulty: f64,
    /// Set when the share solves a block.
    pub block_hash: Option<BlockHash>,
    /// Hash of a non-solving share, kept only when configured.
    pub invalid_hash: Option<BlockHash>,
    pub solution: Option<BlockSolution>,
}

/// Owns every job miners may still submit against, plus the counters
/// that partition the extranonce space and number the jobs.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: HashMap<String, MiningJob>,
    current_id: Option<String>,
    job_counter: JobCounter,
    extranonce_counter: ExtranonceCounter,
    coinbase: CoinbaseParams,
    emit_invalid_hashes: bool,
}

impl JobRegistry {
    pub fn new(instance_id: u32, coinbase: CoinbaseParams, emit_invalid_hashes: bool) -> Self {
        JobRegistry {
            jobs: HashMap::new(),
            current_id: None,
            job_counter: JobCounter::default(),
            extranonce_counter: ExtranonceCounter::new(instance_id),
            coinbase,
            emit_invalid_hashes,
        }
    }

    pub fn current(&self) -> Option<&MiningJob> {
        self.current_id.as_ref().and_then(|id| self.jobs.get(id))
    }

    pub fn next_extranonce1(&mut self) -> String {
        self.extranonce_counter.next()
    }

    pub fn extranonce2_size(&self) -> usize {
        self.extranonce_counter.extranonce2_size()
    }

    /// Installs `template` if it advances the chain state we are
    /// working on. Returns whether a new current job was created.
    ///
    /// A template loses to the current job when it is for a lower
    /// height, or when it extends the same parent with the same bits
    /// (a poll echoing work we already broadcast). A same-height
    /// template with a different parent wins; that is a reorg.
    pub fn submit_template(&mut self, template: BlockTemplate) -> bool {
        if let Some(current) = self.current() {
            if template.height < current.template.height {
                return false;
            }
            if template.prev_blockhash == current.template.prev_blockhash
                && template.bits == current.template.bits
            {
                return false;
            }
        }
        // Prior jobs build on a parent that is no longer ours.
        self.jobs.clear();
        self.install(template);
        true
    }

    /// Installs a job from `template` without invalidating the jobs
    /// already out there. Used to freshen transaction sets and
    /// timestamps at the same height.
    pub fn force_refresh(&mut self, template: BlockTemplate) {
        self.install(template);
    }

    fn install(&mut self, template: BlockTemplate) {
        let id = self.job_counter.next();
        let job = MiningJob::new(id.clone(), template, &self.coinbase);
        debug!(
            job_id = %id,
            height = job.template.height,
            difficulty = job.difficulty,
            "Job installed."
        );
        self.jobs.insert(id.clone(), job);
        self.current_id = Some(id);
    }

    /// Validates a share, registering its fingerprint on success so a
    /// resubmission is rejected as a duplicate.
    pub fn validate(&mut self, share: &ShareSubmission) -> Result<ShareAccepted, ShareError> {
        let extranonce2 = hex::decode(&share.extranonce2)
            .map_err(|_| ShareError::malformed("incorrect size of extranonce2"))?;
        if extranonce2.len() != self.extranonce2_size() {
            return Err(ShareError::malformed("incorrect size of extranonce2"));
        }

        let job = self
            .jobs
            .get_mut(&share.job_id)
            .ok_or(ShareError::JobNotFound)?;

        if share.ntime.len() != 8 {
            return Err(ShareError::malformed("incorrect size of ntime"));
        }
        let ntime = u32::from_str_radix(&share.ntime, 16)
            .map_err(|_| ShareError::malformed("ntime out of range"))?;
        let now = unix_time();
        if ntime < job.template.curtime || u64::from(ntime) > now + NTIME_FORWARD_SLACK {
            return Err(ShareError::malformed("ntime out of range"));
        }

        if share.nonce.len() != 8 {
            return Err(ShareError::malformed("incorrect size of nonce"));
        }
        let nonce = u32::from_str_radix(&share.nonce, 16)
            .map_err(|_| ShareError::malformed("incorrect size of nonce"))?;

        let version_bits = match &share.version_bits {
            Some(bits) => Some(
                version_rolling::rolled_bits(bits, share.version_mask.unwrap_or(0))
                    .ok_or_else(|| ShareError::malformed("invalid version bits"))?,
            ),
            None => None,
        };

        let mut fingerprint = format!(
            "{}{}{}{}",
            share.extranonce1, share.extranonce2, share.ntime, share.nonce
        );
        if let Some(bits) = &share.version_bits {
            fingerprint.push_str(bits);
        }
        if !job.register_submission(fingerprint) {
            return Err(ShareError::DuplicateShare);
        }

        let extranonce1 = hex::decode(&share.extranonce1)
            .map_err(|_| ShareError::malformed("incorrect size of extranonce1"))?;

        let mut coinbase = job.coinbase_prefix.clone();
        coinbase.extend_from_slice(&extranonce1);
        coinbase.extend_from_slice(&extranonce2);
        coinbase.extend_from_slice(&job.coinbase_suffix);

        let coinbase_hash = sha256d::Hash::hash(&coinbase);
        let merkle_root = merkle::merkle_root_from_branch(coinbase_hash, &job.merkle_branch);

        let header = Header {
            version: Version::from_consensus(job.header_version(version_bits) as i32),
            prev_blockhash: job.template.prev_blockhash,
            merkle_root,
            time: ntime,
            bits: job.template.bits,
            nonce,
        };
        let block_hash = header.block_hash();
        let share_diff = share_difficulty(&block_hash);

        let mut accepted = ShareAccepted {
            height: job.template.height,
            reward: job.template.reward,
            difficulty: share.difficulty,
            share_difficulty: share_diff,
            block_difficulty: difficulty_of(job.template.target),
            block_hash: None,
            invalid_hash: None,
            solution: None,
        };

        if job.template.target.is_met_by(block_hash) {
            accepted.block_hash = Some(block_hash);
            accepted.solution = Some(match &job.template.source {
                TemplateSource::Transactions(transactions) => {
                    BlockSolution::Block(serialize_block(&header, &coinbase, transactions))
                }
                TemplateSource::Candidate { id, .. } => BlockSolution::Candidate {
                    id: id.clone(),
                    nonce,
                    coinbase: hex::encode(&coinbase),
                    time: ntime,
                    version: header.version.to_consensus() as u32,
                },
            });
            return Ok(accepted);
        }

        if self.emit_invalid_hashes {
            accepted.invalid_hash = Some(block_hash);
        }

        // Not a block; the share must still meet the session
        // difficulty, give or take float slop.
        if share_diff / share.difficulty < 0.99 {
            match share.previous_difficulty {
                Some(previous) if share_diff >= previous => {
                    accepted.difficulty = previous;
                }
                _ => return Err(ShareError::LowDifficulty(share_diff)),
            }
        }

        Ok(accepted)
    }
}

/// Raw block hex: header, transaction count, coinbase, then the
/// template transactions verbatim.
fn serialize_block(
    header: &Header,
    coinbase: &[u8],
    transactions: &[crate::job::template::TemplateTransaction],
) -> String {
    let mut block = serialize_hex(header);
    block.push_str(&hex::encode(var_int(transactions.len() as u64 + 1)));
    block.push_str(&hex::encode(coinbase));
    for tx in transactions {
        block.push_str(&tx.data);
    }
    block
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
