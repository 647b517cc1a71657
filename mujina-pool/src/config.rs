//! Daemon configuration.
//!
//! One JSON file configures the whole pool: the coin, the payout
//! address, stratum listeners, daemon backends, and the optional p2p
//! link. Keys are camelCase, matching the classic pool config shape,
//! so existing config files port over with minimal edits.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::vardiff::VardiffOptions;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub coin: CoinOptions,
    /// Block reward payout address.
    pub address: String,
    /// Fee outputs taken off the top of each block reward, address to
    /// percent of the reward.
    #[serde(default)]
    pub reward_recipients: HashMap<String, f64>,
    /// Hex script for an extra zero-value coinbase output.
    #[serde(default)]
    pub coinbase_payload: Option<String>,
    /// Stratum listeners keyed by TCP port. Only enabled entries are
    /// bound.
    pub ports: BTreeMap<u16, PortOptions>,
    #[serde(default)]
    pub banning: BanningOptions,
    /// Seconds of miner silence before a connection is dropped.
    #[serde(default = "defaults::connection_timeout")]
    pub connection_timeout: u64,
    /// Seconds without a broadcast before the current job is re-sent.
    #[serde(default = "defaults::job_rebroadcast_timeout")]
    pub job_rebroadcast_timeout: u64,
    /// Milliseconds between work template polls.
    #[serde(default = "defaults::block_refresh_interval")]
    pub block_refresh_interval: u64,
    /// Expect an HAProxy PROXY line ahead of each miner connection.
    #[serde(default)]
    pub tcp_proxy_protocol: bool,
    /// Address the stratum listeners bind.
    #[serde(default = "defaults::host")]
    pub host: String,
    /// Partitions the extranonce space when several instances mine the
    /// same coin. Derived from the clock when unset.
    #[serde(default)]
    pub instance_id: Option<u32>,
    pub daemons: Vec<DaemonOptions>,
    #[serde(default)]
    pub p2p: Option<P2pOptions>,
    #[serde(default)]
    pub extensions: ExtensionOptions,
    /// Emit the block hash of every share, not just solutions.
    #[serde(default)]
    pub emit_invalid_block_hashes: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoinOptions {
    pub name: String,
    pub symbol: String,
    /// Coinbase carries a trailing text comment (transaction v2 coins).
    #[serde(default)]
    pub tx_messages: bool,
    /// Mainnet p2p magic override, 8 hex digits.
    #[serde(default)]
    pub peer_magic: Option<String>,
    #[serde(default)]
    pub peer_magic_testnet: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortOptions {
    #[serde(default)]
    pub enabled: bool,
    /// Share difficulty handed to fresh sessions.
    #[serde(rename = "diff", default = "defaults::port_difficulty")]
    pub difficulty: f64,
    /// Per-session retargeting; sessions stay at the static
    /// difficulty when absent.
    #[serde(rename = "varDiff", default)]
    pub vardiff: Option<VardiffOptions>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanningOptions {
    #[serde(default = "defaults::ban_enabled")]
    pub enabled: bool,
    /// Ban length, seconds.
    #[serde(default = "defaults::ban_time")]
    pub time: u64,
    /// Share mix worse than this percent of invalids earns a ban.
    #[serde(default = "defaults::ban_invalid_percent")]
    pub invalid_percent: f64,
    /// Shares a session accumulates before its mix is judged.
    #[serde(default = "defaults::ban_check_threshold")]
    pub check_threshold: u64,
    /// Seconds between sweeps of expired bans.
    #[serde(default = "defaults::ban_purge_interval")]
    pub purge_interval: u64,
}

impl Default for BanningOptions {
    fn default() -> Self {
        BanningOptions {
            enabled: defaults::ban_enabled(),
            time: defaults::ban_time(),
            invalid_percent: defaults::ban_invalid_percent(),
            check_threshold: defaults::ban_check_threshold(),
            purge_interval: defaults::ban_purge_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct P2pOptions {
    #[serde(default)]
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Ask the node not to relay loose transactions over this link.
    #[serde(default)]
    pub disable_transactions: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionOptions {
    /// Fetch work via `getminingcandidate` instead of
    /// `getblocktemplate`.
    #[serde(default)]
    pub mining_candidate_api: bool,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(text).context("parsing config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.daemons.is_empty() {
            bail!("config needs at least one daemon");
        }
        if !self.ports.values().any(|port| port.enabled) {
            bail!("config needs at least one enabled stratum port");
        }
        let fees: f64 = self.reward_recipients.values().sum();
        if fees >= 100.0 {
            bail!("reward recipients take {fees}% of the reward, leaving nothing for the pool");
        }
        Ok(())
    }

    /// Ports to serve, ascending.
    pub fn enabled_ports(&self) -> Vec<u16> {
        self.ports
            .iter()
            .filter(|(_, options)| options.enabled)
            .map(|(port, _)| *port)
            .collect()
    }
}

mod defaults {
    pub(super) fn connection_timeout() -> u64 {
        600
    }

    pub(super) fn job_rebroadcast_timeout() -> u64 {
        55
    }

    pub(super) fn block_refresh_interval() -> u64 {
        1000
    }

    pub(super) fn host() -> String {
        "127.0.0.1".into()
    }

    pub(super) fn port_difficulty() -> f64 {
        8.0
    }

    pub(super) fn ban_enabled() -> bool {
        true
    }

    pub(super) fn ban_time() -> u64 {
        600
    }

    pub(super) fn ban_invalid_percent() -> f64 {
        50.0
    }

    pub(super) fn ban_check_threshold() -> u64 {
        500
    }

    pub(super) fn ban_purge_interval() -> u64 {
        300
    }
}
