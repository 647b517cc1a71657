//! Daemon lifecycle management for mujina-pool.
//!
//! This module handles the core daemon functionality: the startup
//! handshake with the coin daemons, wiring the long-running tasks
//! together, signal handling, and graceful shutdown.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Network, ScriptBuf};
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::Config;
use crate::hub::Hub;
use crate::job::{CoinbaseParams, JobRegistry, Recipient};
use crate::node::{self, HttpRpc, NodeCluster, NodeInstance, NodeTask};
use crate::peer::{self, PeerConfig};
use crate::stratum::{OpenAuthorizer, StratumServer};
use crate::tracing::prelude::*;

/// The main daemon that coordinates the pool.
pub struct Daemon {
    config: Config,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Create a new daemon instance.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            coin = %self.config.coin.name,
            symbol = %self.config.coin.symbol,
            "Starting pool."
        );

        let client = reqwest::Client::new();
        let instances = self
            .config
            .daemons
            .iter()
            .map(|daemon| NodeInstance {
                label: format!("{}:{}", daemon.host, daemon.port),
                rpc: Box::new(HttpRpc::new(
                    client.clone(),
                    &daemon.host,
                    daemon.port,
                    &daemon.user,
                    &daemon.password,
                )),
            })
            .collect();
        let cluster = NodeCluster::new(instances);

        // No pool without a chain: startup blocks on the handshake.
        node::wait_online(&cluster, &self.shutdown).await?;
        let startup = node::startup_checks(&cluster, &self.config.address).await?;
        info!(
            network = %startup.network,
            protocol = startup.protocol_version,
            "Daemon handshake complete."
        );
        let use_candidate_api = self.config.extensions.mining_candidate_api;
        let template = node::wait_synced(&cluster, use_candidate_api, &self.shutdown).await?;
        info!(height = template.height, "Chain synced, initial work in hand.");

        let coinbase = coinbase_params(&self.config, startup.network)?;
        let instance_id = self.config.instance_id.unwrap_or_else(clock_instance_id);
        let mut registry = JobRegistry::new(
            instance_id,
            coinbase,
            self.config.emit_invalid_block_hashes,
        );
        registry.submit_template(template);

        let (registrations_tx, registrations_rx) = mpsc::channel(64);
        let (templates_tx, templates_rx) = mpsc::channel(16);
        let (peer_tx, peer_rx) = mpsc::channel(16);
        let (commands_tx, commands_rx) = mpsc::channel(16);

        let node_task = NodeTask::new(
            cluster,
            use_candidate_api,
            startup.has_submit_method,
            Duration::from_millis(self.config.block_refresh_interval),
            templates_tx,
            commands_rx,
            self.shutdown.clone(),
        );
        self.tracker.spawn(node_task.run());

        if let Some(p2p) = self.config.p2p.clone().filter(|p2p| p2p.enabled) {
            let configured_magic = match startup.network {
                Network::Bitcoin => self.config.coin.peer_magic.as_deref(),
                _ => self.config.coin.peer_magic_testnet.as_deref(),
            };
            let peer_config = PeerConfig {
                host: p2p.host,
                port: p2p.port,
                magic: peer::magic_for(startup.network, configured_magic)?,
                protocol_version: startup.protocol_version,
                disable_transactions: p2p.disable_transactions,
            };
            self.tracker
                .spawn(peer::run(peer_config, peer_tx, self.shutdown.clone()));
        }

        let hub = Hub::new(
            self.config.clone(),
            registry,
            Arc::new(OpenAuthorizer),
            registrations_rx,
            templates_rx,
            peer_rx,
            commands_tx,
            self.shutdown.clone(),
        );
        self.tracker.spawn(hub.run());

        let host: IpAddr = self
            .config
            .host
            .parse()
            .with_context(|| format!("parsing bind host {:?}", self.config.host))?;
        let server = StratumServer::bind(
            host,
            &self.config.enabled_ports(),
            self.config.tcp_proxy_protocol,
            registrations_tx,
        )
        .await
        .context("binding stratum listeners")?;
        self.tracker.spawn(server.run(self.shutdown.clone()));
        self.tracker.close();

        info!("Started.");

        // Install signal handlers
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        // Wait for shutdown signal
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            },
        }

        trace!("Shutting down.");
        self.shutdown.cancel();

        // Wait for all tasks to complete
        self.tracker.wait().await;
        info!("Exiting.");

        Ok(())
    }
}

/// Turns the configured payout addresses into coinbase outputs, now
/// that the daemon has told us which network we are on.
fn coinbase_params(config: &Config, network: Network) -> anyhow::Result<CoinbaseParams> {
    let pool_script = payout_script(&config.address, network).context("pool payout address")?;

    let mut recipients = Vec::new();
    for (address, percent) in &config.reward_recipients {
        match payout_script(address, network) {
            Ok(script) => recipients.push(Recipient {
                script,
                percent: percent / 100.0,
            }),
            Err(error) => {
                warn!(address = %address, error = %error, "Skipping an unusable fee recipient.");
            }
        }
    }

    let payload = match &config.coinbase_payload {
        Some(hex_script) => {
            let bytes = hex::decode(hex_script).context("decoding coinbasePayload")?;
            Some(ScriptBuf::from_bytes(bytes))
        }
        None => None,
    };

    Ok(CoinbaseParams {
        pool_script,
        recipients,
        tx_messages: config.coin.tx_messages,
        payload,
    })
}

fn payout_script(address: &str, network: Network) -> anyhow::Result<ScriptBuf> {
    let parsed: Address<NetworkUnchecked> = address
        .parse()
        .with_context(|| format!("parsing address {address:?}"))?;
    let checked = parsed
        .require_network(network)
        .with_context(|| format!("address {address:?} is not usable on {network}"))?;
    Ok(checked.script_pubkey())
}

/// Instance id when none is configured: seconds of the Unix clock. The
/// extranonce counter keeps only the low five bits.
fn clock_instance_id() -> u32 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|since| since.as_secs() as u32)
        .unwrap_or_default()
}
