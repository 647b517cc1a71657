//! Daemon RPC: templates in, blocks out.
//!
//! The pool talks JSON-RPC over HTTP to one or more full-node
//! daemons. A [`NodeTask`] polls for work templates, fields refresh
//! requests from the hub, and submits solved blocks; free functions
//! cover the startup handshake (online, capabilities, chain sync).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use bitcoin::{BlockHash, Network};
use futures::future::join_all;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::job::{BlockSolution, BlockTemplate};
use crate::job::template::{GetBlockTemplate, MiningCandidate};
use crate::tracing::prelude::*;

/// Backoff between retries while waiting for daemons to come up or
/// finish syncing.
const STARTUP_RETRY: Duration = Duration::from_secs(5);

/// Daemon error code for "still downloading initial blocks".
const RPC_IN_WARMUP: i64 = -10;

#[derive(Debug, Error)]
pub enum RpcError {
    /// The daemon did not answer at all.
    #[error("daemon unreachable: {0}")]
    Offline(String),
    #[error("unauthorized RPC access, check the configured rpc user and password")]
    Unauthorized,
    /// The daemon answered with an RPC-level error.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed RPC response: {0}")]
    Malformed(String),
}

impl RpcError {
    pub fn code(&self) -> Option<i64> {
        match self {
            RpcError::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Still in initial block download.
    pub fn is_syncing(&self) -> bool {
        self.code() == Some(RPC_IN_WARMUP)
    }
}

/// One JSON-RPC endpoint. Mockable seam for everything above it.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

/// `NodeRpc` over HTTP with basic auth, the way bitcoind and its
/// descendants expose it.
pub struct HttpRpc {
    client: reqwest::Client,
    url: String,
    user: String,
    password: String,
    next_id: AtomicU64,
}

impl HttpRpc {
    pub fn new(client: reqwest::Client, host: &str, port: u16, user: &str, password: &str) -> Self {
        HttpRpc {
            client,
            url: format!("http://{host}:{port}/"),
            user: user.to_owned(),
            password: password.to_owned(),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl NodeRpc for HttpRpc {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "method": method, "params": params, "id": id });
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|error| RpcError::Offline(error.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(RpcError::Unauthorized);
        }

        // Daemons put RPC errors in a 500 body; parse before judging
        // the status.
        let body: Value = response
            .json()
            .await
            .map_err(|error| RpcError::Malformed(error.to_string()))?;
        if let Some(error) = body.get("error").filter(|error| !error.is_null()) {
            return Err(RpcError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-1),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_owned(),
            });
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}

pub struct NodeInstance {
    pub label: String,
    pub rpc: Box<dyn NodeRpc>,
}

/// The configured daemon backends. Queries go to the primary; block
/// submissions go to everyone.
pub struct NodeCluster {
    instances: Vec<NodeInstance>,
}

impl NodeCluster {
    /// `instances` must be non-empty; config validation guarantees it.
    pub fn new(instances: Vec<NodeInstance>) -> Self {
        NodeCluster { instances }
    }

    pub fn primary(&self) -> &NodeInstance {
        &self.instances[0]
    }

    pub async fn call_primary(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.primary().rpc.call(method, params).await
    }

    /// Issues the same call to every backend concurrently.
    pub async fn call_all(
        &self,
        method: &str,
        params: Value,
    ) -> Vec<(&NodeInstance, Result<Value, RpcError>)> {
        let calls = self
            .instances
            .iter()
            .map(|instance| instance.rpc.call(method, params.clone()));
        self.instances.iter().zip(join_all(calls).await).collect()
    }
}

/// Why a template update happened, for operators reading the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateOrigin {
    Poll,
    BlockNotify,
    PostSubmit,
    Rebroadcast,
}

impl TemplateOrigin {
    pub fn source(&self) -> &'static str {
        match self {
            TemplateOrigin::Poll => "RPC polling",
            TemplateOrigin::BlockNotify => "p2p",
            TemplateOrigin::PostSubmit => "RPC after block submission",
            TemplateOrigin::Rebroadcast => "rebroadcast request",
        }
    }
}

/// A fetched template on its way to the hub.
#[derive(Debug)]
pub struct TemplateUpdate {
    pub template: BlockTemplate,
    pub origin: TemplateOrigin,
}

/// Hub-to-node requests.
#[derive(Debug)]
pub enum NodeCommand {
    /// Fetch a template now, tagged with why.
    Refresh(TemplateOrigin),
    /// Push a solved block out, confirm it, then refresh.
    SubmitBlock {
        solution: BlockSolution,
        hash: BlockHash,
        height: u32,
    },
}

/// Long-running daemon-facing task.
pub struct NodeTask {
    cluster: NodeCluster,
    use_candidate_api: bool,
    has_submit_method: bool,
    poll_interval: Duration,
    templates: mpsc::Sender<TemplateUpdate>,
    commands: mpsc::Receiver<NodeCommand>,
    shutdown: CancellationToken,
}

impl NodeTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster: NodeCluster,
        use_candidate_api: bool,
        has_submit_method: bool,
        poll_interval: Duration,
        templates: mpsc::Sender<TemplateUpdate>,
        commands: mpsc::Receiver<NodeCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        NodeTask {
            cluster,
            use_candidate_api,
            has_submit_method,
            poll_interval,
            templates,
            commands,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = poll.tick() => self.refresh(TemplateOrigin::Poll).await,
                command = self.commands.recv() => match command {
                    Some(NodeCommand::Refresh(origin)) => self.refresh(origin).await,
                    Some(NodeCommand::SubmitBlock { solution, hash, height }) => {
                        self.submit_block(solution, hash, height).await;
                    }
                    None => break,
                },
            }
        }
        debug!("Node task stopped.");
    }

    async fn refresh(&self, origin: TemplateOrigin) {
        match fetch_template(&self.cluster, self.use_candidate_api).await {
            Ok(template) => {
                let update = TemplateUpdate { template, origin };
                if self.templates.send(update).await.is_err() {
                    warn!("Hub is gone; dropping template.");
                }
            }
            Err(error) if error.is_syncing() => {
                debug!("Daemon still syncing; no template.");
            }
            Err(error) => {
                error!(%error, source = origin.source(), "Template fetch failed.");
            }
        }
    }

    async fn submit_block(&self, solution: BlockSolution, hash: BlockHash, height: u32) {
        let (method, params) = submission_call(solution, self.has_submit_method);
        for (instance, result) in self.cluster.call_all(method, params).await {
            match result {
                Err(error) => {
                    error!(
                        %error,
                        instance = %instance.label,
                        method,
                        "Block submission failed."
                    );
                    return;
                }
                Ok(response) if response == json!("rejected") => {
                    error!(
                        instance = %instance.label,
                        method,
                        "Daemon rejected the block."
                    );
                    return;
                }
                Ok(_) => {}
            }
        }
        info!(%hash, height, method, "Submitted block to daemon instance(s).");

        self.confirm_block(hash).await;
        self.refresh(TemplateOrigin::PostSubmit).await;
    }

    /// A submitted block only counts once `getblock` can see it.
    async fn confirm_block(&self, hash: BlockHash) {
        let wanted = hash.to_string();
        let results = self.cluster.call_all("getblock", json!([wanted])).await;
        let confirmed = results.iter().find_map(|(_, result)| {
            result
                .as_ref()
                .ok()
                .filter(|block| block.get("hash").and_then(Value::as_str) == Some(&*wanted))
        });
        match confirmed {
            Some(block) => {
                let coinbase_txid = block
                    .get("tx")
                    .and_then(|txs| txs.get(0))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                info!(%hash, coinbase_txid, "Block accepted by the chain.");
            }
            None => warn!(%hash, "Submitted block not found on the chain; possibly orphaned."),
        }
    }
}

/// Method and params for pushing a solution, shaped per daemon
/// capability.
fn submission_call(solution: BlockSolution, has_submit_method: bool) -> (&'static str, Value) {
    match solution {
        BlockSolution::Block(hex) if has_submit_method => ("submitblock", json!([hex])),
        BlockSolution::Block(hex) => (
            "getblocktemplate",
            json!([{ "mode": "submit", "data": hex }]),
        ),
        BlockSolution::Candidate {
            id,
            nonce,
            coinbase,
            time,
            version,
        } => (
            "submitminingsolution",
            json!([{
                "id": id,
                "nonce": nonce,
                "coinbase": coinbase,
                "time": time,
                "version": version,
            }]),
        ),
    }
}

/// Fetches and normalizes one work template from the primary daemon.
pub async fn fetch_template(
    cluster: &NodeCluster,
    use_candidate_api: bool,
) -> Result<BlockTemplate, RpcError> {
    if use_candidate_api {
        let result = cluster
            .call_primary("getminingcandidate", json!([false]))
            .await?;
        let raw: MiningCandidate = serde_json::from_value(result)
            .map_err(|error| RpcError::Malformed(error.to_string()))?;
        BlockTemplate::try_from(raw).map_err(|error| RpcError::Malformed(error.to_string()))
    } else {
        let params = json!([{
            "capabilities": ["coinbasetxn", "workid", "coinbase/append"],
            "rules": ["segwit"],
        }]);
        let result = cluster.call_primary("getblocktemplate", params).await?;
        let raw: GetBlockTemplate = serde_json::from_value(result)
            .map_err(|error| RpcError::Malformed(error.to_string()))?;
        BlockTemplate::try_from(raw).map_err(|error| RpcError::Malformed(error.to_string()))
    }
}

/// Blocks until every backend answers `getpeerinfo`.
pub async fn wait_online(
    cluster: &NodeCluster,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let offline: Vec<String> = cluster
            .call_all("getpeerinfo", json!([]))
            .await
            .into_iter()
            .filter(|(_, result)| result.is_err())
            .map(|(instance, _)| instance.label.clone())
            .collect();
        if offline.is_empty() {
            return Ok(());
        }
        warn!(daemons = ?offline, "Waiting for daemon(s) to come online.");
        tokio::select! {
            _ = shutdown.cancelled() => bail!("shut down while waiting for daemons"),
            _ = tokio::time::sleep(STARTUP_RETRY) => {}
        }
    }
}

/// What the startup handshake learned about the primary daemon.
#[derive(Debug, Clone)]
pub struct StartupInfo {
    pub network: Network,
    pub protocol_version: u32,
    /// Whether blocks go out via `submitblock` or the
    /// `getblocktemplate` submit mode.
    pub has_submit_method: bool,
}

/// Chain identity, protocol version, pool address validity, and the
/// block submission method, all from the primary daemon.
pub async fn startup_checks(
    cluster: &NodeCluster,
    pool_address: &str,
) -> anyhow::Result<StartupInfo> {
    let chain_info = cluster
        .call_primary("getblockchaininfo", json!([]))
        .await
        .context("getblockchaininfo")?;
    let chain = chain_info
        .get("chain")
        .and_then(Value::as_str)
        .context("getblockchaininfo returned no chain")?;
    let network = Network::from_core_arg(chain)
        .with_context(|| format!("unrecognized chain {chain:?}"))?;

    let network_info = cluster
        .call_primary("getnetworkinfo", json!([]))
        .await
        .context("getnetworkinfo")?;
    let protocol_version = network_info
        .get("protocolversion")
        .and_then(Value::as_u64)
        .context("getnetworkinfo returned no protocolversion")? as u32;

    let validation = cluster
        .call_primary("validateaddress", json!([pool_address]))
        .await
        .context("validateaddress")?;
    if validation.get("isvalid").and_then(Value::as_bool) != Some(true) {
        bail!("daemon rejected pool address {pool_address:?}");
    }

    let has_submit_method = match cluster.call_primary("submitblock", json!([])).await {
        Err(RpcError::Rpc { message, .. }) if message.contains("Method not found") => false,
        Err(RpcError::Rpc { code: -1, .. }) => true,
        Err(error) => return Err(error).context("probing submitblock support"),
        Ok(_) => bail!("submitblock probe unexpectedly succeeded"),
    };

    Ok(StartupInfo {
        network,
        protocol_version,
        has_submit_method,
    })
}

/// Polls until the chain is synced enough to hand out templates, then
/// returns the first one.
pub async fn wait_synced(
    cluster: &NodeCluster,
    use_candidate_api: bool,
    shutdown: &CancellationToken,
) -> anyhow::Result<BlockTemplate> {
    loop {
        match fetch_template(cluster, use_candidate_api).await {
            Ok(template) => return Ok(template),
            Err(error) if error.is_syncing() => {
                log_sync_progress(cluster).await;
            }
            Err(error) => return Err(error).context("fetching the first template"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => bail!("shut down while waiting for chain sync"),
            _ = tokio::time::sleep(STARTUP_RETRY) => {}
        }
    }
}

async fn log_sync_progress(cluster: &NodeCluster) {
    let progress = cluster
        .call_primary("getblockchaininfo", json!([]))
        .await
        .ok()
        .and_then(|info| info.get("verificationprogress").and_then(Value::as_f64));
    match progress {
        Some(progress) => info!(
            "Waiting for chain sync, {:.2}% verified.",
            progress * 100.0
        ),
        None => info!("Waiting for chain sync."),
    }
}
