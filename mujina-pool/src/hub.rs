//! The hub owns every miner session and the job registry, and runs the
//! stratum protocol between them.
//!
//! One task does all the dispatch: registrations arrive from the
//! listener, events from each connection, templates from the node task,
//! and block announcements from the p2p peer. Solved blocks and refresh
//! requests flow back out as [`NodeCommand`]s. Keeping session state in
//! one place means share validation, difficulty retargets, and banning
//! never contend on locks.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use slotmap::SlotMap;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::job::{JobRegistry, ShareAccepted, ShareSubmission};
use crate::node::{NodeCommand, TemplateOrigin, TemplateUpdate};
use crate::peer::PeerEvent;
use crate::stratum::version_rolling;
use crate::stratum::{
    parse_request, AuthVerdict, Authorizer, AuthorizeParams, ConfigureParams, IncomingRequest,
    JsonRpcMessage, Session, SessionEvent, SessionRegistration, ShareError, SubmitParams,
    SubscriptionCounter,
};
use crate::tracing::prelude::*;
use crate::vardiff::Vardiff;

/// Unique identifier for a miner session, assigned by the hub.
pub type SessionId = slotmap::DefaultKey;

/// An authorization verdict on its way back to the session that asked,
/// tagged with the request id the reply must carry.
type VerdictReply = (SessionId, Value, AuthVerdict);

pub struct Hub {
    config: Config,
    registry: JobRegistry,
    authorizer: Arc<dyn Authorizer>,
    sessions: SlotMap<SessionId, Session>,
    events: StreamMap<SessionId, ReceiverStream<SessionEvent>>,
    subscriptions: SubscriptionCounter,
    /// Banned addresses and when the ban began.
    bans: HashMap<IpAddr, Instant>,
    registrations: mpsc::Receiver<SessionRegistration>,
    templates: mpsc::Receiver<TemplateUpdate>,
    peer_events: mpsc::Receiver<PeerEvent>,
    node_commands: mpsc::Sender<NodeCommand>,
    verdicts_tx: mpsc::Sender<VerdictReply>,
    verdicts_rx: mpsc::Receiver<VerdictReply>,
    connection_timeout: Duration,
    rebroadcast: Duration,
    ban_time: Duration,
    last_broadcast: time::Instant,
    shutdown: CancellationToken,
}

impl Hub {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        registry: JobRegistry,
        authorizer: Arc<dyn Authorizer>,
        registrations: mpsc::Receiver<SessionRegistration>,
        templates: mpsc::Receiver<TemplateUpdate>,
        peer_events: mpsc::Receiver<PeerEvent>,
        node_commands: mpsc::Sender<NodeCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        let (verdicts_tx, verdicts_rx) = mpsc::channel(64);
        let connection_timeout = Duration::from_secs(config.connection_timeout);
        let rebroadcast = Duration::from_secs(config.job_rebroadcast_timeout);
        let ban_time = Duration::from_secs(config.banning.time);
        Hub {
            config,
            registry,
            authorizer,
            sessions: SlotMap::new(),
            events: StreamMap::new(),
            subscriptions: SubscriptionCounter::default(),
            bans: HashMap::new(),
            registrations,
            templates,
            peer_events,
            node_commands,
            verdicts_tx,
            verdicts_rx,
            connection_timeout,
            rebroadcast,
            ban_time,
            last_broadcast: time::Instant::now(),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut purge = time::interval(Duration::from_secs(self.config.banning.purge_interval));
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                registration = self.registrations.recv() => {
                    match registration {
                        Some(registration) => { self.register(registration); }
                        None => break,
                    }
                }

                Some((id, event)) = self.events.next() => {
                    self.handle_session_event(id, event).await;
                }

                Some((id, msg_id, verdict)) = self.verdicts_rx.recv() => {
                    self.handle_verdict(id, msg_id, verdict);
                }

                update = self.templates.recv() => {
                    match update {
                        Some(update) => self.handle_template(update),
                        None => break,
                    }
                }

                Some(event) = self.peer_events.recv() => {
                    self.handle_peer_event(event).await;
                }

                _ = time::sleep_until(self.last_broadcast + self.rebroadcast),
                    if self.registry.current().is_some() =>
                {
                    self.last_broadcast = time::Instant::now();
                    debug!("Work has gone stale, requesting a fresh template.");
                    let refresh = NodeCommand::Refresh(TemplateOrigin::Rebroadcast);
                    if self.node_commands.send(refresh).await.is_err() {
                        warn!("Node task is gone, cannot refresh work.");
                    }
                }

                _ = purge.tick(), if self.config.banning.enabled => {
                    self.purge_bans();
                }
            }
        }
        debug!("Hub stopped.");
    }

    /// Adopts a fresh connection. The subscription id is fixed for the
    /// life of the session, whether or not the miner ever subscribes.
    fn register(&mut self, registration: SessionRegistration) -> SessionId {
        let SessionRegistration {
            remote,
            local_port,
            events,
            commands,
        } = registration;
        let vardiff = self
            .config
            .ports
            .get(&local_port)
            .and_then(|port| port.vardiff.clone())
            .map(Vardiff::new);
        let mut session = Session::new(remote, local_port, commands, vardiff);
        session.subscription_id = Some(self.subscriptions.next());
        let id = self.sessions.insert(session);
        self.events.insert(id, ReceiverStream::new(events));
        debug!(%remote, port = local_port, "Session registered.");
        id
    }

    async fn handle_session_event(&mut self, id: SessionId, event: SessionEvent) {
        match event {
            SessionEvent::Ready { remote } => {
                // The PROXY preamble may have rewritten the address the
                // listener saw, so bans are checked against this one.
                if let Some(session) = self.sessions.get_mut(id) {
                    session.remote = remote;
                }
                self.check_ban(id);
            }
            SessionEvent::Message(message) => self.dispatch(id, message).await,
            SessionEvent::ProxyError { line } => {
                error!(
                    line = %line,
                    "Expected a PROXY protocol preamble, got something else."
                );
            }
            SessionEvent::Malformed { line } => {
                if let Some(session) = self.sessions.get(id) {
                    warn!(
                        miner = %session.label(),
                        line = %line,
                        "Dropping a miner that sent malformed JSON."
                    );
                }
            }
            SessionEvent::Flooded => {
                if let Some(session) = self.sessions.get(id) {
                    warn!(miner = %session.label(), "Detected socket flooding.");
                }
            }
            SessionEvent::Error(error) => {
                if let Some(session) = self.sessions.get(id) {
                    warn!(miner = %session.label(), error = %error, "Socket error.");
                }
            }
            SessionEvent::Closed => {
                self.events.remove(&id);
                if let Some(session) = self.sessions.remove(id) {
                    debug!(miner = %session.label(), "Session closed.");
                }
            }
        }
    }

    /// Applied when a connection settles: a banned address is kicked
    /// while the ban lasts and forgiven after.
    fn check_ban(&mut self, id: SessionId) {
        if !self.config.banning.enabled {
            return;
        }
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        let ip = session.remote.ip();
        let Some(banned_at) = self.bans.get(&ip) else {
            return;
        };
        let elapsed = banned_at.elapsed();
        if elapsed < self.ban_time {
            let remaining = (self.ban_time - elapsed).as_secs();
            warn!(%ip, remaining_secs = remaining, "Rejected a connection from a banned address.");
            session.close();
        } else {
            self.bans.remove(&ip);
            info!(%ip, "Forgave a banned address.");
        }
    }

    async fn dispatch(&mut self, id: SessionId, message: Value) {
        let Some(request) = parse_request(&message) else {
            debug!("Ignoring a message with no method.");
            return;
        };
        match request.method.as_str() {
            "mining.subscribe" => self.on_subscribe(id, request),
            "mining.authorize" => self.on_authorize(id, request),
            "mining.configure" => self.on_configure(id, request),
            "mining.submit" => self.on_submit(id, request).await,
            "mining.get_transactions" => {
                // Transaction lists never leave the pool. The shape of
                // this reply is what legacy miners expect for the
                // refusal, error flag and all.
                if let Some(session) = self.sessions.get(id) {
                    let _ = session.send(JsonRpcMessage::response(
                        Value::Null,
                        json!([]),
                        json!(true),
                    ));
                }
            }
            "mining.extranonce.subscribe" => {
                if let Some(session) = self.sessions.get(id) {
                    let _ = session.send(JsonRpcMessage::response(
                        request.id,
                        json!(false),
                        json!([20, "Not supported.", Value::Null]),
                    ));
                }
            }
            other => debug!(method = other, "Unknown stratum method."),
        }
    }

    fn on_subscribe(&mut self, id: SessionId, request: IncomingRequest) {
        let extranonce1 = self.registry.next_extranonce1();
        let extranonce2_size = self.registry.extranonce2_size();
        let work = self.registry.current().map(|job| job.notify_params(true));

        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        let subscription = session.subscription_id.clone().unwrap_or_default();
        session.extranonce1 = Some(extranonce1.clone());
        let result = json!([
            [
                ["mining.set_difficulty", subscription],
                ["mining.notify", subscription],
            ],
            extranonce1,
            extranonce2_size,
        ]);
        let _ = session.send(JsonRpcMessage::ok(request.id, result));

        let difficulty = self
            .config
            .ports
            .get(&session.local_port)
            .map(|port| port.difficulty)
            .unwrap_or(8.0);
        session.send_difficulty(difficulty);
        if let Some(params) = work {
            let _ = session.send(JsonRpcMessage::notification("mining.notify", params));
        }
    }

    /// The worker name is remembered before the verdict comes back so
    /// log lines name the miner even when authorization is slow or
    /// never answered.
    fn on_authorize(&mut self, id: SessionId, request: IncomingRequest) {
        let params = AuthorizeParams::from_params(&request.params);
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        session.worker = Some(params.worker.clone());
        debug!(miner = %session.label(), "Authorization requested.");

        let authorizer = self.authorizer.clone();
        let verdicts = self.verdicts_tx.clone();
        let port = session.local_port;
        let remote = session.remote.ip();
        let msg_id = request.id;
        tokio::spawn(async move {
            let verdict = authorizer
                .authorize(port, &params.worker, &params.password, remote)
                .await;
            let _ = verdicts.send((id, msg_id, verdict)).await;
        });
    }

    fn handle_verdict(&mut self, id: SessionId, msg_id: Value, verdict: AuthVerdict) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        session.authorized = verdict.authorized && verdict.error.is_none();
        let error = verdict.error.unwrap_or(Value::Null);
        let _ = session.send(JsonRpcMessage::response(
            msg_id,
            json!(session.authorized),
            error,
        ));
        if session.authorized {
            info!(miner = %session.label(), "Worker authorized.");
        } else {
            warn!(miner = %session.label(), "Worker authorization failed.");
        }
        if verdict.disconnect {
            session.close();
        }
    }

    fn on_configure(&mut self, id: SessionId, request: IncomingRequest) {
        let params = ConfigureParams::from_params(&request.params);
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        if !params.extensions.iter().any(|e| e == "version-rolling") {
            let _ = session.send(JsonRpcMessage::ok(request.id, json!({})));
            return;
        }
        let (result, mask) =
            version_rolling::negotiate(params.options.get("version-rolling.mask"));
        if let Some(mask) = mask {
            session.version_mask = Some(mask);
        }
        let _ = session.send(JsonRpcMessage::ok(request.id, result));
        if let Some(mask) = mask {
            debug!(
                miner = %session.label(),
                mask = format!("{mask:08x}"),
                "Granted version rolling."
            );
            let _ = session.send(JsonRpcMessage::notification(
                "mining.set_version_mask",
                json!([format!("{mask:08x}")]),
            ));
        }
    }

    async fn on_submit(&mut self, id: SessionId, request: IncomingRequest) {
        let params = SubmitParams::from_params(&request.params);
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        session.note_activity();

        if !session.authorized {
            let error = ShareError::UnauthorizedWorker;
            let _ = session.send(JsonRpcMessage::fail(request.id, error.to_error_value()));
            self.consider_ban(id, false);
            return;
        }
        if !session.subscribed() {
            let error = ShareError::NotSubscribed;
            let _ = session.send(JsonRpcMessage::fail(request.id, error.to_error_value()));
            self.consider_ban(id, false);
            return;
        }

        let submission = ShareSubmission {
            job_id: params.job_id,
            extranonce1: session.extranonce1.clone().unwrap_or_default(),
            extranonce2: params.extranonce2,
            ntime: params.ntime,
            nonce: params.nonce,
            version_bits: params.version_bits,
            version_mask: session.version_mask,
            difficulty: session.difficulty,
            previous_difficulty: session.previous_difficulty,
        };
        match self.registry.validate(&submission) {
            Ok(accepted) => self.accept_share(id, request.id, accepted).await,
            Err(error) => self.reject_share(id, request.id, error),
        }
    }

    async fn accept_share(&mut self, id: SessionId, msg_id: Value, accepted: ShareAccepted) {
        let banned = self.consider_ban(id, true);
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        if !banned {
            let _ = session.send(JsonRpcMessage::ok(msg_id, json!(true)));
        }
        debug!(
            miner = %session.label(),
            difficulty = accepted.difficulty,
            share_difficulty = accepted.share_difficulty,
            "Accepted share."
        );

        let difficulty = session.difficulty;
        if let Some(retarget) = session
            .vardiff
            .as_mut()
            .and_then(|vardiff| vardiff.on_submit(Instant::now(), difficulty))
        {
            debug!(
                miner = %session.label(),
                from = difficulty,
                to = retarget,
                "Difficulty retargeted."
            );
            session.enqueue_difficulty(retarget);
        }

        if let Some(hash) = &accepted.invalid_hash {
            debug!(%hash, "Share hash does not solve the block.");
        }

        if let (Some(solution), Some(hash)) = (accepted.solution, accepted.block_hash) {
            info!(height = accepted.height, %hash, "Block solved!");
            let command = NodeCommand::SubmitBlock {
                solution,
                hash,
                height: accepted.height,
            };
            if self.node_commands.send(command).await.is_err() {
                error!("Node task is gone, solved block was not submitted.");
            }
        }
    }

    fn reject_share(&mut self, id: SessionId, msg_id: Value, error: ShareError) {
        let banned = self.consider_ban(id, false);
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        debug!(miner = %session.label(), code = error.code(), %error, "Rejected share.");
        if !banned {
            let _ = session.send(JsonRpcMessage::fail(msg_id, error.to_error_value()));
        }
    }

    /// Tracks one share verdict against the ban thresholds. Returns
    /// true when this share tipped the session into a ban, in which
    /// case the connection is already closing and no reply goes out.
    fn consider_ban(&mut self, id: SessionId, valid: bool) -> bool {
        let Some(session) = self.sessions.get_mut(id) else {
            return false;
        };
        if valid {
            session.valid_shares += 1;
        } else {
            session.invalid_shares += 1;
        }
        let banning = &self.config.banning;
        if !banning.enabled {
            return false;
        }
        let total = session.valid_shares + session.invalid_shares;
        if total < banning.check_threshold {
            return false;
        }
        let percent_bad = session.invalid_shares as f64 / total as f64 * 100.0;
        if percent_bad < banning.invalid_percent {
            session.valid_shares = 0;
            session.invalid_shares = 0;
            return false;
        }
        warn!(
            miner = %session.label(),
            invalid = session.invalid_shares,
            total,
            "Banning miner for excessive invalid shares."
        );
        self.bans.insert(session.remote.ip(), Instant::now());
        session.close();
        true
    }

    fn handle_template(&mut self, update: TemplateUpdate) {
        let TemplateUpdate { template, origin } = update;
        let height = template.height;

        if origin == TemplateOrigin::Rebroadcast {
            let same_work = self.registry.current().is_some_and(|job| {
                job.template.height == template.height
                    && job.template.prev_blockhash == template.prev_blockhash
            });
            if same_work {
                // Nothing new on chain; reissue the work under a fresh
                // job id without invalidating shares in flight.
                self.registry.force_refresh(template);
                debug!(height, "Rebroadcasting work.");
                self.broadcast_jobs(false);
                return;
            }
        }

        if self.registry.submit_template(template) {
            info!(height, "Block notification via {}.", origin.source());
            self.broadcast_jobs(true);
        } else {
            debug!(height, via = origin.source(), "Ignoring stale template.");
        }
    }

    fn broadcast_jobs(&mut self, clean: bool) {
        let Some(params) = self.registry.current().map(|job| job.notify_params(clean)) else {
            return;
        };
        let mut dead = Vec::new();
        let mut reached = 0usize;
        for (id, session) in self.sessions.iter_mut() {
            if !session.subscribed() {
                continue;
            }
            if session.idle_longer_than(self.connection_timeout) {
                warn!(miner = %session.label(), "Dropping an idle connection.");
                session.close();
                continue;
            }
            session.apply_pending_difficulty();
            let message = JsonRpcMessage::notification("mining.notify", params.clone());
            if session.send(message).is_err() {
                warn!(miner = %session.label(), "Send queue stuck, dropping the connection.");
                dead.push(id);
                continue;
            }
            reached += 1;
        }
        // A stuck queue means the writer is gone or hopelessly behind;
        // dropping the session closes its command channel and with it
        // the socket.
        for id in dead {
            self.sessions.remove(id);
            self.events.remove(&id);
        }
        debug!(miners = reached, clean, "Broadcast new work.");
        self.last_broadcast = time::Instant::now();
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::BlockFound(hash) => {
                let stale = self
                    .registry
                    .current()
                    .is_some_and(|job| job.template.prev_blockhash != hash);
                if stale {
                    debug!(%hash, "Node announced a new block, refreshing work.");
                    let refresh = NodeCommand::Refresh(TemplateOrigin::BlockNotify);
                    if self.node_commands.send(refresh).await.is_err() {
                        warn!("Node task is gone, cannot refresh work.");
                    }
                }
            }
        }
    }

    fn purge_bans(&mut self) {
        let before = self.bans.len();
        let ban_time = self.ban_time;
        self.bans.retain(|_, banned_at| banned_at.elapsed() < ban_time);
        let purged = before - self.bans.len();
        if purged > 0 {
            debug!(purged, remaining = self.bans.len(), "Purged expired bans.");
        }
    }
}
