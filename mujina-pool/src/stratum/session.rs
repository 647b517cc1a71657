//! Hub-side session state.
//!
//! A [`Session`] is the hub's view of one miner connection: identity,
//! subscription, difficulty, share counters. The socket itself lives
//! in a connection task; the session holds the command channel to it.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::stratum::connection::SessionCommand;
use crate::stratum::messages::JsonRpcMessage;
use crate::vardiff::Vardiff;

/// Issues subscription ids: a recognizable prefix plus a counter in
/// little-endian hex.
#[derive(Debug, Default)]
pub struct SubscriptionCounter {
    count: u64,
}

impl SubscriptionCounter {
    pub fn next(&mut self) -> String {
        self.count = self.count.wrapping_add(1);
        format!("deadbeefcafebabe{}", hex::encode(self.count.to_le_bytes()))
    }
}

/// Verdict from an [`Authorizer`].
#[derive(Debug, Clone)]
pub struct AuthVerdict {
    pub authorized: bool,
    /// Error detail echoed in the `mining.authorize` reply.
    pub error: Option<Value>,
    /// Drop the connection after replying.
    pub disconnect: bool,
}

/// Decides whether a worker may mine here. The pool core does not
/// care how: an implementation may check a database, an upstream, or
/// nothing at all.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        port: u16,
        worker: &str,
        password: &str,
        remote: IpAddr,
    ) -> AuthVerdict;
}

/// Lets everyone in. Solo and private pools run with this.
#[derive(Debug, Default)]
pub struct OpenAuthorizer;

#[async_trait]
impl Authorizer for OpenAuthorizer {
    async fn authorize(&self, _: u16, _: &str, _: &str, _: IpAddr) -> AuthVerdict {
        AuthVerdict {
            authorized: true,
            error: None,
            disconnect: false,
        }
    }
}

#[derive(Debug)]
pub struct Session {
    pub remote: SocketAddr,
    pub local_port: u16,
    commands: mpsc::Sender<SessionCommand>,
    pub subscription_id: Option<String>,
    pub extranonce1: Option<String>,
    pub authorized: bool,
    pub worker: Option<String>,
    pub difficulty: f64,
    pub previous_difficulty: Option<f64>,
    pending_difficulty: Option<f64>,
    pub version_mask: Option<u32>,
    pub valid_shares: u64,
    pub invalid_shares: u64,
    pub last_activity: Instant,
    pub vardiff: Option<Vardiff>,
}

impl Session {
    pub fn new(
        remote: SocketAddr,
        local_port: u16,
        commands: mpsc::Sender<SessionCommand>,
        vardiff: Option<Vardiff>,
    ) -> Self {
        Session {
            remote,
            local_port,
            commands,
            subscription_id: None,
            extranonce1: None,
            authorized: false,
            worker: None,
            difficulty: 0.0,
            previous_difficulty: None,
            pending_difficulty: None,
            version_mask: None,
            valid_shares: 0,
            invalid_shares: 0,
            last_activity: Instant::now(),
            vardiff,
        }
    }

    /// Worker plus address, for log lines.
    pub fn label(&self) -> String {
        format!(
            "{} [{}]",
            self.worker.as_deref().unwrap_or("(unauthorized)"),
            self.remote.ip()
        )
    }

    /// A session counts as subscribed once it holds an extranonce1.
    pub fn subscribed(&self) -> bool {
        self.extranonce1.is_some()
    }

    pub fn note_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_longer_than(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    /// Queues a message on the connection without waiting. A full
    /// queue means the peer has stopped reading; the caller should
    /// drop the session rather than buffer unboundedly.
    pub fn send(&self, message: JsonRpcMessage) -> Result<(), TrySendError<SessionCommand>> {
        self.commands.try_send(SessionCommand::Send(message))
    }

    /// Asks the connection task to hang up. Best effort: removing the
    /// session (and with it the command channel) tears the task down
    /// regardless.
    pub fn close(&self) {
        let _ = self.commands.try_send(SessionCommand::Close);
    }

    /// Sends `mining.set_difficulty` if `difficulty` is new, keeping
    /// the old value around for the retarget grace window.
    pub fn send_difficulty(&mut self, difficulty: f64) -> bool {
        if difficulty == self.difficulty {
            return false;
        }
        if self.difficulty > 0.0 {
            self.previous_difficulty = Some(self.difficulty);
        }
        self.difficulty = difficulty;
        let _ = self.send(JsonRpcMessage::notification(
            "mining.set_difficulty",
            json!([difficulty]),
        ));
        true
    }

    /// Stages a vardiff retarget to take effect with the next job
    /// broadcast, never between a miner's in-flight shares.
    pub fn enqueue_difficulty(&mut self, difficulty: f64) {
        self.pending_difficulty = Some(difficulty);
    }

    /// Applies a staged retarget, if any. Returns whether the session
    /// difficulty actually changed.
    pub fn apply_pending_difficulty(&mut self) -> bool {
        match self.pending_difficulty.take() {
            Some(difficulty) => self.send_difficulty(difficulty),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (Session, mpsc::Receiver<SessionCommand>) {
        let (tx, rx) = mpsc::channel(16);
        let session = Session::new("10.0.0.1:4000".parse().unwrap(), 3333, tx, None);
        (session, rx)
    }

    fn sent_line(command: Option<SessionCommand>) -> String {
        match command {
            Some(SessionCommand::Send(message)) => serde_json::to_string(&message).unwrap(),
            other => panic!("expected a send command, got {other:?}"),
        }
    }

    #[test]
    fn subscription_ids_are_prefixed_and_counted() {
        let mut counter = SubscriptionCounter::default();
        assert_eq!(counter.next(), "deadbeefcafebabe0100000000000000");
        assert_eq!(counter.next(), "deadbeefcafebabe0200000000000000");
    }

    #[test]
    fn label_shows_worker_once_known() {
        let (mut session, _rx) = session();
        assert_eq!(session.label(), "(unauthorized) [10.0.0.1]");
        session.worker = Some("bob.rig1".into());
        assert_eq!(session.label(), "bob.rig1 [10.0.0.1]");
    }

    #[tokio::test]
    async fn first_difficulty_send_has_no_previous() {
        let (mut session, mut rx) = session();
        assert!(session.send_difficulty(8.0));
        assert_eq!(session.difficulty, 8.0);
        assert_eq!(session.previous_difficulty, None);
        assert_eq!(
            sent_line(rx.recv().await),
            "{\"id\":null,\"method\":\"mining.set_difficulty\",\"params\":[8.0]}"
        );
    }

    #[tokio::test]
    async fn retarget_retains_the_previous_difficulty() {
        let (mut session, mut rx) = session();
        session.send_difficulty(8.0);
        assert!(session.send_difficulty(16.0));
        assert_eq!(session.previous_difficulty, Some(8.0));
        rx.recv().await;
        assert!(sent_line(rx.recv().await).contains("[16.0]"));
    }

    #[test]
    fn unchanged_difficulty_is_not_resent() {
        let (mut session, _rx) = session();
        session.send_difficulty(8.0);
        assert!(!session.send_difficulty(8.0));
        assert_eq!(session.previous_difficulty, None);
    }

    #[test]
    fn pending_difficulty_applies_once() {
        let (mut session, _rx) = session();
        session.send_difficulty(8.0);
        session.enqueue_difficulty(32.0);
        assert!(session.apply_pending_difficulty());
        assert_eq!(session.difficulty, 32.0);
        assert!(!session.apply_pending_difficulty());
    }
}
