//! Socket handling for one miner connection.
//!
//! A connection task owns the socket. Inbound lines become
//! [`SessionEvent`]s on a channel the hub multiplexes; the hub steers
//! the socket with [`SessionCommand`]s. Everything protocol-level
//! (subscriptions, shares, bans) lives hub-side; this module only
//! frames lines, enforces the flood cap, and resolves the PROXY
//! preamble.

use std::net::{IpAddr, SocketAddr};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::stratum::messages::JsonRpcMessage;
use crate::tracing::prelude::*;

/// Longest accepted line. A miner that buffers more than this without
/// a newline is flooding.
pub const MAX_LINE_LENGTH: usize = 10240;

/// What a connection tells the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The connection is usable and its remote address is settled
    /// (rewritten by a PROXY preamble when that is enabled).
    Ready { remote: SocketAddr },
    /// One well-formed JSON line.
    Message(Value),
    /// The first line should have been a PROXY preamble but was not.
    ProxyError { line: String },
    /// A line that was not JSON; the connection is being dropped.
    Malformed { line: String },
    /// Flood cap hit; the connection is being dropped.
    Flooded,
    /// Socket error other than an ordinary reset.
    Error(String),
    /// Terminal. Always the last event.
    Closed,
}

/// What the hub tells a connection.
#[derive(Debug)]
pub enum SessionCommand {
    /// Serialize and write one message.
    Send(JsonRpcMessage),
    /// Drop the connection.
    Close,
}

/// Drives one connection until either side gives up. Emits
/// [`SessionEvent::Closed`] exactly once, on the way out.
pub async fn run<S>(
    socket: S,
    remote: SocketAddr,
    proxy_protocol: bool,
    events: mpsc::Sender<SessionEvent>,
    mut commands: mpsc::Receiver<SessionCommand>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut remote = remote;
    // A held-back first line to re-process as a normal message.
    let mut replay = None;

    if proxy_protocol {
        match framed.next().await {
            Some(Ok(line)) => {
                if line.starts_with("PROXY") {
                    match parse_proxy_line(&line) {
                        Some(source) => remote = SocketAddr::new(source, remote.port()),
                        None => warn!(%remote, line, "Unparseable PROXY preamble."),
                    }
                } else {
                    if events
                        .send(SessionEvent::ProxyError { line: line.clone() })
                        .await
                        .is_err()
                    {
                        return;
                    }
                    replay = Some(line);
                }
            }
            _ => {
                let _ = events.send(SessionEvent::Closed).await;
                return;
            }
        }
    }

    if events.send(SessionEvent::Ready { remote }).await.is_err() {
        return;
    }
    if let Some(line) = replay {
        if !process_line(&line, &events).await {
            let _ = events.send(SessionEvent::Closed).await;
            return;
        }
    }

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SessionCommand::Send(message)) => {
                    let line = match serde_json::to_string(&message) {
                        Ok(line) => line,
                        Err(error) => {
                            warn!(%remote, %error, "Dropping unserializable message.");
                            continue;
                        }
                    };
                    if framed.send(line).await.is_err() {
                        break;
                    }
                }
                Some(SessionCommand::Close) | None => break,
            },
            line = framed.next() => match line {
                Some(Ok(line)) => {
                    if !process_line(&line, &events).await {
                        break;
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    let _ = events.send(SessionEvent::Flooded).await;
                    break;
                }
                Some(Err(LinesCodecError::Io(error))) => {
                    if error.kind() != std::io::ErrorKind::ConnectionReset {
                        let _ = events
                            .send(SessionEvent::Error(error.to_string()))
                            .await;
                    }
                    break;
                }
                None => break,
            },
        }
    }

    let _ = events.send(SessionEvent::Closed).await;
}

/// Parses one line into a message event. Returns false when the
/// connection should be dropped.
async fn process_line(line: &str, events: &mpsc::Sender<SessionEvent>) -> bool {
    if line.trim().is_empty() {
        return true;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(value) => events.send(SessionEvent::Message(value)).await.is_ok(),
        Err(_) => {
            let _ = events
                .send(SessionEvent::Malformed { line: line.into() })
                .await;
            false
        }
    }
}

/// Source address out of a `PROXY TCP4 <src> <dst> <sport> <dport>`
/// preamble.
fn parse_proxy_line(line: &str) -> Option<IpAddr> {
    line.split(' ').nth(2)?.parse().ok()
}
