//! TCP listeners for miner connections.
//!
//! One listener per configured port. Each accepted socket gets its own
//! connection task; the paired event/command channels are handed to
//! the hub as a [`SessionRegistration`].

use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::stratum::connection::{self, SessionCommand, SessionEvent};
use crate::tracing::prelude::*;

/// Channel depth per session, both directions.
const SESSION_CHANNEL_CAPACITY: usize = 64;

/// A freshly accepted connection, ready for the hub to adopt.
#[derive(Debug)]
pub struct SessionRegistration {
    /// Accept-time address. The PROXY preamble may rewrite it; the
    /// settled value arrives with [`SessionEvent::Ready`].
    pub remote: SocketAddr,
    pub local_port: u16,
    pub events: mpsc::Receiver<SessionEvent>,
    pub commands: mpsc::Sender<SessionCommand>,
}

pub struct StratumServer {
    listeners: Vec<(u16, TcpListener)>,
    proxy_protocol: bool,
    registrations: mpsc::Sender<SessionRegistration>,
}

impl StratumServer {
    /// Binds every port. Ports are reported back from the listener so
    /// an ephemeral port (0) resolves to its real value.
    pub async fn bind(
        host: IpAddr,
        ports: &[u16],
        proxy_protocol: bool,
        registrations: mpsc::Sender<SessionRegistration>,
    ) -> io::Result<Self> {
        let mut listeners = Vec::with_capacity(ports.len());
        for &port in ports {
            let listener = TcpListener::bind((host, port)).await?;
            let port = listener.local_addr()?.port();
            info!(%host, port, "Listening for miners.");
            listeners.push((port, listener));
        }
        Ok(StratumServer {
            listeners,
            proxy_protocol,
            registrations,
        })
    }

    pub fn ports(&self) -> Vec<u16> {
        self.listeners.iter().map(|(port, _)| *port).collect()
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        for (port, listener) in self.listeners {
            let registrations = self.registrations.clone();
            let shutdown = shutdown.clone();
            let proxy_protocol = self.proxy_protocol;
            tracker.spawn(accept_loop(
                listener,
                port,
                proxy_protocol,
                registrations,
                shutdown,
            ));
        }
        tracker.close();
        tracker.wait().await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    port: u16,
    proxy_protocol: bool,
    registrations: mpsc::Sender<SessionRegistration>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (socket, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(port, %error, "Accept failed.");
                        continue;
                    }
                };
                let (event_tx, event_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
                let (command_tx, command_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
                tokio::spawn(connection::run(
                    socket,
                    remote,
                    proxy_protocol,
                    event_tx,
                    command_rx,
                ));
                let registration = SessionRegistration {
                    remote,
                    local_port: port,
                    events: event_rx,
                    commands: command_tx,
                };
                if registrations.send(registration).await.is_err() {
                    // Hub gone; nothing to accept for.
                    break;
                }
            }
        }
    }
    debug!(port, "Listener stopped.");
}
