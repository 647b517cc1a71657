//! Node p2p link.
//!
//! A minimal wire-protocol peer that exists for exactly one reason:
//! hearing about new blocks the instant the node relays them, instead
//! of waiting out the RPC poll interval. It completes the
//! version/verack handshake, then watches `inv` messages for block
//! announcements. Everything else on the wire is ignored.

use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::p2p::Magic;
use bitcoin::{BlockHash, Network};
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::job::coinbase::{serialize_string, POOL_SIGNATURE};
use crate::tracing::prelude::*;

const HEADER_LEN: usize = 24;

/// Upper bound on a claimed payload length. Anything larger means we
/// are desynced inside someone else's payload, not reading a real
/// header.
const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// Inventory type for a block announcement.
const MSG_BLOCK: u32 = 2;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Services field: NODE_NETWORK.
const NODE_NETWORK_SERVICES: [u8; 8] = [0x01, 0, 0, 0, 0, 0, 0, 0];

/// Placeholder net_addr: services 1, ::ffff:0.0.0.0, port 0.
const EMPTY_NET_ADDRESS: [u8; 26] = [
    0x01, 0, 0, 0, 0, 0, 0, 0, // services
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0, 0, 0, 0, // ip
    0, 0, // port
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// The node announced a block we have not mined ourselves.
    BlockFound(BlockHash),
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub host: String,
    pub port: u16,
    pub magic: Magic,
    pub protocol_version: u32,
    /// Ask the node not to relay loose transactions to us.
    pub disable_transactions: bool,
}

/// Network magic for the p2p link: an explicit hex override from the
/// config, or the well-known value for the daemon's chain.
pub fn magic_for(network: Network, configured: Option<&str>) -> anyhow::Result<Magic> {
    if let Some(hex) = configured {
        let bytes: [u8; 4] = hex::decode(hex)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .with_context(|| format!("invalid p2p magic {hex:?}"))?;
        return Ok(Magic::from_bytes(bytes));
    }
    Ok(match network {
        Network::Bitcoin => Magic::BITCOIN,
        Network::Testnet => Magic::TESTNET,
        Network::Signet => Magic::SIGNET,
        Network::Regtest => Magic::REGTEST,
        _ => Magic::BITCOIN,
    })
}

/// Maintains the p2p connection until shutdown.
///
/// A refused connect or a close before the handshake completes points
/// at bad configuration, so those stop the task instead of retrying.
pub async fn run(config: PeerConfig, events: mpsc::Sender<PeerEvent>, shutdown: CancellationToken) {
    info!(host = %config.host, port = config.port, "Connecting to node p2p port.");
    loop {
        let connect = TcpStream::connect((config.host.as_str(), config.port));
        let stream = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = connect => result,
        };
        match stream {
            Ok(stream) => match session(stream, &config, &events, &shutdown).await {
                SessionOutcome::Shutdown => return,
                SessionOutcome::Disconnected { connected: false } => {
                    error!("p2p connection closed before handshake, likely incorrect p2p magic value.");
                    return;
                }
                SessionOutcome::Disconnected { connected: true } => {
                    warn!("p2p connection closed, reconnecting.");
                }
            },
            Err(error) if error.kind() == io::ErrorKind::ConnectionRefused => {
                error!("p2p connection refused, likely incorrect host or port.");
                return;
            }
            Err(error) => warn!(%error, "p2p connect failed, retrying."),
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SessionOutcome {
    Shutdown,
    Disconnected { connected: bool },
}

async fn session<S>(
    stream: S,
    config: &PeerConfig,
    events: &mpsc::Sender<PeerEvent>,
    shutdown: &CancellationToken,
) -> SessionOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let magic = config.magic.to_bytes();
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut connected = false;

    let version = build_frame(&magic, "version", &version_payload(config));
    if let Err(error) = writer.write_all(&version).await {
        warn!(%error, "Failed to send p2p version message.");
        return SessionOutcome::Disconnected { connected };
    }

    let mut buffer = BytesMut::with_capacity(8 * 1024);
    loop {
        while let Some(frame) = extract_frame(&mut buffer, &magic) {
            match frame.command.as_str() {
                "version" => {
                    let verack = build_frame(&magic, "verack", &[]);
                    if let Err(error) = writer.write_all(&verack).await {
                        warn!(%error, "Failed to send verack.");
                        return SessionOutcome::Disconnected { connected };
                    }
                }
                "verack" => {
                    if !connected {
                        connected = true;
                        info!("Connected to node p2p port.");
                    }
                }
                "inv" => {
                    for hash in parse_block_invs(&frame.payload) {
                        debug!(%hash, "Block announced over p2p.");
                        if events.send(PeerEvent::BlockFound(hash)).await.is_err() {
                            return SessionOutcome::Shutdown;
                        }
                    }
                }
                _ => {}
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return SessionOutcome::Shutdown,
            read = reader.read_buf(&mut buffer) => match read {
                Ok(0) => return SessionOutcome::Disconnected { connected },
                Ok(_) => {}
                Err(error) => {
                    warn!(%error, "p2p read failed.");
                    return SessionOutcome::Disconnected { connected };
                }
            },
        }
    }
}

struct Frame {
    command: String,
    payload: Bytes,
}

fn build_frame(magic: &[u8; 4], command: &str, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(magic);
    let mut name = [0u8; 12];
    name[..command.len()].copy_from_slice(command.as_bytes());
    frame.extend_from_slice(&name);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let digest = sha256d::Hash::hash(payload);
    frame.extend_from_slice(&digest.as_byte_array()[..4]);
    frame.extend_from_slice(payload);
    frame
}

fn version_payload(config: &PeerConfig) -> Vec<u8> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut payload = Vec::with_capacity(128);
    payload.extend_from_slice(&config.protocol_version.to_le_bytes());
    payload.extend_from_slice(&NODE_NETWORK_SERVICES);
    payload.extend_from_slice(&(now.as_secs() as i64).to_le_bytes());
    payload.extend_from_slice(&EMPTY_NET_ADDRESS);
    payload.extend_from_slice(&EMPTY_NET_ADDRESS);
    payload.extend_from_slice(&nonce(&now));
    payload.extend_from_slice(&serialize_string(POOL_SIGNATURE));
    payload.extend_from_slice(&0u32.to_le_bytes()); // start_height
    if config.disable_transactions {
        payload.push(0);
    }
    payload
}

fn nonce(now: &Duration) -> [u8; 8] {
    let digest = sha256d::Hash::hash(now.as_nanos().to_string().as_bytes());
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&digest.as_byte_array()[..8]);
    nonce
}

/// Pulls the next complete, checksummed frame out of `buffer`.
///
/// Bytes are only consumed for verified frames; on a bad magic, a
/// bogus length, or a failed checksum the scan resumes one byte
/// forward, so a desynced stream recovers at the next real header.
fn extract_frame(buffer: &mut BytesMut, magic: &[u8; 4]) -> Option<Frame> {
    loop {
        while buffer.len() >= 4 && buffer[..4] != magic[..] {
            buffer.advance(1);
        }
        if buffer.len() < HEADER_LEN {
            return None;
        }
        let length =
            u32::from_le_bytes([buffer[16], buffer[17], buffer[18], buffer[19]]) as usize;
        if length > MAX_FRAME_LEN {
            buffer.advance(1);
            continue;
        }
        if buffer.len() < HEADER_LEN + length {
            return None;
        }
        let digest = sha256d::Hash::hash(&buffer[HEADER_LEN..HEADER_LEN + length]);
        if digest.as_byte_array()[..4] != buffer[20..24] {
            buffer.advance(1);
            continue;
        }
        let header = buffer.split_to(HEADER_LEN);
        let payload = buffer.split_to(length).freeze();
        let name_end = header[4..16]
            .iter()
            .position(|&byte| byte == 0)
            .map_or(16, |i| 4 + i);
        let command = String::from_utf8_lossy(&header[4..name_end]).into_owned();
        return Some(Frame { command, payload });
    }
}

/// Block hashes announced in an `inv` payload, in wire (internal)
/// byte order.
fn parse_block_invs(payload: &[u8]) -> Vec<BlockHash> {
    let Some((count, mut cursor)) = read_compact_size(payload) else {
        return Vec::new();
    };
    let mut blocks = Vec::new();
    for _ in 0..count {
        let Some(entry) = payload.get(cursor..cursor + 36) else {
            break;
        };
        let kind = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
        if kind == MSG_BLOCK {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&entry[4..36]);
            blocks.push(BlockHash::from_byte_array(hash));
        }
        cursor += 36;
    }
    blocks
}

fn read_compact_size(bytes: &[u8]) -> Option<(u64, usize)> {
    match *bytes.first()? {
        0xff => {
            let value = u64::from_le_bytes(bytes.get(1..9)?.try_into().ok()?);
            Some((value, 9))
        }
        0xfe => {
            let value = u32::from_le_bytes(bytes.get(1..5)?.try_into().ok()?);
            Some((value as u64, 5))
        }
        0xfd => {
            let value = u16::from_le_bytes(bytes.get(1..3)?.try_into().ok()?);
            Some((value as u64, 3))
        }
        n => Some((n as u64, 1)),
    }
}
