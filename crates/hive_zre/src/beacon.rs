//! LAN discovery via UDP beacons.
//!
//! Every node broadcasts a fixed 22-byte datagram announcing its identity
//! and mailbox port, and listens for the same datagram from others:
//!
//! ```text
//! 'Z' 'R' 'E' 0x01 | identity (16 bytes) | mailbox port (u16, big-endian)
//! ```
//!
//! A mailbox port of 0 announces that the sender is leaving.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::NetworkError;
use crate::identity::NodeId;

/// Beacon header: `ZRE` plus the beacon version.
pub const BEACON_HEADER: [u8; 4] = [0x5A, 0x52, 0x45, 0x01];

/// Exact size of a beacon datagram.
pub const BEACON_LEN: usize = 22;

/// A decoded beacon datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    pub id: NodeId,
    pub port: u16,
}

impl Beacon {
    pub fn new(id: NodeId, port: u16) -> Self {
        Self { id, port }
    }

    /// Whether the sender announced its departure.
    pub fn is_departure(&self) -> bool {
        self.port == 0
    }

    pub fn to_bytes(&self) -> [u8; BEACON_LEN] {
        let mut buf = [0u8; BEACON_LEN];
        buf[..4].copy_from_slice(&BEACON_HEADER);
        buf[4..20].copy_from_slice(self.id.as_bytes());
        buf[20..].copy_from_slice(&self.port.to_be_bytes());
        buf
    }

    /// Decode a datagram. Anything of the wrong size or with the wrong header
    /// is not a beacon.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() != BEACON_LEN || buf[..4] != BEACON_HEADER {
            return None;
        }
        let id = NodeId::from_slice(&buf[4..20])?;
        let port = u16::from_be_bytes([buf[20], buf[21]]);
        Some(Self { id, port })
    }
}

/// A beacon received from another node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub id: NodeId,
    /// Source address of the datagram.
    pub address: IpAddr,
    /// Advertised mailbox port; 0 means the peer is leaving.
    pub mailbox: u16,
}

/// Configuration for the beacon service.
#[derive(Debug, Clone)]
pub struct BeaconConfig {
    /// Our identity.
    pub id: NodeId,
    /// Our mailbox port, advertised in every beacon.
    pub mailbox: u16,
    /// Where beacons are sent: the subnet broadcast address and beacon port.
    pub target: SocketAddr,
    /// UDP port to listen on, normally the target's port. 0 lets the OS
    /// choose.
    pub listen_port: u16,
    /// How often to broadcast.
    pub interval: Duration,
}

/// A running beacon broadcaster and listener.
pub struct BeaconService {
    id: NodeId,
    sender: Arc<UdpSocket>,
    target: SocketAddr,
    listen_port: u16,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl BeaconService {
    /// Start broadcasting and listening in the background.
    ///
    /// Spawns two tasks:
    /// 1. A broadcaster that sends our beacon immediately and then at the
    ///    configured interval.
    /// 2. A listener that forwards beacons from other nodes through
    ///    `discovered_tx`, skipping copies of our own datagram.
    pub async fn start(
        config: BeaconConfig,
        discovered_tx: mpsc::Sender<DiscoveredPeer>,
    ) -> Result<Self, NetworkError> {
        let listener = bind_listener(config.listen_port)
            .map_err(|e| NetworkError::Discovery(format!("Bind failed: {e}")))?;
        let listen_port = listener.local_addr()?.port();
        info!("Beacon listening on 0.0.0.0:{listen_port}");

        let sender = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| NetworkError::Discovery(format!("Sender bind: {e}")))?;
        sender
            .set_broadcast(true)
            .map_err(|e| NetworkError::Discovery(format!("Set broadcast: {e}")))?;
        let sender = Arc::new(sender);

        let target = config.target;
        let (shutdown_tx, _) = broadcast::channel(1);
        let own = Beacon::new(config.id, config.mailbox).to_bytes();

        let broadcaster = tokio::spawn(broadcast_loop(
            Arc::clone(&sender),
            target,
            own,
            config.interval,
            shutdown_tx.subscribe(),
        ));
        let listener = tokio::spawn(listen_loop(
            listener,
            own,
            discovered_tx,
            shutdown_tx.subscribe(),
        ));

        Ok(Self {
            id: config.id,
            sender,
            target,
            listen_port,
            shutdown_tx,
            tasks: vec![broadcaster, listener],
        })
    }

    /// The UDP port the listener is bound to.
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Stop both tasks and announce our departure with a final port-0
    /// beacon.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            let _ = task.await;
        }

        let departure = Beacon::new(self.id, 0).to_bytes();
        match self.sender.send_to(&departure, self.target).await {
            Ok(_) => debug!("Sent departure beacon to {}", self.target),
            Err(e) => debug!("Departure beacon to {} failed: {e}", self.target),
        }
    }
}

/// Bind a broadcast-capable listener that other nodes on this host can share.
fn bind_listener(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    UdpSocket::from_std(socket.into())
}

async fn broadcast_loop(
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    beacon: [u8; BEACON_LEN],
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    // The first tick completes immediately.
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match socket.send_to(&beacon, target).await {
                    Ok(_) => trace!("Beacon sent to {target}"),
                    Err(e) => debug!("Beacon send to {target} failed: {e}"),
                }
            }
            _ = shutdown.recv() => {
                debug!("Beacon broadcaster shutting down");
                break;
            }
        }
    }
}

async fn listen_loop(
    socket: UdpSocket,
    own: [u8; BEACON_LEN],
    discovered_tx: mpsc::Sender<DiscoveredPeer>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = [0u8; 64];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Beacon recv error: {e}");
                        continue;
                    }
                };
                let datagram = &buf[..len];
                if datagram == own {
                    continue;
                }
                let Some(beacon) = Beacon::parse(datagram) else {
                    trace!("Ignoring {len}-byte datagram from {src}");
                    continue;
                };
                debug!("Beacon from {} at {src}, mailbox {}", beacon.id, beacon.port);
                let peer = DiscoveredPeer {
                    id: beacon.id,
                    address: src.ip(),
                    mailbox: beacon.port,
                };
                // Beacons repeat, so a full queue just drops this one.
                match discovered_tx.try_send(peer) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!("Discovery queue full, dropping beacon from {src}");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            _ = shutdown.recv() => {
                debug!("Beacon listener shutting down");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
