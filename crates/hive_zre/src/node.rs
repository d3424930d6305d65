//! ZreNode: the public entry point for applications.
//!
//! [`ZreNode`] wires the pieces together:
//! - inbound WebSocket listener on a free mailbox port
//! - UDP beacon broadcaster and listener
//! - a single reactor task that owns the [`NodeEngine`]
//!
//! Every public call is a message to the reactor, answered over a oneshot
//! channel, so the engine is only ever touched from one task.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::beacon::{BeaconConfig, BeaconService, DiscoveredPeer};
use crate::config::NodeConfig;
use crate::engine::{LocalNode, NodeEngine, ZreEvent};
use crate::error::NetworkError;
use crate::group::GroupInfo;
use crate::identity::NodeId;
use crate::iface::{bind_free_port, local_ipv4_interface};
use crate::peer::PeerInfo;
use crate::timer::{TimerFired, TimerQueue};
use crate::transport::{self, InboundMessage, WsTransport, endpoint_for};

/// Requests from the facade to the reactor.
enum NodeCommand {
    Join(String, oneshot::Sender<Result<bool, NetworkError>>),
    Leave(String, oneshot::Sender<Result<bool, NetworkError>>),
    Whisper(NodeId, Vec<u8>, oneshot::Sender<Result<(), NetworkError>>),
    Shout(String, Vec<u8>, oneshot::Sender<Result<usize, NetworkError>>),
    Peer(NodeId, oneshot::Sender<Option<PeerInfo>>),
    Peers(oneshot::Sender<Vec<PeerInfo>>),
    Group(String, oneshot::Sender<Option<GroupInfo>>),
    Groups(oneshot::Sender<Vec<GroupInfo>>),
    Stop(oneshot::Sender<()>),
}

/// Handles held while the node is running.
struct Running {
    commands: mpsc::Sender<NodeCommand>,
    reactor: JoinHandle<()>,
    endpoint: String,
    beacon_port: Option<u16>,
}

/// A ZRE node.
///
/// Create one with [`new()`](ZreNode::new), then call
/// [`start()`](ZreNode::start) to go live and receive [`ZreEvent`]s.
pub struct ZreNode {
    id: NodeId,
    name: String,
    config: NodeConfig,
    running: Option<Running>,
}

impl ZreNode {
    /// Create a node with a fresh identity.
    pub fn new(config: NodeConfig) -> Self {
        let id = NodeId::generate();
        let name = config.name.clone().unwrap_or_else(|| id.short_name());
        Self {
            id,
            name,
            config,
            running: None,
        }
    }

    /// Create a node with default config.
    pub fn with_defaults() -> Self {
        Self::new(NodeConfig::default())
    }

    pub fn identity(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Our mailbox endpoint, `tcp://address:port`, while running.
    pub fn endpoint(&self) -> Option<&str> {
        self.running.as_ref().map(|r| r.endpoint.as_str())
    }

    /// The UDP port the beacon listener is bound to, while running with
    /// beacons enabled.
    pub fn beacon_port(&self) -> Option<u16> {
        self.running.as_ref().and_then(|r| r.beacon_port)
    }

    /// Start the node: bind the mailbox, start beaconing and spawn the
    /// reactor. Returns the stream of application events.
    pub async fn start(&mut self) -> Result<mpsc::UnboundedReceiver<ZreEvent>, NetworkError> {
        if self.running.is_some() {
            return Err(NetworkError::AlreadyRunning);
        }
        self.config.validate()?;

        let (address, broadcast_addr) = self.resolve_addresses()?;
        let listener = bind_free_port(IpAddr::V4(address), self.config.port).await?;
        let mailbox = listener.local_addr()?.port();
        let endpoint = endpoint_for(SocketAddr::new(IpAddr::V4(address), mailbox));

        let (shutdown_tx, _) = broadcast::channel(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let server = tokio::spawn(transport::start_server(
            listener,
            inbound_tx,
            shutdown_tx.subscribe(),
        ));

        let (discovered_tx, discovered_rx) = mpsc::channel(64);
        let beacon = if self.config.beacon_enabled {
            let beacon_config = BeaconConfig {
                id: self.id,
                mailbox,
                target: SocketAddr::from((broadcast_addr, self.config.beacon_port)),
                listen_port: self.config.beacon_port,
                interval: self.config.beacon_interval,
            };
            match BeaconService::start(beacon_config, discovered_tx).await {
                Ok(beacon) => Some(beacon),
                Err(e) => {
                    let _ = shutdown_tx.send(());
                    let _ = server.await;
                    return Err(e);
                }
            }
        } else {
            None
        };
        let beacon_port = beacon.as_ref().map(BeaconService::listen_port);

        let mut local = LocalNode::new(self.id, self.name.clone(), endpoint.clone());
        local.headers = self.config.headers.clone();

        let (timers, timer_rx) = TimerQueue::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = NodeEngine::new(
            local,
            self.config.liveness(),
            timers,
            Box::new(WsTransport),
            events_tx,
        );

        let (commands, command_rx) = mpsc::channel(64);
        let reactor = Reactor {
            engine,
            inbound: inbound_rx,
            discovered: discovered_rx,
            timers: timer_rx,
            commands: command_rx,
            beacon,
            shutdown_tx,
            server,
        };
        let reactor = tokio::spawn(reactor.run());

        info!("ZreNode '{}' started (id: {}, endpoint: {endpoint})", self.name, self.id);
        self.running = Some(Running {
            commands,
            reactor,
            endpoint,
            beacon_port,
        });
        Ok(events_rx)
    }

    /// Stop the node: disconnect every peer, announce departure and release
    /// all sockets. No events are delivered once this is called.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        if running.commands.send(NodeCommand::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = running.reactor.await {
            warn!("Reactor task failed: {e}");
        }
        info!("ZreNode '{}' stopped", self.name);
    }

    /// Join `group`. Returns `false` if it was already joined.
    pub async fn join(&self, group: impl Into<String>) -> Result<bool, NetworkError> {
        let group = group.into();
        self.request(|tx| NodeCommand::Join(group, tx)).await?
    }

    /// Leave `group`. Returns `false` if it was not joined.
    pub async fn leave(&self, group: impl Into<String>) -> Result<bool, NetworkError> {
        let group = group.into();
        self.request(|tx| NodeCommand::Leave(group, tx)).await?
    }

    /// Send a message to a single peer.
    pub async fn whisper(&self, peer: NodeId, content: impl Into<Vec<u8>>) -> Result<(), NetworkError> {
        let content = content.into();
        self.request(|tx| NodeCommand::Whisper(peer, content, tx)).await?
    }

    /// Send a message to every peer in `group`. Returns how many peers it
    /// was handed to.
    pub async fn shout(
        &self,
        group: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Result<usize, NetworkError> {
        let group = group.into();
        let content = content.into();
        self.request(|tx| NodeCommand::Shout(group, content, tx)).await?
    }

    pub async fn peer(&self, id: NodeId) -> Result<Option<PeerInfo>, NetworkError> {
        self.request(|tx| NodeCommand::Peer(id, tx)).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>, NetworkError> {
        self.request(NodeCommand::Peers).await
    }

    pub async fn group(&self, name: impl Into<String>) -> Result<Option<GroupInfo>, NetworkError> {
        let name = name.into();
        self.request(|tx| NodeCommand::Group(name, tx)).await
    }

    pub async fn groups(&self) -> Result<Vec<GroupInfo>, NetworkError> {
        self.request(NodeCommand::Groups).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> NodeCommand,
    ) -> Result<T, NetworkError> {
        let running = self.running.as_ref().ok_or(NetworkError::NotRunning)?;
        let (tx, rx) = oneshot::channel();
        running
            .commands
            .send(make(tx))
            .await
            .map_err(|_| NetworkError::NotRunning)?;
        rx.await.map_err(|_| NetworkError::NotRunning)
    }

    /// Pick the local address and the beacon broadcast address.
    fn resolve_addresses(&self) -> Result<(Ipv4Addr, Ipv4Addr), NetworkError> {
        if let Some(address) = self.config.address {
            let broadcast = self.config.broadcast.unwrap_or(Ipv4Addr::BROADCAST);
            return Ok((address, broadcast));
        }
        let iface = local_ipv4_interface(self.config.interface.as_deref())?;
        debug!("Using interface {} ({})", iface.name, iface.address);
        let broadcast = self.config.broadcast.unwrap_or(iface.broadcast);
        Ok((iface.address, broadcast))
    }
}

// ---------------------------------------------------------------------------
// Reactor
// ---------------------------------------------------------------------------

/// The per-node task. Owns the engine and serializes every input into it.
struct Reactor {
    engine: NodeEngine,
    inbound: mpsc::Receiver<InboundMessage>,
    discovered: mpsc::Receiver<DiscoveredPeer>,
    timers: mpsc::UnboundedReceiver<TimerFired>,
    commands: mpsc::Receiver<NodeCommand>,
    beacon: Option<BeaconService>,
    shutdown_tx: broadcast::Sender<()>,
    server: JoinHandle<()>,
}

impl Reactor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(inbound) = self.inbound.recv() => {
                    self.engine.handle_inbound(inbound);
                }
                Some(found) = self.discovered.recv() => {
                    self.engine.handle_discovery(found);
                }
                Some(fired) = self.timers.recv() => {
                    self.engine.handle_timer(fired);
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("Node handle dropped, shutting down");
                        self.shutdown().await;
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
            }
        }
    }

    /// Apply one facade request. Returns `false` once the node has stopped.
    async fn handle_command(&mut self, command: NodeCommand) -> bool {
        match command {
            NodeCommand::Join(group, reply) => {
                let _ = reply.send(self.engine.join(&group));
            }
            NodeCommand::Leave(group, reply) => {
                let _ = reply.send(self.engine.leave(&group));
            }
            NodeCommand::Whisper(peer, content, reply) => {
                let _ = reply.send(self.engine.whisper(&peer, content));
            }
            NodeCommand::Shout(group, content, reply) => {
                let _ = reply.send(self.engine.shout(&group, content));
            }
            NodeCommand::Peer(id, reply) => {
                let _ = reply.send(self.engine.peer(&id));
            }
            NodeCommand::Peers(reply) => {
                let _ = reply.send(self.engine.peers());
            }
            NodeCommand::Group(name, reply) => {
                let _ = reply.send(self.engine.group(&name));
            }
            NodeCommand::Groups(reply) => {
                let _ = reply.send(self.engine.groups());
            }
            NodeCommand::Stop(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    /// Mute events, drop every peer, announce departure, close the mailbox.
    async fn shutdown(&mut self) {
        self.engine.shutdown();
        if let Some(beacon) = self.beacon.take() {
            beacon.stop().await;
        }
        let _ = self.shutdown_tx.send(());
        if let Err(e) = (&mut self.server).await {
            warn!("Listener task failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
