//! Peer registry: owns every [`RemotePeer`] and reports their lifecycle.
//!
//! Lifecycle changes are posted as [`PeerEvent`]s on an unbounded channel
//! that the node engine drains after each input it processes.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::group::GroupRegistry;
use crate::identity::NodeId;
use crate::message::{Message, MessageKind};
use crate::peer::{Liveness, PeerInfo, PeerUpdate, RemotePeer};
use crate::timer::{TimerFired, TimerKind, TimerQueue};
use crate::transport::Transport;

/// Lifecycle notifications raised by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// First successful update of a previously unknown peer.
    New(NodeId),
    /// No traffic within the evasive timeout; a PING was sent.
    Evasive(NodeId),
    /// Traffic arrived from a peer previously marked evasive.
    Back(NodeId),
    /// No traffic within the expired timeout. The peer has been removed.
    Expired(PeerInfo),
    /// The peer was evicted or explicitly disconnected and removed.
    Disconnected(PeerInfo),
}

/// Registry of every remote peer this node knows about.
#[derive(Debug)]
pub struct PeerRegistry {
    origin: NodeId,
    peers: HashMap<NodeId, RemotePeer>,
    liveness: Liveness,
    timers: TimerQueue,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerRegistry {
    /// Create an empty registry for the node identified by `origin`.
    pub fn new(
        origin: NodeId,
        liveness: Liveness,
        timers: TimerQueue,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Self {
            origin,
            peers: HashMap::new(),
            liveness,
            timers,
            events,
        };
        (registry, rx)
    }

    pub fn get(&self, id: &NodeId) -> Option<&RemotePeer> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut RemotePeer> {
        self.peers.get_mut(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.peers.keys()
    }

    /// Create or update the peer `id`.
    ///
    /// Returns `false` when the update was rejected. A rejected known peer is
    /// evicted and reported as disconnected; a peer created by this very call
    /// is dropped without any event.
    pub fn push(&mut self, id: NodeId, update: PeerUpdate, groups: &mut GroupRegistry) -> bool {
        let created = !self.peers.contains_key(&id);
        let peer = self
            .peers
            .entry(id)
            .or_insert_with(|| RemotePeer::new(id, self.liveness));

        match peer.update(update, &self.timers) {
            Ok(outcome) => {
                if created {
                    info!("{id}: new peer");
                    self.emit(PeerEvent::New(id));
                } else if outcome.back {
                    debug!("{id}: back");
                    self.emit(PeerEvent::Back(id));
                }
                true
            }
            Err(reason) if created => {
                debug!("{id}: dropping unknown peer ({reason})");
                if let Some(mut peer) = self.peers.remove(&id) {
                    peer.disconnect(groups);
                }
                false
            }
            Err(reason) => {
                warn!("{id}: evicting peer ({reason})");
                self.disconnect(&id, groups);
                false
            }
        }
    }

    /// Open the outbound channel to `id`, if known.
    pub fn connect(&mut self, id: &NodeId, transport: &dyn Transport) {
        let origin = self.origin;
        if let Some(peer) = self.peers.get_mut(id) {
            peer.connect(transport, &origin);
        }
    }

    /// Tear down and forget `id`. Returns the final snapshot, if it was known.
    pub fn disconnect(&mut self, id: &NodeId, groups: &mut GroupRegistry) -> Option<PeerInfo> {
        let mut peer = self.peers.remove(id)?;
        peer.disconnect(groups);
        let info = peer.info();
        self.emit(PeerEvent::Disconnected(info.clone()));
        Some(info)
    }

    /// Disconnect every peer.
    pub fn disconnect_all(&mut self, groups: &mut GroupRegistry) {
        let ids: Vec<NodeId> = self.peers.keys().copied().collect();
        for id in ids {
            self.disconnect(&id, groups);
        }
    }

    /// Send a copy of `msg` to every connected peer. Returns how many peers
    /// it was handed to.
    pub fn send(&mut self, msg: &Message) -> usize {
        self.peers
            .values_mut()
            .filter(|peer| peer.is_connected())
            .map(|peer| peer.send(msg.clone()))
            .filter(|sent| *sent)
            .count()
    }

    /// Apply a liveness timer firing.
    pub fn on_timer(&mut self, fired: TimerFired, groups: &mut GroupRegistry) {
        let Some(peer) = self.peers.get_mut(&fired.peer) else {
            return;
        };
        if !peer.on_timer(&fired) {
            return;
        }
        match fired.kind {
            TimerKind::Evasive => {
                peer.send(Message::new(MessageKind::Ping));
                self.emit(PeerEvent::Evasive(fired.peer));
            }
            TimerKind::Expired => {
                warn!("{}: expired", fired.peer);
                let info = peer.info();
                self.emit(PeerEvent::Expired(info));
                self.disconnect(&fired.peer, groups);
            }
        }
    }

    pub fn info(&self, id: &NodeId) -> Option<PeerInfo> {
        self.peers.get(id).map(RemotePeer::info)
    }

    pub fn infos(&self) -> Vec<PeerInfo> {
        let mut infos: Vec<PeerInfo> = self.peers.values().map(RemotePeer::info).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    fn emit(&self, event: PeerEvent) {
        // Receiver gone means the engine shut down.
        let _ = self.events.send(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
