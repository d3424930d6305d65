//! Node engine: the protocol brain of a running node.
//!
//! The engine owns the peer and group registries and turns every input the
//! reactor hands it (an inbound message, a discovered beacon, a timer firing,
//! an application command) into registry updates, outbound messages and
//! [`ZreEvent`]s. It is synchronous and single-owner: the reactor in
//! [`node`](crate::node) calls it from one task, so nothing here locks.

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::beacon::DiscoveredPeer;
use crate::error::NetworkError;
use crate::group::{GroupInfo, GroupRegistry};
use crate::identity::NodeId;
use crate::message::{Headers, Hello, Message, MessageKind, check_short_string};
use crate::peer::{Liveness, PeerInfo, PeerUpdate};
use crate::peers::{PeerEvent, PeerRegistry};
use crate::timer::{TimerFired, TimerQueue};
use crate::transport::{InboundMessage, Transport};

/// Notifications delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZreEvent {
    /// A peer completed its HELLO handshake.
    Connect {
        peer: NodeId,
        name: String,
        headers: Headers,
    },
    /// A peer was evicted, left or was reset.
    Disconnect { peer: NodeId, name: String },
    /// A peer went silent past the expired timeout and was removed.
    Expired { peer: NodeId, name: String },
    /// A peer went silent past the evasive timeout and is being probed.
    Evasive { peer: NodeId, name: String },
    /// A previously evasive peer is talking again.
    Back { peer: NodeId, name: String },
    Whisper {
        peer: NodeId,
        name: String,
        content: Vec<u8>,
    },
    Shout {
        peer: NodeId,
        name: String,
        group: String,
        content: Vec<u8>,
    },
    Join {
        peer: NodeId,
        name: String,
        group: String,
    },
    Leave {
        peer: NodeId,
        name: String,
        group: String,
    },
}

/// This node's own description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNode {
    pub id: NodeId,
    pub name: String,
    pub headers: Headers,
    /// Joined groups, in join order.
    pub groups: Vec<String>,
    /// Bumped on every effective join or leave.
    pub status: u8,
    /// Where peers reach our inbound listener, `tcp://address:port`.
    pub endpoint: String,
}

impl LocalNode {
    pub fn new(id: NodeId, name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            headers: Headers::new(),
            groups: Vec::new(),
            status: 0,
            endpoint: endpoint.into(),
        }
    }

    fn hello(&self) -> Message {
        Message::new(MessageKind::Hello(Hello {
            endpoint: self.endpoint.clone(),
            groups: self.groups.clone(),
            status: self.status,
            name: self.name.clone(),
            headers: self.headers.clone(),
        }))
    }
}

pub struct NodeEngine {
    local: LocalNode,
    peers: PeerRegistry,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    groups: GroupRegistry,
    transport: Box<dyn Transport>,
    /// `None` once muted at shutdown.
    events: Option<mpsc::UnboundedSender<ZreEvent>>,
}

impl NodeEngine {
    pub fn new(
        local: LocalNode,
        liveness: Liveness,
        timers: TimerQueue,
        transport: Box<dyn Transport>,
        events: mpsc::UnboundedSender<ZreEvent>,
    ) -> Self {
        let (peers, peer_events) = PeerRegistry::new(local.id, liveness, timers);
        Self {
            local,
            peers,
            peer_events,
            groups: GroupRegistry::new(),
            transport,
            events: Some(events),
        }
    }

    pub fn local(&self) -> &LocalNode {
        &self.local
    }

    // -----------------------------------------------------------------------
    // Inputs
    // -----------------------------------------------------------------------

    /// Process one message received on the inbound listener.
    pub fn handle_inbound(&mut self, inbound: InboundMessage) {
        let Some(sender) = NodeId::from_routing_tag(&inbound.tag) else {
            debug!("dropping message with invalid routing tag");
            return;
        };
        let msg = match Message::from_frames(&inbound.frames) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("{sender}: malformed message: {e}");
                return;
            }
        };
        let command = msg.command().as_str();
        let is_hello = matches!(msg.kind, MessageKind::Hello(_));

        match self.peers.get(&sender) {
            None if !is_hello => {
                debug!("{sender}: unknown peer sent {command}, dropping");
                return;
            }
            Some(peer) if is_hello && peer.sequence_in() > 0 => {
                info!("{sender}: repeated HELLO, resetting peer");
                self.peers.disconnect(&sender, &mut self.groups);
            }
            _ => {}
        }

        debug!("{sender}: received {command} seq {}", msg.sequence);

        let mut update = PeerUpdate {
            sequence: Some(msg.sequence),
            ..PeerUpdate::default()
        };
        match &msg.kind {
            MessageKind::Hello(hello) => {
                update.endpoint = Some(hello.endpoint.clone());
                update.status = Some(hello.status);
                update.name = Some(hello.name.clone());
                update.headers = Some(hello.headers.clone());
            }
            MessageKind::Join { status, .. } | MessageKind::Leave { status, .. } => {
                update.status = Some(*status);
            }
            _ => {}
        }

        if !self.peers.push(sender, update, &mut self.groups) {
            self.pump();
            return;
        }
        // A brand-new peer is greeted before its own HELLO is reported.
        self.pump();

        self.dispatch(sender, msg.kind);
        self.pump();
    }

    fn dispatch(&mut self, sender: NodeId, kind: MessageKind) {
        let name = self.peer_name(&sender);
        match kind {
            MessageKind::Hello(hello) => {
                if let Some(peer) = self.peers.get_mut(&sender) {
                    for group in &hello.groups {
                        self.groups.push(group, peer);
                    }
                }
                info!("{sender}: connected as '{name}'");
                self.emit(ZreEvent::Connect {
                    peer: sender,
                    name,
                    headers: hello.headers,
                });
            }
            MessageKind::Whisper { content } => {
                self.emit(ZreEvent::Whisper {
                    peer: sender,
                    name,
                    content,
                });
            }
            MessageKind::Shout { group, content } => {
                if self.local.groups.contains(&group) {
                    self.emit(ZreEvent::Shout {
                        peer: sender,
                        name,
                        group,
                        content,
                    });
                } else {
                    debug!("{sender}: shout to {group}, not joined");
                }
            }
            MessageKind::Join { group, .. } => {
                if let Some(peer) = self.peers.get_mut(&sender) {
                    self.groups.push(&group, peer);
                }
                self.emit(ZreEvent::Join {
                    peer: sender,
                    name,
                    group,
                });
            }
            MessageKind::Leave { group, .. } => {
                if let Some(peer) = self.peers.get_mut(&sender) {
                    self.groups.remove(&group, peer);
                }
                self.emit(ZreEvent::Leave {
                    peer: sender,
                    name,
                    group,
                });
            }
            MessageKind::Ping => {
                if let Some(peer) = self.peers.get_mut(&sender) {
                    peer.send(Message::new(MessageKind::PingOk));
                }
            }
            MessageKind::PingOk => {}
        }
    }

    /// Process one beacon from another node.
    pub fn handle_discovery(&mut self, found: DiscoveredPeer) {
        let update = PeerUpdate::beacon(found.address, found.mailbox);
        self.peers.push(found.id, update, &mut self.groups);
        self.pump();
    }

    /// Process one liveness timer firing.
    pub fn handle_timer(&mut self, fired: TimerFired) {
        self.peers.on_timer(fired, &mut self.groups);
        self.pump();
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Join `group` and tell every peer. Returns `false` if already joined.
    pub fn join(&mut self, group: &str) -> Result<bool, NetworkError> {
        check_short_string(group)?;
        if self.local.groups.iter().any(|g| g == group) {
            return Ok(false);
        }
        self.local.groups.push(group.to_string());
        self.local.status = self.local.status.wrapping_add(1);
        info!("joined {group} (status {})", self.local.status);
        self.peers.send(&Message::new(MessageKind::Join {
            group: group.to_string(),
            status: self.local.status,
        }));
        Ok(true)
    }

    /// Leave `group` and tell every peer. Returns `false` if not joined.
    pub fn leave(&mut self, group: &str) -> Result<bool, NetworkError> {
        check_short_string(group)?;
        let Some(pos) = self.local.groups.iter().position(|g| g == group) else {
            return Ok(false);
        };
        self.local.groups.remove(pos);
        self.local.status = self.local.status.wrapping_add(1);
        info!("left {group} (status {})", self.local.status);
        self.peers.send(&Message::new(MessageKind::Leave {
            group: group.to_string(),
            status: self.local.status,
        }));
        Ok(true)
    }

    /// Send `content` to one peer.
    pub fn whisper(&mut self, peer: &NodeId, content: Vec<u8>) -> Result<(), NetworkError> {
        let remote = self
            .peers
            .get_mut(peer)
            .ok_or_else(|| NetworkError::PeerNotFound(peer.to_string()))?;
        remote.send(Message::new(MessageKind::Whisper { content }));
        Ok(())
    }

    /// Send `content` to every member of `group`. Returns how many peers it
    /// was handed to.
    pub fn shout(&mut self, group: &str, content: Vec<u8>) -> Result<usize, NetworkError> {
        check_short_string(group)?;
        let msg = Message::new(MessageKind::Shout {
            group: group.to_string(),
            content,
        });
        Ok(self.groups.send(group, msg, &mut self.peers))
    }

    /// Mute events and tear down every peer and group.
    pub fn shutdown(&mut self) {
        self.events = None;
        self.peers.disconnect_all(&mut self.groups);
        self.groups.remove_all(&mut self.peers);
        while self.peer_events.try_recv().is_ok() {}
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    pub fn peer(&self, id: &NodeId) -> Option<PeerInfo> {
        self.peers.info(id)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.infos()
    }

    pub fn group(&self, name: &str) -> Option<GroupInfo> {
        self.groups.info(name, &self.peers)
    }

    pub fn groups(&self) -> Vec<GroupInfo> {
        self.groups.infos(&self.peers)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Drain registry notifications.
    fn pump(&mut self) {
        while let Ok(event) = self.peer_events.try_recv() {
            match event {
                PeerEvent::New(id) => self.greet(&id),
                PeerEvent::Evasive(id) => {
                    let name = self.peer_name(&id);
                    self.emit(ZreEvent::Evasive { peer: id, name });
                }
                PeerEvent::Back(id) => {
                    let name = self.peer_name(&id);
                    self.emit(ZreEvent::Back { peer: id, name });
                }
                PeerEvent::Expired(info) => self.emit(ZreEvent::Expired {
                    peer: info.id,
                    name: info.name.unwrap_or_default(),
                }),
                PeerEvent::Disconnected(info) => self.emit(ZreEvent::Disconnect {
                    peer: info.id,
                    name: info.name.unwrap_or_default(),
                }),
            }
        }
    }

    /// Connect to a newly discovered peer and introduce ourselves.
    fn greet(&mut self, id: &NodeId) {
        self.peers.connect(id, self.transport.as_ref());
        let hello = self.local.hello();
        if let Some(peer) = self.peers.get_mut(id) {
            peer.send(hello);
        }
    }

    fn peer_name(&self, id: &NodeId) -> String {
        self.peers
            .get(id)
            .and_then(|peer| peer.name())
            .unwrap_or_default()
            .to_string()
    }

    fn emit(&self, event: ZreEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::time::Duration;

    use super::*;
    use crate::timer::TimerKind;
    use crate::transport::testing::RecordingTransport;

    const LOCAL_ENDPOINT: &str = "tcp://127.0.0.1:40000";
    const REMOTE_ENDPOINT: &str = "tcp://127.0.0.1:40001";

    struct Harness {
        engine: NodeEngine,
        transport: RecordingTransport,
        events: mpsc::UnboundedReceiver<ZreEvent>,
        timers: mpsc::UnboundedReceiver<TimerFired>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_liveness(Liveness::default())
        }

        fn with_liveness(liveness: Liveness) -> Self {
            let (queue, timers) = TimerQueue::new();
            let (tx, events) = mpsc::unbounded_channel();
            let transport = RecordingTransport::default();
            let mut local = LocalNode::new(NodeId::generate(), "local", LOCAL_ENDPOINT);
            local.headers.insert("X-ROLE".into(), "test".into());
            let engine = NodeEngine::new(local, liveness, queue, Box::new(transport.clone()), tx);
            Self {
                engine,
                transport,
                events,
                timers,
            }
        }

        fn deliver(&mut self, from: NodeId, sequence: u16, kind: MessageKind) {
            let frames = Message { sequence, kind }.encode().unwrap();
            self.engine.handle_inbound(InboundMessage {
                tag: from.routing_tag().to_vec(),
                frames,
            });
        }

        fn hello_from(&mut self, from: NodeId, groups: &[&str]) {
            let hello = Hello {
                endpoint: REMOTE_ENDPOINT.into(),
                groups: groups.iter().map(|g| g.to_string()).collect(),
                status: 3,
                name: "remote".into(),
                headers: Headers::new(),
            };
            self.deliver(from, 1, MessageKind::Hello(hello));
        }

        fn sent(&self) -> Vec<Message> {
            self.transport.sent(REMOTE_ENDPOINT)
        }

        fn events(&mut self) -> Vec<ZreEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    #[tokio::test]
    async fn test_beacon_triggers_connect_and_hello() {
        let mut h = Harness::new();
        h.engine.join("CHAT").unwrap();
        let remote = NodeId::generate();
        h.engine.handle_discovery(DiscoveredPeer {
            id: remote,
            address: "127.0.0.1".parse::<IpAddr>().unwrap(),
            mailbox: 40001,
        });

        assert_eq!(h.transport.opened(), vec![REMOTE_ENDPOINT.to_string()]);
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].sequence, 1);
        let MessageKind::Hello(hello) = &sent[0].kind else {
            panic!("expected HELLO, got {:?}", sent[0].kind);
        };
        assert_eq!(hello.endpoint, LOCAL_ENDPOINT);
        assert_eq!(hello.groups, vec!["CHAT".to_string()]);
        assert_eq!(hello.status, 1);
        assert_eq!(hello.name, "local");
        assert_eq!(hello.headers.get("X-ROLE").map(String::as_str), Some("test"));

        // No application event until the peer says HELLO itself.
        assert!(h.events().is_empty());
    }

    #[tokio::test]
    async fn test_hello_from_unknown_peer() {
        let mut h = Harness::new();
        let remote = NodeId::generate();
        h.hello_from(remote, &["CHAT", "OPS"]);

        // We connect back to the advertised endpoint and greet.
        let sent = h.sent();
        assert!(matches!(sent.as_slice(), [Message { kind: MessageKind::Hello(_), .. }]));

        assert_eq!(
            h.events(),
            vec![ZreEvent::Connect {
                peer: remote,
                name: "remote".into(),
                headers: Headers::new(),
            }]
        );
        let info = h.engine.peer(&remote).unwrap();
        assert_eq!(info.name.as_deref(), Some("remote"));
        assert_eq!(info.status, 3);
        assert_eq!(info.groups, vec!["CHAT".to_string(), "OPS".to_string()]);
        assert_eq!(h.engine.group("OPS").unwrap().members[0].id, remote);
    }

    #[tokio::test]
    async fn test_unknown_peer_non_hello_dropped() {
        let mut h = Harness::new();
        let remote = NodeId::generate();
        h.deliver(remote, 1, MessageKind::Whisper { content: b"x".to_vec() });
        assert!(h.engine.peers().is_empty());
        assert!(h.events().is_empty());
        assert!(h.transport.opened().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_and_untagged_dropped() {
        let mut h = Harness::new();
        let remote = NodeId::generate();
        h.engine.handle_inbound(InboundMessage {
            tag: remote.routing_tag().to_vec(),
            frames: vec![vec![0xAA, 0xA1, 0x09, 0x02, 0x00, 0x01]],
        });
        h.engine.handle_inbound(InboundMessage {
            tag: vec![0x01, 0x02],
            frames: Message::new(MessageKind::Ping).encode().unwrap(),
        });
        assert!(h.engine.peers().is_empty());
        assert!(h.events().is_empty());
    }

    #[tokio::test]
    async fn test_shout_delivered_only_when_joined() {
        let mut h = Harness::new();
        let remote = NodeId::generate();
        h.hello_from(remote, &[]);
        h.events();

        let shout = |content: &[u8]| MessageKind::Shout {
            group: "CHAT".into(),
            content: content.to_vec(),
        };
        h.deliver(remote, 2, shout(b"early"));
        assert!(h.events().is_empty());

        h.engine.join("CHAT").unwrap();
        h.deliver(remote, 3, shout(b"hello"));
        assert_eq!(
            h.events(),
            vec![ZreEvent::Shout {
                peer: remote,
                name: "remote".into(),
                group: "CHAT".into(),
                content: b"hello".to_vec(),
            }]
        );
    }

    #[tokio::test]
    async fn test_ping_answered_once() {
        let mut h = Harness::new();
        let remote = NodeId::generate();
        h.hello_from(remote, &[]);
        h.sent();

        h.deliver(remote, 2, MessageKind::Ping);
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageKind::PingOk);
        assert_eq!(sent[0].sequence, 2);
    }

    #[tokio::test]
    async fn test_whisper_in_and_out() {
        let mut h = Harness::new();
        let remote = NodeId::generate();
        h.hello_from(remote, &[]);
        h.events();
        h.sent();

        h.deliver(remote, 2, MessageKind::Whisper { content: vec![0, 159, 255] });
        assert_eq!(
            h.events(),
            vec![ZreEvent::Whisper {
                peer: remote,
                name: "remote".into(),
                content: vec![0, 159, 255],
            }]
        );

        h.engine.whisper(&remote, b"psst".to_vec()).unwrap();
        assert_eq!(
            h.sent()[0].kind,
            MessageKind::Whisper {
                content: b"psst".to_vec()
            }
        );

        let stranger = NodeId::generate();
        assert!(matches!(
            h.engine.whisper(&stranger, Vec::new()),
            Err(NetworkError::PeerNotFound(id)) if id == stranger.to_string()
        ));
    }

    #[tokio::test]
    async fn test_join_leave_membership_events() {
        let mut h = Harness::new();
        let remote = NodeId::generate();
        h.hello_from(remote, &[]);
        h.events();

        h.deliver(remote, 2, MessageKind::Join { group: "OPS".into(), status: 4 });
        assert_eq!(h.engine.group("OPS").unwrap().members.len(), 1);
        assert_eq!(h.engine.peer(&remote).unwrap().status, 4);

        h.deliver(remote, 3, MessageKind::Leave { group: "OPS".into(), status: 5 });
        assert!(h.engine.group("OPS").is_none());

        let events = h.events();
        assert!(matches!(&events[0], ZreEvent::Join { group, .. } if group == "OPS"));
        assert!(matches!(&events[1], ZreEvent::Leave { group, .. } if group == "OPS"));
    }

    #[tokio::test]
    async fn test_local_join_bumps_status_and_notifies() {
        let mut h = Harness::new();
        let remote = NodeId::generate();
        h.hello_from(remote, &[]);
        h.sent();

        assert!(h.engine.join("CHAT").unwrap());
        assert_eq!(h.engine.local().status, 1);
        assert!(!h.engine.join("CHAT").unwrap());
        assert_eq!(h.engine.local().status, 1);

        assert!(h.engine.leave("CHAT").unwrap());
        assert!(!h.engine.leave("CHAT").unwrap());
        assert_eq!(h.engine.local().status, 2);
        assert!(h.engine.local().groups.is_empty());

        let sent = h.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind, MessageKind::Join { group: "CHAT".into(), status: 1 });
        assert_eq!(sent[1].kind, MessageKind::Leave { group: "CHAT".into(), status: 2 });
    }

    #[tokio::test]
    async fn test_long_group_name_rejected_without_state_change() {
        let mut h = Harness::new();
        let remote = NodeId::generate();
        h.hello_from(remote, &[]);
        h.sent();

        let long = "g".repeat(256);
        assert!(matches!(h.engine.join(&long), Err(NetworkError::Codec(_))));
        assert!(matches!(h.engine.leave(&long), Err(NetworkError::Codec(_))));
        assert!(matches!(
            h.engine.shout(&long, b"hi".to_vec()),
            Err(NetworkError::Codec(_))
        ));
        assert_eq!(h.engine.local().status, 0);
        assert!(h.engine.local().groups.is_empty());
        assert!(h.sent().is_empty());

        // The limit itself is fine.
        assert!(h.engine.join(&"g".repeat(255)).unwrap());
        assert_eq!(h.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_status_wraps() {
        let mut h = Harness::new();
        for i in 0..256 {
            h.engine.join(&format!("G{i}")).unwrap();
        }
        assert_eq!(h.engine.local().status, 0);
    }

    #[tokio::test]
    async fn test_shout_to_group_members() {
        let mut h = Harness::new();
        let remote = NodeId::generate();
        h.hello_from(remote, &["CHAT"]);
        h.sent();

        assert_eq!(h.engine.shout("CHAT", b"hi".to_vec()).unwrap(), 1);
        assert_eq!(h.engine.shout("EMPTY", b"hi".to_vec()).unwrap(), 0);
        assert_eq!(
            h.sent(),
            vec![Message {
                sequence: 2,
                kind: MessageKind::Shout {
                    group: "CHAT".into(),
                    content: b"hi".to_vec(),
                },
            }]
        );
    }

    #[tokio::test]
    async fn test_sequence_gap_evicts() {
        let mut h = Harness::new();
        let remote = NodeId::generate();
        h.hello_from(remote, &["CHAT"]);
        h.events();

        h.deliver(remote, 5, MessageKind::Whisper { content: Vec::new() });
        assert!(h.engine.peer(&remote).is_none());
        assert!(h.engine.group("CHAT").is_none());
        assert!(h.transport.is_closed(REMOTE_ENDPOINT));
        assert_eq!(
            h.events(),
            vec![ZreEvent::Disconnect {
                peer: remote,
                name: "remote".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_repeated_hello_resets_peer() {
        let mut h = Harness::new();
        let remote = NodeId::generate();
        h.hello_from(remote, &["CHAT"]);
        h.deliver(remote, 2, MessageKind::Ping);
        h.events();

        // The remote restarted its session: sequence starts over at 1.
        h.hello_from(remote, &["OPS"]);
        let events = h.events();
        assert!(matches!(&events[0], ZreEvent::Disconnect { peer, .. } if *peer == remote));
        assert!(matches!(&events[1], ZreEvent::Connect { peer, .. } if *peer == remote));

        let info = h.engine.peer(&remote).unwrap();
        assert_eq!(info.groups, vec!["OPS".to_string()]);
        assert!(h.engine.group("CHAT").is_none());
    }

    #[tokio::test]
    async fn test_evasive_back_then_expired() {
        let mut h = Harness::with_liveness(Liveness {
            evasive: Duration::from_millis(100),
            expired: Duration::from_millis(200),
        });
        let remote = NodeId::generate();
        h.hello_from(remote, &[]);
        h.events();
        h.sent();

        // Evasive: probe sent, application told.
        let fired = tokio::time::timeout(Duration::from_secs(1), h.timers.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired.kind, TimerKind::Evasive);
        h.engine.handle_timer(fired);
        assert_eq!(h.sent()[0].kind, MessageKind::Ping);
        assert!(matches!(h.events().as_slice(), [ZreEvent::Evasive { .. }]));

        // The peer answers before expiry: back, not evicted.
        h.deliver(remote, 2, MessageKind::PingOk);
        assert!(matches!(h.events().as_slice(), [ZreEvent::Back { .. }]));
        assert!(h.engine.peer(&remote).is_some());

        // Then goes silent for good.
        let expired = loop {
            let fired = tokio::time::timeout(Duration::from_secs(1), h.timers.recv())
                .await
                .unwrap()
                .unwrap();
            let kind = fired.kind;
            h.engine.handle_timer(fired);
            if kind == TimerKind::Expired {
                break h.events();
            }
        };
        assert!(expired.iter().any(|e| matches!(e, ZreEvent::Expired { peer, .. } if *peer == remote)));
        assert!(matches!(expired.last(), Some(ZreEvent::Disconnect { .. })));
        assert!(h.engine.peer(&remote).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_is_silent() {
        let mut h = Harness::new();
        h.hello_from(NodeId::generate(), &["CHAT"]);
        h.events();

        h.engine.shutdown();
        assert!(h.engine.peers().is_empty());
        assert!(h.engine.groups().is_empty());
        assert!(h.events().is_empty());
        assert!(h.transport.is_closed(REMOTE_ENDPOINT));
    }
}
