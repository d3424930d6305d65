//! Named groups and the registry that owns them.
//!
//! Membership is two-sided and keyed: a [`Group`] holds member identities and
//! each [`RemotePeer`] holds the names of the groups it is in. Every add and
//! remove goes through this module so both sides stay consistent.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::identity::NodeId;
use crate::message::{Message, MessageKind};
use crate::peer::{PeerInfo, RemotePeer};
use crate::peers::PeerRegistry;

/// A read-only snapshot of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    pub members: Vec<PeerInfo>,
}

/// A named set of remote peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    name: String,
    members: BTreeSet<NodeId>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> impl Iterator<Item = &NodeId> {
        self.members.iter()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Add `peer`, recording the membership on the peer as well.
    pub fn add(&mut self, peer: &mut RemotePeer) {
        if self.members.insert(*peer.id()) {
            peer.groups_mut().insert(self.name.clone());
        }
    }

    /// Remove `peer` from both sides of the membership.
    pub fn remove(&mut self, peer: &mut RemotePeer) {
        if self.members.remove(peer.id()) {
            peer.groups_mut().remove(&self.name);
        }
    }

    /// Stamp this group's name into `msg` and send a copy to every member.
    /// Returns the number of members the message was handed to.
    pub fn send(&self, mut msg: Message, peers: &mut PeerRegistry) -> usize {
        match &mut msg.kind {
            MessageKind::Shout { group, .. }
            | MessageKind::Join { group, .. }
            | MessageKind::Leave { group, .. } => group.clone_from(&self.name),
            _ => {}
        }
        let mut sent = 0;
        for id in &self.members {
            if let Some(peer) = peers.get_mut(id) {
                if peer.send(msg.clone()) {
                    sent += 1;
                }
            }
        }
        sent
    }

    pub fn info(&self, peers: &PeerRegistry) -> GroupInfo {
        GroupInfo {
            name: self.name.clone(),
            members: self
                .members
                .iter()
                .filter_map(|id| peers.get(id))
                .map(RemotePeer::info)
                .collect(),
        }
    }
}

/// Owns every group, creating them on first join and dropping them once
/// empty.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: BTreeMap<String, Group>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Add `peer` to `name`, creating the group if needed.
    pub fn push(&mut self, name: &str, peer: &mut RemotePeer) {
        let group = self.groups.entry(name.to_string()).or_insert_with(|| {
            debug!("group {name} created");
            Group::new(name)
        });
        group.add(peer);
    }

    /// Remove `peer` from `name`; the group goes away when its last member
    /// leaves.
    pub fn remove(&mut self, name: &str, peer: &mut RemotePeer) {
        // The peer side is cleared even when the group is already gone.
        peer.groups_mut().remove(name);
        let Some(group) = self.groups.get_mut(name) else {
            return;
        };
        group.remove(peer);
        if group.is_empty() {
            self.groups.remove(name);
            debug!("group {name} removed");
        }
    }

    /// Drop every group, clearing memberships on the peers too.
    pub fn remove_all(&mut self, peers: &mut PeerRegistry) {
        for group in std::mem::take(&mut self.groups).into_values() {
            for id in group.members {
                if let Some(peer) = peers.get_mut(&id) {
                    peer.groups_mut().remove(&group.name);
                }
            }
        }
    }

    /// Send `msg` to every member of `name`. Unknown groups send nothing.
    pub fn send(&self, name: &str, msg: Message, peers: &mut PeerRegistry) -> usize {
        self.groups
            .get(name)
            .map_or(0, |group| group.send(msg, peers))
    }

    pub fn info(&self, name: &str, peers: &PeerRegistry) -> Option<GroupInfo> {
        self.groups.get(name).map(|group| group.info(peers))
    }

    pub fn infos(&self, peers: &PeerRegistry) -> Vec<GroupInfo> {
        self.groups.values().map(|group| group.info(peers)).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{Liveness, PeerUpdate};
    use crate::peers::PeerRegistry;
    use crate::timer::TimerQueue;
    use crate::transport::testing::RecordingTransport;

    fn make_peer() -> RemotePeer {
        RemotePeer::new(NodeId::generate(), Liveness::default())
    }

    #[test]
    fn test_add_and_remove_are_two_sided() {
        let mut group = Group::new("CHAT");
        let mut peer = make_peer();

        group.add(&mut peer);
        group.add(&mut peer);
        assert_eq!(group.len(), 1);
        assert!(group.contains(peer.id()));
        assert!(peer.groups().contains("CHAT"));

        group.remove(&mut peer);
        group.remove(&mut peer);
        assert!(group.is_empty());
        assert!(peer.groups().is_empty());
    }

    #[test]
    fn test_registry_creates_lazily_and_drops_empty() {
        let mut groups = GroupRegistry::new();
        let mut a = make_peer();
        let mut b = make_peer();

        assert!(groups.get("CHAT").is_none());
        groups.push("CHAT", &mut a);
        groups.push("CHAT", &mut b);
        assert_eq!(groups.get("CHAT").map(Group::len), Some(2));

        groups.remove("CHAT", &mut a);
        assert_eq!(groups.get("CHAT").map(Group::len), Some(1));
        groups.remove("CHAT", &mut b);
        assert!(groups.get("CHAT").is_none());
        assert!(groups.is_empty());

        // Removing from a group that no longer exists is harmless.
        groups.remove("CHAT", &mut b);
    }

    #[tokio::test]
    async fn test_group_send_stamps_name_and_fans_out() {
        let (timers, _timer_rx) = TimerQueue::new();
        let (mut peers, _events) = PeerRegistry::new(NodeId::generate(), Liveness::default(), timers);
        let transport = RecordingTransport::default();
        let mut groups = GroupRegistry::new();

        let ids: Vec<NodeId> = (0..3).map(|_| NodeId::generate()).collect();
        for (i, id) in ids.iter().enumerate() {
            let update = PeerUpdate::beacon("10.0.0.1".parse().unwrap(), 50000 + i as u16);
            assert!(peers.push(*id, update, &mut groups));
            peers.connect(id, &transport);
        }
        // Only the first two join.
        for id in &ids[..2] {
            groups.push("CHAT", peers.get_mut(id).unwrap());
        }

        let msg = Message::new(MessageKind::Shout {
            group: String::new(),
            content: b"hi".to_vec(),
        });
        assert_eq!(groups.send("CHAT", msg.clone(), &mut peers), 2);
        assert_eq!(groups.send("NOBODY", msg, &mut peers), 0);

        let sent = transport.sent("tcp://10.0.0.1:50000");
        assert_eq!(
            sent[0].kind,
            MessageKind::Shout {
                group: "CHAT".into(),
                content: b"hi".to_vec(),
            }
        );
        assert_eq!(transport.sent("tcp://10.0.0.1:50001").len(), 1);
        assert!(transport.sent("tcp://10.0.0.1:50002").is_empty());
    }

    #[tokio::test]
    async fn test_group_send_counts_only_delivered() {
        let (timers, _timer_rx) = TimerQueue::new();
        let (mut peers, _events) = PeerRegistry::new(NodeId::generate(), Liveness::default(), timers);
        let transport = RecordingTransport::default();
        let mut groups = GroupRegistry::new();

        let online = NodeId::generate();
        let offline = NodeId::generate();
        peers.push(online, PeerUpdate::beacon("10.0.0.2".parse().unwrap(), 50000), &mut groups);
        peers.push(offline, PeerUpdate::beacon("10.0.0.3".parse().unwrap(), 50000), &mut groups);
        peers.connect(&online, &transport);
        groups.push("CHAT", peers.get_mut(&online).unwrap());
        groups.push("CHAT", peers.get_mut(&offline).unwrap());

        let msg = Message::new(MessageKind::Shout {
            group: String::new(),
            content: b"x".to_vec(),
        });
        assert_eq!(groups.get("CHAT").unwrap().len(), 2);
        assert_eq!(groups.send("CHAT", msg, &mut peers), 1);
        assert_eq!(transport.sent("tcp://10.0.0.2:50000").len(), 1);
        assert_eq!(peers.get(&offline).unwrap().sequence_out(), 0);
    }

    #[tokio::test]
    async fn test_remove_all_clears_peer_side() {
        let (timers, _timer_rx) = TimerQueue::new();
        let (mut peers, _events) = PeerRegistry::new(NodeId::generate(), Liveness::default(), timers);
        let mut groups = GroupRegistry::new();
        let id = NodeId::generate();
        peers.push(id, PeerUpdate::beacon("10.0.0.1".parse().unwrap(), 50000), &mut groups);
        groups.push("A", peers.get_mut(&id).unwrap());
        groups.push("B", peers.get_mut(&id).unwrap());

        let infos = groups.infos(&peers);
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].members[0].id, id);

        groups.remove_all(&mut peers);
        assert!(groups.is_empty());
        assert!(peers.get(&id).unwrap().groups().is_empty());
    }
}
