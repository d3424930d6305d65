//! Remote peer: per-node connection state, sequencing and liveness.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::group::GroupRegistry;
use crate::identity::NodeId;
use crate::message::{Headers, Message};
use crate::timer::{TimerFired, TimerHandle, TimerKind, TimerQueue};
use crate::transport::{PeerConnection, Transport, endpoint_for};

/// Default time without traffic before a peer is probed with PING.
pub const DEFAULT_EVASIVE_TIMEOUT: Duration = Duration::from_millis(5000);
/// Default time without traffic before a peer is evicted.
pub const DEFAULT_EXPIRED_TIMEOUT: Duration = Duration::from_millis(30000);

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Known (from a beacon or HELLO) but no outbound channel open.
    Disconnected,
    /// Outbound channel open; messages can be sent.
    Connected,
}

/// Liveness deadlines for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Liveness {
    pub evasive: Duration,
    pub expired: Duration,
}

impl Default for Liveness {
    fn default() -> Self {
        Self {
            evasive: DEFAULT_EVASIVE_TIMEOUT,
            expired: DEFAULT_EXPIRED_TIMEOUT,
        }
    }
}

/// Everything learned about a peer from one beacon or message.
///
/// Beacons fill `address` and `mailbox`; messages fill `sequence` and, for
/// HELLO, the descriptive fields. Absent fields leave the peer unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerUpdate {
    pub sequence: Option<u16>,
    pub address: Option<IpAddr>,
    pub mailbox: Option<u16>,
    pub endpoint: Option<String>,
    pub status: Option<u8>,
    pub name: Option<String>,
    pub headers: Option<Headers>,
}

impl PeerUpdate {
    /// Fields carried by a discovery beacon.
    pub fn beacon(address: IpAddr, mailbox: u16) -> Self {
        Self {
            address: Some(address),
            mailbox: Some(mailbox),
            ..Self::default()
        }
    }
}

/// Why an update was refused. Either way the peer must be evicted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateRejected {
    #[error("wrong sequence {got}, expected {expected}")]
    Sequence { expected: u16, got: u16 },
    #[error("peer announced departure")]
    Departed,
}

/// Result of a successful update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateOutcome {
    /// The peer had been marked evasive (or expired) and is now live again.
    pub back: bool,
}

/// A read-only snapshot of a peer, as handed to applications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub name: Option<String>,
    pub endpoint: Option<String>,
    pub headers: Headers,
    pub groups: Vec<String>,
    pub status: u8,
    pub state: PeerState,
    pub evasive: bool,
    pub evasive_since: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
}

/// One remote node as seen from this node.
#[derive(Debug)]
pub struct RemotePeer {
    id: NodeId,
    endpoint: Option<String>,
    sequence_in: u16,
    sequence_out: u16,
    name: Option<String>,
    headers: Headers,
    status: u8,
    groups: BTreeSet<String>,
    state: PeerState,
    connection: Option<PeerConnection>,
    evasive_since: Option<DateTime<Utc>>,
    expired_since: Option<DateTime<Utc>>,
    last_seen: DateTime<Utc>,
    liveness: Liveness,
    timer_epoch: u64,
    evasive_timer: Option<TimerHandle>,
    expired_timer: Option<TimerHandle>,
}

impl RemotePeer {
    pub fn new(id: NodeId, liveness: Liveness) -> Self {
        Self {
            id,
            endpoint: None,
            sequence_in: 0,
            sequence_out: 0,
            name: None,
            headers: Headers::new(),
            status: 0,
            groups: BTreeSet::new(),
            state: PeerState::Disconnected,
            connection: None,
            evasive_since: None,
            expired_since: None,
            last_seen: Utc::now(),
            liveness,
            timer_epoch: 0,
            evasive_timer: None,
            expired_timer: None,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Connected
    }

    pub fn is_evasive(&self) -> bool {
        self.evasive_since.is_some()
    }

    /// Sequence of the last message accepted from this peer.
    pub fn sequence_in(&self) -> u16 {
        self.sequence_in
    }

    /// Sequence of the last message sent to this peer.
    pub fn sequence_out(&self) -> u16 {
        self.sequence_out
    }

    /// Names of the groups this peer is a member of.
    pub fn groups(&self) -> &BTreeSet<String> {
        &self.groups
    }

    pub(crate) fn groups_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.groups
    }

    /// Open the outbound channel. No-op when already connected or when no
    /// endpoint is known yet.
    pub fn connect(&mut self, transport: &dyn Transport, origin: &NodeId) {
        if self.is_connected() {
            return;
        }
        let Some(endpoint) = self.endpoint.as_deref() else {
            warn!("{}: cannot connect, endpoint unknown", self.id);
            return;
        };
        self.connection = Some(transport.connect(endpoint, origin));
        self.state = PeerState::Connected;
        debug!("{}: connected to {endpoint}", self.id);
    }

    /// Close the channel, cancel both liveness timers and leave every group.
    pub fn disconnect(&mut self, groups: &mut GroupRegistry) {
        self.cancel_timers();
        for name in std::mem::take(&mut self.groups) {
            groups.remove(&name, self);
        }
        self.connection = None;
        self.state = PeerState::Disconnected;
        debug!("{}: disconnected", self.id);
    }

    /// Stamp the next outbound sequence into `msg` and transmit it.
    ///
    /// Returns `false` when the peer is not connected or the message could
    /// not be encoded; nothing is retried.
    pub fn send(&mut self, mut msg: Message) -> bool {
        let Some(connection) = self.connection.as_ref().filter(|_| self.is_connected()) else {
            debug!("{}: not connected, dropping {}", self.id, msg.command().as_str());
            return false;
        };
        self.sequence_out = self.sequence_out.wrapping_add(1);
        msg.sequence = self.sequence_out;
        match msg.encode() {
            Ok(frames) => {
                debug!(
                    "{}: sent {} seq {}",
                    self.id,
                    msg.command().as_str(),
                    msg.sequence
                );
                connection.send(frames)
            }
            Err(e) => {
                warn!("{}: cannot encode {}: {e}", self.id, msg.command().as_str());
                false
            }
        }
    }

    /// Merge discovered or received information into the peer.
    ///
    /// A rejected update has already cancelled the liveness timers; the
    /// caller is expected to evict the peer.
    pub fn update(&mut self, update: PeerUpdate, timers: &TimerQueue) -> Result<UpdateOutcome, UpdateRejected> {
        if let Some(sequence) = update.sequence {
            let expected = self.sequence_in.wrapping_add(1);
            if sequence != expected {
                debug!("{}: wrong sequence ({sequence}), expected ({expected})", self.id);
                self.cancel_timers();
                return Err(UpdateRejected::Sequence {
                    expected,
                    got: sequence,
                });
            }
            self.sequence_in = sequence;
        }

        if let (Some(address), Some(mailbox)) = (update.address, update.mailbox) {
            if mailbox == 0 {
                debug!("{}: received departure beacon", self.id);
                self.cancel_timers();
                return Err(UpdateRejected::Departed);
            }
            if !self.is_connected() {
                self.endpoint = Some(endpoint_for((address, mailbox).into()));
            }
        }

        if let Some(endpoint) = update.endpoint {
            if !self.is_connected() {
                self.endpoint = Some(endpoint);
            }
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(name) = update.name {
            self.name = Some(name);
        }
        if let Some(headers) = update.headers {
            self.headers = headers;
        }

        let back = self.evasive_since.take().is_some() | self.expired_since.take().is_some();
        self.last_seen = Utc::now();
        self.arm_timers(timers);

        Ok(UpdateOutcome { back })
    }

    /// Handle a liveness deadline. Returns `false` for stale firings that a
    /// later update already superseded.
    pub(crate) fn on_timer(&mut self, fired: &TimerFired) -> bool {
        if fired.epoch != self.timer_epoch {
            return false;
        }
        let now = Utc::now();
        match fired.kind {
            TimerKind::Evasive => {
                self.evasive_timer = None;
                self.evasive_since = Some(now);
                debug!("{}: evasive at {now}", self.id);
            }
            TimerKind::Expired => {
                self.expired_timer = None;
                self.expired_since = Some(now);
                debug!("{}: expired at {now}", self.id);
            }
        }
        true
    }

    /// Recreate both liveness timers under a fresh epoch.
    fn arm_timers(&mut self, timers: &TimerQueue) {
        self.cancel_timers();
        self.timer_epoch += 1;
        let fired = |kind| TimerFired {
            peer: self.id,
            kind,
            epoch: self.timer_epoch,
        };
        self.evasive_timer = Some(timers.schedule(self.liveness.evasive, fired(TimerKind::Evasive)));
        self.expired_timer = Some(timers.schedule(self.liveness.expired, fired(TimerKind::Expired)));
    }

    fn cancel_timers(&mut self) {
        self.evasive_timer = None;
        self.expired_timer = None;
    }

    /// Build a read-only snapshot.
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            headers: self.headers.clone(),
            groups: self.groups.iter().cloned().collect(),
            status: self.status,
            state: self.state,
            evasive: self.is_evasive(),
            evasive_since: self.evasive_since,
            last_seen: self.last_seen,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
