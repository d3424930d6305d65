//! Hive ZRE: zero-configuration peer discovery and group messaging.
//!
//! Nodes on a local network find each other through UDP beacons, connect on
//! first contact, introduce themselves with HELLO and then exchange
//! point-to-point (WHISPER) and group (SHOUT) messages. Peers that go quiet
//! are probed and eventually evicted.
//!
//! # Architecture
//!
//! - **Codec** ([`message`]): fixed big-endian binary wire format.
//! - **Peers** ([`peer`], [`peers`]): per-peer state machine with sequence
//!   checking and liveness timers, owned by a registry.
//! - **Groups** ([`group`]): named peer sets, kept consistent with each
//!   peer's own group list.
//! - **Discovery** ([`beacon`]): 22-byte UDP beacons.
//! - **Transport** ([`transport`]): WebSocket channels tagged with the
//!   sender's identity (via `tokio-tungstenite`).
//! - **Engine** ([`engine`]): protocol dispatch, driven by a single reactor
//!   task per node ([`node`]).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use hive_zre::{NodeConfig, ZreEvent, ZreNode};
//!
//! # async fn example() -> Result<(), hive_zre::NetworkError> {
//! let mut node = ZreNode::new(NodeConfig::default());
//! let mut events = node.start().await?;
//! node.join("CHAT").await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ZreEvent::Shout { name, content, .. } = event {
//!         println!("{name}: {}", String::from_utf8_lossy(&content));
//!         node.shout("CHAT", "hello back").await?;
//!     }
//! }
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod beacon;
pub mod config;
pub mod engine;
pub mod error;
pub mod group;
pub mod identity;
pub mod iface;
pub mod message;
pub mod node;
pub mod peer;
pub mod peers;
pub mod timer;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::NodeConfig;
pub use engine::ZreEvent;
pub use error::NetworkError;
pub use group::GroupInfo;
pub use identity::NodeId;
pub use message::{CodecError, Headers, Message, MessageKind};
pub use node::ZreNode;
pub use peer::{PeerInfo, PeerState};
