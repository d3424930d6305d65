//! Network error types.

use std::net::SocketAddr;

use crate::message::CodecError;

/// Errors that can occur in the hive_zre crate.
///
/// Only setup failures (binding sockets, finding an interface, reading config)
/// reach the caller of [`ZreNode::start`](crate::ZreNode::start). Malformed
/// wire data and protocol violations are handled inside the reactor.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// The inbound listener could not be bound.
    #[error("Cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The requested peer was not found in the registry.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Discovery subsystem error.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// No usable IPv4 interface matched the configuration.
    #[error("No IPv4 interface found{}", .0.as_deref().map(|n| format!(" named '{n}'")).unwrap_or_default())]
    NoInterface(Option<String>),

    /// A name or group does not fit the wire format.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Configuration could not be read or written.
    #[error("Config error: {0}")]
    Config(String),

    /// The node is not running.
    #[error("Node not running")]
    NotRunning,

    /// `start()` was called on a node that is already running.
    #[error("Node already running")]
    AlreadyRunning,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
