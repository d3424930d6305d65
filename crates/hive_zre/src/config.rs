//! Configuration for a ZRE node.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;
use crate::message::{Headers, MAX_SHORT_STRING};
use crate::peer::{DEFAULT_EVASIVE_TIMEOUT, DEFAULT_EXPIRED_TIMEOUT, Liveness};

/// First mailbox port tried when binding the inbound listener.
pub const DEFAULT_MAILBOX_PORT: u16 = 49152;
/// UDP port beacons are broadcast to.
pub const DEFAULT_BEACON_PORT: u16 = 5670;
/// Interval between beacon broadcasts.
pub const DEFAULT_BEACON_INTERVAL: Duration = Duration::from_millis(1000);

/// Configuration for a ZRE node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Human-readable node name. Defaults to the first six identity bytes in
    /// hex.
    pub name: Option<String>,

    /// Free-form headers advertised in HELLO.
    pub headers: Headers,

    /// Network interface to bind to. The first non-loopback IPv4 interface
    /// is used when unset.
    pub interface: Option<String>,

    /// Explicit local address; overrides interface lookup.
    pub address: Option<Ipv4Addr>,

    /// Explicit broadcast address; otherwise derived from the interface.
    pub broadcast: Option<Ipv4Addr>,

    /// First port to try for the inbound listener (0 lets the OS choose).
    pub port: u16,

    /// Silence after which a peer is probed with PING.
    #[serde(rename = "evasive_timeout_ms", with = "duration_ms_serde")]
    pub evasive_timeout: Duration,

    /// Silence after which a peer is evicted.
    #[serde(rename = "expired_timeout_ms", with = "duration_ms_serde")]
    pub expired_timeout: Duration,

    /// Whether UDP beacon discovery runs.
    pub beacon_enabled: bool,

    /// UDP port beacons are sent to and received on (0 lets the OS choose
    /// the listen port).
    pub beacon_port: u16,

    /// Interval between beacon broadcasts.
    #[serde(rename = "beacon_interval_ms", with = "duration_ms_serde")]
    pub beacon_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            headers: Headers::new(),
            interface: None,
            address: None,
            broadcast: None,
            port: DEFAULT_MAILBOX_PORT,
            evasive_timeout: DEFAULT_EVASIVE_TIMEOUT,
            expired_timeout: DEFAULT_EXPIRED_TIMEOUT,
            beacon_enabled: true,
            beacon_port: DEFAULT_BEACON_PORT,
            beacon_interval: DEFAULT_BEACON_INTERVAL,
        }
    }
}

impl NodeConfig {
    /// Liveness deadlines applied to every peer.
    pub fn liveness(&self) -> Liveness {
        Liveness {
            evasive: self.evasive_timeout,
            expired: self.expired_timeout,
        }
    }

    /// Reject settings a node cannot run with.
    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.beacon_interval.is_zero() {
            return Err(NetworkError::Config("beacon interval must be non-zero".into()));
        }
        if self.evasive_timeout.is_zero() || self.expired_timeout.is_zero() {
            return Err(NetworkError::Config("liveness timeouts must be non-zero".into()));
        }
        if self.name.as_ref().is_some_and(|n| n.len() > MAX_SHORT_STRING) {
            return Err(NetworkError::Config("name longer than 255 bytes".into()));
        }
        if let Some(key) = self.headers.keys().find(|k| k.len() > MAX_SHORT_STRING) {
            return Err(NetworkError::Config(format!(
                "header key of {} bytes is longer than 255 bytes",
                key.len()
            )));
        }
        Ok(())
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| NetworkError::Config(format!("Failed to create directory: {e}")))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| NetworkError::Config(format!("Failed to write config file: {e}")))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NodeConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
