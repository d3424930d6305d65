//! Node identity: the 16-byte UUID every ZRE node is known by.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Prefix byte placed before the identity when tagging outbound connections.
pub const ROUTING_TAG_PREFIX: u8 = 0x01;

/// Length of a routing tag: prefix byte plus the 16 identity bytes.
pub const ROUTING_TAG_LEN: usize = 17;

/// A unique identifier for a node, generated once per node start.
///
/// Rendered as 32 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 16]);

impl NodeId {
    /// Generate a new random identity (UUID v4 bytes).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    /// Wrap raw identity bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Build an identity from a slice, which must be exactly 16 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 16]>::try_from(bytes).ok().map(Self)
    }

    /// Return the raw identity bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The tag an outbound connection announces so the remote listener can
    /// attribute every message on it to this node.
    pub fn routing_tag(&self) -> [u8; ROUTING_TAG_LEN] {
        let mut tag = [0u8; ROUTING_TAG_LEN];
        tag[0] = ROUTING_TAG_PREFIX;
        tag[1..].copy_from_slice(&self.0);
        tag
    }

    /// Recover the sender identity from a routing tag.
    pub fn from_routing_tag(tag: &[u8]) -> Option<Self> {
        match tag.split_first() {
            Some((&ROUTING_TAG_PREFIX, rest)) => Self::from_slice(rest),
            _ => None,
        }
    }

    /// Short display name: the first six bytes in hex.
    pub fn short_name(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl FromStr for NodeId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_generation() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 32);
    }

    #[test]
    fn test_node_id_hex_parse() {
        let id: NodeId = "000102030405060708090a0b0c0d0e0f".parse().unwrap();
        assert_eq!(id.as_bytes()[15], 0x0f);
        assert_eq!(id.to_string(), "000102030405060708090a0b0c0d0e0f");
        assert_eq!(id.short_name(), "000102030405");

        assert!("abc".parse::<NodeId>().is_err());
        assert!("zz0102030405060708090a0b0c0d0e0f".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_routing_tag_roundtrip() {
        let id = NodeId::generate();
        let tag = id.routing_tag();
        assert_eq!(tag[0], ROUTING_TAG_PREFIX);
        assert_eq!(NodeId::from_routing_tag(&tag), Some(id));

        // Wrong prefix or length is not a routing tag.
        let mut bad = tag;
        bad[0] = 0x02;
        assert_eq!(NodeId::from_routing_tag(&bad), None);
        assert_eq!(NodeId::from_routing_tag(&tag[..16]), None);
        assert_eq!(NodeId::from_routing_tag(&[]), None);
    }

    #[test]
    fn test_node_id_serde_as_hex() {
        let id = NodeId::from_bytes([0xab; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(16)));
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
