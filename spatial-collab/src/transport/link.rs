//! Binary link framing shared by the WebSocket transports and the relay server.
//!
//! Wire format (bincode-encoded `LinkFrame`):
//! ```text
//! ┌──────────┬────────────────────────────────────────────┐
//! │ variant  │ fields (PeerInfo / group / envelope bytes) │
//! │ varint   │ variable                                   │
//! └──────────┴────────────────────────────────────────────┘
//! ```
//!
//! Envelope bytes ride inside `Data`/`Relay` untouched; this layer never
//! looks at them.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Largest frame a link decodes. Matches the WebSocket message cap, so a
/// garbled length prefix cannot trigger a larger allocation.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_FRAME_BYTES>()
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// RGBA color for roster rendering
    pub color: [f32; 4],
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        // Stable color from peer_id hash
        let hash = peer_id.as_u128();
        let r = (hash & 0xFF) as f32 / 255.0;
        let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
        let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
        Self {
            peer_id,
            name: name.into(),
            color: [r, g, b, 1.0],
        }
    }
}

/// One frame on a WebSocket link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LinkFrame {
    /// First frame on a direct link, sent by both sides.
    Hello(PeerInfo),
    /// One encoded envelope on a direct link.
    Data(Vec<u8>),
    /// Relay: join a named group session.
    Join { group: String, peer: PeerInfo },
    /// Relay: envelope bytes fanned out to the group.
    Relay { from: PeerInfo, bytes: Vec<u8> },
    /// Relay: current member count of the group.
    Membership { count: usize },
    /// Relay: the group session was torn down by the service.
    Ended { reason: String },
}

impl LinkFrame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, LinkError> {
        bincode::serde::encode_to_vec(self, wire_config())
            .map_err(|e| LinkError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, LinkError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, wire_config())
            .map_err(|e| LinkError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LinkError {
    #[error("Link serialization error: {0}")]
    Serialization(String),
    #[error("Link deserialization error: {0}")]
    Deserialization(String),
    #[error("Link handshake failed: {0}")]
    Handshake(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_roundtrip() {
        let info = PeerInfo::new("Alice");
        let frame = LinkFrame::Hello(info.clone());
        let decoded = LinkFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, LinkFrame::Hello(info));
    }

    #[test]
    fn test_relay_frame_carries_bytes_untouched() {
        let bytes = br#"{"type":"remove","payload":{"filename":"foo"}}"#.to_vec();
        let frame = LinkFrame::Relay { from: PeerInfo::new("Bob"), bytes: bytes.clone() };
        match LinkFrame::decode(&frame.encode().unwrap()).unwrap() {
            LinkFrame::Relay { bytes: out, from } => {
                assert_eq!(out, bytes);
                assert_eq!(from.name, "Bob");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_data_frame_overhead_small() {
        let frame = LinkFrame::Data(vec![0u8; 50]);
        let encoded = frame.encode().unwrap();
        assert!(encoded.len() < 60, "Encoded size {} too large", encoded.len());
    }

    #[test]
    fn test_peer_info_stable_color() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(PeerInfo::with_id(id, "Test").color, PeerInfo::with_id(id, "Test").color);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(LinkFrame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        // Data frame claiming a 4 GiB payload
        let bytes = [1u8, 253, 0, 0, 0, 0, 1, 0, 0, 0];
        assert!(matches!(LinkFrame::decode(&bytes), Err(LinkError::Deserialization(_))));
    }
}
