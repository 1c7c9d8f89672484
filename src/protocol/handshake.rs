//! Peer handshake
//!
//! The fixed 68-byte exchange that opens every peer connection.

use bytes::{BufMut, BytesMut};
use anyhow::Result;
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;

/// Protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total handshake size on the wire
pub const HANDSHAKE_LEN: usize = 68;

/// Client prefix for generated peer ids
const PEER_ID_PREFIX: &[u8; 8] = b"-SW0100-";

/// Handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol identifier as received
    pub protocol_id: Vec<u8>,
    /// Reserved bytes (all zero when sent by us)
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a new handshake with info_hash and peer_id
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        trace!("Creating new handshake for info_hash: {}", hex::encode(info_hash));
        Self {
            protocol_id: PROTOCOL_STRING.as_bytes().to_vec(),
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Generate a random peer ID with the client prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        info!("Generated new peer ID: {}", hex::encode(peer_id));
        peer_id
    }

    /// Serialize the handshake to bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(1 + self.protocol_id.len() + 48);
        buf.put_u8(self.protocol_id.len() as u8);
        buf.put_slice(&self.protocol_id);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        trace!("Handshake serialized: {} bytes", buf.len());
        buf.to_vec()
    }

    /// Deserialize a handshake from bytes
    ///
    /// Only the framing is checked here; see [`Handshake::validate`].
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing handshake from {} bytes", data.len());

        let pstrlen = *data.first().ok_or_else(|| TorrentError::protocol_error("Empty handshake"))? as usize;
        let expected = 1 + pstrlen + 48;
        if data.len() != expected {
            error!("Handshake has {} bytes, expected {}", data.len(), expected);
            return Err(TorrentError::protocol_error_with_source(
                "Invalid handshake length",
                format!("expected {} bytes, got {}", expected, data.len())
            ).into());
        }

        let protocol_id = data[1..1 + pstrlen].to_vec();
        let rest = &data[1 + pstrlen..];

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&rest[..8]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&rest[8..28]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&rest[28..48]);

        debug!(
            "Handshake info_hash: {}, peer_id: {}",
            hex::encode(info_hash),
            hex::encode(peer_id)
        );
        Ok(Self { protocol_id, reserved, info_hash, peer_id })
    }

    /// Check the protocol literal, the info hash and, if known, the peer id
    pub fn validate(&self, expected_info_hash: &[u8; 20], expected_peer_id: Option<&[u8; 20]>) -> Result<()> {
        if self.protocol_id.len() != PROTOCOL_LENGTH as usize || self.protocol_id != PROTOCOL_STRING.as_bytes() {
            error!(
                "Handshake validation failed: protocol {:?}",
                String::from_utf8_lossy(&self.protocol_id)
            );
            return Err(TorrentError::protocol_error_with_source(
                "Invalid protocol string",
                String::from_utf8_lossy(&self.protocol_id).to_string()
            ).into());
        }

        if self.info_hash != *expected_info_hash {
            error!(
                "Handshake validation failed: info hash mismatch (expected {}, got {})",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return Err(TorrentError::protocol_error_with_source(
                "Info hash mismatch",
                hex::encode(self.info_hash)
            ).into());
        }

        if let Some(known) = expected_peer_id {
            if self.peer_id != *known {
                error!(
                    "Handshake validation failed: peer id mismatch (expected {}, got {})",
                    hex::encode(known),
                    hex::encode(self.peer_id)
                );
                return Err(TorrentError::protocol_error_with_source(
                    "Peer id mismatch",
                    hex::encode(self.peer_id)
                ).into());
            }
        }

        debug!("Handshake validation successful");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_layout() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let serialized = handshake.serialize();
        assert_eq!(serialized.len(), HANDSHAKE_LEN);
        assert_eq!(serialized[0], 19);
        assert_eq!(&serialized[1..20], PROTOCOL_STRING.as_bytes());
        assert_eq!(&serialized[20..28], &[0u8; 8]);
        assert_eq!(&serialized[28..48], &[1u8; 20]);
        assert_eq!(&serialized[48..68], &[2u8; 20]);

        let deserialized = Handshake::deserialize(&serialized).unwrap();
        assert_eq!(deserialized, handshake);
    }

    #[test]
    fn test_generate_peer_id() {
        let peer_id = Handshake::generate_peer_id();
        assert_eq!(&peer_id[..8], PEER_ID_PREFIX);
        assert_ne!(peer_id, Handshake::generate_peer_id());
    }

    #[test]
    fn test_validate_info_hash() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(handshake.validate(&[1u8; 20], None).is_ok());
        assert!(handshake.validate(&[3u8; 20], None).is_err());
    }

    #[test]
    fn test_validate_known_peer_id() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(handshake.validate(&[1u8; 20], Some(&[2u8; 20])).is_ok());
        assert!(handshake.validate(&[1u8; 20], Some(&[9u8; 20])).is_err());
    }

    #[test]
    fn test_validate_protocol_string() {
        let mut handshake = Handshake::new([1u8; 20], [2u8; 20]);
        handshake.protocol_id = b"BitTorrent protocoL".to_vec();
        assert!(handshake.validate(&[1u8; 20], None).is_err());

        handshake.protocol_id = b"Other".to_vec();
        let parsed = Handshake::deserialize(&handshake.serialize()).unwrap();
        let err = parsed.validate(&[1u8; 20], None).unwrap_err();
        assert!(err.downcast_ref::<TorrentError>().unwrap().is_protocol_violation());
    }

    #[test]
    fn test_deserialize_wrong_length() {
        let serialized = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        assert!(Handshake::deserialize(&serialized[..67]).is_err());
        assert!(Handshake::deserialize(&[]).is_err());
    }
}
