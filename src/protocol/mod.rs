//! Peer wire protocol module
//!
//! Handshake, message framing and the block bitfield.

pub mod bitfield;
pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use bitfield::Bitfield;
pub use handshake::{Handshake, HANDSHAKE_LEN, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId, MAX_MESSAGE_LEN};
pub use wire::{BitTorrentWire, WireProtocol};
