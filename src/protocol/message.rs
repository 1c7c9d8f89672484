//! Peer wire messages
//!
//! Defines the ten framed message kinds of the peer protocol plus keep-alive.

use bytes::{Buf, BufMut, BytesMut};
use anyhow::Result;
use tracing::{debug, error, trace};

use crate::error::TorrentError;

/// Largest frame accepted from a peer: a 1 MiB block plus the Piece header
pub const MAX_MESSAGE_LEN: usize = (1 << 20) + 13;

/// Message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        trace!("Converting byte to MessageId: {}", value);
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            _ => {
                error!("Invalid message ID: {}", value);
                Err(TorrentError::protocol_error_with_source(
                    "Invalid message ID",
                    format!("value: {}", value)
                ).into())
            }
        }
    }
}

/// Peer protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
}

impl Message {
    /// Build a Have message, failing when the index does not fit in 4 bytes
    pub fn have(piece_index: u64) -> Result<Self> {
        let piece_index = u32::try_from(piece_index).map_err(|_| {
            error!("Piece index {} does not fit in a Have message", piece_index);
            TorrentError::protocol_error_with_source("Piece index out of range", format!("index: {}", piece_index))
        })?;
        Ok(Message::Have { piece_index })
    }

    /// Get the message ID (returns None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::KeepAlive => None,
        }
    }

    /// Get the message length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke => 1,
            Message::Unchoke => 1,
            Message::Interested => 1,
            Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Cancel { .. } => 13,
            Message::Port { .. } => 5,
        }
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing message: {:?}", self.message_id());
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);

        buf.put_u32(self.length());
        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have { piece_index } => {
                buf.put_u32(*piece_index);
            }
            Message::Bitfield { bitfield } => {
                buf.put_slice(bitfield);
            }
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => {
                buf.put_u32(*listen_port as u32);
            }
        }

        trace!("Message serialized: {} bytes", buf.len());
        buf.to_vec()
    }

    /// Deserialize a message from bytes (including length prefix)
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing message from {} bytes", data.len());

        if data.len() < 4 {
            error!("Message shorter than its length prefix: {} bytes", data.len());
            return Err(TorrentError::protocol_error_with_source(
                "Message too short",
                format!("expected at least 4 bytes, got {}", data.len())
            ).into());
        }

        let mut buf = BytesMut::from(data);
        let length = buf.get_u32() as usize;
        if length != buf.remaining() {
            error!("Length prefix {} does not match payload of {} bytes", length, buf.remaining());
            return Err(TorrentError::protocol_error_with_source(
                "Length prefix mismatch",
                format!("prefix {}, payload {}", length, buf.remaining())
            ).into());
        }

        if length == 0 {
            trace!("Received KeepAlive message");
            return Ok(Message::KeepAlive);
        }

        let id = buf.get_u8();
        let message_id = MessageId::try_from(id)?;
        Self::decode_payload(message_id, buf)
    }

    /// Decode the payload that follows a message id
    pub fn decode_payload(message_id: MessageId, mut buf: BytesMut) -> Result<Self> {
        let remaining = buf.remaining();
        let expect = |size: usize| -> Result<()> {
            if remaining == size {
                Ok(())
            } else {
                Err(payload_size_error(message_id, size, remaining))
            }
        };

        let message = match message_id {
            MessageId::Choke => {
                expect(0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect(0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect(0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect(0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect(4)?;
                Message::Have { piece_index: buf.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: buf.to_vec() },
            MessageId::Request => {
                expect(12)?;
                Message::Request { index: buf.get_u32(), begin: buf.get_u32(), length: buf.get_u32() }
            }
            MessageId::Piece => {
                if remaining < 8 {
                    return Err(payload_size_error(message_id, 8, remaining));
                }
                let index = buf.get_u32();
                let begin = buf.get_u32();
                Message::Piece { index, begin, block: buf.to_vec() }
            }
            MessageId::Cancel => {
                expect(12)?;
                Message::Cancel { index: buf.get_u32(), begin: buf.get_u32(), length: buf.get_u32() }
            }
            MessageId::Port => match remaining {
                2 => Message::Port { listen_port: buf.get_u16() },
                4 => {
                    let value = buf.get_u32();
                    let listen_port = u16::try_from(value).map_err(|_| {
                        TorrentError::protocol_error_with_source("Port out of range", format!("value: {}", value))
                    })?;
                    Message::Port { listen_port }
                }
                _ => return Err(payload_size_error(message_id, 4, remaining)),
            },
        };

        debug!("Decoded {:?}", message_id);
        Ok(message)
    }
}

fn payload_size_error(message_id: MessageId, expected: usize, got: usize) -> anyhow::Error {
    error!("{:?} payload has {} bytes, expected {}", message_id, got, expected);
    TorrentError::protocol_error_with_source(
        format!("Invalid {:?} payload size", message_id),
        format!("expected {} bytes, got {}", expected, got)
    ).into()
}
