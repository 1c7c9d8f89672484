//! Wire protocol I/O
//!
//! Reading and writing handshakes and framed messages over async streams.

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, trace};

use super::handshake::{Handshake, PROTOCOL_LENGTH};
use super::message::{Message, MessageId, MAX_MESSAGE_LEN};
use crate::error::TorrentError;

/// Stream-level protocol operations
pub trait WireProtocol {
    /// Read a complete message from the stream
    async fn read_message<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Message>;

    /// Write a message to the stream
    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()>;

    /// Read a handshake from the stream
    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake>;

    /// Write a handshake to the stream
    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()>;
}

/// Default implementation of WireProtocol
#[derive(Debug, Clone, Copy, Default)]
pub struct BitTorrentWire;

impl WireProtocol for BitTorrentWire {
    async fn read_message<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Message> {
        let mut length_buf = [0u8; 4];
        reader.read_exact(&mut length_buf).await?;
        let length = u32::from_be_bytes(length_buf) as usize;

        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if length > MAX_MESSAGE_LEN {
            error!("Frame of {} bytes exceeds limit of {}", length, MAX_MESSAGE_LEN);
            return Err(TorrentError::protocol_error_with_source(
                "Message too large",
                format!("{} bytes", length)
            ).into());
        }

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;
        trace!("Read frame of {} bytes", length);

        let message_id = MessageId::try_from(payload[0])?;
        Message::decode_payload(message_id, BytesMut::from(&payload[1..]))
    }

    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()> {
        let serialized = message.serialize();
        writer.write_all(&serialized).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake> {
        let mut pstrlen = [0u8; 1];
        reader.read_exact(&mut pstrlen).await?;
        if pstrlen[0] != PROTOCOL_LENGTH {
            error!("Handshake protocol length {} (expected {})", pstrlen[0], PROTOCOL_LENGTH);
            return Err(TorrentError::protocol_error_with_source(
                "Invalid handshake protocol length",
                format!("got {}", pstrlen[0]),
            )
            .into());
        }

        let mut data = vec![0u8; 1 + pstrlen[0] as usize + 48];
        data[0] = pstrlen[0];
        reader.read_exact(&mut data[1..]).await?;

        Handshake::deserialize(&data)
    }

    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        writer.write_all(&handshake.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_over_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut wire = BitTorrentWire;

        wire.write_message(&mut a, &Message::Interested).await.unwrap();
        wire.write_message(&mut a, &Message::KeepAlive).await.unwrap();
        wire.write_message(&mut a, &Message::Have { piece_index: 7 }).await.unwrap();

        assert_eq!(wire.read_message(&mut b).await.unwrap(), Message::Interested);
        assert_eq!(wire.read_message(&mut b).await.unwrap(), Message::KeepAlive);
        assert_eq!(wire.read_message(&mut b).await.unwrap(), Message::Have { piece_index: 7 });
    }

    #[tokio::test]
    async fn test_handshake_over_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut wire = BitTorrentWire;
        let handshake = Handshake::new([5u8; 20], [6u8; 20]);

        wire.write_handshake(&mut a, &handshake).await.unwrap();
        assert_eq!(wire.read_handshake(&mut b).await.unwrap(), handshake);
    }

    #[tokio::test]
    async fn test_handshake_bad_length_rejected_early() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut wire = BitTorrentWire;

        // only the length byte is sent; the rest never arrives
        a.write_all(&[200]).await.unwrap();
        let err = tokio::time::timeout(std::time::Duration::from_secs(5), wire.read_handshake(&mut b))
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.downcast_ref::<TorrentError>().is_some_and(TorrentError::is_protocol_violation));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut wire = BitTorrentWire;

        a.write_all(&((MAX_MESSAGE_LEN as u32) + 1).to_be_bytes()).await.unwrap();
        assert!(wire.read_message(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_stream_is_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut wire = BitTorrentWire;

        a.write_all(&[0, 0, 0, 5, 4, 0]).await.unwrap();
        drop(a);
        assert!(wire.read_message(&mut b).await.is_err());
    }
}
