//! Packet framing at the transport boundary
//!
//! The session core never looks at bytes. A [`Codec`] turns messages into
//! frames and back; [`PacketReader`] / [`PacketWriter`] drive it over the
//! transport's byte streams.

use super::{BoxedReader, BoxedWriter};
use crate::error::{MqttError, MqttResult};
use crate::protocol::Message;
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Largest frame body accepted, matching the protocol's remaining-length cap
pub const MAX_FRAME_SIZE: usize = 268_435_455;

const LENGTH_PREFIX: usize = 4;

/// Most buffer growth a partial frame may request at once. Larger frames
/// grow as their bytes arrive.
const MAX_RESERVE: usize = 64 * 1024;

/// Encoding boundary between messages and bytes
pub trait Codec: Send + Sync {
    fn encode(&self, message: &Message, dst: &mut BytesMut) -> MqttResult<()>;

    /// Decode one message from the front of `src`, consuming its bytes.
    /// `Ok(None)` means more bytes are needed.
    fn decode(&self, src: &mut BytesMut) -> MqttResult<Option<Message>>;
}

/// Length-prefixed JSON frames: a big-endian `u32` body length, then the
/// serde representation of the message
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFrameCodec;

impl Codec for JsonFrameCodec {
    fn encode(&self, message: &Message, dst: &mut BytesMut) -> MqttResult<()> {
        let body = serde_json::to_vec(message)
            .map_err(|e| MqttError::invalid_message(format!("encode failed: {e}")))?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(MqttError::invalid_message(format!(
                "frame of {} bytes exceeds maximum",
                body.len()
            )));
        }
        dst.reserve(LENGTH_PREFIX + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> MqttResult<Option<Message>> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(MqttError::invalid_message(format!(
                "frame length {len} exceeds maximum"
            )));
        }
        if src.len() < LENGTH_PREFIX + len {
            src.reserve((LENGTH_PREFIX + len - src.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let body = src.split_to(len);
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| MqttError::invalid_message(format!("decode failed: {e}")))
    }
}

/// Reads whole messages from the transport input stream
pub struct PacketReader {
    reader: BoxedReader,
    buffer: BytesMut,
    codec: Arc<dyn Codec>,
}

impl PacketReader {
    pub fn new(reader: BoxedReader, codec: Arc<dyn Codec>) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(4096),
            codec,
        }
    }

    /// Next message, or `None` on a clean end of stream.
    ///
    /// Cancel safe: bytes already read stay buffered for the next call.
    pub async fn read_message(&mut self) -> MqttResult<Option<Message>> {
        loop {
            if let Some(message) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(message));
            }
            let read = self.reader.read_buf(&mut self.buffer).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(MqttError::connection_lost(format!(
                    "stream ended inside a frame ({} bytes buffered)",
                    self.buffer.len()
                )));
            }
        }
    }
}

/// Writes whole messages to the transport output stream
pub struct PacketWriter {
    writer: BoxedWriter,
    buffer: BytesMut,
    codec: Arc<dyn Codec>,
}

impl PacketWriter {
    pub fn new(writer: BoxedWriter, codec: Arc<dyn Codec>) -> Self {
        Self {
            writer,
            buffer: BytesMut::with_capacity(4096),
            codec,
        }
    }

    pub async fn write_message(&mut self, message: &Message) -> MqttResult<()> {
        self.buffer.clear();
        self.codec.encode(message, &mut self.buffer)?;
        self.writer.write_all(&self.buffer).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> MqttResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Publish, QoS};

    fn publish(id: u16) -> Message {
        let mut publish = Publish::new("a/b", b"hello".to_vec(), QoS::AtLeastOnce);
        publish.message_id = id;
        Message::Publish(publish)
    }

    #[test]
    fn test_decode_waits_for_whole_frame() {
        let codec = JsonFrameCodec;
        let mut encoded = BytesMut::new();
        codec.encode(&publish(3), &mut encoded).unwrap();

        let mut partial = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);

        partial.extend_from_slice(&encoded[encoded.len() - 1..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(publish(3)));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_decode_two_frames_back_to_back() {
        let codec = JsonFrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(&Message::PingReq, &mut buf).unwrap();
        codec.encode(&Message::PubAck { message_id: 8 }, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::PingReq));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::PubAck { message_id: 8 }));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversized_length_is_invalid() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        assert!(matches!(
            JsonFrameCodec.decode(&mut buf),
            Err(MqttError::InvalidMessage { .. })
        ));
    }

    #[test]
    fn test_claimed_length_does_not_drive_allocation() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_SIZE as u32);
        buf.put_slice(b"{\"Pi");

        for _ in 0..3 {
            assert_eq!(JsonFrameCodec.decode(&mut buf).unwrap(), None);
        }

        assert!(buf.capacity() < 1024 * 1024, "capacity {}", buf.capacity());
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_garbage_body_is_invalid() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_slice(b"{{{");
        assert!(matches!(
            JsonFrameCodec.decode(&mut buf),
            Err(MqttError::InvalidMessage { .. })
        ));
    }

    #[tokio::test]
    async fn test_reader_and_writer_over_duplex() {
        let (client, server) = tokio::io::duplex(64);
        let (_, client_write) = tokio::io::split(client);
        let (server_read, _) = tokio::io::split(server);
        let codec: Arc<dyn Codec> = Arc::new(JsonFrameCodec);

        let mut writer = PacketWriter::new(Box::new(client_write), codec.clone());
        let mut reader = PacketReader::new(Box::new(server_read), codec);

        let sent = publish(11);
        let write = tokio::spawn(async move {
            writer.write_message(&sent).await.unwrap();
            writer.shutdown().await.unwrap();
        });

        assert_eq!(reader.read_message().await.unwrap(), Some(publish(11)));
        assert_eq!(reader.read_message().await.unwrap(), None);
        write.await.unwrap();
    }
}
