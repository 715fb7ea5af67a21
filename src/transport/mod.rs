//! Byte-stream transport consumed by the connection
//!
//! A transport only has to produce a duplex byte stream; framing is the
//! codec's job and everything above it is the session's.

use crate::error::MqttResult;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod codec;
pub mod tcp;

pub use codec::{Codec, JsonFrameCodec, PacketReader, PacketWriter};
pub use tcp::TcpTransport;

/// Input half handed to the receiver
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Output half handed to the sender
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport abstraction
///
/// Lets the connection run over TCP in production and over in-memory pipes
/// in tests.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open the link and hand back its two halves
    async fn start(&self) -> MqttResult<(BoxedReader, BoxedWriter)>;

    /// Tear the link down. Called once per `start`, errors are logged only.
    async fn stop(&self) -> MqttResult<()>;

    /// URI of the peer, reported to `connect_complete`
    fn server_uri(&self) -> String;
}
