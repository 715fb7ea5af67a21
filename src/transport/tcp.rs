//! Plain TCP transport

use super::{BoxedReader, BoxedWriter, Transport};
use crate::error::{MqttError, MqttResult};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};
use url::Url;

/// Port used when the URI does not name one
pub const DEFAULT_PORT: u16 = 1883;

/// Split a `tcp://` or `mqtt://` URI into host and port
pub fn parse_server_uri(uri: &str) -> MqttResult<(String, u16)> {
    let url = Url::parse(uri)
        .map_err(|e| MqttError::Config(format!("invalid server URI {uri}: {e}")))?;
    match url.scheme() {
        "tcp" | "mqtt" => {}
        other => {
            return Err(MqttError::Config(format!(
                "unsupported URI scheme {other}, expected tcp:// or mqtt://"
            )))
        }
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| MqttError::Config(format!("server URI {uri} has no host")))?;
    Ok((host.to_string(), url.port().unwrap_or(DEFAULT_PORT)))
}

/// Connects a fresh TCP stream on every `start`
#[derive(Debug, Clone)]
pub struct TcpTransport {
    server_uri: String,
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(server_uri: &str, connect_timeout: Duration) -> MqttResult<Self> {
        let (host, port) = parse_server_uri(server_uri)?;
        Ok(Self {
            server_uri: server_uri.to_string(),
            host,
            port,
            connect_timeout,
        })
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn start(&self) -> MqttResult<(BoxedReader, BoxedWriter)> {
        debug!(host = %self.host, port = self.port, "Opening TCP connection");
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| {
            MqttError::connection_lost(format!("timed out connecting to {}", self.server_uri))
        })??;
        stream.set_nodelay(true)?;
        info!(server_uri = %self.server_uri, "TCP connection established");

        let (read, write) = stream.into_split();
        Ok((Box::new(read), Box::new(write)))
    }

    async fn stop(&self) -> MqttResult<()> {
        // the halves are owned by the sender and receiver and close on drop
        debug!(server_uri = %self.server_uri, "TCP transport stopped");
        Ok(())
    }

    fn server_uri(&self) -> String {
        self.server_uri.clone()
    }
}
