//! Client façade
//!
//! [`MqttClient`] turns a [`ClientConfig`] into a running [`Connection`] and
//! exposes the operations applications call: connect, publish, subscribe,
//! unsubscribe, disconnect and close. Every operation returns a [`Token`]
//! or waits on one; the session and the comms tasks do the actual work.

use crate::comms::connection::{Connection, ConnectionOptions, ConnectionState};
use crate::comms::notifier::MqttCallback;
use crate::config::{ClientConfig, PersistenceKind};
use crate::error::{MqttError, MqttResult};
use crate::observability::metrics::MetricsSnapshot;
use crate::persistence::{FilePersistence, MemoryPersistence, Persistence};
use crate::protocol::{Connect, Message, Publish, QoS, Subscribe, Unsubscribe};
use crate::token::Token;
use crate::transport::{JsonFrameCodec, TcpTransport, Transport};
use std::sync::Arc;
use tracing::{info, warn};

/// MQTT client bound to one server and client id
pub struct MqttClient {
    config: ClientConfig,
    connection: Connection,
}

impl MqttClient {
    /// Client over TCP, with the store the configuration names
    pub fn new(config: ClientConfig) -> MqttResult<Self> {
        let transport = Arc::new(TcpTransport::new(
            &config.connection.server_uri,
            config.connection_timeout(),
        )?);
        let persistence = persistence_for(&config)?;
        Self::with_transport(config, transport, persistence)
    }

    /// Client over an arbitrary transport and store
    pub fn with_transport(
        mut config: ClientConfig,
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn Persistence>,
    ) -> MqttResult<Self> {
        config.ensure_client_id();
        config.validate()?;

        let options = ConnectionOptions {
            client_id: config.connection.client_id.clone(),
            max_in_flight: config.connection.max_in_flight,
            buffer: config.buffer.clone(),
            manual_acks: config.connection.manual_acks,
        };
        let connection = Connection::new(options, transport, Arc::new(JsonFrameCodec), persistence);
        Ok(Self { config, connection })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn client_id(&self) -> &str {
        self.connection.client_id()
    }

    pub fn server_uri(&self) -> String {
        self.connection.server_uri()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Underlying orchestrator, for callers that need the lower-level API
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn set_callback(&self, callback: Option<Arc<dyn MqttCallback>>) {
        self.connection.set_callback(callback);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.connection.metrics().snapshot()
    }

    /// Delivery tokens for publishes not yet complete, including any
    /// restored from the store
    pub fn pending_delivery_tokens(&self) -> Vec<Token> {
        self.connection.tokens().outstanding_delivery_tokens()
    }

    fn connect_message(&self) -> MqttResult<Connect> {
        let section = &self.config.connection;
        let mut connect = Connect::new(
            section.client_id.clone(),
            section.clean_session,
            section.keep_alive_secs,
        );
        connect.username = section.username.clone();
        connect.password = self.config.password()?.map(String::into_bytes);
        Ok(connect)
    }

    /// Connect and wait for the CONNACK, bounded by the configured
    /// connection timeout
    #[tracing::instrument(name = "connect", skip(self), fields(client_id = %self.client_id()))]
    pub async fn connect(&self) -> MqttResult<()> {
        let token = Token::new();
        self.connection.connect(self.connect_message()?, &token).await?;

        match token
            .wait_for_completion(Some(self.config.connection_timeout()))
            .await
        {
            Ok(_) => {
                info!(client_id = %self.client_id(), server_uri = %self.server_uri(), "Connected");
                Ok(())
            }
            Err(MqttError::ClientTimeout) => {
                warn!(
                    timeout_secs = self.config.connection.connection_timeout_secs,
                    "No CONNACK within connection timeout"
                );
                self.connection
                    .shutdown_connection(Some(token), Some(MqttError::ClientTimeout))
                    .await;
                Err(MqttError::ClientTimeout)
            }
            Err(e) => Err(e),
        }
    }

    /// Queue a publish. The returned token completes when the QoS
    /// handshake finishes (QoS 0: once written).
    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> MqttResult<Token> {
        let publish = Publish::new(topic, payload, qos).with_retain(retain);
        let token = Token::delivery();
        self.connection
            .send_no_wait(Message::Publish(publish), &token)?;
        Ok(token)
    }

    /// Subscribe to `filters`; the token carries the granted QoS codes
    pub fn subscribe(&self, filters: &[(&str, QoS)]) -> MqttResult<Token> {
        let token = Token::new();
        token.set_topics(filters.iter().map(|(f, _)| f.to_string()).collect());
        let subscribe = Subscribe {
            message_id: 0,
            filters: filters.iter().map(|(f, q)| (f.to_string(), *q)).collect(),
        };
        self.connection
            .send_no_wait(Message::Subscribe(subscribe), &token)?;
        Ok(token)
    }

    pub fn unsubscribe(&self, filters: &[&str]) -> MqttResult<Token> {
        let token = Token::new();
        let topics: Vec<String> = filters.iter().map(|f| f.to_string()).collect();
        token.set_topics(topics.clone());
        self.connection.send_no_wait(
            Message::Unsubscribe(Unsubscribe {
                message_id: 0,
                filters: topics,
            }),
            &token,
        )?;
        Ok(token)
    }

    /// Acknowledge a message delivered with manual acks enabled
    pub fn message_arrived_complete(&self, message_id: u16, qos: QoS) -> MqttResult<()> {
        self.connection.message_arrived_complete(message_id, qos)
    }

    /// Orderly disconnect using the configured quiesce and disconnect
    /// timeouts
    pub async fn disconnect(&self) -> MqttResult<()> {
        let token = Token::new();
        self.connection
            .disconnect(
                self.config.quiesce_timeout(),
                self.config.disconnect_timeout(),
                &token,
            )
            .await
    }

    pub async fn disconnect_forcibly(&self) -> MqttResult<()> {
        self.connection
            .disconnect_forcibly(self.config.quiesce_timeout(), self.config.disconnect_timeout())
            .await
    }

    pub async fn close(&self, force: bool) -> MqttResult<()> {
        self.connection.close(force).await
    }
}

fn persistence_for(config: &ClientConfig) -> MqttResult<Arc<dyn Persistence>> {
    match config.persistence.kind {
        PersistenceKind::Memory => Ok(Arc::new(MemoryPersistence::new())),
        PersistenceKind::File => {
            let directory = config.persistence.directory.clone().ok_or_else(|| {
                MqttError::Config("file persistence requires a directory".to_string())
            })?;
            Ok(Arc::new(FilePersistence::new(directory)))
        }
    }
}
