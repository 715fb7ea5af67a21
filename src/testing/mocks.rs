//! Mock implementations for testing
//!
//! Provides an in-memory broker behind a mock [`Transport`], plus recording
//! implementations of the callback, listener and connection-event traits, so
//! the session machinery can be exercised without a real server.

use crate::comms::notifier::{CompletionNotifier, MqttCallback};
use crate::comms::ConnectionEvents;
use crate::error::{MqttError, MqttResult};
use crate::observability::metrics::SessionMetrics;
use crate::persistence::{MemoryPersistence, Persistence};
use crate::protocol::{ConnAck, Message, Publish, QoS, SubAck};
use crate::session::{Session, SessionOptions};
use crate::token::{ActionListener, Token, TokenRegistry};
use crate::transport::{
    BoxedReader, BoxedWriter, Codec, JsonFrameCodec, PacketReader, PacketWriter, Transport,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{watch, Notify};
use tracing::debug;

/// Client id used by the helpers below
pub const TEST_CLIENT_ID: &str = "test-client";

const PIPE_CAPACITY: usize = 64 * 1024;

/// Session wired to an opened in-memory store
pub fn test_session(max_in_flight: u16) -> (Arc<Session>, Arc<CompletionNotifier>) {
    let (session, notifier, _store) = test_session_with_persistence(max_in_flight);
    (session, notifier)
}

/// Like [`test_session`], also handing back the store for inspection
pub fn test_session_with_persistence(
    max_in_flight: u16,
) -> (Arc<Session>, Arc<CompletionNotifier>, Arc<MemoryPersistence>) {
    let store = Arc::new(MemoryPersistence::new());
    store
        .open(TEST_CLIENT_ID, "tcp://localhost:1883")
        .expect("memory store opens");
    let (session, notifier) = session_over(store.clone(), max_in_flight);
    (session, notifier, store)
}

/// Session over an arbitrary, already opened store
pub fn session_over(
    store: Arc<dyn Persistence>,
    max_in_flight: u16,
) -> (Arc<Session>, Arc<CompletionNotifier>) {
    let notifier = Arc::new(CompletionNotifier::new());
    let mut options = SessionOptions::new(TEST_CLIENT_ID);
    options.max_in_flight = max_in_flight;
    let session = Arc::new(Session::new(
        options,
        Arc::new(TokenRegistry::new()),
        store,
        notifier.clone(),
        Arc::new(SessionMetrics::new()),
    ));
    (session, notifier)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Poll `check` each time `notify` fires until it yields a value. Panics
/// with `what` once `timeout` elapses.
async fn wait_for<T>(
    notify: &Notify,
    timeout: Duration,
    what: &str,
    mut check: impl FnMut() -> Option<T>,
) -> T {
    let waiting = async {
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(value) = check() {
                return value;
            }
            notified.await;
        }
    };
    match tokio::time::timeout(timeout, waiting).await {
        Ok(value) => value,
        Err(_) => panic!("timed out after {timeout:?} waiting for {what}"),
    }
}

// ----- connection events ----------------------------------------------------

/// Records what the I/O tasks report to their connection
#[derive(Default)]
pub struct RecordingEvents {
    failures: Mutex<Vec<(bool, MqttError)>>,
    connected: AtomicUsize,
    disconnecting: AtomicBool,
    changed: Notify,
}

impl RecordingEvents {
    pub fn failures(&self) -> Vec<MqttError> {
        lock(&self.failures).iter().map(|(_, e)| e.clone()).collect()
    }

    /// First reported failure
    pub async fn wait_for_failure(&self, timeout: Duration) -> MqttError {
        wait_for(&self.changed, timeout, "connection failure", || {
            lock(&self.failures).first().map(|(_, e)| e.clone())
        })
        .await
    }

    pub fn connected_count(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether any failure was reported together with a token
    pub fn failed_with_token(&self) -> bool {
        lock(&self.failures).iter().any(|(with_token, _)| *with_token)
    }

    pub fn set_disconnecting(&self, disconnecting: bool) {
        self.disconnecting.store(disconnecting, Ordering::SeqCst);
    }
}

impl ConnectionEvents for RecordingEvents {
    fn connection_failed(&self, token: Option<Token>, error: MqttError) {
        lock(&self.failures).push((token.is_some(), error));
        self.changed.notify_waiters();
    }

    fn connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }
}

// ----- application callbacks ------------------------------------------------

/// Records every callback; optionally fails message delivery
#[derive(Default)]
pub struct RecordingCallback {
    fail_messages: bool,
    messages: Mutex<Vec<Publish>>,
    deliveries: Mutex<Vec<Token>>,
    lost: Mutex<Vec<MqttError>>,
    connects: Mutex<Vec<(bool, String)>>,
    changed: Notify,
}

impl RecordingCallback {
    /// A callback whose `message_arrived` always errors
    pub fn failing() -> Self {
        Self {
            fail_messages: true,
            ..Self::default()
        }
    }

    pub async fn wait_for_messages(&self, count: usize, timeout: Duration) -> Vec<Publish> {
        wait_for(&self.changed, timeout, "arrived messages", || {
            let messages = lock(&self.messages);
            (messages.len() >= count).then(|| messages.clone())
        })
        .await
    }

    pub async fn wait_for_deliveries(&self, count: usize, timeout: Duration) -> Vec<Token> {
        wait_for(&self.changed, timeout, "delivery completions", || {
            let deliveries = lock(&self.deliveries);
            (deliveries.len() >= count).then(|| deliveries.clone())
        })
        .await
    }

    pub async fn wait_for_connection_lost(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Vec<MqttError> {
        wait_for(&self.changed, timeout, "connection lost", || {
            let lost = lock(&self.lost);
            (lost.len() >= count).then(|| lost.clone())
        })
        .await
    }

    pub async fn wait_for_connects(&self, count: usize, timeout: Duration) -> Vec<(bool, String)> {
        wait_for(&self.changed, timeout, "connect complete", || {
            let connects = lock(&self.connects);
            (connects.len() >= count).then(|| connects.clone())
        })
        .await
    }

    pub fn connection_lost_count(&self) -> usize {
        lock(&self.lost).len()
    }

    pub fn message_count(&self) -> usize {
        lock(&self.messages).len()
    }
}

#[async_trait]
impl MqttCallback for RecordingCallback {
    async fn connection_lost(&self, cause: &MqttError) {
        lock(&self.lost).push(cause.clone());
        self.changed.notify_waiters();
    }

    async fn message_arrived(&self, _topic: &str, message: &Publish) -> MqttResult<()> {
        if self.fail_messages {
            return Err(MqttError::message_handler("handler rejected message"));
        }
        lock(&self.messages).push(message.clone());
        self.changed.notify_waiters();
        Ok(())
    }

    async fn delivery_complete(&self, token: &Token) {
        lock(&self.deliveries).push(token.clone());
        self.changed.notify_waiters();
    }

    async fn connect_complete(&self, reconnect: bool, server_uri: &str) {
        lock(&self.connects).push((reconnect, server_uri.to_string()));
        self.changed.notify_waiters();
    }
}

/// Counts listener outcomes
#[derive(Default)]
pub struct RecordingListener {
    successes: AtomicUsize,
    failures: AtomicUsize,
}

impl RecordingListener {
    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl ActionListener for RecordingListener {
    fn on_success(&self, _token: &Token) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failure(&self, _token: &Token, _error: &MqttError) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

// ----- broker ---------------------------------------------------------------

/// How the mock broker answers
#[derive(Debug, Clone)]
pub struct BrokerScript {
    /// Reply to CONNECT at all
    pub answer_connect: bool,
    /// CONNACK return code
    pub connack_code: u8,
    /// CONNACK session-present flag
    pub session_present: bool,
    /// Answer PUBLISH with PUBACK / PUBREC and PUBREL with PUBCOMP
    pub ack_publishes: bool,
    /// Answer PINGREQ with PINGRESP
    pub answer_pings: bool,
}

impl Default for BrokerScript {
    fn default() -> Self {
        Self {
            answer_connect: true,
            connack_code: 0,
            session_present: false,
            ack_publishes: true,
            answer_pings: true,
        }
    }
}

/// Scripted in-memory broker on the far end of one mock link
pub struct MockBroker {
    script: BrokerScript,
    received: Mutex<Vec<Message>>,
    changed: Notify,
    writer: tokio::sync::Mutex<Option<PacketWriter>>,
    close_tx: watch::Sender<bool>,
}

impl MockBroker {
    fn spawn(stream: DuplexStream, script: BrokerScript) -> Arc<Self> {
        let codec: Arc<dyn Codec> = Arc::new(JsonFrameCodec);
        let (read, write) = tokio::io::split(stream);
        let (close_tx, close_rx) = watch::channel(false);
        let broker = Arc::new(Self {
            script,
            received: Mutex::new(Vec::new()),
            changed: Notify::new(),
            writer: tokio::sync::Mutex::new(Some(PacketWriter::new(
                Box::new(write),
                codec.clone(),
            ))),
            close_tx,
        });

        let reader = PacketReader::new(Box::new(read), codec);
        tokio::spawn(Arc::clone(&broker).run(reader, close_rx));
        broker
    }

    async fn run(self: Arc<Self>, mut reader: PacketReader, mut close_rx: watch::Receiver<bool>) {
        loop {
            let message = tokio::select! {
                _ = close_rx.wait_for(|closed| *closed) => break,
                read = reader.read_message() => match read {
                    Ok(Some(message)) => message,
                    Ok(None) | Err(_) => break,
                },
            };
            debug!(message = %message, "Mock broker received");
            let disconnect = matches!(message, Message::Disconnect);
            let reply = self.reply_to(&message);
            lock(&self.received).push(message);
            self.changed.notify_waiters();

            if disconnect {
                break;
            }
            if let Some(reply) = reply {
                if self.send(reply).await.is_err() {
                    break;
                }
            }
        }
        // dropping both halves ends the client's stream
        self.writer.lock().await.take();
        drop(reader);
    }

    fn reply_to(&self, message: &Message) -> Option<Message> {
        let script = &self.script;
        match message {
            Message::Connect(_) if script.answer_connect => Some(Message::ConnAck(ConnAck {
                session_present: script.session_present && script.connack_code == 0,
                return_code: script.connack_code,
            })),
            Message::Publish(p) if script.ack_publishes => match p.qos {
                QoS::AtMostOnce => None,
                QoS::AtLeastOnce => Some(Message::PubAck {
                    message_id: p.message_id,
                }),
                QoS::ExactlyOnce => Some(Message::PubRec {
                    message_id: p.message_id,
                }),
            },
            Message::PubRel { message_id } if script.ack_publishes => Some(Message::PubComp {
                message_id: *message_id,
            }),
            Message::Subscribe(s) => Some(Message::SubAck(SubAck {
                message_id: s.message_id,
                granted: s.filters.iter().map(|(_, qos)| qos.as_u8()).collect(),
            })),
            Message::Unsubscribe(u) => Some(Message::UnsubAck {
                message_id: u.message_id,
            }),
            Message::PingReq if script.answer_pings => Some(Message::PingResp),
            _ => None,
        }
    }

    /// Everything the client has sent so far
    pub fn received(&self) -> Vec<Message> {
        lock(&self.received).clone()
    }

    pub async fn wait_for_messages(&self, count: usize, timeout: Duration) -> Vec<Message> {
        wait_for(&self.changed, timeout, "broker messages", || {
            let received = lock(&self.received);
            (received.len() >= count).then(|| received.clone())
        })
        .await
    }

    /// Push a message to the client
    pub async fn send(&self, message: Message) -> MqttResult<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => writer.write_message(&message).await,
            None => Err(MqttError::connection_lost("mock broker link closed")),
        }
    }

    /// Drop the link, as a broker crash would
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }
}

/// Transport whose every `start` opens a fresh link to a new [`MockBroker`]
pub struct MockTransport {
    script: Mutex<BrokerScript>,
    brokers: Mutex<Vec<Arc<MockBroker>>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    failing_starts: AtomicUsize,
}

impl MockTransport {
    pub fn new(script: BrokerScript) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            brokers: Mutex::new(Vec::new()),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            failing_starts: AtomicUsize::new(0),
        })
    }

    /// Make the next `count` starts fail as an unreachable server would
    pub fn fail_next_starts(&self, count: usize) {
        self.failing_starts.store(count, Ordering::SeqCst);
    }

    /// Script used by links opened from now on
    pub fn set_script(&self, script: BrokerScript) {
        *lock(&self.script) = script;
    }

    /// Broker behind the `index`-th successful start
    pub fn broker(&self, index: usize) -> Option<Arc<MockBroker>> {
        lock(&self.brokers).get(index).cloned()
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self) -> MqttResult<(BoxedReader, BoxedWriter)> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .failing_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(MqttError::connection_lost("mock server unreachable"));
        }

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let script = lock(&self.script).clone();
        lock(&self.brokers).push(MockBroker::spawn(server, script));

        let (read, write) = tokio::io::split(client);
        Ok((Box::new(read), Box::new(write)))
    }

    async fn stop(&self) -> MqttResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn server_uri(&self) -> String {
        "tcp://mock-broker:1883".to_string()
    }
}
