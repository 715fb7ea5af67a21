//! Connection orchestrator
//!
//! Owns the lifecycle state machine
//! (`Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected`,
//! with `Closed` terminal) and wires transport, receiver, sender, completion
//! notifier and pinger together for one connection at a time.
//!
//! Every connection-fatal error, whatever task raised it, ends up in
//! [`Connection::shutdown_connection`]. Concurrent callers collapse into a
//! single teardown.

use super::buffer::{BufferOptions, BufferedMessage, DisconnectedBuffer};
use super::notifier::{CompletionNotifier, MqttCallback};
use super::{in_callback, pinger, receiver, sender, ConnectionEvents, FailureHook, TaskHandle};
use crate::error::{MqttError, MqttResult};
use crate::observability::metrics::SessionMetrics;
use crate::persistence::Persistence;
use crate::protocol::{Connect, Message, QoS, CONNECT_KEY, DISCONNECT_KEY};
use crate::session::{Session, SessionOptions, DEFAULT_MAX_IN_FLIGHT};
use crate::token::{Token, TokenRegistry};
use crate::transport::{Codec, PacketReader, PacketWriter, Transport};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

/// How often a buffer drain re-checks a full in-flight window
const DRAIN_RECHECK: Duration = Duration::from_millis(50);

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Per-client settings fixed for the lifetime of a [`Connection`]
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub client_id: String,
    pub max_in_flight: u16,
    pub buffer: BufferOptions,
    pub manual_acks: bool,
}

impl ConnectionOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            buffer: BufferOptions::default(),
            manual_acks: false,
        }
    }
}

#[derive(Default)]
struct ConnectionTasks {
    receiver: Option<TaskHandle>,
    sender: Option<TaskHandle>,
    pinger: Option<TaskHandle>,
    drain: Option<TaskHandle>,
}

struct ConnectionCore {
    me: Weak<ConnectionCore>,
    client_id: String,
    session: Arc<Session>,
    tokens: Arc<TokenRegistry>,
    notifier: Arc<CompletionNotifier>,
    persistence: Arc<dyn Persistence>,
    metrics: Arc<SessionMetrics>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    buffer: Option<Arc<DisconnectedBuffer>>,
    state_tx: watch::Sender<ConnectionState>,
    tasks: Mutex<ConnectionTasks>,
    stopping: AtomicBool,
    close_pending: AtomicBool,
    ever_connected: AtomicBool,
    restored: AtomicBool,
}

/// One client's connection to a server
pub struct Connection {
    core: Arc<ConnectionCore>,
}

impl Connection {
    pub fn new(
        options: ConnectionOptions,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let tokens = Arc::new(TokenRegistry::new());
        let notifier = Arc::new(CompletionNotifier::new());
        notifier.set_manual_acks(options.manual_acks);
        let metrics = Arc::new(SessionMetrics::new());

        let mut session_options = SessionOptions::new(options.client_id.clone());
        session_options.max_in_flight = options.max_in_flight;
        let session = Arc::new(Session::new(
            session_options,
            tokens.clone(),
            persistence.clone(),
            notifier.clone(),
            metrics.clone(),
        ));

        let buffer = options
            .buffer
            .enabled
            .then(|| Arc::new(DisconnectedBuffer::new(options.buffer.clone())));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let core = Arc::new_cyclic(|me| ConnectionCore {
            me: me.clone(),
            client_id: options.client_id,
            session,
            tokens,
            notifier,
            persistence,
            metrics,
            transport,
            codec,
            buffer,
            state_tx,
            tasks: Mutex::new(ConnectionTasks::default()),
            stopping: AtomicBool::new(false),
            close_pending: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            restored: AtomicBool::new(false),
        });
        Self { core }
    }

    pub fn client_id(&self) -> &str {
        &self.core.client_id
    }

    pub fn server_uri(&self) -> String {
        self.core.transport.server_uri()
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.core.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.core.session
    }

    pub fn tokens(&self) -> &Arc<TokenRegistry> {
        &self.core.tokens
    }

    pub fn metrics(&self) -> &Arc<SessionMetrics> {
        &self.core.metrics
    }

    pub fn set_callback(&self, callback: Option<Arc<dyn MqttCallback>>) {
        self.core.notifier.set_callback(callback);
    }

    pub fn set_manual_acks(&self, manual: bool) {
        self.core.notifier.set_manual_acks(manual);
    }

    /// Publishes waiting in the offline buffer
    pub fn buffered_count(&self) -> usize {
        self.core.buffer.as_ref().map_or(0, |b| b.len())
    }

    /// Start a connection attempt. Completion is reported through `token`
    /// once the CONNACK arrives.
    pub async fn connect(&self, connect: Connect, token: &Token) -> MqttResult<()> {
        self.core.connect(connect, token).await
    }

    /// Hand `message` to the session now, buffer it while offline, or fail
    /// with `NotConnected`
    pub fn send_no_wait(&self, message: Message, token: &Token) -> MqttResult<Message> {
        self.core.send_no_wait(message, token)
    }

    /// Acknowledge an inbound publish delivered with manual acks enabled
    pub fn message_arrived_complete(&self, message_id: u16, qos: QoS) -> MqttResult<()> {
        self.core.session.message_arrived_complete(message_id, qos)
    }

    /// Orderly disconnect: drain in-flight work for up to `quiesce_timeout`,
    /// send DISCONNECT, wait up to `disconnect_timeout` for it to be
    /// written, then shut down
    pub async fn disconnect(
        &self,
        quiesce_timeout: Duration,
        disconnect_timeout: Duration,
        token: &Token,
    ) -> MqttResult<()> {
        self.core
            .disconnect(quiesce_timeout, disconnect_timeout, token)
            .await
    }

    /// Disconnect regardless of state, ignoring failures along the way
    pub async fn disconnect_forcibly(
        &self,
        quiesce_timeout: Duration,
        disconnect_timeout: Duration,
    ) -> MqttResult<()> {
        self.core
            .disconnect_forcibly(quiesce_timeout, disconnect_timeout)
            .await
    }

    /// Tear the current connection down. Idempotent; concurrent callers
    /// wait for the one teardown in progress.
    pub async fn shutdown_connection(&self, token: Option<Token>, reason: Option<MqttError>) {
        self.core.shutdown(token, reason).await;
    }

    /// Release the client for good.
    ///
    /// Without `force` this refuses while connecting or connected and, while
    /// a disconnect is in progress, closes once it finishes.
    pub async fn close(&self, force: bool) -> MqttResult<()> {
        self.core.close(force).await
    }
}

impl ConnectionCore {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
        }
    }

    /// Move to `to` if `check` accepts the current state
    fn begin(
        &self,
        to: ConnectionState,
        check: impl FnOnce(ConnectionState) -> MqttResult<()>,
    ) -> MqttResult<ConnectionState> {
        let mut outcome = Err(MqttError::unexpected("state transition not evaluated"));
        self.state_tx.send_if_modified(|state| {
            let from = *state;
            match check(from) {
                Ok(()) => {
                    *state = to;
                    outcome = Ok(from);
                    from != to
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });
        if let Ok(from) = &outcome {
            debug!(from = %from, to = %to, "Connection state changed");
        }
        outcome
    }

    fn tasks(&self) -> MutexGuard<'_, ConnectionTasks> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn events(&self) -> Option<Arc<dyn ConnectionEvents>> {
        self.me
            .upgrade()
            .map(|core| core as Arc<dyn ConnectionEvents>)
    }

    fn failure_hook(&self) -> FailureHook {
        let me = self.me.clone();
        Arc::new(move |error| {
            if let Some(core) = me.upgrade() {
                core.spawn_shutdown(None, Some(error));
            }
        })
    }

    /// Run the shutdown on its own task so the failing actor is free to exit
    fn spawn_shutdown(&self, token: Option<Token>, reason: Option<MqttError>) {
        let Some(core) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move { core.shutdown(token, reason).await });
    }

    // ----- connect ----------------------------------------------------------

    async fn connect(&self, connect: Connect, token: &Token) -> MqttResult<()> {
        token.set_client(&self.client_id)?;
        let began = self.begin(ConnectionState::Connecting, |from| match from {
            ConnectionState::Disconnected => Ok(()),
            ConnectionState::Connecting => Err(MqttError::ConnectInProgress),
            ConnectionState::Connected => Err(MqttError::AlreadyConnected),
            ConnectionState::Disconnecting => Err(MqttError::Disconnecting),
            ConnectionState::Closed => Err(MqttError::ClientClosed),
        });
        if let Err(e) = began {
            token.clear_client();
            return Err(e);
        }

        let server_uri = self.transport.server_uri();
        info!(
            client_id = %self.client_id,
            server_uri = %server_uri,
            clean_session = connect.clean_session,
            keep_alive_secs = connect.keep_alive_secs,
            "Connecting"
        );
        self.metrics.record_connection_attempt();

        let (reader, writer) = match self.open_link(&connect, &server_uri).await {
            Ok(link) => link,
            Err(e) => {
                warn!(error = %e, "Connect failed before CONNECT was queued");
                token.clear_client();
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let Some(events) = self.events() else {
            return Err(MqttError::ClientClosed);
        };
        {
            let mut tasks = self.tasks();
            tasks.receiver = Some(receiver::spawn(self.session.clone(), reader, events.clone()));
            tasks.sender = Some(sender::spawn(self.session.clone(), writer, events));
        }
        self.notifier
            .start(self.session.clone(), self.failure_hook());

        if let Err(e) = self.session.send(Message::Connect(connect), Some(token)) {
            error!(error = %e, "Failed to queue CONNECT");
            self.shutdown(Some(token.clone()), Some(e.clone())).await;
            return Err(e);
        }
        Ok(())
    }

    /// Open the durable store, restore state when resuming a session, then
    /// start the transport
    async fn open_link(
        &self,
        connect: &Connect,
        server_uri: &str,
    ) -> MqttResult<(PacketReader, PacketWriter)> {
        self.persistence.open(&self.client_id, server_uri)?;
        self.tokens.open();

        let link = async {
            if !connect.clean_session {
                self.restore_once()?;
                // deliveries failed by the last shutdown resume on this link
                for token in self.tokens.outstanding_delivery_tokens() {
                    token.clear_error();
                }
            }
            let (reader, writer) = self.transport.start().await?;
            Ok((
                PacketReader::new(reader, self.codec.clone()),
                PacketWriter::new(writer, self.codec.clone()),
            ))
        }
        .await;

        if link.is_err() {
            self.close_store();
        }
        link
    }

    /// Load saved state into the session the first time it is needed
    fn restore_once(&self) -> MqttResult<()> {
        if self.restored.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.session.restore_state().map_err(|e| {
            self.restored.store(false, Ordering::SeqCst);
            e
        })
    }

    /// Close the durable store unless buffered publishes still live in it
    fn close_store(&self) {
        if self
            .buffer
            .as_ref()
            .is_some_and(|b| b.options().persist && !b.is_empty())
        {
            debug!("Persistence kept open for buffered publishes");
            return;
        }
        if let Err(e) = self.persistence.close() {
            debug!(error = %e, "Failed to close persistence");
        }
    }

    // ----- send -------------------------------------------------------------

    fn internal_send(&self, message: Message, token: &Token) -> MqttResult<Message> {
        match self.session.send(message, Some(token)) {
            Ok(queued) => Ok(queued),
            Err(e) => {
                token.clear_client();
                Err(e)
            }
        }
    }

    fn send_no_wait(&self, message: Message, token: &Token) -> MqttResult<Message> {
        let state = self.state();
        let sendable = match state {
            ConnectionState::Connected => true,
            ConnectionState::Disconnecting => matches!(message, Message::Disconnect),
            _ => false,
        };

        token.set_client(&self.client_id)?;
        let is_publish = message.as_publish().is_some();

        if sendable {
            match &self.buffer {
                // keep buffered publishes ahead of new ones
                Some(buffer) if is_publish && !buffer.is_empty() => {
                    self.buffer_message(buffer, message, token)
                }
                _ => self.internal_send(message, token),
            }
        } else {
            match (&self.buffer, state) {
                (Some(buffer), ConnectionState::Disconnected | ConnectionState::Connecting)
                    if is_publish =>
                {
                    self.buffer_message(buffer, message, token)
                }
                (_, ConnectionState::Closed) => {
                    token.clear_client();
                    Err(MqttError::ClientClosed)
                }
                _ => {
                    token.clear_client();
                    Err(MqttError::NotConnected)
                }
            }
        }
    }

    fn buffer_message(
        &self,
        buffer: &DisconnectedBuffer,
        message: Message,
        token: &Token,
    ) -> MqttResult<Message> {
        let stored = if buffer.options().persist {
            // saved state claims its ids before buffered publishes take theirs
            self.persistence
                .open(&self.client_id, &self.transport.server_uri())
                .map_err(MqttError::from)
                .and_then(|()| self.restore_once())
        } else {
            Ok(())
        };
        stored
            .and_then(|()| buffer.put(&self.session, message, token.clone()))
            .map_err(|e| {
                token.clear_client();
                e
            })
    }

    fn spawn_drain(&self) -> Option<TaskHandle> {
        let buffer = self.buffer.as_ref().filter(|b| !b.is_empty())?.clone();
        let core = self.me.upgrade()?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let span = crate::comms_span!(task = "buffer-drain");
        let handle = tokio::spawn(drain_buffer(core, buffer, stop_rx).instrument(span));
        Some(TaskHandle::new("buffer-drain", stop_tx, handle))
    }

    // ----- disconnect -------------------------------------------------------

    async fn disconnect(
        &self,
        quiesce_timeout: Duration,
        disconnect_timeout: Duration,
        token: &Token,
    ) -> MqttResult<()> {
        if in_callback() {
            return Err(MqttError::DisconnectProhibited);
        }
        token.set_client(&self.client_id)?;
        let began = self.begin(ConnectionState::Disconnecting, |from| match from {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Disconnected => Err(MqttError::AlreadyDisconnected),
            ConnectionState::Disconnecting => Err(MqttError::Disconnecting),
            ConnectionState::Connecting => Err(MqttError::ConnectInProgress),
            ConnectionState::Closed => Err(MqttError::ClientClosed),
        });
        if let Err(e) = began {
            token.clear_client();
            return Err(e);
        }

        info!(quiesce_ms = quiesce_timeout.as_millis() as u64, "Disconnecting");
        self.session.quiesce(quiesce_timeout).await;
        self.send_disconnect(token, disconnect_timeout).await;
        token.mark_complete(None, None);
        self.shutdown(Some(token.clone()), None).await;
        Ok(())
    }

    async fn send_disconnect(&self, token: &Token, timeout: Duration) {
        let sent = match self.session.send(Message::Disconnect, Some(token)) {
            Ok(_) => token.wait_until_sent(timeout).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            debug!(error = %e, "DISCONNECT not written");
        }
    }

    async fn disconnect_forcibly(
        &self,
        quiesce_timeout: Duration,
        disconnect_timeout: Duration,
    ) -> MqttResult<()> {
        if in_callback() {
            return Err(MqttError::DisconnectProhibited);
        }
        let from = self.begin(ConnectionState::Disconnecting, |from| match from {
            ConnectionState::Closed => Err(MqttError::ClientClosed),
            _ => Ok(()),
        })?;
        if from == ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
            return Ok(());
        }

        info!("Disconnecting forcibly");
        if !quiesce_timeout.is_zero() {
            self.session.quiesce(quiesce_timeout).await;
        }
        let token = Token::new();
        if from == ConnectionState::Connected && !disconnect_timeout.is_zero() {
            self.send_disconnect(&token, disconnect_timeout).await;
        }
        token.mark_complete(None, None);
        self.shutdown(Some(token), None).await;
        Ok(())
    }

    // ----- shutdown ---------------------------------------------------------

    async fn shutdown(&self, token: Option<Token>, reason: Option<MqttError>) {
        if self
            .stopping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Shutdown already in progress");
            self.wait_until_down().await;
            return;
        }

        let previous = self.state();
        if matches!(previous, ConnectionState::Disconnected | ConnectionState::Closed) {
            self.stopping.store(false, Ordering::SeqCst);
            return;
        }
        self.set_state(ConnectionState::Disconnecting);
        match &reason {
            Some(e) => warn!(error = %e, state = %previous, "Shutting down connection"),
            None => info!(state = %previous, "Shutting down connection"),
        }

        let tasks = std::mem::take(&mut *self.tasks());
        // frees any token lock the sender holds across a write
        if let Some(sender) = &tasks.sender {
            sender.signal();
        }
        if let Some(drain) = tasks.drain {
            drain.stop().await;
        }

        self.notifier.stop().await;
        if let Err(e) = self.transport.stop().await {
            debug!(error = %e, "Transport stop failed");
        }
        if let Some(receiver) = tasks.receiver {
            receiver.stop().await;
        }

        self.tokens
            .quiesce(reason.clone().unwrap_or(MqttError::Disconnecting));
        let deferred = self.handle_old_tokens(token, reason.clone()).await;

        self.session.disconnected(reason.as_ref());
        if let Some(sender) = tasks.sender {
            sender.stop().await;
        }
        if let Some(pinger) = tasks.pinger {
            pinger.stop().await;
        }
        self.close_store();

        let close = self.close_pending.swap(false, Ordering::SeqCst);
        self.stopping.store(false, Ordering::SeqCst);
        if close {
            self.finish_close();
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
        info!("Connection shut down");

        for token in deferred {
            self.notify_old_token(&token, reason.clone()).await;
        }

        match (&reason, previous) {
            (Some(cause), ConnectionState::Connected) => {
                self.metrics.record_connection_lost();
                self.notifier.connection_lost(cause).await;
            }
            _ => self.metrics.mark_disconnected(),
        }
    }

    /// Fail what is still outstanding and notify it, except the CONNECT /
    /// DISCONNECT tokens and `token`, which are returned for notification
    /// once the connection is down
    async fn handle_old_tokens(
        &self,
        token: Option<Token>,
        reason: Option<MqttError>,
    ) -> Vec<Token> {
        let outstanding = self.session.resolve_old_tokens(reason).await;
        let mut deferred = Vec::new();
        for old in outstanding {
            let key = old.key();
            let is_passed = token.as_ref().is_some_and(|t| t.same_as(&old));
            if is_passed || key == CONNECT_KEY || key == DISCONNECT_KEY {
                deferred.push(old);
            } else if old.is_complete_pending() || old.error().is_some() {
                self.notifier.handle_action_complete(&self.session, &old).await;
            }
        }
        if let Some(token) = token {
            if !deferred.iter().any(|d| d.same_as(&token)) {
                deferred.push(token);
            }
        }
        deferred
    }

    async fn notify_old_token(&self, token: &Token, reason: Option<MqttError>) {
        if !token.is_complete() && !token.is_complete_pending() && token.error().is_none() {
            token.set_error(reason.unwrap_or(MqttError::Disconnecting));
        }
        self.notifier.handle_action_complete(&self.session, token).await;
    }

    async fn wait_until_down(&self) {
        let mut state_rx = self.state_tx.subscribe();
        let stopping = &self.stopping;
        let _ = state_rx
            .wait_for(|state| {
                !stopping.load(Ordering::SeqCst)
                    && matches!(state, ConnectionState::Disconnected | ConnectionState::Closed)
            })
            .await;
    }

    // ----- close ------------------------------------------------------------

    async fn close(&self, force: bool) -> MqttResult<()> {
        match self.state() {
            ConnectionState::Closed => return Ok(()),
            ConnectionState::Disconnected => {}
            ConnectionState::Connecting if !force => return Err(MqttError::ConnectInProgress),
            ConnectionState::Connected if !force => return Err(MqttError::AlreadyConnected),
            ConnectionState::Disconnecting if !force => {
                debug!("Close deferred until disconnect completes");
                self.close_pending.store(true, Ordering::SeqCst);
                return Ok(());
            }
            _ => {
                if in_callback() {
                    return Err(MqttError::DisconnectProhibited);
                }
                self.close_pending.store(true, Ordering::SeqCst);
                self.shutdown(None, None).await;
            }
        }
        self.finish_close();
        Ok(())
    }

    fn finish_close(&self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        if let Some(buffer) = &self.buffer {
            for entry in buffer.clear(&self.session) {
                entry.token.mark_complete(None, Some(MqttError::ClientClosed));
                entry.token.notify_complete();
            }
        }
        if let Err(e) = self.persistence.close() {
            debug!(error = %e, "Failed to close persistence");
        }
        self.session.close();
        self.close_pending.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Closed);
        info!(client_id = %self.client_id, "Client closed");
    }
}

impl ConnectionEvents for ConnectionCore {
    fn connection_failed(&self, token: Option<Token>, error: MqttError) {
        self.spawn_shutdown(token, Some(error));
    }

    fn connected(&self) {
        let began = self.begin(ConnectionState::Connected, |from| match from {
            ConnectionState::Connecting => Ok(()),
            other => Err(MqttError::unexpected(format!("CONNACK while {other}"))),
        });
        if let Err(e) = began {
            warn!(error = %e, "Ignoring late CONNACK");
            return;
        }

        let reconnect = self.ever_connected.swap(true, Ordering::SeqCst);
        self.metrics.record_connection_established();
        info!(client_id = %self.client_id, reconnect, "Connected");

        if let Some(events) = self.events() {
            let pinger = pinger::spawn(self.session.clone(), events);
            let drain = self.spawn_drain();
            let mut tasks = self.tasks();
            tasks.pinger = pinger;
            tasks.drain = drain;
        }
        self.notifier
            .connect_complete(reconnect, self.transport.server_uri());
    }

    fn is_disconnecting(&self) -> bool {
        self.state() == ConnectionState::Disconnecting
    }
}

/// Feed offline publishes into the session once connected, waiting for
/// window space rather than failing
async fn drain_buffer(
    core: Arc<ConnectionCore>,
    buffer: Arc<DisconnectedBuffer>,
    mut stop_rx: watch::Receiver<bool>,
) {
    debug!(buffered = buffer.len(), "Draining offline buffer");
    while let Some(entry) = buffer.pop() {
        loop {
            if *stop_rx.borrow() || core.state() != ConnectionState::Connected {
                debug!(remaining = buffer.len() + 1, "Buffer drain interrupted");
                buffer.push_front(entry);
                return;
            }
            if !core.session.window_full() {
                break;
            }
            tokio::select! {
                _ = stop_rx.changed() => {}
                _ = tokio::time::sleep(DRAIN_RECHECK) => {}
            }
        }

        let BufferedMessage { message, token } = entry;
        let buffered_id = message.message_id();
        let mut fresh = message.clone();
        // ids handed out while offline may not survive a clean-session CONNACK
        fresh.set_message_id(0);

        match core.internal_send(fresh, &token) {
            Ok(sent) => {
                if buffered_id != 0 {
                    core.session.unpersist_buffered(buffered_id);
                    if sent.message_id() != buffered_id {
                        core.session.release_message_id(buffered_id);
                    }
                }
                debug!(message_id = sent.message_id(), "Sent buffered publish");
            }
            Err(MqttError::MaxInFlight { .. }) => {
                buffer.push_front(BufferedMessage { message, token });
            }
            Err(e) => {
                warn!(error = %e, "Dropping buffered publish");
                if buffered_id != 0 {
                    core.session.unpersist_buffered(buffered_id);
                    core.session.release_message_id(buffered_id);
                }
                core.session.notify_result(None, &token, Some(e));
            }
        }
    }
    debug!("Offline buffer drained");
}
