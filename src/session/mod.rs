//! Session state machine
//!
//! Owns message-id allocation, the outbound / inbound in-flight tables, the
//! send queues, in-flight window admission and keep-alive bookkeeping. The
//! sender, receiver and notifier tasks only touch this state through the
//! methods below, each of which takes the single session lock for its
//! critical section. The lock is a `std::sync::Mutex` and is never held
//! across an `.await`.
//!
//! Lock order: token processing lock, then session lock, then registry /
//! token state locks.

use crate::comms::notifier::CompletionNotifier;
use crate::error::{MqttError, MqttResult};
use crate::observability::metrics::SessionMetrics;
use crate::persistence::{key_for, Persistence, RecordKind};
use crate::protocol::{Message, Publish, QoS};
use crate::token::{Token, TokenRegistry};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub mod keepalive;
pub mod message_ids;
pub mod reorder;

use keepalive::{ActivityDecision, ActivitySnapshot, KeepAliveMonitor};
use message_ids::MessageIdAllocator;

/// Default in-flight window
pub const DEFAULT_MAX_IN_FLIGHT: u16 = 10;

/// Static per-client session settings
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_id: String,
    pub max_in_flight: u16,
    pub clean_session: bool,
    pub keep_alive: Duration,
}

impl SessionOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            clean_session: true,
            keep_alive: Duration::from_secs(60),
        }
    }
}

/// Result of one keep-alive check
#[derive(Debug, Clone)]
pub struct KeepAliveStep {
    /// Token of the PINGREQ queued by this check
    pub ping: Option<Token>,
    /// When to check again; `None` once keep-alive is disabled
    pub next_check: Option<Duration>,
}

/// Point-in-time view of the session tables, for tests and diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub connected: bool,
    pub quiescing: bool,
    pub actual_in_flight: u16,
    pub in_flight_pubrels: u16,
    pub pending_messages: Vec<u16>,
    pub pending_flows: Vec<String>,
    pub outbound_qos0: usize,
    pub outbound_qos1: usize,
    pub outbound_qos2: usize,
    pub inbound_qos2: usize,
    pub ids_in_use: usize,
    pub pings_outstanding: u32,
}

struct SessionState {
    ids: MessageIdAllocator,
    /// Publish until PUBREC arrives, then the PUBREL that replaced it
    outbound_qos2: HashMap<u16, Message>,
    outbound_qos1: HashMap<u16, Publish>,
    outbound_qos0: HashMap<u16, Publish>,
    inbound_qos2: HashMap<u16, Publish>,
    pending_messages: VecDeque<Message>,
    pending_flows: VecDeque<Message>,
    max_in_flight: u16,
    actual_in_flight: u16,
    in_flight_pubrels: u16,
    clean_session: bool,
    keep_alive: Duration,
    connected: bool,
    awaiting_connack: bool,
    quiescing: bool,
    last_inbound: Instant,
    last_outbound: Instant,
    last_ping: Instant,
    pings_outstanding: u32,
}

impl SessionState {
    fn new(options: &SessionOptions) -> Self {
        let now = Instant::now();
        Self {
            ids: MessageIdAllocator::new(),
            outbound_qos2: HashMap::new(),
            outbound_qos1: HashMap::new(),
            outbound_qos0: HashMap::new(),
            inbound_qos2: HashMap::new(),
            pending_messages: VecDeque::new(),
            pending_flows: VecDeque::new(),
            max_in_flight: options.max_in_flight.max(1),
            actual_in_flight: 0,
            in_flight_pubrels: 0,
            clean_session: options.clean_session,
            keep_alive: options.keep_alive,
            connected: false,
            awaiting_connack: false,
            quiescing: false,
            last_inbound: now,
            last_outbound: now,
            last_ping: now,
            pings_outstanding: 0,
        }
    }

    fn decrement_in_flight(&mut self) {
        self.actual_in_flight = self.actual_in_flight.saturating_sub(1);
    }

    fn head_is_connect(&self) -> bool {
        matches!(self.pending_flows.front(), Some(Message::Connect(_)))
    }
}

/// Session state machine shared by the sender, receiver, notifier and
/// connection orchestrator
pub struct Session {
    client_id: String,
    state: Mutex<SessionState>,
    queue_changed: Notify,
    quiesce_changed: Notify,
    tokens: Arc<TokenRegistry>,
    persistence: Arc<dyn Persistence>,
    notifier: Arc<CompletionNotifier>,
    metrics: Arc<SessionMetrics>,
}

impl Session {
    pub fn new(
        options: SessionOptions,
        tokens: Arc<TokenRegistry>,
        persistence: Arc<dyn Persistence>,
        notifier: Arc<CompletionNotifier>,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        Self {
            state: Mutex::new(SessionState::new(&options)),
            client_id: options.client_id,
            queue_changed: Notify::new(),
            quiesce_changed: Notify::new(),
            tokens,
            persistence,
            notifier,
            metrics,
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn tokens(&self) -> &Arc<TokenRegistry> {
        &self.tokens
    }

    pub fn metrics(&self) -> &Arc<SessionMetrics> {
        &self.metrics
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn clean_session(&self) -> bool {
        self.state().clean_session
    }

    pub fn keep_alive(&self) -> Duration {
        self.state().keep_alive
    }

    pub fn max_in_flight(&self) -> u16 {
        self.state().max_in_flight
    }

    /// Whether a publish would currently be rejected with `MaxInFlight`
    pub fn window_full(&self) -> bool {
        let state = self.state();
        state.actual_in_flight >= state.max_in_flight
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state();
        SessionSnapshot {
            connected: state.connected,
            quiescing: state.quiescing,
            actual_in_flight: state.actual_in_flight,
            in_flight_pubrels: state.in_flight_pubrels,
            pending_messages: state.pending_messages.iter().map(Message::message_id).collect(),
            pending_flows: state.pending_flows.iter().map(|m| m.kind().to_string()).collect(),
            outbound_qos0: state.outbound_qos0.len(),
            outbound_qos1: state.outbound_qos1.len(),
            outbound_qos2: state.outbound_qos2.len(),
            inbound_qos2: state.inbound_qos2.len(),
            ids_in_use: state.ids.in_use_count(),
            pings_outstanding: state.pings_outstanding,
        }
    }

    // ----- message ids -----------------------------------------------------

    pub fn allocate_message_id(&self) -> MqttResult<u16> {
        self.state().ids.allocate()
    }

    pub fn release_message_id(&self, id: u16) {
        self.state().ids.release(id);
    }

    // ----- persistence helpers ----------------------------------------------

    fn persist(&self, kind: RecordKind, message: &Message) -> MqttResult<()> {
        let record = serde_json::to_vec(message)
            .map_err(|e| MqttError::Persistence(format!("failed to encode record: {e}")))?;
        self.persistence
            .put(&key_for(kind, message.message_id()), &record)?;
        Ok(())
    }

    fn unpersist(&self, kind: RecordKind, id: u16) {
        let key = key_for(kind, id);
        if let Err(e) = self.persistence.remove(&key) {
            warn!(key = %key, error = %e, "Failed to remove persisted record");
        }
    }

    /// Persist a publish buffered while offline under its `sb-` key
    pub fn persist_buffered(&self, message: &Message) -> MqttResult<()> {
        self.persist(RecordKind::SentBuffered, message)
    }

    pub fn unpersist_buffered(&self, id: u16) {
        self.unpersist(RecordKind::SentBuffered, id);
    }

    // ----- outbound ---------------------------------------------------------

    /// Queue `message` for the sender.
    ///
    /// Publishes are recorded in their QoS table, persisted (QoS 1/2) and
    /// tokenized; CONNECT jumps to the head of the flow queue; other flows are
    /// appended. Acks we emit are never tokenized. Returns the message as
    /// queued, with its id assigned.
    pub fn send(&self, mut message: Message, token: Option<&Token>) -> MqttResult<Message> {
        let mut state = self.state();

        let mut allocated = None;
        if message.requires_message_id() && message.message_id() == 0 {
            if message.as_publish().is_some() && state.actual_in_flight >= state.max_in_flight {
                return Err(MqttError::MaxInFlight {
                    max: state.max_in_flight,
                });
            }
            let id = state.ids.allocate()?;
            message.set_message_id(id);
            allocated = Some(id);
        }

        let result = self.enqueue_locked(&mut state, &message, token);
        if result.is_err() {
            if let Some(id) = allocated {
                state.ids.release(id);
            }
        }
        drop(state);

        result?;
        self.queue_changed.notify_waiters();
        Ok(message)
    }

    fn enqueue_locked(
        &self,
        state: &mut SessionState,
        message: &Message,
        token: Option<&Token>,
    ) -> MqttResult<()> {
        let id = message.message_id();
        match message {
            Message::Publish(publish) => {
                if state.actual_in_flight >= state.max_in_flight {
                    return Err(MqttError::MaxInFlight {
                        max: state.max_in_flight,
                    });
                }
                let token = token.cloned().unwrap_or_else(Token::delivery);
                self.tokens.save_token_for(&token, message)?;
                token.set_message(publish.clone());

                let persisted = match publish.qos {
                    QoS::ExactlyOnce => {
                        state.outbound_qos2.insert(id, message.clone());
                        self.persist(RecordKind::Sent, message)
                    }
                    QoS::AtLeastOnce => {
                        state.outbound_qos1.insert(id, publish.clone());
                        self.persist(RecordKind::Sent, message)
                    }
                    QoS::AtMostOnce => {
                        state.outbound_qos0.insert(id, publish.clone());
                        Ok(())
                    }
                };
                if let Err(e) = persisted {
                    self.undo_locked(state, publish);
                    return Err(e);
                }

                state.pending_messages.push_back(message.clone());
                debug!(message_id = id, qos = publish.qos.as_u8(), "Queued publish");
            }
            Message::Connect(connect) => {
                let token = token.cloned().unwrap_or_default();
                self.tokens.save_token_for(&token, message)?;
                state.clean_session = connect.clean_session;
                state.keep_alive = Duration::from_secs(u64::from(connect.keep_alive_secs));
                state.pending_flows.push_front(message.clone());
                debug!("Queued CONNECT at head of flows");
            }
            _ => {
                match message {
                    Message::PubRel { .. } => {
                        state.outbound_qos2.insert(id, message.clone());
                        self.persist(RecordKind::SentConfirmed, message)?;
                    }
                    Message::PubComp { .. } => {
                        self.unpersist(RecordKind::Received, id);
                    }
                    _ => {}
                }
                if !message.is_ack() {
                    let token = token.cloned().unwrap_or_default();
                    self.tokens.save_token_for(&token, message)?;
                }
                state.pending_flows.push_back(message.clone());
                debug!(kind = %message.kind(), message_id = id, "Queued flow");
            }
        }
        Ok(())
    }

    /// Roll back a publish queued by [`Session::send`]
    pub fn undo(&self, publish: &Publish) {
        let mut state = self.state();
        self.undo_locked(&mut state, publish);
        drop(state);
        self.check_quiesce();
    }

    fn undo_locked(&self, state: &mut SessionState, publish: &Publish) {
        let id = publish.message_id;
        debug!(message_id = id, "Undoing queued publish");
        match publish.qos {
            QoS::ExactlyOnce => {
                state.outbound_qos2.remove(&id);
            }
            QoS::AtLeastOnce => {
                state.outbound_qos1.remove(&id);
            }
            QoS::AtMostOnce => {
                state.outbound_qos0.remove(&id);
            }
        }
        state
            .pending_messages
            .retain(|m| !matches!(m, Message::Publish(p) if p.message_id == id));
        self.unpersist(RecordKind::Sent, id);
        self.tokens.remove_token(&id.to_string());
        state.ids.release(id);
    }

    /// Next message for the sender; `None` tells the sender to exit.
    ///
    /// Waits while there is nothing sendable: both queues empty, or only
    /// publishes queued with the in-flight window full. Flows always go
    /// before publishes.
    pub async fn get(&self) -> Option<Message> {
        let mut woken = false;
        loop {
            let notified = self.queue_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                let idle = (state.pending_messages.is_empty() && state.pending_flows.is_empty())
                    || (state.pending_flows.is_empty()
                        && state.actual_in_flight >= state.max_in_flight);

                if !idle || woken {
                    if !state.connected && !state.awaiting_connack && !state.head_is_connect() {
                        debug!("Session not connected, sender released");
                        return None;
                    }

                    if let Some(flow) = state.pending_flows.pop_front() {
                        match &flow {
                            Message::PubRel { .. } => state.in_flight_pubrels += 1,
                            Message::Connect(_) => state.awaiting_connack = true,
                            _ => {}
                        }
                        drop(state);
                        self.check_quiesce();
                        return Some(flow);
                    }

                    if state.actual_in_flight < state.max_in_flight {
                        if let Some(message) = state.pending_messages.pop_front() {
                            state.actual_in_flight += 1;
                            self.metrics.observe_in_flight(state.actual_in_flight);
                            return Some(message);
                        }
                    }
                }
            }

            notified.await;
            woken = true;
        }
    }

    /// Bookkeeping after `message` was written to the transport
    pub fn notify_sent(&self, message: &Message) {
        let mut state = self.state();
        state.last_outbound = Instant::now();
        self.metrics.record_message_sent();

        if message.is_ack() {
            return;
        }
        let Some(token) = self.tokens.get_token_for(message) else {
            return;
        };
        token.notify_sent();

        match message {
            Message::PingReq => {
                state.last_ping = Instant::now();
                state.pings_outstanding += 1;
                self.metrics.record_ping_sent();
            }
            Message::Publish(publish) if publish.qos == QoS::AtMostOnce => {
                let id = publish.message_id;
                self.notify_result(None, &token, None);
                state.outbound_qos0.remove(&id);
                state.decrement_in_flight();
                state.ids.release(id);
                self.tokens.remove_token(&id.to_string());
                drop(state);
                self.unpersist(RecordKind::SentBuffered, id);
                self.queue_changed.notify_waiters();
                self.check_quiesce();
            }
            _ => {}
        }
    }

    // ----- inbound ----------------------------------------------------------

    /// Process an ack from the peer. The caller holds the token's processing
    /// lock. `on_connected` runs after a successful CONNACK has been applied
    /// and before the connect token completes.
    pub fn notify_received_ack(
        &self,
        ack: &Message,
        on_connected: impl FnOnce(),
    ) -> MqttResult<()> {
        self.state().last_inbound = Instant::now();
        self.metrics.record_ack_received();

        let Some(token) = self.tokens.get_token_for(ack) else {
            return Err(MqttError::unexpected(format!("no token for {ack}")));
        };
        debug!(kind = %ack.kind(), key = %token.key(), "Received ack");

        match ack {
            Message::PubRec { message_id } => {
                self.send(Message::PubRel { message_id: *message_id }, Some(&token))?;
            }
            Message::PubAck { .. } | Message::PubComp { .. } => {
                self.notify_result(Some(ack.clone()), &token, None);
            }
            Message::PingResp => {
                let remaining = {
                    let mut state = self.state();
                    state.pings_outstanding = state.pings_outstanding.saturating_sub(1);
                    state.pings_outstanding
                };
                self.notify_result(Some(ack.clone()), &token, None);
                if remaining == 0 {
                    self.tokens.remove_token_for(ack);
                }
            }
            Message::ConnAck(connack) => {
                if connack.return_code != 0 {
                    let err = MqttError::from_connack_code(connack.return_code);
                    warn!(code = connack.return_code, error = %err, "Connection refused");
                    return Err(err);
                }
                {
                    let mut state = self.state();
                    if state.clean_session {
                        self.clear_state_locked(&mut state);
                        self.tokens.save_token_for(&token, ack)?;
                    }
                    state.in_flight_pubrels = 0;
                    state.actual_in_flight = 0;
                    self.restore_inflight_locked(&mut state);
                    state.connected = true;
                    state.awaiting_connack = false;
                    let now = Instant::now();
                    state.last_inbound = now;
                    state.last_outbound = now;
                    state.pings_outstanding = 0;
                }
                info!(session_present = connack.session_present, "Session connected");
                on_connected();
                self.notify_result(Some(ack.clone()), &token, None);
                self.tokens.remove_token_for(ack);
                self.queue_changed.notify_waiters();
            }
            _ => {
                self.notify_result(Some(ack.clone()), &token, None);
                self.release_message_id(ack.message_id());
                self.tokens.remove_token_for(ack);
            }
        }

        self.check_quiesce();
        Ok(())
    }

    /// Process a PUBLISH or PUBREL from the peer
    pub async fn notify_received_msg(&self, message: Message) -> MqttResult<()> {
        let deliver = {
            let mut state = self.state();
            state.last_inbound = Instant::now();
            self.metrics.record_message_received();

            match message {
                Message::Publish(publish) => {
                    if state.quiescing {
                        debug!(
                            message_id = publish.message_id,
                            "Quiescing, inbound publish ignored"
                        );
                        None
                    } else {
                        match publish.qos {
                            QoS::ExactlyOnce => {
                                let id = publish.message_id;
                                let record = Message::Publish(publish.clone());
                                self.persist(RecordKind::Received, &record)?;
                                state.inbound_qos2.insert(id, publish);
                                drop(state);
                                self.send(Message::PubRec { message_id: id }, None)?;
                                None
                            }
                            QoS::AtLeastOnce | QoS::AtMostOnce => Some((publish, false)),
                        }
                    }
                }
                Message::PubRel { message_id } => {
                    match state.inbound_qos2.get(&message_id).cloned() {
                        Some(publish) => Some((publish, true)),
                        None => {
                            debug!(message_id, "PUBREL for delivered message, completing");
                            drop(state);
                            self.send(Message::PubComp { message_id }, None)?;
                            None
                        }
                    }
                }
                other => {
                    return Err(MqttError::invalid_message(format!(
                        "unexpected inbound {}",
                        other.kind()
                    )))
                }
            }
        };

        match deliver {
            Some((publish, true)) => self.notifier.message_released(publish).await,
            Some((publish, false)) => self.notifier.message_arrived(publish).await,
            None => {}
        }
        Ok(())
    }

    /// Acknowledge an inbound publish once the application has taken it
    pub fn message_arrived_complete(&self, message_id: u16, qos: QoS) -> MqttResult<()> {
        match qos {
            QoS::AtLeastOnce => {
                self.send(Message::PubAck { message_id }, None)?;
            }
            QoS::ExactlyOnce => {
                self.unpersist(RecordKind::Received, message_id);
                self.state().inbound_qos2.remove(&message_id);
                self.send(Message::PubComp { message_id }, None)?;
            }
            QoS::AtMostOnce => {}
        }
        Ok(())
    }

    // ----- completion -------------------------------------------------------

    /// Mark, publish and hand the token to the notifier
    pub fn notify_result(&self, ack: Option<Message>, token: &Token, error: Option<MqttError>) {
        let forward = match &ack {
            Some(Message::PubRec { .. }) => false,
            Some(m) => m.is_ack(),
            None => true,
        };
        token.mark_complete(ack, error);
        token.notify_complete();
        if forward {
            self.notifier.async_operation_complete(token.clone());
        }
    }

    /// Discard delivery bookkeeping once the user has been told about a
    /// PUBACK / PUBCOMP
    pub fn notify_complete(&self, token: &Token) {
        let Some(response) = token.response() else {
            return;
        };
        let id = response.message_id();

        {
            let mut state = self.state();
            match response {
                Message::PubAck { .. } => {
                    self.unpersist(RecordKind::Sent, id);
                    self.unpersist(RecordKind::SentBuffered, id);
                    if state.outbound_qos1.remove(&id).is_some() {
                        state.decrement_in_flight();
                    }
                }
                Message::PubComp { .. } => {
                    self.unpersist(RecordKind::Sent, id);
                    self.unpersist(RecordKind::SentConfirmed, id);
                    self.unpersist(RecordKind::SentBuffered, id);
                    if state.outbound_qos2.remove(&id).is_some() {
                        state.decrement_in_flight();
                        state.in_flight_pubrels = state.in_flight_pubrels.saturating_sub(1);
                    }
                }
                _ => return,
            }
            state.ids.release(id);
            self.tokens.remove_token(&id.to_string());
            debug!(message_id = id, "Delivery complete");
        }

        self.queue_changed.notify_waiters();
        self.check_quiesce();
    }

    /// Wake a pending `quiesce` so it can re-evaluate the drain condition
    pub fn check_quiesce(&self) {
        if self.state().quiescing {
            self.quiesce_changed.notify_waiters();
        }
    }

    fn is_drained(&self) -> bool {
        let flows_empty = self.state().pending_flows.is_empty();
        self.tokens.count() == 0 && flows_empty && self.notifier.is_quiesced()
    }

    /// Stop accepting new work and wait up to `timeout` for in-flight work to
    /// drain. Queued work is abandoned afterwards either way.
    pub async fn quiesce(&self, timeout: Duration) {
        if !timeout.is_zero() {
            self.state().quiescing = true;
            self.notifier.quiesce();
            self.queue_changed.notify_waiters();

            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let notified = self.quiesce_changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_drained() {
                    debug!("Session drained");
                    break;
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    debug!(outstanding = self.tokens.count(), "Quiesce timed out");
                    break;
                }
            }
        }

        let mut state = self.state();
        state.pending_messages.clear();
        state.pending_flows.clear();
        state.quiescing = false;
        state.actual_in_flight = 0;
    }

    // ----- keep-alive -------------------------------------------------------

    /// Keep-alive check driven by the pinger
    pub fn check_for_activity(&self) -> MqttResult<KeepAliveStep> {
        let mut state = self.state();
        if !state.connected {
            let next_check = (!state.keep_alive.is_zero()).then_some(state.keep_alive);
            return Ok(KeepAliveStep {
                ping: None,
                next_check,
            });
        }

        let now = Instant::now();
        let snapshot = ActivitySnapshot {
            keep_alive: state.keep_alive,
            since_inbound: now.saturating_duration_since(state.last_inbound),
            since_outbound: now.saturating_duration_since(state.last_outbound),
            pings_outstanding: state.pings_outstanding,
            quiescing: state.quiescing,
        };

        match KeepAliveMonitor::evaluate(&snapshot) {
            ActivityDecision::Disabled => Ok(KeepAliveStep {
                ping: None,
                next_check: None,
            }),
            ActivityDecision::ClientTimeout => {
                warn!(
                    since_inbound_ms = snapshot.since_inbound.as_millis() as u64,
                    "No response to ping"
                );
                Err(MqttError::ClientTimeout)
            }
            ActivityDecision::WriteTimeout => {
                warn!(
                    since_outbound_ms = snapshot.since_outbound.as_millis() as u64,
                    "No successful write"
                );
                Err(MqttError::WriteTimeout)
            }
            ActivityDecision::SendPing { next_check } => {
                let token = Token::new();
                self.tokens.save_token_for(&token, &Message::PingReq)?;
                state.pending_flows.push_front(Message::PingReq);
                drop(state);
                self.queue_changed.notify_waiters();
                debug!("Queued PINGREQ");
                Ok(KeepAliveStep {
                    ping: Some(token),
                    next_check: Some(next_check),
                })
            }
            ActivityDecision::Wait { next_check } => Ok(KeepAliveStep {
                ping: None,
                next_check: Some(next_check),
            }),
        }
    }

    // ----- restore ----------------------------------------------------------

    fn decode_record(&self, key: &str) -> MqttResult<Option<Message>> {
        let bytes = self.persistence.get(key)?;
        match serde_json::from_slice::<Message>(&bytes) {
            Ok(message) => Ok(Some(message)),
            Err(e) if e.is_eof() => {
                warn!(key, "Dropping truncated persisted record");
                self.persistence.remove(key)?;
                Ok(None)
            }
            Err(e) => Err(MqttError::Persistence(format!("corrupt record {key}: {e}"))),
        }
    }

    /// Rebuild the in-flight tables from the durable store
    pub fn restore_state(&self) -> MqttResult<()> {
        let _span = crate::session_span!(client_id = %self.client_id, op = "restore").entered();
        let keys = self.persistence.keys()?;
        let mut state = self.state();
        let mut highest = 0u16;
        let mut restored = 0u64;
        let mut orphaned = Vec::new();

        for key in keys {
            let Some((kind, _)) = RecordKind::parse(&key) else {
                debug!(key = %key, "Skipping foreign record");
                continue;
            };
            let Some(message) = self.decode_record(&key)? else {
                continue;
            };

            match (kind, message) {
                (RecordKind::Received, Message::Publish(publish)) => {
                    debug!(message_id = publish.message_id, "Restored inbound QoS 2 publish");
                    state.inbound_qos2.insert(publish.message_id, publish);
                }
                (RecordKind::Sent, Message::Publish(mut publish)) => {
                    let id = publish.message_id;
                    highest = highest.max(id);
                    let confirm_key = key_for(RecordKind::SentConfirmed, id);
                    let confirm = if self.persistence.contains_key(&confirm_key)? {
                        self.decode_record(&confirm_key)?
                    } else {
                        None
                    };
                    match confirm {
                        Some(pubrel @ Message::PubRel { .. }) => {
                            state.outbound_qos2.insert(id, pubrel);
                        }
                        _ => {
                            publish.dup = true;
                            if publish.qos == QoS::ExactlyOnce {
                                state.outbound_qos2.insert(id, Message::Publish(publish.clone()));
                            } else {
                                state.outbound_qos1.insert(id, publish.clone());
                            }
                        }
                    }
                    self.restore_delivery_token(&mut state, &publish);
                    restored += 1;
                }
                (RecordKind::SentBuffered, Message::Publish(publish)) => {
                    let id = publish.message_id;
                    highest = highest.max(id);
                    match publish.qos {
                        QoS::ExactlyOnce => {
                            state.outbound_qos2.insert(id, Message::Publish(publish.clone()));
                        }
                        QoS::AtLeastOnce => {
                            state.outbound_qos1.insert(id, publish.clone());
                        }
                        QoS::AtMostOnce => {
                            state.outbound_qos0.insert(id, publish.clone());
                            self.persistence.remove(&key)?;
                        }
                    }
                    self.restore_delivery_token(&mut state, &publish);
                    restored += 1;
                }
                (RecordKind::SentConfirmed, Message::PubRel { message_id }) => {
                    if !self
                        .persistence
                        .contains_key(&key_for(RecordKind::Sent, message_id))?
                    {
                        orphaned.push(key);
                    }
                }
                (kind, other) => {
                    warn!(
                        key = %key,
                        record = %kind,
                        kind = %other.kind(),
                        "Unexpected record type, skipping"
                    );
                }
            }
        }

        for key in orphaned {
            info!(key = %key, "Removing orphaned PUBREL record");
            self.persistence.remove(&key)?;
        }

        state.ids.set_next(highest);
        self.metrics.record_restored(restored);
        info!(
            restored,
            inbound = state.inbound_qos2.len(),
            "Restored session state"
        );
        Ok(())
    }

    fn restore_delivery_token(&self, state: &mut SessionState, publish: &Publish) {
        let token = self.tokens.restore_token(publish);
        if token.client().is_none() {
            token.set_client(&self.client_id).ok();
        }
        state.ids.mark_in_use(publish.message_id);
    }

    /// Re-queue everything in the outbound tables after a reconnect
    pub fn restore_inflight(&self) {
        let mut state = self.state();
        self.restore_inflight_locked(&mut state);
        drop(state);
        self.queue_changed.notify_waiters();
    }

    fn restore_inflight_locked(&self, state: &mut SessionState) {
        let mut messages = Vec::new();
        let mut flows = Vec::new();

        for message in state.outbound_qos2.values_mut() {
            match message {
                Message::Publish(publish) => {
                    publish.dup = true;
                    messages.push(message.clone());
                }
                Message::PubRel { .. } => flows.push(message.clone()),
                _ => {}
            }
        }
        for publish in state.outbound_qos1.values_mut() {
            publish.dup = true;
            messages.push(Message::Publish(publish.clone()));
        }
        for publish in state.outbound_qos0.values() {
            messages.push(Message::Publish(publish.clone()));
        }

        if !messages.is_empty() || !flows.is_empty() {
            debug!(
                messages = messages.len(),
                flows = flows.len(),
                "Restoring in-flight messages"
            );
        }
        state.pending_flows = reorder::reorder(flows, Message::message_id).into();
        state.pending_messages = reorder::reorder(messages, Message::message_id).into();
    }

    // ----- teardown ---------------------------------------------------------

    /// Fail every token still waiting on an outcome with `reason` and return
    /// the tokens the caller must notify. Non-delivery tokens are dropped
    /// from the registry.
    pub async fn resolve_old_tokens(&self, reason: Option<MqttError>) -> Vec<Token> {
        let reason = reason.unwrap_or(MqttError::Disconnecting);
        let outstanding = self.tokens.outstanding_tokens();

        for token in &outstanding {
            let _guard = token.lock().await;
            if !token.is_complete() && !token.is_complete_pending() && token.error().is_none() {
                token.set_error(reason.clone());
            }
            if !token.is_delivery() {
                self.tokens.remove_token(&token.key());
            }
        }
        outstanding
    }

    /// The connection has gone: drop queues and ping state, clearing
    /// everything for clean sessions, and release the sender
    pub fn disconnected(&self, reason: Option<&MqttError>) {
        {
            let mut state = self.state();
            debug!(reason = ?reason, "Session disconnected");
            state.connected = false;
            state.awaiting_connack = false;
            if state.clean_session {
                self.clear_state_locked(&mut state);
            }
            state.pending_messages.clear();
            state.pending_flows.clear();
            state.pings_outstanding = 0;
        }
        self.queue_changed.notify_waiters();
    }

    fn clear_state_locked(&self, state: &mut SessionState) {
        debug!("Clearing session state");
        if let Err(e) = self.persistence.clear() {
            warn!(error = %e, "Failed to clear persistence");
        }
        state.ids.clear();
        state.pending_messages.clear();
        state.pending_flows.clear();
        state.outbound_qos2.clear();
        state.outbound_qos1.clear();
        state.outbound_qos0.clear();
        state.inbound_qos2.clear();
        self.tokens.clear();
    }

    /// Release all in-memory state. The session is unusable afterwards.
    pub fn close(&self) {
        {
            let mut state = self.state();
            state.ids.clear();
            state.pending_messages.clear();
            state.pending_flows.clear();
            state.outbound_qos2.clear();
            state.outbound_qos1.clear();
            state.outbound_qos0.clear();
            state.inbound_qos2.clear();
            state.connected = false;
            state.awaiting_connack = false;
            state.actual_in_flight = 0;
            state.in_flight_pubrels = 0;
        }
        self.tokens.clear();
        self.queue_changed.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn force_connected_for_test(&self) {
        self.state().connected = true;
    }

    #[cfg(test)]
    pub(crate) fn set_activity_for_test(
        &self,
        since_inbound: Duration,
        since_outbound: Duration,
        pings: u32,
    ) {
        let mut state = self.state();
        let now = Instant::now();
        state.last_inbound = now.checked_sub(since_inbound).unwrap_or(now);
        state.last_outbound = now.checked_sub(since_outbound).unwrap_or(now);
        state.pings_outstanding = pings;
    }
}

#[cfg(test)]
mod tests;
