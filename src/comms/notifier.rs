//! Completion notifier: runs user callbacks off the I/O tasks
//!
//! Two queues feed one worker task. Arrived messages go through a bounded
//! channel so a slow application pushes back on the receiver; completed
//! operations go through an unbounded one. Producers of arrived messages
//! wait in short slices and re-check shutdown / quiesce between them.

use super::{callback_scope, callback_scope_sync, FailureHook, TaskHandle};
use crate::error::{MqttError, MqttResult};
use crate::protocol::{Publish, QoS};
use crate::session::Session;
use crate::token::Token;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn, Instrument};

/// Capacity of the arrived-message queue
pub const INBOUND_QUEUE_SIZE: usize = 10;

/// Slice a blocked producer waits before re-checking shutdown / quiesce
const PRODUCER_RECHECK: Duration = Duration::from_millis(200);

/// Application callbacks for connection-level events
///
/// Every method has a no-op default. All of them run on the notifier task,
/// never on the sender or receiver.
#[async_trait]
pub trait MqttCallback: Send + Sync {
    /// The connection ended with an error
    async fn connection_lost(&self, _cause: &MqttError) {}

    /// A message arrived. Returning an error shuts the connection down and
    /// leaves the message unacknowledged.
    async fn message_arrived(&self, _topic: &str, _message: &Publish) -> MqttResult<()> {
        Ok(())
    }

    /// An outbound publish finished its QoS handshake
    async fn delivery_complete(&self, _token: &Token) {}

    /// A connect (or reconnect) succeeded
    async fn connect_complete(&self, _reconnect: bool, _server_uri: &str) {}
}

/// Work item on the completion queue
#[derive(Debug, Clone)]
pub enum NotifierEvent {
    ActionComplete(Token),
    ConnectComplete { reconnect: bool, server_uri: String },
}

/// Shared completion notifier
pub struct CompletionNotifier {
    callback: RwLock<Option<Arc<dyn MqttCallback>>>,
    manual_acks: AtomicBool,
    running: AtomicBool,
    quiescing: AtomicBool,
    pending: AtomicUsize,
    message_tx: mpsc::Sender<Publish>,
    message_rx: tokio::sync::Mutex<mpsc::Receiver<Publish>>,
    complete_tx: mpsc::UnboundedSender<NotifierEvent>,
    complete_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<NotifierEvent>>,
    worker: Mutex<Option<TaskHandle>>,
}

impl CompletionNotifier {
    pub fn new() -> Self {
        let (message_tx, message_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        let (complete_tx, complete_rx) = mpsc::unbounded_channel();
        Self {
            callback: RwLock::new(None),
            manual_acks: AtomicBool::new(false),
            running: AtomicBool::new(false),
            quiescing: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            message_tx,
            message_rx: tokio::sync::Mutex::new(message_rx),
            complete_tx,
            complete_rx: tokio::sync::Mutex::new(complete_rx),
            worker: Mutex::new(None),
        }
    }

    pub fn set_callback(&self, callback: Option<Arc<dyn MqttCallback>>) {
        *self.callback.write().unwrap_or_else(|e| e.into_inner()) = callback;
    }

    fn callback(&self) -> Option<Arc<dyn MqttCallback>> {
        self.callback.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_manual_acks(&self, manual: bool) {
        self.manual_acks.store(manual, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the worker. A no-op if it is already running.
    pub fn start(self: &Arc<Self>, session: Arc<Session>, on_failure: FailureHook) {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return;
        }

        // arrivals left over from the previous connection were never acked
        // and will be redelivered by the peer
        if let Ok(mut message_rx) = self.message_rx.try_lock() {
            while message_rx.try_recv().is_ok() {
                self.release_pending();
            }
        }

        self.running.store(true, Ordering::SeqCst);
        self.quiescing.store(false, Ordering::SeqCst);

        let (stop_tx, stop_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let handle = tokio::spawn(
            async move { this.run(session, stop_rx, on_failure).await }
                .instrument(crate::comms_span!(task = "notifier")),
        );
        *worker = Some(TaskHandle::new("notifier", stop_tx, handle));
        debug!("Completion notifier started");
    }

    /// Stop the worker. Queued completions are kept for the next start.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            worker.stop().await;
            debug!("Completion notifier stopped");
        }
    }

    fn release_pending(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    /// Refuse new arrivals; queued work still drains
    pub fn quiesce(&self) {
        self.quiescing.store(true, Ordering::SeqCst);
    }

    /// Quiescing and nothing left to deliver
    pub fn is_quiesced(&self) -> bool {
        self.quiescing.load(Ordering::SeqCst) && self.pending.load(Ordering::SeqCst) == 0
    }

    /// Queue an inbound publish for the application
    pub async fn message_arrived(&self, publish: Publish) {
        self.queue_arrival(publish, true).await;
    }

    /// Queue a QoS 2 publish the peer has released. The peer already holds
    /// our PUBREC, so the delivery goes ahead even while quiescing.
    pub async fn message_released(&self, publish: Publish) {
        self.queue_arrival(publish, false).await;
    }

    async fn queue_arrival(&self, publish: Publish, refuse_when_quiescing: bool) {
        let mut publish = publish;
        loop {
            if refuse_when_quiescing && self.quiescing.load(Ordering::SeqCst) {
                debug!(message_id = publish.message_id, "Notifier quiescing, message dropped");
                return;
            }
            self.pending.fetch_add(1, Ordering::SeqCst);
            match self.message_tx.send_timeout(publish, PRODUCER_RECHECK).await {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(returned)) => {
                    self.release_pending();
                    if !self.is_running() {
                        debug!(
                            message_id = returned.message_id,
                            "Notifier stopped, message dropped"
                        );
                        return;
                    }
                    publish = returned;
                }
                Err(SendTimeoutError::Closed(_)) => {
                    self.release_pending();
                    return;
                }
            }
        }
    }

    /// Queue a finished operation for user notification
    pub fn async_operation_complete(&self, token: Token) {
        self.enqueue(NotifierEvent::ActionComplete(token));
    }

    /// Queue the connect-complete callback
    pub fn connect_complete(&self, reconnect: bool, server_uri: String) {
        self.enqueue(NotifierEvent::ConnectComplete {
            reconnect,
            server_uri,
        });
    }

    fn enqueue(&self, event: NotifierEvent) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.complete_tx.send(event).is_err() {
            self.release_pending();
        }
    }

    /// Tell the application the connection was lost
    pub async fn connection_lost(&self, cause: &MqttError) {
        if let Some(callback) = self.callback() {
            callback_scope(callback.connection_lost(cause)).await;
        }
    }

    async fn run(
        self: Arc<Self>,
        session: Arc<Session>,
        mut stop_rx: watch::Receiver<bool>,
        on_failure: FailureHook,
    ) {
        let mut complete_rx = self.complete_rx.lock().await;
        let mut message_rx = self.message_rx.lock().await;

        loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                Some(event) = complete_rx.recv() => {
                    self.handle_event(&session, event).await;
                    self.release_pending();
                }
                Some(publish) = message_rx.recv() => {
                    self.handle_message(&session, publish, &on_failure).await;
                    self.release_pending();
                }
            }
            session.check_quiesce();
        }
        debug!("Completion notifier worker exiting");
    }

    async fn handle_event(&self, session: &Session, event: NotifierEvent) {
        match event {
            NotifierEvent::ActionComplete(token) => {
                self.handle_action_complete(session, &token).await
            }
            NotifierEvent::ConnectComplete {
                reconnect,
                server_uri,
            } => {
                if let Some(callback) = self.callback() {
                    callback_scope(callback.connect_complete(reconnect, &server_uri)).await;
                }
            }
        }
    }

    async fn handle_message(&self, session: &Session, publish: Publish, on_failure: &FailureHook) {
        if let Some(callback) = self.callback() {
            let delivered =
                callback_scope(callback.message_arrived(&publish.topic, &publish)).await;
            if let Err(e) = delivered {
                error!(
                    message_id = publish.message_id,
                    topic = %publish.topic,
                    error = %e,
                    "Message handler failed"
                );
                on_failure(MqttError::message_handler(e.to_string()));
                return;
            }
        }
        session.metrics().record_publish_delivered();

        if !self.manual_acks.load(Ordering::SeqCst) && publish.qos != QoS::AtMostOnce {
            if let Err(e) = session.message_arrived_complete(publish.message_id, publish.qos) {
                warn!(message_id = publish.message_id, error = %e, "Failed to acknowledge message");
            }
        }
    }

    /// Deliver the outcome of `token` to the application exactly once,
    /// then let the session discard its delivery bookkeeping
    pub async fn handle_action_complete(&self, session: &Session, token: &Token) {
        let _guard = token.lock().await;
        token.notify_complete();

        if !token.is_notified() {
            if token.is_delivery() && token.is_complete() {
                if let Some(callback) = self.callback() {
                    callback_scope(callback.delivery_complete(token)).await;
                }
            }
            fire_action_event(token);
        }

        if token.is_complete() || (!token.is_delivery() && token.is_terminal()) {
            token.set_notified(true);
        }
        if token.is_complete() {
            session.notify_complete(token);
        }
    }
}

impl Default for CompletionNotifier {
    fn default() -> Self {
        Self::new()
    }
}

fn fire_action_event(token: &Token) {
    let Some(listener) = token.listener() else {
        return;
    };
    match token.error() {
        None => callback_scope_sync(|| listener.on_success(token)),
        Some(err) => callback_scope_sync(|| listener.on_failure(token, &err)),
    }
}
