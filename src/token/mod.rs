//! Tokens: handles on in-flight asynchronous operations
//!
//! A token is created for every tracked exchange (CONNECT, PUBLISH,
//! SUBSCRIBE, ...) and resolved by the receiver when the matching ack
//! arrives, or failed by connection shutdown.
//!
//! Completion is two-phase. [`Token::mark_complete`] records the outcome and
//! [`Token::notify_complete`] publishes it to waiters. The receiver holds the
//! token's processing lock ([`Token::lock`]) across both steps, and the sender
//! holds it across write + `notify_sent`, so an ack can never be processed
//! before the send-side bookkeeping for the same message has finished.

use crate::error::{MqttError, MqttResult};
use crate::protocol::{Message, Publish};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, OwnedMutexGuard};

pub mod registry;

pub use registry::TokenRegistry;

/// Success / failure hooks attached to a single operation
///
/// Invoked on the completion notifier task, at most once per outcome.
pub trait ActionListener: Send + Sync {
    fn on_success(&self, token: &Token);
    fn on_failure(&self, token: &Token, error: &MqttError);
}

/// Opaque user context carried by a token
pub type UserContext = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct TokenState {
    key: String,
    message_id: u16,
    completed: bool,
    pending_complete: bool,
    failed: bool,
    sent: bool,
    notified: bool,
    response: Option<Message>,
    error: Option<MqttError>,
    client: Option<String>,
    topics: Vec<String>,
    message: Option<Publish>,
    user_context: Option<UserContext>,
    listener: Option<Arc<dyn ActionListener>>,
}

struct TokenInner {
    delivery: bool,
    state: Mutex<TokenState>,
    changed: Notify,
    processing: Arc<tokio::sync::Mutex<()>>,
}

/// Handle on one pending operation. Cloning shares the same operation.
#[derive(Clone)]
pub struct Token {
    inner: Arc<TokenInner>,
}

impl Token {
    /// Token for a non-publish operation
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Token tracking delivery of an outbound publish
    pub fn delivery() -> Self {
        Self::build(true)
    }

    fn build(delivery: bool) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                delivery,
                state: Mutex::new(TokenState::default()),
                changed: Notify::new(),
                processing: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TokenState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether two handles refer to the same operation
    pub fn same_as(&self, other: &Token) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_delivery(&self) -> bool {
        self.inner.delivery
    }

    /// Acquire the processing lock that serialises send-side and ack-side
    /// bookkeeping for this token
    pub async fn lock(&self) -> OwnedMutexGuard<()> {
        self.inner.processing.clone().lock_owned().await
    }

    pub fn key(&self) -> String {
        self.state().key.clone()
    }

    pub(crate) fn set_key(&self, key: &str) {
        self.state().key = key.to_string();
    }

    pub fn message_id(&self) -> u16 {
        self.state().message_id
    }

    pub(crate) fn set_message_id(&self, id: u16) {
        self.state().message_id = id;
    }

    /// Record the outcome without yet publishing it to waiters
    pub fn mark_complete(&self, response: Option<Message>, error: Option<MqttError>) {
        let mut state = self.state();
        state.pending_complete = true;
        state.response = response;
        if error.is_some() {
            state.error = error;
        }
    }

    /// Publish the recorded outcome. The only place a token turns terminal.
    pub fn notify_complete(&self) {
        {
            let mut state = self.state();
            if state.error.is_some() {
                state.failed = true;
            } else if state.pending_complete {
                state.completed = true;
            }
            state.pending_complete = false;
            state.sent = true;
        }
        self.inner.changed.notify_waiters();
    }

    /// Completed successfully
    pub fn is_complete(&self) -> bool {
        self.state().completed
    }

    pub fn is_complete_pending(&self) -> bool {
        self.state().pending_complete
    }

    /// Completed, or failed and published as failed
    pub fn is_terminal(&self) -> bool {
        let state = self.state();
        state.completed || state.failed
    }

    pub fn error(&self) -> Option<MqttError> {
        self.state().error.clone()
    }

    /// Attach a failure without completing. `notify_complete` publishes it.
    pub fn set_error(&self, error: MqttError) {
        self.state().error = Some(error);
    }

    /// Forget a failure from a previous connection so the operation can be
    /// resumed on reconnect
    pub fn clear_error(&self) {
        let mut state = self.state();
        state.error = None;
        state.failed = false;
    }

    pub fn response(&self) -> Option<Message> {
        self.state().response.clone()
    }

    /// Granted QoS codes from a SUBACK response
    pub fn granted_qos(&self) -> Vec<u8> {
        match &self.state().response {
            Some(Message::SubAck(ack)) => ack.granted.clone(),
            _ => Vec::new(),
        }
    }

    pub fn is_notified(&self) -> bool {
        self.state().notified
    }

    pub fn set_notified(&self, notified: bool) {
        self.state().notified = notified;
    }

    pub fn is_sent(&self) -> bool {
        self.state().sent
    }

    pub(crate) fn notify_sent(&self) {
        self.state().sent = true;
        self.inner.changed.notify_waiters();
    }

    /// Owning client, present while the operation is in flight
    pub fn client(&self) -> Option<String> {
        self.state().client.clone()
    }

    /// Claim the token for a client. Fails if it is still in flight.
    pub fn set_client(&self, client_id: &str) -> MqttResult<()> {
        let mut state = self.state();
        if state.client.is_some() && !state.completed {
            return Err(MqttError::TokenInUse);
        }
        state.client = Some(client_id.to_string());
        Ok(())
    }

    pub(crate) fn clear_client(&self) {
        self.state().client = None;
    }

    pub fn is_in_use(&self) -> bool {
        let state = self.state();
        state.client.is_some() && !state.completed
    }

    /// Return the token to its initial state so it can be reused
    pub fn reset(&self) -> MqttResult<()> {
        let mut state = self.state();
        if state.client.is_some() && !state.completed {
            return Err(MqttError::TokenInUse);
        }
        let listener = state.listener.take();
        let user_context = state.user_context.take();
        *state = TokenState {
            listener,
            user_context,
            ..TokenState::default()
        };
        Ok(())
    }

    pub fn topics(&self) -> Vec<String> {
        self.state().topics.clone()
    }

    pub fn set_topics(&self, topics: Vec<String>) {
        self.state().topics = topics;
    }

    /// Publish tracked by a delivery token
    pub fn message(&self) -> Option<Publish> {
        self.state().message.clone()
    }

    pub(crate) fn set_message(&self, message: Publish) {
        self.state().message = Some(message);
    }

    pub fn user_context(&self) -> Option<UserContext> {
        self.state().user_context.clone()
    }

    pub fn set_user_context(&self, context: UserContext) {
        self.state().user_context = Some(context);
    }

    pub fn listener(&self) -> Option<Arc<dyn ActionListener>> {
        self.state().listener.clone()
    }

    pub fn set_listener(&self, listener: Arc<dyn ActionListener>) {
        self.state().listener = Some(listener);
    }

    /// Wait until the operation completes or fails.
    ///
    /// `None` waits indefinitely. An elapsed timeout yields `ClientTimeout`.
    pub async fn wait_for_completion(
        &self,
        timeout: Option<Duration>,
    ) -> MqttResult<Option<Message>> {
        let wait = self.wait_for(|state| state.completed || state.failed);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| MqttError::ClientTimeout)?,
            None => wait.await,
        }

        let state = self.state();
        match &state.error {
            Some(err) => Err(err.clone()),
            None => Ok(state.response.clone()),
        }
    }

    /// Wait until the message has been written to the transport, or the
    /// operation has otherwise finished
    pub async fn wait_until_sent(&self, timeout: Duration) -> MqttResult<()> {
        tokio::time::timeout(timeout, self.wait_for(|state| state.sent || state.failed))
            .await
            .map_err(|_| MqttError::ClientTimeout)?;

        match self.state().error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn wait_for(&self, ready: impl Fn(&TokenState) -> bool) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if ready(&self.state()) {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Token")
            .field("key", &state.key)
            .field("delivery", &self.inner.delivery)
            .field("completed", &state.completed)
            .field("pending_complete", &state.pending_complete)
            .field("failed", &state.failed)
            .field("notified", &state.notified)
            .field("error", &state.error)
            .finish()
    }
}
