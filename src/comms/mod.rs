//! Concurrent actors driving one connection
//!
//! Sender, receiver, completion notifier and pinger each run as their own
//! tokio task and only communicate through the [`crate::session::Session`]
//! and the token registry. [`connection::Connection`] wires them together.

use crate::error::MqttError;
use crate::token::Token;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub mod buffer;
pub mod connection;
pub mod notifier;
pub mod pinger;
pub mod receiver;
pub mod sender;

pub use buffer::{BufferOptions, DisconnectedBuffer};
pub use connection::{Connection, ConnectionState};
pub use notifier::{CompletionNotifier, MqttCallback};

/// How long a stopping task gets before it is aborted
pub const TASK_STOP_GRACE: Duration = Duration::from_secs(2);

/// Called by a task that hit a connection-fatal error
pub type FailureHook = Arc<dyn Fn(MqttError) + Send + Sync>;

/// What the I/O tasks report back to the connection that owns them
pub trait ConnectionEvents: Send + Sync {
    /// A fatal error; the connection must shut down. `token` is the
    /// operation being processed when it happened, if any.
    fn connection_failed(&self, token: Option<Token>, error: MqttError);

    /// A successful CONNACK has been applied to the session
    fn connected(&self);

    /// A disconnect is under way, so end of stream is expected
    fn is_disconnecting(&self) -> bool;
}

tokio::task_local! {
    static CALLBACK_SCOPE: ();
}

/// Whether the current task is running a user callback
pub fn in_callback() -> bool {
    CALLBACK_SCOPE.try_with(|_| ()).is_ok()
}

/// Run a user callback future inside the callback scope
pub(crate) async fn callback_scope<F: std::future::Future>(fut: F) -> F::Output {
    CALLBACK_SCOPE.scope((), fut).await
}

/// Run a synchronous user callback inside the callback scope
pub(crate) fn callback_scope_sync<R>(f: impl FnOnce() -> R) -> R {
    CALLBACK_SCOPE.sync_scope((), f)
}

/// A spawned actor plus its stop signal
pub(crate) struct TaskHandle {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub(crate) fn new(
        name: &'static str,
        stop_tx: watch::Sender<bool>,
        handle: JoinHandle<()>,
    ) -> Self {
        Self {
            name,
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Ask the task to stop without waiting for it
    pub(crate) fn signal(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Signal, then give the task a grace period before aborting it
    pub(crate) async fn stop(mut self) {
        self.signal();
        let Some(handle) = self.handle.take() else {
            return;
        };
        if is_current(&handle) {
            // stopping ourselves: the signal is enough
            return;
        }
        let abort = handle.abort_handle();
        match tokio::time::timeout(TASK_STOP_GRACE, handle).await {
            Ok(Ok(())) => debug!(task = self.name, "Task stopped"),
            Ok(Err(e)) if !e.is_cancelled() => {
                warn!(task = self.name, error = %e, "Task ended with error")
            }
            Err(_) => {
                warn!(task = self.name, "Task didn't stop gracefully, aborting");
                abort.abort();
            }
            _ => {}
        }
    }
}

fn is_current(handle: &JoinHandle<()>) -> bool {
    tokio::task::try_id().is_some_and(|id| id == handle.id())
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
