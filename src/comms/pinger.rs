//! Keep-alive scheduler
//!
//! Wakes when the session says the next check is due and runs
//! [`Session::check_for_activity`]. Liveness failures are fatal.

use super::{ConnectionEvents, TaskHandle};
use crate::error::MqttError;
use crate::session::Session;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn, Instrument};

/// Start the pinger; `None` when keep-alive is disabled
pub(crate) fn spawn(
    session: Arc<Session>,
    events: Arc<dyn ConnectionEvents>,
) -> Option<TaskHandle> {
    let keep_alive = session.keep_alive();
    if keep_alive.is_zero() {
        debug!("Keep-alive disabled, pinger not started");
        return None;
    }
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(
        run(session, keep_alive, stop_rx, events).instrument(crate::comms_span!(task = "pinger")),
    );
    Some(TaskHandle::new("pinger", stop_tx, handle))
}

async fn run(
    session: Arc<Session>,
    first_check: Duration,
    mut stop_rx: watch::Receiver<bool>,
    events: Arc<dyn ConnectionEvents>,
) {
    debug!(keep_alive_ms = first_check.as_millis() as u64, "Pinger started");
    let mut next_check = first_check;
    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = tokio::time::sleep(next_check) => {}
        }

        match session.check_for_activity() {
            Ok(step) => match step.next_check {
                Some(delay) => next_check = delay,
                None => break,
            },
            Err(e @ (MqttError::ClientTimeout | MqttError::WriteTimeout)) => {
                warn!(error = %e, "Keep-alive failed");
                events.connection_failed(None, e);
                break;
            }
            Err(e) => {
                debug!(error = %e, "Keep-alive check refused, pinger exiting");
                break;
            }
        }
    }
    debug!("Pinger stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnAck, Connect, Message};
    use crate::testing::mocks::{test_session, RecordingEvents};
    use crate::token::Token;

    async fn connected_session(keep_alive_secs: u16) -> Arc<Session> {
        let (session, _notifier) = test_session(10);
        let token = Token::new();
        session
            .send(Message::Connect(Connect::new("c", true, keep_alive_secs)), Some(&token))
            .unwrap();
        session.get().await.unwrap();
        session
            .notify_received_ack(&Message::ConnAck(ConnAck::accepted(false)), || {})
            .unwrap();
        session
    }

    #[tokio::test]
    async fn test_not_started_without_keep_alive() {
        let session = connected_session(0).await;
        assert!(spawn(session, Arc::new(RecordingEvents::default())).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_link_gets_pinged() {
        // Arrange
        let session = connected_session(1).await;
        let events = Arc::new(RecordingEvents::default());

        // Act
        let pinger = spawn(session.clone(), events.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(1001)).await;

        // Assert
        assert_eq!(session.snapshot().pending_flows, vec!["PINGREQ".to_string()]);
        assert!(session.tokens().get_token("Ping").is_some());
        pinger.stop().await;
    }
}
