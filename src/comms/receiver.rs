//! Receiver task: feeds inbound messages to the session

use super::{ConnectionEvents, TaskHandle};
use crate::error::MqttError;
use crate::protocol::Message;
use crate::session::Session;
use crate::transport::PacketReader;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, Instrument};

/// Spawn the receiver for one connection
pub(crate) fn spawn(
    session: Arc<Session>,
    reader: PacketReader,
    events: Arc<dyn ConnectionEvents>,
) -> TaskHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(
        run(session, reader, stop_rx, events).instrument(crate::comms_span!(task = "receiver")),
    );
    TaskHandle::new("receiver", stop_tx, handle)
}

async fn run(
    session: Arc<Session>,
    mut reader: PacketReader,
    mut stop_rx: watch::Receiver<bool>,
    events: Arc<dyn ConnectionEvents>,
) {
    debug!("Receiver started");
    loop {
        let read = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            read = reader.read_message() => read,
        };

        match read {
            Ok(Some(message)) => {
                if !dispatch(&session, &events, message).await {
                    break;
                }
            }
            Ok(None) => {
                if events.is_disconnecting() {
                    debug!("Stream closed during disconnect");
                } else {
                    info!("Stream closed by peer");
                    let cause = MqttError::connection_lost("connection closed by peer");
                    events.connection_failed(None, cause);
                }
                break;
            }
            Err(e) => {
                error!(error = %e, "Read failed");
                events.connection_failed(None, e);
                break;
            }
        }
    }
    debug!("Receiver stopped");
}

/// Hand one message to the session. Returns false once the connection
/// has been failed.
async fn dispatch(session: &Session, events: &Arc<dyn ConnectionEvents>, message: Message) -> bool {
    if !message.is_ack() {
        return match session.notify_received_msg(message).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed to process inbound message");
                events.connection_failed(None, e);
                false
            }
        };
    }

    let Some(token) = session.tokens().get_token_for(&message) else {
        let err = MqttError::unexpected(format!("received {message} with no matching token"));
        error!(error = %err, "Session out of sync with peer");
        events.connection_failed(None, err);
        return false;
    };

    let processed = {
        let _guard = token.lock().await;
        session.notify_received_ack(&message, || events.connected())
    };
    match processed {
        Ok(()) => true,
        Err(e) => {
            error!(kind = %message.kind(), error = %e, "Failed to process ack");
            events.connection_failed(Some(token), e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnAck, Connect, Publish, QoS};
    use crate::testing::mocks::{test_session, RecordingEvents};
    use crate::token::Token;
    use crate::transport::{Codec, JsonFrameCodec, PacketWriter};
    use std::time::Duration;

    fn pipe() -> (PacketWriter, PacketReader) {
        let (client, server) = tokio::io::duplex(4096);
        let codec: Arc<dyn Codec> = Arc::new(JsonFrameCodec);
        let (_, write) = tokio::io::split(server);
        let (read, _) = tokio::io::split(client);
        (
            PacketWriter::new(Box::new(write), codec.clone()),
            PacketReader::new(Box::new(read), codec),
        )
    }

    #[tokio::test]
    async fn test_ack_without_token_is_fatal() {
        // Arrange
        let (session, _notifier) = test_session(10);
        let (mut peer, reader) = pipe();
        let events = Arc::new(RecordingEvents::default());
        let task = spawn(session, reader, events.clone());

        // Act
        peer.write_message(&Message::PubAck { message_id: 123 }).await.unwrap();

        // Assert
        let failure = events.wait_for_failure(Duration::from_secs(1)).await;
        assert!(matches!(failure, MqttError::UnexpectedError { .. }));
        task.stop().await;
    }

    #[tokio::test]
    async fn test_connack_reports_connected() {
        let (session, _notifier) = test_session(10);
        let connect_token = Token::new();
        session
            .send(Message::Connect(Connect::new("c", true, 60)), Some(&connect_token))
            .unwrap();
        let (mut peer, reader) = pipe();
        let events = Arc::new(RecordingEvents::default());
        let task = spawn(session.clone(), reader, events.clone());

        peer.write_message(&Message::ConnAck(ConnAck::accepted(false))).await.unwrap();

        connect_token
            .wait_for_completion(Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(events.connected_count(), 1);
        assert!(session.is_connected());
        task.stop().await;
    }

    #[tokio::test]
    async fn test_refused_connack_fails_with_token() {
        let (session, _notifier) = test_session(10);
        session
            .send(Message::Connect(Connect::new("c", true, 60)), Some(&Token::new()))
            .unwrap();
        let (mut peer, reader) = pipe();
        let events = Arc::new(RecordingEvents::default());
        let task = spawn(session.clone(), reader, events.clone());

        peer.write_message(&Message::ConnAck(ConnAck::refused(5))).await.unwrap();

        let failure = events.wait_for_failure(Duration::from_secs(1)).await;
        assert_eq!(failure, MqttError::NotAuthorized);
        assert!(events.failed_with_token());
        assert!(!session.is_connected());
        task.stop().await;
    }

    #[tokio::test]
    async fn test_peer_close_is_connection_lost() {
        let (session, _notifier) = test_session(10);
        let (peer, reader) = pipe();
        let events = Arc::new(RecordingEvents::default());
        let task = spawn(session, reader, events.clone());

        drop(peer);
        let failure = events.wait_for_failure(Duration::from_secs(1)).await;
        assert!(matches!(failure, MqttError::ConnectionLost { .. }));
        task.stop().await;
    }

    #[tokio::test]
    async fn test_close_during_disconnect_is_quiet() {
        let (session, _notifier) = test_session(10);
        let (peer, reader) = pipe();
        let events = Arc::new(RecordingEvents::default());
        events.set_disconnecting(true);
        let task = spawn(session, reader, events.clone());

        drop(peer);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.failures().is_empty());
        task.stop().await;
    }

    #[tokio::test]
    async fn test_inbound_qos2_answers_pubrec() {
        let (session, _notifier) = test_session(10);
        let (mut peer, reader) = pipe();
        let events = Arc::new(RecordingEvents::default());
        let task = spawn(session.clone(), reader, events);

        let mut publish = Publish::new("t", b"x".to_vec(), QoS::ExactlyOnce);
        publish.message_id = 31;
        peer.write_message(&Message::Publish(publish)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while session.snapshot().inbound_qos2 != 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(session.snapshot().pending_flows, vec!["PUBREC".to_string()]);
        task.stop().await;
    }
}
