//! Sender task: drains the session queues onto the transport

use super::{ConnectionEvents, TaskHandle};
use crate::error::MqttResult;
use crate::protocol::Message;
use crate::session::Session;
use crate::transport::PacketWriter;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, Instrument};

/// Spawn the sender for one connection
pub(crate) fn spawn(
    session: Arc<Session>,
    writer: PacketWriter,
    events: Arc<dyn ConnectionEvents>,
) -> TaskHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(
        run(session, writer, stop_rx, events).instrument(crate::comms_span!(task = "sender")),
    );
    TaskHandle::new("sender", stop_tx, handle)
}

enum Step {
    Continue,
    Stop,
}

async fn run(
    session: Arc<Session>,
    mut writer: PacketWriter,
    mut stop_rx: watch::Receiver<bool>,
    events: Arc<dyn ConnectionEvents>,
) {
    debug!("Sender started");
    loop {
        let next = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            next = session.get() => next,
        };
        let Some(message) = next else {
            break;
        };

        match send_one(&session, &mut writer, &mut stop_rx, &message).await {
            Ok(Step::Continue) => {}
            Ok(Step::Stop) => break,
            Err(e) => {
                error!(
                    kind = %message.kind(),
                    message_id = message.message_id(),
                    error = %e,
                    "Write failed"
                );
                events.connection_failed(None, e);
                break;
            }
        }
    }
    debug!("Sender stopped");
}

async fn send_one(
    session: &Session,
    writer: &mut PacketWriter,
    stop_rx: &mut watch::Receiver<bool>,
    message: &Message,
) -> MqttResult<Step> {
    if message.is_ack() {
        writer.write_message(message).await?;
        session.notify_sent(message);
        return Ok(Step::Continue);
    }

    let Some(token) = session.tokens().get_token_for(message) else {
        debug!(key = %message.key(), "No token for queued message, skipped");
        return Ok(Step::Continue);
    };

    // held across write + notify_sent so the ack for this message cannot be
    // processed before its send-side bookkeeping is done
    let _guard = token.lock().await;
    tokio::select! {
        biased;
        _ = stop_rx.changed() => return Ok(Step::Stop),
        written = writer.write_message(message) => written?,
    }
    session.notify_sent(message);
    debug!(kind = %message.kind(), message_id = message.message_id(), "Sent");
    Ok(Step::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Publish, QoS};
    use crate::testing::mocks::{test_session, RecordingEvents};
    use crate::transport::{Codec, JsonFrameCodec, PacketReader};
    use crate::token::Token;
    use std::time::Duration;

    fn pipe() -> (PacketWriter, PacketReader) {
        let (client, server) = tokio::io::duplex(4096);
        let codec: Arc<dyn Codec> = Arc::new(JsonFrameCodec);
        let (_, write) = tokio::io::split(client);
        let (read, _) = tokio::io::split(server);
        (
            PacketWriter::new(Box::new(write), codec.clone()),
            PacketReader::new(Box::new(read), codec),
        )
    }

    #[tokio::test]
    async fn test_writes_flows_before_publishes() {
        // Arrange
        let (session, _notifier) = test_session(10);
        session.force_connected_for_test();
        let (writer, mut reader) = pipe();
        session
            .send(
                Message::Publish(Publish::new("t", vec![], QoS::AtLeastOnce)),
                Some(&Token::delivery()),
            )
            .unwrap();
        session.send(Message::PubAck { message_id: 40 }, None).unwrap();

        // Act
        let events = Arc::new(RecordingEvents::default());
        let task = spawn(session.clone(), writer, events.clone());

        // Assert
        let first = reader.read_message().await.unwrap().unwrap();
        let second = reader.read_message().await.unwrap().unwrap();
        assert_eq!(first, Message::PubAck { message_id: 40 });
        assert!(matches!(second, Message::Publish(ref p) if p.message_id == 1));
        assert_eq!(session.snapshot().actual_in_flight, 1);

        task.stop().await;
        assert!(events.failures().is_empty());
    }

    #[tokio::test]
    async fn test_exits_when_session_disconnects() {
        let (session, _notifier) = test_session(10);
        session.force_connected_for_test();
        let (writer, _reader) = pipe();
        let events = Arc::new(RecordingEvents::default());
        let task = spawn(session.clone(), writer, events);

        session.disconnected(None);
        tokio::time::timeout(Duration::from_secs(1), task.stop())
            .await
            .expect("sender exits");
    }

    #[tokio::test]
    async fn test_write_failure_reports_connection_failed() {
        let (session, _notifier) = test_session(10);
        session.force_connected_for_test();
        let (writer, reader) = pipe();
        drop(reader);
        let events = Arc::new(RecordingEvents::default());
        let task = spawn(session.clone(), writer, events.clone());

        session.send(Message::PubAck { message_id: 2 }, None).unwrap();
        events.wait_for_failure(Duration::from_secs(1)).await;
        task.stop().await;
    }
}
