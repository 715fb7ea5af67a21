//! End-to-end client lifecycle tests against the scripted in-memory broker
//!
//! Each test drives an [`MqttClient`] through [`MockTransport`], so the
//! sender, receiver, notifier and pinger tasks all run for real.

use mqtt_session::comms::BufferOptions;
use mqtt_session::persistence::MemoryPersistence;
use mqtt_session::testing::{BrokerScript, MockTransport, RecordingCallback};
use mqtt_session::{ClientConfig, ConnectionState, Message, MqttClient, MqttError, Publish, QoS};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

fn test_config() -> ClientConfig {
    let mut config = ClientConfig::new("tcp://mock-broker:1883");
    config.connection.client_id = "lifecycle-client".to_string();
    config.connection.keep_alive_secs = 0;
    config.connection.quiesce_timeout_ms = 500;
    config.connection.disconnect_timeout_ms = 500;
    config
}

fn client_with(config: ClientConfig, transport: Arc<MockTransport>) -> MqttClient {
    MqttClient::with_transport(config, transport, Arc::new(MemoryPersistence::new())).unwrap()
}

fn inbound(message_id: u16, qos: QoS, payload: &[u8]) -> Message {
    let mut publish = Publish::new("cmd/valve", payload.to_vec(), qos);
    publish.message_id = message_id;
    Message::Publish(publish)
}

#[tokio::test]
async fn test_manual_acks_defer_puback_until_application_confirms() {
    // Arrange
    let mut config = test_config();
    config.connection.manual_acks = true;
    let transport = MockTransport::new(BrokerScript::default());
    let client = client_with(config, transport.clone());
    let callback = Arc::new(RecordingCallback::default());
    client.set_callback(Some(callback.clone()));
    client.connect().await.unwrap();
    let broker = transport.broker(0).unwrap();

    // Act
    broker.send(inbound(9, QoS::AtLeastOnce, b"open")).await.unwrap();
    callback.wait_for_messages(1, WAIT).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Assert: nothing but CONNECT until the application acknowledges
    assert_eq!(broker.received().len(), 1);

    client.message_arrived_complete(9, QoS::AtLeastOnce).unwrap();
    let received = broker.wait_for_messages(2, WAIT).await;
    assert_eq!(received[1], Message::PubAck { message_id: 9 });
}

#[tokio::test]
async fn test_inbound_qos2_is_delivered_exactly_once() {
    // Arrange
    let transport = MockTransport::new(BrokerScript::default());
    let client = client_with(test_config(), transport.clone());
    let callback = Arc::new(RecordingCallback::default());
    client.set_callback(Some(callback.clone()));
    client.connect().await.unwrap();
    let broker = transport.broker(0).unwrap();

    // Act
    broker.send(inbound(5, QoS::ExactlyOnce, b"once")).await.unwrap();
    let received = broker.wait_for_messages(2, WAIT).await;
    assert_eq!(received[1], Message::PubRec { message_id: 5 });
    assert_eq!(callback.message_count(), 0);

    broker.send(Message::PubRel { message_id: 5 }).await.unwrap();
    callback.wait_for_messages(1, WAIT).await;
    broker.wait_for_messages(3, WAIT).await;

    // the broker never saw our PUBCOMP and releases again
    broker.send(Message::PubRel { message_id: 5 }).await.unwrap();
    let received = broker.wait_for_messages(4, WAIT).await;

    // Assert
    assert_eq!(received[2], Message::PubComp { message_id: 5 });
    assert_eq!(received[3], Message::PubComp { message_id: 5 });
    assert_eq!(callback.message_count(), 1);
}

#[tokio::test]
async fn test_lost_connection_is_reported_and_reconnect_succeeds() {
    // Arrange
    let transport = MockTransport::new(BrokerScript::default());
    let client = client_with(test_config(), transport.clone());
    let callback = Arc::new(RecordingCallback::default());
    client.set_callback(Some(callback.clone()));
    client.connect().await.unwrap();

    // Act
    transport.broker(0).unwrap().close();
    let causes = callback.wait_for_connection_lost(1, WAIT).await;

    // Assert
    assert!(matches!(causes[0], MqttError::ConnectionLost { .. }));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    client.connect().await.unwrap();
    let connects = callback.wait_for_connects(2, WAIT).await;
    assert!(!connects[0].0);
    assert!(connects[1].0, "second connect is a reconnect");
    assert_eq!(connects[1].1, "tcp://mock-broker:1883");
    assert_eq!(transport.start_count(), 2);

    let metrics = client.metrics();
    assert_eq!(metrics.connection.connections_established, 2);
    assert_eq!(metrics.connection.connections_lost, 1);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_server_fails_connect() {
    let transport = MockTransport::new(BrokerScript::default());
    transport.fail_next_starts(1);
    let client = client_with(test_config(), transport.clone());

    let err = client.connect().await.unwrap_err();

    assert!(matches!(err, MqttError::ConnectionLost { .. }));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // the next attempt reaches the broker
    client.connect().await.unwrap();
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_refused_connect_reports_return_code() {
    let transport = MockTransport::new(BrokerScript {
        connack_code: 5,
        ..BrokerScript::default()
    });
    let client = client_with(test_config(), transport);

    let err = client.connect().await.unwrap_err();

    assert_eq!(err, MqttError::NotAuthorized);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_offline_buffer_evicts_oldest_and_drains_on_connect() {
    // Arrange
    let mut config = test_config();
    config.buffer = BufferOptions {
        enabled: true,
        size: 2,
        persist: false,
        delete_oldest: true,
    };
    let transport = MockTransport::new(BrokerScript::default());
    let client = client_with(config, transport.clone());

    // Act
    let tokens: Vec<_> = (0..3)
        .map(|i| {
            client
                .publish("telemetry/buffered", vec![i], QoS::AtLeastOnce, false)
                .unwrap()
        })
        .collect();
    assert_eq!(client.connection().buffered_count(), 2);

    let evicted = tokens[0].wait_for_completion(Some(WAIT)).await;
    client.connect().await.unwrap();

    // Assert
    assert_eq!(evicted, Err(MqttError::DisconnectedBufferFull { size: 2 }));
    for token in &tokens[1..] {
        let response = token.wait_for_completion(Some(WAIT)).await.unwrap();
        assert!(matches!(response, Some(Message::PubAck { .. })));
    }
    let received = transport.broker(0).unwrap().wait_for_messages(3, WAIT).await;
    let payloads: Vec<Vec<u8>> = received
        .iter()
        .filter_map(|m| m.as_publish().map(|p| p.payload.clone()))
        .collect();
    assert_eq!(payloads, vec![vec![1], vec![2]]);
    assert_eq!(client.connection().buffered_count(), 0);
}

#[tokio::test]
async fn test_full_window_rejects_publish() {
    // Arrange
    let mut config = test_config();
    config.connection.max_in_flight = 2;
    config.connection.quiesce_timeout_ms = 0;
    let transport = MockTransport::new(BrokerScript {
        ack_publishes: false,
        ..BrokerScript::default()
    });
    let client = client_with(config, transport);
    client.connect().await.unwrap();

    // Act
    for i in 0..2u8 {
        let token = client
            .publish("telemetry/window", vec![i], QoS::AtLeastOnce, false)
            .unwrap();
        token.wait_until_sent(WAIT).await.unwrap();
    }
    let err = client
        .publish("telemetry/window", vec![2], QoS::AtLeastOnce, false)
        .unwrap_err();

    // Assert
    assert_eq!(err, MqttError::MaxInFlight { max: 2 });
    assert_eq!(client.pending_delivery_tokens().len(), 2);

    client.disconnect_forcibly().await.unwrap();
}

#[tokio::test]
async fn test_close_is_terminal() {
    let transport = MockTransport::new(BrokerScript::default());
    let client = client_with(test_config(), transport);
    client.connect().await.unwrap();

    assert_eq!(client.close(false).await, Err(MqttError::AlreadyConnected));
    client.disconnect().await.unwrap();
    client.close(false).await.unwrap();

    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.connect().await, Err(MqttError::ClientClosed));
    assert_eq!(
        client
            .publish("t", b"x".to_vec(), QoS::AtMostOnce, false)
            .unwrap_err(),
        MqttError::ClientClosed
    );
}

#[tokio::test]
async fn test_disconnect_sends_disconnect_and_releases_tokens() {
    let transport = MockTransport::new(BrokerScript::default());
    let client = client_with(test_config(), transport.clone());
    client.connect().await.unwrap();

    client.disconnect().await.unwrap();

    let received = transport.broker(0).unwrap().wait_for_messages(2, WAIT).await;
    assert_eq!(received[1], Message::Disconnect);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.connection().tokens().count(), 0);
    assert_eq!(client.disconnect().await, Err(MqttError::AlreadyDisconnected));
}
