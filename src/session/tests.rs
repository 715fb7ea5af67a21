use super::*;
use crate::persistence::MemoryPersistence;
use crate::protocol::{ConnAck, Connect, Subscribe};
use crate::testing::mocks::{
    session_over, test_session, test_session_with_persistence, RecordingCallback,
};
use proptest::prelude::*;

const WAIT: Duration = Duration::from_secs(1);

async fn connect(session: &Session, clean_session: bool, keep_alive_secs: u16) {
    session
        .send(
            Message::Connect(Connect::new("test-client", clean_session, keep_alive_secs)),
            Some(&Token::new()),
        )
        .unwrap();
    assert!(matches!(next(session).await, Message::Connect(_)));
    session
        .notify_received_ack(&Message::ConnAck(ConnAck::accepted(!clean_session)), || {})
        .unwrap();
}

async fn next(session: &Session) -> Message {
    tokio::time::timeout(WAIT, session.get())
        .await
        .expect("sender should not block")
        .expect("session still connected")
}

fn publish(qos: QoS) -> Message {
    Message::Publish(Publish::new("plant/line-3/temp", b"71.2".to_vec(), qos))
}

fn inbound(id: u16, qos: QoS) -> Message {
    let mut publish = Publish::new("cmd/valve", b"open".to_vec(), qos);
    publish.message_id = id;
    Message::Publish(publish)
}

/// Answer an outbound QoS 1 publish the way the receiver and notifier would
fn acknowledge(session: &Session, id: u16) {
    let ack = Message::PubAck { message_id: id };
    let token = session.tokens().get_token_for(&ack).expect("delivery token");
    session.notify_received_ack(&ack, || {}).unwrap();
    session.notify_complete(&token);
}

#[tokio::test]
async fn test_flows_go_before_publishes() {
    let (session, _notifier) = test_session(10);
    connect(&session, true, 0).await;

    session.send(publish(QoS::AtLeastOnce), None).unwrap();
    session.send(Message::PubAck { message_id: 40 }, None).unwrap();

    assert_eq!(next(&session).await, Message::PubAck { message_id: 40 });
    assert_eq!(next(&session).await.message_id(), 1);
}

#[tokio::test]
async fn test_full_window_rejects_publish_with_max_in_flight() {
    // Arrange
    let (session, _notifier) = test_session(2);
    connect(&session, true, 0).await;
    session.send(publish(QoS::AtLeastOnce), None).unwrap();
    session.send(publish(QoS::AtLeastOnce), None).unwrap();
    next(&session).await;
    next(&session).await;

    // Act
    let err = session.send(publish(QoS::AtLeastOnce), None).unwrap_err();

    // Assert
    assert_eq!(err, MqttError::MaxInFlight { max: 2 });
    let snapshot = session.snapshot();
    assert_eq!(snapshot.actual_in_flight, 2);
    assert_eq!(snapshot.ids_in_use, 2);
    assert!(session.window_full());
}

#[tokio::test]
async fn test_window_of_one_sends_strictly_in_turn() {
    // Arrange
    let (session, _notifier) = test_session(1);
    connect(&session, true, 0).await;
    session.send(publish(QoS::AtLeastOnce), None).unwrap();
    session.send(publish(QoS::AtLeastOnce), None).unwrap();

    // Act / Assert
    assert_eq!(next(&session).await.message_id(), 1);
    let blocked = tokio::time::timeout(Duration::from_millis(50), session.get()).await;
    assert!(blocked.is_err(), "second publish must wait for the window");

    acknowledge(&session, 1);
    assert_eq!(session.snapshot().actual_in_flight, 0);
    assert_eq!(next(&session).await.message_id(), 2);
    assert_eq!(session.snapshot().actual_in_flight, 1);
}

#[tokio::test]
async fn test_flows_bypass_full_window() {
    let (session, _notifier) = test_session(1);
    connect(&session, true, 0).await;
    session.send(publish(QoS::AtLeastOnce), None).unwrap();
    next(&session).await;

    session.send(Message::PubAck { message_id: 9 }, None).unwrap();

    assert_eq!(next(&session).await, Message::PubAck { message_id: 9 });
}

#[tokio::test]
async fn test_qos2_outbound_handshake() {
    // Arrange
    let (session, _notifier, store) = test_session_with_persistence(10);
    connect(&session, true, 0).await;
    let token = Token::delivery();
    session.send(publish(QoS::ExactlyOnce), Some(&token)).unwrap();
    next(&session).await;
    assert!(store.contains_key("s-1").unwrap());

    // Act: PUBREC swaps the publish for a PUBREL
    session
        .notify_received_ack(&Message::PubRec { message_id: 1 }, || {})
        .unwrap();

    // Assert
    assert_eq!(session.snapshot().pending_flows, vec!["PUBREL".to_string()]);
    assert!(store.contains_key("sc-1").unwrap());
    assert!(!token.is_complete());
    assert_eq!(next(&session).await, Message::PubRel { message_id: 1 });
    assert_eq!(session.snapshot().in_flight_pubrels, 1);

    session
        .notify_received_ack(&Message::PubComp { message_id: 1 }, || {})
        .unwrap();
    assert!(token.is_complete());
    session.notify_complete(&token);

    let snapshot = session.snapshot();
    assert_eq!(snapshot.outbound_qos2, 0);
    assert_eq!(snapshot.in_flight_pubrels, 0);
    assert_eq!(snapshot.actual_in_flight, 0);
    assert_eq!(snapshot.ids_in_use, 0);
    assert!(store.keys().unwrap().is_empty());
}

#[tokio::test]
async fn test_qos0_completes_once_written() {
    let (session, _notifier) = test_session(10);
    connect(&session, true, 0).await;
    let token = Token::delivery();
    session.send(publish(QoS::AtMostOnce), Some(&token)).unwrap();

    let sent = next(&session).await;
    session.notify_sent(&sent);

    assert!(token.is_complete());
    assert!(token.is_sent());
    let snapshot = session.snapshot();
    assert_eq!(snapshot.outbound_qos0, 0);
    assert_eq!(snapshot.actual_in_flight, 0);
    assert_eq!(snapshot.ids_in_use, 0);
}

#[tokio::test]
async fn test_restore_rebuilds_inflight_tables() {
    // Arrange: one session leaves two QoS 1 and one confirmed QoS 2 publish behind
    let store = Arc::new(MemoryPersistence::new());
    store.open("test-client", "tcp://localhost:1883").unwrap();
    let (first, _notifier) = session_over(store.clone(), 10);
    connect(&first, false, 0).await;
    first.send(publish(QoS::AtLeastOnce), None).unwrap();
    first.send(publish(QoS::AtLeastOnce), None).unwrap();
    first.send(publish(QoS::ExactlyOnce), None).unwrap();
    for _ in 0..3 {
        next(&first).await;
    }
    first
        .notify_received_ack(&Message::PubRec { message_id: 3 }, || {})
        .unwrap();

    let orphan = serde_json::to_vec(&Message::PubRel { message_id: 99 }).unwrap();
    store.put("sc-99", &orphan).unwrap();
    store.put("s-50", br#"{"kind":"publish","message_id":50"#).unwrap();

    // Act
    let (second, _notifier) = session_over(store.clone(), 10);
    second.restore_state().unwrap();

    // Assert
    let snapshot = second.snapshot();
    assert_eq!(snapshot.outbound_qos1, 2);
    assert_eq!(snapshot.outbound_qos2, 1);
    assert_eq!(snapshot.ids_in_use, 3);
    assert_eq!(second.tokens().count(), 3);
    assert!(!store.contains_key("sc-99").unwrap());
    assert!(!store.contains_key("s-50").unwrap());
    assert_eq!(second.metrics().snapshot().messages_restored, 3);
    let fresh = second.allocate_message_id().unwrap();
    assert!(fresh > 3);
    second.release_message_id(fresh);

    connect(&second, false, 0).await;
    let snapshot = second.snapshot();
    assert_eq!(snapshot.pending_messages, vec![1, 2]);
    assert_eq!(snapshot.pending_flows, vec!["PUBREL".to_string()]);

    assert_eq!(next(&second).await, Message::PubRel { message_id: 3 });
    match next(&second).await {
        Message::Publish(p) => {
            assert_eq!(p.message_id, 1);
            assert!(p.dup);
        }
        other => panic!("expected publish, got {other}"),
    }
}

#[tokio::test]
async fn test_restore_rejects_corrupt_record() {
    let (session, _notifier, store) = test_session_with_persistence(10);
    store.put("s-7", b"not a record").unwrap();

    let err = session.restore_state().unwrap_err();

    assert!(matches!(err, MqttError::Persistence(_)));
}

#[tokio::test]
async fn test_clean_connack_discards_previous_state() {
    let (session, _notifier, store) = test_session_with_persistence(10);
    session.send(publish(QoS::AtLeastOnce), None).unwrap();
    assert!(store.contains_key("s-1").unwrap());

    connect(&session, true, 0).await;

    let snapshot = session.snapshot();
    assert_eq!(snapshot.outbound_qos1, 0);
    assert_eq!(snapshot.ids_in_use, 0);
    assert!(snapshot.pending_messages.is_empty());
    assert!(store.keys().unwrap().is_empty());
    assert_eq!(session.tokens().count(), 0);
}

#[tokio::test]
async fn test_ack_without_token_is_unexpected() {
    let (session, _notifier) = test_session(10);

    let err = session
        .notify_received_ack(&Message::PubAck { message_id: 12 }, || {})
        .unwrap_err();

    assert!(matches!(err, MqttError::UnexpectedError { .. }));
}

#[tokio::test]
async fn test_refused_connack_is_an_error() {
    let (session, _notifier) = test_session(10);
    session
        .send(Message::Connect(Connect::new("c", true, 0)), Some(&Token::new()))
        .unwrap();
    next(&session).await;

    let err = session
        .notify_received_ack(&Message::ConnAck(ConnAck::refused(4)), || {
            panic!("must not report connected")
        })
        .unwrap_err();

    assert_eq!(err, MqttError::FailedAuthentication);
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_inbound_qos2_waits_for_pubrel() {
    // Arrange
    let (session, _notifier, store) = test_session_with_persistence(10);

    // Act
    session
        .notify_received_msg(inbound(5, QoS::ExactlyOnce))
        .await
        .unwrap();

    // Assert
    assert_eq!(session.snapshot().inbound_qos2, 1);
    assert!(store.contains_key("r-5").unwrap());
    assert_eq!(session.snapshot().pending_flows, vec!["PUBREC".to_string()]);

    session
        .notify_received_msg(Message::PubRel { message_id: 5 })
        .await
        .unwrap();
    session.message_arrived_complete(5, QoS::ExactlyOnce).unwrap();

    let snapshot = session.snapshot();
    assert_eq!(snapshot.inbound_qos2, 0);
    assert_eq!(
        snapshot.pending_flows,
        vec!["PUBREC".to_string(), "PUBCOMP".to_string()]
    );
    assert!(!store.contains_key("r-5").unwrap());
}

#[tokio::test]
async fn test_pubrel_for_unknown_message_still_completes() {
    // Arrange
    let (session, notifier) = test_session(10);
    let callback = Arc::new(RecordingCallback::default());
    notifier.set_callback(Some(callback.clone()));
    notifier.start(session.clone(), Arc::new(|_| {}));

    // Act
    session
        .notify_received_msg(Message::PubRel { message_id: 9 })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Assert: acknowledged without a second delivery
    assert_eq!(session.snapshot().pending_flows, vec!["PUBCOMP".to_string()]);
    assert_eq!(callback.message_count(), 0);
    notifier.stop().await;
}

#[tokio::test]
async fn test_pubrel_during_quiesce_delivers_and_completes() {
    // Arrange: an unacknowledged publish keeps the quiesce waiting
    let (session, notifier) = test_session(10);
    let callback = Arc::new(RecordingCallback::default());
    notifier.set_callback(Some(callback.clone()));
    notifier.start(session.clone(), Arc::new(|_| {}));
    connect(&session, true, 0).await;
    session
        .notify_received_msg(inbound(5, QoS::ExactlyOnce))
        .await
        .unwrap();
    assert_eq!(next(&session).await, Message::PubRec { message_id: 5 });
    session.send(publish(QoS::AtLeastOnce), None).unwrap();
    next(&session).await;

    let quiescing = {
        let session = session.clone();
        tokio::spawn(async move { session.quiesce(Duration::from_secs(30)).await })
    };
    tokio::time::timeout(WAIT, async {
        while !session.snapshot().quiescing {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    // Act
    session
        .notify_received_msg(Message::PubRel { message_id: 5 })
        .await
        .unwrap();

    // Assert
    let arrived = callback.wait_for_messages(1, WAIT).await;
    assert_eq!(arrived[0].message_id, 5);
    assert_eq!(next(&session).await, Message::PubComp { message_id: 5 });
    assert_eq!(session.snapshot().inbound_qos2, 0);
    assert!(!quiescing.is_finished());

    session
        .notify_received_ack(&Message::PubAck { message_id: 1 }, || {})
        .unwrap();
    tokio::time::timeout(WAIT, quiescing)
        .await
        .expect("drained quiesce returns")
        .unwrap();
    notifier.stop().await;
}

#[tokio::test]
async fn test_qos1_arrival_acked_on_completion() {
    let (session, _notifier) = test_session(10);
    session
        .notify_received_msg(inbound(8, QoS::AtLeastOnce))
        .await
        .unwrap();
    assert!(session.snapshot().pending_flows.is_empty());

    session.message_arrived_complete(8, QoS::AtLeastOnce).unwrap();

    assert_eq!(session.snapshot().pending_flows, vec!["PUBACK".to_string()]);
}

#[tokio::test]
async fn test_undo_rolls_back_a_queued_publish() {
    let (session, _notifier, store) = test_session_with_persistence(10);
    let queued = session.send(publish(QoS::AtLeastOnce), None).unwrap();

    session.undo(queued.as_publish().unwrap());

    let snapshot = session.snapshot();
    assert_eq!(snapshot.outbound_qos1, 0);
    assert!(snapshot.pending_messages.is_empty());
    assert_eq!(snapshot.ids_in_use, 0);
    assert_eq!(session.tokens().count(), 0);
    assert!(!store.contains_key("s-1").unwrap());
}

#[tokio::test]
async fn test_zero_quiesce_abandons_queues_immediately() {
    let (session, _notifier) = test_session(10);
    connect(&session, true, 0).await;
    session.send(publish(QoS::AtLeastOnce), None).unwrap();
    session.send(Message::PubAck { message_id: 3 }, None).unwrap();

    session.quiesce(Duration::ZERO).await;

    let snapshot = session.snapshot();
    assert!(snapshot.pending_messages.is_empty());
    assert!(snapshot.pending_flows.is_empty());
    assert!(!snapshot.quiescing);
}

#[tokio::test]
async fn test_quiesce_waits_for_outstanding_delivery() {
    // Arrange
    let (session, notifier) = test_session(10);
    notifier.start(session.clone(), Arc::new(|_| {}));
    connect(&session, true, 0).await;
    session.send(publish(QoS::AtLeastOnce), None).unwrap();
    next(&session).await;

    // Act
    let quiescing = {
        let session = session.clone();
        tokio::spawn(async move { session.quiesce(Duration::from_secs(30)).await })
    };
    tokio::time::timeout(WAIT, async {
        while !session.snapshot().quiescing {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    // Assert: arrivals are ignored while draining
    session
        .notify_received_msg(inbound(21, QoS::ExactlyOnce))
        .await
        .unwrap();
    assert_eq!(session.snapshot().inbound_qos2, 0);
    assert!(!quiescing.is_finished());

    session
        .notify_received_ack(&Message::PubAck { message_id: 1 }, || {})
        .unwrap();
    tokio::time::timeout(WAIT, quiescing)
        .await
        .expect("drained quiesce returns")
        .unwrap();
    assert_eq!(session.tokens().count(), 0);
    notifier.stop().await;
}

#[tokio::test]
async fn test_keep_alive_timeouts() {
    let (session, _notifier) = test_session(10);
    connect(&session, true, 1).await;

    // ping outstanding, answer overdue
    session.set_activity_for_test(Duration::from_millis(1150), Duration::from_millis(100), 1);
    assert_eq!(session.check_for_activity().unwrap_err(), MqttError::ClientTimeout);

    // ping outstanding, still within tolerance
    session.set_activity_for_test(Duration::from_millis(1000), Duration::from_millis(100), 1);
    let step = session.check_for_activity().unwrap();
    assert!(step.ping.is_none());

    // nothing written for two intervals
    session.set_activity_for_test(Duration::from_millis(100), Duration::from_millis(2000), 0);
    assert_eq!(session.check_for_activity().unwrap_err(), MqttError::WriteTimeout);
}

#[tokio::test]
async fn test_ping_round_trip() {
    // Arrange
    let (session, _notifier) = test_session(10);
    connect(&session, true, 1).await;
    session.set_activity_for_test(Duration::from_millis(950), Duration::from_millis(950), 0);

    // Act
    let step = session.check_for_activity().unwrap();

    // Assert
    let ping = step.ping.expect("ping queued");
    assert_eq!(step.next_check, Some(Duration::from_secs(1)));
    let sent = next(&session).await;
    assert_eq!(sent, Message::PingReq);
    session.notify_sent(&sent);
    assert_eq!(session.snapshot().pings_outstanding, 1);

    session.notify_received_ack(&Message::PingResp, || {}).unwrap();
    assert!(ping.is_complete());
    assert_eq!(session.snapshot().pings_outstanding, 0);
    assert!(session.tokens().get_token("Ping").is_none());
}

#[tokio::test]
async fn test_keep_alive_idle_when_disconnected() {
    let (session, _notifier) = test_session(10);

    let step = session.check_for_activity().unwrap();

    assert!(step.ping.is_none());
    assert_eq!(step.next_check, Some(Duration::from_secs(60)));
}

#[tokio::test]
async fn test_get_releases_sender_when_not_connected() {
    let (session, _notifier) = test_session(10);
    session.send(Message::PubAck { message_id: 1 }, None).unwrap();

    let got = tokio::time::timeout(WAIT, session.get()).await.unwrap();

    assert!(got.is_none());
}

#[tokio::test]
async fn test_resolve_old_tokens_fails_outstanding_work() {
    // Arrange
    let (session, _notifier) = test_session(10);
    connect(&session, true, 0).await;
    let delivery = Token::delivery();
    let subscribe = Token::new();
    session.send(publish(QoS::AtLeastOnce), Some(&delivery)).unwrap();
    session
        .send(
            Message::Subscribe(Subscribe {
                message_id: 0,
                filters: vec![("cmd/#".to_string(), QoS::AtLeastOnce)],
            }),
            Some(&subscribe),
        )
        .unwrap();

    // Act
    let lost = MqttError::connection_lost("peer reset");
    let tokens = session.resolve_old_tokens(Some(lost.clone())).await;

    // Assert
    assert_eq!(tokens.len(), 2);
    assert_eq!(delivery.error(), Some(lost.clone()));
    assert_eq!(subscribe.error(), Some(lost));
    assert_eq!(session.tokens().count(), 1, "delivery token stays for redelivery");
}

#[tokio::test]
async fn test_disconnect_keeps_tables_for_persistent_session() {
    let (session, _notifier) = test_session(10);
    connect(&session, false, 0).await;
    session.send(publish(QoS::AtLeastOnce), None).unwrap();
    next(&session).await;

    session.disconnected(Some(&MqttError::connection_lost("gone")));

    let snapshot = session.snapshot();
    assert!(!snapshot.connected);
    assert_eq!(snapshot.outbound_qos1, 1);
    assert!(snapshot.pending_messages.is_empty());

    session.restore_inflight();
    assert_eq!(session.snapshot().pending_messages, vec![1]);
}

#[derive(Debug, Clone)]
enum Op {
    Publish,
    Get,
    Ack,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Publish), Just(Op::Get), Just(Op::Ack)]
}

proptest! {
    #[test]
    fn prop_in_flight_never_exceeds_window(
        max_in_flight in 1u16..5,
        ops in prop::collection::vec(op_strategy(), 1..60),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (session, _notifier) = test_session(max_in_flight);
            session.force_connected_for_test();
            let mut outstanding = VecDeque::new();

            for op in ops {
                match op {
                    Op::Publish => match session.send(publish(QoS::AtLeastOnce), None) {
                        Ok(_) => {}
                        Err(MqttError::MaxInFlight { max }) => assert_eq!(max, max_in_flight),
                        Err(other) => panic!("unexpected error {other}"),
                    },
                    Op::Get => {
                        let snapshot = session.snapshot();
                        if !snapshot.pending_messages.is_empty()
                            && snapshot.actual_in_flight < max_in_flight
                        {
                            outstanding.push_back(next(&session).await.message_id());
                        }
                    }
                    Op::Ack => {
                        if let Some(id) = outstanding.pop_front() {
                            acknowledge(&session, id);
                        }
                    }
                }
                let snapshot = session.snapshot();
                assert!(snapshot.actual_in_flight <= max_in_flight);
                assert_eq!(usize::from(snapshot.actual_in_flight), outstanding.len());
            }
        });
    }
}
