//! Offline publish buffer
//!
//! Holds publishes made while the client is not connected so they can be
//! sent after the next successful connect. Optionally each entry is written
//! to the durable store under its `sb-` key with a message id allocated at
//! buffering time.

use crate::error::{MqttError, MqttResult};
use crate::protocol::Message;
use crate::session::Session;
use crate::token::Token;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Offline buffering behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferOptions {
    pub enabled: bool,
    pub size: usize,
    pub persist: bool,
    pub delete_oldest: bool,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            size: 5000,
            persist: false,
            delete_oldest: false,
        }
    }
}

/// One buffered publish and the token its caller is waiting on
#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub message: Message,
    pub token: Token,
}

/// FIFO of publishes waiting for a connection
pub struct DisconnectedBuffer {
    options: BufferOptions,
    queue: Mutex<VecDeque<BufferedMessage>>,
}

impl DisconnectedBuffer {
    pub fn new(options: BufferOptions) -> Self {
        Self {
            options,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<BufferedMessage>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn options(&self) -> &BufferOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    /// Buffer `message`. When full, the oldest entry is evicted and failed if
    /// `delete_oldest` is set, otherwise the call fails with
    /// `DisconnectedBufferFull`.
    pub fn put(
        &self,
        session: &Session,
        mut message: Message,
        token: Token,
    ) -> MqttResult<Message> {
        let Some(publish) = message.as_publish().cloned() else {
            return Err(MqttError::NotConnected);
        };

        let evicted = {
            let mut queue = self.queue();
            if queue.len() >= self.options.size {
                if !self.options.delete_oldest {
                    return Err(MqttError::DisconnectedBufferFull {
                        size: self.options.size,
                    });
                }
                queue.pop_front()
            } else {
                None
            }
        };
        if let Some(evicted) = evicted {
            self.discard(session, evicted);
        }

        if self.options.persist {
            let id = session.allocate_message_id()?;
            message.set_message_id(id);
            if let Err(e) = session.persist_buffered(&message) {
                session.release_message_id(id);
                return Err(e);
            }
        }

        let mut tracked = publish;
        tracked.message_id = message.message_id();
        token.set_message(tracked);
        debug!(
            message_id = message.message_id(),
            buffered = self.len() + 1,
            "Buffered publish while offline"
        );
        self.queue().push_back(BufferedMessage {
            message: message.clone(),
            token,
        });
        Ok(message)
    }

    fn discard(&self, session: &Session, evicted: BufferedMessage) {
        let id = evicted.message.message_id();
        warn!(message_id = id, "Offline buffer full, evicting oldest publish");
        if id != 0 {
            session.unpersist_buffered(id);
            session.release_message_id(id);
        }
        session.notify_result(
            None,
            &evicted.token,
            Some(MqttError::DisconnectedBufferFull {
                size: self.options.size,
            }),
        );
    }

    /// Take the oldest entry
    pub fn pop(&self) -> Option<BufferedMessage> {
        self.queue().pop_front()
    }

    /// Return an entry that could not be sent yet to the head of the buffer
    pub fn push_front(&self, entry: BufferedMessage) {
        self.queue().push_front(entry);
    }

    /// Drop everything, releasing ids and durable records
    pub fn clear(&self, session: &Session) -> Vec<BufferedMessage> {
        let drained: Vec<_> = self.queue().drain(..).collect();
        for entry in &drained {
            let id = entry.message.message_id();
            if id != 0 {
                session.unpersist_buffered(id);
                session.release_message_id(id);
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{Persistence, RecordKind};
    use crate::protocol::{Publish, QoS};
    use crate::testing::mocks::test_session_with_persistence;

    fn publish(topic: &str) -> Message {
        Message::Publish(Publish::new(topic, b"offline".to_vec(), QoS::AtLeastOnce))
    }

    fn options(size: usize, persist: bool, delete_oldest: bool) -> BufferOptions {
        BufferOptions {
            enabled: true,
            size,
            persist,
            delete_oldest,
        }
    }

    #[tokio::test]
    async fn test_full_buffer_rejects_new_publish() {
        let (session, _notifier, _store) = test_session_with_persistence(10);
        let buffer = DisconnectedBuffer::new(options(1, false, false));

        buffer.put(&session, publish("a"), Token::delivery()).unwrap();
        let err = buffer.put(&session, publish("b"), Token::delivery()).unwrap_err();

        assert_eq!(err, MqttError::DisconnectedBufferFull { size: 1 });
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_oldest_evicts_and_fails_token() {
        // Arrange
        let (session, _notifier, _store) = test_session_with_persistence(10);
        let buffer = DisconnectedBuffer::new(options(2, false, true));
        let oldest = Token::delivery();

        // Act
        buffer.put(&session, publish("a"), oldest.clone()).unwrap();
        buffer.put(&session, publish("b"), Token::delivery()).unwrap();
        buffer.put(&session, publish("c"), Token::delivery()).unwrap();

        // Assert
        assert_eq!(buffer.len(), 2);
        assert_eq!(
            oldest.error(),
            Some(MqttError::DisconnectedBufferFull { size: 2 })
        );
        let head = buffer.pop().unwrap();
        assert_eq!(head.message.as_publish().unwrap().topic, "b");
    }

    #[tokio::test]
    async fn test_persisted_entries_get_ids_and_records() {
        let (session, _notifier, store) = test_session_with_persistence(10);
        let buffer = DisconnectedBuffer::new(options(10, true, false));

        let queued = buffer.put(&session, publish("a"), Token::delivery()).unwrap();
        let id = queued.message_id();

        assert_ne!(id, 0);
        let key = crate::persistence::key_for(RecordKind::SentBuffered, id);
        assert!(store.contains_key(&key).unwrap());

        buffer.clear(&session);
        assert!(!store.contains_key(&key).unwrap());
        assert_eq!(session.snapshot().ids_in_use, 0);
    }

    #[tokio::test]
    async fn test_pop_and_push_front_keep_order() {
        let (session, _notifier, _store) = test_session_with_persistence(10);
        let buffer = DisconnectedBuffer::new(options(10, false, false));
        buffer.put(&session, publish("first"), Token::delivery()).unwrap();
        buffer.put(&session, publish("second"), Token::delivery()).unwrap();

        let head = buffer.pop().unwrap();
        buffer.push_front(head);

        let topics: Vec<_> = std::iter::from_fn(|| buffer.pop())
            .map(|e| e.message.as_publish().unwrap().topic.clone())
            .collect();
        assert_eq!(topics, vec!["first", "second"]);
    }

    #[test]
    fn test_defaults() {
        let options = BufferOptions::default();
        assert!(!options.enabled);
        assert_eq!(options.size, 5000);
    }
}
