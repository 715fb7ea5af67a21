//! Durable store for in-flight session state
//!
//! The session only needs a key/record contract. Keys are namespaced by
//! prefix, see [`key_for`] and [`RecordKind`]; records are opaque bytes.

use crate::protocol::Message;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub mod file;
pub mod memory;

pub use file::FilePersistence;
pub use memory::MemoryPersistence;

/// Errors raised by a durable store
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Persistence store is not open")]
    NotOpen,

    #[error("Record not found: {key}")]
    NotFound { key: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl PersistenceError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Key/record store consumed by the session
///
/// Implementations use interior mutability: the session calls the store from
/// inside its own critical sections and never concurrently for the same key.
pub trait Persistence: Send + Sync {
    fn open(&self, client_id: &str, server_uri: &str) -> Result<(), PersistenceError>;
    fn close(&self) -> Result<(), PersistenceError>;
    fn clear(&self) -> Result<(), PersistenceError>;
    fn put(&self, key: &str, record: &[u8]) -> Result<(), PersistenceError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, PersistenceError>;
    fn contains_key(&self, key: &str) -> Result<bool, PersistenceError>;
    fn remove(&self, key: &str) -> Result<(), PersistenceError>;
    fn keys(&self) -> Result<Vec<String>, PersistenceError>;
}

/// Role of a persisted record, encoded as the key prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Outbound QoS 1/2 publish sent to the peer
    Sent,
    /// Outbound publish buffered while offline
    SentBuffered,
    /// Outbound PUBREL confirming a QoS 2 publish
    SentConfirmed,
    /// Inbound QoS 2 publish waiting for PUBREL
    Received,
}

impl RecordKind {
    pub fn prefix(self) -> &'static str {
        match self {
            RecordKind::Sent => "s-",
            RecordKind::SentBuffered => "sb-",
            RecordKind::SentConfirmed => "sc-",
            RecordKind::Received => "r-",
        }
    }

    /// Split a store key into its record kind and message id
    pub fn parse(key: &str) -> Option<(RecordKind, u16)> {
        // longest prefixes first: "sb-" and "sc-" both start with "s"
        let kinds = [
            RecordKind::SentBuffered,
            RecordKind::SentConfirmed,
            RecordKind::Sent,
            RecordKind::Received,
        ];
        kinds.into_iter().find_map(|kind| {
            key.strip_prefix(kind.prefix())
                .and_then(|rest| rest.parse::<u16>().ok())
                .map(|id| (kind, id))
        })
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix().trim_end_matches('-'))
    }
}

/// Store key for a record of `kind` with message id `id`
pub fn key_for(kind: RecordKind, id: u16) -> String {
    format!("{}{}", kind.prefix(), id)
}

/// Human-oriented view of one stored record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordSummary {
    pub key: String,
    /// Record role, `None` for keys outside the session's namespace
    pub record: Option<String>,
    pub message_id: Option<u16>,
    pub kind: Option<String>,
    pub qos: Option<u8>,
    pub dup: Option<bool>,
    pub payload_len: Option<usize>,
    /// Decode failure, if the record is unreadable
    pub corrupt: Option<String>,
}

/// Decode a raw record for display. Never fails: unreadable records are
/// reported through `corrupt`.
pub fn summarize_record(key: &str, bytes: &[u8]) -> RecordSummary {
    let parsed = RecordKind::parse(key);
    let mut summary = RecordSummary {
        key: key.to_string(),
        record: parsed.map(|(kind, _)| kind.to_string()),
        message_id: parsed.map(|(_, id)| id),
        kind: None,
        qos: None,
        dup: None,
        payload_len: None,
        corrupt: None,
    };

    match serde_json::from_slice::<Message>(bytes) {
        Ok(message) => {
            summary.kind = Some(message.kind().to_string());
            if let Some(publish) = message.as_publish() {
                summary.qos = Some(publish.qos.as_u8());
                summary.dup = Some(publish.dup);
                summary.payload_len = Some(publish.payload.len());
            }
        }
        Err(e) if e.is_eof() => summary.corrupt = Some("truncated".to_string()),
        Err(e) => summary.corrupt = Some(e.to_string()),
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Publish, QoS};

    #[test]
    fn test_key_round_trip_by_prefix() {
        assert_eq!(key_for(RecordKind::Sent, 7), "s-7");
        assert_eq!(key_for(RecordKind::SentBuffered, 7), "sb-7");
        assert_eq!(key_for(RecordKind::SentConfirmed, 7), "sc-7");
        assert_eq!(key_for(RecordKind::Received, 7), "r-7");

        assert_eq!(RecordKind::parse("s-7"), Some((RecordKind::Sent, 7)));
        assert_eq!(RecordKind::parse("sb-12"), Some((RecordKind::SentBuffered, 12)));
        assert_eq!(RecordKind::parse("sc-65535"), Some((RecordKind::SentConfirmed, 65535)));
        assert_eq!(RecordKind::parse("r-1"), Some((RecordKind::Received, 1)));
    }

    #[test]
    fn test_parse_rejects_foreign_keys() {
        assert_eq!(RecordKind::parse("x-1"), None);
        assert_eq!(RecordKind::parse("s-"), None);
        assert_eq!(RecordKind::parse("s-70000"), None);
        assert_eq!(RecordKind::parse("sb-abc"), None);
    }

    #[test]
    fn test_summarize_publish_record() {
        let mut publish = Publish::new("a/b", b"12345".to_vec(), QoS::ExactlyOnce);
        publish.message_id = 4;
        publish.dup = true;
        let bytes = serde_json::to_vec(&Message::Publish(publish)).unwrap();

        let summary = summarize_record("s-4", &bytes);

        assert_eq!(summary.record.as_deref(), Some("s"));
        assert_eq!(summary.message_id, Some(4));
        assert_eq!(summary.kind.as_deref(), Some("PUBLISH"));
        assert_eq!(summary.qos, Some(2));
        assert_eq!(summary.dup, Some(true));
        assert_eq!(summary.payload_len, Some(5));
        assert!(summary.corrupt.is_none());
    }

    #[test]
    fn test_summarize_marks_corrupt_records() {
        let truncated = summarize_record("r-2", br#"{"kind":"publish""#);
        assert_eq!(truncated.corrupt.as_deref(), Some("truncated"));

        let garbage = summarize_record("stray", b"???");
        assert!(garbage.record.is_none());
        assert!(garbage.corrupt.is_some());
    }
}
