//! Protocol message types for the session core
//!
//! Messages are opaque typed records: the core only cares about the kind,
//! the message identifier and (for PUBLISH) the QoS. Byte layout lives behind
//! the [`crate::transport::codec::Codec`] seam.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowest usable message identifier
pub const MIN_MESSAGE_ID: u16 = 1;
/// Highest usable message identifier
pub const MAX_MESSAGE_ID: u16 = 65535;

/// Token key shared by CONNECT and CONNACK
pub const CONNECT_KEY: &str = "Con";
/// Token key used by DISCONNECT
pub const DISCONNECT_KEY: &str = "Disc";
/// Token key shared by PINGREQ and PINGRESP
pub const PING_KEY: &str = "Ping";

/// Delivery guarantee of a PUBLISH
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// At most once, no acknowledgement
    AtMostOnce,
    /// At least once, acknowledged by PUBACK
    AtLeastOnce,
    /// Exactly once, PUBREC / PUBREL / PUBCOMP handshake
    ExactlyOnce,
}

impl QoS {
    pub fn as_u8(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("invalid QoS level {other}")),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos.as_u8()
    }
}

/// Application message carried by PUBLISH
///
/// Every outbound publish gets a message id, including QoS 0: for QoS 0 the id
/// only keys the local token and is never meaningful to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publish {
    #[serde(default)]
    pub message_id: u16,
    pub topic: String,
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub dup: bool,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        Self {
            message_id: 0,
            topic: topic.into(),
            qos,
            retain: false,
            dup: false,
            payload: payload.into(),
        }
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Last will registered with CONNECT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNECT request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive_secs: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<Vec<u8>>,
    #[serde(default)]
    pub will: Option<Will>,
}

impl Connect {
    pub fn new(client_id: impl Into<String>, clean_session: bool, keep_alive_secs: u16) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session,
            keep_alive_secs,
            username: None,
            password: None,
            will: None,
        }
    }
}

/// CONNACK reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnAck {
    pub session_present: bool,
    /// 0 accepted, 1-5 refusal codes
    pub return_code: u8,
}

impl ConnAck {
    pub fn accepted(session_present: bool) -> Self {
        Self {
            session_present,
            return_code: 0,
        }
    }

    pub fn refused(return_code: u8) -> Self {
        Self {
            session_present: false,
            return_code,
        }
    }
}

/// SUBSCRIBE request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscribe {
    #[serde(default)]
    pub message_id: u16,
    pub filters: Vec<(String, QoS)>,
}

/// SUBACK reply carrying one granted code per filter (0x80 = failure)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubAck {
    pub message_id: u16,
    pub granted: Vec<u8>,
}

/// UNSUBSCRIBE request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unsubscribe {
    #[serde(default)]
    pub message_id: u16,
    pub filters: Vec<String>,
}

/// Discriminant of [`Message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Connect,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Connect => "CONNECT",
            MessageKind::ConnAck => "CONNACK",
            MessageKind::Publish => "PUBLISH",
            MessageKind::PubAck => "PUBACK",
            MessageKind::PubRec => "PUBREC",
            MessageKind::PubRel => "PUBREL",
            MessageKind::PubComp => "PUBCOMP",
            MessageKind::Subscribe => "SUBSCRIBE",
            MessageKind::SubAck => "SUBACK",
            MessageKind::Unsubscribe => "UNSUBSCRIBE",
            MessageKind::UnsubAck => "UNSUBACK",
            MessageKind::PingReq => "PINGREQ",
            MessageKind::PingResp => "PINGRESP",
            MessageKind::Disconnect => "DISCONNECT",
        };
        f.write_str(name)
    }
}

/// One protocol unit exchanged with the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck { message_id: u16 },
    PubRec { message_id: u16 },
    PubRel { message_id: u16 },
    PubComp { message_id: u16 },
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck { message_id: u16 },
    PingReq,
    PingResp,
    Disconnect,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Connect(_) => MessageKind::Connect,
            Message::ConnAck(_) => MessageKind::ConnAck,
            Message::Publish(_) => MessageKind::Publish,
            Message::PubAck { .. } => MessageKind::PubAck,
            Message::PubRec { .. } => MessageKind::PubRec,
            Message::PubRel { .. } => MessageKind::PubRel,
            Message::PubComp { .. } => MessageKind::PubComp,
            Message::Subscribe(_) => MessageKind::Subscribe,
            Message::SubAck(_) => MessageKind::SubAck,
            Message::Unsubscribe(_) => MessageKind::Unsubscribe,
            Message::UnsubAck { .. } => MessageKind::UnsubAck,
            Message::PingReq => MessageKind::PingReq,
            Message::PingResp => MessageKind::PingResp,
            Message::Disconnect => MessageKind::Disconnect,
        }
    }

    /// Message identifier, 0 when the kind carries none or none is assigned yet
    pub fn message_id(&self) -> u16 {
        match self {
            Message::Publish(p) => p.message_id,
            Message::PubAck { message_id }
            | Message::PubRec { message_id }
            | Message::PubRel { message_id }
            | Message::PubComp { message_id }
            | Message::UnsubAck { message_id } => *message_id,
            Message::Subscribe(s) => s.message_id,
            Message::SubAck(s) => s.message_id,
            Message::Unsubscribe(u) => u.message_id,
            Message::Connect(_)
            | Message::ConnAck(_)
            | Message::PingReq
            | Message::PingResp
            | Message::Disconnect => 0,
        }
    }

    pub fn set_message_id(&mut self, id: u16) {
        match self {
            Message::Publish(p) => p.message_id = id,
            Message::PubAck { message_id }
            | Message::PubRec { message_id }
            | Message::PubRel { message_id }
            | Message::PubComp { message_id }
            | Message::UnsubAck { message_id } => *message_id = id,
            Message::Subscribe(s) => s.message_id = id,
            Message::SubAck(s) => s.message_id = id,
            Message::Unsubscribe(u) => u.message_id = id,
            Message::Connect(_)
            | Message::ConnAck(_)
            | Message::PingReq
            | Message::PingResp
            | Message::Disconnect => {}
        }
    }

    /// Whether the session must allocate an id before queueing this message
    pub fn requires_message_id(&self) -> bool {
        matches!(
            self,
            Message::Publish(_)
                | Message::PubAck { .. }
                | Message::PubRec { .. }
                | Message::PubRel { .. }
                | Message::PubComp { .. }
                | Message::Subscribe(_)
                | Message::Unsubscribe(_)
        )
    }

    /// Replies from the peer that resolve a pending token, plus the acks we
    /// emit ourselves (PUBACK / PUBREC / PUBCOMP) which are never tokenized.
    pub fn is_ack(&self) -> bool {
        matches!(
            self,
            Message::ConnAck(_)
                | Message::PubAck { .. }
                | Message::PubRec { .. }
                | Message::PubComp { .. }
                | Message::SubAck(_)
                | Message::UnsubAck { .. }
                | Message::PingResp
        )
    }

    /// Registry key of the token tracking this exchange
    pub fn key(&self) -> String {
        match self {
            Message::Connect(_) | Message::ConnAck(_) => CONNECT_KEY.to_string(),
            Message::Disconnect => DISCONNECT_KEY.to_string(),
            Message::PingReq | Message::PingResp => PING_KEY.to_string(),
            other => other.message_id().to_string(),
        }
    }

    pub fn as_publish(&self) -> Option<&Publish> {
        match self {
            Message::Publish(p) => Some(p),
            _ => None,
        }
    }

    pub fn qos(&self) -> Option<QoS> {
        self.as_publish().map(|p| p.qos)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Publish(p) => write!(
                f,
                "PUBLISH id={} qos={} dup={} topic={}",
                p.message_id,
                p.qos.as_u8(),
                p.dup,
                p.topic
            ),
            other if other.message_id() != 0 => {
                write!(f, "{} id={}", other.kind(), other.message_id())
            }
            other => write!(f, "{}", other.kind()),
        }
    }
}
