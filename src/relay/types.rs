use std::fmt;
use std::sync::Arc;

use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Bytes, Message, Utf8Bytes};

/// Query parameter carrying the room token on the upgrade request
pub const ROOM_QUERY_PARAM: &str = "room";

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("establishment rejected: {0}")]
    EstablishmentRejected(&'static str),

    #[error("transport read failure: {0}")]
    TransportRead(String),

    #[error("transport write failure to {peer}: {reason}")]
    TransportWrite {
        peer: ConnectionId,
        reason: WriteFailure,
    },
}

/// Why a single recipient could not be handed a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteFailure {
    #[error("outbound queue full")]
    Backpressure,

    #[error("peer is closing")]
    Closed,
}

/// Per-peer outbound queue. Bounded so that a stalled peer fails fast instead
/// of holding up the rest of its room.
pub type PeerSender = mpsc::Sender<RelayMessage>;

/// Opaque per-session identity ("conn_" + 16 hex)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(rand::rng().random())
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{:016x}", self.0)
    }
}

/// Room token as supplied by the client. Any non-empty string is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(Arc<str>);

impl RoomId {
    pub fn parse(token: &str) -> Result<Self, RelayError> {
        if token.is_empty() {
            return Err(RelayError::EstablishmentRejected("empty room token"));
        }
        Ok(Self(Arc::from(token)))
    }

    /// Extract the room token from a raw (still urlencoded) query string.
    /// The first `room` pair wins.
    pub fn from_query(query: Option<&str>) -> Result<Self, RelayError> {
        let query = query.ok_or(RelayError::EstablishmentRejected("missing room token"))?;
        let token = url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == ROOM_QUERY_PARAM)
            .map(|(_, value)| value)
            .ok_or(RelayError::EstablishmentRejected("missing room token"))?;
        Self::parse(&token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// A relayed frame. Payload buffers are reference counted, so cloning for
/// fan-out never copies bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Text(Utf8Bytes),
    Binary(Bytes),
}

impl RelayMessage {
    /// Data frames only; control frames return `None`.
    pub fn from_frame(frame: Message) -> Option<Self> {
        match frame {
            Message::Text(text) => Some(Self::Text(text)),
            Message::Binary(data) => Some(Self::Binary(data)),
            _ => None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text(_) => MessageKind::Text,
            Self::Binary(_) => MessageKind::Binary,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_str().as_bytes(),
            Self::Binary(data) => &data[..],
        }
    }

    pub fn len(&self) -> usize {
        self.payload().len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload().is_empty()
    }
}

impl From<RelayMessage> for Message {
    fn from(msg: RelayMessage) -> Self {
        match msg {
            RelayMessage::Text(text) => Message::Text(text),
            RelayMessage::Binary(data) => Message::Binary(data),
        }
    }
}

impl From<String> for RelayMessage {
    fn from(s: String) -> Self {
        Self::Text(Utf8Bytes::from(s))
    }
}

impl From<Vec<u8>> for RelayMessage {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(data))
    }
}
