use crate::client_error;
use anyhow::Result;
use bytes::Bytes;
use std::fmt;

/// Largest ttl value (in milliseconds) the protocol can carry. Bigger values are clamped.
pub const MAX_TTL: u64 = 4_294_967_295;

/// Lifecycle state of a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientState {
    Starting,
    Started,
    Stopping,
    Stopped,
    Retrying,
    Restarted,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Starting => "starting",
            ClientState::Started => "started",
            ClientState::Stopping => "stopping",
            ClientState::Stopped => "stopped",
            ClientState::Retrying => "retrying",
            ClientState::Restarted => "restarted",
        };

        f.write_str(name)
    }
}

/// Quality of service of a message or a subscription.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Qos {
    /// The message is delivered zero or one time.
    #[default]
    AtMostOnce = 0,
    /// The message is delivered at least once, the server waits for acknowledgement.
    AtLeastOnce = 1,
}

impl TryFrom<u8> for Qos {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            other => client_error!(Range, format!("qos must be 0 or 1, got {}", other)),
        }
    }
}

/// How the body of a message should be interpreted on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentType {
    Binary,
    Json,
    Text,
}

impl ContentType {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ContentType::Binary => "application/octet-stream",
            ContentType::Json => "application/json",
            ContentType::Text => "text/plain",
        }
    }
}

/// Body of a message sent or received by the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    /// Classify the payload. Text which parses as a JSON object or array is sent as structured
    /// text, any other text as plain text.
    pub fn content_type(&self) -> ContentType {
        match self {
            Payload::Binary(_) => ContentType::Binary,
            Payload::Text(text) => {
                let trimmed = text.trim_start();

                if (trimmed.starts_with('{') || trimmed.starts_with('['))
                    && serde_json::from_str::<serde_json::Value>(text).is_ok()
                {
                    ContentType::Json
                } else {
                    ContentType::Text
                }
            }
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text.as_str()),
            Payload::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(bytes) => &bytes[..],
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_owned())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(value))
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Payload::Binary(Bytes::copy_from_slice(value))
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Binary(value)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Text(value.to_string())
    }
}

/// A message handed over to the engine by `send`.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    pub topic: String,
    pub body: Payload,
    pub content_type: ContentType,
    pub qos: Qos,
    /// Message expiry in milliseconds, already clamped to `MAX_TTL`.
    pub ttl: Option<u64>,
}

/// A message received from a destination.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// The topic the message was sent to.
    pub topic: String,
    pub body: Payload,
    pub content_type: ContentType,
    /// Pattern of the destination the message was received from.
    pub topic_pattern: String,
    pub share: Option<String>,
    pub qos: Qos,
    pub ttl: Option<u64>,
}

impl Delivery {
    /// Body as text, `None` for binary messages.
    pub fn data(&self) -> Option<&str> {
        self.body.as_str()
    }
}

/// Validate a ttl given by the caller and clamp it to the protocol maximum. A zero ttl is only
/// accepted when `allow_zero` is set.
pub(crate) fn validate_ttl(ttl: Option<i64>, allow_zero: bool) -> Result<Option<u64>> {
    match ttl {
        None => Ok(None),
        Some(v) if v < 0 || (v == 0 && !allow_zero) => {
            client_error!(Range, format!("ttl must be a positive number, got {}", v))
        }
        Some(v) => Ok(Some((v as u64).min(MAX_TTL))),
    }
}
