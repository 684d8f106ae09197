use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Unit of transport: a routing key plus an opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub routing_key: String,
    pub body: Bytes,
}

impl Envelope {
    pub fn new(routing_key: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
        }
    }

    /// Encodes `payload` as the JSON body of a new envelope.
    pub fn encode(routing_key: impl Into<String>, payload: &LogPayload) -> serde_json::Result<Self> {
        let body = serde_json::to_vec(payload)?;
        Ok(Self::new(routing_key, body))
    }

    pub fn decode(&self) -> serde_json::Result<LogPayload> {
        serde_json::from_slice(&self.body)
    }
}

/// Body carried on the log stream, also the request body of the log sink's `POST /log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPayload {
    pub name: String,
    pub data: String,
}

impl LogPayload {
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn label(&self) -> Label {
        Label::from(self.name.as_str())
    }
}

/// Response body returned by the log sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogResponse {
    pub error: bool,
    pub message: String,
}

/// What a delivered payload asks the consumer to do, keyed by its `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Label {
    Log,
    Event,
    /// Reserved for authentication events; nothing consumes them yet.
    Auth,
    Other(String),
}

impl From<&str> for Label {
    fn from(name: &str) -> Self {
        match name {
            "log" => Label::Log,
            "event" => Label::Event,
            "auth" => Label::Auth,
            other => Label::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Info,
    Error,
}

impl Severity {
    pub fn routing_key(self) -> &'static str {
        match self {
            Severity::Info => "log.INFO",
            Severity::Error => "log.ERROR",
        }
    }
}
