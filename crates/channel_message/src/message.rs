use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// A messaging platform the bot is connected to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr, Display,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Telegram,
    Discord,
    Slack,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Telegram, Channel::Discord, Channel::Slack];
}

/// A raw platform event as delivered by a webhook or a gateway session.
///
/// The payload is kept as untyped JSON: the channel worker that consumes the
/// event is the only place that knows the platform's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub id: String,
    pub channel: Channel,
    pub received_at: DateTime<Utc>,
    pub payload: Value,
}

impl InboundEvent {
    pub fn new(channel: Channel, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel,
            received_at: Utc::now(),
            payload,
        }
    }
}

/// Where a reply goes: a chat/channel plus the message being answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTarget {
    pub chat: String,
    pub message: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DestinationError {
    #[error("destination is not valid json: {0}")]
    Json(String),
    #[error("destination must be a [chat, message] pair")]
    Shape,
}

impl ReplyTarget {
    pub fn new(chat: impl Into<String>, message: Option<String>) -> Self {
        Self {
            chat: chat.into(),
            message,
        }
    }

    /// Parses the `X-Destination` header format: a JSON pair `[chat, message]`
    /// whose members may be numbers or strings. `message` may be `null`.
    pub fn from_destination(raw: &str) -> Result<Self, DestinationError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| DestinationError::Json(e.to_string()))?;
        let pair = match value.as_array() {
            Some(items) if items.len() == 2 => items,
            _ => return Err(DestinationError::Shape),
        };
        let chat = scalar_to_string(&pair[0]).ok_or(DestinationError::Shape)?;
        let message = match &pair[1] {
            Value::Null => None,
            other => Some(scalar_to_string(other).ok_or(DestinationError::Shape)?),
        };
        Ok(Self { chat, message })
    }

    /// Inverse of [`ReplyTarget::from_destination`]. Numeric ids stay numbers.
    pub fn to_destination(&self) -> String {
        let chat = string_to_scalar(&self.chat);
        let message = self
            .message
            .as_deref()
            .map(string_to_scalar)
            .unwrap_or(Value::Null);
        Value::Array(vec![chat, message]).to_string()
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_to_scalar(s: &str) -> Value {
    match s.parse::<i64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::String(s.to_string()),
    }
}

/// A formatted reply waiting to be delivered by a channel worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: Channel,
    pub target: ReplyTarget,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    /// The `EnvFilter` directive for this level.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}
