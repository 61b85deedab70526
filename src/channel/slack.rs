use async_trait::async_trait;
use channel_message::{Channel, InboundEvent, ReplyTarget};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::channel::{IncomingMessage, Platform, Reply, Session};
use crate::config::Settings;
use crate::error::BotError;
use crate::queue::ChannelQueue;
use crate::shutdown::ExitSignal;

const API_BASE: &str = "https://slack.com/api";

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

/// Slack Events API. Events arrive on the `/slack` webhook route; replies go
/// to `chat.postMessage` in the thread of the triggering message.
#[derive(Debug, Clone)]
pub struct SlackPlatform {
    client: Client,
    token: String,
}

impl SlackPlatform {
    pub fn new(settings: &Settings) -> Result<Self, BotError> {
        let slack = settings
            .slack
            .as_ref()
            .ok_or_else(|| BotError::Config("slack is not configured".into()))?;
        Ok(Self {
            client: Client::new(),
            token: slack.bot_token.clone(),
        })
    }

    async fn call(&self, method: &str, body: Value) -> Result<ApiResponse, BotError> {
        let response: ApiResponse = self
            .client
            .post(format!("{API_BASE}/{method}"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| BotError::transport(Channel::Slack, e))?
            .json()
            .await
            .map_err(|e| BotError::transport(Channel::Slack, e))?;
        if response.ok {
            Ok(response)
        } else {
            Err(BotError::transport(
                Channel::Slack,
                format!("{method}: {}", response.error.as_deref().unwrap_or("unknown error")),
            ))
        }
    }
}

#[async_trait]
impl Platform for SlackPlatform {
    fn channel(&self) -> Channel {
        Channel::Slack
    }

    /// Checks the bot token; events themselves come through the web server.
    async fn connect(
        &self,
        _inbound: ChannelQueue<InboundEvent>,
        _exit: ExitSignal,
    ) -> Result<Session, BotError> {
        let auth = self
            .call("auth.test", json!({}))
            .await
            .map_err(|e| BotError::fatal("slack", e))?;
        info!(user = ?auth.user_id, "slack token accepted");
        Ok(Session::Passive)
    }

    fn parse(&self, event: &InboundEvent) -> Option<IncomingMessage> {
        let inner = event.payload.get("event")?;
        if inner.get("bot_id").is_some() || inner.get("subtype").is_some() {
            return None;
        }
        let text = inner.get("text")?.as_str().filter(|t| !t.is_empty())?;
        let channel = inner.get("channel")?.as_str()?;
        let ts = inner.get("ts").and_then(Value::as_str).map(str::to_string);
        Some(IncomingMessage {
            text: text.to_string(),
            target: ReplyTarget::new(channel, ts),
        })
    }

    async fn send(&self, target: &ReplyTarget, reply: Reply) -> Result<(), BotError> {
        let text = match reply {
            Reply::Text(text) => text,
            Reply::Photo { caption, .. } => caption,
        };
        let mut body = json!({"channel": target.chat, "text": text});
        if let Some(ts) = &target.message {
            body["thread_ts"] = json!(ts);
            body["reply_broadcast"] = json!(true);
        }
        self.call("chat.postMessage", body).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlackSettings;

    fn platform() -> SlackPlatform {
        let settings = Settings {
            slack: Some(SlackSettings {
                bot_token: "xoxb-test".into(),
            }),
            ..Settings::default()
        };
        SlackPlatform::new(&settings).unwrap()
    }

    #[test]
    fn parses_message_events() {
        let event = InboundEvent::new(
            Channel::Slack,
            json!({
                "type": "event_callback",
                "event": {"type": "message", "text": "!meowfact", "channel": "C1", "ts": "1700000000.000100"}
            }),
        );
        let incoming = platform().parse(&event).unwrap();
        assert_eq!(incoming.text, "!meowfact");
        assert_eq!(
            incoming.target,
            ReplyTarget::new("C1", Some("1700000000.000100".into()))
        );
    }

    #[test]
    fn skips_bot_and_empty_events() {
        let bot = InboundEvent::new(
            Channel::Slack,
            json!({"event": {"text": "!meowsay", "channel": "C1", "ts": "1", "bot_id": "B1"}}),
        );
        let edit = InboundEvent::new(
            Channel::Slack,
            json!({"event": {"subtype": "message_changed", "channel": "C1", "ts": "1"}}),
        );
        let empty = InboundEvent::new(
            Channel::Slack,
            json!({"event": {"text": "", "channel": "C1", "ts": "1"}}),
        );
        for event in [bot, edit, empty] {
            assert!(platform().parse(&event).is_none());
        }
    }
}
