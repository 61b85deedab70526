//! Telegram Bot API over plain HTTPS.
//!
//! Updates arrive through the `/telegram` webhook route, so the session is
//! passive: `connect` only registers the webhook.

use async_trait::async_trait;
use channel_message::{Channel, InboundEvent, ReplyTarget};
use reqwest::{Client, multipart};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::channel::{IncomingMessage, Platform, Reply, Session};
use crate::config::Settings;
use crate::error::BotError;
use crate::queue::ChannelQueue;
use crate::shutdown::ExitSignal;

const API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TelegramPlatform {
    client: Client,
    api: String,
    owner: Option<String>,
    webhook_url: Option<String>,
    secret_token: Option<String>,
}

impl TelegramPlatform {
    pub fn new(settings: &Settings) -> Result<Self, BotError> {
        let telegram = settings
            .telegram
            .as_ref()
            .ok_or_else(|| BotError::Config("telegram is not configured".into()))?;
        Ok(Self {
            client: Client::new(),
            api: format!("{API_BASE}/bot{}", telegram.token),
            owner: telegram.user.clone(),
            webhook_url: settings.webhook_url.clone(),
            secret_token: settings.web_telegram_token.clone(),
        })
    }

    async fn call(&self, method: &str, body: Value) -> Result<(), BotError> {
        let response = self
            .client
            .post(format!("{}/{method}", self.api))
            .json(&body)
            .send()
            .await
            .map_err(|e| BotError::transport(Channel::Telegram, e))?;
        check(method, response).await
    }
}

async fn check(method: &str, response: reqwest::Response) -> Result<(), BotError> {
    let status = response.status();
    let parsed: ApiResponse = response
        .json()
        .await
        .map_err(|e| BotError::transport(Channel::Telegram, format!("{method}: {status}: {e}")))?;
    if parsed.ok {
        Ok(())
    } else {
        Err(BotError::transport(
            Channel::Telegram,
            format!(
                "{method}: {}",
                parsed.description.unwrap_or_else(|| status.to_string())
            ),
        ))
    }
}

/// Telegram chat ids are integers; usernames (`@channel`) stay strings.
fn chat_id(chat: &str) -> Value {
    chat.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(chat))
}

fn reply_parameters(target: &ReplyTarget) -> Option<Value> {
    let message_id = target.message.as_deref()?.parse::<i64>().ok()?;
    Some(json!({"message_id": message_id, "allow_sending_without_reply": true}))
}

#[async_trait]
impl Platform for TelegramPlatform {
    fn channel(&self) -> Channel {
        Channel::Telegram
    }

    async fn connect(
        &self,
        _inbound: ChannelQueue<InboundEvent>,
        _exit: ExitSignal,
    ) -> Result<Session, BotError> {
        let Some(base) = &self.webhook_url else {
            warn!("no webhook url; relying on an already registered webhook");
            return Ok(Session::Passive);
        };
        let url = format!("{base}/telegram");
        let mut body = json!({"url": url, "allowed_updates": []});
        if let Some(secret) = &self.secret_token {
            body["secret_token"] = json!(secret);
        }
        self.call("setWebhook", body)
            .await
            .map_err(|e| BotError::fatal("telegram", e))?;
        info!(%url, "telegram webhook registered");
        Ok(Session::Passive)
    }

    fn parse(&self, event: &InboundEvent) -> Option<IncomingMessage> {
        let message = event.payload.get("message")?;
        let text = message.get("text")?.as_str()?;
        let chat = message.pointer("/chat/id")?;
        let chat = match chat {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            _ => return None,
        };
        let message_id = message.get("message_id").and_then(Value::as_i64);
        Some(IncomingMessage {
            text: text.to_string(),
            target: ReplyTarget::new(chat, message_id.map(|m| m.to_string())),
        })
    }

    async fn send(&self, target: &ReplyTarget, reply: Reply) -> Result<(), BotError> {
        match reply {
            Reply::Text(text) => {
                let mut body = json!({
                    "chat_id": chat_id(&target.chat),
                    "text": text,
                    "parse_mode": "Markdown",
                });
                if let Some(params) = reply_parameters(target) {
                    body["reply_parameters"] = params;
                }
                self.call("sendMessage", body).await
            }
            Reply::Photo { bytes, caption } => {
                let photo = multipart::Part::bytes(bytes.as_ref().clone())
                    .file_name("meow.png")
                    .mime_str("image/png")
                    .map_err(|e| BotError::transport(Channel::Telegram, e))?;
                let mut form = multipart::Form::new()
                    .text("chat_id", target.chat.clone())
                    .text("caption", caption)
                    .part("photo", photo);
                if let Some(params) = reply_parameters(target) {
                    form = form.text("reply_parameters", params.to_string());
                }
                let response = self
                    .client
                    .post(format!("{}/sendPhoto", self.api))
                    .multipart(form)
                    .send()
                    .await
                    .map_err(|e| BotError::transport(Channel::Telegram, e))?;
                check("sendPhoto", response).await
            }
        }
    }

    async fn announce(&self, text: &str) -> Result<(), BotError> {
        let Some(owner) = &self.owner else {
            return Ok(());
        };
        info!(chat = %owner, "sending up message to owner");
        self.send(&ReplyTarget::new(owner.clone(), None), Reply::Text(text.into()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelegramSettings;

    fn platform() -> TelegramPlatform {
        let settings = Settings {
            telegram: Some(TelegramSettings {
                token: "123:abc".into(),
                user: None,
            }),
            ..Settings::default()
        };
        TelegramPlatform::new(&settings).unwrap()
    }

    #[test]
    fn parses_text_messages() {
        let event = InboundEvent::new(
            Channel::Telegram,
            json!({
                "update_id": 1,
                "message": {"message_id": 456, "chat": {"id": -100123}, "text": "/meowfact"}
            }),
        );
        let incoming = platform().parse(&event).unwrap();
        assert_eq!(incoming.text, "/meowfact");
        assert_eq!(incoming.target, ReplyTarget::new("-100123", Some("456".into())));
    }

    #[test]
    fn ignores_non_text_updates() {
        let sticker = InboundEvent::new(
            Channel::Telegram,
            json!({"message": {"message_id": 1, "chat": {"id": 1}, "sticker": {}}}),
        );
        let edit = InboundEvent::new(Channel::Telegram, json!({"edited_message": {}}));
        assert!(platform().parse(&sticker).is_none());
        assert!(platform().parse(&edit).is_none());
    }

    #[test]
    fn reply_parameters_need_a_numeric_message() {
        assert!(reply_parameters(&ReplyTarget::new("1", None)).is_none());
        assert_eq!(
            reply_parameters(&ReplyTarget::new("1", Some("9".into()))),
            Some(json!({"message_id": 9, "allow_sending_without_reply": true}))
        );
        assert_eq!(chat_id("123"), json!(123));
        assert_eq!(chat_id("@meowchannel"), json!("@meowchannel"));
    }

    #[test]
    fn requires_settings() {
        assert!(matches!(
            TelegramPlatform::new(&Settings::default()),
            Err(BotError::Config(_))
        ));
    }
}
