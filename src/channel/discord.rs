//! Discord: a gateway websocket for inbound messages, REST for replies.
//!
//! ```text
//! GET /gateway/bot ─▶ wss connect ─▶ Hello(op 10) ─▶ Identify(op 2)
//!                                        │
//!            ┌───────── gateway task ────┴─────────────────────────┐
//!            │ heartbeat(op 1) every interval, expect ack (op 11)  │
//!            │ Dispatch(op 0) READY          → remember own id     │
//!            │ Dispatch(op 0) MESSAGE_CREATE → inbound queue       │
//!            │ Reconnect(7) / InvalidSession(9) / close → error    │
//!            └─────────────────────────────────────────────────────┘
//! ```
//!
//! The gateway is not resumed; losing it fails the worker.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use channel_message::{Channel, InboundEvent, ReplyTarget};
use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, multipart};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as WsMsg};
use tracing::{debug, info, warn};

use crate::channel::{IncomingMessage, Platform, Reply, Session};
use crate::config::Settings;
use crate::error::BotError;
use crate::queue::ChannelQueue;
use crate::shutdown::ExitSignal;

const API_BASE: &str = "https://discord.com/api/v10";
const GATEWAY_QUERY: &str = "?v=10&encoding=json";
/// Longer replies are sent as a `message.txt` attachment.
pub const MAX_CONTENT: usize = 2000;

/// How long the owner announcement waits for READY.
const READY_WAIT: Duration = Duration::from_secs(15);

const GUILD_MESSAGES: u64 = 1 << 9;
const DIRECT_MESSAGES: u64 = 1 << 12;
const MESSAGE_CONTENT: u64 = 1 << 15;

type Gateway = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

/// The bot's own user id, known once the gateway sends READY.
#[derive(Debug, Default)]
struct Identity {
    id: OnceLock<String>,
    ready: Notify,
}

impl Identity {
    fn set(&self, id: &str) {
        let _ = self.id.set(id.to_string());
        self.ready.notify_waiters();
    }

    fn get(&self) -> Option<&str> {
        self.id.get().map(String::as_str)
    }

    async fn wait(&self, limit: Duration) -> Option<&str> {
        let notified = self.ready.notified();
        if self.id.get().is_none() {
            let _ = tokio::time::timeout(limit, notified).await;
        }
        self.get()
    }
}

fn up_message(self_id: Option<&str>, text: &str) -> String {
    match self_id {
        Some(id) => format!("Bot <@{id}> is up\n{text}"),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct DiscordPlatform {
    client: Client,
    token: String,
    owner: Option<String>,
    identity: Arc<Identity>,
}

fn transport(e: impl ToString) -> BotError {
    BotError::transport(Channel::Discord, e)
}

impl DiscordPlatform {
    pub fn new(settings: &Settings) -> Result<Self, BotError> {
        let discord = settings
            .discord
            .as_ref()
            .ok_or_else(|| BotError::Config("discord is not configured".into()))?;
        Ok(Self {
            client: Client::new(),
            token: discord.token.clone(),
            owner: discord.user.clone(),
            identity: Arc::default(),
        })
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.token)
    }

    async fn rest(&self, request: reqwest::RequestBuilder) -> Result<Value, BotError> {
        let response = request
            .header(reqwest::header::AUTHORIZATION, self.auth())
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status.is_success() {
            Ok(body)
        } else {
            Err(transport(format!("{status}: {body}")))
        }
    }

    async fn open_gateway(&self) -> Result<(Gateway, Duration), BotError> {
        let info = self
            .rest(self.client.get(format!("{API_BASE}/gateway/bot")))
            .await?;
        let url = info
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| transport("gateway url missing"))?;

        let (mut ws, _) = connect_async(format!("{url}/{GATEWAY_QUERY}"))
            .await
            .map_err(transport)?;

        let hello = match ws.next().await {
            Some(Ok(WsMsg::Text(text))) => {
                serde_json::from_str::<GatewayPayload>(text.as_str()).map_err(transport)?
            }
            other => return Err(transport(format!("expected hello, got {other:?}"))),
        };
        let interval = hello
            .d
            .get("heartbeat_interval")
            .and_then(Value::as_u64)
            .filter(|_| hello.op == 10)
            .ok_or_else(|| transport("malformed hello"))?;

        let identify = json!({
            "op": 2,
            "d": {
                "token": self.token,
                "intents": GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT,
                "properties": {"os": std::env::consts::OS, "browser": "bigmeow", "device": "bigmeow"},
            }
        });
        ws.send(WsMsg::Text(identify.to_string().into()))
            .await
            .map_err(transport)?;

        Ok((ws, Duration::from_millis(interval)))
    }

    async fn post_message(&self, channel_id: &str, body: Value) -> Result<(), BotError> {
        self.rest(
            self.client
                .post(format!("{API_BASE}/channels/{channel_id}/messages"))
                .json(&body),
        )
        .await
        .map(|_| ())
    }

    async fn post_file(
        &self,
        channel_id: &str,
        payload: Value,
        name: &'static str,
        mime: &str,
        bytes: Vec<u8>,
    ) -> Result<(), BotError> {
        let file = multipart::Part::bytes(bytes)
            .file_name(name)
            .mime_str(mime)
            .map_err(transport)?;
        let form = multipart::Form::new()
            .text("payload_json", payload.to_string())
            .part("files[0]", file);
        self.rest(
            self.client
                .post(format!("{API_BASE}/channels/{channel_id}/messages"))
                .multipart(form),
        )
        .await
        .map(|_| ())
    }
}

fn reference(target: &ReplyTarget) -> Value {
    match &target.message {
        Some(id) => json!({"message_id": id, "fail_if_not_exists": false}),
        None => Value::Null,
    }
}

/// Pumps gateway events into `inbound` until exit or until the gateway is
/// lost.
async fn run_gateway(
    mut ws: Gateway,
    interval: Duration,
    inbound: ChannelQueue<InboundEvent>,
    exit: ExitSignal,
    identity: Arc<Identity>,
) -> Result<(), BotError> {
    let mut heartbeat = tokio::time::interval(interval);
    let mut seq: Option<u64> = None;
    let mut awaiting_ack = false;

    loop {
        tokio::select! {
            _ = exit.wait() => {
                let _ = ws.close(None).await;
                return Ok(());
            }
            _ = heartbeat.tick() => {
                if awaiting_ack {
                    return Err(transport("heartbeat not acknowledged"));
                }
                ws.send(WsMsg::Text(json!({"op": 1, "d": seq}).to_string().into()))
                    .await
                    .map_err(transport)?;
                awaiting_ack = true;
            }
            frame = ws.next() => {
                let text = match frame {
                    Some(Ok(WsMsg::Text(text))) => text,
                    Some(Ok(WsMsg::Close(close))) => {
                        return Err(transport(format!("gateway closed: {close:?}")));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(transport(e)),
                    None => return Err(transport("gateway stream ended")),
                };
                let payload: GatewayPayload = match serde_json::from_str(text.as_str()) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "unparseable gateway payload");
                        continue;
                    }
                };
                if payload.s.is_some() {
                    seq = payload.s;
                }
                match (payload.op, payload.t.as_deref()) {
                    (0, Some("READY")) => {
                        if let Some(id) = payload.d.pointer("/user/id").and_then(Value::as_str) {
                            identity.set(id);
                        }
                        info!("discord gateway ready");
                    }
                    (0, Some("MESSAGE_CREATE")) => {
                        inbound.put(InboundEvent::new(Channel::Discord, payload.d))?;
                    }
                    (0, _) => {}
                    (1, _) => {
                        ws.send(WsMsg::Text(json!({"op": 1, "d": seq}).to_string().into()))
                            .await
                            .map_err(transport)?;
                    }
                    (11, _) => awaiting_ack = false,
                    (7, _) => return Err(transport("gateway requested reconnect")),
                    (9, _) => return Err(transport("gateway invalidated the session")),
                    (op, _) => debug!(op, "ignoring gateway opcode"),
                }
            }
        }
    }
}

#[async_trait]
impl Platform for DiscordPlatform {
    fn channel(&self) -> Channel {
        Channel::Discord
    }

    async fn connect(
        &self,
        inbound: ChannelQueue<InboundEvent>,
        exit: ExitSignal,
    ) -> Result<Session, BotError> {
        let (ws, interval) = self.open_gateway().await?;
        info!(?interval, "discord gateway connected");
        let handle = tokio::spawn(run_gateway(
            ws,
            interval,
            inbound,
            exit,
            Arc::clone(&self.identity),
        ));
        Ok(Session::Background(handle))
    }

    /// Accepts gateway `MESSAGE_CREATE` data as well as the `{"text": ..}`
    /// shape posted to the `/discord` webhook route.
    fn parse(&self, event: &InboundEvent) -> Option<IncomingMessage> {
        let data = &event.payload;
        let author = data.get("author");
        if author
            .and_then(|a| a.get("bot"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return None;
        }
        let author_id = author.and_then(|a| a.get("id")).and_then(Value::as_str);
        if author_id.is_some() && author_id == self.identity.get() {
            return None;
        }

        let text = data
            .get("content")
            .or_else(|| data.get("text"))
            .and_then(Value::as_str)?;
        let channel_id = data.get("channel_id").and_then(Value::as_str)?;
        let message_id = data.get("id").and_then(Value::as_str).map(str::to_string);
        Some(IncomingMessage {
            text: text.to_string(),
            target: ReplyTarget::new(channel_id, message_id),
        })
    }

    async fn send(&self, target: &ReplyTarget, reply: Reply) -> Result<(), BotError> {
        let message_reference = reference(target);
        match reply {
            Reply::Text(text) if text.chars().count() > MAX_CONTENT => {
                let payload = json!({"message_reference": message_reference});
                self.post_file(&target.chat, payload, "message.txt", "text/plain", text.into_bytes())
                    .await
            }
            Reply::Text(text) => {
                self.post_message(
                    &target.chat,
                    json!({"content": text, "message_reference": message_reference}),
                )
                .await
            }
            Reply::Photo { bytes, caption } => {
                let payload = json!({
                    "content": caption,
                    "message_reference": message_reference,
                    "attachments": [{"id": 0, "filename": "meow.png", "description": caption}],
                });
                self.post_file(&target.chat, payload, "meow.png", "image/png", bytes.as_ref().clone())
                    .await
            }
        }
    }

    async fn announce(&self, text: &str) -> Result<(), BotError> {
        let Some(owner) = &self.owner else {
            return Ok(());
        };
        let dm = self
            .rest(
                self.client
                    .post(format!("{API_BASE}/users/@me/channels"))
                    .json(&json!({"recipient_id": owner})),
            )
            .await?;
        let channel_id = dm
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| transport("dm channel has no id"))?;
        let self_id = self.identity.wait(READY_WAIT).await;
        if self_id.is_none() {
            warn!("gateway not ready; announcing without a mention");
        }
        info!(user = %owner, "sending up message to owner");
        self.send(
            &ReplyTarget::new(channel_id, None),
            Reply::Text(up_message(self_id, text)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscordSettings;

    fn platform() -> DiscordPlatform {
        let settings = Settings {
            discord: Some(DiscordSettings {
                token: "token".into(),
                user: Some("42".into()),
            }),
            ..Settings::default()
        };
        DiscordPlatform::new(&settings).unwrap()
    }

    fn message(author: &str, bot: bool) -> InboundEvent {
        InboundEvent::new(
            Channel::Discord,
            json!({
                "id": "1001",
                "channel_id": "2002",
                "content": "!meowsay hi",
                "author": {"id": author, "bot": bot}
            }),
        )
    }

    #[test]
    fn parses_gateway_messages() {
        let incoming = platform().parse(&message("7", false)).unwrap();
        assert_eq!(incoming.text, "!meowsay hi");
        assert_eq!(incoming.target, ReplyTarget::new("2002", Some("1001".into())));
    }

    #[test]
    fn ignores_own_and_bot_messages() {
        let platform = platform();
        platform.identity.set("7");
        assert!(platform.parse(&message("7", false)).is_none());
        assert!(platform.parse(&message("8", true)).is_none());
        assert!(platform.parse(&message("8", false)).is_some());
    }

    #[test]
    fn webhook_shape_needs_a_channel() {
        let plain = InboundEvent::new(Channel::Discord, json!({"text": "ping"}));
        assert!(platform().parse(&plain).is_none());

        let routed = InboundEvent::new(Channel::Discord, json!({"text": "meow", "channel_id": "5"}));
        let incoming = platform().parse(&routed).unwrap();
        assert_eq!(incoming.target, ReplyTarget::new("5", None));
    }

    #[test]
    fn reference_only_when_replying() {
        assert_eq!(reference(&ReplyTarget::new("1", None)), Value::Null);
        assert_eq!(
            reference(&ReplyTarget::new("1", Some("2".into())))["message_id"],
            json!("2")
        );
    }

    #[tokio::test]
    async fn announcement_waits_for_ready() {
        let identity = Arc::new(Identity::default());
        assert_eq!(identity.wait(Duration::from_millis(20)).await, None);

        let gateway = Arc::clone(&identity);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            gateway.set("77");
        });
        let self_id = identity.wait(Duration::from_secs(2)).await;
        assert_eq!(self_id, Some("77"));
        assert_eq!(up_message(self_id, "meow"), "Bot <@77> is up\nmeow");
        assert_eq!(up_message(None, "meow"), "meow");
    }
}
