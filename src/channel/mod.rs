/*
┌───────────────┐  POST /{platform}   ┌──────────────────────────────┐
│   web server  │ ──── updates ─────▶ │        ChannelWorker<P>      │
│               │                     │  parse ─▶ CommandTable ─▶    │
│  POST /chat   │ ──── messages ────▶ │  respond ─▶ Platform::send   │
└───────────────┘                     └──────────────────────────────┘
                                         ▲            │
             gateway session (discord) ──┘            ▼
                                               platform HTTP API
*/
pub mod commands;
pub mod discord;
pub mod slack;
pub mod telegram;
pub mod worker;

use std::sync::Arc;

use async_trait::async_trait;
use channel_message::{Channel, InboundEvent, OutboundMessage, ReplyTarget};
use tokio::task::JoinHandle;

use crate::error::BotError;
use crate::queue::ChannelQueue;
use crate::shutdown::ExitSignal;

pub use commands::{CommandTable, MeowCommand};
pub use worker::ChannelWorker;
pub use crate::shutdown::WorkerState;

/// What a platform connection leaves running after `connect`.
#[derive(Debug)]
pub enum Session {
    /// Events arrive through the web server; nothing to watch.
    Passive,
    /// A task that feeds the inbound queue. It ending for any reason while
    /// the worker is running is fatal.
    Background(JoinHandle<Result<(), BotError>>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    Photo { bytes: Arc<Vec<u8>>, caption: String },
}

/// A chat message pulled out of a raw platform event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub text: String,
    pub target: ReplyTarget,
}

/// One messaging platform as seen by a [`ChannelWorker`].
#[async_trait]
pub trait Platform: Send + Sync + 'static {
    fn channel(&self) -> Channel;

    /// Establishes the platform session. An error here fails the worker.
    async fn connect(
        &self,
        inbound: ChannelQueue<InboundEvent>,
        exit: ExitSignal,
    ) -> Result<Session, BotError>;

    /// Extracts the text and reply target, or `None` for events the bot
    /// ignores (its own messages, edits, non-text updates).
    fn parse(&self, event: &InboundEvent) -> Option<IncomingMessage>;

    async fn send(&self, target: &ReplyTarget, reply: Reply) -> Result<(), BotError>;

    /// Sends a reply queued through `POST /chat`.
    async fn deliver(&self, message: OutboundMessage) -> Result<(), BotError> {
        self.send(&message.target, Reply::Text(message.text)).await
    }

    /// Tells the bot owner the worker is up.
    async fn announce(&self, _text: &str) -> Result<(), BotError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), BotError> {
        Ok(())
    }
}
