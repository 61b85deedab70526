//! FIFO queues between the web server and the channel workers.
//!
//! Every channel owns two queues: `updates` carries raw platform events from
//! the webhook routes to the worker, `messages` carries formatted replies
//! from `POST /chat` to the worker that sends them. Payloads are plain
//! serializable data so a queue never holds a live session.

use std::sync::Arc;
use std::time::Duration;

use channel_message::{Channel, InboundEvent, OutboundMessage};
use tokio::sync::{Mutex, mpsc};
use tracing::trace;

use crate::error::BotError;

/// A multi-producer queue with a single logical consumer.
///
/// `put` never waits. `get` waits at most `timeout` and returns `None` when
/// nothing arrived, so a consumer loop can re-check its exit signal between
/// polls.
#[derive(Debug)]
pub struct ChannelQueue<T> {
    name: String,
    tx: mpsc::UnboundedSender<T>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
}

impl<T> Clone for ChannelQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T: Send + 'static> ChannelQueue<T> {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn put(&self, item: T) -> Result<(), BotError> {
        trace!(queue = %self.name, "put");
        self.tx
            .send(item)
            .map_err(|_| BotError::fatal(self.name.clone(), "queue receiver dropped"))
    }

    pub async fn get(&self, timeout: Duration) -> Option<T> {
        let wait = async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Takes an item only if one is already waiting.
    pub fn try_get(&self) -> Option<T> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// Items waiting. Reports zero while a consumer is parked in `get`.
    pub fn len(&self) -> usize {
        self.rx.try_lock().map(|rx| rx.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Both directions for one channel.
#[derive(Debug, Clone)]
pub struct ChannelQueues {
    pub updates: ChannelQueue<InboundEvent>,
    pub messages: ChannelQueue<OutboundMessage>,
}

impl ChannelQueues {
    pub fn new(channel: Channel) -> Self {
        Self {
            updates: ChannelQueue::new(format!("{channel}.updates")),
            messages: ChannelQueue::new(format!("{channel}.messages")),
        }
    }
}

/// The queues of every channel, created once per process.
#[derive(Debug, Clone)]
pub struct Queues {
    telegram: ChannelQueues,
    discord: ChannelQueues,
    slack: ChannelQueues,
}

impl Default for Queues {
    fn default() -> Self {
        Self::new()
    }
}

impl Queues {
    pub fn new() -> Self {
        Self {
            telegram: ChannelQueues::new(Channel::Telegram),
            discord: ChannelQueues::new(Channel::Discord),
            slack: ChannelQueues::new(Channel::Slack),
        }
    }

    pub fn for_channel(&self, channel: Channel) -> &ChannelQueues {
        match channel {
            Channel::Telegram => &self.telegram,
            Channel::Discord => &self.discord,
            Channel::Slack => &self.slack,
        }
    }
}
