//! Error types shared by the caches, the channel workers and the supervisor.
//!
//! - [`BotError`]: failures of a single operation. Only `WorkerFatal` escapes a
//!   channel worker; the others are absorbed where they happen and degrade
//!   to cached data or a dropped message.
//! - [`ShutdownError`]: failures of the shutdown sequence itself.

use std::time::Duration;

use channel_message::Channel;
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BotError {
    /// A cache was read before anything was stored in it.
    #[error("cache is empty")]
    EmptyCache,

    /// An upstream data source could not be fetched or parsed.
    #[error("fetching {source_name} failed: {reason}")]
    UpstreamFetch { source_name: String, reason: String },

    /// One message could not be delivered to a platform.
    #[error("{channel} transport error: {reason}")]
    Transport { channel: Channel, reason: String },

    /// The worker can no longer run its loop.
    #[error("worker `{worker}` failed: {reason}")]
    WorkerFatal { worker: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BotError {
    pub fn upstream(source_name: impl Into<String>, reason: impl ToString) -> Self {
        BotError::UpstreamFetch {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transport(channel: Channel, reason: impl ToString) -> Self {
        BotError::Transport {
            channel,
            reason: reason.to_string(),
        }
    }

    pub fn fatal(worker: impl Into<String>, reason: impl ToString) -> Self {
        BotError::WorkerFatal {
            worker: worker.into(),
            reason: reason.to_string(),
        }
    }

    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            BotError::EmptyCache => "empty_cache",
            BotError::UpstreamFetch { .. } => "upstream_fetch",
            BotError::Transport { .. } => "transport",
            BotError::WorkerFatal { .. } => "worker_fatal",
            BotError::Config(_) => "config",
        }
    }

    /// Whether the error must take the whole process down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BotError::WorkerFatal { .. } | BotError::Config(_))
    }
}

#[non_exhaustive]
#[derive(Error, Debug, PartialEq)]
pub enum ShutdownError {
    /// Some workers were still running when the grace period ran out and had
    /// to be force-cancelled.
    #[error("shutdown grace {grace:?} exceeded; stuck: {stuck:?}")]
    GraceExceeded { grace: Duration, stuck: Vec<String> },
}
