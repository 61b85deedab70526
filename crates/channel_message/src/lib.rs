pub mod message;

pub use message::{Channel, InboundEvent, LogLevel, OutboundMessage, ReplyTarget};
