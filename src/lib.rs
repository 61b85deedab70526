pub mod apps;
pub mod cache;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod lock;
pub mod logger;
pub mod meow;
pub mod queue;
pub mod shutdown;
pub mod snapshot;
pub mod supervisor;
pub mod web;

pub use context::SharedContext;
pub use error::{BotError, ShutdownError};
pub use shutdown::{ExitSignal, ShutdownCause, ShutdownCoordinator, WorkerState};
pub use supervisor::{Supervisor, WorkerContext};
