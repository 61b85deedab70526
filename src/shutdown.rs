//! # Coordinated shutdown.
//!
//! One [`ShutdownCoordinator`] exists per process. Its [`ExitSignal`] is the
//! only way anything is asked to stop:
//!
//! ```text
//! SIGHUP/SIGTERM/SIGINT ─┐
//! worker completion ─────┼─► request(cause) ─► ExitSignal set (once)
//! programmatic ──────────┘                          │
//!                                                   ▼
//!                              workers notice within one poll interval
//!                                                   │
//!                         await_stopped(grace) ─────┤
//!                           ├─ all terminal       → Ok
//!                           └─ grace ran out      → force token cancelled,
//!                                                   GraceExceeded{stuck}
//! ```
//!
//! The coordinator also keeps the [`WorkerState`] of every registered worker,
//! which is what `await_stopped` and the diagnostics read.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use strum_macros::{AsRefStr, Display};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ShutdownError;

/// How long force-cancelled workers get to record their final state.
const FORCE_SETTLE: Duration = Duration::from_millis(500);

/// Set-once broadcast flag. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct ExitSignal {
    token: CancellationToken,
}

impl ExitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.token.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    /// Returns `true` if the signal was set before `timeout` elapsed.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.token.cancelled())
            .await
            .is_ok()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Failed)
    }

    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Starting, Failed)
                | (Running, Failed)
                | (Stopping, Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    OsSignal(String),
    WorkerExited { name: String, error: Option<String> },
    Requested,
}

impl std::fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownCause::OsSignal(sig) => write!(f, "received {sig}"),
            ShutdownCause::WorkerExited { name, error: None } => write!(f, "worker `{name}` exited"),
            ShutdownCause::WorkerExited {
                name,
                error: Some(e),
            } => write!(f, "worker `{name}` failed: {e}"),
            ShutdownCause::Requested => write!(f, "shutdown requested"),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    exit: ExitSignal,
    force: CancellationToken,
    cause: OnceLock<ShutdownCause>,
    states: DashMap<String, WorkerState>,
    changed: Notify,
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exit_signal(&self) -> ExitSignal {
        self.inner.exit.clone()
    }

    /// Cancelled once the grace period has run out.
    pub fn force_token(&self) -> CancellationToken {
        self.inner.force.clone()
    }

    /// Sets the exit signal. Only the first call has an effect; it returns
    /// `true` and records `cause`.
    pub fn request(&self, cause: ShutdownCause) -> bool {
        if self.inner.cause.set(cause.clone()).is_err() {
            return false;
        }
        info!(target: "lifecycle", %cause, "shutdown requested");
        self.inner.exit.set();
        true
    }

    pub fn is_requested(&self) -> bool {
        self.inner.exit.is_set()
    }

    pub fn cause(&self) -> Option<&ShutdownCause> {
        self.inner.cause.get()
    }

    /// True when shutdown was triggered by a worker that failed before
    /// anything else asked the process to stop.
    pub fn is_failure(&self) -> bool {
        matches!(
            self.cause(),
            Some(ShutdownCause::WorkerExited { error: Some(_), .. })
        )
    }

    pub fn register(&self, name: &str) {
        self.inner.states.insert(name.to_string(), WorkerState::Idle);
        self.inner.changed.notify_waiters();
    }

    /// Moves `name` to `next` if the state machine allows it.
    pub fn set_state(&self, name: &str, next: WorkerState) -> bool {
        let Some(mut entry) = self.inner.states.get_mut(name) else {
            warn!(worker = name, %next, "state change for unregistered worker");
            return false;
        };
        let current = *entry;
        if !current.can_transition_to(next) {
            warn!(worker = name, %current, %next, "rejected worker state transition");
            return false;
        }
        *entry = next;
        drop(entry);

        info!(target: "lifecycle", worker = name, from = %current, to = %next, "worker state");
        self.inner.changed.notify_waiters();
        true
    }

    /// Records a terminal state without checking the transition. Used by the
    /// supervisor once a worker's thread has returned.
    pub fn finish(&self, name: &str, state: WorkerState) {
        debug_assert!(state.is_terminal());
        if let Some(mut entry) = self.inner.states.get_mut(name) {
            if !entry.is_terminal() {
                *entry = state;
            }
        }
        self.inner.changed.notify_waiters();
    }

    pub fn state(&self, name: &str) -> Option<WorkerState> {
        self.inner.states.get(name).map(|s| *s)
    }

    pub fn states(&self) -> HashMap<String, WorkerState> {
        self.inner
            .states
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Names of workers not yet in a terminal state, sorted.
    pub fn alive(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .states
            .iter()
            .filter(|e| !e.value().is_terminal())
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    async fn all_stopped(&self) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.alive().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Waits up to `grace` for every worker to stop. Stragglers are then
    /// force-cancelled and reported.
    pub async fn await_stopped(&self, grace: Duration) -> Result<(), ShutdownError> {
        if tokio::time::timeout(grace, self.all_stopped()).await.is_ok() {
            info!(target: "lifecycle", "all workers stopped within grace");
            return Ok(());
        }

        let stuck = self.alive();
        warn!(target: "lifecycle", ?grace, ?stuck, "grace exceeded; force-cancelling");
        self.inner.force.cancel();
        let _ = tokio::time::timeout(FORCE_SETTLE, self.all_stopped()).await;

        Err(ShutdownError::GraceExceeded { grace, stuck })
    }
}

/// Completes on the first SIGHUP, SIGTERM or SIGINT and returns its name.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sighup.recv() => "SIGHUP",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(name)
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("CTRL_C")
}
