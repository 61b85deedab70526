//! # Worker supervisor.
//!
//! Every worker (each chat channel and the web server) runs on its own named
//! OS thread with a single-threaded tokio runtime, so a blocking call in one
//! channel cannot stall another.
//!
//! ```text
//! submit(name, task)
//!   ├─ register + Idle → Starting
//!   └─ thread "name"
//!        └─ runtime.block_on(select! {
//!               task(ctx)            → Ok / Err(BotError)
//!               force.cancelled()    → Forced
//!           })  (panics caught)
//!        └─ completion:
//!             ├─ log outcome, record Stopped / Failed
//!             └─ coordinator.request(WorkerExited)   ◄── fail fast
//! ```
//!
//! OS signals go through [`Supervisor::propagate_os_signal`], which ends in
//! the same `request` call as the completion path.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::thread::JoinHandle;
use std::time::Duration;

use futures_util::FutureExt;
use tracing::{error, info, warn};

use crate::error::BotError;
use crate::shutdown::{
    ExitSignal, ShutdownCause, ShutdownCoordinator, WorkerState, wait_for_shutdown_signal,
};

/// What a worker receives when it starts.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    name: String,
    coordinator: ShutdownCoordinator,
}

impl WorkerContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exit(&self) -> ExitSignal {
        self.coordinator.exit_signal()
    }

    pub fn set_state(&self, next: WorkerState) -> bool {
        self.coordinator.set_state(&self.name, next)
    }

    pub fn state(&self) -> Option<WorkerState> {
        self.coordinator.state(&self.name)
    }
}

#[derive(Debug)]
enum Outcome {
    Finished(Result<(), BotError>),
    Forced,
    Panicked(String),
}

#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    coordinator: ShutdownCoordinator,
}

impl Supervisor {
    pub fn new(coordinator: ShutdownCoordinator) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    /// Runs `task` on a dedicated thread and arranges for its completion,
    /// whatever the outcome, to request shutdown.
    pub fn submit<F, Fut>(&self, name: &str, task: F) -> Result<WorkerHandle, BotError>
    where
        F: FnOnce(WorkerContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BotError>> + 'static,
    {
        self.coordinator.register(name);
        self.coordinator.set_state(name, WorkerState::Starting);

        let ctx = WorkerContext {
            name: name.to_string(),
            coordinator: self.coordinator.clone(),
        };
        let coordinator = self.coordinator.clone();
        let worker = name.to_string();

        let spawned = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let outcome = run_worker(task, ctx, coordinator.force_token());
                complete(&coordinator, &worker, outcome);
            });

        match spawned {
            Ok(thread) => Ok(WorkerHandle {
                name: name.to_string(),
                thread,
            }),
            Err(e) => {
                let err = BotError::fatal(name, e);
                complete(&self.coordinator, name, Outcome::Finished(Err(err.clone())));
                Err(err)
            }
        }
    }

    /// Routes an OS signal into the shutdown path used by worker completion.
    pub fn propagate_os_signal(&self, signal: &str) -> bool {
        info!(target: "lifecycle", signal, "os signal received");
        self.coordinator
            .request(ShutdownCause::OsSignal(signal.to_string()))
    }

    /// Waits until either an OS signal arrives or something else sets the
    /// exit signal.
    pub async fn listen_os_signals(&self) {
        let exit = self.coordinator.exit_signal();
        tokio::select! {
            received = wait_for_shutdown_signal() => match received {
                Ok(signal) => {
                    self.propagate_os_signal(signal);
                }
                Err(e) => {
                    error!(error = %e, "cannot listen for os signals");
                    self.coordinator.request(ShutdownCause::Requested);
                }
            },
            _ = exit.wait() => {}
        }
    }

    pub fn diagnostics(&self) -> HashMap<String, WorkerState> {
        self.coordinator.states()
    }

    /// Joins the threads that have already returned. Threads still stuck
    /// after a forced stop are left detached.
    pub fn reap(&self, handles: Vec<WorkerHandle>) {
        for handle in handles {
            if handle.is_finished() {
                if handle.thread.join().is_err() {
                    warn!(worker = %handle.name, "worker thread panicked outside its runtime");
                }
            } else {
                warn!(worker = %handle.name, "detaching worker thread that did not stop");
            }
        }
    }
}

fn run_worker<F, Fut>(task: F, ctx: WorkerContext, force: tokio_util::sync::CancellationToken) -> Outcome
where
    F: FnOnce(WorkerContext) -> Fut,
    Fut: Future<Output = Result<(), BotError>>,
{
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => return Outcome::Finished(Err(BotError::fatal(ctx.name(), e))),
    };

    let outcome = runtime.block_on(async move {
        let guarded = AssertUnwindSafe(task(ctx)).catch_unwind();
        tokio::select! {
            result = guarded => match result {
                Ok(result) => Outcome::Finished(result),
                Err(panic) => Outcome::Panicked(panic_message(panic)),
            },
            _ = force.cancelled() => Outcome::Forced,
        }
    });
    runtime.shutdown_timeout(Duration::from_millis(200));
    outcome
}

fn complete(coordinator: &ShutdownCoordinator, name: &str, outcome: Outcome) {
    let (state, error) = match outcome {
        Outcome::Finished(Ok(())) => {
            info!(target: "lifecycle", worker = name, "worker finished");
            (WorkerState::Stopped, None)
        }
        Outcome::Finished(Err(e)) => {
            error!(target: "lifecycle", worker = name, kind = e.as_label(), error = %e, "worker failed");
            (WorkerState::Failed, Some(e.to_string()))
        }
        Outcome::Panicked(msg) => {
            error!(target: "lifecycle", worker = name, panic = %msg, "worker panicked");
            (WorkerState::Failed, Some(format!("panicked: {msg}")))
        }
        Outcome::Forced => {
            warn!(target: "lifecycle", worker = name, "worker force-cancelled");
            (WorkerState::Stopped, None)
        }
    };

    coordinator.finish(name, state);
    coordinator.request(ShutdownCause::WorkerExited {
        name: name.to_string(),
        error,
    });
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn until_terminal(coordinator: &ShutdownCoordinator, name: &str) -> WorkerState {
        for _ in 0..200 {
            if let Some(state) = coordinator.state(name) {
                if state.is_terminal() {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{name} never stopped");
    }

    #[tokio::test]
    async fn clean_exit_still_requests_shutdown() {
        let supervisor = Supervisor::default();
        let handle = supervisor
            .submit("short", |ctx| async move {
                ctx.set_state(WorkerState::Running);
                Ok::<(), BotError>(())
            })
            .unwrap();
        assert_eq!(handle.name(), "short");

        assert_eq!(
            until_terminal(supervisor.coordinator(), "short").await,
            WorkerState::Stopped
        );
        assert!(supervisor.coordinator().is_requested());
        assert!(!supervisor.coordinator().is_failure());
    }

    #[tokio::test]
    async fn panic_is_reported_as_failure() {
        let supervisor = Supervisor::default();
        supervisor
            .submit("boom", |_ctx| async move {
                if true {
                    panic!("handler exploded");
                }
                Ok::<(), BotError>(())
            })
            .unwrap();

        assert_eq!(
            until_terminal(supervisor.coordinator(), "boom").await,
            WorkerState::Failed
        );
        assert!(supervisor.coordinator().is_failure());
        match supervisor.coordinator().cause() {
            Some(ShutdownCause::WorkerExited { name, error: Some(e) }) => {
                assert_eq!(name, "boom");
                assert!(e.contains("handler exploded"));
            }
            other => panic!("unexpected cause {other:?}"),
        }
    }

    #[tokio::test]
    async fn os_signal_shares_the_request_path() {
        let supervisor = Supervisor::default();
        assert!(supervisor.propagate_os_signal("SIGTERM"));
        assert!(!supervisor.propagate_os_signal("SIGINT"));
        assert_eq!(
            supervisor.coordinator().cause(),
            Some(&ShutdownCause::OsSignal("SIGTERM".into()))
        );
    }

    #[tokio::test]
    async fn zero_workers_is_fine() {
        let supervisor = Supervisor::default();
        supervisor.coordinator().request(ShutdownCause::Requested);
        supervisor
            .coordinator()
            .await_stopped(Duration::from_millis(10))
            .await
            .unwrap();
        assert!(supervisor.diagnostics().is_empty());
    }
}
