use std::time::{Duration, Instant};

use bigmeow::{
    BotError, ShutdownCause, ShutdownError, Supervisor, WorkerContext, WorkerState,
};

const POLL: Duration = Duration::from_millis(100);

/// A worker that behaves like a channel loop: polls the exit signal and
/// walks its states down on the way out.
async fn polite(worker: WorkerContext) -> Result<(), BotError> {
    worker.set_state(WorkerState::Running);
    let exit = worker.exit();
    while !exit.wait_timeout(POLL).await {}
    worker.set_state(WorkerState::Stopping);
    worker.set_state(WorkerState::Stopped);
    Ok(())
}

async fn wait_for_exit(supervisor: &Supervisor) {
    assert!(
        supervisor
            .coordinator()
            .exit_signal()
            .wait_timeout(Duration::from_secs(2))
            .await,
        "exit signal was never set"
    );
}

#[tokio::test]
async fn one_failing_worker_stops_everyone() {
    let supervisor = Supervisor::default();
    supervisor.submit("web", polite).unwrap();
    supervisor.submit("bot.telegram", polite).unwrap();
    supervisor.submit("bot.slack", polite).unwrap();
    supervisor
        .submit("bot.discord", |worker| async move {
            worker.set_state(WorkerState::Running);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(BotError::fatal(worker.name(), "gateway closed"))
        })
        .unwrap();

    wait_for_exit(&supervisor).await;
    let signalled = Instant::now();

    let coordinator = supervisor.coordinator();
    coordinator.await_stopped(Duration::from_secs(2)).await.unwrap();
    assert!(signalled.elapsed() < POLL * 5);

    assert!(coordinator.is_failure());
    assert!(coordinator.alive().is_empty());
    let states = supervisor.diagnostics();
    assert_eq!(states["bot.discord"], WorkerState::Failed);
    for name in ["web", "bot.telegram", "bot.slack"] {
        assert_eq!(states[name], WorkerState::Stopped, "{name}");
    }
}

#[tokio::test]
async fn os_signal_is_a_clean_shutdown() {
    let supervisor = Supervisor::default();
    supervisor.submit("web", polite).unwrap();
    supervisor.submit("bot.discord", polite).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(supervisor.propagate_os_signal("SIGTERM"));

    let coordinator = supervisor.coordinator();
    coordinator.await_stopped(Duration::from_secs(2)).await.unwrap();
    assert!(!coordinator.is_failure());
    assert_eq!(
        coordinator.cause(),
        Some(&ShutdownCause::OsSignal("SIGTERM".into()))
    );
    assert!(
        supervisor
            .diagnostics()
            .values()
            .all(|state| *state == WorkerState::Stopped)
    );
}

#[tokio::test]
async fn shutdown_requests_are_idempotent() {
    let supervisor = Supervisor::default();
    supervisor.submit("web", polite).unwrap();

    let coordinator = supervisor.coordinator();
    assert!(coordinator.request(ShutdownCause::Requested));
    assert!(!coordinator.request(ShutdownCause::OsSignal("SIGINT".into())));
    assert!(!supervisor.propagate_os_signal("SIGHUP"));

    coordinator.await_stopped(Duration::from_secs(2)).await.unwrap();
    assert_eq!(coordinator.cause(), Some(&ShutdownCause::Requested));
    assert!(!coordinator.is_failure());
}

#[tokio::test]
async fn stuck_worker_is_forced_after_grace() {
    let supervisor = Supervisor::default();
    supervisor.submit("web", polite).unwrap();
    supervisor
        .submit("bot.stuck", |worker| async move {
            worker.set_state(WorkerState::Running);
            std::future::pending::<()>().await;
            Ok(())
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let coordinator = supervisor.coordinator();
    coordinator.request(ShutdownCause::Requested);

    match coordinator.await_stopped(POLL * 3).await {
        Err(ShutdownError::GraceExceeded { grace, stuck }) => {
            assert_eq!(grace, POLL * 3);
            assert_eq!(stuck, vec!["bot.stuck".to_string()]);
        }
        other => panic!("expected grace to be exceeded, got {other:?}"),
    }
    assert_eq!(coordinator.state("web"), Some(WorkerState::Stopped));
    assert_eq!(coordinator.state("bot.stuck"), Some(WorkerState::Stopped));
    assert!(!coordinator.is_failure());
}
