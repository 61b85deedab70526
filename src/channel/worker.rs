use std::sync::Arc;
use std::time::Duration;

use channel_message::{InboundEvent, OutboundMessage};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::channel::commands::{CommandTable, respond};
use crate::channel::{Platform, Session, WorkerState};
use crate::context::SharedContext;
use crate::error::BotError;
use crate::meow::{Style, meow_say};
use crate::queue::ChannelQueues;
use crate::supervisor::WorkerContext;

type Inflight = JoinSet<Result<(), BotError>>;
type Background = Option<JoinHandle<Result<(), BotError>>>;

/// One item taken off a channel's queues.
#[derive(Debug)]
enum Work {
    Update(InboundEvent),
    Message(OutboundMessage),
}

/// Drives one [`Platform`]: connects, drains both queues of its channel,
/// and stops when the exit signal is set.
///
/// ```text
/// Starting ──connect ok──▶ Running ──exit──▶ Stopping ──▶ Stopped
///    │                        │
///    └──connect err──▶ Failed ◀──session ended
/// ```
pub struct ChannelWorker<P> {
    platform: Arc<P>,
    ctx: SharedContext,
    commands: CommandTable,
}

impl<P: Platform> ChannelWorker<P> {
    pub fn new(platform: P, ctx: SharedContext) -> Self {
        let commands = CommandTable::for_channel(platform.channel());
        Self {
            platform: Arc::new(platform),
            ctx,
            commands,
        }
    }

    pub async fn run(self, worker: WorkerContext) -> Result<(), BotError> {
        let channel = self.platform.channel();
        let exit = worker.exit();
        let queues = self.ctx.queues.for_channel(channel).clone();
        let poll = self.ctx.settings.queue_poll;

        info!(%channel, "connecting");
        let session = match self
            .platform
            .connect(queues.updates.clone(), exit.clone())
            .await
        {
            Ok(session) => session,
            Err(e) => {
                worker.set_state(WorkerState::Failed);
                return Err(BotError::fatal(worker.name(), e));
            }
        };
        let mut background = match session {
            Session::Passive => None,
            Session::Background(handle) => Some(handle),
        };
        worker.set_state(WorkerState::Running);
        info!(%channel, "ready for requests");

        let mut inflight = Inflight::new();
        if !self.ctx.settings.debug {
            let platform = Arc::clone(&self.platform);
            inflight.spawn(async move { platform.announce(&meow_say("Bot is up", Style::Say, true)).await });
        }

        let mut messages_first = false;
        let failure = loop {
            messages_first = !messages_first;
            tokio::select! {
                biased;
                _ = exit.wait() => break None,
                ended = session_ended(&mut background) => {
                    break Some(BotError::fatal(worker.name(), ended));
                }
                Some(joined) = inflight.join_next() => log_handler(joined),
                work = next_work(&queues, poll, messages_first) => match work {
                    Some(Work::Update(event)) => self.dispatch(event, &mut inflight),
                    Some(Work::Message(message)) => self.deliver(message, &mut inflight),
                    None => {}
                },
            }
        };

        let result = match failure {
            None => {
                worker.set_state(WorkerState::Stopping);
                let grace = self.ctx.settings.shutdown_grace / 2;
                tokio::join!(
                    self.drain(&mut inflight, grace),
                    close_session(background.take(), grace),
                );
                Ok(())
            }
            Some(e) => {
                if let Some(handle) = background.take() {
                    handle.abort();
                }
                inflight.abort_all();
                Err(e)
            }
        };

        if let Err(e) = self.platform.close().await {
            warn!(%channel, error = %e, "closing session failed");
        }
        match &result {
            Ok(()) => worker.set_state(WorkerState::Stopped),
            Err(_) => worker.set_state(WorkerState::Failed),
        };
        info!(%channel, "stopped");
        result
    }

    fn dispatch(&self, event: InboundEvent, inflight: &mut Inflight) {
        let Some(incoming) = self.platform.parse(&event) else {
            debug!(event = %event.id, "ignoring event");
            return;
        };
        let Some((command, args)) = self.commands.match_text(&incoming.text) else {
            return;
        };

        let platform = Arc::clone(&self.platform);
        let ctx = self.ctx.clone();
        inflight.spawn(async move {
            let channel = platform.channel();
            match respond(&ctx, channel, command, &args, &incoming.target).await {
                Some(reply) => platform.send(&incoming.target, reply).await,
                None => Ok(()),
            }
        });
    }

    fn deliver(&self, message: OutboundMessage, inflight: &mut Inflight) {
        let platform = Arc::clone(&self.platform);
        inflight.spawn(async move { platform.deliver(message).await });
    }

    /// Lets in-flight handlers finish for up to `grace`, then aborts the rest.
    async fn drain(&self, inflight: &mut Inflight, grace: Duration) {
        let finished = tokio::time::timeout(grace, async {
            while let Some(joined) = inflight.join_next().await {
                log_handler(joined);
            }
        })
        .await;
        if finished.is_err() {
            warn!(
                channel = %self.platform.channel(),
                remaining = inflight.len(),
                "aborting handlers still running after grace"
            );
            inflight.abort_all();
        }
    }
}

/// Waits up to `poll` for either queue. The queue tried first alternates
/// between calls so neither direction starves the other.
async fn next_work(queues: &ChannelQueues, poll: Duration, messages_first: bool) -> Option<Work> {
    tokio::select! {
        biased;
        Some(message) = queues.messages.get(poll), if messages_first => Some(Work::Message(message)),
        Some(event) = queues.updates.get(poll) => Some(Work::Update(event)),
        Some(message) = queues.messages.get(poll), if !messages_first => Some(Work::Message(message)),
        else => None,
    }
}

/// Gives the session task `grace` to observe the exit signal and close.
async fn close_session(background: Background, grace: Duration) {
    let Some(mut handle) = background else {
        return;
    };
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(Ok(()))) => debug!("session closed"),
        Ok(Ok(Err(e))) => warn!(error = %e, "session closed with an error"),
        Ok(Err(e)) => warn!(error = %e, "session task failed"),
        Err(_) => {
            warn!("session did not close in time");
            handle.abort();
        }
    }
}

/// Resolves when the background session ends; never resolves without one.
async fn session_ended(background: &mut Background) -> String {
    let Some(handle) = background.as_mut() else {
        return std::future::pending().await;
    };
    let reason = match handle.await {
        Ok(Ok(())) => "session ended".to_string(),
        Ok(Err(e)) => e.to_string(),
        Err(e) => format!("session task: {e}"),
    };
    *background = None;
    reason
}

/// Handler failures are per message: logged and dropped.
fn log_handler(joined: Result<Result<(), BotError>, JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(kind = e.as_label(), error = %e, "dropping message"),
        Err(e) if e.is_cancelled() => debug!("handler cancelled"),
        Err(e) => warn!(error = %e, "handler panicked"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    use async_trait::async_trait;
    use channel_message::{Channel, ReplyTarget};
    use serde_json::{Value, json};

    use super::*;
    use crate::channel::{IncomingMessage, Reply};
    use crate::config::Settings;
    use crate::context::testing::FakeUpstream;
    use crate::queue::ChannelQueue;
    use crate::shutdown::{ExitSignal, ShutdownCause, ShutdownCoordinator};
    use crate::supervisor::Supervisor;

    #[derive(Default)]
    struct FakePlatform {
        refuse: bool,
        gateway: bool,
        send_delay: Duration,
        sending: Arc<AtomicUsize>,
        sent: Arc<Mutex<Vec<(ReplyTarget, Reply)>>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Platform for FakePlatform {
        fn channel(&self) -> Channel {
            Channel::Discord
        }

        async fn connect(
            &self,
            _inbound: ChannelQueue<InboundEvent>,
            exit: ExitSignal,
        ) -> Result<Session, BotError> {
            if self.refuse {
                return Err(BotError::transport(Channel::Discord, "401 Unauthorized"));
            }
            if !self.gateway {
                return Ok(Session::Passive);
            }
            let closed = Arc::clone(&self.closed);
            Ok(Session::Background(tokio::spawn(async move {
                exit.wait().await;
                // close handshake
                tokio::task::yield_now().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                closed.store(true, Ordering::SeqCst);
                Ok(())
            })))
        }

        fn parse(&self, event: &InboundEvent) -> Option<IncomingMessage> {
            Some(IncomingMessage {
                text: event.payload.get("text")?.as_str()?.to_string(),
                target: ReplyTarget::new(event.payload.get("chat").and_then(Value::as_str)?, None),
            })
        }

        async fn send(&self, target: &ReplyTarget, reply: Reply) -> Result<(), BotError> {
            self.sending.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.send_delay).await;
            self.sent.lock().unwrap().push((target.clone(), reply));
            Ok(())
        }
    }

    fn context() -> SharedContext {
        let settings = Settings {
            debug: true,
            queue_poll: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(1),
            ..Settings::default()
        };
        SharedContext::new(settings, Arc::new(FakeUpstream::default()))
    }

    fn chat_message(chat: &str) -> OutboundMessage {
        OutboundMessage {
            channel: Channel::Discord,
            target: ReplyTarget::new(chat, None),
            text: format!("hello {chat}"),
        }
    }

    async fn until(mut ready: impl FnMut() -> bool) {
        for _ in 0..300 {
            if ready() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }

    fn start(platform: FakePlatform, ctx: SharedContext) -> Supervisor {
        let supervisor = Supervisor::default();
        supervisor
            .submit("bot.discord", move |worker| ChannelWorker::new(platform, ctx).run(worker))
            .unwrap();
        supervisor
    }

    async fn until_terminal(coordinator: &ShutdownCoordinator, name: &str) -> WorkerState {
        for _ in 0..300 {
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
    async fn answers_commands_and_chat_messages_then_stops() {
        let ctx = context();
        let platform = FakePlatform::default();
        let sent = Arc::clone(&platform.sent);
        let supervisor = Supervisor::default();

        let worker_ctx = ctx.clone();
        supervisor
            .submit("bot.discord", move |worker| {
                ChannelWorker::new(platform, worker_ctx).run(worker)
            })
            .unwrap();

        let queues = ctx.queues.for_channel(Channel::Discord);
        queues
            .updates
            .put(InboundEvent::new(
                Channel::Discord,
                json!({"text": "!meowsay purr", "chat": "c1"}),
            ))
            .unwrap();
        queues
            .updates
            .put(InboundEvent::new(
                Channel::Discord,
                json!({"text": "no command here", "chat": "c1"}),
            ))
            .unwrap();
        queues
            .messages
            .put(OutboundMessage {
                channel: Channel::Discord,
                target: ReplyTarget::new("c2", Some("m9".into())),
                text: "from the web".into(),
            })
            .unwrap();

        for _ in 0..200 {
            if sent.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        {
            let sent = sent.lock().unwrap();
            assert_eq!(sent.len(), 2);
            assert!(sent.iter().any(|(target, reply)| {
                target.chat == "c1" && matches!(reply, Reply::Text(t) if t.contains("purr"))
            }));
            assert!(sent.iter().any(|(target, reply)| {
                target.chat == "c2" && *reply == Reply::Text("from the web".into())
            }));
        }

        supervisor.coordinator().request(ShutdownCause::Requested);
        assert_eq!(
            until_terminal(supervisor.coordinator(), "bot.discord").await,
            WorkerState::Stopped
        );
        assert!(!supervisor.coordinator().is_failure());
    }

    #[tokio::test]
    async fn refused_connection_fails_the_worker() {
        let ctx = context();
        let platform = FakePlatform {
            refuse: true,
            ..FakePlatform::default()
        };
        let supervisor = Supervisor::default();
        supervisor
            .submit("bot.discord", move |worker| {
                ChannelWorker::new(platform, ctx).run(worker)
            })
            .unwrap();

        assert_eq!(
            until_terminal(supervisor.coordinator(), "bot.discord").await,
            WorkerState::Failed
        );
        assert!(
            supervisor
                .coordinator()
                .exit_signal()
                .wait_timeout(Duration::from_secs(2))
                .await
        );
        assert!(supervisor.coordinator().is_failure());
    }

    #[tokio::test]
    async fn reply_in_flight_is_sent_before_stopping() {
        let ctx = context();
        let platform = FakePlatform {
            send_delay: Duration::from_millis(150),
            ..FakePlatform::default()
        };
        let sending = Arc::clone(&platform.sending);
        let sent = Arc::clone(&platform.sent);
        let supervisor = start(platform, ctx.clone());

        let messages = &ctx.queues.for_channel(Channel::Discord).messages;
        messages.put(chat_message("c1")).unwrap();
        until(|| sending.load(Ordering::SeqCst) == 1).await;

        supervisor.coordinator().request(ShutdownCause::Requested);
        assert_eq!(
            until_terminal(supervisor.coordinator(), "bot.discord").await,
            WorkerState::Stopped
        );
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hung_reply_is_aborted_after_half_the_grace() {
        let ctx = context();
        let platform = FakePlatform {
            send_delay: Duration::from_secs(30),
            ..FakePlatform::default()
        };
        let sending = Arc::clone(&platform.sending);
        let sent = Arc::clone(&platform.sent);
        let supervisor = start(platform, ctx.clone());

        let messages = &ctx.queues.for_channel(Channel::Discord).messages;
        messages.put(chat_message("c1")).unwrap();
        until(|| sending.load(Ordering::SeqCst) == 1).await;

        let requested = Instant::now();
        supervisor.coordinator().request(ShutdownCause::Requested);
        assert_eq!(
            until_terminal(supervisor.coordinator(), "bot.discord").await,
            WorkerState::Stopped
        );
        let elapsed = requested.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(900), "{elapsed:?}");
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn graceful_stop_lets_the_session_close() {
        let platform = FakePlatform {
            gateway: true,
            ..FakePlatform::default()
        };
        let closed = Arc::clone(&platform.closed);
        let supervisor = start(platform, context());
        let coordinator = supervisor.coordinator();
        until(|| coordinator.state("bot.discord") == Some(WorkerState::Running)).await;

        coordinator.request(ShutdownCause::Requested);
        assert_eq!(
            until_terminal(coordinator, "bot.discord").await,
            WorkerState::Stopped
        );
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn queues_take_turns() {
        let queues = ChannelQueues::new(Channel::Discord);
        for i in 0..3 {
            queues
                .updates
                .put(InboundEvent::new(Channel::Discord, json!({"n": i})))
                .unwrap();
        }
        queues.messages.put(chat_message("c1")).unwrap();
        let poll = Duration::from_millis(20);

        let first = next_work(&queues, poll, false).await;
        assert!(matches!(first, Some(Work::Update(_))));
        let second = next_work(&queues, poll, true).await;
        assert!(matches!(second, Some(Work::Message(_))));
        let third = next_work(&queues, poll, true).await;
        assert!(matches!(third, Some(Work::Update(_))));

        let drained = ChannelQueues::new(Channel::Discord);
        assert!(next_work(&drained, poll, true).await.is_none());
    }
}
