use std::sync::Arc;

use tracing::{error, info, warn};

use crate::channel::ChannelWorker;
use crate::channel::discord::DiscordPlatform;
use crate::channel::slack::SlackPlatform;
use crate::channel::telegram::TelegramPlatform;
use crate::config::{ConfigManager, Settings, Toggles};
use crate::context::SharedContext;
use crate::error::BotError;
use crate::meow::HttpUpstream;
use crate::supervisor::{Supervisor, WorkerHandle};
use crate::web::run_web;

pub const WEB_WORKER: &str = "web";
pub const TELEGRAM_WORKER: &str = "bot.telegram";
pub const DISCORD_WORKER: &str = "bot.discord";
pub const SLACK_WORKER: &str = "bot.slack";

/// The running process: one shared context and the workers built on it.
pub struct App {
    ctx: SharedContext,
    supervisor: Supervisor,
    handles: Vec<WorkerHandle>,
}

impl App {
    /// Loads settings and wires the real upstream services.
    pub async fn bootstrap(config: ConfigManager, cli: Toggles) -> Result<Self, BotError> {
        let settings = Settings::load(&config, cli).await?;
        let upstream = HttpUpstream::new(settings.ifttt_key.clone())?;
        Ok(Self::with_context(SharedContext::new(
            settings,
            Arc::new(upstream),
        )))
    }

    pub fn with_context(ctx: SharedContext) -> Self {
        Self {
            ctx,
            supervisor: Supervisor::default(),
            handles: Vec::new(),
        }
    }

    pub fn context(&self) -> &SharedContext {
        &self.ctx
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Submits one worker per enabled toggle. Returns how many started.
    pub fn start(&mut self) -> usize {
        let toggles = self.ctx.settings.toggles;
        if toggles.web {
            let ctx = self.ctx.clone();
            self.submit(WEB_WORKER, move |worker| run_web(ctx, worker));
        }
        if toggles.telegram {
            let ctx = self.ctx.clone();
            self.submit(TELEGRAM_WORKER, move |worker| async move {
                let platform = TelegramPlatform::new(&ctx.settings)?;
                ChannelWorker::new(platform, ctx).run(worker).await
            });
        }
        if toggles.discord {
            let ctx = self.ctx.clone();
            self.submit(DISCORD_WORKER, move |worker| async move {
                let platform = DiscordPlatform::new(&ctx.settings)?;
                ChannelWorker::new(platform, ctx).run(worker).await
            });
        }
        if toggles.slack {
            let ctx = self.ctx.clone();
            self.submit(SLACK_WORKER, move |worker| async move {
                let platform = SlackPlatform::new(&ctx.settings)?;
                ChannelWorker::new(platform, ctx).run(worker).await
            });
        }
        self.handles.len()
    }

    fn submit<F, Fut>(&mut self, name: &str, task: F)
    where
        F: FnOnce(crate::supervisor::WorkerContext) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), BotError>> + 'static,
    {
        match self.supervisor.submit(name, task) {
            Ok(handle) => {
                info!(worker = name, "worker submitted");
                self.handles.push(handle);
            }
            Err(e) => error!(worker = name, error = %e, "cannot start worker"),
        }
    }

    /// Blocks until shutdown completes and returns the process exit code:
    /// `1` when a worker failure started the shutdown, `0` otherwise.
    pub async fn wait(self) -> i32 {
        let coordinator = self.supervisor.coordinator().clone();
        if self.handles.is_empty() && !coordinator.is_requested() {
            warn!("no worker is enabled; nothing to do");
            return 0;
        }

        self.supervisor.listen_os_signals().await;
        if let Some(cause) = coordinator.cause() {
            info!(%cause, "shutting down");
        }

        if let Err(e) = coordinator.await_stopped(self.ctx.settings.shutdown_grace).await {
            warn!(error = %e, "forced shutdown");
        }
        for (name, state) in self.supervisor.diagnostics() {
            info!(worker = %name, %state, "final state");
        }
        self.supervisor.reap(self.handles);

        if coordinator.is_failure() { 1 } else { 0 }
    }
}
