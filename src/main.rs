use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use bigmeow::{
    apps::App,
    config::{ConfigManager, EnvConfigManager, Toggles},
    logger::{LogConfig, init_tracing},
};
use channel_message::LogLevel;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "bigmeow", about = "The cat bot for Telegram, Discord and Slack", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bot and its web server
    Run(RunArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Do not start the web server
    #[arg(long)]
    noweb: bool,
    /// Do not start the Telegram worker
    #[arg(long)]
    notg: bool,
    /// Do not start the Discord worker
    #[arg(long)]
    nodiscord: bool,
    /// Do not start the Slack worker
    #[arg(long)]
    noslack: bool,

    /// Environment file with tokens and switches
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Log level (trace, debug, info, warn, error, critical)
    #[arg(long, default_value = "info")]
    log_level: LogLevel,

    /// Also write daily log files into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl RunArgs {
    fn toggles(&self) -> Toggles {
        Toggles {
            web: !self.noweb,
            telegram: !self.notg,
            discord: !self.nodiscord,
            slack: !self.noslack,
        }
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let args = match cli.command {
        Some(Commands::Run(args)) => args,
        None => RunArgs {
            env_file: PathBuf::from(".env"),
            ..RunArgs::default()
        },
    };

    match run(args).await {
        Ok(code) => {
            info!(code, "goodbye");
            ExitCode::from(code)
        }
        Err(e) => {
            error!(error = %e, "cannot start bigmeow");
            eprintln!("bigmeow: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Starts every enabled worker and returns the exit code once they stopped.
async fn run(args: RunArgs) -> anyhow::Result<u8> {
    init_tracing(&LogConfig::new(args.log_level, args.log_dir.clone()))
        .context("could not set up logging")?;
    info!("bigmeow starting up");

    let config = ConfigManager(EnvConfigManager::new(args.env_file.clone()));
    let mut app = App::bootstrap(config, args.toggles())
        .await
        .context("invalid configuration")?;

    let started = app.start();
    info!(workers = started, "bigmeow running; press Ctrl-C to exit");
    let code = app.wait().await;
    Ok(u8::try_from(code).unwrap_or(1))
}
