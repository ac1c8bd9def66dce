// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, ValueEnum};
use std::process::{ExitCode, exit};
use std::time::Duration;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::metadata::LevelFilter;
use tracing::{error, info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use logfwd::init::agent::{Agent, PERSISTER_STOP_TIMEOUT};
use logfwd::init::args::AgentRun;
use logfwd::init::config::Config;
use logfwd::init::wait;

/// Slack on top of the agent's own shutdown bounds before the process is
/// terminated.
const FORCED_EXIT_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Run agent
    Start(Box<AgentRun>),

    /// Return version
    Version,
}

#[derive(Debug, Parser)]
#[command(name = "logfwd")]
#[command(bin_name = "logfwd")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    #[arg(
        value_enum,
        long,
        global = true,
        env = "LOGFWD_LOG_FORMAT",
        default_value = "text"
    )]
    /// Log format
    log_format: LogFormatArg,

    #[arg(long, global = true, env = "LOGFWD_ENVIRONMENT")]
    /// Environment, overrides `env` from the config file
    environment: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    match opt.command {
        Some(Commands::Version) => {
            println!("{}", get_version())
        }
        Some(Commands::Start(agent)) => {
            let config_path = agent.config_path();
            let mut config = match Config::load(&config_path) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("ERROR: {}: {}", config_path.display(), e);
                    return ExitCode::from(1);
                }
            };
            if let Some(env) = opt.environment {
                config.env = env;
            }

            let _guard = match setup_logging(&opt.log_format, config.debug_mode) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("ERROR: failed to setup logging: {}", e);
                    return ExitCode::from(1);
                }
            };
            info!(
                version = %get_version(),
                config = %config_path.display(),
                "Configuration loaded."
            );

            match run_agent(config) {
                Ok(_) => {}
                Err(e) => {
                    error!(error = e, "Failed to run agent.");
                    return ExitCode::from(1);
                }
            }
        }
        _ => {
            // unreachable while a subcommand is required
            error!("Must specify a command");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}

#[tokio::main]
async fn run_agent(config: Config) -> Result<(), BoxError> {
    let mut agent_join_set = JoinSet::new();
    let grace = config.shutdown_timeout() + PERSISTER_STOP_TIMEOUT + FORCED_EXIT_MARGIN;

    let cancel_token = CancellationToken::new();
    {
        let token = cancel_token.clone();
        agent_join_set.spawn(async move { Agent::new(config).run(token).await });
    }

    select! {
        res = signal_wait() => {
            res?;
            info!("Shutdown signal received.");
            cancel_token.cancel();
        },
        e = wait::wait_for_any_task(&mut agent_join_set) => {
            match e {
                Ok(()) => warn!("Unexpected early exit of agent."),
                Err(e) => return Err(e),
            }
        },
    }

    let res = wait::wait_for_tasks_with_timeout(&mut agent_join_set, grace).await;
    if !agent_join_set.is_empty() {
        error!(grace = ?grace, "Agent did not stop within the shutdown grace period, exiting.");
        // blocking reads would keep the runtime from shutting down
        exit(1);
    }

    res
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_format: &LogFormatArg, debug_mode: bool) -> Result<LoggerGuard, BoxError> {
    LogTracer::init()?;

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let level = if debug_mode {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()?
        .add_directive("hyper_util=warn".parse()?)
        .add_directive("rustls=warn".parse()?);

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), get_version());
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);

        let subscriber = Registry::default()
            .with(filter)
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        use std::io;
        use std::io::IsTerminal;

        // Skip color codes when not in a terminal
        let use_ansi = io::stdout().is_terminal();

        let stdout_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .with_ansi(use_ansi)
            .compact();

        let subscriber = Registry::default().with(filter).with(stdout_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(guard)
}

fn get_version() -> String {
    // Set during CI
    let version_build = option_env!("BUILD_SHORT_SHA").unwrap_or("dev");

    format!("{}-{}", env!("CARGO_PKG_VERSION"), version_build)
}

async fn signal_wait() -> Result<(), BoxError> {
    let mut sig_term = signal(SignalKind::terminate())?;
    let mut sig_int = signal(SignalKind::interrupt())?;

    select! {
        _ = sig_term.recv() => {},
        _ = sig_int.recv() => {},
    }
    Ok(())
}
