//! Binary entry point: parses the three CLI flags, initializes logging,
//! bootstraps the orchestrator (including pairing, if needed), and runs
//! either the one-shot or continuous mode until a shutdown signal arrives.

mod backoff;
mod backup;
mod cloud;
mod config;
mod controller;
mod error;
mod executor;
mod orchestrator;
mod util;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[clap(name = "printer-connector", version, about = "LAN-resident agent bridging a Moonraker printer to the cloud control plane")]
struct Cli {
    /// Path to the JSON config file.
    #[clap(long)]
    config: PathBuf,

    /// Minimum log level to emit.
    #[clap(long, arg_enum, default_value = "info")]
    log_level: LogLevel,

    /// Run one heartbeat, one command poll, and one snapshot push, then exit.
    #[clap(long)]
    once: bool,
}

#[derive(Debug, Clone, Copy, clap::ArgEnum)]
#[clap(rename_all = "lowercase")]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // `Cli::parse` prints usage/help/version and exits the process itself
    // on any of those paths, with clap's own exit code (2 for usage errors).
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level.into())
        .parse_env("RUST_LOG")
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let orchestrator = orchestrator::Orchestrator::bootstrap(&cli.config).await?;

    if cli.once {
        let ok = orchestrator.run_once().await;
        if !ok {
            anyhow::bail!("all one-shot iterations failed");
        }
        return Ok(());
    }

    let token = CancellationToken::new();
    let shutdown_token = token.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        log::info!("shutdown signal received, cancelling loops");
        shutdown_token.cancel();
    });

    orchestrator.run_continuous(token).await
}

/// Waits for either SIGINT or SIGTERM so the orchestrator can shut down
/// gracefully regardless of how the service manager stops the process.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
