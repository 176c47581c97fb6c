//! issue-mirror daemon: keeps a git repository in step with a tracker project.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use im_core::config::Config;
use im_daemon::daemon::Daemon;
use im_orchestrator::{OperationKind, OperationStatus};
use im_telemetry::logging::{init_with_format, LogFormat};
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "im-daemon", version, about)]
struct Cli {
    /// Config file (defaults to $ISSUE_MIRROR_CONFIG or ~/.issue-mirror/config.toml).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Run a single operation (bootstrap, reconcile, forced-sync, cleanup) and exit.
    #[arg(long, value_name = "KIND")]
    once: Option<OperationKind>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "daemon failed");
            eprintln!("im-daemon: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };

    let format = config
        .general
        .log_format
        .parse::<LogFormat>()
        .unwrap_or(LogFormat::Pretty);
    init_with_format("im-daemon", format, &config.general.log_level);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        project = %config.source.project_key,
        repo = %config.git.repo_path,
        "issue-mirror daemon starting"
    );

    let daemon = Daemon::new(config).context("failed to initialise daemon")?;
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.cancel();
    });

    if let Some(kind) = cli.once {
        let op = daemon.run_once(kind).await?;
        if op.status != OperationStatus::Completed {
            warn!(
                status = %op.status,
                error = op.error_message.as_deref().unwrap_or(""),
                "operation did not complete"
            );
            return Ok(ExitCode::FAILURE);
        }
        return Ok(ExitCode::SUCCESS);
    }

    daemon.run().await?;
    Ok(ExitCode::SUCCESS)
}
