//! memlift CLI: export, import and verify agent memory snapshots.

mod cli;
mod cmd;
mod config;
mod ui;

use clap::Parser;
use cli::{Cli, Commands};
use config::FlagOverrides;
use memlift_migrate::{ExitStatus, Orchestrator};
use memlift_types::config::MigrationConfig;
use memlift_types::error::MemliftError;
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::warn;

/// Logs go to stderr so stdout carries only summaries and `--json` output.
fn init_tracing_stderr(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr(cli.verbose);
    let status = run(cli);
    std::process::exit(status.code());
}

fn run(cli: Cli) -> ExitStatus {
    let json = cli.json;

    if let Commands::Inspect { path } = &cli.command {
        return cmd::inspect::cmd_inspect(path, json);
    }

    let env: HashMap<String, String> = std::env::vars().collect();
    let flags = FlagOverrides {
        source_url: cli.source_url.clone(),
        target_url: cli.target_url.clone(),
    };
    let config = match config::load_config(cli.config.as_deref(), &env, &flags) {
        Ok(config) => config,
        Err(e) => return cmd::fail(&e, json),
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => return cmd::fail(&MemliftError::Io(e), json),
    };
    runtime.block_on(dispatch(cli.command, config, json))
}

async fn dispatch(command: Commands, config: MigrationConfig, json: bool) -> ExitStatus {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current request");
            shutdown_tx.send_replace(true);
        }
    });

    let orchestrator = match Orchestrator::from_config(config) {
        Ok(orchestrator) => orchestrator.with_shutdown(shutdown_rx),
        Err(e) => return cmd::fail(&e, json),
    };

    match command {
        Commands::Export { agent_id, out } => {
            cmd::migrate::cmd_export(&orchestrator, agent_id, out, json).await
        }
        Commands::Import {
            path,
            verify,
            target_agent_id,
            conflict,
        } => {
            cmd::migrate::cmd_import(
                &orchestrator,
                &path,
                verify,
                target_agent_id,
                conflict.map(Into::into),
                json,
            )
            .await
        }
        Commands::Verify {
            path,
            against,
            agent_id,
        } => {
            cmd::inspect::cmd_verify(
                &orchestrator,
                &path,
                against.into(),
                agent_id.as_deref(),
                json,
            )
            .await
        }
        Commands::Health => cmd::health::cmd_health(&orchestrator, json).await,
        Commands::Inspect { path } => cmd::inspect::cmd_inspect(&path, json),
    }
}
