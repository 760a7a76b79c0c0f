//! `swapmux` binary entry point.
//!
//! Parses arguments, installs tracing, bootstraps the application
//! (config load, registry, listener bind), preloads configured models,
//! then serves until `SIGINT`/`SIGTERM` (graceful shutdown) while
//! `SIGHUP` triggers a config reload in place (section 10.4).

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use swapmux_cli::{bootstrap, reload, run_preload, shutdown_all_instances, Cli, CliError};
use swapmux_proxy::ProxyState;

/// Bounded grace period for draining in-flight leases and stopping
/// spawned model processes during graceful shutdown (section 10.4).
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(10);

fn install_tracing(log_level_override: Option<&str>) {
    let filter = log_level_override
        .map(ToOwned::to_owned)
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();
}

#[cfg(unix)]
async fn wait_for_terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    term.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_terminate() {
    std::future::pending::<()>().await;
}

#[cfg(unix)]
async fn wait_for_hangup() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut hup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
    hup.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_hangup() {
    std::future::pending::<()>().await;
}

async fn run(cli: &Cli) -> Result<(), CliError> {
    let (ctx, listener) = bootstrap(&cli.config, cli.listen.as_deref()).await?;
    run_preload(&ctx).await;

    let state = ProxyState {
        registry: ctx.registry.clone(),
        events: ctx.events.clone(),
        metrics: ctx.metrics.clone(),
        client: ctx.client.clone(),
    };

    let cancel = CancellationToken::new();
    let serve_cancel = cancel.clone();
    let serve_task = tokio::spawn(swapmux_proxy::serve(listener, state, serve_cancel));

    info!(addr = %ctx.listen_addr, "swapmux ready");

    loop {
        tokio::select! {
            biased;
            result = tokio::signal::ctrl_c() => {
                if let Err(error) = result {
                    error!(%error, "failed to wait for SIGINT");
                }
                info!("received SIGINT, shutting down");
                cancel.cancel();
                break;
            }
            () = wait_for_terminate() => {
                info!("received SIGTERM, shutting down");
                cancel.cancel();
                break;
            }
            () = wait_for_hangup() => {
                info!("received SIGHUP, reloading configuration");
                reload(&ctx, &cli.config).await;
            }
        }
    }

    info!("stopping managed model instances");
    shutdown_all_instances(&ctx, SHUTDOWN_GRACE).await;

    match serve_task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(CliError::Other(error)),
        Err(join_error) => Err(CliError::Other(anyhow::anyhow!(join_error))),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    install_tracing(cli.log_level.as_deref());

    let result = run(&cli).await;
    match result {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            error!(%error, "swapmux exited with an error");
            std::process::exit(error.exit_code());
        }
    }
}
