//! CLI bootstrap — the composition root.
//!
//! This module is the ONLY place where infrastructure is wired together:
//! config loading, the Port Allocator, Event Bus, Metrics Store, the
//! instance/group registry, and the `reqwest::Client` shared by every
//! proxy handler. Everything downstream receives already-constructed
//! `Arc`s rather than building its own.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use swapmux_core::{Config, ConfigError};
use swapmux_runtime::{EventBus, MetricsStore, PortAllocator, Registry, SharedRegistry};

use crate::error::CliError;

/// Everything the server loop needs, already wired. Cheap to pass around
/// by reference; the few fields that need sharing across tasks are `Arc`s.
pub struct AppContext {
    pub registry: Arc<SharedRegistry>,
    pub events: Arc<EventBus>,
    pub metrics: Arc<MetricsStore>,
    pub client: reqwest::Client,
    pub listen_addr: SocketAddr,
    pub ports: Arc<PortAllocator>,
}

/// Loads and validates the config at `config_path`, then builds a fresh
/// [`Registry`] from it. Shared by initial bootstrap and `SIGHUP` reload —
/// both need "parse this file into a ready-to-swap-in snapshot".
pub fn load_registry(
    config_path: &std::path::Path,
    ports: &Arc<PortAllocator>,
    events: &Arc<EventBus>,
) -> Result<Arc<Registry>, ConfigError> {
    let config = Config::load(config_path)?;
    let health_check_timeout_secs = config.health_check_timeout_secs;
    let stop_grace = Duration::from_millis(swapmux_core::config::DEFAULT_WAIT_DELAY_MS);
    Ok(Registry::build(
        config,
        Arc::clone(ports),
        Arc::clone(events),
        health_check_timeout_secs,
        stop_grace,
    ))
}

/// Bootstraps the application: loads config, constructs the Port
/// Allocator/Event Bus/Metrics Store, builds the initial [`Registry`], and
/// binds the HTTP listener (bind-then-report, section 10.4).
pub async fn bootstrap(
    config_path: &std::path::Path,
    listen_override: Option<&str>,
) -> Result<(AppContext, tokio::net::TcpListener), CliError> {
    let config = Config::load(config_path).map_err(CliError::Config)?;

    let listen_addr: SocketAddr = match listen_override {
        Some(addr) => addr.parse().map_err(|error| {
            CliError::Other(anyhow::anyhow!("invalid --listen address {addr:?}: {error}"))
        })?,
        None => ([127, 0, 0, 1], 8080).into(),
    };

    let ports = Arc::new(PortAllocator::new(config.start_port, 1000));
    let events = Arc::new(EventBus::new(swapmux_runtime::DEFAULT_QUEUE_WATERMARK));
    let metrics = Arc::new(MetricsStore::new(
        config.metrics_max_in_memory,
        events.clone() as Arc<dyn swapmux_core::EventPublisher>,
    ));

    let health_check_timeout_secs = config.health_check_timeout_secs;
    let stop_grace = Duration::from_millis(swapmux_core::config::DEFAULT_WAIT_DELAY_MS);
    let registry = Registry::build(config, Arc::clone(&ports), Arc::clone(&events), health_check_timeout_secs, stop_grace);
    let registry = Arc::new(SharedRegistry::new(registry));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .map_err(|source| CliError::Bind {
            addr: listen_addr.to_string(),
            source,
        })?;
    info!(addr = %listen_addr, "bound listener");

    Ok((
        AppContext {
            registry,
            events,
            metrics,
            client: reqwest::Client::new(),
            listen_addr,
            ports,
        },
        listener,
    ))
}

/// Eagerly starts every model named in `hooks.on_startup.preload` (section
/// 11), logging and continuing past any individual failure rather than
/// aborting startup over one bad model.
pub async fn run_preload(ctx: &AppContext) {
    let registry = ctx.registry.current();
    let preload = registry.config.preload.clone();
    for model_id in preload {
        let Some(instance) = registry.instance(&model_id) else {
            tracing::warn!(model = %model_id, "preload names unknown model, skipping");
            continue;
        };
        let cancel = tokio_util::sync::CancellationToken::new();
        if let Some(group) = registry.group_for(&model_id) {
            if let Err(error) = group.admit(&registry, instance, &cancel).await {
                tracing::warn!(model = %model_id, %error, "preload admission failed");
                continue;
            }
        }
        if let Err(error) = instance.ensure_running(&cancel).await {
            tracing::warn!(model = %model_id, %error, "preload start failed");
        } else {
            tracing::info!(model = %model_id, "preloaded");
        }
    }
}

/// Graceful-shutdown teardown (section 10.4): stops every instance
/// currently known to the registry, concurrently, the same way
/// [`swapmux_runtime::group::stop_all`] drains a group's siblings. Each
/// instance gets `ctx` cancelled as soon as `grace` elapses so a stuck
/// health wait or process-stop escalation doesn't hang the whole exit;
/// instances that are already stopped/shutdown resolve immediately.
pub async fn shutdown_all_instances(ctx: &AppContext, grace: Duration) {
    let registry = ctx.registry.current();
    let instances: Vec<_> = registry.instances.values().cloned().collect();
    if instances.is_empty() {
        return;
    }

    let cancel = tokio_util::sync::CancellationToken::new();
    let timeout_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        timeout_cancel.cancel();
    });

    let mut pending = Vec::with_capacity(instances.len());
    for instance in instances {
        let cancel = cancel.clone();
        pending.push(async move {
            if let Err(error) = instance.stop(&cancel).await {
                tracing::warn!(%error, "error stopping instance during shutdown");
            }
            instance.shutdown().await;
        });
    }
    futures_util::future::join_all(pending).await;
}

/// Re-reads the config file at `config_path` and swaps in a fresh
/// [`Registry`] on success (section 10.3: a `SIGHUP` reload that fails to
/// parse or validate logs an error and keeps serving the previous
/// snapshot rather than tearing down the process).
pub async fn reload(ctx: &AppContext, config_path: &std::path::Path) {
    match load_registry(config_path, &ctx.ports, &ctx.events) {
        Ok(next) => {
            let previous = ctx.registry.swap(next);
            info!("config reloaded");
            drop(previous);
        }
        Err(error) => {
            tracing::error!(%error, "config reload failed, keeping previous snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_binds_an_ephemeral_port_when_listen_override_given() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, "models:\n  echo:\n    proxy: \"http://127.0.0.1:1\"\n").unwrap();

        let (ctx, listener) = bootstrap(&config_path, Some("127.0.0.1:0")).await.unwrap();
        assert_eq!(listener.local_addr().unwrap().ip().to_string(), "127.0.0.1");
        assert_eq!(ctx.registry.current().config.models.len(), 1);
    }

    #[tokio::test]
    async fn bootstrap_rejects_bad_listen_address() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, "models: {}\n").unwrap();

        let err = bootstrap(&config_path, Some("not-an-address")).await.unwrap_err();
        assert!(matches!(err, CliError::Other(_)));
    }
}
