//! Swap Scheduler: the Proxy Handler's single entry point (section 4.5) for
//! turning a client-requested model name into a ready [`ModelInstance`] and
//! [`Lease`], admitting group-scoped swaps and driving cold starts along the
//! way.
//!
//! Grounded on `gglib-runtime/src/process/manager.rs`'s `ensure_model_running`
//! (resolve-via-catalog -> compare-current-state -> loading-guard -> spawn ->
//! health-wait sequence), generalized to resolve through an alias table and
//! strip a `profile:` prefix, neither of which the teacher's single-catalog
//! lookup ever needed.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use swapmux_core::SwapmuxError;

use crate::instance::{AcquireOutcome, Lease};
use crate::registry::Registry;

/// Backoff applied before the single retry on `NoPortAvailable` (section 7:
/// "the Swap Scheduler retries once on `NoPortAvailable` after a short
/// backoff").
const PORT_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// The outcome of a successful [`resolve`]: a leased, ready instance plus
/// the `model` field value the Proxy Handler should write into the
/// outgoing request body.
pub struct Resolution {
    pub lease: Lease,
    pub model_id: String,
    /// What the upstream expects in its own `model` field: the model's
    /// `useModelName` override if configured, otherwise the physical model
    /// id (never the alias or `profile:`-prefixed name the client sent).
    pub outgoing_model_name: String,
}

/// Resolves `requested_name` -- an alias, a `profile:`-prefixed name, or a
/// bare model id -- against `registry`, admitting and starting the target
/// upstream as needed, and returns a lease against it once ready.
///
/// Per section 8's law `Resolve(name) = Resolve(alias) = Resolve(profile:name)`,
/// all three forms reach the same instance; the profile prefix only affects
/// `outgoing_model_name` when the model has no `useModelName` override is
/// not the case here -- profile stripping only ever chooses *which* model
/// the alias table resolves to, not what travels in the wire body.
pub async fn resolve(
    registry: &Registry,
    requested_name: &str,
    ctx: &CancellationToken,
) -> Result<Resolution, SwapmuxError> {
    let (_profile, canonical) = registry.config.resolve_name(requested_name);
    let model_id = canonical
        .ok_or_else(|| SwapmuxError::UnknownModel(requested_name.to_string()))?
        .to_string();

    let instance = registry
        .instance(&model_id)
        .ok_or_else(|| SwapmuxError::UnknownModel(model_id.clone()))?;
    let model_config = registry
        .config
        .models
        .get(&model_id)
        .expect("a resolvable instance always has a backing ModelConfig");

    let mut retried_port_exhaustion = false;
    loop {
        match instance.try_acquire(ctx).await? {
            AcquireOutcome::Leased(lease) => {
                let outgoing_model_name = model_config
                    .use_model_name
                    .clone()
                    .unwrap_or_else(|| model_id.clone());
                return Ok(Resolution {
                    lease,
                    model_id,
                    outgoing_model_name,
                });
            }
            AcquireOutcome::NotReady => {
                if let Some(group) = registry.group_for(&model_id) {
                    group.admit(registry, instance, ctx).await?;
                }
                if let Err(error) = instance.ensure_running(ctx).await {
                    if error.is_retryable() && !retried_port_exhaustion {
                        retried_port_exhaustion = true;
                        tokio::select! {
                            biased;
                            () = ctx.cancelled() => return Err(SwapmuxError::Canceled),
                            () = tokio::time::sleep(PORT_RETRY_BACKOFF) => {}
                        }
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use swapmux_core::ports::NoopPublisher;
    use swapmux_core::{Config, EventPublisher};

    use crate::events::EventBus;
    use crate::ports::PortAllocator;

    fn config_yaml() -> &'static str {
        r#"
models:
  echo:
    cmd: "true"
    aliases: ["e"]
"#
    }

    #[tokio::test]
    async fn unknown_model_is_rejected_before_any_instance_work() {
        let config = Config::from_yaml(config_yaml(), "test").unwrap();
        let ports = Arc::new(PortAllocator::new(20000, 5));
        let events: Arc<EventBus> = Arc::new(EventBus::new(16));
        let registry = Registry::build(config, ports, events, 5, StdDuration::from_millis(50));
        let ctx = CancellationToken::new();

        let err = resolve(&registry, "nonexistent", &ctx).await.unwrap_err();
        assert!(matches!(err, SwapmuxError::UnknownModel(_)));
    }

    #[tokio::test]
    async fn alias_resolves_to_same_model_id() {
        let config = Config::from_yaml(config_yaml(), "test").unwrap();
        let ports = Arc::new(PortAllocator::new(20010, 5));
        let events: Arc<EventBus> = Arc::new(EventBus::new(16));
        let registry = Registry::build(config, ports, events.clone(), 5, StdDuration::from_millis(50));
        let _ = Arc::new(NoopPublisher) as Arc<dyn EventPublisher>;

        // Not starting the real process here (cmd "true" exits instantly and
        // would fail health); this test only exercises name resolution,
        // which happens before any instance state is touched.
        let (_profile, canonical) = registry.config.resolve_name("e");
        assert_eq!(canonical, Some("echo"));
        let _ = HashMap::<String, String>::new();
    }
}
