//! Registry: the immutable, atomically-swappable snapshot of every
//! configured instance and group coordinator.
//!
//! Grounded on `gglib-runtime/src/process/manager.rs`'s `ProcessManager`
//! owning its state behind an `Arc<RwLock<...>>` that callers clone out of
//! rather than lock across an `.await`. Generalized here from "one running
//! model" to "every configured model", and from a single `RwLock` around
//! mutable fields to a `RwLock` around an entirely new, immutable `Arc<Registry>`
//! built fresh on every config (re)load -- this sidesteps the cyclic
//! reference a `GroupCoordinator` and its member `ModelInstance`s would
//! otherwise need: the coordinator never holds `Arc<ModelInstance>`s
//! itself, it is simply handed `&Registry` by the caller on every `admit`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use swapmux_core::{Config, GroupConfig, ModelConfig};

use crate::events::EventBus;
use crate::group::GroupCoordinator;
use crate::instance::ModelInstance;
use crate::ports::PortAllocator;
use crate::runner::ProcessRunner;

/// One fully-built snapshot: every managed model's [`ModelInstance`], every
/// group's [`GroupCoordinator`], and the [`Config`] they were built from.
/// Built once per load/reload and never mutated in place.
pub struct Registry {
    pub config: Config,
    pub instances: HashMap<String, Arc<ModelInstance>>,
    pub groups: HashMap<String, Arc<GroupCoordinator>>,
}

impl Registry {
    /// Builds a fresh registry from a validated [`Config`]. Models with no
    /// `cmd` (pure `proxyUrl` passthrough entries) still get a
    /// [`ModelInstance`], just one whose Process Runner is never actually
    /// spawned (see `ModelConfig::is_managed`); `EnsureRunning` for those
    /// resolves immediately.
    #[must_use]
    pub fn build(
        config: Config,
        ports: Arc<PortAllocator>,
        events: Arc<EventBus>,
        health_check_timeout_secs: u64,
        stop_grace: Duration,
    ) -> Arc<Self> {
        let persistent_groups: HashMap<&str, bool> = config
            .groups
            .iter()
            .map(|(name, group): (&String, &GroupConfig)| (name.as_str(), group.persistent))
            .collect();

        let instances = config
            .models
            .iter()
            .map(|(id, model): (&String, &ModelConfig)| {
                let persistent = persistent_groups.get(model.group.as_str()).copied().unwrap_or(false);
                let runner = ProcessRunner::new(
                    model.clone(),
                    config.macros.clone(),
                    events.clone() as Arc<dyn swapmux_core::EventPublisher>,
                    health_check_timeout_secs,
                    stop_grace,
                );
                let instance = Arc::new(ModelInstance::new(
                    model.clone(),
                    persistent,
                    Arc::clone(&ports),
                    runner,
                    events.clone() as Arc<dyn swapmux_core::EventPublisher>,
                ));
                (id.clone(), instance)
            })
            .collect();

        let groups = config
            .groups
            .iter()
            .map(|(name, group)| (name.clone(), Arc::new(GroupCoordinator::new(group.clone()))))
            .collect();

        Arc::new(Self {
            config,
            instances,
            groups,
        })
    }

    #[must_use]
    pub fn instance(&self, id: &str) -> Option<&Arc<ModelInstance>> {
        self.instances.get(id)
    }

    #[must_use]
    pub fn group_for(&self, model_id: &str) -> Option<&Arc<GroupCoordinator>> {
        let model = self.config.models.get(model_id)?;
        self.groups.get(&model.group)
    }

    /// Every `exclusive` group other than `name`.
    pub fn other_exclusive_groups(&self, name: &str) -> impl Iterator<Item = &Arc<GroupCoordinator>> {
        self.groups
            .iter()
            .filter(move |(group_name, group)| group_name.as_str() != name && group.config().exclusive)
            .map(|(_, group)| group)
    }
}

/// An atomically-swappable current [`Registry`]. Config reload builds a new
/// `Registry` and swaps it in under a brief write-lock; in-flight
/// `Resolve`/`Acquire` calls holding a clone of the old `Arc<Registry>` run
/// to completion against it undisturbed.
pub struct SharedRegistry {
    current: StdRwLock<Arc<Registry>>,
}

impl SharedRegistry {
    #[must_use]
    pub fn new(initial: Arc<Registry>) -> Self {
        Self {
            current: StdRwLock::new(initial),
        }
    }

    #[must_use]
    pub fn current(&self) -> Arc<Registry> {
        Arc::clone(&self.current.read().expect("registry lock poisoned"))
    }

    pub fn swap(&self, next: Arc<Registry>) -> Arc<Registry> {
        std::mem::replace(&mut self.current.write().expect("registry lock poisoned"), next)
    }
}
