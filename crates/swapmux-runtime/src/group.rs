//! Group Coordinator: the serialization point for one configured group's
//! swap and cross-exclusive-group eviction policy.
//!
//! Grounded on `gglib-runtime/src/process/manager.rs`'s `ProcessManager`
//! (a struct owning more than one lock with a strict, documented ordering
//! between them) -- there is no direct teacher counterpart for named
//! groups or exclusivity, since the teacher only ever runs a single model
//! at a time. This is new code built in that shape: a dedicated lock,
//! separate from any instance's own lock, always taken before one.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use swapmux_core::{GroupConfig, ModelInstanceState, SwapmuxError};

use crate::instance::ModelInstance;
use crate::registry::Registry;

/// One configured group's admission policy, serialized by its own lock.
/// Never holds another group's lock at the same time; eviction of peers in
/// *other* exclusive groups goes through their instances directly rather
/// than through those groups' coordinators, so there is never more than
/// one group lock held at once.
pub struct GroupCoordinator {
    config: GroupConfig,
    admit_lock: Mutex<()>,
}

impl GroupCoordinator {
    #[must_use]
    pub const fn new(config: GroupConfig) -> Self {
        Self {
            config,
            admit_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Clears the way for `target` to start: stops swap-sibling peers with
    /// no in-flight requests (section 3.4 step 1), then, if this group is
    /// `exclusive`, stops non-stopped members of every *other* exclusive
    /// group (step 2) -- failing with `BlockedByPersistent` instead of
    /// evicting a persistent peer. Concurrent admissions into this same
    /// group are serialized by `admit_lock` (step 3).
    pub async fn admit(
        &self,
        registry: &Registry,
        target: &Arc<ModelInstance>,
        ctx: &CancellationToken,
    ) -> Result<(), SwapmuxError> {
        let _guard = tokio::select! {
            biased;
            () = ctx.cancelled() => return Err(SwapmuxError::Canceled),
            guard = self.admit_lock.lock() => guard,
        };

        if self.config.swap {
            self.stop_siblings(registry, target, ctx).await?;
        }

        if self.config.exclusive {
            self.stop_other_exclusive_groups(registry, target, ctx).await?;
        }

        Ok(())
    }

    async fn stop_siblings(
        &self,
        registry: &Registry,
        target: &Arc<ModelInstance>,
        ctx: &CancellationToken,
    ) -> Result<(), SwapmuxError> {
        let siblings = self.active_members(registry, target.id());
        stop_all(siblings, ctx).await
    }

    async fn stop_other_exclusive_groups(
        &self,
        registry: &Registry,
        target: &Arc<ModelInstance>,
        ctx: &CancellationToken,
    ) -> Result<(), SwapmuxError> {
        for other in registry.other_exclusive_groups(&self.config.name) {
            for member_id in &other.config.members {
                let Some(member) = registry.instance(member_id) else {
                    continue;
                };
                if member.is_persistent() {
                    let state = member.state().await;
                    let is_active = !matches!(state, ModelInstanceState::Stopped | ModelInstanceState::Shutdown);
                    if is_active {
                        return Err(SwapmuxError::BlockedByPersistent {
                            instance: member_id.clone(),
                            blocked_by: target.id().clone(),
                        });
                    }
                }
            }
            let members: Vec<Arc<ModelInstance>> = other
                .config
                .members
                .iter()
                .filter_map(|id| registry.instance(id))
                .filter(|instance| instance.id() != target.id())
                .cloned()
                .collect();
            stop_all(members, ctx).await?;
        }
        Ok(())
    }

    /// Every member (other than `exclude_id`) currently `starting` or
    /// `ready`, cloned out before the stop calls so the loop below never
    /// holds any instance's own lock while awaiting another's.
    fn active_members(&self, registry: &Registry, exclude_id: &str) -> Vec<Arc<ModelInstance>> {
        self.config
            .members
            .iter()
            .filter(|id| id.as_str() != exclude_id)
            .filter_map(|id| registry.instance(id))
            .cloned()
            .collect()
    }
}

/// Stops every given instance concurrently, waiting on all of them
/// together (section 3.4: "peers are stopped concurrently and waited on
/// together"), rather than sequentially draining one at a time.
async fn stop_all(instances: Vec<Arc<ModelInstance>>, ctx: &CancellationToken) -> Result<(), SwapmuxError> {
    let mut pending = Vec::with_capacity(instances.len());
    for instance in instances {
        let ctx = ctx.clone();
        pending.push(async move { instance.stop(&ctx).await });
    }
    for result in futures_util::future::join_all(pending).await {
        result?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use swapmux_core::GroupConfig;

    fn swap_group(members: Vec<&str>) -> GroupConfig {
        GroupConfig {
            name: "g".to_string(),
            members: members.into_iter().map(str::to_string).collect(),
            swap: true,
            exclusive: true,
            persistent: false,
        }
    }

    #[tokio::test]
    async fn admit_with_no_members_succeeds_trivially() {
        let coordinator = GroupCoordinator::new(swap_group(vec![]));
        assert!(coordinator.config().swap);
    }
}
