//! ANA / HA state machine.
//!
//! Per (gateway, group) there are two states, OPTIMIZED and INACCESSIBLE.
//! The clustered controller assigns each live gateway a set of groups to
//! serve as optimized; every other group present in the cluster is
//! published inaccessible. Removals are applied before additions so hosts
//! are disconnected from a path before any other gateway advertises it,
//! and all engine writes happen in notification order under the engine
//! lock.
//!
//! Assignments are per-gateway-global: a subsystem inherits the
//! gateway's group set rather than carrying its own.

use std::collections::BTreeSet;

use nvgw_core::model::{AnaGroupId, AnaState};
use nvgw_core::statemap::{self, StateKey};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::state::SharedContext;

/// Assignment notification from the controller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnaNotification {
    /// Groups this gateway serves as optimized.
    pub optimized: BTreeSet<AnaGroupId>,
    /// Every group present in the cluster.
    pub all_groups: BTreeSet<AnaGroupId>,
}

/// `ana/<group>` record payload: the gateway currently optimized for the
/// group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupOwner {
    /// Group id.
    pub group: AnaGroupId,
    /// Owning gateway.
    pub gateway: String,
}

/// Applies one notification to the engine and the shared state.
///
/// Engine failures are logged and degrade health; the in-memory state is
/// only advanced for transitions that reached the engine, so the next
/// notification (or reconvergence) retries the rest.
pub async fn apply_notification(ctx: &SharedContext, notification: AnaNotification) {
    let current = ctx.ana_states.read().await.clone();

    let mut transitions: Vec<(AnaGroupId, AnaState)> = Vec::new();
    // Removals first: groups we hold that the controller took away.
    for (group, state) in &current {
        if *state == AnaState::Optimized && !notification.optimized.contains(group) {
            transitions.push((*group, AnaState::Inaccessible));
        }
    }
    // New inaccessible groups (first sighting of a group we don't own).
    for group in &notification.all_groups {
        if !notification.optimized.contains(group) && !current.contains_key(group) {
            transitions.push((*group, AnaState::Inaccessible));
        }
    }
    // Then additions.
    for group in &notification.optimized {
        if current.get(group) != Some(&AnaState::Optimized) {
            transitions.push((*group, AnaState::Optimized));
        }
    }
    if transitions.is_empty() {
        return;
    }

    // Subsystems currently declared. The authoritative snapshot wins;
    // the cache covers a briefly unreachable store.
    let subsystems: Vec<String> = match ctx.map.snapshot().await {
        Ok(snapshot) => snapshot
            .records
            .keys()
            .filter_map(|key| match key {
                StateKey::Subsystem { nqn } => Some(nqn.clone()),
                _ => None,
            })
            .collect(),
        Err(e) => {
            warn!(error = %e, "snapshot for ana publish failed; using cache");
            let cache = ctx.cache.read().await;
            cache
                .records
                .keys()
                .filter_map(|key| match key {
                    StateKey::Subsystem { nqn } => Some(nqn.clone()),
                    _ => None,
                })
                .collect()
        }
    };

    for (group, target) in transitions {
        let mut tgt = ctx.tgt.lock().await;
        let mut applied = true;
        for nqn in &subsystems {
            if let Err(e) = tgt.set_ana_state(nqn, group.0, target).await {
                warn!(group = group.0, nqn = %nqn, error = %e, "ana publish failed");
                ctx.health.mark_degraded();
                applied = false;
                break;
            }
        }
        drop(tgt);
        if !applied {
            continue;
        }

        ctx.ana_states.write().await.insert(group, target);
        info!(group = group.0, state = target.as_str(), "ana state published");

        // Record ownership so peers and the discovery responder can see
        // which gateway fronts the group. Last writer wins by design:
        // the controller serializes reassignment.
        if target == AnaState::Optimized {
            let owner = GroupOwner {
                group,
                gateway: ctx.gateway_name().to_string(),
            };
            let key = StateKey::AnaGroup { group };
            let payload = match serde_json::to_vec(&owner) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(group = group.0, error = %e, "group owner encode failed");
                    continue;
                }
            };
            let expected = ctx
                .map
                .snapshot()
                .await
                .ok()
                .and_then(|snap| snap.get(&key).map(|r| r.version));
            if let Err(e) = statemap::cas(
                ctx.map.as_ref(),
                ctx.gateway_name(),
                key,
                expected,
                payload,
            )
            .await
            {
                warn!(group = group.0, error = %e, "group owner record write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_shape() {
        let mut n = AnaNotification::default();
        n.optimized.insert(AnaGroupId(1));
        n.all_groups.insert(AnaGroupId(1));
        n.all_groups.insert(AnaGroupId(2));
        assert!(n.optimized.contains(&AnaGroupId(1)));
        assert!(!n.optimized.contains(&AnaGroupId(2)));
    }
}
