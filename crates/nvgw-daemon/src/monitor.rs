//! Monitor client.
//!
//! Registers the gateway with the clustered ANA controller at startup,
//! heartbeats while running, feeds controller notifications to the HA
//! state machine, and deregisters on clean shutdown. A gateway that
//! misses the deregistration deadline is fenced: the controller
//! blocklists its node address so stale I/O cannot land.
//!
//! The controller transport is a trait; production talks to the cluster
//! monitor through the store client library, tests and single-node
//! development use [`InProcessController`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use nvgw_core::error::{GwError, GwResult};
use nvgw_core::model::{AnaGroupId, GatewayIdentity};
use nvgw_core::statemap::{self, StateKey};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::ana::{self, AnaNotification};
use crate::state::SharedContext;

/// Heartbeat period.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Deregistration deadline; past it the controller fences the node.
pub const DEREGISTER_TIMEOUT: Duration = Duration::from_secs(30);

/// Controller transport seam.
#[async_trait::async_trait]
pub trait MonitorTransport: Send + Sync {
    /// Registers the gateway (the `nvme-gw create` equivalent).
    async fn register(&self, identity: &GatewayIdentity) -> GwResult<()>;

    /// Periodic liveness report carrying the health flag.
    async fn heartbeat(&self, degraded: bool) -> GwResult<()>;

    /// Next ANA notification; `None` when the controller is gone.
    async fn next_notification(&self) -> Option<AnaNotification>;

    /// Deregisters on clean shutdown.
    async fn deregister(&self) -> GwResult<()>;
}

/// The monitor worker.
pub struct MonitorClient {
    ctx: SharedContext,
    transport: Arc<dyn MonitorTransport>,
}

impl std::fmt::Debug for MonitorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorClient").finish_non_exhaustive()
    }
}

impl MonitorClient {
    /// Builds the worker.
    #[must_use]
    pub fn new(ctx: SharedContext, transport: Arc<dyn MonitorTransport>) -> Self {
        Self { ctx, transport }
    }

    /// Registers with the controller and records the gateway in the
    /// state map.
    ///
    /// # Errors
    ///
    /// Controller or state-map failures.
    pub async fn register(&self) -> GwResult<()> {
        self.transport.register(&self.ctx.identity).await?;

        let key = StateKey::Gateway {
            name: self.ctx.identity.name.clone(),
        };
        let payload = serde_json::to_vec(&self.ctx.identity)
            .map_err(|e| GwError::internal(format!("identity encode failed: {e}")))?;
        let expected = self
            .ctx
            .map
            .snapshot()
            .await
            .ok()
            .and_then(|snap| snap.get(&key).map(|r| r.version));
        statemap::cas(
            self.ctx.map.as_ref(),
            self.ctx.gateway_name(),
            key,
            expected,
            payload,
        )
        .await
        .map_err(crate::service::store_err)?;
        info!(gateway = %self.ctx.identity.name, "registered with the ana controller");
        Ok(())
    }

    /// Heartbeat + notification loop; returns on shutdown.
    pub async fn run(self) {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if self.ctx.is_shutdown_requested() {
                break;
            }
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = self.transport.heartbeat(self.ctx.health.is_degraded()).await {
                        warn!(error = %e, "heartbeat failed");
                    }
                }
                notification = self.transport.next_notification() => {
                    match notification {
                        Some(notification) => {
                            info!(
                                optimized = ?notification.optimized,
                                "ana assignment received"
                            );
                            ana::apply_notification(&self.ctx, notification).await;
                        }
                        None => {
                            warn!("controller notification channel closed");
                            break;
                        }
                    }
                }
            }
        }
        self.shutdown().await;
    }

    /// Clean shutdown: deregister within the fencing deadline and drop
    /// the gateway record.
    async fn shutdown(&self) {
        match tokio::time::timeout(DEREGISTER_TIMEOUT, self.transport.deregister()).await {
            Ok(Ok(())) => info!("deregistered from the ana controller"),
            Ok(Err(e)) => warn!(error = %e, "deregistration failed; expect fencing"),
            Err(_) => warn!("deregistration timed out; expect fencing"),
        }
        let key = StateKey::Gateway {
            name: self.ctx.identity.name.clone(),
        };
        if let Ok(snapshot) = self.ctx.map.snapshot().await {
            if let Some(record) = snapshot.get(&key) {
                if let Err(e) = statemap::delete(
                    self.ctx.map.as_ref(),
                    self.ctx.gateway_name(),
                    key,
                    record.version,
                )
                .await
                {
                    warn!(error = %e, "gateway record removal failed");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-process controller
// ---------------------------------------------------------------------------

struct Registered {
    identity: GatewayIdentity,
    tx: mpsc::UnboundedSender<AnaNotification>,
}

#[derive(Default)]
struct ControllerState {
    groups: BTreeSet<AnaGroupId>,
    gateways: BTreeMap<String, Registered>,
    /// Node addresses fenced after an ungraceful exit.
    blocklist: Vec<String>,
}

/// In-process ANA controller: assigns groups round-robin over the
/// registered gateways and rebalances on membership change. Ungraceful
/// removal fences the node address.
pub struct InProcessController {
    state: Mutex<ControllerState>,
}

impl std::fmt::Debug for InProcessController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessController").finish_non_exhaustive()
    }
}

impl InProcessController {
    /// Controller managing `group_count` ANA groups (ids 1..=count).
    #[must_use]
    pub fn new(group_count: u32) -> Arc<Self> {
        let groups = (1..=group_count).map(AnaGroupId).collect();
        Arc::new(Self {
            state: Mutex::new(ControllerState {
                groups,
                gateways: BTreeMap::new(),
                blocklist: Vec::new(),
            }),
        })
    }

    /// Transport handle for one gateway.
    #[must_use]
    pub fn connect(self: &Arc<Self>, gateway: &str) -> Arc<ControllerTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(ControllerTransport {
            controller: Arc::clone(self),
            gateway: gateway.to_string(),
            tx,
            rx: Mutex::new(rx),
        })
    }

    /// Simulates an ungraceful gateway death: membership is dropped, the
    /// node address is blocklisted, and the survivors are rebalanced.
    pub async fn fail_gateway(&self, gateway: &str) {
        let mut state = self.state.lock().await;
        if let Some(registered) = state.gateways.remove(gateway) {
            state
                .blocklist
                .push(registered.identity.node_addr.clone());
        }
        Self::rebalance(&mut state);
    }

    /// Current blocklist entries.
    pub async fn blocklist(&self) -> Vec<String> {
        self.state.lock().await.blocklist.clone()
    }

    /// Current optimized-group assignment per gateway.
    pub async fn assignments(&self) -> BTreeMap<String, BTreeSet<AnaGroupId>> {
        let state = self.state.lock().await;
        let mut out: BTreeMap<String, BTreeSet<AnaGroupId>> = BTreeMap::new();
        for (index, name) in state.gateways.keys().enumerate() {
            let mut set = BTreeSet::new();
            for (offset, group) in state.groups.iter().enumerate() {
                if offset % state.gateways.len() == index {
                    set.insert(*group);
                }
            }
            out.insert(name.clone(), set);
        }
        out
    }

    fn rebalance(state: &mut ControllerState) {
        let names: Vec<String> = state.gateways.keys().cloned().collect();
        if names.is_empty() {
            return;
        }
        let groups: Vec<AnaGroupId> = state.groups.iter().copied().collect();
        for (index, name) in names.iter().enumerate() {
            let optimized: BTreeSet<AnaGroupId> = groups
                .iter()
                .enumerate()
                .filter(|(offset, _)| offset % names.len() == index)
                .map(|(_, group)| *group)
                .collect();
            let notification = AnaNotification {
                optimized,
                all_groups: state.groups.clone(),
            };
            if let Some(registered) = state.gateways.get(name) {
                // A full channel or a gone receiver is the receiver's
                // problem; the next rebalance repeats the state.
                let _ = registered.tx.send(notification);
            }
        }
    }
}

/// Per-gateway transport handle onto [`InProcessController`].
pub struct ControllerTransport {
    controller: Arc<InProcessController>,
    gateway: String,
    tx: mpsc::UnboundedSender<AnaNotification>,
    rx: Mutex<mpsc::UnboundedReceiver<AnaNotification>>,
}

impl std::fmt::Debug for ControllerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerTransport")
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl MonitorTransport for ControllerTransport {
    async fn register(&self, identity: &GatewayIdentity) -> GwResult<()> {
        let mut state = self.controller.state.lock().await;
        state.gateways.insert(
            self.gateway.clone(),
            Registered {
                identity: identity.clone(),
                tx: self.tx.clone(),
            },
        );
        InProcessController::rebalance(&mut state);
        Ok(())
    }

    async fn heartbeat(&self, _degraded: bool) -> GwResult<()> {
        let state = self.controller.state.lock().await;
        if state.gateways.contains_key(&self.gateway) {
            Ok(())
        } else {
            Err(GwError::unavailable("gateway is not registered"))
        }
    }

    async fn next_notification(&self) -> Option<AnaNotification> {
        self.rx.lock().await.recv().await
    }

    async fn deregister(&self) -> GwResult<()> {
        let mut state = self.controller.state.lock().await;
        state.gateways.remove(&self.gateway);
        InProcessController::rebalance(&mut state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str, addr: &str) -> GatewayIdentity {
        GatewayIdentity {
            name: name.to_string(),
            group: "alpha".to_string(),
            node_addr: addr.to_string(),
            grpc_port: 5500,
            io_port: 4420,
            discovery_port: 8009,
        }
    }

    #[tokio::test]
    async fn two_gateways_split_two_groups() {
        let controller = InProcessController::new(2);
        let t1 = controller.connect("gw-1");
        let t2 = controller.connect("gw-2");
        t1.register(&identity("gw-1", "10.0.0.1")).await.unwrap();
        t2.register(&identity("gw-2", "10.0.0.2")).await.unwrap();

        let assignments = controller.assignments().await;
        let all: BTreeSet<AnaGroupId> = assignments.values().flatten().copied().collect();
        assert_eq!(all.len(), 2);
        for groups in assignments.values() {
            assert_eq!(groups.len(), 1);
        }
    }

    #[tokio::test]
    async fn failover_hands_groups_to_survivor() {
        let controller = InProcessController::new(2);
        let t1 = controller.connect("gw-1");
        let t2 = controller.connect("gw-2");
        t1.register(&identity("gw-1", "10.0.0.1")).await.unwrap();
        t2.register(&identity("gw-2", "10.0.0.2")).await.unwrap();

        controller.fail_gateway("gw-1").await;

        let assignments = controller.assignments().await;
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments["gw-2"].len(), 2);
        assert_eq!(controller.blocklist().await, vec!["10.0.0.1".to_string()]);

        // The survivor received the rebalance notification.
        let note = t2.next_notification().await.unwrap();
        // Drain to the latest.
        let mut latest = note;
        while let Ok(next) = t2.rx.lock().await.try_recv() {
            latest = next;
        }
        assert_eq!(latest.optimized.len(), 2);
    }

    #[tokio::test]
    async fn graceful_deregistration_skips_blocklist() {
        let controller = InProcessController::new(2);
        let t1 = controller.connect("gw-1");
        t1.register(&identity("gw-1", "10.0.0.1")).await.unwrap();
        t1.deregister().await.unwrap();
        assert!(controller.blocklist().await.is_empty());
    }
}
