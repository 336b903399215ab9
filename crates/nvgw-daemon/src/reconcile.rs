//! Peer reconciler.
//!
//! A single consumer drains the state-map watch and converges the local
//! engine to the declared state. Self-authored changes were already
//! applied by the service and are acked; listener records are realized
//! only when this gateway owns them. Engine failures retry with
//! exponential backoff (base 250 ms, cap 30 s); a persistent mismatch
//! raises the health flag instead of surfacing to any caller.
//!
//! Startup runs the same convergence against a full snapshot before the
//! admin server opens, so a rebooted gateway always serves the cluster's
//! current truth.

use std::collections::BTreeSet;
use std::time::Duration;

use nvgw_core::error::GwResult;
use nvgw_core::model::{HostAccess, Listener, Namespace, Subsystem, ANY_HOST};
use nvgw_core::statemap::{Record, Snapshot, StateKey};
use tracing::{debug, info, warn};

use crate::state::SharedContext;
use crate::tgt::TgtApi;

/// Backoff base for engine apply retries.
const BACKOFF_BASE: Duration = Duration::from_millis(250);
/// Backoff cap.
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Attempts per key before the health flag is raised and the key is
/// parked until the next event or resync.
const APPLY_ATTEMPTS: u32 = 6;

fn backoff(attempt: u32) -> Duration {
    BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(BACKOFF_CAP)
}

/// The reconciliation worker.
pub struct Reconciler {
    ctx: SharedContext,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Builds the worker over the shared context.
    #[must_use]
    pub fn new(ctx: SharedContext) -> Self {
        Self { ctx }
    }

    /// Subscribes to the map's watch. Subscribe BEFORE the startup
    /// snapshot: anything older than the snapshot is covered by it, and
    /// anything newer queues on the subscription, so no change can fall
    /// between the two.
    ///
    /// # Errors
    ///
    /// State-map failures.
    pub async fn subscribe(&self) -> GwResult<nvgw_core::statemap::WatchStream> {
        self.ctx
            .map
            .watch()
            .await
            .map_err(crate::service::store_err)
    }

    /// Startup reconciliation: snapshot the map, diff against the
    /// engine, converge, then prime the snapshot cache.
    ///
    /// # Errors
    ///
    /// State-map failures; engine failures are retried internally and
    /// reported through the health flag.
    pub async fn reconcile_startup(&self) -> GwResult<()> {
        let snapshot = self
            .ctx
            .map
            .snapshot()
            .await
            .map_err(crate::service::store_err)?;
        info!(epoch = snapshot.epoch, records = snapshot.records.len(), "startup reconciliation");
        self.converge(&snapshot).await;
        self.ctx.update_cache(snapshot).await;
        Ok(())
    }

    /// Watch worker loop; returns on shutdown or when the store closes
    /// the watch. Prefer [`run_with`](Self::run_with) with a
    /// subscription taken before the startup snapshot.
    pub async fn run(self) {
        let watch = match self.subscribe().await {
            Ok(watch) => watch,
            Err(e) => {
                warn!(error = %e, "state-map watch unavailable");
                self.ctx.health.mark_degraded();
                return;
            }
        };
        self.run_with(watch).await;
    }

    /// Watch worker loop over an existing subscription.
    pub async fn run_with(self, mut watch: nvgw_core::statemap::WatchStream) {
        loop {
            if self.ctx.is_shutdown_requested() {
                info!("reconciler shutting down");
                return;
            }
            let Some(event) = watch.recv().await else {
                debug!("state-map watch closed");
                return;
            };

            let snapshot = match self.ctx.map.snapshot().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(error = %e, "snapshot after notification failed");
                    self.ctx.health.mark_degraded();
                    continue;
                }
            };

            if event.resync {
                info!("watch gap; full reconvergence");
                self.converge(&snapshot).await;
            } else if event.writer == self.ctx.gateway_name() {
                // Our own mutation; the service already applied it.
                debug!(epoch = event.epoch, "acking self-authored change");
            } else {
                for key in &event.keys {
                    self.apply_key(key, snapshot.get(key), &snapshot).await;
                }
            }
            self.ctx.update_cache(snapshot).await;
        }
    }

    /// Applies one changed key with backoff.
    async fn apply_key(&self, key: &StateKey, desired: Option<&Record>, snapshot: &Snapshot) {
        for attempt in 0..APPLY_ATTEMPTS {
            let mut tgt = self.ctx.tgt.lock().await;
            let result = self
                .apply_key_once(tgt.as_mut(), key, desired, snapshot)
                .await;
            drop(tgt);
            match result {
                Ok(()) => {
                    self.ctx.health.mark_converged();
                    return;
                }
                Err(e) => {
                    let delay = backoff(attempt);
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    warn!(key = %key, error = %e, attempt, delay_ms, "apply failed, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
        warn!(key = %key, "apply retries exhausted; gateway degraded");
        self.ctx.health.mark_degraded();
    }

    async fn apply_key_once(
        &self,
        tgt: &mut dyn TgtApi,
        key: &StateKey,
        desired: Option<&Record>,
        snapshot: &Snapshot,
    ) -> GwResult<()> {
        match key {
            StateKey::Subsystem { nqn } => match desired {
                Some(record) => {
                    let subsystem: Subsystem =
                        record.decode().map_err(crate::service::store_err)?;
                    apply_subsystem(tgt, &subsystem).await
                }
                None => match tgt.delete_subsystem(nqn).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.code == Some(-2) => Ok(()),
                    Err(e) => Err(e.into()),
                },
            },
            StateKey::Namespace { nqn, nsid } => match desired {
                Some(record) => {
                    let namespace: Namespace =
                        record.decode().map_err(crate::service::store_err)?;
                    apply_namespace(tgt, &namespace).await
                }
                None => remove_namespace(tgt, nqn, *nsid).await,
            },
            StateKey::Listener { gateway, .. } => {
                if gateway != self.ctx.gateway_name() {
                    return Ok(());
                }
                match desired {
                    Some(record) => {
                        let listener: Listener =
                            record.decode().map_err(crate::service::store_err)?;
                        apply_listener(tgt, &listener).await
                    }
                    None => remove_listener_by_key(tgt, key).await,
                }
            }
            StateKey::Host { nqn, host_nqn } => match desired {
                Some(record) => {
                    let access: HostAccess =
                        record.decode().map_err(crate::service::store_err)?;
                    self.apply_host(tgt, &access, snapshot).await
                }
                None => {
                    if host_nqn == ANY_HOST {
                        match tgt.allow_any_host(nqn, false).await {
                            Ok(()) => Ok(()),
                            Err(e) if e.code == Some(-2) => Ok(()),
                            Err(e) => Err(e.into()),
                        }
                    } else {
                        match tgt.remove_host(nqn, host_nqn).await {
                            Ok(()) => Ok(()),
                            Err(e) if e.code == Some(-2) => Ok(()),
                            Err(e) => Err(e.into()),
                        }
                    }
                }
            },
            StateKey::Key {
                nqn,
                host_nqn,
                kind,
            } => match desired {
                Some(record) => {
                    let material = self.ctx.keyring.unseal(&record.payload)?;
                    self.ctx
                        .keyring
                        .install(tgt, &material, nqn, host_nqn)
                        .await
                        .map(|_| ())
                }
                None => self.ctx.keyring.revoke(tgt, *kind, nqn, host_nqn).await,
            },
            // Gateway registrations and ANA assignments have no direct
            // engine projection here; the monitor drives ANA.
            StateKey::Gateway { .. } | StateKey::AnaGroup { .. } => Ok(()),
        }
    }

    async fn apply_host(
        &self,
        tgt: &mut dyn TgtApi,
        access: &HostAccess,
        snapshot: &Snapshot,
    ) -> GwResult<()> {
        if access.is_wildcard() {
            return tgt
                .allow_any_host(&access.subsystem_nqn, true)
                .await
                .map_err(Into::into);
        }
        // Keys travel in the same batch as the grant; install them first
        // so the grant can reference the keyring entries.
        for (key, record) in snapshot.subsystem_keys(&access.subsystem_nqn) {
            if let StateKey::Key { host_nqn, .. } = key {
                if host_nqn == &access.host_nqn {
                    let material = self.ctx.keyring.unseal(&record.payload)?;
                    self.ctx
                        .keyring
                        .install(tgt, &material, &access.subsystem_nqn, &access.host_nqn)
                        .await?;
                }
            }
        }
        match tgt
            .add_host(
                &access.subsystem_nqn,
                &access.host_nqn,
                access.psk_key.as_deref(),
                access.dhchap_key.as_deref(),
                access.dhchap_ctrlr_key.as_deref(),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.code == Some(-17) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Full convergence of the engine to `snapshot`.
    async fn converge(&self, snapshot: &Snapshot) {
        let mut desired_subsystems: BTreeSet<&str> = BTreeSet::new();
        for key in snapshot.records.keys() {
            if let StateKey::Subsystem { nqn } = key {
                desired_subsystems.insert(nqn);
            }
        }

        // Tear down engine subsystems the map no longer declares.
        let engine_subsystems = {
            let mut tgt = self.ctx.tgt.lock().await;
            match tgt.get_subsystems().await {
                Ok(subsystems) => subsystems,
                Err(e) => {
                    warn!(error = %e, "engine snapshot failed during convergence");
                    self.ctx.health.mark_degraded();
                    return;
                }
            }
        };
        for engine_sub in &engine_subsystems {
            if !desired_subsystems.contains(engine_sub.nqn.as_str()) {
                let mut tgt = self.ctx.tgt.lock().await;
                if let Err(e) = tgt.delete_subsystem(&engine_sub.nqn).await {
                    if e.code != Some(-2) {
                        warn!(nqn = %engine_sub.nqn, error = %e, "stale subsystem teardown failed");
                        self.ctx.health.mark_degraded();
                    }
                }
            }
        }

        // Build up everything the map declares, in dependency order:
        // subsystems, namespaces, hosts and keys, then local listeners.
        for (key, record) in &snapshot.records {
            let desired = Some(record);
            if matches!(key, StateKey::Subsystem { .. }) {
                self.apply_key(key, desired, snapshot).await;
            }
        }
        for (key, record) in &snapshot.records {
            let desired = Some(record);
            match key {
                StateKey::Namespace { .. } | StateKey::Key { .. } => {
                    self.apply_key(key, desired, snapshot).await;
                }
                _ => {}
            }
        }
        for (key, record) in &snapshot.records {
            let desired = Some(record);
            match key {
                StateKey::Host { .. } | StateKey::Listener { .. } => {
                    self.apply_key(key, desired, snapshot).await;
                }
                _ => {}
            }
        }
        info!("convergence pass complete");
    }
}

async fn apply_subsystem(tgt: &mut dyn TgtApi, subsystem: &Subsystem) -> GwResult<()> {
    match tgt
        .create_subsystem(&subsystem.nqn, &subsystem.serial, subsystem.max_namespaces)
        .await
    {
        Ok(()) => {}
        Err(e) if e.code == Some(-17) => {}
        Err(e) => return Err(e.into()),
    }
    if subsystem.allow_any_host {
        tgt.allow_any_host(&subsystem.nqn, true).await?;
    }
    Ok(())
}

async fn apply_namespace(tgt: &mut dyn TgtApi, namespace: &Namespace) -> GwResult<()> {
    let bdev = format!("bdev_{}", namespace.uuid);
    match tgt
        .create_bdev(&bdev, &namespace.pool, &namespace.image, namespace.block_size)
        .await
    {
        Ok(_) => {}
        Err(e) if e.code == Some(-17) => {}
        Err(e) => return Err(e.into()),
    }
    match tgt
        .add_namespace(
            &namespace.subsystem_nqn,
            &bdev,
            namespace.nsid,
            &namespace.uuid,
            namespace.lb_group.0,
        )
        .await
    {
        Ok(_) => {}
        Err(e) if e.code == Some(-17) => {
            // Already attached; converge the mutable attributes.
            tgt.set_namespace_ana_group(
                &namespace.subsystem_nqn,
                namespace.nsid,
                namespace.lb_group.0,
            )
            .await?;
            if namespace.size_bytes > 0 {
                tgt.resize_bdev(&bdev, namespace.size_bytes).await?;
            }
        }
        Err(e) => return Err(e.into()),
    }
    if !namespace.auto_visible {
        for host in &namespace.visible_hosts {
            tgt.set_namespace_visibility(&namespace.subsystem_nqn, namespace.nsid, host, true)
                .await?;
        }
    }
    Ok(())
}

async fn remove_namespace(tgt: &mut dyn TgtApi, nqn: &str, nsid: u32) -> GwResult<()> {
    // The record is gone, so recover the bdev name from the engine view.
    let bdev = tgt
        .get_subsystems()
        .await?
        .into_iter()
        .find(|s| s.nqn == nqn)
        .and_then(|s| s.namespaces.into_iter().find(|n| n.nsid == nsid))
        .map(|n| n.bdev_name);
    match tgt.remove_namespace(nqn, nsid).await {
        Ok(()) => {}
        Err(e) if e.code == Some(-2) => {}
        Err(e) => return Err(e.into()),
    }
    if let Some(bdev) = bdev {
        match tgt.delete_bdev(&bdev).await {
            Ok(()) => {}
            Err(e) if e.code == Some(-2) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn apply_listener(tgt: &mut dyn TgtApi, listener: &Listener) -> GwResult<()> {
    match tgt
        .add_listener(
            &listener.subsystem_nqn,
            listener.transport.as_str(),
            listener.adrfam.as_str(),
            &listener.traddr,
            listener.trsvcid,
            listener.secure,
        )
        .await
    {
        Ok(()) => Ok(()),
        Err(e) if e.code == Some(-17) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn remove_listener_by_key(tgt: &mut dyn TgtApi, key: &StateKey) -> GwResult<()> {
    let StateKey::Listener {
        nqn,
        adrfam,
        traddr,
        trsvcid,
        ..
    } = key
    else {
        return Ok(());
    };
    match tgt
        .remove_listener(nqn, "TCP", adrfam, traddr, *trsvcid)
        .await
    {
        Ok(()) => Ok(()),
        Err(e) if e.code == Some(-2) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
