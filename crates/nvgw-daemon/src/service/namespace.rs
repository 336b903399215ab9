//! Namespace operations.

use std::collections::BTreeSet;

use nvgw_core::error::{GwError, GwResult};
use nvgw_core::model::{
    AnaGroupId, Namespace, Subsystem, DEFAULT_BLOCK_SIZE,
};
use nvgw_core::nqn;
use nvgw_core::statemap::{self, StateKey};
use tracing::{info, warn};
use uuid::Uuid;

use super::{cas_jitter, store_err, GatewayService, CAS_ATTEMPTS};

/// Parameters of `namespace_add`.
#[derive(Debug, Clone)]
pub struct NamespaceAddParams {
    /// Owning subsystem NQN.
    pub nqn: String,
    /// Explicit nsid; lowest free when absent.
    pub nsid: Option<u32>,
    /// Backing pool.
    pub pool: String,
    /// Backing image.
    pub image: String,
    /// Declared size in bytes; zero inherits the image size.
    pub size_bytes: Option<u64>,
    /// Explicit UUID; generated when absent.
    pub uuid: Option<String>,
    /// Load-balancing group; group 1 when absent.
    pub lb_group: Option<u32>,
    /// Visible to all allowed hosts; defaults to true.
    pub auto_visible: Option<bool>,
    /// Block size; 512 when absent.
    pub block_size: Option<u32>,
}

fn bdev_name(uuid: &str) -> String {
    format!("bdev_{uuid}")
}

impl GatewayService {
    /// Creates a namespace. The nsid is the lowest free id unless the
    /// request pins one; the UUID is generated once here and identical on
    /// every gateway from then on.
    ///
    /// # Errors
    ///
    /// `NotFound` (subsystem), `AlreadyExists` (pinned nsid taken),
    /// `ResourceExhausted` (namespace limit), `InvalidArgument`.
    pub async fn namespace_add(&self, params: NamespaceAddParams) -> GwResult<Namespace> {
        nqn::validate_nqn(&params.nqn)?;
        if params.nsid == Some(0) {
            return Err(GwError::invalid_argument("nsid must be at least 1"));
        }
        let uuid = match params.uuid {
            Some(uuid) => uuid,
            None => Uuid::new_v4().to_string(),
        };

        let _guard = self.ctx.locks.acquire(&params.nqn).await;

        let mut attempt = 0;
        let namespace = loop {
            let snapshot = self.snapshot().await?;
            let sub_key = StateKey::Subsystem {
                nqn: params.nqn.clone(),
            };
            let Some(sub_record) = snapshot.get(&sub_key) else {
                return Err(GwError::not_found(format!(
                    "subsystem {} does not exist",
                    params.nqn
                )));
            };
            let subsystem: Subsystem = sub_record.decode().map_err(store_err)?;

            let mut used = BTreeSet::new();
            for (key, _) in snapshot.subsystem_keys(&params.nqn) {
                if let StateKey::Namespace { nsid, .. } = key {
                    used.insert(*nsid);
                }
            }
            if used.len() as u32 >= subsystem.max_namespaces {
                return Err(GwError::resource_exhausted(format!(
                    "subsystem {} is at its namespace limit ({})",
                    params.nqn, subsystem.max_namespaces
                )));
            }
            let nsid = match params.nsid {
                Some(nsid) => {
                    if nsid > subsystem.max_namespaces {
                        return Err(GwError::invalid_argument(format!(
                            "nsid {nsid} exceeds max-namespaces {}",
                            subsystem.max_namespaces
                        )));
                    }
                    if used.contains(&nsid) {
                        return Err(GwError::already_exists(format!(
                            "nsid {nsid} is already in use on {}",
                            params.nqn
                        )));
                    }
                    nsid
                }
                None => (1..=subsystem.max_namespaces)
                    .find(|candidate| !used.contains(candidate))
                    .ok_or_else(|| {
                        GwError::resource_exhausted(format!(
                            "subsystem {} has no free nsid",
                            params.nqn
                        ))
                    })?,
            };

            let namespace = Namespace {
                subsystem_nqn: params.nqn.clone(),
                nsid,
                pool: params.pool.clone(),
                image: params.image.clone(),
                size_bytes: params.size_bytes.unwrap_or(0),
                block_size: params.block_size.unwrap_or(DEFAULT_BLOCK_SIZE),
                uuid: uuid.clone(),
                lb_group: AnaGroupId(params.lb_group.unwrap_or(1)),
                auto_visible: params.auto_visible.unwrap_or(true),
                visible_hosts: BTreeSet::new(),
            };
            namespace.validate()?;

            let payload = serde_json::to_vec(&namespace)
                .map_err(|e| GwError::internal(format!("namespace encode failed: {e}")))?;
            let key = StateKey::Namespace {
                nqn: params.nqn.clone(),
                nsid,
            };
            match statemap::cas(
                self.ctx.map.as_ref(),
                self.ctx.gateway_name(),
                key,
                None,
                payload,
            )
            .await
            {
                Ok(_) => break namespace,
                Err(e) if e.is_conflict() && attempt + 1 < CAS_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(cas_jitter()).await;
                }
                Err(e) => return Err(store_err(e)),
            }
        };

        let bdev = bdev_name(&namespace.uuid);
        let mut tgt = self.ctx.tgt.lock().await;
        match tgt
            .create_bdev(&bdev, &namespace.pool, &namespace.image, namespace.block_size)
            .await
        {
            Ok(_) => {}
            Err(e) if e.code == Some(-17) => {}
            Err(e) => {
                warn!(nqn = %namespace.subsystem_nqn, bdev, error = %e, "bdev create failed");
                self.ctx.health.mark_degraded();
                return Err(e.into());
            }
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
            Err(e) if e.code == Some(-17) => {}
            Err(e) => {
                warn!(nqn = %namespace.subsystem_nqn, nsid = namespace.nsid, error = %e,
                      "engine add_namespace failed");
                self.ctx.health.mark_degraded();
                return Err(e.into());
            }
        }
        drop(tgt);

        info!(
            nqn = %namespace.subsystem_nqn,
            nsid = namespace.nsid,
            pool = %namespace.pool,
            image = %namespace.image,
            "namespace created"
        );
        Ok(namespace)
    }

    /// Deletes a namespace. Deleting an nsid that is already gone is a
    /// no-op; the subsystem itself must exist.
    ///
    /// # Errors
    ///
    /// `NotFound` when the subsystem is unknown.
    pub async fn namespace_del(&self, nqn_str: &str, nsid: u32) -> GwResult<()> {
        nqn::validate_nqn(nqn_str)?;
        let _guard = self.ctx.locks.acquire(nqn_str).await;

        let key = StateKey::Namespace {
            nqn: nqn_str.to_string(),
            nsid,
        };
        let mut removed: Option<Namespace> = None;
        for attempt in 0..CAS_ATTEMPTS {
            let snapshot = self.snapshot().await?;
            if snapshot
                .get(&StateKey::Subsystem {
                    nqn: nqn_str.to_string(),
                })
                .is_none()
            {
                return Err(GwError::not_found(format!(
                    "subsystem {nqn_str} does not exist"
                )));
            }
            let Some(record) = snapshot.get(&key) else {
                // Already gone.
                return Ok(());
            };
            removed = Some(record.decode().map_err(store_err)?);
            match statemap::delete(
                self.ctx.map.as_ref(),
                self.ctx.gateway_name(),
                key.clone(),
                record.version,
            )
            .await
            {
                Ok(_) => break,
                Err(e) if e.is_conflict() && attempt + 1 < CAS_ATTEMPTS => {
                    tokio::time::sleep(cas_jitter()).await;
                }
                Err(e) => return Err(store_err(e)),
            }
        }

        let mut tgt = self.ctx.tgt.lock().await;
        match tgt.remove_namespace(nqn_str, nsid).await {
            Ok(()) => {}
            Err(e) if e.code == Some(-2) => {}
            Err(e) => {
                warn!(nqn = nqn_str, nsid, error = %e, "engine remove_namespace failed");
                self.ctx.health.mark_degraded();
            }
        }
        if let Some(namespace) = &removed {
            match tgt.delete_bdev(&bdev_name(&namespace.uuid)).await {
                Ok(()) => {}
                Err(e) if e.code == Some(-2) => {}
                Err(e) => warn!(nqn = nqn_str, nsid, error = %e, "bdev delete failed"),
            }
        }
        drop(tgt);

        info!(nqn = nqn_str, nsid, "namespace deleted");
        Ok(())
    }

    /// Grows a namespace. Shrinking is rejected; resizing never renumbers.
    ///
    /// # Errors
    ///
    /// `NotFound`, `InvalidArgument` (shrink).
    pub async fn namespace_resize(
        &self,
        nqn_str: &str,
        nsid: u32,
        new_size_bytes: u64,
    ) -> GwResult<Namespace> {
        nqn::validate_nqn(nqn_str)?;
        let _guard = self.ctx.locks.acquire(nqn_str).await;
        let key = StateKey::Namespace {
            nqn: nqn_str.to_string(),
            nsid,
        };

        let mut attempt = 0;
        let namespace = loop {
            let snapshot = self.snapshot().await?;
            let Some(record) = snapshot.get(&key) else {
                return Err(GwError::not_found(format!(
                    "namespace {nsid} does not exist on {nqn_str}"
                )));
            };
            let mut namespace: Namespace = record.decode().map_err(store_err)?;
            if new_size_bytes < namespace.size_bytes {
                return Err(GwError::invalid_argument(format!(
                    "can't shrink namespace {nsid} from {} to {new_size_bytes} bytes",
                    namespace.size_bytes
                )));
            }
            if new_size_bytes == namespace.size_bytes {
                return Ok(namespace);
            }
            namespace.size_bytes = new_size_bytes;
            let payload = serde_json::to_vec(&namespace)
                .map_err(|e| GwError::internal(format!("namespace encode failed: {e}")))?;
            match statemap::cas(
                self.ctx.map.as_ref(),
                self.ctx.gateway_name(),
                key.clone(),
                Some(record.version),
                payload,
            )
            .await
            {
                Ok(_) => break namespace,
                Err(e) if e.is_conflict() && attempt + 1 < CAS_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(cas_jitter()).await;
                }
                Err(e) => return Err(store_err(e)),
            }
        };

        let mut tgt = self.ctx.tgt.lock().await;
        if let Err(e) = tgt
            .resize_bdev(&bdev_name(&namespace.uuid), new_size_bytes)
            .await
        {
            warn!(nqn = nqn_str, nsid, error = %e, "bdev resize failed");
            self.ctx.health.mark_degraded();
            return Err(e.into());
        }
        drop(tgt);

        info!(nqn = nqn_str, nsid, new_size_bytes, "namespace resized");
        Ok(namespace)
    }

    /// Moves a namespace to another load-balancing (ANA) group.
    ///
    /// # Errors
    ///
    /// `NotFound`, `InvalidArgument` (group 0).
    pub async fn namespace_change_lb_group(
        &self,
        nqn_str: &str,
        nsid: u32,
        lb_group: u32,
    ) -> GwResult<Namespace> {
        nqn::validate_nqn(nqn_str)?;
        if lb_group == 0 {
            return Err(GwError::invalid_argument("load-balancing group must be at least 1"));
        }
        let _guard = self.ctx.locks.acquire(nqn_str).await;
        let key = StateKey::Namespace {
            nqn: nqn_str.to_string(),
            nsid,
        };

        let mut attempt = 0;
        let namespace = loop {
            let snapshot = self.snapshot().await?;
            let Some(record) = snapshot.get(&key) else {
                return Err(GwError::not_found(format!(
                    "namespace {nsid} does not exist on {nqn_str}"
                )));
            };
            let mut namespace: Namespace = record.decode().map_err(store_err)?;
            if namespace.lb_group.0 == lb_group {
                return Ok(namespace);
            }
            namespace.lb_group = AnaGroupId(lb_group);
            let payload = serde_json::to_vec(&namespace)
                .map_err(|e| GwError::internal(format!("namespace encode failed: {e}")))?;
            match statemap::cas(
                self.ctx.map.as_ref(),
                self.ctx.gateway_name(),
                key.clone(),
                Some(record.version),
                payload,
            )
            .await
            {
                Ok(_) => break namespace,
                Err(e) if e.is_conflict() && attempt + 1 < CAS_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(cas_jitter()).await;
                }
                Err(e) => return Err(store_err(e)),
            }
        };

        let mut tgt = self.ctx.tgt.lock().await;
        if let Err(e) = tgt
            .set_namespace_ana_group(nqn_str, nsid, lb_group)
            .await
        {
            warn!(nqn = nqn_str, nsid, lb_group, error = %e, "ana group change failed");
            self.ctx.health.mark_degraded();
            return Err(e.into());
        }
        drop(tgt);

        info!(nqn = nqn_str, nsid, lb_group, "namespace load-balancing group changed");
        Ok(namespace)
    }

    /// Grants `host_nqn` visibility of a namespace that is not
    /// auto-visible. Granting an existing host again is a no-op.
    ///
    /// # Errors
    ///
    /// `NotFound`, `FailedPrecondition` when the namespace is
    /// auto-visible, `InvalidArgument` for the wildcard.
    pub async fn namespace_add_host(
        &self,
        nqn_str: &str,
        nsid: u32,
        host_nqn: &str,
    ) -> GwResult<()> {
        self.namespace_set_host(nqn_str, nsid, host_nqn, true).await
    }

    /// Revokes `host_nqn`'s visibility of a namespace.
    ///
    /// # Errors
    ///
    /// As [`namespace_add_host`](Self::namespace_add_host).
    pub async fn namespace_del_host(
        &self,
        nqn_str: &str,
        nsid: u32,
        host_nqn: &str,
    ) -> GwResult<()> {
        self.namespace_set_host(nqn_str, nsid, host_nqn, false).await
    }

    async fn namespace_set_host(
        &self,
        nqn_str: &str,
        nsid: u32,
        host_nqn: &str,
        visible: bool,
    ) -> GwResult<()> {
        nqn::validate_nqn(nqn_str)?;
        if host_nqn == "*" {
            return Err(GwError::invalid_argument(
                "namespace visibility takes an explicit host NQN, not \"*\"",
            ));
        }
        nqn::validate_nqn(host_nqn)?;

        let _guard = self.ctx.locks.acquire(nqn_str).await;
        let key = StateKey::Namespace {
            nqn: nqn_str.to_string(),
            nsid,
        };

        let mut attempt = 0;
        loop {
            let snapshot = self.snapshot().await?;
            let Some(record) = snapshot.get(&key) else {
                return Err(GwError::not_found(format!(
                    "namespace {nsid} does not exist on {nqn_str}"
                )));
            };
            let mut namespace: Namespace = record.decode().map_err(store_err)?;
            if namespace.auto_visible {
                return Err(GwError::failed_precondition(format!(
                    "namespace {nsid} on {nqn_str} is auto-visible; per-host grants don't apply"
                )));
            }
            let changed = if visible {
                namespace.visible_hosts.insert(host_nqn.to_string())
            } else {
                namespace.visible_hosts.remove(host_nqn)
            };
            if !changed {
                return Ok(());
            }
            let payload = serde_json::to_vec(&namespace)
                .map_err(|e| GwError::internal(format!("namespace encode failed: {e}")))?;
            match statemap::cas(
                self.ctx.map.as_ref(),
                self.ctx.gateway_name(),
                key.clone(),
                Some(record.version),
                payload,
            )
            .await
            {
                Ok(_) => break,
                Err(e) if e.is_conflict() && attempt + 1 < CAS_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(cas_jitter()).await;
                }
                Err(e) => return Err(store_err(e)),
            }
        }

        let mut tgt = self.ctx.tgt.lock().await;
        if let Err(e) = tgt
            .set_namespace_visibility(nqn_str, nsid, host_nqn, visible)
            .await
        {
            warn!(nqn = nqn_str, nsid, host = host_nqn, error = %e, "visibility change failed");
            self.ctx.health.mark_degraded();
            return Err(e.into());
        }
        drop(tgt);

        info!(nqn = nqn_str, nsid, host = host_nqn, visible, "namespace visibility changed");
        Ok(())
    }
}
