//! Subsystem operations.

use nvgw_core::error::{GwError, GwResult};
use nvgw_core::model::{Subsystem, DEFAULT_MAX_NAMESPACES};
use nvgw_core::nqn;
use nvgw_core::statemap::{self, MapOp, StateKey};
use rand::Rng;
use tracing::{info, warn};

use super::{cas_jitter, store_err, GatewayService, CAS_ATTEMPTS};

/// Parameters of `subsystem_add`.
#[derive(Debug, Clone)]
pub struct SubsystemAddParams {
    /// Requested NQN.
    pub nqn: String,
    /// Serial number; generated when absent.
    pub serial: Option<String>,
    /// Maximum namespaces; defaulted when absent.
    pub max_namespaces: Option<u32>,
    /// Do not append the gateway group to the NQN.
    pub no_group_append: bool,
}

impl GatewayService {
    /// Creates a subsystem cluster-wide.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` on a malformed or discovery NQN,
    /// `AlreadyExists` when the NQN is taken, `Aborted` on a CAS
    /// conflict after retries, engine errors mapped onto their canonical
    /// kinds.
    pub async fn subsystem_add(&self, params: SubsystemAddParams) -> GwResult<Subsystem> {
        let group = &self.ctx.identity.group;
        let nqn = if params.no_group_append || group.is_empty() {
            params.nqn
        } else {
            format!("{}.{}", params.nqn, group)
        };
        let serial = match params.serial.filter(|s| !s.is_empty()) {
            Some(serial) => serial,
            None => format!("Ceph{:08}", rand::thread_rng().gen_range(0..100_000_000u32)),
        };
        let subsystem = Subsystem {
            nqn,
            serial,
            max_namespaces: params.max_namespaces.unwrap_or(DEFAULT_MAX_NAMESPACES),
            allow_any_host: false,
            no_group_append: params.no_group_append,
        };
        subsystem.validate()?;

        let _guard = self.ctx.locks.acquire(&subsystem.nqn).await;
        let key = StateKey::Subsystem {
            nqn: subsystem.nqn.clone(),
        };
        let payload = serde_json::to_vec(&subsystem)
            .map_err(|e| GwError::internal(format!("subsystem encode failed: {e}")))?;

        for attempt in 0..CAS_ATTEMPTS {
            let snapshot = self.snapshot().await?;
            if snapshot.get(&key).is_some() {
                return Err(GwError::already_exists(format!(
                    "subsystem {} already exists",
                    subsystem.nqn
                )));
            }
            match statemap::cas(
                self.ctx.map.as_ref(),
                self.ctx.gateway_name(),
                key.clone(),
                None,
                payload.clone(),
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
        match tgt
            .create_subsystem(&subsystem.nqn, &subsystem.serial, subsystem.max_namespaces)
            .await
        {
            Ok(()) => {}
            // A previous partial attempt left it behind; the record is
            // authoritative and the engine already agrees.
            Err(e) if e.code == Some(-17) => {}
            Err(e) => {
                warn!(nqn = %subsystem.nqn, error = %e, "engine create_subsystem failed");
                self.ctx.health.mark_degraded();
                return Err(e.into());
            }
        }
        drop(tgt);

        info!(nqn = %subsystem.nqn, serial = %subsystem.serial, "subsystem created");
        Ok(subsystem)
    }

    /// Deletes a subsystem. Without `force` the subsystem must hold no
    /// namespaces and no explicit (non-wildcard) hosts; with `force`
    /// every dependent record is removed in one atomic state-map write.
    ///
    /// # Errors
    ///
    /// `NotFound` when the NQN is unknown, `FailedPrecondition` when
    /// dependents exist and `force` is not set.
    pub async fn subsystem_del(&self, nqn: &str, force: bool) -> GwResult<()> {
        nqn::validate_nqn(nqn)?;
        let _guard = self.ctx.locks.acquire(nqn).await;
        let sub_key = StateKey::Subsystem {
            nqn: nqn.to_string(),
        };

        let mut removed_keys: Vec<StateKey> = Vec::new();
        let mut removed_bdevs: Vec<String> = Vec::new();
        for attempt in 0..CAS_ATTEMPTS {
            let snapshot = self.snapshot().await?;
            if snapshot.get(&sub_key).is_none() {
                return Err(GwError::not_found(format!("subsystem {nqn} does not exist")));
            }

            let mut namespace_count = 0usize;
            let mut explicit_hosts = 0usize;
            let mut ops = Vec::new();
            let mut keys = Vec::new();
            let mut bdevs = Vec::new();
            for (key, record) in snapshot.subsystem_keys(nqn) {
                match key {
                    StateKey::Namespace { .. } => {
                        namespace_count += 1;
                        if let Ok(ns) = record.decode::<nvgw_core::model::Namespace>() {
                            bdevs.push(format!("bdev_{}", ns.uuid));
                        }
                    }
                    // The wildcard counts as empty for the emptiness check.
                    StateKey::Host { host_nqn, .. } if host_nqn != "*" => explicit_hosts += 1,
                    _ => {}
                }
                ops.push(MapOp::Delete {
                    key: key.clone(),
                    expected: record.version,
                });
                keys.push(key.clone());
            }

            if !force && (namespace_count > 0 || explicit_hosts > 0) {
                return Err(GwError::failed_precondition(format!(
                    "subsystem {nqn} still has {namespace_count} namespace(s) and \
                     {explicit_hosts} host(s); use force to delete them"
                )));
            }

            // Compound multi-key delete: hold the cluster lock so no peer
            // interleaves a write between our reads and the batch.
            self.ctx
                .map
                .lock(self.ctx.gateway_name())
                .await
                .map_err(store_err)?;
            let result = self.ctx.map.apply(self.ctx.gateway_name(), ops).await;
            self.ctx
                .map
                .unlock(self.ctx.gateway_name())
                .await
                .map_err(store_err)?;

            match result {
                Ok(_) => {
                    removed_keys = keys;
                    removed_bdevs = bdevs;
                    break;
                }
                Err(e) if e.is_conflict() && attempt + 1 < CAS_ATTEMPTS => {
                    tokio::time::sleep(cas_jitter()).await;
                }
                Err(e) => return Err(store_err(e)),
            }
        }

        // Engine teardown and keyring cleanup. Failures here degrade
        // health but never resurrect the records.
        let mut tgt = self.ctx.tgt.lock().await;
        for key in &removed_keys {
            if let StateKey::Key {
                host_nqn, kind, ..
            } = key
            {
                if let Err(e) = self
                    .ctx
                    .keyring
                    .revoke(tgt.as_mut(), *kind, nqn, host_nqn)
                    .await
                {
                    warn!(nqn, host = %host_nqn, kind = %kind, error = %e, "key revoke failed");
                }
            }
        }
        match tgt.delete_subsystem(nqn).await {
            Ok(()) => {}
            Err(e) if e.code == Some(-2) => {}
            Err(e) => {
                warn!(nqn, error = %e, "engine delete_subsystem failed");
                self.ctx.health.mark_degraded();
            }
        }
        for bdev in &removed_bdevs {
            match tgt.delete_bdev(bdev).await {
                Ok(()) => {}
                Err(e) if e.code == Some(-2) => {}
                Err(e) => warn!(bdev, error = %e, "bdev delete failed"),
            }
        }
        drop(tgt);

        if let Err(e) = self.ctx.keyring.purge_subsystem_files(nqn) {
            warn!(nqn, error = %e, "key file purge failed");
        }
        // Release before forgetting; the entry only drops when nobody
        // else holds it.
        drop(_guard);
        self.ctx.locks.forget(nqn);

        info!(nqn, force, "subsystem deleted");
        Ok(())
    }
}
