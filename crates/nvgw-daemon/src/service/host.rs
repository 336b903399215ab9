//! Host ACL operations, including the key lifecycle.
//!
//! A subsystem either allows any host (the `"*"` grant) or carries an
//! explicit ACL; the two styles are mutually exclusive. Hosts may carry
//! PSK and DH-CHAP keys: the key bytes go to the local engine keyring and
//! the 0600 key file, and, sealed under the group secret, into the
//! state map in the same atomic batch as the grant, so a peer never
//! observes a host without its keys.

use nvgw_core::error::{GwError, GwResult};
use nvgw_core::keys::{keyring_entry_name, KeyKind, KeyMaterial};
use nvgw_core::model::{HostAccess, Subsystem, ANY_HOST};
use nvgw_core::nqn;
use nvgw_core::statemap::{MapOp, StateKey};
use tracing::{info, warn};

use super::{cas_jitter, store_err, GatewayService, CAS_ATTEMPTS};

/// Parameters of `host_add`.
#[derive(Debug)]
pub struct HostAddParams {
    /// Subsystem NQN.
    pub nqn: String,
    /// Host NQN or `"*"`.
    pub host_nqn: String,
    /// PSK in interchange format.
    pub psk: Option<String>,
    /// DH-CHAP host key in interchange format.
    pub dhchap: Option<String>,
    /// DH-CHAP controller key in interchange format.
    pub dhchap_ctrlr: Option<String>,
}

fn parse_key(kind: KeyKind, text: Option<String>) -> GwResult<Option<KeyMaterial>> {
    text.map(|t| KeyMaterial::new(kind, t)).transpose()
}

impl GatewayService {
    /// Grants a host (or any host) access to a subsystem.
    ///
    /// # Errors
    ///
    /// `FailedPrecondition` when mixing the wildcard with explicit
    /// grants, `AlreadyExists` for a duplicate grant, `InvalidArgument`
    /// for malformed NQNs or keys.
    pub async fn host_add(&self, params: HostAddParams) -> GwResult<HostAccess> {
        nqn::validate_nqn(&params.nqn)?;
        let keys: Vec<KeyMaterial> = [
            parse_key(KeyKind::Psk, params.psk)?,
            parse_key(KeyKind::Dhchap, params.dhchap)?,
            parse_key(KeyKind::DhchapCtrlr, params.dhchap_ctrlr)?,
        ]
        .into_iter()
        .flatten()
        .collect();

        let access = HostAccess {
            subsystem_nqn: params.nqn.clone(),
            host_nqn: params.host_nqn.clone(),
            psk_key: keys
                .iter()
                .find(|k| k.kind() == KeyKind::Psk)
                .map(|k| keyring_entry_name(k.kind(), &params.nqn, &params.host_nqn)),
            dhchap_key: keys
                .iter()
                .find(|k| k.kind() == KeyKind::Dhchap)
                .map(|k| keyring_entry_name(k.kind(), &params.nqn, &params.host_nqn)),
            dhchap_ctrlr_key: keys
                .iter()
                .find(|k| k.kind() == KeyKind::DhchapCtrlr)
                .map(|k| keyring_entry_name(k.kind(), &params.nqn, &params.host_nqn)),
        };
        access.validate()?;
        let wildcard = access.is_wildcard();

        let _guard = self.ctx.locks.acquire(&params.nqn).await;
        let host_key = StateKey::Host {
            nqn: params.nqn.clone(),
            host_nqn: params.host_nqn.clone(),
        };

        for attempt in 0..CAS_ATTEMPTS {
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
            if snapshot.get(&host_key).is_some() {
                return Err(GwError::already_exists(format!(
                    "host {} already has access to {}",
                    params.host_nqn, params.nqn
                )));
            }

            // ACL style exclusivity.
            for (key, _) in snapshot.subsystem_keys(&params.nqn) {
                if let StateKey::Host { host_nqn, .. } = key {
                    if wildcard && host_nqn != ANY_HOST {
                        return Err(GwError::failed_precondition(format!(
                            "subsystem {} has explicit hosts; \"*\" is not allowed",
                            params.nqn
                        )));
                    }
                    if !wildcard && host_nqn == ANY_HOST {
                        return Err(GwError::failed_precondition(format!(
                            "subsystem {} allows any host; remove \"*\" first",
                            params.nqn
                        )));
                    }
                }
            }

            let mut ops = vec![MapOp::Put {
                key: host_key.clone(),
                expected: None,
                payload: serde_json::to_vec(&access)
                    .map_err(|e| GwError::internal(format!("host encode failed: {e}")))?,
            }];
            for material in &keys {
                ops.push(MapOp::Put {
                    key: StateKey::Key {
                        nqn: params.nqn.clone(),
                        host_nqn: params.host_nqn.clone(),
                        kind: material.kind(),
                    },
                    expected: None,
                    payload: self.ctx.keyring.seal(material)?,
                });
            }
            if wildcard {
                let mut subsystem: Subsystem = sub_record.decode().map_err(store_err)?;
                subsystem.allow_any_host = true;
                ops.push(MapOp::Put {
                    key: sub_key.clone(),
                    expected: Some(sub_record.version),
                    payload: serde_json::to_vec(&subsystem)
                        .map_err(|e| GwError::internal(format!("subsystem encode failed: {e}")))?,
                });
            }

            let compound = ops.len() > 1;
            if compound {
                self.ctx
                    .map
                    .lock(self.ctx.gateway_name())
                    .await
                    .map_err(store_err)?;
            }
            let result = self.ctx.map.apply(self.ctx.gateway_name(), ops).await;
            if compound {
                self.ctx
                    .map
                    .unlock(self.ctx.gateway_name())
                    .await
                    .map_err(store_err)?;
            }
            match result {
                Ok(_) => break,
                Err(e) if e.is_conflict() && attempt + 1 < CAS_ATTEMPTS => {
                    tokio::time::sleep(cas_jitter()).await;
                }
                Err(e) => return Err(store_err(e)),
            }
        }

        // Engine apply: keys into the keyring, then the grant.
        let mut tgt = self.ctx.tgt.lock().await;
        for material in &keys {
            self.ctx
                .keyring
                .install(tgt.as_mut(), material, &params.nqn, &params.host_nqn)
                .await?;
        }
        let engine_result = if wildcard {
            tgt.allow_any_host(&params.nqn, true).await
        } else {
            tgt.add_host(
                &params.nqn,
                &params.host_nqn,
                access.psk_key.as_deref(),
                access.dhchap_key.as_deref(),
                access.dhchap_ctrlr_key.as_deref(),
            )
            .await
        };
        match engine_result {
            Ok(()) => {}
            Err(e) if e.code == Some(-17) => {}
            Err(e) => {
                warn!(nqn = %params.nqn, host = %params.host_nqn, error = %e,
                      "engine host grant failed");
                self.ctx.health.mark_degraded();
                return Err(e.into());
            }
        }
        drop(tgt);

        info!(
            nqn = %params.nqn,
            host = %params.host_nqn,
            secured = !keys.is_empty(),
            "host access granted"
        );
        Ok(access)
    }

    /// Revokes a host grant and destroys its keys (engine keyring entry,
    /// key file, state-map records). Revoking an absent grant is a no-op.
    ///
    /// # Errors
    ///
    /// `NotFound` when the subsystem is unknown, state-map and engine
    /// failures.
    pub async fn host_del(&self, nqn_str: &str, host_nqn: &str) -> GwResult<()> {
        nqn::validate_nqn(nqn_str)?;
        let wildcard = host_nqn == ANY_HOST;

        let _guard = self.ctx.locks.acquire(nqn_str).await;
        let host_key = StateKey::Host {
            nqn: nqn_str.to_string(),
            host_nqn: host_nqn.to_string(),
        };

        let mut removed_kinds: Vec<KeyKind> = Vec::new();
        for attempt in 0..CAS_ATTEMPTS {
            let snapshot = self.snapshot().await?;
            let sub_key = StateKey::Subsystem {
                nqn: nqn_str.to_string(),
            };
            let Some(sub_record) = snapshot.get(&sub_key) else {
                return Err(GwError::not_found(format!(
                    "subsystem {nqn_str} does not exist"
                )));
            };
            let Some(host_record) = snapshot.get(&host_key) else {
                return Ok(());
            };

            let mut ops = vec![MapOp::Delete {
                key: host_key.clone(),
                expected: host_record.version,
            }];
            let mut kinds = Vec::new();
            for (key, record) in snapshot.subsystem_keys(nqn_str) {
                if let StateKey::Key {
                    host_nqn: key_host,
                    kind,
                    ..
                } = key
                {
                    if key_host == host_nqn {
                        kinds.push(*kind);
                        ops.push(MapOp::Delete {
                            key: key.clone(),
                            expected: record.version,
                        });
                    }
                }
            }
            if wildcard {
                let mut subsystem: Subsystem = sub_record.decode().map_err(store_err)?;
                subsystem.allow_any_host = false;
                ops.push(MapOp::Put {
                    key: sub_key.clone(),
                    expected: Some(sub_record.version),
                    payload: serde_json::to_vec(&subsystem)
                        .map_err(|e| GwError::internal(format!("subsystem encode failed: {e}")))?,
                });
            }

            let compound = ops.len() > 1;
            if compound {
                self.ctx
                    .map
                    .lock(self.ctx.gateway_name())
                    .await
                    .map_err(store_err)?;
            }
            let result = self.ctx.map.apply(self.ctx.gateway_name(), ops).await;
            if compound {
                self.ctx
                    .map
                    .unlock(self.ctx.gateway_name())
                    .await
                    .map_err(store_err)?;
            }
            match result {
                Ok(_) => {
                    removed_kinds = kinds;
                    break;
                }
                Err(e) if e.is_conflict() && attempt + 1 < CAS_ATTEMPTS => {
                    tokio::time::sleep(cas_jitter()).await;
                }
                Err(e) => return Err(store_err(e)),
            }
        }

        let mut tgt = self.ctx.tgt.lock().await;
        let engine_result = if wildcard {
            tgt.allow_any_host(nqn_str, false).await
        } else {
            tgt.remove_host(nqn_str, host_nqn).await
        };
        match engine_result {
            Ok(()) => {}
            Err(e) if e.code == Some(-2) => {}
            Err(e) => {
                warn!(nqn = nqn_str, host = host_nqn, error = %e, "engine host revoke failed");
                self.ctx.health.mark_degraded();
            }
        }
        for kind in removed_kinds {
            if let Err(e) = self
                .ctx
                .keyring
                .revoke(tgt.as_mut(), kind, nqn_str, host_nqn)
                .await
            {
                warn!(nqn = nqn_str, host = host_nqn, kind = %kind, error = %e,
                      "key revoke failed");
            }
        }
        drop(tgt);

        info!(nqn = nqn_str, host = host_nqn, "host access revoked");
        Ok(())
    }
}
