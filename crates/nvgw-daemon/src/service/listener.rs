//! Listener operations.
//!
//! A listener is realized in the local engine only on the gateway named
//! in the request; every other gateway records it in the state map and
//! serves it nothing. That yields per-address affinity without a shared
//! data path, so creation is the one gateway-local mutation in the
//! service: engine first, state map second, engine rollback on a CAS
//! conflict.

use nvgw_core::error::{GwError, GwResult};
use nvgw_core::model::Listener;
use nvgw_core::nqn;
use nvgw_core::statemap::{self, StateKey};
use tracing::{info, warn};

use super::{cas_jitter, store_err, GatewayService, CAS_ATTEMPTS};

fn listener_key(listener: &Listener) -> StateKey {
    StateKey::Listener {
        nqn: listener.subsystem_nqn.clone(),
        gateway: listener.gateway.clone(),
        adrfam: listener.adrfam.as_str().to_string(),
        traddr: listener.traddr.clone(),
        trsvcid: listener.trsvcid,
    }
}

impl GatewayService {
    /// Creates a listener. The request's gateway name must be this
    /// gateway; peers learn about the listener through the state map.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` (wrong gateway name, bad address),
    /// `NotFound` (subsystem), `AlreadyExists`, `Aborted`.
    pub async fn listener_add(&self, listener: Listener) -> GwResult<Listener> {
        nqn::validate_nqn(&listener.subsystem_nqn)?;
        listener.validate()?;
        if listener.gateway != self.ctx.identity.name {
            return Err(GwError::invalid_argument(format!(
                "listener gateway name \"{}\" is not this gateway (\"{}\")",
                listener.gateway, self.ctx.identity.name
            )));
        }

        let _guard = self.ctx.locks.acquire(&listener.subsystem_nqn).await;
        let key = listener_key(&listener);

        let snapshot = self.snapshot().await?;
        if snapshot
            .get(&StateKey::Subsystem {
                nqn: listener.subsystem_nqn.clone(),
            })
            .is_none()
        {
            return Err(GwError::not_found(format!(
                "subsystem {} does not exist",
                listener.subsystem_nqn
            )));
        }
        if snapshot.get(&key).is_some() {
            return Err(GwError::already_exists(format!(
                "listener {}:{} already exists on {}",
                listener.traddr, listener.trsvcid, listener.subsystem_nqn
            )));
        }

        // Gateway-local mutation: engine first.
        let mut tgt = self.ctx.tgt.lock().await;
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
            Ok(()) => {}
            Err(e) if e.code == Some(-17) => {}
            Err(e) => {
                warn!(nqn = %listener.subsystem_nqn, error = %e, "engine add_listener failed");
                return Err(e.into());
            }
        }
        drop(tgt);

        let payload = serde_json::to_vec(&listener)
            .map_err(|e| GwError::internal(format!("listener encode failed: {e}")))?;
        let mut last_err: Option<GwError> = None;
        for attempt in 0..CAS_ATTEMPTS {
            match statemap::cas(
                self.ctx.map.as_ref(),
                self.ctx.gateway_name(),
                key.clone(),
                None,
                payload.clone(),
            )
            .await
            {
                Ok(_) => {
                    last_err = None;
                    break;
                }
                Err(e) if e.is_conflict() && attempt + 1 < CAS_ATTEMPTS => {
                    tokio::time::sleep(cas_jitter()).await;
                }
                Err(e) => {
                    last_err = Some(store_err(e));
                    break;
                }
            }
        }
        if let Some(err) = last_err {
            // Drop the local engine change before surfacing the conflict.
            let mut tgt = self.ctx.tgt.lock().await;
            if let Err(e) = tgt
                .remove_listener(
                    &listener.subsystem_nqn,
                    listener.transport.as_str(),
                    listener.adrfam.as_str(),
                    &listener.traddr,
                    listener.trsvcid,
                )
                .await
            {
                warn!(nqn = %listener.subsystem_nqn, error = %e, "listener rollback failed");
                self.ctx.health.mark_degraded();
            }
            return Err(err);
        }

        info!(
            nqn = %listener.subsystem_nqn,
            traddr = %listener.traddr,
            trsvcid = listener.trsvcid,
            secure = listener.secure,
            "listener created"
        );
        Ok(listener)
    }

    /// Deletes a listener. Deleting one that was never realized locally
    /// (or is already gone) is a no-op; the state-map record is removed
    /// either way so peers converge.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` on malformed identifiers, state-map failures.
    pub async fn listener_del(&self, listener: &Listener) -> GwResult<()> {
        nqn::validate_nqn(&listener.subsystem_nqn)?;
        let _guard = self.ctx.locks.acquire(&listener.subsystem_nqn).await;
        let key = listener_key(listener);

        if listener.gateway == self.ctx.identity.name {
            let mut tgt = self.ctx.tgt.lock().await;
            match tgt
                .remove_listener(
                    &listener.subsystem_nqn,
                    listener.transport.as_str(),
                    listener.adrfam.as_str(),
                    &listener.traddr,
                    listener.trsvcid,
                )
                .await
            {
                Ok(()) => {}
                // Never realized here; deletion is idempotent.
                Err(e) if e.code == Some(-2) => {}
                Err(e) => {
                    warn!(nqn = %listener.subsystem_nqn, error = %e, "engine remove_listener failed");
                    self.ctx.health.mark_degraded();
                    return Err(e.into());
                }
            }
        }

        for attempt in 0..CAS_ATTEMPTS {
            let snapshot = self.snapshot().await?;
            let Some(record) = snapshot.get(&key) else {
                return Ok(());
            };
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

        info!(
            nqn = %listener.subsystem_nqn,
            traddr = %listener.traddr,
            trsvcid = listener.trsvcid,
            "listener deleted"
        );
        Ok(())
    }
}
