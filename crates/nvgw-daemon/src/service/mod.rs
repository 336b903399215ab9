//! Gateway service: the control-plane operations behind the admin API.
//!
//! Every mutating operation follows the same contract:
//!
//! 1. Validate inputs against static constraints.
//! 2. Acquire the per-subsystem write lock (NQN-lexicographic order when
//!    two subsystems are involved).
//! 3. Read the affected records from the state map and verify
//!    preconditions.
//! 4. Gateway-local changes (a listener owned by this gateway) hit the
//!    engine first; everything else persists to the state map first.
//! 5. CAS with up to three attempts and 50–250 ms jitter; a conflict
//!    after the budget rolls back any local engine change and returns
//!    `Aborted`.
//! 6. Success returns the entity descriptor; failures return a canonical
//!    error, with the engine code attached where one exists.

pub mod host;
pub mod listener;
pub mod locks;
pub mod namespace;
pub mod query;
pub mod subsystem;

use std::sync::Arc;
use std::time::Duration;

use nvgw_core::error::{GwError, GwResult};
use nvgw_core::statemap::{Snapshot, StateMapError};
use rand::Rng;

use crate::state::SharedContext;

/// CAS attempts before a conflict surfaces as `Aborted`.
pub(crate) const CAS_ATTEMPTS: u32 = 3;

/// The gateway service. One instance per daemon, shared by every
/// connection handler.
#[derive(Debug, Clone)]
pub struct GatewayService {
    pub(crate) ctx: SharedContext,
}

impl GatewayService {
    /// Builds the service over the shared context.
    #[must_use]
    pub fn new(ctx: SharedContext) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    /// Shared context accessor for the wiring layer.
    #[must_use]
    pub fn context(&self) -> &SharedContext {
        &self.ctx
    }

    /// Reads an authoritative snapshot from the state map.
    pub(crate) async fn snapshot(&self) -> GwResult<Snapshot> {
        self.ctx.map.snapshot().await.map_err(store_err)
    }
}

/// Jitter applied between CAS attempts.
pub(crate) fn cas_jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(50..=250))
}

/// Maps a state-map failure onto the canonical error kinds.
pub(crate) fn store_err(err: StateMapError) -> GwError {
    match err {
        StateMapError::VersionConflict { key, .. } => {
            GwError::aborted(format!("concurrent update on {key}"))
        }
        StateMapError::LockHeld(owner) => {
            GwError::aborted(format!("cluster lock held by {owner}"))
        }
        StateMapError::Corrupt(message) => GwError::internal(message),
        StateMapError::Unavailable(message) => GwError::unavailable(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvgw_core::error::ErrorKind;

    #[test]
    fn jitter_stays_in_band() {
        for _ in 0..32 {
            let delay = cas_jitter();
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(250));
        }
    }

    #[test]
    fn conflict_maps_to_aborted() {
        let err = store_err(StateMapError::VersionConflict {
            key: "sub/nqn.2016-06.io.spdk:cnode1".to_string(),
            expected: Some(1),
            found: Some(2),
        });
        assert_eq!(err.kind, ErrorKind::Aborted);

        let err = store_err(StateMapError::Unavailable("down".to_string()));
        assert_eq!(err.kind, ErrorKind::Unavailable);
    }
}
