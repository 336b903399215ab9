//! Shared gateway state.
//!
//! [`GatewayContext`] is the injected context value carrying typed
//! handles to every external seam: the engine adapter (behind the engine
//! lock), the cluster map, the keyring, the health flag and the log
//! control. Handlers, the reconciler, the ANA machine and the discovery
//! responder all receive an `Arc<GatewayContext>`; there are no globals.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nvgw_core::error::{GwError, GwResult};
use nvgw_core::health::HealthFlag;
use nvgw_core::model::{AnaGroupId, AnaState, GatewayIdentity};
use nvgw_core::statemap::{ClusterMap, Snapshot};
use tokio::sync::RwLock;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::keyring::Keyring;
use crate::service::locks::SubsystemLocks;
use crate::tgt::SharedTgt;

/// Handle for changing the gateway log level at runtime.
pub struct LogControl {
    handle: Option<reload::Handle<EnvFilter, Registry>>,
}

impl std::fmt::Debug for LogControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogControl")
            .field("enabled", &self.handle.is_some())
            .finish()
    }
}

impl LogControl {
    /// Control wired to a reloadable filter layer.
    #[must_use]
    pub fn new(handle: reload::Handle<EnvFilter, Registry>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Control for contexts without a global subscriber (tests).
    #[must_use]
    pub fn disabled() -> Self {
        Self { handle: None }
    }

    /// Applies a new level filter.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an unparseable directive, `Internal` when
    /// the subscriber rejects the reload.
    pub fn set_level(&self, level: &str) -> GwResult<()> {
        let filter = EnvFilter::try_new(level)
            .map_err(|e| GwError::invalid_argument(format!("bad log level \"{level}\": {e}")))?;
        if let Some(handle) = &self.handle {
            handle
                .reload(filter)
                .map_err(|e| GwError::internal(format!("log level reload failed: {e}")))?;
        }
        Ok(())
    }
}

/// Shared state for one gateway instance.
pub struct GatewayContext {
    /// This gateway's identity.
    pub identity: GatewayIdentity,
    /// Cluster state map client.
    pub map: Arc<dyn ClusterMap>,
    /// Engine adapter behind the engine lock.
    pub tgt: SharedTgt,
    /// Keyring manager.
    pub keyring: Keyring,
    /// Health flag driven by the reconciler, read by the monitor.
    pub health: Arc<HealthFlag>,
    /// Per-subsystem lock table.
    pub locks: SubsystemLocks,
    /// Cached state-map snapshot; refreshed only on confirmed map
    /// notifications (and at startup).
    pub cache: RwLock<Snapshot>,
    /// ANA states this gateway currently publishes, per group.
    pub ana_states: RwLock<BTreeMap<AnaGroupId, AnaState>>,
    /// Runtime log-level control.
    pub log: LogControl,
    /// Set once shutdown has been requested.
    shutdown: AtomicBool,
}

impl std::fmt::Debug for GatewayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayContext")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl GatewayContext {
    /// Assembles the context.
    #[must_use]
    pub fn new(
        identity: GatewayIdentity,
        map: Arc<dyn ClusterMap>,
        tgt: SharedTgt,
        keyring: Keyring,
        log: LogControl,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            map,
            tgt,
            keyring,
            health: HealthFlag::new(),
            locks: SubsystemLocks::default(),
            cache: RwLock::new(Snapshot::default()),
            ana_states: RwLock::new(BTreeMap::new()),
            log,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Name of this gateway; the `writer` field of every map mutation.
    #[must_use]
    pub fn gateway_name(&self) -> &str {
        &self.identity.name
    }

    /// Requests shutdown; checked by the accept loops and workers.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Replaces the cached snapshot after a confirmed notification.
    pub async fn update_cache(&self, snapshot: Snapshot) {
        *self.cache.write().await = snapshot;
    }

    /// Groups this gateway currently serves as optimized, sorted.
    pub async fn optimized_groups(&self) -> Vec<AnaGroupId> {
        self.ana_states
            .read()
            .await
            .iter()
            .filter(|(_, state)| **state == AnaState::Optimized)
            .map(|(group, _)| *group)
            .collect()
    }
}

/// Shared context alias used across the daemon.
pub type SharedContext = Arc<GatewayContext>;
