//! Shared harness for gateway integration tests.
//!
//! Builds whole gateways against the in-process engine and a shared
//! in-memory cluster map, so multi-gateway scenarios run in one test
//! process: every gateway has its own engine, keyring directory and
//! reconciler, and they converge through the map exactly like production
//! peers converge through the store.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use nvgw_core::keys::{KeyFiles, KeySealer};
use nvgw_core::model::GatewayIdentity;
use nvgw_core::statemap::MemoryClusterMap;
use nvgw_daemon::keyring::Keyring;
use nvgw_daemon::reconcile::Reconciler;
use nvgw_daemon::service::GatewayService;
use nvgw_daemon::state::{GatewayContext, LogControl, SharedContext};
use nvgw_daemon::tgt::{self, FakeHandle, FakeTgt};
use tempfile::TempDir;

/// Group secret shared by every test gateway.
pub const TEST_GROUP_SECRET: &[u8] = b"test-group-secret";

/// A ready subsystem NQN.
pub const CNODE1: &str = "nqn.2016-06.io.spdk:cnode1";

/// A second subsystem NQN.
pub const CNODE2: &str = "nqn.2016-06.io.spdk:cnode2";

/// A host NQN.
pub const HOST1: &str = "nqn.2016-06.io.spdk:host1";

/// A PSK in interchange format.
pub const PSK1: &str = "NVMeTLSkey-1:01:YzrPElk4OYy1uUqU8FXK64ybAg4HsCfzmOmldItqzT2pmiQp:";

/// One gateway instance under test.
pub struct TestGateway {
    /// The service under test.
    pub service: Arc<GatewayService>,
    /// Shared context (health flag, ana states, cache).
    pub ctx: SharedContext,
    /// Handle onto the fake engine state.
    pub engine: FakeHandle,
    /// Keyring base directory.
    pub keydir: TempDir,
}

impl TestGateway {
    /// Path layout helper for key-file assertions.
    #[must_use]
    pub fn key_files(&self) -> KeyFiles {
        KeyFiles::new(self.keydir.path())
    }
}

/// Identity for a named test gateway.
pub fn identity(name: &str) -> GatewayIdentity {
    GatewayIdentity {
        name: name.to_string(),
        group: String::new(),
        node_addr: "192.168.13.3".to_string(),
        grpc_port: 5500,
        io_port: 4420,
        discovery_port: 8009,
    }
}

/// Boots a gateway against `map`: startup reconciliation runs, then the
/// watch worker keeps it converged in the background.
pub async fn spawn_gateway(name: &str, map: &Arc<MemoryClusterMap>) -> TestGateway {
    let keydir = TempDir::new().expect("temp keyring dir");
    let fake = FakeTgt::new();
    let engine = fake.handle();
    let keyring = Keyring::new(
        KeyFiles::new(keydir.path()),
        KeySealer::new(TEST_GROUP_SECRET),
    );
    let ctx = GatewayContext::new(
        identity(name),
        Arc::clone(map) as Arc<dyn nvgw_core::statemap::ClusterMap>,
        tgt::share(fake),
        keyring,
        LogControl::disabled(),
    );
    let reconciler = Reconciler::new(ctx.clone());
    let watch = reconciler.subscribe().await.expect("watch subscription");
    reconciler
        .reconcile_startup()
        .await
        .expect("startup reconciliation");
    tokio::spawn(reconciler.run_with(watch));
    let service = GatewayService::new(ctx.clone());
    TestGateway {
        service,
        ctx,
        engine,
        keydir,
    }
}

/// Polls `predicate` until it holds or three seconds pass.
pub async fn wait_until<F>(what: &str, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if predicate() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
