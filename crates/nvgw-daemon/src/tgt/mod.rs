//! Target-engine adapter.
//!
//! The NVMe-oF target engine is an external process reached over a
//! line-delimited JSON-RPC socket. This module owns the typed verb
//! surface ([`TgtApi`]), the socket client ([`rpc::JsonRpcTgt`]) and an
//! in-process engine ([`fake::FakeTgt`]) used by tests and local
//! development.
//!
//! The engine is single-threaded for command intake: there is exactly one
//! connection, one outstanding call at a time, and no pooling. Callers
//! serialize through the engine lock in [`crate::state::GatewayContext`];
//! the adapter additionally matches responses by monotonically increasing
//! request id so a timed-out call can never be confused with its
//! successor.

pub mod fake;
pub mod rpc;

use nvgw_core::error::{ErrorKind, GwError};
use nvgw_core::model::AnaState;
use serde::{Deserialize, Serialize};

pub use fake::{FakeHandle, FakeTgt};
pub use rpc::{JsonRpcTgt, RpcClientConfig};

/// Engine-reported namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TgtNamespace {
    /// Namespace id.
    pub nsid: u32,
    /// Backing block device name.
    pub bdev_name: String,
    /// Namespace UUID.
    pub uuid: String,
    /// ANA group id.
    pub anagrpid: u32,
}

/// Engine-reported listener address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TgtListenAddress {
    /// Transport type (`TCP`).
    pub trtype: String,
    /// Address family (`ipv4`/`ipv6`).
    pub adrfam: String,
    /// Transport address.
    pub traddr: String,
    /// Transport service id, as text per the engine convention.
    pub trsvcid: String,
    /// Secure-channel flag.
    #[serde(default)]
    pub secure: bool,
}

/// Engine-reported host grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TgtHost {
    /// Host NQN.
    pub nqn: String,
}

/// Engine-reported subsystem, the unit of [`TgtApi::get_subsystems`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TgtSubsystem {
    /// Subsystem NQN.
    pub nqn: String,
    /// Serial number.
    pub serial_number: String,
    /// Maximum namespaces.
    pub max_namespaces: u32,
    /// Wildcard host access.
    pub allow_any_host: bool,
    /// Explicit host grants.
    #[serde(default)]
    pub hosts: Vec<TgtHost>,
    /// Listener addresses.
    #[serde(default)]
    pub listen_addresses: Vec<TgtListenAddress>,
    /// Namespaces.
    #[serde(default)]
    pub namespaces: Vec<TgtNamespace>,
}

/// Engine-reported controller connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TgtConnection {
    /// Host NQN.
    pub hostnqn: String,
    /// Remote address.
    pub traddr: String,
    /// Remote port.
    pub trsvcid: String,
    /// Controller id.
    pub cntlid: u32,
    /// Number of I/O queue pairs.
    pub num_io_qpairs: u32,
    /// Secure channel in use.
    #[serde(default)]
    pub secure: bool,
    /// PSK authentication in use.
    #[serde(default)]
    pub use_psk: bool,
    /// DH-CHAP authentication in use.
    #[serde(default)]
    pub use_dhchap: bool,
}

/// Engine error: the JSON-RPC error code and message, plus a transport
/// flag for unreachable-engine conditions.
#[derive(Debug, Clone, thiserror::Error)]
#[error("engine error {code:?}: {message}")]
pub struct TgtError {
    /// JSON-RPC error code, absent for transport failures.
    pub code: Option<i32>,
    /// Engine-provided message.
    pub message: String,
    /// The engine socket is down and reconnect retries are exhausted.
    pub unreachable: bool,
}

impl TgtError {
    /// Transport-level failure (socket down, retries exhausted).
    #[must_use]
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            unreachable: true,
        }
    }

    /// Engine-level failure carrying a JSON-RPC error code.
    #[must_use]
    pub fn engine(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
            unreachable: false,
        }
    }

    /// The call's deadline elapsed before the engine answered.
    #[must_use]
    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            unreachable: false,
        }
    }
}

impl From<TgtError> for GwError {
    fn from(err: TgtError) -> Self {
        // The engine reports errnos negated, JSON-RPC protocol errors in
        // the -32xxx range.
        let kind = if err.unreachable {
            ErrorKind::Unavailable
        } else {
            match err.code {
                Some(-17) => ErrorKind::AlreadyExists,       // EEXIST
                Some(-2) => ErrorKind::NotFound,             // ENOENT
                Some(-22) | Some(-32602) => ErrorKind::InvalidArgument,
                Some(-28) => ErrorKind::ResourceExhausted,   // ENOSPC
                Some(-110) => ErrorKind::DeadlineExceeded,   // ETIMEDOUT
                _ => ErrorKind::Internal,
            }
        };
        let mut gw = GwError::new(kind, err.message);
        if let Some(code) = err.code {
            gw = gw.with_engine_code(code);
        }
        gw
    }
}

/// Result alias for engine calls.
pub type TgtResult<T> = Result<T, TgtError>;

/// Typed verb surface of the target engine, one method per engine RPC.
///
/// All mutations and snapshot reads are serialized by the engine lock in
/// the gateway context; implementations may assume exclusive access for
/// the duration of a call.
#[async_trait::async_trait]
pub trait TgtApi: Send {
    /// Creates a subsystem.
    async fn create_subsystem(
        &mut self,
        nqn: &str,
        serial: &str,
        max_namespaces: u32,
    ) -> TgtResult<()>;

    /// Deletes a subsystem and everything inside it.
    async fn delete_subsystem(&mut self, nqn: &str) -> TgtResult<()>;

    /// Creates a block device backed by `pool/image`; returns the bdev
    /// name.
    async fn create_bdev(
        &mut self,
        name: &str,
        pool: &str,
        image: &str,
        block_size: u32,
    ) -> TgtResult<String>;

    /// Deletes a block device.
    async fn delete_bdev(&mut self, name: &str) -> TgtResult<()>;

    /// Resizes a block device to `new_size_bytes`.
    async fn resize_bdev(&mut self, name: &str, new_size_bytes: u64) -> TgtResult<()>;

    /// Attaches a namespace; returns the assigned nsid.
    async fn add_namespace(
        &mut self,
        nqn: &str,
        bdev_name: &str,
        nsid: u32,
        uuid: &str,
        anagrpid: u32,
    ) -> TgtResult<u32>;

    /// Detaches a namespace.
    async fn remove_namespace(&mut self, nqn: &str, nsid: u32) -> TgtResult<()>;

    /// Moves a namespace to another ANA group.
    async fn set_namespace_ana_group(
        &mut self,
        nqn: &str,
        nsid: u32,
        anagrpid: u32,
    ) -> TgtResult<()>;

    /// Grants or revokes per-host namespace visibility.
    async fn set_namespace_visibility(
        &mut self,
        nqn: &str,
        nsid: u32,
        host_nqn: &str,
        visible: bool,
    ) -> TgtResult<()>;

    /// Adds a listener.
    async fn add_listener(
        &mut self,
        nqn: &str,
        trtype: &str,
        adrfam: &str,
        traddr: &str,
        trsvcid: u16,
        secure: bool,
    ) -> TgtResult<()>;

    /// Removes a listener.
    async fn remove_listener(
        &mut self,
        nqn: &str,
        trtype: &str,
        adrfam: &str,
        traddr: &str,
        trsvcid: u16,
    ) -> TgtResult<()>;

    /// Publishes the ANA state of `group` on every listener of `nqn`.
    async fn set_ana_state(
        &mut self,
        nqn: &str,
        group: u32,
        state: AnaState,
    ) -> TgtResult<()>;

    /// Grants a host access; key names refer to engine-keyring entries.
    async fn add_host(
        &mut self,
        nqn: &str,
        host_nqn: &str,
        psk_name: Option<&str>,
        dhchap_name: Option<&str>,
        dhchap_ctrlr_name: Option<&str>,
    ) -> TgtResult<()>;

    /// Revokes a host grant.
    async fn remove_host(&mut self, nqn: &str, host_nqn: &str) -> TgtResult<()>;

    /// Toggles wildcard host access.
    async fn allow_any_host(&mut self, nqn: &str, allow: bool) -> TgtResult<()>;

    /// Full subsystem snapshot.
    async fn get_subsystems(&mut self) -> TgtResult<Vec<TgtSubsystem>>;

    /// Live controller connections for a subsystem.
    async fn get_connections(&mut self, nqn: &str) -> TgtResult<Vec<TgtConnection>>;

    /// Registers a key file in the engine keyring.
    async fn keyring_add(&mut self, name: &str, path: &str) -> TgtResult<()>;

    /// Removes an engine keyring entry. Unknown names are a no-op.
    async fn keyring_remove(&mut self, name: &str) -> TgtResult<()>;

    /// Creates a fabric transport; `options` is a JSON object merged into
    /// the request.
    async fn create_transport(
        &mut self,
        trtype: &str,
        options: Option<&serde_json::Value>,
    ) -> TgtResult<()>;

    /// Sets the engine log level.
    async fn set_log_level(&mut self, level: &str) -> TgtResult<()>;

    /// Engine version string; doubles as the liveness probe.
    async fn version(&mut self) -> TgtResult<String>;
}

/// Shared, engine-locked adapter handle. One lock guards all mutations
/// and snapshot reads so no caller ever observes a torn engine view.
pub type SharedTgt = std::sync::Arc<tokio::sync::Mutex<Box<dyn TgtApi>>>;

/// Wraps an adapter into the shared engine-locked handle.
#[must_use]
pub fn share(api: impl TgtApi + 'static) -> SharedTgt {
    std::sync::Arc::new(tokio::sync::Mutex::new(Box::new(api)))
}
