//! Domain model for the gateway control plane.
//!
//! These are the internal types the service layer operates on. Wire
//! messages (protobuf-shaped) are translated into them at the protocol
//! edge and never leak further in. All entities serialize to JSON for
//! state-map payloads.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::{GwError, GwResult};
use crate::nqn;

/// Host NQN wildcard granting any host access to a subsystem.
pub const ANY_HOST: &str = "*";

/// Default maximum namespaces per subsystem.
pub const DEFAULT_MAX_NAMESPACES: u32 = 256;

/// Default namespace block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// ANA group identifier. Group 0 is never assigned; ids are allocated by
/// the clustered controller starting at 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct AnaGroupId(pub u32);

impl fmt::Display for AnaGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Asymmetric namespace access state advertised per (listener, group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnaState {
    /// This gateway is the active server for the group.
    Optimized,
    /// Another gateway serves the group; hosts must not use this path.
    Inaccessible,
}

impl AnaState {
    /// Engine wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Optimized => "optimized",
            Self::Inaccessible => "inaccessible",
        }
    }
}

/// Fabric transport type. Only TCP is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// NVMe/TCP.
    #[default]
    Tcp,
}

impl Transport {
    /// Parses the wire spelling, case-insensitively.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for anything other than `tcp`.
    pub fn parse(value: &str) -> GwResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            other => Err(GwError::invalid_argument(format!(
                "unsupported transport type \"{other}\""
            ))),
        }
    }

    /// Wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
        }
    }
}

/// Address family of a listener address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddrFamily {
    /// IPv4.
    Ipv4,
    /// IPv6.
    Ipv6,
}

impl AddrFamily {
    /// Parses the wire spelling (`ipv4`/`ipv6`), case-insensitively.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for unknown families.
    pub fn parse(value: &str) -> GwResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "ipv4" => Ok(Self::Ipv4),
            "ipv6" => Ok(Self::Ipv6),
            other => Err(GwError::invalid_argument(format!(
                "unsupported address family \"{other}\""
            ))),
        }
    }

    /// Wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ipv4 => "ipv4",
            Self::Ipv6 => "ipv6",
        }
    }
}

/// Identity of one running gateway instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayIdentity {
    /// Gateway name, unique within the group.
    pub name: String,
    /// Gateway group.
    pub group: String,
    /// Node address the gateway serves from.
    pub node_addr: String,
    /// Admin API port.
    pub grpc_port: u16,
    /// NVMe/TCP I/O port.
    pub io_port: u16,
    /// Discovery service port.
    pub discovery_port: u16,
}

/// An NVMe subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subsystem {
    /// Subsystem NQN, unique across the cluster.
    pub nqn: String,
    /// Serial number; generated when the request omits one.
    pub serial: String,
    /// Maximum namespace count.
    pub max_namespaces: u32,
    /// Whether any host may connect (wildcard ACL).
    pub allow_any_host: bool,
    /// Created without appending the gateway group to the serial.
    pub no_group_append: bool,
}

impl Subsystem {
    /// Validates a subsystem creation request.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` on a malformed or discovery NQN, or a zero
    /// namespace limit.
    pub fn validate(&self) -> GwResult<()> {
        nqn::validate_nqn(&self.nqn)?;
        if nqn::is_discovery_nqn(&self.nqn) {
            return Err(GwError::invalid_argument(format!(
                "can't create a discovery subsystem \"{}\"",
                self.nqn
            )));
        }
        if self.max_namespaces == 0 {
            return Err(GwError::invalid_argument(
                "max-namespaces must be at least 1",
            ));
        }
        Ok(())
    }
}

/// A namespace inside a subsystem, backed by a block image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    /// Owning subsystem NQN.
    pub subsystem_nqn: String,
    /// Namespace id, 1-based and stable for the namespace lifetime.
    pub nsid: u32,
    /// Pool holding the backing image.
    pub pool: String,
    /// Backing image name.
    pub image: String,
    /// Image size in bytes.
    pub size_bytes: u64,
    /// Block size in bytes.
    pub block_size: u32,
    /// Stable namespace UUID, identical on every gateway.
    pub uuid: String,
    /// Load-balancing (ANA) group the namespace belongs to.
    pub lb_group: AnaGroupId,
    /// Visible to all allowed hosts without per-host grants.
    pub auto_visible: bool,
    /// Hosts granted visibility when `auto_visible` is false.
    #[serde(default)]
    pub visible_hosts: BTreeSet<String>,
}

impl Namespace {
    /// Validates a namespace creation request against static constraints.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` on empty pool/image, zero size, a bad block size
    /// or a malformed UUID.
    pub fn validate(&self) -> GwResult<()> {
        if self.pool.is_empty() {
            return Err(GwError::invalid_argument("pool name can't be empty"));
        }
        if self.image.is_empty() {
            return Err(GwError::invalid_argument("image name can't be empty"));
        }
        if self.nsid == 0 {
            return Err(GwError::invalid_argument("nsid must be at least 1"));
        }
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(GwError::invalid_argument(format!(
                "block size {} must be a positive power of two",
                self.block_size
            )));
        }
        if !nqn::is_valid_uuid(&self.uuid) {
            return Err(GwError::invalid_argument(format!(
                "invalid UUID \"{}\"",
                self.uuid
            )));
        }
        Ok(())
    }
}

/// A subsystem listener endpoint owned by one gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    /// Subsystem NQN the listener serves.
    pub subsystem_nqn: String,
    /// Owning gateway hostname; only that gateway realizes the listener.
    pub gateway: String,
    /// Transport type.
    pub transport: Transport,
    /// Address family.
    pub adrfam: AddrFamily,
    /// Transport address.
    pub traddr: String,
    /// Transport service id (port).
    pub trsvcid: u16,
    /// Require a secure channel (TLS/PSK) on this listener.
    pub secure: bool,
}

impl Listener {
    /// Validates the listener request: address parses and agrees with the
    /// declared family, and the port is non-zero.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` on mismatch.
    pub fn validate(&self) -> GwResult<()> {
        if self.trsvcid == 0 {
            return Err(GwError::invalid_argument("trsvcid must be non-zero"));
        }
        let addr: IpAddr = self
            .traddr
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|_| {
                GwError::invalid_argument(format!("invalid traddr \"{}\"", self.traddr))
            })?;
        let family_ok = match self.adrfam {
            AddrFamily::Ipv4 => addr.is_ipv4(),
            AddrFamily::Ipv6 => addr.is_ipv6(),
        };
        if !family_ok {
            return Err(GwError::invalid_argument(format!(
                "traddr \"{}\" does not match address family {}",
                self.traddr,
                self.adrfam.as_str()
            )));
        }
        Ok(())
    }
}

/// Host access grant on a subsystem. `host_nqn == "*"` is the wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAccess {
    /// Subsystem NQN.
    pub subsystem_nqn: String,
    /// Host NQN or `"*"`.
    pub host_nqn: String,
    /// PSK key name, when TLS-PSK is configured for this host.
    #[serde(default)]
    pub psk_key: Option<String>,
    /// DH-HMAC-CHAP host key name.
    #[serde(default)]
    pub dhchap_key: Option<String>,
    /// DH-HMAC-CHAP controller key name (bidirectional auth).
    #[serde(default)]
    pub dhchap_ctrlr_key: Option<String>,
}

impl HostAccess {
    /// True when this grant is the wildcard entry.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.host_nqn == ANY_HOST
    }

    /// Validates the grant: host NQN grammar (unless wildcard) and the
    /// wildcard-with-keys combination.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` on a malformed host NQN or keys on the wildcard.
    pub fn validate(&self) -> GwResult<()> {
        if self.is_wildcard() {
            if self.psk_key.is_some() || self.dhchap_key.is_some() {
                return Err(GwError::invalid_argument(
                    "can't configure keys for the wildcard host",
                ));
            }
            return Ok(());
        }
        nqn::validate_nqn(&self.host_nqn)?;
        if self.dhchap_ctrlr_key.is_some() && self.dhchap_key.is_none() {
            return Err(GwError::invalid_argument(
                "controller DH-CHAP key requires a host DH-CHAP key",
            ));
        }
        Ok(())
    }
}

/// ANA group assignment for one gateway: the set of groups it serves as
/// optimized. Groups absent from every live assignment are inaccessible
/// everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AnaAssignment {
    /// Gateway name.
    pub gateway: String,
    /// Groups this gateway serves as optimized.
    pub optimized: BTreeSet<AnaGroupId>,
}

/// One live controller connection reported by the engine, joined with the
/// host ACL for `connection_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Host NQN.
    pub host_nqn: String,
    /// Remote address, empty when disconnected.
    pub traddr: String,
    /// Remote port, zero when disconnected.
    pub trsvcid: u16,
    /// Number of queue pairs.
    pub qpair_count: u32,
    /// Controller id, zero when disconnected.
    pub controller_id: u32,
    /// Connection uses a secure channel.
    pub secure: bool,
    /// Connection authenticated with a PSK.
    pub use_psk: bool,
    /// Connection authenticated with DH-CHAP.
    pub use_dhchap: bool,
    /// Whether the host is currently connected.
    pub connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subsystem(nqn: &str) -> Subsystem {
        Subsystem {
            nqn: nqn.to_string(),
            serial: "Ceph1".to_string(),
            max_namespaces: DEFAULT_MAX_NAMESPACES,
            allow_any_host: false,
            no_group_append: false,
        }
    }

    #[test]
    fn subsystem_validation() {
        subsystem("nqn.2016-06.io.spdk:cnode1").validate().unwrap();
        assert!(subsystem("not-an-nqn").validate().is_err());
        assert!(subsystem(crate::nqn::DISCOVERY_NQN).validate().is_err());
        let mut s = subsystem("nqn.2016-06.io.spdk:cnode1");
        s.max_namespaces = 0;
        assert!(s.validate().is_err());
    }

    fn namespace() -> Namespace {
        Namespace {
            subsystem_nqn: "nqn.2016-06.io.spdk:cnode1".to_string(),
            nsid: 1,
            pool: "rbd".to_string(),
            image: "demo_image".to_string(),
            size_bytes: 10 * 1024 * 1024,
            block_size: DEFAULT_BLOCK_SIZE,
            uuid: "6a0c1f30-2f22-4a47-a811-4f5b6a1dbb1a".to_string(),
            lb_group: AnaGroupId(1),
            auto_visible: true,
            visible_hosts: BTreeSet::new(),
        }
    }

    #[test]
    fn namespace_validation() {
        namespace().validate().unwrap();

        let mut ns = namespace();
        ns.pool.clear();
        assert!(ns.validate().is_err());

        let mut ns = namespace();
        ns.block_size = 100;
        assert!(ns.validate().is_err());

        let mut ns = namespace();
        ns.uuid = "nope".to_string();
        assert!(ns.validate().is_err());
    }

    fn listener(traddr: &str, adrfam: AddrFamily) -> Listener {
        Listener {
            subsystem_nqn: "nqn.2016-06.io.spdk:cnode1".to_string(),
            gateway: "gw-1".to_string(),
            transport: Transport::Tcp,
            adrfam,
            traddr: traddr.to_string(),
            trsvcid: 4420,
            secure: false,
        }
    }

    #[test]
    fn listener_family_agreement() {
        listener("192.168.13.3", AddrFamily::Ipv4).validate().unwrap();
        listener("fd00::17", AddrFamily::Ipv6).validate().unwrap();
        assert!(listener("192.168.13.3", AddrFamily::Ipv6).validate().is_err());
        assert!(listener("fd00::17", AddrFamily::Ipv4).validate().is_err());
        assert!(listener("not-an-ip", AddrFamily::Ipv4).validate().is_err());
    }

    #[test]
    fn wildcard_host_rejects_keys() {
        let host = HostAccess {
            subsystem_nqn: "nqn.2016-06.io.spdk:cnode1".to_string(),
            host_nqn: ANY_HOST.to_string(),
            psk_key: Some("psk_cnode1_hostA".to_string()),
            dhchap_key: None,
            dhchap_ctrlr_key: None,
        };
        assert!(host.validate().is_err());
    }

    #[test]
    fn ctrlr_key_requires_host_key() {
        let host = HostAccess {
            subsystem_nqn: "nqn.2016-06.io.spdk:cnode1".to_string(),
            host_nqn: "nqn.2016-06.io.spdk:host1".to_string(),
            psk_key: None,
            dhchap_key: None,
            dhchap_ctrlr_key: Some("k".to_string()),
        };
        assert!(host.validate().is_err());
    }

    #[test]
    fn transport_and_family_parse() {
        assert_eq!(Transport::parse("TCP").unwrap(), Transport::Tcp);
        assert!(Transport::parse("rdma").is_err());
        assert_eq!(AddrFamily::parse("IPV4").unwrap(), AddrFamily::Ipv4);
        assert_eq!(AddrFamily::parse("ipv6").unwrap(), AddrFamily::Ipv6);
        assert!(AddrFamily::parse("ib").is_err());
    }
}
