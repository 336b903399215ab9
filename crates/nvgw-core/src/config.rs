//! Gateway configuration.
//!
//! The configuration surface is an INI file with `[gateway]`, `[ceph]`,
//! `[mtls]`, `[spdk]` and `[discovery]` sections. This module parses the
//! file once and exposes typed section views with defaults; command-line
//! flags override file values at the daemon edge, not here.

use std::path::Path;
use std::time::Duration;

use ini::Ini;

use crate::error::{GwError, GwResult};

/// Default admin (gRPC-shaped) port.
pub const DEFAULT_GATEWAY_PORT: u16 = 5500;
/// Default NVMe/TCP I/O port advertised for listeners.
pub const DEFAULT_IO_PORT: u16 = 4420;
/// Default discovery service port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 8009;
/// Default Prometheus exporter port.
pub const DEFAULT_PROMETHEUS_PORT: u16 = 10008;

/// Parsed gateway configuration file.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    ini: Ini,
}

impl GatewayConfig {
    /// Loads the configuration from `path`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> GwResult<Self> {
        let path = path.as_ref();
        let ini = Ini::load_from_file(path).map_err(|e| {
            GwError::invalid_argument(format!(
                "failed to load config file {}: {e}",
                path.display()
            ))
        })?;
        Ok(Self { ini })
    }

    /// Parses configuration from a string. Test and embedding hook.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` on malformed INI text.
    pub fn from_text(text: &str) -> GwResult<Self> {
        let ini = Ini::load_from_str(text)
            .map_err(|e| GwError::invalid_argument(format!("failed to parse config: {e}")))?;
        Ok(Self { ini })
    }

    /// Empty configuration; every accessor returns its default.
    #[must_use]
    pub fn empty() -> Self {
        Self { ini: Ini::new() }
    }

    fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.ini
            .section(Some(section))
            .and_then(|s| s.get(key))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    fn get_or(&self, section: &str, key: &str, default: &str) -> String {
        self.get(section, key).unwrap_or(default).to_string()
    }

    fn get_bool_or(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get(section, key) {
            Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
            None => default,
        }
    }

    fn get_u16_or(&self, section: &str, key: &str, default: u16) -> u16 {
        self.get(section, key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn get_u32_or(&self, section: &str, key: &str, default: u32) -> u32 {
        self.get(section, key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn get_f64_or(&self, section: &str, key: &str, default: f64) -> f64 {
        self.get(section, key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// `[gateway]` section view.
    #[must_use]
    pub fn gateway(&self) -> GatewaySection {
        GatewaySection {
            name: self.get("gateway", "name").map(str::to_string),
            group: self.get_or("gateway", "group", ""),
            addr: self.get_or("gateway", "addr", "0.0.0.0"),
            port: self.get_u16_or("gateway", "port", DEFAULT_GATEWAY_PORT),
            io_port: self.get_u16_or("gateway", "io_port", DEFAULT_IO_PORT),
            enable_auth: self.get_bool_or("gateway", "enable_auth", false),
            enable_prometheus_exporter: self.get_bool_or(
                "gateway",
                "enable_prometheus_exporter",
                false,
            ),
            prometheus_port: self.get_u16_or("gateway", "prometheus_port", DEFAULT_PROMETHEUS_PORT),
            encryption_key: self.get("gateway", "encryption_key").map(str::to_string),
            ana_groups: self.get_u32_or("gateway", "ana_groups", 1),
        }
    }

    /// `[ceph]` section view.
    #[must_use]
    pub fn ceph(&self) -> CephSection {
        CephSection {
            pool: self.get_or("ceph", "pool", "rbd"),
            config_file: self.get_or("ceph", "config_file", "/etc/ceph/ceph.conf"),
        }
    }

    /// `[spdk]` section view.
    #[must_use]
    pub fn spdk(&self) -> SpdkSection {
        SpdkSection {
            rpc_socket: self.get_or("spdk", "rpc_socket", "/var/tmp/spdk.sock"),
            timeout: Duration::from_secs_f64(self.get_f64_or("spdk", "timeout", 60.0)),
            log_level: self.get_or("spdk", "log_level", "WARN"),
            conn_retries: self.get_u32_or("spdk", "conn_retries", 3),
            tgt_cmd_extra_args: self.get_or("spdk", "tgt_cmd_extra_args", ""),
            transports: self.get_or("spdk", "transports", "tcp"),
            transport_tcp_options: self.get("spdk", "transport_tcp_options").map(str::to_string),
        }
    }

    /// `[mtls]` section view.
    #[must_use]
    pub fn mtls(&self) -> MtlsSection {
        MtlsSection {
            server_key: self.get_or("mtls", "server_key", "./server.key"),
            client_key: self.get_or("mtls", "client_key", "./client.key"),
            server_cert: self.get_or("mtls", "server_cert", "./server.crt"),
            client_cert: self.get_or("mtls", "client_cert", "./client.crt"),
        }
    }

    /// `[discovery]` section view.
    #[must_use]
    pub fn discovery(&self) -> DiscoverySection {
        DiscoverySection {
            addr: self.get_or("discovery", "addr", "0.0.0.0"),
            port: self.get_u16_or("discovery", "port", DEFAULT_DISCOVERY_PORT),
        }
    }

    /// Name of the well-known state-map object for this gateway group.
    #[must_use]
    pub fn state_object_name(&self) -> String {
        let group = self.gateway().group;
        if group.is_empty() {
            "nvme.config".to_string()
        } else {
            format!("nvme.{group}.config")
        }
    }
}

/// `[gateway]` options.
#[derive(Debug, Clone)]
pub struct GatewaySection {
    /// Gateway name; when absent the daemon falls back to the hostname.
    pub name: Option<String>,
    /// Gateway group; scopes the state-map object name.
    pub group: String,
    /// Admin listen address.
    pub addr: String,
    /// Admin listen port.
    pub port: u16,
    /// NVMe/TCP I/O port used when a listener omits one.
    pub io_port: u16,
    /// Require mutual TLS on the admin port.
    pub enable_auth: bool,
    /// Start the read-only Prometheus exporter.
    pub enable_prometheus_exporter: bool,
    /// Prometheus exporter port.
    pub prometheus_port: u16,
    /// Path of the group secret used to seal key payloads; when absent
    /// the secret is derived from the group name (development only).
    pub encryption_key: Option<String>,
    /// ANA group count handed to the embedded controller.
    pub ana_groups: u32,
}

/// `[ceph]` options.
#[derive(Debug, Clone)]
pub struct CephSection {
    /// Pool holding the state-map object and the block images.
    pub pool: String,
    /// Cluster configuration file handed to the store client library.
    pub config_file: String,
}

/// `[spdk]` options.
#[derive(Debug, Clone)]
pub struct SpdkSection {
    /// Path of the engine's JSON-RPC Unix socket.
    pub rpc_socket: String,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Engine log level handed to `log_set_level`.
    pub log_level: String,
    /// Connect retries before the engine is declared unreachable.
    pub conn_retries: u32,
    /// Extra arguments appended to the engine command line.
    pub tgt_cmd_extra_args: String,
    /// Whitespace-separated transport types to create at startup.
    pub transports: String,
    /// JSON object merged into the tcp transport creation arguments.
    pub transport_tcp_options: Option<String>,
}

/// `[mtls]` options.
#[derive(Debug, Clone)]
pub struct MtlsSection {
    /// Server private key path.
    pub server_key: String,
    /// Client private key path (used by the CLI).
    pub client_key: String,
    /// Server certificate path.
    pub server_cert: String,
    /// Client certificate path; the server requires this CA for peers.
    pub client_cert: String,
}

/// `[discovery]` options.
#[derive(Debug, Clone)]
pub struct DiscoverySection {
    /// Discovery listen address.
    pub addr: String,
    /// Discovery listen port.
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[gateway]
name = gw-1
group = alpha
addr = 192.168.13.3
port = 5500
enable_auth = true
enable_prometheus_exporter = yes
prometheus_port = 10009

[ceph]
pool = rbd
config_file = /etc/ceph/ceph.conf

[spdk]
rpc_socket = /var/tmp/spdk.sock
timeout = 30.0
conn_retries = 5
transports = tcp
transport_tcp_options = {"in_capsule_data_size": 8192}

[mtls]
server_key = /etc/nvgw/server.key
server_cert = /etc/nvgw/server.crt
client_cert = /etc/nvgw/client.crt

[discovery]
port = 8010
"#;

    #[test]
    fn parses_all_sections() {
        let cfg = GatewayConfig::from_text(SAMPLE).unwrap();
        let gw = cfg.gateway();
        assert_eq!(gw.name.as_deref(), Some("gw-1"));
        assert_eq!(gw.group, "alpha");
        assert_eq!(gw.addr, "192.168.13.3");
        assert_eq!(gw.port, 5500);
        assert!(gw.enable_auth);
        assert!(gw.enable_prometheus_exporter);
        assert_eq!(gw.prometheus_port, 10009);

        let spdk = cfg.spdk();
        assert_eq!(spdk.timeout, Duration::from_secs(30));
        assert_eq!(spdk.conn_retries, 5);
        assert!(spdk.transport_tcp_options.is_some());

        assert_eq!(cfg.discovery().port, 8010);
        assert_eq!(cfg.state_object_name(), "nvme.alpha.config");
    }

    #[test]
    fn defaults_apply_when_absent() {
        let cfg = GatewayConfig::empty();
        let gw = cfg.gateway();
        assert_eq!(gw.name, None);
        assert_eq!(gw.port, DEFAULT_GATEWAY_PORT);
        assert!(!gw.enable_auth);
        assert_eq!(cfg.spdk().conn_retries, 3);
        assert_eq!(cfg.spdk().timeout, Duration::from_secs(60));
        assert_eq!(cfg.ceph().pool, "rbd");
        assert_eq!(cfg.state_object_name(), "nvme.config");
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nvgw.conf");
        std::fs::write(&path, SAMPLE).unwrap();
        let cfg = GatewayConfig::load(&path).unwrap();
        assert_eq!(cfg.gateway().group, "alpha");
    }

    #[test]
    fn missing_file_is_invalid_argument() {
        let err = GatewayConfig::load("/nonexistent/nvgw.conf").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidArgument);
    }
}
