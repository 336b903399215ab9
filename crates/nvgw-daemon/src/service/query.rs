//! Read-side operations and log-level control.

use nvgw_core::error::GwResult;
use nvgw_core::model::{AnaGroupId, ConnectionInfo, ANY_HOST};
use nvgw_core::nqn;
use nvgw_core::statemap::StateKey;
use tracing::info;

use super::GatewayService;
use crate::tgt::TgtSubsystem;

/// Gateway identity and runtime facts, the `gateway_info` payload.
#[derive(Debug, Clone)]
pub struct GatewayInfo {
    /// Gateway name.
    pub name: String,
    /// Gateway group.
    pub group: String,
    /// Daemon version.
    pub version: String,
    /// Admin address.
    pub addr: String,
    /// Admin port.
    pub port: u16,
    /// Groups currently served as optimized.
    pub optimized_groups: Vec<AnaGroupId>,
}

impl GatewayService {
    /// Engine-reported subsystem snapshot, taken under the engine lock
    /// so it is never torn against a concurrent mutation.
    ///
    /// # Errors
    ///
    /// Engine errors mapped to canonical kinds.
    pub async fn get_subsystems(&self) -> GwResult<Vec<TgtSubsystem>> {
        let mut tgt = self.ctx.tgt.lock().await;
        let subsystems = tgt.get_subsystems().await?;
        Ok(subsystems)
    }

    /// Controller connections joined with the host ACL: one row per
    /// allowed host, including a disconnected row for every allowed host
    /// without a live controller.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` on a bad NQN, engine and state-map failures.
    pub async fn connection_list(&self, nqn_str: &str) -> GwResult<Vec<ConnectionInfo>> {
        nqn::validate_nqn(nqn_str)?;
        let snapshot = self.snapshot().await?;

        let mut allowed: Vec<String> = Vec::new();
        for (key, _) in snapshot.subsystem_keys(nqn_str) {
            if let StateKey::Host { host_nqn, .. } = key {
                if host_nqn != ANY_HOST {
                    allowed.push(host_nqn.clone());
                }
            }
        }

        let mut tgt = self.ctx.tgt.lock().await;
        let controllers = tgt.get_connections(nqn_str).await?;
        drop(tgt);

        let mut rows: Vec<ConnectionInfo> = controllers
            .iter()
            .map(|c| ConnectionInfo {
                host_nqn: c.hostnqn.clone(),
                traddr: c.traddr.clone(),
                trsvcid: c.trsvcid.parse().unwrap_or(0),
                qpair_count: c.num_io_qpairs,
                controller_id: c.cntlid,
                secure: c.secure,
                use_psk: c.use_psk,
                use_dhchap: c.use_dhchap,
                connected: true,
            })
            .collect();

        for host in allowed {
            if !rows.iter().any(|r| r.host_nqn == host) {
                rows.push(ConnectionInfo {
                    host_nqn: host,
                    traddr: String::new(),
                    trsvcid: 0,
                    qpair_count: 0,
                    controller_id: 0,
                    secure: false,
                    use_psk: false,
                    use_dhchap: false,
                    connected: false,
                });
            }
        }
        rows.sort_by(|a, b| a.host_nqn.cmp(&b.host_nqn));
        Ok(rows)
    }

    /// Identity and runtime facts of this gateway.
    pub async fn gateway_info(&self) -> GatewayInfo {
        GatewayInfo {
            name: self.ctx.identity.name.clone(),
            group: self.ctx.identity.group.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            addr: self.ctx.identity.node_addr.clone(),
            port: self.ctx.identity.grpc_port,
            optimized_groups: self.ctx.optimized_groups().await,
        }
    }

    /// Changes the gateway's own log level at runtime.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an unparseable level.
    pub fn set_log_level(&self, level: &str) -> GwResult<()> {
        self.ctx.log.set_level(level)?;
        info!(level, "gateway log level changed");
        Ok(())
    }

    /// Changes the engine's log level.
    ///
    /// # Errors
    ///
    /// Engine errors mapped to canonical kinds.
    pub async fn set_tgt_log_level(&self, level: &str) -> GwResult<()> {
        let mut tgt = self.ctx.tgt.lock().await;
        tgt.set_log_level(level).await?;
        drop(tgt);
        info!(level, "engine log level changed");
        Ok(())
    }
}
