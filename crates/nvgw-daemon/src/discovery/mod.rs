//! Discovery responder.
//!
//! Serves NVMe/TCP discovery on the discovery port: hosts connect to the
//! well-known discovery NQN, identify the controller, and fetch the
//! discovery log page. Each log entry is one (subsystem, listener) pair
//! from the state-map snapshot, filtered by the probing host's ACL. The
//! responder is read-only: it never touches the engine.

pub mod pdu;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use nvgw_core::error::{GwError, GwResult};
use nvgw_core::model::{Listener, Subsystem, ANY_HOST};
use nvgw_core::nqn::DISCOVERY_NQN;
use nvgw_core::statemap::{Snapshot, StateKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::state::SharedContext;
use self::pdu::{
    c2h_data, capsule_resp, fctype, icresp, opcode, put_ascii_field, put_nqn_field, PduHeader,
    Sqe, CH_LEN, DISCOVERY_LOG_ENTRY_LEN, DISCOVERY_LOG_HEADER_LEN, LOG_PAGE_DISCOVERY,
    SQE_LEN,
};

/// Accept poll interval; bounds shutdown latency.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Largest PDU a discovery host may send.
const MAX_PDU: usize = 1024 * 1024;

/// NVMe status: invalid opcode (SCT 0, SC 0x01).
const STATUS_INVALID_OPCODE: u16 = 0x0001;

/// The discovery server.
pub struct DiscoveryResponder {
    listener: TcpListener,
    ctx: SharedContext,
}

impl std::fmt::Debug for DiscoveryResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryResponder").finish_non_exhaustive()
    }
}

impl DiscoveryResponder {
    /// Binds the discovery port.
    ///
    /// # Errors
    ///
    /// `Unavailable` when the address cannot be bound.
    pub async fn bind(addr: SocketAddr, ctx: SharedContext) -> GwResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GwError::unavailable(format!("bind {addr}: {e}")))?;
        info!(%addr, "discovery responder listening");
        Ok(Self { listener, ctx })
    }

    /// Local address, useful when bound to port 0 in tests.
    ///
    /// # Errors
    ///
    /// `Internal` when the socket has no local address.
    pub fn local_addr(&self) -> GwResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| GwError::internal(format!("local_addr: {e}")))
    }

    /// Accept loop; returns once shutdown is requested.
    pub async fn run(self) {
        loop {
            if self.ctx.is_shutdown_requested() {
                info!("discovery responder shutting down");
                break;
            }
            match tokio::time::timeout(ACCEPT_POLL, self.listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, peer, ctx).await {
                            debug!(%peer, error = %e, "discovery connection ended");
                        }
                    });
                }
                Ok(Err(e)) => warn!(error = %e, "discovery accept failed"),
                Err(_) => {}
            }
        }
    }
}

struct ConnectionState {
    host_nqn: Option<String>,
    controller_config: u64,
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: SharedContext,
) -> std::io::Result<()> {
    debug!(%peer, "discovery connection opened");
    let mut state = ConnectionState {
        host_nqn: None,
        controller_config: 0,
    };
    let mut buf = BytesMut::with_capacity(8192);

    loop {
        // Assemble one full PDU.
        let header = loop {
            if let Some(header) = PduHeader::parse(&buf) {
                let total = header.packet_length as usize;
                if total > MAX_PDU || total < CH_LEN {
                    return Ok(());
                }
                if buf.len() >= total {
                    break header;
                }
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
        };
        let packet = buf.split_to(header.packet_length as usize);

        match header.pdu_type {
            pdu::pdu_type::ICREQ => {
                stream.write_all(&icresp()).await?;
            }
            pdu::pdu_type::CAPSULE_CMD => {
                let Some(sqe) = Sqe::parse(&packet[CH_LEN..]) else {
                    return Ok(());
                };
                let data = if packet.len() > CH_LEN + SQE_LEN {
                    &packet[CH_LEN + SQE_LEN..]
                } else {
                    &[]
                };
                let responses = handle_command(&ctx, &mut state, &sqe, data).await;
                for response in responses {
                    stream.write_all(&response).await?;
                }
            }
            other => {
                debug!(%peer, pdu_type = other, "unexpected pdu");
                return Ok(());
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)] // log lengths are bounded
async fn handle_command(
    ctx: &SharedContext,
    state: &mut ConnectionState,
    sqe: &Sqe,
    data: &[u8],
) -> Vec<BytesMut> {
    match sqe.opcode {
        opcode::FABRIC => match sqe.fctype {
            fctype::CONNECT => {
                // Connect data: hostid(16) cntlid(2) rsvd, subnqn @256,
                // hostnqn @512, each 256 bytes NUL-padded.
                if data.len() >= 768 {
                    let host = read_nqn_field(&data[512..768]);
                    debug!(host = %host, "discovery connect");
                    state.host_nqn = Some(host);
                }
                // DW0 low 16 bits carry the controller id.
                vec![capsule_resp(sqe.cid, 1, 0)]
            }
            fctype::PROPERTY_GET => {
                let offset = u32::from_le_bytes([
                    sqe.raw[44], sqe.raw[45], sqe.raw[46], sqe.raw[47],
                ]);
                let value = match offset {
                    // CAP: MQES=127, CQR, TO=15, CSS=admin-only.
                    0x00 => 127 | (1 << 16) | (15 << 24) | (1 << 37),
                    // VS: 1.3.
                    0x08 => 0x0001_0300,
                    // CC.
                    0x14 => state.controller_config,
                    // CSTS: ready tracks CC.EN.
                    0x1c => state.controller_config & 1,
                    _ => 0,
                };
                vec![capsule_resp(sqe.cid, value, 0)]
            }
            fctype::PROPERTY_SET => {
                let offset = u32::from_le_bytes([
                    sqe.raw[44], sqe.raw[45], sqe.raw[46], sqe.raw[47],
                ]);
                if offset == 0x14 {
                    state.controller_config = u64::from(u32::from_le_bytes([
                        sqe.raw[48], sqe.raw[49], sqe.raw[50], sqe.raw[51],
                    ]));
                }
                vec![capsule_resp(sqe.cid, 0, 0)]
            }
            _ => vec![capsule_resp(sqe.cid, 0, STATUS_INVALID_OPCODE)],
        },
        opcode::IDENTIFY => {
            let payload = identify_controller();
            vec![c2h_data(sqe.cid, &payload), capsule_resp(sqe.cid, 0, 0)]
        }
        opcode::GET_LOG_PAGE => {
            let lid = (sqe.cdw10() & 0xff) as u8;
            if lid != LOG_PAGE_DISCOVERY {
                return vec![capsule_resp(sqe.cid, 0, STATUS_INVALID_OPCODE)];
            }
            // Requested length in dwords: NUMDL (cdw10 high 16) +
            // NUMDU (cdw11 low 16), zero-based.
            let numd = (u64::from(sqe.cdw10() >> 16) | (u64::from(sqe.cdw11() & 0xffff) << 16))
                + 1;
            let length = (numd * 4) as usize;
            let offset = sqe.offset() as usize;

            let snapshot = ctx.cache.read().await.clone();
            let log = build_discovery_log(&snapshot, state.host_nqn.as_deref());
            let end = (offset + length).min(log.len());
            let slice = if offset < log.len() {
                &log[offset..end]
            } else {
                &[]
            };
            vec![c2h_data(sqe.cid, slice), capsule_resp(sqe.cid, 0, 0)]
        }
        opcode::KEEP_ALIVE | opcode::SET_FEATURES => vec![capsule_resp(sqe.cid, 0, 0)],
        opcode::GET_FEATURES => vec![capsule_resp(sqe.cid, 0, 0)],
        other => {
            debug!(opcode = other, "unsupported discovery opcode");
            vec![capsule_resp(sqe.cid, 0, STATUS_INVALID_OPCODE)]
        }
    }
}

fn read_nqn_field(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Identify Controller data for the discovery controller.
fn identify_controller() -> Vec<u8> {
    let mut data = vec![0u8; 4096];
    put_ascii_field(&mut data[4..24], "nvgw-discovery");
    put_ascii_field(&mut data[24..64], "nvgw discovery controller");
    put_ascii_field(&mut data[64..72], env!("CARGO_PKG_VERSION"));
    // cntlid.
    data[78..80].copy_from_slice(&1u16.to_le_bytes());
    // kas: keep-alive granularity, 100 ms units.
    data[320..322].copy_from_slice(&100u16.to_le_bytes());
    put_nqn_field(&mut data[768..1024], DISCOVERY_NQN);
    data
}

/// Builds the discovery log: header then one 1024-byte entry per
/// (subsystem, listener) visible to `host_nqn`.
pub(crate) fn build_discovery_log(snapshot: &Snapshot, host_nqn: Option<&str>) -> Vec<u8> {
    let mut entries: Vec<[u8; DISCOVERY_LOG_ENTRY_LEN]> = Vec::new();

    for (key, record) in &snapshot.records {
        let StateKey::Subsystem { nqn } = key else {
            continue;
        };
        let Ok(subsystem) = record.decode::<Subsystem>() else {
            continue;
        };
        if !host_allowed(snapshot, &subsystem, host_nqn) {
            continue;
        }
        for (lst_key, lst_record) in snapshot.subsystem_keys(nqn) {
            if !matches!(lst_key, StateKey::Listener { .. }) {
                continue;
            }
            let Ok(listener) = lst_record.decode::<Listener>() else {
                continue;
            };
            entries.push(log_entry(&subsystem, &listener));
        }
    }

    let mut log = vec![0u8; DISCOVERY_LOG_HEADER_LEN + entries.len() * DISCOVERY_LOG_ENTRY_LEN];
    // genctr, numrec, recfmt.
    log[0..8].copy_from_slice(&snapshot.epoch.to_le_bytes());
    log[8..16].copy_from_slice(&(entries.len() as u64).to_le_bytes());
    log[16..18].copy_from_slice(&0u16.to_le_bytes());
    for (index, entry) in entries.iter().enumerate() {
        let start = DISCOVERY_LOG_HEADER_LEN + index * DISCOVERY_LOG_ENTRY_LEN;
        log[start..start + DISCOVERY_LOG_ENTRY_LEN].copy_from_slice(entry);
    }
    log
}

fn host_allowed(snapshot: &Snapshot, subsystem: &Subsystem, host_nqn: Option<&str>) -> bool {
    if subsystem.allow_any_host {
        return true;
    }
    if snapshot
        .get(&StateKey::Host {
            nqn: subsystem.nqn.clone(),
            host_nqn: ANY_HOST.to_string(),
        })
        .is_some()
    {
        return true;
    }
    match host_nqn {
        Some(host) => snapshot
            .get(&StateKey::Host {
                nqn: subsystem.nqn.clone(),
                host_nqn: host.to_string(),
            })
            .is_some(),
        None => false,
    }
}

fn log_entry(subsystem: &Subsystem, listener: &Listener) -> [u8; DISCOVERY_LOG_ENTRY_LEN] {
    let mut entry = [0u8; DISCOVERY_LOG_ENTRY_LEN];
    entry[0] = 3; // trtype: tcp
    entry[1] = match listener.adrfam {
        nvgw_core::model::AddrFamily::Ipv4 => 1,
        nvgw_core::model::AddrFamily::Ipv6 => 2,
    };
    entry[2] = 2; // subtype: nvm subsystem
    entry[3] = if listener.secure { 1 << 2 } else { 0 }; // treq
    entry[4..6].copy_from_slice(&0u16.to_le_bytes()); // portid
    entry[6..8].copy_from_slice(&0xffffu16.to_le_bytes()); // cntlid: dynamic
    entry[8..10].copy_from_slice(&128u16.to_le_bytes()); // asqsz
    put_ascii_field(&mut entry[32..64], &listener.trsvcid.to_string());
    put_nqn_field(&mut entry[256..512], &subsystem.nqn);
    put_ascii_field(&mut entry[512..768], &listener.traddr);
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvgw_core::model::{AddrFamily, Transport};
    use nvgw_core::statemap::Record;
    use std::collections::BTreeMap;

    fn subsystem(nqn: &str, allow_any: bool) -> Subsystem {
        Subsystem {
            nqn: nqn.to_string(),
            serial: "SN1".to_string(),
            max_namespaces: 256,
            allow_any_host: allow_any,
            no_group_append: true,
        }
    }

    fn listener(nqn: &str) -> Listener {
        Listener {
            subsystem_nqn: nqn.to_string(),
            gateway: "gw-1".to_string(),
            transport: Transport::Tcp,
            adrfam: AddrFamily::Ipv4,
            traddr: "192.168.13.3".to_string(),
            trsvcid: 4420,
            secure: false,
        }
    }

    fn snapshot_with(records: Vec<(StateKey, Vec<u8>)>) -> Snapshot {
        let mut map = BTreeMap::new();
        for (key, payload) in records {
            map.insert(key, Record::initial("gw-1", payload));
        }
        Snapshot {
            epoch: 7,
            records: map,
        }
    }

    #[test]
    fn log_contains_one_entry_per_listener() {
        let nqn = "nqn.2016-06.io.spdk:cnode1";
        let snapshot = snapshot_with(vec![
            (
                StateKey::Subsystem { nqn: nqn.into() },
                serde_json::to_vec(&subsystem(nqn, true)).unwrap(),
            ),
            (
                StateKey::Listener {
                    nqn: nqn.into(),
                    gateway: "gw-1".into(),
                    adrfam: "ipv4".into(),
                    traddr: "192.168.13.3".into(),
                    trsvcid: 4420,
                },
                serde_json::to_vec(&listener(nqn)).unwrap(),
            ),
        ]);

        let log = build_discovery_log(&snapshot, Some("nqn.2016-06.io.spdk:host1"));
        assert_eq!(
            log.len(),
            DISCOVERY_LOG_HEADER_LEN + DISCOVERY_LOG_ENTRY_LEN
        );
        // genctr mirrors the epoch, numrec is 1.
        assert_eq!(u64::from_le_bytes(log[0..8].try_into().unwrap()), 7);
        assert_eq!(u64::from_le_bytes(log[8..16].try_into().unwrap()), 1);
        // The entry names the subsystem.
        let entry = &log[DISCOVERY_LOG_HEADER_LEN..];
        assert!(entry[256..512].starts_with(nqn.as_bytes()));
        assert!(entry[512..].starts_with(b"192.168.13.3"));
    }

    #[test]
    fn acl_filters_unknown_hosts() {
        let nqn = "nqn.2016-06.io.spdk:cnode1";
        let snapshot = snapshot_with(vec![
            (
                StateKey::Subsystem { nqn: nqn.into() },
                serde_json::to_vec(&subsystem(nqn, false)).unwrap(),
            ),
            (
                StateKey::Listener {
                    nqn: nqn.into(),
                    gateway: "gw-1".into(),
                    adrfam: "ipv4".into(),
                    traddr: "192.168.13.3".into(),
                    trsvcid: 4420,
                },
                serde_json::to_vec(&listener(nqn)).unwrap(),
            ),
            (
                StateKey::Host {
                    nqn: nqn.into(),
                    host_nqn: "nqn.2016-06.io.spdk:host1".into(),
                },
                serde_json::to_vec(&nvgw_core::model::HostAccess {
                    subsystem_nqn: nqn.into(),
                    host_nqn: "nqn.2016-06.io.spdk:host1".into(),
                    psk_key: None,
                    dhchap_key: None,
                    dhchap_ctrlr_key: None,
                })
                .unwrap(),
            ),
        ]);

        let allowed = build_discovery_log(&snapshot, Some("nqn.2016-06.io.spdk:host1"));
        assert_eq!(
            u64::from_le_bytes(allowed[8..16].try_into().unwrap()),
            1
        );

        let denied = build_discovery_log(&snapshot, Some("nqn.2016-06.io.spdk:intruder"));
        assert_eq!(u64::from_le_bytes(denied[8..16].try_into().unwrap()), 0);
        assert_eq!(denied.len(), DISCOVERY_LOG_HEADER_LEN);
    }
}
