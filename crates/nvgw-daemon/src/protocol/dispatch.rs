//! Admin request dispatcher.
//!
//! Decodes tagged frames, translates wire messages into domain calls on
//! [`GatewayService`], and encodes the response under the request's tag.
//! A panicking handler is caught here, logged with a correlation id, and
//! surfaced as `Internal`; the connection stays up.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use nvgw_core::error::{ErrorKind, GwError};
use nvgw_core::model::{AddrFamily, Listener, Transport};
use tracing::{error, warn};
use uuid::Uuid;

use super::error::ProtocolResult;
use super::messages::{
    decode_body, encode_frame, split_frame, ConnectionDescriptor, ConnectionListRequest,
    ConnectionListResponse, GatewayInfoRequest, GatewayInfoResponse, GetSubsystemsRequest,
    GetSubsystemsResponse, HostAddRequest, HostDelRequest, ListenerAddRequest,
    ListenerDelRequest, ListenerDescriptor, MessageType, NamespaceAddRequest,
    NamespaceAddResponse, NamespaceChangeLbGroupRequest, NamespaceDelRequest,
    NamespaceDescriptor, NamespaceHostRequest, NamespaceResizeRequest, SetLogLevelRequest,
    StatusResponse, SubsystemAddRequest, SubsystemAddResponse, SubsystemDelRequest,
    SubsystemDescriptor,
};
use crate::service::host::HostAddParams;
use crate::service::namespace::NamespaceAddParams;
use crate::service::subsystem::SubsystemAddParams;
use crate::service::GatewayService;
use crate::tgt::TgtSubsystem;

/// Per-request deadline; elapsed handlers answer `DeadlineExceeded`.
const REQUEST_DEADLINE: Duration = Duration::from_secs(120);

/// Dispatcher shared by every admin connection.
#[derive(Clone)]
pub struct AdminDispatcher {
    service: Arc<GatewayService>,
}

impl std::fmt::Debug for AdminDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminDispatcher").finish_non_exhaustive()
    }
}

fn gw_status(err: &GwError) -> (u32, String) {
    (err.code(), err.to_string())
}

fn status_response(result: Result<(), GwError>) -> StatusResponse {
    match result {
        Ok(()) => StatusResponse::ok(),
        Err(err) => {
            let (status, error_message) = gw_status(&err);
            StatusResponse {
                status,
                error_message,
            }
        }
    }
}

fn subsystem_descriptor(sub: &TgtSubsystem) -> SubsystemDescriptor {
    SubsystemDescriptor {
        nqn: sub.nqn.clone(),
        serial: sub.serial_number.clone(),
        max_namespaces: sub.max_namespaces,
        allow_any_host: sub.allow_any_host,
        hosts: sub.hosts.iter().map(|h| h.nqn.clone()).collect(),
        listeners: sub
            .listen_addresses
            .iter()
            .map(|l| ListenerDescriptor {
                transport: l.trtype.clone(),
                adrfam: l.adrfam.clone(),
                traddr: l.traddr.clone(),
                trsvcid: l.trsvcid.parse().unwrap_or(0),
                secure: l.secure,
            })
            .collect(),
        namespaces: sub
            .namespaces
            .iter()
            .map(|n| NamespaceDescriptor {
                nsid: n.nsid,
                bdev_name: n.bdev_name.clone(),
                uuid: n.uuid.clone(),
                lb_group: n.anagrpid,
            })
            .collect(),
    }
}

fn listener_from_wire(
    nqn: String,
    gateway: String,
    transport: &str,
    adrfam: &str,
    traddr: String,
    trsvcid: u32,
    secure: bool,
) -> Result<Listener, GwError> {
    let trsvcid = u16::try_from(trsvcid)
        .map_err(|_| GwError::invalid_argument(format!("trsvcid {trsvcid} out of range")))?;
    Ok(Listener {
        subsystem_nqn: nqn,
        gateway,
        transport: Transport::parse(transport)?,
        adrfam: AddrFamily::parse(adrfam)?,
        traddr,
        trsvcid,
        secure,
    })
}

impl AdminDispatcher {
    /// Builds the dispatcher over the service.
    #[must_use]
    pub fn new(service: Arc<GatewayService>) -> Self {
        Self { service }
    }

    /// Handles one frame and returns the response frame.
    ///
    /// # Errors
    ///
    /// Framing-level failures only; application errors travel inside the
    /// response `status`.
    pub async fn dispatch(&self, frame: &[u8]) -> ProtocolResult<Bytes> {
        let (tag, _) = split_frame(frame)?;
        let handled = std::panic::AssertUnwindSafe(
            tokio::time::timeout(REQUEST_DEADLINE, self.handle(frame)),
        )
        .catch_unwind()
        .await;
        match handled {
            Ok(Ok(response)) => response,
            Ok(Err(_elapsed)) => {
                warn!(tag = ?tag, "request deadline elapsed");
                Ok(self.error_frame(tag, &GwError::new(
                    ErrorKind::DeadlineExceeded,
                    "request deadline elapsed",
                )))
            }
            Err(panic) => {
                let correlation_id = Uuid::new_v4();
                let what = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(%correlation_id, panic = %what, "handler panicked");
                Ok(self.error_frame(
                    tag,
                    &GwError::internal(format!("internal error, correlation id {correlation_id}")),
                ))
            }
        }
    }

    /// Encodes an error into the response shape of `tag`.
    fn error_frame(&self, tag: MessageType, err: &GwError) -> Bytes {
        let (status, error_message) = gw_status(err);
        match tag {
            MessageType::SubsystemAdd => encode_frame(
                tag,
                &SubsystemAddResponse {
                    status,
                    error_message,
                    ..Default::default()
                },
            ),
            MessageType::NamespaceAdd => encode_frame(
                tag,
                &NamespaceAddResponse {
                    status,
                    error_message,
                    ..Default::default()
                },
            ),
            MessageType::ConnectionList => encode_frame(
                tag,
                &ConnectionListResponse {
                    status,
                    error_message,
                    connections: Vec::new(),
                },
            ),
            MessageType::GetSubsystems => encode_frame(
                tag,
                &GetSubsystemsResponse {
                    status,
                    error_message,
                    subsystems: Vec::new(),
                },
            ),
            MessageType::GatewayInfo => encode_frame(
                tag,
                &GatewayInfoResponse {
                    status,
                    error_message,
                    ..Default::default()
                },
            ),
            _ => encode_frame(
                tag,
                &StatusResponse {
                    status,
                    error_message,
                },
            ),
        }
    }

    #[allow(clippy::too_many_lines)] // one arm per RPC, mechanical
    async fn handle(&self, frame: &[u8]) -> ProtocolResult<Bytes> {
        let (tag, body) = split_frame(frame)?;
        let response = match tag {
            MessageType::SubsystemAdd => {
                let request: SubsystemAddRequest = decode_body(body)?;
                match self
                    .service
                    .subsystem_add(SubsystemAddParams {
                        nqn: request.nqn,
                        serial: request.serial,
                        max_namespaces: request.max_namespaces,
                        no_group_append: request.no_group_append,
                    })
                    .await
                {
                    Ok(subsystem) => encode_frame(
                        tag,
                        &SubsystemAddResponse {
                            status: 0,
                            error_message: String::new(),
                            nqn: subsystem.nqn,
                            serial: subsystem.serial,
                        },
                    ),
                    Err(err) => self.error_frame(tag, &err),
                }
            }
            MessageType::SubsystemDel => {
                let request: SubsystemDelRequest = decode_body(body)?;
                let result = self
                    .service
                    .subsystem_del(&request.nqn, request.force)
                    .await;
                encode_frame(tag, &status_response(result))
            }
            MessageType::NamespaceAdd => {
                let request: NamespaceAddRequest = decode_body(body)?;
                match self
                    .service
                    .namespace_add(NamespaceAddParams {
                        nqn: request.nqn,
                        nsid: request.nsid,
                        pool: request.pool,
                        image: request.image,
                        size_bytes: request.size_bytes,
                        uuid: request.uuid,
                        lb_group: request.lb_group,
                        auto_visible: request.auto_visible,
                        block_size: request.block_size,
                    })
                    .await
                {
                    Ok(namespace) => encode_frame(
                        tag,
                        &NamespaceAddResponse {
                            status: 0,
                            error_message: String::new(),
                            nsid: namespace.nsid,
                            uuid: namespace.uuid,
                        },
                    ),
                    Err(err) => self.error_frame(tag, &err),
                }
            }
            MessageType::NamespaceDel => {
                let request: NamespaceDelRequest = decode_body(body)?;
                let result = self.service.namespace_del(&request.nqn, request.nsid).await;
                encode_frame(tag, &status_response(result))
            }
            MessageType::NamespaceResize => {
                let request: NamespaceResizeRequest = decode_body(body)?;
                let result = self
                    .service
                    .namespace_resize(&request.nqn, request.nsid, request.new_size_bytes)
                    .await
                    .map(|_| ());
                encode_frame(tag, &status_response(result))
            }
            MessageType::NamespaceChangeLbGroup => {
                let request: NamespaceChangeLbGroupRequest = decode_body(body)?;
                let result = self
                    .service
                    .namespace_change_lb_group(&request.nqn, request.nsid, request.lb_group)
                    .await
                    .map(|_| ());
                encode_frame(tag, &status_response(result))
            }
            MessageType::NamespaceAddHost => {
                let request: NamespaceHostRequest = decode_body(body)?;
                let result = self
                    .service
                    .namespace_add_host(&request.nqn, request.nsid, &request.host_nqn)
                    .await;
                encode_frame(tag, &status_response(result))
            }
            MessageType::NamespaceDelHost => {
                let request: NamespaceHostRequest = decode_body(body)?;
                let result = self
                    .service
                    .namespace_del_host(&request.nqn, request.nsid, &request.host_nqn)
                    .await;
                encode_frame(tag, &status_response(result))
            }
            MessageType::ListenerAdd => {
                let request: ListenerAddRequest = decode_body(body)?;
                let result = listener_from_wire(
                    request.nqn,
                    request.gateway,
                    &request.transport,
                    &request.adrfam,
                    request.traddr,
                    request.trsvcid,
                    request.secure,
                );
                let result = match result {
                    Ok(listener) => self.service.listener_add(listener).await.map(|_| ()),
                    Err(err) => Err(err),
                };
                encode_frame(tag, &status_response(result))
            }
            MessageType::ListenerDel => {
                let request: ListenerDelRequest = decode_body(body)?;
                let result = listener_from_wire(
                    request.nqn,
                    request.gateway,
                    &request.transport,
                    &request.adrfam,
                    request.traddr,
                    request.trsvcid,
                    false,
                );
                let result = match result {
                    Ok(listener) => self.service.listener_del(&listener).await,
                    Err(err) => Err(err),
                };
                encode_frame(tag, &status_response(result))
            }
            MessageType::HostAdd => {
                let request: HostAddRequest = decode_body(body)?;
                let result = self
                    .service
                    .host_add(HostAddParams {
                        nqn: request.nqn,
                        host_nqn: request.host_nqn,
                        psk: request.psk,
                        dhchap: request.dhchap,
                        dhchap_ctrlr: request.dhchap_ctrlr,
                    })
                    .await
                    .map(|_| ());
                encode_frame(tag, &status_response(result))
            }
            MessageType::HostDel => {
                let request: HostDelRequest = decode_body(body)?;
                let result = self
                    .service
                    .host_del(&request.nqn, &request.host_nqn)
                    .await;
                encode_frame(tag, &status_response(result))
            }
            MessageType::ConnectionList => {
                let request: ConnectionListRequest = decode_body(body)?;
                match self.service.connection_list(&request.nqn).await {
                    Ok(rows) => encode_frame(
                        tag,
                        &ConnectionListResponse {
                            status: 0,
                            error_message: String::new(),
                            connections: rows
                                .into_iter()
                                .map(|r| ConnectionDescriptor {
                                    host_nqn: r.host_nqn,
                                    traddr: r.traddr,
                                    trsvcid: u32::from(r.trsvcid),
                                    qpair_count: r.qpair_count,
                                    controller_id: r.controller_id,
                                    secure: r.secure,
                                    use_psk: r.use_psk,
                                    use_dhchap: r.use_dhchap,
                                    connected: r.connected,
                                })
                                .collect(),
                        },
                    ),
                    Err(err) => self.error_frame(tag, &err),
                }
            }
            MessageType::GetSubsystems => {
                let _request: GetSubsystemsRequest = decode_body(body)?;
                match self.service.get_subsystems().await {
                    Ok(subsystems) => encode_frame(
                        tag,
                        &GetSubsystemsResponse {
                            status: 0,
                            error_message: String::new(),
                            subsystems: subsystems.iter().map(subsystem_descriptor).collect(),
                        },
                    ),
                    Err(err) => self.error_frame(tag, &err),
                }
            }
            MessageType::SetLogLevel => {
                let request: SetLogLevelRequest = decode_body(body)?;
                let result = self.service.set_log_level(&request.level);
                encode_frame(tag, &status_response(result))
            }
            MessageType::SetTgtLogLevel => {
                let request: SetLogLevelRequest = decode_body(body)?;
                let result = self.service.set_tgt_log_level(&request.level).await;
                encode_frame(tag, &status_response(result))
            }
            MessageType::GatewayInfo => {
                let _request: GatewayInfoRequest = decode_body(body)?;
                let info = self.service.gateway_info().await;
                encode_frame(
                    tag,
                    &GatewayInfoResponse {
                        status: 0,
                        error_message: String::new(),
                        name: info.name,
                        group: info.group,
                        version: info.version,
                        addr: info.addr,
                        port: u32::from(info.port),
                        optimized_groups: info.optimized_groups.iter().map(|g| g.0).collect(),
                    },
                )
            }
        };
        Ok(response)
    }
}
