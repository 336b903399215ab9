//! Admin protocol message types.
//!
//! Protobuf-shaped messages, hand-written with `prost` derives. Every
//! frame is one tag byte followed by the encoded body; a response reuses
//! its request's tag. These types stop at the dispatch layer: the service
//! operates on the domain model, translated at the edge.
//!
//! `status == 0` means success; any other value is a canonical
//! [`nvgw_core::error::ErrorKind`] code with a human-readable
//! `error_message`.

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;

use super::error::{ProtocolError, ProtocolResult};

/// Message-type tag, the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Create a subsystem.
    SubsystemAdd = 1,
    /// Delete a subsystem.
    SubsystemDel = 2,
    /// Create a namespace.
    NamespaceAdd = 3,
    /// Delete a namespace.
    NamespaceDel = 4,
    /// Grow a namespace.
    NamespaceResize = 5,
    /// Move a namespace to another load-balancing group.
    NamespaceChangeLbGroup = 6,
    /// Grant a host visibility of a namespace.
    NamespaceAddHost = 7,
    /// Revoke a host's visibility of a namespace.
    NamespaceDelHost = 8,
    /// Create a listener.
    ListenerAdd = 9,
    /// Delete a listener.
    ListenerDel = 10,
    /// Grant a host access to a subsystem.
    HostAdd = 11,
    /// Revoke a host grant.
    HostDel = 12,
    /// List controller connections for a subsystem.
    ConnectionList = 13,
    /// Engine-reported subsystem snapshot.
    GetSubsystems = 14,
    /// Change the gateway log level.
    SetLogLevel = 15,
    /// Change the engine log level.
    SetTgtLogLevel = 16,
    /// Gateway identity and version.
    GatewayInfo = 17,
}

impl MessageType {
    /// Parses a tag byte.
    #[must_use]
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::SubsystemAdd),
            2 => Some(Self::SubsystemDel),
            3 => Some(Self::NamespaceAdd),
            4 => Some(Self::NamespaceDel),
            5 => Some(Self::NamespaceResize),
            6 => Some(Self::NamespaceChangeLbGroup),
            7 => Some(Self::NamespaceAddHost),
            8 => Some(Self::NamespaceDelHost),
            9 => Some(Self::ListenerAdd),
            10 => Some(Self::ListenerDel),
            11 => Some(Self::HostAdd),
            12 => Some(Self::HostDel),
            13 => Some(Self::ConnectionList),
            14 => Some(Self::GetSubsystems),
            15 => Some(Self::SetLogLevel),
            16 => Some(Self::SetTgtLogLevel),
            17 => Some(Self::GatewayInfo),
            _ => None,
        }
    }
}

/// Encodes `tag` + `body` into one frame payload.
#[must_use]
pub fn encode_frame<M: Message>(tag: MessageType, body: &M) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + body.encoded_len());
    buf.put_u8(tag as u8);
    body.encode(&mut buf).expect("BytesMut growth is infallible");
    buf.freeze()
}

/// Splits a frame payload into its tag and body.
///
/// # Errors
///
/// `EmptyFrame` for zero-length payloads, `UnknownMessageType` for an
/// unrecognized tag.
pub fn split_frame(frame: &[u8]) -> ProtocolResult<(MessageType, &[u8])> {
    let (&tag, body) = frame.split_first().ok_or(ProtocolError::EmptyFrame)?;
    let message_type =
        MessageType::from_u8(tag).ok_or(ProtocolError::UnknownMessageType(tag))?;
    Ok((message_type, body))
}

/// Decodes a message body.
///
/// # Errors
///
/// `Decode` when the body does not parse as `M`.
pub fn decode_body<M: Message + Default>(body: &[u8]) -> ProtocolResult<M> {
    M::decode(body).map_err(|e| ProtocolError::Decode(e.to_string()))
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// `subsystem_add`
#[derive(Clone, PartialEq, Message)]
pub struct SubsystemAddRequest {
    /// Subsystem NQN.
    #[prost(string, tag = "1")]
    pub nqn: String,
    /// Serial number; generated when empty.
    #[prost(string, optional, tag = "2")]
    pub serial: Option<String>,
    /// Maximum namespaces; defaulted when absent.
    #[prost(uint32, optional, tag = "3")]
    pub max_namespaces: Option<u32>,
    /// Do not append the gateway group to the NQN.
    #[prost(bool, tag = "4")]
    pub no_group_append: bool,
}

/// `subsystem_del`
#[derive(Clone, PartialEq, Message)]
pub struct SubsystemDelRequest {
    /// Subsystem NQN.
    #[prost(string, tag = "1")]
    pub nqn: String,
    /// Delete dependents too.
    #[prost(bool, tag = "2")]
    pub force: bool,
}

/// `namespace_add`
#[derive(Clone, PartialEq, Message)]
pub struct NamespaceAddRequest {
    /// Subsystem NQN.
    #[prost(string, tag = "1")]
    pub nqn: String,
    /// Explicit nsid; lowest free when absent.
    #[prost(uint32, optional, tag = "2")]
    pub nsid: Option<u32>,
    /// Backing pool.
    #[prost(string, tag = "3")]
    pub pool: String,
    /// Backing image.
    #[prost(string, tag = "4")]
    pub image: String,
    /// Image size in bytes; informational, the image pre-exists.
    #[prost(uint64, optional, tag = "5")]
    pub size_bytes: Option<u64>,
    /// Explicit UUID; generated when absent.
    #[prost(string, optional, tag = "6")]
    pub uuid: Option<String>,
    /// Load-balancing group; group 1 when absent.
    #[prost(uint32, optional, tag = "7")]
    pub lb_group: Option<u32>,
    /// Visible to all allowed hosts; true when absent.
    #[prost(bool, optional, tag = "8")]
    pub auto_visible: Option<bool>,
    /// Block size; 512 when absent.
    #[prost(uint32, optional, tag = "9")]
    pub block_size: Option<u32>,
}

/// `namespace_del`
#[derive(Clone, PartialEq, Message)]
pub struct NamespaceDelRequest {
    /// Subsystem NQN.
    #[prost(string, tag = "1")]
    pub nqn: String,
    /// Namespace id.
    #[prost(uint32, tag = "2")]
    pub nsid: u32,
}

/// `namespace_resize`
#[derive(Clone, PartialEq, Message)]
pub struct NamespaceResizeRequest {
    /// Subsystem NQN.
    #[prost(string, tag = "1")]
    pub nqn: String,
    /// Namespace id.
    #[prost(uint32, tag = "2")]
    pub nsid: u32,
    /// New size in bytes; must grow.
    #[prost(uint64, tag = "3")]
    pub new_size_bytes: u64,
}

/// `namespace_change_load_balancing_group`
#[derive(Clone, PartialEq, Message)]
pub struct NamespaceChangeLbGroupRequest {
    /// Subsystem NQN.
    #[prost(string, tag = "1")]
    pub nqn: String,
    /// Namespace id.
    #[prost(uint32, tag = "2")]
    pub nsid: u32,
    /// Target group.
    #[prost(uint32, tag = "3")]
    pub lb_group: u32,
}

/// `namespace_add_host` / `namespace_del_host`
#[derive(Clone, PartialEq, Message)]
pub struct NamespaceHostRequest {
    /// Subsystem NQN.
    #[prost(string, tag = "1")]
    pub nqn: String,
    /// Namespace id.
    #[prost(uint32, tag = "2")]
    pub nsid: u32,
    /// Host NQN.
    #[prost(string, tag = "3")]
    pub host_nqn: String,
}

/// `listener_add`
#[derive(Clone, PartialEq, Message)]
pub struct ListenerAddRequest {
    /// Subsystem NQN.
    #[prost(string, tag = "1")]
    pub nqn: String,
    /// Gateway that owns (and realizes) the listener.
    #[prost(string, tag = "2")]
    pub gateway: String,
    /// Transport type (`tcp`).
    #[prost(string, tag = "3")]
    pub transport: String,
    /// Address family (`ipv4`/`ipv6`).
    #[prost(string, tag = "4")]
    pub adrfam: String,
    /// Transport address.
    #[prost(string, tag = "5")]
    pub traddr: String,
    /// Transport service id.
    #[prost(uint32, tag = "6")]
    pub trsvcid: u32,
    /// Secure-channel flag.
    #[prost(bool, tag = "7")]
    pub secure: bool,
}

/// `listener_del`
#[derive(Clone, PartialEq, Message)]
pub struct ListenerDelRequest {
    /// Subsystem NQN.
    #[prost(string, tag = "1")]
    pub nqn: String,
    /// Owning gateway.
    #[prost(string, tag = "2")]
    pub gateway: String,
    /// Transport type.
    #[prost(string, tag = "3")]
    pub transport: String,
    /// Address family.
    #[prost(string, tag = "4")]
    pub adrfam: String,
    /// Transport address.
    #[prost(string, tag = "5")]
    pub traddr: String,
    /// Transport service id.
    #[prost(uint32, tag = "6")]
    pub trsvcid: u32,
}

/// `host_add`
#[derive(Clone, PartialEq, Message)]
pub struct HostAddRequest {
    /// Subsystem NQN.
    #[prost(string, tag = "1")]
    pub nqn: String,
    /// Host NQN or `"*"`.
    #[prost(string, tag = "2")]
    pub host_nqn: String,
    /// PSK in interchange format.
    #[prost(string, optional, tag = "3")]
    pub psk: Option<String>,
    /// DH-CHAP host key in interchange format.
    #[prost(string, optional, tag = "4")]
    pub dhchap: Option<String>,
    /// DH-CHAP controller key in interchange format.
    #[prost(string, optional, tag = "5")]
    pub dhchap_ctrlr: Option<String>,
}

/// `host_del`
#[derive(Clone, PartialEq, Message)]
pub struct HostDelRequest {
    /// Subsystem NQN.
    #[prost(string, tag = "1")]
    pub nqn: String,
    /// Host NQN or `"*"`.
    #[prost(string, tag = "2")]
    pub host_nqn: String,
}

/// `connection_list`
#[derive(Clone, PartialEq, Message)]
pub struct ConnectionListRequest {
    /// Subsystem NQN.
    #[prost(string, tag = "1")]
    pub nqn: String,
}

/// `get_subsystems`
#[derive(Clone, PartialEq, Message)]
pub struct GetSubsystemsRequest {}

/// `log_level` / `spdk_log_level`
#[derive(Clone, PartialEq, Message)]
pub struct SetLogLevelRequest {
    /// Level name (`trace`..`error` for the gateway, engine spellings for
    /// the engine).
    #[prost(string, tag = "1")]
    pub level: String,
}

/// `gateway_info`
#[derive(Clone, PartialEq, Message)]
pub struct GatewayInfoRequest {}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Bare status response, shared by every delete/set operation.
#[derive(Clone, PartialEq, Message)]
pub struct StatusResponse {
    /// 0 on success, else a canonical error code.
    #[prost(uint32, tag = "1")]
    pub status: u32,
    /// Human-readable error; empty on success.
    #[prost(string, tag = "2")]
    pub error_message: String,
}

impl StatusResponse {
    /// Success value.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: 0,
            error_message: String::new(),
        }
    }
}

/// Namespace as reported in a subsystem descriptor.
#[derive(Clone, PartialEq, Message)]
pub struct NamespaceDescriptor {
    /// Namespace id.
    #[prost(uint32, tag = "1")]
    pub nsid: u32,
    /// Backing block device name.
    #[prost(string, tag = "2")]
    pub bdev_name: String,
    /// Namespace UUID.
    #[prost(string, tag = "3")]
    pub uuid: String,
    /// Load-balancing group.
    #[prost(uint32, tag = "4")]
    pub lb_group: u32,
}

/// Listener as reported in a subsystem descriptor.
#[derive(Clone, PartialEq, Message)]
pub struct ListenerDescriptor {
    /// Transport type.
    #[prost(string, tag = "1")]
    pub transport: String,
    /// Address family.
    #[prost(string, tag = "2")]
    pub adrfam: String,
    /// Transport address.
    #[prost(string, tag = "3")]
    pub traddr: String,
    /// Transport service id.
    #[prost(uint32, tag = "4")]
    pub trsvcid: u32,
    /// Secure-channel flag.
    #[prost(bool, tag = "5")]
    pub secure: bool,
}

/// Subsystem snapshot entry.
#[derive(Clone, PartialEq, Message)]
pub struct SubsystemDescriptor {
    /// Subsystem NQN.
    #[prost(string, tag = "1")]
    pub nqn: String,
    /// Serial number.
    #[prost(string, tag = "2")]
    pub serial: String,
    /// Maximum namespaces.
    #[prost(uint32, tag = "3")]
    pub max_namespaces: u32,
    /// Wildcard host access.
    #[prost(bool, tag = "4")]
    pub allow_any_host: bool,
    /// Explicit host grants.
    #[prost(string, repeated, tag = "5")]
    pub hosts: Vec<String>,
    /// Listeners.
    #[prost(message, repeated, tag = "6")]
    pub listeners: Vec<ListenerDescriptor>,
    /// Namespaces.
    #[prost(message, repeated, tag = "7")]
    pub namespaces: Vec<NamespaceDescriptor>,
}

/// `subsystem_add` response.
#[derive(Clone, PartialEq, Message)]
pub struct SubsystemAddResponse {
    /// 0 on success.
    #[prost(uint32, tag = "1")]
    pub status: u32,
    /// Error description.
    #[prost(string, tag = "2")]
    pub error_message: String,
    /// Effective NQN (group suffix may have been appended).
    #[prost(string, tag = "3")]
    pub nqn: String,
    /// Serial number in effect.
    #[prost(string, tag = "4")]
    pub serial: String,
}

/// `namespace_add` response.
#[derive(Clone, PartialEq, Message)]
pub struct NamespaceAddResponse {
    /// 0 on success.
    #[prost(uint32, tag = "1")]
    pub status: u32,
    /// Error description.
    #[prost(string, tag = "2")]
    pub error_message: String,
    /// Assigned nsid.
    #[prost(uint32, tag = "3")]
    pub nsid: u32,
    /// Namespace UUID in effect.
    #[prost(string, tag = "4")]
    pub uuid: String,
}

/// One row of `connection_list`.
#[derive(Clone, PartialEq, Message)]
pub struct ConnectionDescriptor {
    /// Host NQN.
    #[prost(string, tag = "1")]
    pub host_nqn: String,
    /// Remote address; empty when disconnected.
    #[prost(string, tag = "2")]
    pub traddr: String,
    /// Remote port; zero when disconnected.
    #[prost(uint32, tag = "3")]
    pub trsvcid: u32,
    /// Queue pair count.
    #[prost(uint32, tag = "4")]
    pub qpair_count: u32,
    /// Controller id.
    #[prost(uint32, tag = "5")]
    pub controller_id: u32,
    /// Secure channel.
    #[prost(bool, tag = "6")]
    pub secure: bool,
    /// PSK in use.
    #[prost(bool, tag = "7")]
    pub use_psk: bool,
    /// DH-CHAP in use.
    #[prost(bool, tag = "8")]
    pub use_dhchap: bool,
    /// Currently connected.
    #[prost(bool, tag = "9")]
    pub connected: bool,
}

/// `connection_list` response.
#[derive(Clone, PartialEq, Message)]
pub struct ConnectionListResponse {
    /// 0 on success.
    #[prost(uint32, tag = "1")]
    pub status: u32,
    /// Error description.
    #[prost(string, tag = "2")]
    pub error_message: String,
    /// One row per allowed host.
    #[prost(message, repeated, tag = "3")]
    pub connections: Vec<ConnectionDescriptor>,
}

/// `get_subsystems` response.
#[derive(Clone, PartialEq, Message)]
pub struct GetSubsystemsResponse {
    /// 0 on success.
    #[prost(uint32, tag = "1")]
    pub status: u32,
    /// Error description.
    #[prost(string, tag = "2")]
    pub error_message: String,
    /// Engine-reported subsystems.
    #[prost(message, repeated, tag = "3")]
    pub subsystems: Vec<SubsystemDescriptor>,
}

/// `gateway_info` response.
#[derive(Clone, PartialEq, Message)]
pub struct GatewayInfoResponse {
    /// 0 on success.
    #[prost(uint32, tag = "1")]
    pub status: u32,
    /// Error description.
    #[prost(string, tag = "2")]
    pub error_message: String,
    /// Gateway name.
    #[prost(string, tag = "3")]
    pub name: String,
    /// Gateway group.
    #[prost(string, tag = "4")]
    pub group: String,
    /// Daemon version.
    #[prost(string, tag = "5")]
    pub version: String,
    /// Admin address.
    #[prost(string, tag = "6")]
    pub addr: String,
    /// Admin port.
    #[prost(uint32, tag = "7")]
    pub port: u32,
    /// ANA groups this gateway currently serves as optimized.
    #[prost(uint32, repeated, tag = "8")]
    pub optimized_groups: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_tag_roundtrip() {
        let request = SubsystemAddRequest {
            nqn: "nqn.2016-06.io.spdk:cnode1".to_string(),
            serial: None,
            max_namespaces: Some(256),
            no_group_append: true,
        };
        let frame = encode_frame(MessageType::SubsystemAdd, &request);
        let (tag, body) = split_frame(&frame).unwrap();
        assert_eq!(tag, MessageType::SubsystemAdd);
        let decoded: SubsystemAddRequest = decode_body(body).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn empty_and_unknown_frames_rejected() {
        assert!(matches!(split_frame(&[]), Err(ProtocolError::EmptyFrame)));
        assert!(matches!(
            split_frame(&[200, 1, 2]),
            Err(ProtocolError::UnknownMessageType(200))
        ));
    }

    #[test]
    fn all_tags_roundtrip() {
        for tag in 1..=17u8 {
            let parsed = MessageType::from_u8(tag).unwrap();
            assert_eq!(parsed as u8, tag);
        }
        assert!(MessageType::from_u8(0).is_none());
        assert!(MessageType::from_u8(18).is_none());
    }
}
