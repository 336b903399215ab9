//! End-to-end admin protocol: framed requests over TCP against a live
//! server, through the dispatcher, down to the engine and the map.

mod common;

use common::{spawn_gateway, CNODE1};
use futures::{SinkExt, StreamExt};
use nvgw_core::error::ErrorKind;
use nvgw_core::statemap::MemoryClusterMap;
use nvgw_daemon::protocol::messages::{
    decode_body, encode_frame, split_frame, GetSubsystemsRequest, GetSubsystemsResponse,
    MessageType, StatusResponse, SubsystemAddRequest, SubsystemAddResponse, SubsystemDelRequest,
};
use nvgw_daemon::protocol::{AdminDispatcher, AdminServer, FrameCodec};
use tokio_util::codec::Framed;

async fn start_server(
    gw: &common::TestGateway,
) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let dispatcher = AdminDispatcher::new(gw.service.clone());
    let server = AdminServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        None,
        dispatcher,
        gw.ctx.clone(),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let task = tokio::spawn(server.run());
    (addr, task)
}

#[tokio::test]
async fn subsystem_lifecycle_over_the_wire() {
    let map = MemoryClusterMap::shared();
    let gw = spawn_gateway("gw-1", &map).await;
    let (addr, _server) = start_server(&gw).await;

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());

    // Create.
    framed
        .send(encode_frame(
            MessageType::SubsystemAdd,
            &SubsystemAddRequest {
                nqn: CNODE1.to_string(),
                serial: None,
                max_namespaces: Some(16),
                no_group_append: true,
            },
        ))
        .await
        .unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    let (tag, body) = split_frame(&frame).unwrap();
    assert_eq!(tag, MessageType::SubsystemAdd);
    let response: SubsystemAddResponse = decode_body(body).unwrap();
    assert_eq!(response.status, 0, "{}", response.error_message);
    assert_eq!(response.nqn, CNODE1);
    assert!(!response.serial.is_empty());

    // Duplicate creation reports AlreadyExists on the wire.
    framed
        .send(encode_frame(
            MessageType::SubsystemAdd,
            &SubsystemAddRequest {
                nqn: CNODE1.to_string(),
                serial: None,
                max_namespaces: Some(16),
                no_group_append: true,
            },
        ))
        .await
        .unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    let (_, body) = split_frame(&frame).unwrap();
    let response: SubsystemAddResponse = decode_body(body).unwrap();
    assert_eq!(response.status, ErrorKind::AlreadyExists.code());

    // Snapshot through the same connection.
    framed
        .send(encode_frame(
            MessageType::GetSubsystems,
            &GetSubsystemsRequest {},
        ))
        .await
        .unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    let (_, body) = split_frame(&frame).unwrap();
    let response: GetSubsystemsResponse = decode_body(body).unwrap();
    assert_eq!(response.status, 0);
    assert_eq!(response.subsystems.len(), 1);
    assert_eq!(response.subsystems[0].nqn, CNODE1);

    // Delete.
    framed
        .send(encode_frame(
            MessageType::SubsystemDel,
            &SubsystemDelRequest {
                nqn: CNODE1.to_string(),
                force: false,
            },
        ))
        .await
        .unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    let (_, body) = split_frame(&frame).unwrap();
    let response: StatusResponse = decode_body(body).unwrap();
    assert_eq!(response.status, 0, "{}", response.error_message);
}

#[tokio::test]
async fn unknown_nqn_is_not_found_on_the_wire() {
    let map = MemoryClusterMap::shared();
    let gw = spawn_gateway("gw-1", &map).await;
    let (addr, _server) = start_server(&gw).await;

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());
    framed
        .send(encode_frame(
            MessageType::SubsystemDel,
            &SubsystemDelRequest {
                nqn: CNODE1.to_string(),
                force: false,
            },
        ))
        .await
        .unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    let (_, body) = split_frame(&frame).unwrap();
    let response: StatusResponse = decode_body(body).unwrap();
    assert_eq!(response.status, ErrorKind::NotFound.code());
    assert!(response.error_message.contains(CNODE1));
}
