//! Discovery responder over its own wire protocol: initialize the
//! connection, connect as a host, fetch the discovery log page.

mod common;

use common::{spawn_gateway, CNODE1, HOST1};
use nvgw_core::model::{AddrFamily, Listener, Transport};
use nvgw_core::statemap::MemoryClusterMap;
use nvgw_daemon::discovery::DiscoveryResponder;
use nvgw_daemon::service::host::HostAddParams;
use nvgw_daemon::service::subsystem::SubsystemAddParams;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn icreq() -> Vec<u8> {
    let mut pdu = vec![0u8; 128];
    pdu[0] = 0x00; // ICReq
    pdu[2] = 128; // hlen
    pdu[4..8].copy_from_slice(&128u32.to_le_bytes());
    pdu
}

fn connect_capsule(cid: u16, host_nqn: &str) -> Vec<u8> {
    let total = 8 + 64 + 1024;
    let mut pdu = vec![0u8; total];
    pdu[0] = 0x04; // CapsuleCmd
    pdu[2] = 72;
    pdu[4..8].copy_from_slice(&(total as u32).to_le_bytes());
    // SQE: fabric connect.
    pdu[8] = 0x7f;
    pdu[10..12].copy_from_slice(&cid.to_le_bytes());
    pdu[12] = 0x01; // fctype: connect
    // Connect data: subnqn @256, hostnqn @512 within the data region.
    let data = &mut pdu[8 + 64..];
    data[256..256 + 36].copy_from_slice(&b"nqn.2014-08.org.nvmexpress.discovery"[..]);
    data[512..512 + host_nqn.len()].copy_from_slice(host_nqn.as_bytes());
    pdu
}

fn get_log_page_capsule(cid: u16, dwords: u32, offset: u64) -> Vec<u8> {
    let mut pdu = vec![0u8; 8 + 64];
    pdu[0] = 0x04;
    pdu[2] = 72;
    pdu[4..8].copy_from_slice(&72u32.to_le_bytes());
    pdu[8] = 0x02; // Get Log Page
    pdu[10..12].copy_from_slice(&cid.to_le_bytes());
    let numd = dwords - 1;
    let cdw10 = 0x70u32 | ((numd & 0xffff) << 16);
    let cdw11 = numd >> 16;
    pdu[8 + 40..8 + 44].copy_from_slice(&cdw10.to_le_bytes());
    pdu[8 + 44..8 + 48].copy_from_slice(&cdw11.to_le_bytes());
    pdu[8 + 48..8 + 56].copy_from_slice(&offset.to_le_bytes());
    pdu
}

async fn read_pdu(stream: &mut tokio::net::TcpStream) -> Vec<u8> {
    let mut header = vec![0u8; 8];
    stream.read_exact(&mut header).await.unwrap();
    let total = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
    let mut pdu = header;
    pdu.resize(total, 0);
    stream.read_exact(&mut pdu[8..]).await.unwrap();
    pdu
}

#[tokio::test]
async fn host_fetches_its_discovery_log() {
    let map = MemoryClusterMap::shared();
    let gw = spawn_gateway("gw-1", &map).await;

    gw.service
        .subsystem_add(SubsystemAddParams {
            nqn: CNODE1.to_string(),
            serial: None,
            max_namespaces: None,
            no_group_append: true,
        })
        .await
        .unwrap();
    gw.service
        .listener_add(Listener {
            subsystem_nqn: CNODE1.to_string(),
            gateway: "gw-1".to_string(),
            transport: Transport::Tcp,
            adrfam: AddrFamily::Ipv4,
            traddr: "192.168.13.3".to_string(),
            trsvcid: 4420,
            secure: false,
        })
        .await
        .unwrap();
    gw.service
        .host_add(HostAddParams {
            nqn: CNODE1.to_string(),
            host_nqn: HOST1.to_string(),
            psk: None,
            dhchap: None,
            dhchap_ctrlr: None,
        })
        .await
        .unwrap();
    // The responder reads the snapshot cache, fed by the watch worker.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(3);
    loop {
        if gw.ctx.cache.read().await.records.len() >= 3 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "cache never primed");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let responder = DiscoveryResponder::bind("127.0.0.1:0".parse().unwrap(), gw.ctx.clone())
        .await
        .unwrap();
    let addr = responder.local_addr().unwrap();
    tokio::spawn(responder.run());

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();

    // ICReq → ICResp.
    stream.write_all(&icreq()).await.unwrap();
    let icresp = read_pdu(&mut stream).await;
    assert_eq!(icresp[0], 0x01);
    assert_eq!(icresp.len(), 128);

    // Connect as host1.
    stream.write_all(&connect_capsule(1, HOST1)).await.unwrap();
    let resp = read_pdu(&mut stream).await;
    assert_eq!(resp[0], 0x05);
    // Status (low bit is the phase tag, upper bits the code) is zero.
    assert_eq!(u16::from_le_bytes(resp[22..24].try_into().unwrap()) >> 1, 0);

    // Fetch the log header plus one entry.
    stream
        .write_all(&get_log_page_capsule(2, 2048 / 4, 0))
        .await
        .unwrap();
    let data = read_pdu(&mut stream).await;
    assert_eq!(data[0], 0x07, "expected a C2H data pdu");
    let payload = &data[24..];
    let numrec = u64::from_le_bytes(payload[8..16].try_into().unwrap());
    assert_eq!(numrec, 1, "one (subsystem, listener) pair visible");
    let entry = &payload[1024..2048];
    assert!(entry[256..].starts_with(CNODE1.as_bytes()));
    assert!(entry[512..].starts_with(b"192.168.13.3"));
    let resp = read_pdu(&mut stream).await;
    assert_eq!(resp[0], 0x05);
}
