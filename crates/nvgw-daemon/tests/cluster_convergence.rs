//! Multi-gateway convergence through the shared state map.

mod common;

use common::{spawn_gateway, wait_until, CNODE1, HOST1, PSK1};
use nvgw_core::keys::KeyKind;
use nvgw_core::model::{AddrFamily, Listener, Transport};
use nvgw_core::statemap::MemoryClusterMap;
use nvgw_daemon::service::host::HostAddParams;
use nvgw_daemon::service::namespace::NamespaceAddParams;
use nvgw_daemon::service::subsystem::SubsystemAddParams;

fn sub_params(nqn: &str) -> SubsystemAddParams {
    SubsystemAddParams {
        nqn: nqn.to_string(),
        serial: Some("SN1".to_string()),
        max_namespaces: Some(256),
        no_group_append: true,
    }
}

fn ns_params(nqn: &str, image: &str, lb_group: u32) -> NamespaceAddParams {
    NamespaceAddParams {
        nqn: nqn.to_string(),
        nsid: None,
        pool: "rbd".to_string(),
        image: image.to_string(),
        size_bytes: Some(10 * 1024 * 1024),
        uuid: None,
        lb_group: Some(lb_group),
        auto_visible: Some(true),
        block_size: None,
    }
}

#[tokio::test]
async fn peer_converges_on_full_subsystem_setup() {
    let map = MemoryClusterMap::shared();
    let gw1 = spawn_gateway("gw-1", &map).await;
    let gw2 = spawn_gateway("gw-2", &map).await;

    gw1.service.subsystem_add(sub_params(CNODE1)).await.unwrap();
    let ns = gw1
        .service
        .namespace_add(ns_params(CNODE1, "demo_image", 1))
        .await
        .unwrap();
    assert_eq!(ns.nsid, 1);
    gw1.service
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
    gw1.service
        .host_add(HostAddParams {
            nqn: CNODE1.to_string(),
            host_nqn: "*".to_string(),
            psk: None,
            dhchap: None,
            dhchap_ctrlr: None,
        })
        .await
        .unwrap();

    // The peer's engine mirrors the declared state.
    wait_until("peer engine converged", || {
        let engine = gw2.engine.lock().unwrap();
        engine.subsystems.len() == 1
            && engine.subsystems[0].nqn == CNODE1
            && engine.subsystems[0].namespaces.len() == 1
            && engine.subsystems[0].namespaces[0].nsid == 1
            && engine.subsystems[0].allow_any_host
    })
    .await;

    // The listener is realized only on its owner; the peer records it in
    // the map but serves nothing on that address.
    assert_eq!(
        gw1.engine.lock().unwrap().subsystems[0].listen_addresses.len(),
        1
    );
    assert!(gw2.engine.lock().unwrap().subsystems[0]
        .listen_addresses
        .is_empty());

    // The namespace UUID is identical on both gateways.
    let uuid1 = gw1.engine.lock().unwrap().subsystems[0].namespaces[0].uuid.clone();
    let uuid2 = gw2.engine.lock().unwrap().subsystems[0].namespaces[0].uuid.clone();
    assert_eq!(uuid1, uuid2);
}

#[tokio::test]
async fn concurrent_namespace_churn_converges() {
    let map = MemoryClusterMap::shared();
    let gw1 = spawn_gateway("gw-1", &map).await;
    let gw2 = spawn_gateway("gw-2", &map).await;

    gw1.service.subsystem_add(sub_params(CNODE1)).await.unwrap();
    wait_until("peer sees the subsystem", || {
        gw2.engine.lock().unwrap().subsystems.len() == 1
    })
    .await;

    // 40 namespaces, alternating LB group, created concurrently from
    // both gateways.
    let mut tasks = Vec::new();
    for i in 0..40u32 {
        let service = if i % 2 == 0 {
            gw1.service.clone()
        } else {
            gw2.service.clone()
        };
        let group = (i % 2) + 1;
        tasks.push(tokio::spawn(async move {
            // `Aborted` is the documented retry signal for callers.
            loop {
                match service
                    .namespace_add(ns_params(CNODE1, &format!("img_{i}"), group))
                    .await
                {
                    Ok(namespace) => break namespace,
                    Err(e) if e.kind == nvgw_core::error::ErrorKind::Aborted => {}
                    Err(e) => panic!("namespace_add img_{i}: {e}"),
                }
            }
        }));
    }
    let mut nsids = Vec::new();
    for task in tasks {
        nsids.push(task.await.unwrap().nsid);
    }
    nsids.sort_unstable();
    nsids.dedup();
    assert_eq!(nsids.len(), 40, "nsids must be unique cluster-wide");

    wait_until("both engines hold 40 namespaces", || {
        gw1.engine.lock().unwrap().subsystems[0].namespaces.len() == 40
            && gw2.engine.lock().unwrap().subsystems[0].namespaces.len() == 40
    })
    .await;

    // Delete half from one gateway, the rest from the other.
    for nsid in 1..=20u32 {
        gw1.service.namespace_del(CNODE1, nsid).await.unwrap();
    }
    wait_until("both engines hold 20 namespaces", || {
        gw1.engine.lock().unwrap().subsystems[0].namespaces.len() == 20
            && gw2.engine.lock().unwrap().subsystems[0].namespaces.len() == 20
    })
    .await;
    for nsid in 21..=40u32 {
        gw2.service.namespace_del(CNODE1, nsid).await.unwrap();
    }
    wait_until("both engines are empty", || {
        gw1.engine.lock().unwrap().subsystems[0].namespaces.is_empty()
            && gw2.engine.lock().unwrap().subsystems[0].namespaces.is_empty()
    })
    .await;
}

#[tokio::test]
async fn host_keys_materialize_on_peers() {
    let map = MemoryClusterMap::shared();
    let gw1 = spawn_gateway("gw-1", &map).await;
    let gw2 = spawn_gateway("gw-2", &map).await;

    gw1.service.subsystem_add(sub_params(CNODE1)).await.unwrap();
    gw1.service
        .host_add(HostAddParams {
            nqn: CNODE1.to_string(),
            host_nqn: HOST1.to_string(),
            psk: Some(PSK1.to_string()),
            dhchap: None,
            dhchap_ctrlr: None,
        })
        .await
        .unwrap();

    // The peer unseals the key from the map and installs it in its own
    // engine keyring and key file.
    wait_until("peer installed the key", || {
        !gw2.engine.lock().unwrap().keyring.is_empty()
    })
    .await;
    let peer_file = gw2.key_files().key_path(KeyKind::Psk, CNODE1, HOST1);
    wait_until("peer key file exists", || peer_file.exists()).await;
    let contents = std::fs::read_to_string(&peer_file).unwrap();
    assert_eq!(contents.trim_end(), PSK1);

    // Revocation cleans up both gateways.
    gw1.service.host_del(CNODE1, HOST1).await.unwrap();
    wait_until("peer revoked the key", || {
        gw2.engine.lock().unwrap().keyring.is_empty() && !peer_file.exists()
    })
    .await;
}

#[tokio::test]
async fn late_joining_gateway_reconciles_at_startup() {
    let map = MemoryClusterMap::shared();
    let gw1 = spawn_gateway("gw-1", &map).await;
    gw1.service.subsystem_add(sub_params(CNODE1)).await.unwrap();
    gw1.service
        .namespace_add(ns_params(CNODE1, "demo_image", 1))
        .await
        .unwrap();

    // A gateway that starts after the fact converges before serving.
    let late = spawn_gateway("gw-3", &map).await;
    let engine = late.engine.lock().unwrap();
    assert_eq!(engine.subsystems.len(), 1);
    assert_eq!(engine.subsystems[0].namespaces.len(), 1);
}
