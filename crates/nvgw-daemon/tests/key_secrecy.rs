//! Key secrecy: no log line at any level carries raw key bytes, and the
//! sealed state-map payload never contains them either.

mod common;

use std::io::Write;
use std::sync::{Arc, Mutex};

use common::{spawn_gateway, CNODE1, HOST1, PSK1};
use nvgw_core::statemap::{ClusterMap, MemoryClusterMap, StateKey};
use nvgw_daemon::service::host::HostAddParams;
use nvgw_daemon::service::subsystem::SubsystemAddParams;

const DHCHAP1: &str = "DHHC-1:00:mWStgaqHdIJ9hBNu+natqRoAuRZTzJlgyHBzBCLEp7TZMBvA:";

/// Collects everything the subscriber writes.
#[derive(Clone, Default)]
struct CaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn secret_fragments() -> Vec<&'static str> {
    // The interesting parts are the base64 payloads; prefixes alone are
    // format markers, not secrets.
    vec![
        "YzrPElk4OYy1uUqU8FXK64ybAg4HsCfzmOmldItqzT2pmiQp",
        "mWStgaqHdIJ9hBNu+natqRoAuRZTzJlgyHBzBCLEp7TZMBvA",
    ]
}

#[tokio::test]
async fn logs_never_contain_key_bytes() {
    let writer = CaptureWriter::default();
    let buffer = Arc::clone(&writer.buffer);
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

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
        .host_add(HostAddParams {
            nqn: CNODE1.to_string(),
            host_nqn: HOST1.to_string(),
            psk: Some(PSK1.to_string()),
            dhchap: Some(DHCHAP1.to_string()),
            dhchap_ctrlr: Some(DHCHAP1.to_string()),
        })
        .await
        .unwrap();
    // A failing path logs too; it must be just as silent about bytes.
    let _ = gw
        .service
        .host_add(HostAddParams {
            nqn: CNODE1.to_string(),
            host_nqn: HOST1.to_string(),
            psk: Some(PSK1.to_string()),
            dhchap: None,
            dhchap_ctrlr: None,
        })
        .await
        .unwrap_err();
    gw.service.host_del(CNODE1, HOST1).await.unwrap();
    gw.service.subsystem_del(CNODE1, true).await.unwrap();

    let text = String::from_utf8_lossy(&buffer.lock().unwrap()).into_owned();
    assert!(
        text.contains("host access granted"),
        "expected the capture to contain normal service logs"
    );
    for fragment in secret_fragments() {
        assert!(
            !text.contains(fragment),
            "log output leaked key bytes ({} chars captured)",
            text.len()
        );
    }
}

#[tokio::test]
async fn state_map_payloads_are_sealed() {
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
        .host_add(HostAddParams {
            nqn: CNODE1.to_string(),
            host_nqn: HOST1.to_string(),
            psk: Some(PSK1.to_string()),
            dhchap: None,
            dhchap_ctrlr: None,
        })
        .await
        .unwrap();

    let snapshot = map.snapshot().await.unwrap();
    let mut key_records = 0;
    for (key, record) in &snapshot.records {
        if matches!(key, StateKey::Key { .. }) {
            key_records += 1;
        }
        for fragment in secret_fragments() {
            assert!(
                !record
                    .payload
                    .windows(fragment.len())
                    .any(|w| w == fragment.as_bytes()),
                "record {key} stores raw key bytes"
            );
        }
    }
    assert_eq!(key_records, 1);
}
