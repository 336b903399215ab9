//! JSON-RPC socket client for the target engine.
//!
//! One dedicated worker task owns the Unix-socket stream. Requests are
//! funneled through an mpsc queue so there is exactly one outstanding
//! call at any moment; responses are matched by a monotonically
//! increasing id, and responses for abandoned (timed-out) ids are
//! discarded instead of being misdelivered to the next caller.
//!
//! Reconnection: a failed write or read drops the stream and retries the
//! in-flight request up to `conn_retries` times before the engine is
//! declared unreachable.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use nvgw_core::model::AnaState;

use super::{
    TgtApi, TgtConnection, TgtError, TgtResult, TgtSubsystem,
};

/// Depth of the request queue in front of the worker.
const REQUEST_QUEUE_DEPTH: usize = 64;

/// Delay between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Client configuration, taken from the `[spdk]` section.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Path of the engine's JSON-RPC Unix socket.
    pub socket_path: PathBuf,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Reconnect attempts before declaring the engine unreachable.
    pub conn_retries: u32,
}

struct Request {
    method: &'static str,
    params: Value,
    reply: oneshot::Sender<TgtResult<Value>>,
}

/// Socket-backed [`TgtApi`] implementation.
pub struct JsonRpcTgt {
    tx: mpsc::Sender<Request>,
}

impl std::fmt::Debug for JsonRpcTgt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcTgt").finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

impl JsonRpcTgt {
    /// Spawns the socket worker and returns the client handle.
    #[must_use]
    pub fn spawn(config: RpcClientConfig) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        tokio::spawn(worker(config, rx));
        Self { tx }
    }

    async fn call(&self, method: &'static str, params: Value) -> TgtResult<Value> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request {
                method,
                params,
                reply,
            })
            .await
            .map_err(|_| TgtError::unreachable("engine worker stopped"))?;
        rx.await
            .map_err(|_| TgtError::unreachable("engine worker dropped the request"))?
    }

    async fn call_ok(&self, method: &'static str, params: Value) -> TgtResult<()> {
        self.call(method, params).await.map(|_| ())
    }
}

async fn worker(config: RpcClientConfig, mut rx: mpsc::Receiver<Request>) {
    let mut conn: Option<BufReader<UnixStream>> = None;
    let mut next_id: u64 = 0;

    while let Some(request) = rx.recv().await {
        next_id += 1;
        let id = next_id;
        let result = perform(&config, &mut conn, id, request.method, &request.params).await;
        // The caller may have given up; that is fine.
        let _ = request.reply.send(result);
    }
    debug!("engine rpc worker exiting");
}

async fn perform(
    config: &RpcClientConfig,
    conn: &mut Option<BufReader<UnixStream>>,
    id: u64,
    method: &'static str,
    params: &Value,
) -> TgtResult<Value> {
    let mut attempts_left = config.conn_retries.max(1);
    loop {
        if conn.is_none() {
            match UnixStream::connect(&config.socket_path).await {
                Ok(stream) => *conn = Some(BufReader::new(stream)),
                Err(e) => {
                    attempts_left -= 1;
                    if attempts_left == 0 {
                        return Err(TgtError::unreachable(format!(
                            "engine socket {} unreachable: {e}",
                            config.socket_path.display()
                        )));
                    }
                    warn!(
                        socket = %config.socket_path.display(),
                        error = %e,
                        attempts_left,
                        "engine connect failed, retrying"
                    );
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            }
        }

        let stream = conn.as_mut().expect("connection just established");
        match tokio::time::timeout(config.timeout, exchange(stream, id, method, params)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(ExchangeError::Engine(err))) => return Err(err),
            Ok(Err(ExchangeError::Io(e))) => {
                *conn = None;
                attempts_left -= 1;
                if attempts_left == 0 {
                    return Err(TgtError::unreachable(format!(
                        "engine i/o failed: {e}"
                    )));
                }
                warn!(error = %e, attempts_left, "engine i/o failed, reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
            Err(_) => {
                // Leave the stream up: the reader skips stale ids, so the
                // late response cannot be misdelivered.
                return Err(TgtError::timed_out(format!(
                    "engine call {method} timed out after {:?}",
                    config.timeout
                )));
            }
        }
    }
}

enum ExchangeError {
    Io(std::io::Error),
    Engine(TgtError),
}

impl From<std::io::Error> for ExchangeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

async fn exchange(
    stream: &mut BufReader<UnixStream>,
    id: u64,
    method: &str,
    params: &Value,
) -> Result<Value, ExchangeError> {
    let mut line = serde_json::to_string(&json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    }))
    .map_err(|e| ExchangeError::Io(std::io::Error::other(e)))?;
    line.push('\n');
    stream.get_mut().write_all(line.as_bytes()).await?;

    let mut buf = String::new();
    loop {
        buf.clear();
        let n = stream.read_line(&mut buf).await?;
        if n == 0 {
            return Err(ExchangeError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "engine closed the socket",
            )));
        }
        let response: RpcResponse = match serde_json::from_str(buf.trim_end()) {
            Ok(r) => r,
            Err(e) => {
                return Err(ExchangeError::Engine(TgtError::engine(
                    -32700,
                    format!("unparseable engine response: {e}"),
                )))
            }
        };
        if response.id < id {
            // Response to an abandoned call; skip it.
            debug!(stale = response.id, current = id, "discarding stale engine response");
            continue;
        }
        if let Some(err) = response.error {
            return Err(ExchangeError::Engine(TgtError::engine(err.code, err.message)));
        }
        return Ok(response.result.unwrap_or(Value::Null));
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> TgtResult<T> {
    serde_json::from_value(value)
        .map_err(|e| TgtError::engine(-32700, format!("bad {what} payload: {e}")))
}

#[async_trait::async_trait]
impl TgtApi for JsonRpcTgt {
    async fn create_subsystem(
        &mut self,
        nqn: &str,
        serial: &str,
        max_namespaces: u32,
    ) -> TgtResult<()> {
        self.call_ok(
            "nvmf_create_subsystem",
            json!({
                "nqn": nqn,
                "serial_number": serial,
                "max_namespaces": max_namespaces,
                "ana_reporting": true,
            }),
        )
        .await
    }

    async fn delete_subsystem(&mut self, nqn: &str) -> TgtResult<()> {
        self.call_ok("nvmf_delete_subsystem", json!({ "nqn": nqn })).await
    }

    async fn create_bdev(
        &mut self,
        name: &str,
        pool: &str,
        image: &str,
        block_size: u32,
    ) -> TgtResult<String> {
        let result = self
            .call(
                "bdev_rbd_create",
                json!({
                    "name": name,
                    "pool_name": pool,
                    "rbd_name": image,
                    "block_size": block_size,
                }),
            )
            .await?;
        decode(result, "bdev name")
    }

    async fn delete_bdev(&mut self, name: &str) -> TgtResult<()> {
        self.call_ok("bdev_rbd_delete", json!({ "name": name })).await
    }

    async fn resize_bdev(&mut self, name: &str, new_size_bytes: u64) -> TgtResult<()> {
        // The engine takes the new size in MiB.
        self.call_ok(
            "bdev_rbd_resize",
            json!({ "name": name, "new_size": new_size_bytes / (1024 * 1024) }),
        )
        .await
    }

    async fn add_namespace(
        &mut self,
        nqn: &str,
        bdev_name: &str,
        nsid: u32,
        uuid: &str,
        anagrpid: u32,
    ) -> TgtResult<u32> {
        let result = self
            .call(
                "nvmf_subsystem_add_ns",
                json!({
                    "nqn": nqn,
                    "namespace": {
                        "bdev_name": bdev_name,
                        "nsid": nsid,
                        "uuid": uuid,
                        "anagrpid": anagrpid,
                    },
                }),
            )
            .await?;
        decode(result, "nsid")
    }

    async fn remove_namespace(&mut self, nqn: &str, nsid: u32) -> TgtResult<()> {
        self.call_ok("nvmf_subsystem_remove_ns", json!({ "nqn": nqn, "nsid": nsid }))
            .await
    }

    async fn set_namespace_ana_group(
        &mut self,
        nqn: &str,
        nsid: u32,
        anagrpid: u32,
    ) -> TgtResult<()> {
        self.call_ok(
            "nvmf_subsystem_set_ns_ana_group",
            json!({ "nqn": nqn, "nsid": nsid, "anagrpid": anagrpid }),
        )
        .await
    }

    async fn set_namespace_visibility(
        &mut self,
        nqn: &str,
        nsid: u32,
        host_nqn: &str,
        visible: bool,
    ) -> TgtResult<()> {
        let method = if visible {
            "nvmf_ns_add_host"
        } else {
            "nvmf_ns_remove_host"
        };
        self.call_ok(method, json!({ "nqn": nqn, "nsid": nsid, "host": host_nqn }))
            .await
    }

    async fn add_listener(
        &mut self,
        nqn: &str,
        trtype: &str,
        adrfam: &str,
        traddr: &str,
        trsvcid: u16,
        secure: bool,
    ) -> TgtResult<()> {
        self.call_ok(
            "nvmf_subsystem_add_listener",
            json!({
                "nqn": nqn,
                "listen_address": {
                    "trtype": trtype,
                    "adrfam": adrfam,
                    "traddr": traddr,
                    "trsvcid": trsvcid.to_string(),
                },
                "secure_channel": secure,
            }),
        )
        .await
    }

    async fn remove_listener(
        &mut self,
        nqn: &str,
        trtype: &str,
        adrfam: &str,
        traddr: &str,
        trsvcid: u16,
    ) -> TgtResult<()> {
        self.call_ok(
            "nvmf_subsystem_remove_listener",
            json!({
                "nqn": nqn,
                "listen_address": {
                    "trtype": trtype,
                    "adrfam": adrfam,
                    "traddr": traddr,
                    "trsvcid": trsvcid.to_string(),
                },
            }),
        )
        .await
    }

    async fn set_ana_state(
        &mut self,
        nqn: &str,
        group: u32,
        state: AnaState,
    ) -> TgtResult<()> {
        self.call_ok(
            "nvmf_subsystem_set_ana_state",
            json!({ "nqn": nqn, "anagrpid": group, "ana_state": state.as_str() }),
        )
        .await
    }

    async fn add_host(
        &mut self,
        nqn: &str,
        host_nqn: &str,
        psk_name: Option<&str>,
        dhchap_name: Option<&str>,
        dhchap_ctrlr_name: Option<&str>,
    ) -> TgtResult<()> {
        let mut params = json!({ "nqn": nqn, "host": host_nqn });
        if let Some(psk) = psk_name {
            params["psk"] = json!(psk);
        }
        if let Some(key) = dhchap_name {
            params["dhchap_key"] = json!(key);
        }
        if let Some(key) = dhchap_ctrlr_name {
            params["dhchap_ctrlr_key"] = json!(key);
        }
        self.call_ok("nvmf_subsystem_add_host", params).await
    }

    async fn remove_host(&mut self, nqn: &str, host_nqn: &str) -> TgtResult<()> {
        self.call_ok(
            "nvmf_subsystem_remove_host",
            json!({ "nqn": nqn, "host": host_nqn }),
        )
        .await
    }

    async fn allow_any_host(&mut self, nqn: &str, allow: bool) -> TgtResult<()> {
        self.call_ok(
            "nvmf_subsystem_allow_any_host",
            json!({ "nqn": nqn, "allow_any_host": allow }),
        )
        .await
    }

    async fn get_subsystems(&mut self) -> TgtResult<Vec<TgtSubsystem>> {
        let result = self.call("nvmf_get_subsystems", json!({})).await?;
        decode(result, "subsystem list")
    }

    async fn get_connections(&mut self, nqn: &str) -> TgtResult<Vec<TgtConnection>> {
        let result = self
            .call("nvmf_subsystem_get_controllers", json!({ "nqn": nqn }))
            .await?;
        decode(result, "controller list")
    }

    async fn keyring_add(&mut self, name: &str, path: &str) -> TgtResult<()> {
        self.call_ok("keyring_file_add_key", json!({ "name": name, "path": path }))
            .await
    }

    async fn keyring_remove(&mut self, name: &str) -> TgtResult<()> {
        match self
            .call_ok("keyring_file_remove_key", json!({ "name": name }))
            .await
        {
            Ok(()) => Ok(()),
            // Removing an unknown key is idempotent.
            Err(e) if e.code == Some(-2) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn create_transport(
        &mut self,
        trtype: &str,
        options: Option<&serde_json::Value>,
    ) -> TgtResult<()> {
        let mut params = json!({ "trtype": trtype });
        if let Some(Value::Object(extra)) = options {
            for (k, v) in extra {
                params[k] = v.clone();
            }
        }
        self.call_ok("nvmf_create_transport", params).await
    }

    async fn set_log_level(&mut self, level: &str) -> TgtResult<()> {
        self.call_ok("log_set_level", json!({ "level": level })).await?;
        self.call_ok("log_set_print_level", json!({ "level": level }))
            .await
    }

    async fn version(&mut self) -> TgtResult<String> {
        let result = self.call("spdk_get_version", json!({})).await?;
        let version = result
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    async fn serve_one(listener: UnixListener, respond: impl Fn(u64) -> String) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        let request: Value = serde_json::from_slice(&buf[..n]).unwrap();
        let id = request["id"].as_u64().unwrap();
        stream
            .write_all(respond(id).as_bytes())
            .await
            .unwrap();
    }

    fn config(path: &std::path::Path) -> RpcClientConfig {
        RpcClientConfig {
            socket_path: path.to_path_buf(),
            timeout: Duration::from_secs(2),
            conn_retries: 1,
        }
    }

    #[tokio::test]
    async fn result_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spdk.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_one(listener, |id| {
            format!("{{\"jsonrpc\":\"2.0\",\"id\":{id},\"result\":{{\"version\":\"v25.01\"}}}}\n")
        }));

        let mut client = JsonRpcTgt::spawn(config(&path));
        let version = client.version().await.unwrap();
        assert_eq!(version, "v25.01");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn engine_error_surfaces_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spdk.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_one(listener, |id| {
            format!(
                "{{\"jsonrpc\":\"2.0\",\"id\":{id},\"error\":{{\"code\":-17,\"message\":\"File exists\"}}}}\n"
            )
        }));

        let mut client = JsonRpcTgt::spawn(config(&path));
        let err = client
            .create_subsystem("nqn.2016-06.io.spdk:cnode1", "SN1", 256)
            .await
            .unwrap_err();
        assert_eq!(err.code, Some(-17));
        assert!(!err.unreachable);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_after_bounded_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.sock");
        let mut client = JsonRpcTgt::spawn(RpcClientConfig {
            socket_path: path,
            timeout: Duration::from_millis(500),
            conn_retries: 1,
        });
        let err = client.version().await.unwrap_err();
        assert!(err.unreachable);
    }

    #[tokio::test]
    async fn stale_responses_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spdk.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_one(listener, |id| {
            // A leftover response for an older id precedes the real one.
            format!(
                "{{\"jsonrpc\":\"2.0\",\"id\":{},\"result\":\"stale\"}}\n{{\"jsonrpc\":\"2.0\",\"id\":{id},\"result\":{{\"version\":\"v25.01\"}}}}\n",
                id.saturating_sub(1)
            )
        }));

        let mut client = JsonRpcTgt::spawn(config(&path));
        let version = client.version().await.unwrap();
        assert_eq!(version, "v25.01");
        server.await.unwrap();
    }
}
