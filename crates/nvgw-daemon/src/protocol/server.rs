//! Admin protocol server.
//!
//! A TCP listener (optionally mutual-TLS via the `[mtls]` section)
//! accepting framed admin connections. Handlers run concurrently; the
//! internal blocking points (engine socket, state map, monitor channel)
//! each own a dedicated worker, so a handler never blocks another on
//! I/O.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use nvgw_core::error::{GwError, GwResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tracing::{info, warn};

use super::dispatch::AdminDispatcher;
use super::framing::FrameCodec;
use crate::state::SharedContext;

/// Accept poll interval; bounds shutdown latency.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// TLS material paths from the `[mtls]` section.
#[derive(Debug, Clone)]
pub struct MtlsPaths {
    /// Server private key (PEM).
    pub server_key: String,
    /// Server certificate (PEM).
    pub server_cert: String,
    /// Client certificate used as the trust root for peers (PEM).
    pub client_cert: String,
}

fn load_certs(path: &str) -> GwResult<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path)
        .map_err(|e| GwError::invalid_argument(format!("failed to read {path}: {e}")))?;
    rustls_pemfile::certs(&mut data.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GwError::invalid_argument(format!("bad certificate in {path}: {e}")))
}

fn load_key(path: &str) -> GwResult<PrivateKeyDer<'static>> {
    let data = std::fs::read(path)
        .map_err(|e| GwError::invalid_argument(format!("failed to read {path}: {e}")))?;
    rustls_pemfile::private_key(&mut data.as_slice())
        .map_err(|e| GwError::invalid_argument(format!("bad private key in {path}: {e}")))?
        .ok_or_else(|| GwError::invalid_argument(format!("no private key in {path}")))
}

/// Builds the mutual-TLS acceptor: clients must present a certificate
/// chained to the configured client certificate.
///
/// # Errors
///
/// `InvalidArgument` for unreadable or malformed PEM material.
pub fn build_tls_acceptor(paths: &MtlsPaths) -> GwResult<TlsAcceptor> {
    let certs = load_certs(&paths.server_cert)?;
    let key = load_key(&paths.server_key)?;

    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(&paths.client_cert)? {
        roots
            .add(cert)
            .map_err(|e| GwError::invalid_argument(format!("bad client root: {e}")))?;
    }
    let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| GwError::internal(format!("client verifier: {e}")))?;

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| GwError::internal(format!("tls config: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Admin server bound to its TCP listener.
pub struct AdminServer {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    dispatcher: AdminDispatcher,
    ctx: SharedContext,
}

impl std::fmt::Debug for AdminServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminServer").finish_non_exhaustive()
    }
}

impl AdminServer {
    /// Binds the admin port.
    ///
    /// # Errors
    ///
    /// `Unavailable` when the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        dispatcher: AdminDispatcher,
        ctx: SharedContext,
    ) -> GwResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GwError::unavailable(format!("bind {addr}: {e}")))?;
        info!(%addr, mtls = tls.is_some(), "admin server listening");
        Ok(Self {
            listener,
            tls,
            dispatcher,
            ctx,
        })
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
                info!("admin server shutting down");
                break;
            }
            let accepted =
                tokio::time::timeout(ACCEPT_POLL, self.listener.accept()).await;
            match accepted {
                Ok(Ok((stream, peer))) => {
                    let dispatcher = self.dispatcher.clone();
                    let tls = self.tls.clone();
                    tokio::spawn(async move {
                        let result = match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    handle_connection(tls_stream, peer, dispatcher).await
                                }
                                Err(e) => {
                                    warn!(%peer, error = %e, "tls handshake failed");
                                    Ok(())
                                }
                            },
                            None => handle_connection(stream, peer, dispatcher).await,
                        };
                        if let Err(e) = result {
                            warn!(%peer, error = %e, "admin connection error");
                        }
                    });
                }
                Ok(Err(e)) => warn!(error = %e, "accept failed"),
                Err(_) => {} // poll timeout; re-check shutdown
            }
        }
    }
}

async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    dispatcher: AdminDispatcher,
) -> Result<(), super::error::ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    info!(%peer, "admin connection opened");
    let mut framed = Framed::new(stream, FrameCodec::new());
    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%peer, error = %e, "frame read error");
                break;
            }
        };
        let response = dispatcher.dispatch(&frame).await?;
        framed.send(response).await?;
    }
    info!(%peer, "admin connection closed");
    Ok(())
}
