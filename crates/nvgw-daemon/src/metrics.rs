//! Prometheus exporter.
//!
//! A read-only projection of gateway state served over HTTP when
//! `enable_prometheus_exporter` is set. Gauges are recomputed from the
//! snapshot cache at scrape time; the exporter never mutates anything.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use nvgw_core::error::{GwError, GwResult};
use nvgw_core::statemap::StateKey;
use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};
use tracing::{error, info};

use crate::state::SharedContext;

/// Gateway metrics family.
pub struct GatewayMetrics {
    registry: Registry,
    subsystems: IntGauge,
    namespaces: IntGauge,
    listeners: IntGauge,
    hosts: IntGauge,
    optimized_groups: IntGauge,
    degraded: IntGauge,
    reconcile_failures: IntGauge,
}

impl std::fmt::Debug for GatewayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMetrics").finish_non_exhaustive()
    }
}

fn gauge(registry: &Registry, name: &str, help: &str) -> GwResult<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help))
        .map_err(|e| GwError::internal(format!("metric {name}: {e}")))?;
    registry
        .register(Box::new(gauge.clone()))
        .map_err(|e| GwError::internal(format!("register {name}: {e}")))?;
    Ok(gauge)
}

impl GatewayMetrics {
    /// Builds the registry and gauges.
    ///
    /// # Errors
    ///
    /// `Internal` when registration fails (duplicate names).
    pub fn new() -> GwResult<Arc<Self>> {
        let registry = Registry::new();
        Ok(Arc::new(Self {
            subsystems: gauge(&registry, "nvgw_subsystems", "Declared subsystems")?,
            namespaces: gauge(&registry, "nvgw_namespaces", "Declared namespaces")?,
            listeners: gauge(&registry, "nvgw_listeners", "Declared listeners (cluster-wide)")?,
            hosts: gauge(&registry, "nvgw_hosts", "Host grants (wildcard included)")?,
            optimized_groups: gauge(
                &registry,
                "nvgw_ana_optimized_groups",
                "ANA groups this gateway serves as optimized",
            )?,
            degraded: gauge(&registry, "nvgw_degraded", "1 while reconciliation lags")?,
            reconcile_failures: gauge(
                &registry,
                "nvgw_reconcile_failures_total",
                "Reconciliation failures since start",
            )?,
            registry,
        }))
    }

    /// Recomputes every gauge from the shared context.
    pub async fn refresh(&self, ctx: &SharedContext) {
        let cache = ctx.cache.read().await;
        let mut subsystems = 0i64;
        let mut namespaces = 0i64;
        let mut listeners = 0i64;
        let mut hosts = 0i64;
        for key in cache.records.keys() {
            match key {
                StateKey::Subsystem { .. } => subsystems += 1,
                StateKey::Namespace { .. } => namespaces += 1,
                StateKey::Listener { .. } => listeners += 1,
                StateKey::Host { .. } => hosts += 1,
                _ => {}
            }
        }
        drop(cache);
        self.subsystems.set(subsystems);
        self.namespaces.set(namespaces);
        self.listeners.set(listeners);
        self.hosts.set(hosts);
        #[allow(clippy::cast_possible_wrap)]
        self.optimized_groups
            .set(ctx.optimized_groups().await.len() as i64);
        self.degraded.set(i64::from(ctx.health.is_degraded()));
        #[allow(clippy::cast_possible_wrap)]
        self.reconcile_failures
            .set(ctx.health.failure_count() as i64);
    }

    /// Renders the registry in Prometheus text format.
    ///
    /// # Errors
    ///
    /// `Internal` on an encoder failure.
    pub fn encode_text(&self) -> GwResult<String> {
        let mut out = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut out)
            .map_err(|e| GwError::internal(format!("metrics encode: {e}")))?;
        String::from_utf8(out).map_err(|e| GwError::internal(format!("metrics utf-8: {e}")))
    }
}

/// Runs the exporter HTTP server until the process exits.
///
/// # Errors
///
/// `Unavailable` when the port cannot be bound.
pub async fn run_exporter(
    metrics: Arc<GatewayMetrics>,
    ctx: SharedContext,
    addr: SocketAddr,
) -> GwResult<()> {
    let handler = {
        let metrics = Arc::clone(&metrics);
        let ctx = ctx.clone();
        move || {
            let metrics = Arc::clone(&metrics);
            let ctx = ctx.clone();
            async move {
                metrics.refresh(&ctx).await;
                match metrics.encode_text() {
                    Ok(body) => (
                        StatusCode::OK,
                        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                        body,
                    )
                        .into_response(),
                    Err(e) => {
                        error!(error = %e, "metrics encode failed");
                        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
                    }
                }
            }
        }
    };

    let app = Router::new().route("/metrics", get(handler));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GwError::unavailable(format!("bind exporter {addr}: {e}")))?;
    info!(%addr, "prometheus exporter listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| GwError::internal(format!("exporter: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_register_once() {
        let metrics = GatewayMetrics::new().unwrap();
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("nvgw_subsystems"));
        assert!(text.contains("nvgw_degraded"));
    }
}
