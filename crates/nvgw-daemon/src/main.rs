//! nvgw-daemon: the NVMe-over-Fabrics gateway process.
//!
//! Startup order matters: the engine transports come up first, then the
//! gateway converges the engine to the state map, and only then does the
//! admin port open. A gateway never serves admin traffic while its
//! engine disagrees with the cluster record.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

use nvgw_core::config::GatewayConfig;
use nvgw_core::keys::{KeyFiles, KeySealer};
use nvgw_core::model::GatewayIdentity;
use nvgw_core::statemap::MemoryClusterMap;
use nvgw_daemon::keyring::Keyring;
use nvgw_daemon::metrics::{run_exporter, GatewayMetrics};
use nvgw_daemon::monitor::{InProcessController, MonitorClient};
use nvgw_daemon::protocol::{build_tls_acceptor, AdminDispatcher, AdminServer, MtlsPaths};
use nvgw_daemon::reconcile::Reconciler;
use nvgw_daemon::discovery::DiscoveryResponder;
use nvgw_daemon::service::GatewayService;
use nvgw_daemon::state::{GatewayContext, LogControl};
use nvgw_daemon::tgt::{self, JsonRpcTgt, RpcClientConfig};

/// nvgw gateway daemon.
#[derive(Parser, Debug)]
#[command(name = "nvgw-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the gateway configuration file.
    #[arg(short, long, default_value = "nvgw.conf")]
    config: PathBuf,

    /// Gateway name (overrides the config file; defaults to hostname).
    #[arg(long)]
    name: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "nvgw".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, reload_handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = if args.config.exists() {
        GatewayConfig::load(&args.config).context("failed to load configuration")?
    } else {
        info!(config = %args.config.display(), "no config file, using defaults");
        GatewayConfig::empty()
    };
    let gateway_cfg = config.gateway();
    let spdk_cfg = config.spdk();
    let discovery_cfg = config.discovery();

    let name = args
        .name
        .or(gateway_cfg.name.clone())
        .unwrap_or_else(hostname);
    let identity = GatewayIdentity {
        name: name.clone(),
        group: gateway_cfg.group.clone(),
        node_addr: gateway_cfg.addr.clone(),
        grpc_port: gateway_cfg.port,
        io_port: gateway_cfg.io_port,
        discovery_port: discovery_cfg.port,
    };
    info!(
        gateway = %identity.name,
        group = %identity.group,
        state_object = %config.state_object_name(),
        "starting gateway"
    );

    // Engine adapter. The transports are created before anything else
    // may talk to the engine.
    let mut engine = JsonRpcTgt::spawn(RpcClientConfig {
        socket_path: PathBuf::from(&spdk_cfg.rpc_socket),
        timeout: spdk_cfg.timeout,
        conn_retries: spdk_cfg.conn_retries,
    });
    {
        use nvgw_daemon::tgt::TgtApi;
        let version = engine
            .version()
            .await
            .context("target engine is unreachable")?;
        info!(engine_version = %version, "engine connected");
        for trtype in spdk_cfg.transports.split_whitespace() {
            let options = match (trtype, &spdk_cfg.transport_tcp_options) {
                ("tcp", Some(text)) => Some(
                    serde_json::from_str(text)
                        .context("bad [spdk] transport_tcp_options JSON")?,
                ),
                _ => None,
            };
            if let Err(e) = engine.create_transport(trtype, options.as_ref()).await {
                // Transport may already exist from a previous run.
                warn!(trtype, error = %e, "transport creation failed");
            }
        }
        if let Err(e) = engine.set_log_level(&spdk_cfg.log_level).await {
            warn!(error = %e, "engine log level not applied");
        }
    }
    let tgt = tgt::share(engine);

    // Cluster state map. The rados-backed client plugs in at this seam;
    // the in-process map serves single-node deployments and tests.
    let map = MemoryClusterMap::shared();

    // Keyring: group secret from the configured file, else derived from
    // the group name (development fallback).
    let sealer = match &gateway_cfg.encryption_key {
        Some(path) => KeySealer::from_secret_file(path)
            .context("failed to load the group encryption key")?,
        None => {
            warn!("no encryption_key configured; deriving the sealing key from the group name");
            KeySealer::new(identity.group.as_bytes())
        }
    };
    let keyring = Keyring::new(KeyFiles::default_base(), sealer);

    let ctx = GatewayContext::new(
        identity.clone(),
        map,
        tgt,
        keyring,
        LogControl::new(reload_handle),
    );

    // Converge the engine to the map before serving anything. The watch
    // subscription predates the snapshot so nothing falls in between.
    let reconciler = Reconciler::new(ctx.clone());
    let watch = reconciler
        .subscribe()
        .await
        .context("state-map watch failed")?;
    reconciler
        .reconcile_startup()
        .await
        .context("startup reconciliation failed")?;
    let watch_task = tokio::spawn(reconciler.run_with(watch));

    // Monitor client and the ANA controller.
    let controller = InProcessController::new(gateway_cfg.ana_groups.max(1));
    let transport = controller.connect(&identity.name);
    let monitor = MonitorClient::new(ctx.clone(), transport);
    monitor
        .register()
        .await
        .context("gateway registration failed")?;
    let monitor_task = tokio::spawn(monitor.run());

    // Admin server.
    let service = GatewayService::new(ctx.clone());
    let dispatcher = AdminDispatcher::new(service);
    let admin_addr: SocketAddr = format!("{}:{}", gateway_cfg.addr, gateway_cfg.port)
        .parse()
        .context("bad [gateway] addr/port")?;
    let tls = if gateway_cfg.enable_auth {
        let mtls = config.mtls();
        Some(
            build_tls_acceptor(&MtlsPaths {
                server_key: mtls.server_key,
                server_cert: mtls.server_cert,
                client_cert: mtls.client_cert,
            })
            .context("mutual TLS setup failed")?,
        )
    } else {
        None
    };
    let admin = AdminServer::bind(admin_addr, tls, dispatcher, ctx.clone())
        .await
        .context("admin server bind failed")?;
    let admin_task = tokio::spawn(admin.run());

    // Discovery responder.
    let discovery_addr: SocketAddr =
        format!("{}:{}", discovery_cfg.addr, discovery_cfg.port)
            .parse()
            .context("bad [discovery] addr/port")?;
    let discovery = DiscoveryResponder::bind(discovery_addr, ctx.clone())
        .await
        .context("discovery bind failed")?;
    let discovery_task = tokio::spawn(discovery.run());

    // Prometheus exporter.
    let exporter_task = if gateway_cfg.enable_prometheus_exporter {
        let metrics = GatewayMetrics::new().context("metrics registry")?;
        let exporter_addr: SocketAddr =
            ([0, 0, 0, 0], gateway_cfg.prometheus_port).into();
        let ctx = ctx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_exporter(metrics, ctx, exporter_addr).await {
                error!(error = %e, "exporter failed");
            }
        }))
    } else {
        None
    };

    info!(gateway = %identity.name, %admin_addr, "gateway ready");

    // Signals drive shutdown.
    let mut sigterm = signal(SignalKind::terminate()).context("SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    info!("shutting down");
    ctx.request_shutdown();

    // The monitor deregisters within its fencing deadline; give the
    // workers a moment to drain before the process exits.
    let drain = async {
        let _ = admin_task.await;
        let _ = discovery_task.await;
        let _ = monitor_task.await;
        let _ = watch_task.await;
    };
    if tokio::time::timeout(Duration::from_secs(35), drain).await.is_err() {
        warn!("workers did not drain in time");
    }
    if let Some(task) = exporter_task {
        task.abort();
    }

    info!("gateway stopped");
    Ok(())
}
