use std::env;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::watch;
use tracing::{info, warn};

use exporter_app::ExporterConfig;
use modbus_transport::ModbusTransport;
use poller::{MetricsSink, PollingScheduler};
use sunspec_models::meter_bindings;

/// Publishes decoded samples as Prometheus gauges through the global
/// `metrics` recorder installed in `main`.
struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn publish(&self, name: &str, value: f64) {
        metrics::gauge!(name.to_string()).set(value);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = ExporterConfig::load_with_path(parse_config_arg())
        .context("load config failed")?;
    config.validate().context("config validation failed")?;

    info!(
        inverter = %config.inverter_address,
        port = config.inverter_port,
        meters = config.num_meters,
        interval_secs = config.poll_interval_secs,
        "starting solaredge exporter"
    );

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("prometheus recorder init failed")?;
    let listen_addr = format!("{}:{}", config.listen_address, config.listen_port)
        .parse::<SocketAddr>()
        .context("invalid listen address")?;
    let server = tokio::spawn(serve_metrics(listen_addr, handle));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let transport = ModbusTransport::new(config.transport());
    let scheduler = PollingScheduler::new(
        transport,
        meter_bindings(config.num_meters),
        PrometheusSink,
        config.scheduler(),
        shutdown_rx,
    );
    let poller_handle = tokio::spawn(scheduler.run());

    notify_ready();

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    poller_handle.await.context("poller task join failed")?;
    server.abort();
    Ok(())
}

async fn serve_metrics(addr: SocketAddr, handle: PrometheusHandle) {
    let app = Router::new().route(
        "/metrics",
        get(move || std::future::ready(handle.render())),
    );

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            warn!(%addr, error = %err, "metrics listener bind failed");
            return;
        }
    };
    info!(%addr, "metrics endpoint listening");

    if let Err(err) = axum::serve(listener, app).await {
        warn!(error = %err, "metrics server exited");
    }
}

fn parse_config_arg() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}
