//! Observability infrastructure: tracing and metrics.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber and, when an address is given,
/// the Prometheus exposition endpoint.
///
/// Must be called once at process startup.
pub fn init(metrics_addr: Option<SocketAddr>) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .init();

    if let Some(addr) = metrics_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        tracing::info!(%addr, "prometheus metrics listener started");
    }

    Ok(())
}
