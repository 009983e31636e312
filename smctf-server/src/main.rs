//! smctf server binary.
//!
//! Startup order: config → observability → repository → orchestrator client →
//! ingress-policy gate → stack service → reconcile scheduler → HTTP listener.
//! Exit code 0 on clean shutdown, 1 on any fatal error.

use std::sync::Arc;

use anyhow::Context;
use smctf_core::{
    observability, orchestrator_from_config, repository_from_config, Config, ReconcileScheduler,
    StackService,
};
use tracing::{error, info, warn};

mod api;
mod middleware;
mod shutdown;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load().context("load config")?;

    observability::init(cfg.metrics_addr).context("init observability")?;
    info!(config = ?cfg.redacted(), "config loaded");

    let repo = repository_from_config(&cfg.stack).await.context("init repository")?;
    let orchestrator = orchestrator_from_config(&cfg.stack)
        .await
        .context("init orchestrator client")?;

    // Refuse to serve workloads into a namespace without an ingress policy.
    if cfg.stack.require_ingress_network_policy {
        let ok = orchestrator
            .has_ingress_network_policy(&cfg.stack.namespace)
            .await
            .context("check ingress networkpolicy")?;
        anyhow::ensure!(
            ok,
            "missing ingress networkpolicy in namespace {}",
            cfg.stack.namespace
        );
    }

    match orchestrator.count_schedulable_nodes().await {
        Ok(count) => {
            info!(count, role = %cfg.stack.node_role, "schedulable nodes detected")
        }
        Err(err) => warn!(error = %err, "count schedulable nodes failed"),
    }

    let service = Arc::new(StackService::new(
        cfg.stack.clone(),
        repo,
        orchestrator,
    ));

    let shutdown_rx = shutdown::shutdown_signal();

    let scheduler = ReconcileScheduler::new(cfg.stack.scheduler_interval, Arc::clone(&service));
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx.resubscribe()));

    let app = api::router(Arc::clone(&service), cfg.api_key.clone());

    let addr = listen_addr(&cfg.http_addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(addr = %addr, "server listening");

    let mut serve_rx = shutdown_rx.resubscribe();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = serve_rx.recv().await;
            })
            .await
    });

    let mut main_rx = shutdown_rx;
    tokio::select! {
        _ = main_rx.recv() => {
            info!("shutting down");

            // In-flight requests get the configured grace period, then we
            // stop waiting on them.
            match tokio::time::timeout(cfg.shutdown_timeout, &mut server).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => error!(error = %err, "server error during shutdown"),
                Ok(Err(join_err)) => error!(error = %join_err, "server task failed"),
                Err(_) => {
                    warn!("shutdown timeout elapsed with requests still in flight");
                    server.abort();
                }
            }
        }
        result = &mut server => {
            scheduler_handle.abort();
            match result {
                Ok(Ok(())) => anyhow::bail!("server stopped unexpectedly"),
                Ok(Err(err)) => return Err(err).context("server error"),
                Err(join_err) => return Err(join_err).context("server task failed"),
            }
        }
    }

    scheduler_handle.abort();
    info!("shutdown complete");

    Ok(())
}

/// Accept Go-style `:8081` addresses as well as full `host:port` forms.
fn listen_addr(http_addr: &str) -> String {
    match http_addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => http_addr.to_string(),
    }
}
