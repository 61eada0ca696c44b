//! meshsync daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures_util::future::join_all;
use log::{error, info};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;

mod cni;
mod config;
mod diff;
mod error;
mod exec;
mod firewall;
mod health;
mod kernel;
mod membership;
mod mesh;
mod metrics;
mod reconcile;
mod scheduler;
mod types;

use config::{Cli, Config};
use exec::{CommandRunner, SystemCommand};
use firewall::Iptables;
use kernel::IpRoute;
use membership::{KubeMembership, MembershipSource};
use mesh::LocalApiClient;
use metrics::Metrics;
use reconcile::{FirewallReconciler, MeshReconciler, Reconciler, RouteReconciler};
use scheduler::run_reconciler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load configuration
    let cli = Cli::parse();
    let cfg = Config::load(&cli)?;
    info!("Starting meshsync with config: {:?}", cfg);

    // Collaborators
    let membership: Arc<dyn MembershipSource> = Arc::new(
        KubeMembership::try_default()
            .await
            .context("Failed to build Kubernetes client")?,
    );
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommand);
    let mesh = Arc::new(LocalApiClient::new(&cfg.tailscaled_socket));
    let kernel = Arc::new(IpRoute::new(Arc::clone(&runner)));
    let filter = Arc::new(Iptables::new(runner));

    let metrics = Arc::new(Metrics::new().context("Failed to set up metrics exporter")?);
    let token = CancellationToken::new();
    let mut handles = Vec::new();

    // Health and metrics endpoints
    let health_listener = TcpListener::bind(cfg.health_addr)
        .await
        .with_context(|| format!("Failed to bind health endpoint on {}", cfg.health_addr))?;
    let metrics_listener = TcpListener::bind(cfg.metrics_addr)
        .await
        .with_context(|| format!("Failed to bind metrics endpoint on {}", cfg.metrics_addr))?;

    let router = health::health_router(Arc::clone(&metrics));
    let health_token = token.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = health::serve(health_listener, router, health_token).await {
            error!("Health endpoint failed: {}", e);
        }
    }));

    let router = health::metrics_router(Arc::clone(&metrics));
    let metrics_token = token.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = health::serve(metrics_listener, router, metrics_token).await {
            error!("Metrics endpoint failed: {}", e);
        }
    }));

    // CNI config
    if cfg.patch_cni {
        let membership = Arc::clone(&membership);
        let node_name = cfg.node_name.clone();
        let path = cfg.cni_conf_path.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = cni::patch_cni_config(membership.as_ref(), &node_name, &path).await {
                error!("Failed to patch CNI config {}: {}", path.display(), e);
            }
        }));
    }

    // Reconciliation loops
    let reconcilers: Vec<(Arc<dyn Reconciler>, Duration)> = vec![
        (
            Arc::new(MeshReconciler::new(&cfg, Arc::clone(&membership), mesh)),
            cfg.mesh_sync_interval(),
        ),
        (
            Arc::new(RouteReconciler::new(&cfg, Arc::clone(&membership), kernel)),
            cfg.route_sync_interval(),
        ),
        (
            Arc::new(FirewallReconciler::new(&cfg, Arc::clone(&membership), filter)),
            cfg.firewall_sync_interval(),
        ),
    ];
    for (reconciler, period) in reconcilers {
        handles.push(tokio::spawn(run_reconciler(
            reconciler,
            period,
            Arc::clone(&metrics),
            token.clone(),
        )));
    }

    // Graceful Shutdown
    shutdown_signal().await;
    token.cancel();
    for result in join_all(handles).await {
        if let Err(e) = result {
            error!("Task ended abnormally: {}", e);
        }
    }

    info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Unable to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal::unix::signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Unable to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
