// src/server/mod.rs

//! Process orchestration: one monitor task per configured cluster, the admin listener and
//! the optional metrics exporter, all stopped together on SIGINT or SIGTERM.

use crate::config::Config;
use crate::core::monitor::ClusterMonitor;
use anyhow::{Result, anyhow};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub mod listener;
pub mod metrics_server;

pub use listener::MonitorRegistry;

/// How long tasks get to finish after shutdown was broadcast.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// The main startup function. Runs until a termination signal arrives or a task fails.
pub async fn run(config: Config) -> Result<()> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    let registry: MonitorRegistry = Arc::new(DashMap::new());

    // --- Monitors ---
    for cluster in config.clusters.iter().cloned() {
        let name = cluster.name.clone();
        let mut monitor = ClusterMonitor::new(cluster);
        if !monitor.load_journal().await {
            info!("[{}] No usable journal; discovering the topology from scratch.", name);
        }
        let (handle, task) = monitor.spawn(shutdown_tx.subscribe());
        registry.insert(name.clone(), handle);
        tasks.spawn(async move {
            task.await
                .map_err(|e| anyhow!("Monitor for cluster '{}' panicked: {}", name, e))
        });
    }

    // --- Admin Listener ---
    let admin = TcpListener::bind((config.admin.host.as_str(), config.admin.port)).await?;
    tasks.spawn(listener::run_listener(
        admin,
        registry.clone(),
        shutdown_tx.subscribe(),
    ));

    // --- Metrics Server ---
    if config.metrics.enabled {
        let port = config.metrics.port;
        let registry = registry.clone();
        let shutdown_rx_metrics = shutdown_tx.subscribe();
        tasks.spawn(async move {
            metrics_server::run_metrics_server(port, registry, shutdown_rx_metrics).await;
            Ok(())
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    wait_for_shutdown(&mut tasks).await?;

    info!("Shutting down: stopping monitors and listeners.");
    let _ = shutdown_tx.send(());
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while let Some(res) = tasks.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Task ended with an error during shutdown: {}", e),
                Err(e) => warn!("Task panicked during shutdown: {}", e),
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Tasks did not stop within {:?}; aborting them.", SHUTDOWN_GRACE);
        tasks.shutdown().await;
    }
    info!("Shutdown complete.");
    Ok(())
}

fn log_startup_info(config: &Config) {
    info!(
        "replgate {} starting with {} cluster(s).",
        env!("CARGO_PKG_VERSION"),
        config.clusters.len()
    );
    for cluster in &config.clusters {
        info!(
            "Cluster '{}': {} server(s), interval {:?}, auto_failover={}, auto_rejoin={}",
            cluster.name,
            cluster.servers.len(),
            cluster.monitor_interval,
            cluster.auto_failover,
            cluster.auto_rejoin
        );
    }
}

/// Returns on SIGINT or SIGTERM. A task that stops on its own is a critical failure.
async fn wait_for_shutdown(tasks: &mut JoinSet<Result<()>>) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow!("Failed to register SIGINT handler: {}", e))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow!("Failed to register SIGTERM handler: {}", e))?;

    loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                return Ok(());
            }
            Some(res) = tasks.join_next() => match res {
                Ok(Ok(())) => warn!("A background task finished unexpectedly without an error."),
                Ok(Err(e)) => {
                    error!("CRITICAL: Background task failed: {}. Shutting down.", e);
                    return Ok(());
                }
                Err(e) => {
                    error!("CRITICAL: Background task panicked: {e:?}. Shutting down.");
                    return Ok(());
                }
            },
        }
    }
}
