use anyhow::{Context, Result};
use control::config::ControllerConfig;
use control::controller::Controller;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// argot - tunnel ingress controller
///
/// Watches Ingresses of its class and keeps one tunnel per host/backend rule.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (needed for Kubernetes TLS client)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok(); // Ignore error if already installed

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(ControllerConfig::from_env().context("Invalid configuration")?);
    info!(
        "argot {} (ingress class '{}')",
        env!("CARGO_PKG_VERSION"),
        config.ingress_class
    );

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let shutdown = CancellationToken::new();
    let controller = tokio::spawn(Controller::new(config, client).run(shutdown.clone()));

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }

    match controller.await {
        Ok(Ok(())) => {
            info!("Shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Controller exited with error: {}", e);
            Err(e.into())
        }
        Err(e) => Err(anyhow::anyhow!("Controller task failed: {}", e)),
    }
}
