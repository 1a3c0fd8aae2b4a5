//! Tunnel daemon boundary
//!
//! A link hands a fully built [`TunnelConfig`] to a [`TunnelDaemon`] and waits for
//! it to return. The daemon must return once `shutdown` is cancelled; an `Err`
//! sends the link into repair, `Ok` means it exited on its own.

use crate::error::DaemonError;
use crate::tunnel::link::LinkState;
use async_trait::async_trait;
use common::Tag;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything one daemon launch needs
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelConfig {
    pub hostname: String,
    pub origin_url: String,
    pub origin_cert: Vec<u8>,
    pub ha_connections: i32,
    pub heartbeat_interval: Duration,
    pub heartbeat_count: u64,
    pub compression_quality: u64,
    pub retries: u32,
    pub grace_period: Duration,
    pub lb_pool: String,
    pub no_chunked_encoding: bool,
    pub tags: Vec<Tag>,
    pub version: String,
    pub metrics_update_freq: Duration,
    /// Fresh per launch
    pub client_id: Uuid,
}

/// Reports that the daemon established its connection
#[derive(Debug, Clone)]
pub struct ConnectedSignal {
    state: Arc<watch::Sender<LinkState>>,
}

impl ConnectedSignal {
    pub(crate) fn new(state: Arc<watch::Sender<LinkState>>) -> Self {
        Self { state }
    }

    /// Move the owning link from `Starting` to `Running`
    pub fn connected(&self) {
        self.state.send_if_modified(|state| {
            if *state == LinkState::Starting {
                *state = LinkState::Running;
                true
            } else {
                false
            }
        });
    }
}

#[async_trait]
pub trait TunnelDaemon: Send + Sync {
    async fn run(
        &self,
        config: TunnelConfig,
        shutdown: CancellationToken,
        connected: ConnectedSignal,
    ) -> Result<(), DaemonError>;
}

// =============================================================================
// cloudflared
// =============================================================================

/// Runs each tunnel as a `cloudflared tunnel` child process
#[derive(Debug, Clone)]
pub struct CloudflaredDaemon {
    binary: PathBuf,
    cert_dir: PathBuf,
}

impl CloudflaredDaemon {
    pub fn new(binary: impl Into<PathBuf>, cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            cert_dir: cert_dir.into(),
        }
    }

    fn cert_path(&self, config: &TunnelConfig) -> PathBuf {
        self.cert_dir.join(format!("{}.pem", config.client_id))
    }
}

/// Command line for one launch
pub fn command_args(config: &TunnelConfig, cert_path: &Path) -> Vec<String> {
    let mut args = vec![
        "tunnel".to_string(),
        "--no-autoupdate".to_string(),
        "--hostname".to_string(),
        config.hostname.clone(),
        "--url".to_string(),
        config.origin_url.clone(),
        "--origincert".to_string(),
        cert_path.display().to_string(),
        "--ha-connections".to_string(),
        config.ha_connections.to_string(),
        "--heartbeat-interval".to_string(),
        go_duration(config.heartbeat_interval),
        "--heartbeat-count".to_string(),
        config.heartbeat_count.to_string(),
        "--compression-quality".to_string(),
        config.compression_quality.to_string(),
        "--retries".to_string(),
        config.retries.to_string(),
        "--grace-period".to_string(),
        go_duration(config.grace_period),
        "--metrics-update-freq".to_string(),
        go_duration(config.metrics_update_freq),
    ];

    if !config.lb_pool.is_empty() {
        args.push("--lb-pool".to_string());
        args.push(config.lb_pool.clone());
    }
    if config.no_chunked_encoding {
        args.push("--no-chunked-encoding".to_string());
    }
    for tag in &config.tags {
        args.push("--tag".to_string());
        args.push(tag.to_string());
    }

    args
}

fn go_duration(duration: Duration) -> String {
    format!("{}ms", duration.as_millis())
}

#[async_trait]
impl TunnelDaemon for CloudflaredDaemon {
    async fn run(
        &self,
        config: TunnelConfig,
        shutdown: CancellationToken,
        connected: ConnectedSignal,
    ) -> Result<(), DaemonError> {
        let cert_path = self.cert_path(&config);
        tokio::fs::create_dir_all(&self.cert_dir).await?;
        tokio::fs::write(&cert_path, &config.origin_cert).await?;

        let args = command_args(&config, &cert_path);
        debug!(host = %config.hostname, "Launching {} {}", self.binary.display(), args.join(" "));

        let spawned = Command::new(&self.binary)
            .args(&args)
            .env("TUNNEL_CLIENT_VERSION", &config.version)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                remove_cert(&cert_path).await;
                return Err(DaemonError::Spawn(e));
            }
        };

        info!(
            host = %config.hostname,
            origin = %config.origin_url,
            client_id = %config.client_id,
            "Tunnel daemon started"
        );
        connected.connected();

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(host = %config.hostname, "Failed to kill tunnel daemon: {}", e);
                }
                Ok(())
            }
            status = child.wait() => match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(DaemonError::Exited(status.to_string())),
                Err(e) => Err(DaemonError::Io(e)),
            },
        };

        remove_cert(&cert_path).await;
        outcome
    }
}

async fn remove_cert(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove certificate {}: {}", path.display(), e),
    }
}
