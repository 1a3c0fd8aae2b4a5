//! Tunnel link: the live connection for one rule
//!
//! ```text
//!            start()               connected
//!  Stopped ──────────▶ Starting ──────────────▶ Running
//!     ▲                   ▲                        │ daemon error
//!     │ stop() / clean    │ relaunch (new id)      ▼
//!     └─── exit ──────────┴──────────────────── Repairing
//! ```
//!
//! A started link owns one supervisor task. The supervisor launches the daemon
//! under a stop token derived from the link's quit token, and on failure waits
//! out a [`RepairBackoff`] delay before relaunching. `stop()` cancels quit and
//! awaits the supervisor.

use crate::apis::metrics;
use crate::config::TunnelSettings;
use crate::error::DaemonError;
use crate::tunnel::backoff::RepairBackoff;
use crate::tunnel::daemon::{ConnectedSignal, TunnelConfig, TunnelDaemon};
use crate::sync::safe_lock;
use common::{parse_tags, Rule, Tag, TunnelOptions};
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Link lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Stopped,
    Starting,
    Running,
    Repairing,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Stopped => "stopped",
            LinkState::Starting => "starting",
            LinkState::Running => "running",
            LinkState::Repairing => "repairing",
        };
        f.write_str(s)
    }
}

/// Builds unstarted links sharing one daemon and one set of tunnel settings
#[derive(Clone)]
pub struct LinkFactory {
    settings: Arc<TunnelSettings>,
    daemon: Arc<dyn TunnelDaemon>,
}

impl LinkFactory {
    pub fn new(settings: Arc<TunnelSettings>, daemon: Arc<dyn TunnelDaemon>) -> Self {
        Self { settings, daemon }
    }

    pub fn link(&self, rule: Rule, cert: Vec<u8>, options: TunnelOptions) -> TunnelLink {
        TunnelLink::new(
            rule,
            cert,
            options,
            Arc::clone(&self.settings),
            Arc::clone(&self.daemon),
        )
    }
}

impl fmt::Debug for LinkFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkFactory")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

struct Supervisor {
    quit: CancellationToken,
    handle: JoinHandle<()>,
}

struct LinkShared {
    rule: Rule,
    origin: String,
    cert: Vec<u8>,
    options: TunnelOptions,
    tags: Vec<Tag>,
    settings: Arc<TunnelSettings>,
    daemon: Arc<dyn TunnelDaemon>,
    supervisor: Mutex<Option<Supervisor>>,
    state: Arc<watch::Sender<LinkState>>,
}

/// Connection for one rule
///
/// Clones share the same underlying link.
#[derive(Clone)]
pub struct TunnelLink {
    shared: Arc<LinkShared>,
}

impl TunnelLink {
    pub fn new(
        rule: Rule,
        cert: Vec<u8>,
        options: TunnelOptions,
        settings: Arc<TunnelSettings>,
        daemon: Arc<dyn TunnelDaemon>,
    ) -> Self {
        let origin = rule.origin();
        let tags = parse_tags(&options.tags, settings.tag_limit);
        let (state, _) = watch::channel(LinkState::Stopped);
        Self {
            shared: Arc::new(LinkShared {
                rule,
                origin,
                cert,
                options,
                tags,
                settings,
                daemon,
                supervisor: Mutex::new(None),
                state: Arc::new(state),
            }),
        }
    }

    pub fn rule(&self) -> &Rule {
        &self.shared.rule
    }

    pub fn host(&self) -> &str {
        &self.shared.rule.host
    }

    pub fn origin(&self) -> &str {
        &self.shared.origin
    }

    pub fn cert(&self) -> &[u8] {
        &self.shared.cert
    }

    pub fn options(&self) -> &TunnelOptions {
        &self.shared.options
    }

    pub fn tags(&self) -> &[Tag] {
        &self.shared.tags
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    /// True while a supervisor task is alive
    pub fn is_started(&self) -> bool {
        safe_lock(&self.shared.supervisor)
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Whether two handles point at the same link
    pub fn ptr_eq(&self, other: &TunnelLink) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Daemon configuration for one launch
    pub fn tunnel_config(&self, client_id: Uuid) -> TunnelConfig {
        let options = &self.shared.options;
        let settings = &self.shared.settings;
        TunnelConfig {
            hostname: self.shared.rule.host.clone(),
            origin_url: self.shared.origin.clone(),
            origin_cert: self.shared.cert.clone(),
            ha_connections: options.ha_connections,
            heartbeat_interval: options.heartbeat_interval,
            heartbeat_count: options.heartbeat_count,
            compression_quality: options.compression_quality,
            retries: options.retries,
            grace_period: options.grace_period,
            lb_pool: options.lb_pool.clone(),
            no_chunked_encoding: options.no_chunked_encoding,
            tags: self.shared.tags.clone(),
            version: settings.version.clone(),
            metrics_update_freq: settings.metrics_update_freq(),
            client_id,
        }
    }

    /// Launch the supervisor; no-op while one is alive
    pub fn start(&self) {
        let mut supervisor = safe_lock(&self.shared.supervisor);
        if supervisor
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
        {
            debug!(rule = %self.shared.rule, "Link already started");
            return;
        }

        // A supervisor that ended on its own (clean daemon exit) is replaced.
        if supervisor.take().is_some() {
            metrics::link_stopped();
        }

        let quit = CancellationToken::new();
        let _ = self.shared.state.send_replace(LinkState::Starting);
        let handle = tokio::spawn(supervise(Arc::clone(&self.shared), quit.clone()));
        *supervisor = Some(Supervisor { quit, handle });
        metrics::link_started();

        info!(rule = %self.shared.rule, "Link started");
    }

    /// Stop the daemon and the repair loop; no-op when not started
    pub async fn stop(&self) {
        let supervisor = safe_lock(&self.shared.supervisor).take();
        let Some(Supervisor { quit, handle }) = supervisor else {
            return;
        };

        quit.cancel();
        if let Err(e) = handle.await {
            error!(rule = %self.shared.rule, "Link supervisor failed: {}", e);
        }
        let _ = self.shared.state.send_replace(LinkState::Stopped);
        metrics::link_stopped();

        info!(rule = %self.shared.rule, "Link stopped");
    }
}

async fn supervise(shared: Arc<LinkShared>, quit: CancellationToken) {
    let backoff = RepairBackoff::new(
        shared.settings.repair_delay(),
        shared.settings.repair_jitter,
    );
    let link = TunnelLink {
        shared: Arc::clone(&shared),
    };

    loop {
        let stop = quit.child_token();
        let config = link.tunnel_config(Uuid::new_v4());
        let client_id = config.client_id;
        let connected = ConnectedSignal::new(Arc::clone(&shared.state));
        shared.state.send_replace(LinkState::Starting);

        debug!(rule = %shared.rule, %client_id, "Launching tunnel daemon");
        let result = AssertUnwindSafe(shared.daemon.run(config, stop.clone(), connected))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(DaemonError::Panicked(panic_message(panic))));
        stop.cancel();

        if quit.is_cancelled() {
            break;
        }

        match result {
            Ok(()) => {
                warn!(rule = %shared.rule, %client_id, "Tunnel daemon exited");
                break;
            }
            Err(e) => {
                shared.state.send_replace(LinkState::Repairing);
                metrics::record_link_repair(&shared.rule.host);

                let delay = backoff.next_delay();
                warn!(
                    rule = %shared.rule,
                    %client_id,
                    "Tunnel daemon failed, relaunching in {:?}: {}",
                    delay,
                    e
                );

                tokio::select! {
                    _ = quit.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    shared.state.send_replace(LinkState::Stopped);
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Semantic equality: host, origin, options and certificate
impl PartialEq for TunnelLink {
    fn eq(&self, other: &Self) -> bool {
        self.shared.rule.host == other.shared.rule.host
            && self.shared.origin == other.shared.origin
            && self.shared.options == other.shared.options
            && self.shared.cert == other.shared.cert
    }
}

impl fmt::Debug for TunnelLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelLink")
            .field("rule", &self.shared.rule)
            .field("origin", &self.shared.origin)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for TunnelLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.shared.rule, self.state())
    }
}
