//! Configuration for the argot controller
//!
//! Built once at process start and shared read-only (`Arc<ControllerConfig>`)
//! with the watchers, translator, router and tunnel links.

use crate::error::ConfigError;
use common::ResourceKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Ingress class handled by this controller
    #[serde(default = "default_ingress_class")]
    pub ingress_class: String,

    /// Namespace to watch (None = all namespaces)
    #[serde(default)]
    pub watch_namespace: Option<String>,

    /// Full Ingress re-enqueue period in seconds (0 = disabled)
    #[serde(default)]
    pub resync_period_secs: u64,

    /// Retries per queue item before it is dropped
    #[serde(default = "default_requeue_limit")]
    pub requeue_limit: u32,

    /// Number of queue workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Fallback TLS secret (`namespace/name`) for hosts without a TLS entry
    #[serde(default)]
    pub default_secret: Option<String>,

    /// Static host -> secret (`namespace/name`) overrides
    #[serde(default)]
    pub secret_overrides: BTreeMap<String, String>,

    /// Only reconcile Service events for Services exposing ports
    #[serde(default)]
    pub filter_services: bool,

    /// Tunnel link settings
    #[serde(default)]
    pub tunnel: TunnelSettings,
}

/// Process-wide tunnel link settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelSettings {
    /// Version string reported by every tunnel
    #[serde(default = "default_version")]
    pub version: String,

    /// Base delay before a failed link is relaunched (default: 20s)
    #[serde(default = "default_repair_delay")]
    pub repair_delay_secs: u64,

    /// Additive jitter factor applied on top of the base delay (default: 1.0)
    #[serde(default = "default_repair_jitter")]
    pub repair_jitter: f64,

    /// Maximum number of tags per tunnel (default: 32)
    #[serde(default = "default_tag_limit")]
    pub tag_limit: usize,

    /// Metrics update frequency handed to the daemon (default: 5s)
    #[serde(default = "default_metrics_update_freq")]
    pub metrics_update_freq_secs: u64,

    /// Path to the cloudflared binary
    #[serde(default = "default_cloudflared_path")]
    pub cloudflared_path: String,

    /// Directory where origin certificates are written for the daemon
    #[serde(default = "default_cert_dir")]
    pub cert_dir: String,
}

fn default_ingress_class() -> String {
    "argo-tunnel".to_string()
}

fn default_requeue_limit() -> u32 {
    2
}

fn default_workers() -> usize {
    2
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_repair_delay() -> u64 {
    20
}

fn default_repair_jitter() -> f64 {
    1.0
}

fn default_tag_limit() -> usize {
    32
}

fn default_metrics_update_freq() -> u64 {
    5
}

fn default_cloudflared_path() -> String {
    "cloudflared".to_string()
}

fn default_cert_dir() -> String {
    "/tmp/argot".to_string()
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            version: default_version(),
            repair_delay_secs: default_repair_delay(),
            repair_jitter: default_repair_jitter(),
            tag_limit: default_tag_limit(),
            metrics_update_freq_secs: default_metrics_update_freq(),
            cloudflared_path: default_cloudflared_path(),
            cert_dir: default_cert_dir(),
        }
    }
}

impl TunnelSettings {
    pub fn repair_delay(&self) -> Duration {
        Duration::from_secs(self.repair_delay_secs)
    }

    pub fn metrics_update_freq(&self) -> Duration {
        Duration::from_secs(self.metrics_update_freq_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ingress_class: default_ingress_class(),
            watch_namespace: None,
            resync_period_secs: 0,
            requeue_limit: default_requeue_limit(),
            workers: default_workers(),
            default_secret: None,
            secret_overrides: BTreeMap::new(),
            filter_services: false,
            tunnel: TunnelSettings::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from `ARGOT_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = env::var("ARGOT_INGRESS_CLASS") {
            config.ingress_class = val;
        }
        if let Ok(val) = env::var("ARGOT_WATCH_NAMESPACE") {
            config.watch_namespace = Some(val).filter(|ns| !ns.is_empty());
        }
        if let Some(val) = env_parse("ARGOT_RESYNC_PERIOD_SECS")? {
            config.resync_period_secs = val;
        }
        if let Some(val) = env_parse("ARGOT_REQUEUE_LIMIT")? {
            config.requeue_limit = val;
        }
        if let Some(val) = env_parse("ARGOT_WORKERS")? {
            config.workers = val;
        }
        if let Ok(val) = env::var("ARGOT_DEFAULT_SECRET") {
            config.default_secret = Some(val).filter(|s| !s.is_empty());
        }
        if let Ok(val) = env::var("ARGOT_SECRET_OVERRIDES") {
            config.secret_overrides = parse_overrides(&val)?;
        }
        if let Some(val) = env_parse("ARGOT_FILTER_SERVICES")? {
            config.filter_services = val;
        }

        let tunnel = &mut config.tunnel;
        if let Ok(val) = env::var("ARGOT_TUNNEL_VERSION") {
            tunnel.version = val;
        }
        if let Some(val) = env_parse("ARGOT_REPAIR_DELAY_SECS")? {
            tunnel.repair_delay_secs = val;
        }
        if let Some(val) = env_parse("ARGOT_REPAIR_JITTER")? {
            tunnel.repair_jitter = val;
        }
        if let Some(val) = env_parse("ARGOT_TAG_LIMIT")? {
            tunnel.tag_limit = val;
        }
        if let Some(val) = env_parse("ARGOT_METRICS_UPDATE_FREQ_SECS")? {
            tunnel.metrics_update_freq_secs = val;
        }
        if let Ok(val) = env::var("ARGOT_CLOUDFLARED_PATH") {
            tunnel.cloudflared_path = val;
        }
        if let Ok(val) = env::var("ARGOT_CERT_DIR") {
            tunnel.cert_dir = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingress_class.is_empty() {
            return Err(ConfigError::Invalid("ingress class must not be empty".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("at least one worker is required".into()));
        }
        if !self.tunnel.repair_jitter.is_finite() || self.tunnel.repair_jitter < 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "repair_jitter".into(),
                value: self.tunnel.repair_jitter.to_string(),
            });
        }
        self.default_secret_key()?;
        self.secret_override_keys()?;
        Ok(())
    }

    pub fn resync_period(&self) -> Option<Duration> {
        (self.resync_period_secs > 0).then(|| Duration::from_secs(self.resync_period_secs))
    }

    /// Default secret as a resource key
    pub fn default_secret_key(&self) -> Result<Option<ResourceKey>, ConfigError> {
        self.default_secret
            .as_deref()
            .map(|raw| secret_key("default_secret", raw))
            .transpose()
    }

    /// Host override table as resource keys
    pub fn secret_override_keys(&self) -> Result<HashMap<String, ResourceKey>, ConfigError> {
        self.secret_overrides
            .iter()
            .map(|(host, raw)| Ok((host.clone(), secret_key("secret_overrides", raw)?)))
            .collect()
    }
}

/// Secrets are namespaced, so a bare name is rejected
fn secret_key(name: &str, raw: &str) -> Result<ResourceKey, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        name: name.to_string(),
        value: raw.to_string(),
    };
    let key: ResourceKey = raw.parse().map_err(|_| invalid())?;
    if !key.has_namespace() {
        return Err(invalid());
    }
    Ok(key)
}

/// Parse `host=namespace/name,...`
fn parse_overrides(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(host, secret)| (host.trim().to_string(), secret.trim().to_string()))
                .ok_or_else(|| ConfigError::InvalidValue {
                    name: "ARGOT_SECRET_OVERRIDES".into(),
                    value: entry.to_string(),
                })
        })
        .collect()
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}
