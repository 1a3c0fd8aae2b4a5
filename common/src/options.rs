//! Per-Ingress tunnel options parsed from annotations
//!
//! Every option is optional. A missing annotation yields the default; an
//! unparseable value is logged and also yields the default.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Annotation selecting the controller responsible for an Ingress
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

pub const COMPRESSION_QUALITY_ANNOTATION: &str = "argo.cloudflare.com/compression-quality";
pub const HA_CONNECTIONS_ANNOTATION: &str = "argo.cloudflare.com/ha-connections";
pub const HEARTBEAT_COUNT_ANNOTATION: &str = "argo.cloudflare.com/heartbeat-count";
pub const HEARTBEAT_INTERVAL_ANNOTATION: &str = "argo.cloudflare.com/heartbeat-interval";
pub const LB_POOL_ANNOTATION: &str = "argo.cloudflare.com/lb-pool";
pub const NO_CHUNKED_ENCODING_ANNOTATION: &str = "argo.cloudflare.com/no-chunked-encoding";
pub const RETRIES_ANNOTATION: &str = "argo.cloudflare.com/retries";
pub const GRACE_PERIOD_ANNOTATION: &str = "argo.cloudflare.com/grace-period";
pub const TAG_ANNOTATION: &str = "argo.cloudflare.com/tag";

fn default_ha_connections() -> i32 {
    4
}

fn default_heartbeat_count() -> u64 {
    5
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_retries() -> u32 {
    3
}

/// Tunnel configuration overlay for one Ingress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelOptions {
    pub compression_quality: u64,
    pub ha_connections: i32,
    pub heartbeat_count: u64,
    pub heartbeat_interval: Duration,
    pub lb_pool: String,
    pub no_chunked_encoding: bool,
    pub retries: u32,
    pub grace_period: Duration,
    /// Raw `key=value,...` tag list, parsed when a link is built
    pub tags: String,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            compression_quality: 0,
            ha_connections: default_ha_connections(),
            heartbeat_count: default_heartbeat_count(),
            heartbeat_interval: default_heartbeat_interval(),
            lb_pool: String::new(),
            no_chunked_encoding: false,
            retries: default_retries(),
            grace_period: Duration::ZERO,
            tags: String::new(),
        }
    }
}

impl TunnelOptions {
    /// Collect options from an annotation map, defaulting anything absent or invalid
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        let defaults = Self::default();
        Self {
            compression_quality: parse_or(
                annotations,
                COMPRESSION_QUALITY_ANNOTATION,
                defaults.compression_quality,
            ),
            ha_connections: parse_or(
                annotations,
                HA_CONNECTIONS_ANNOTATION,
                defaults.ha_connections,
            ),
            heartbeat_count: parse_or(
                annotations,
                HEARTBEAT_COUNT_ANNOTATION,
                defaults.heartbeat_count,
            ),
            heartbeat_interval: duration_or(
                annotations,
                HEARTBEAT_INTERVAL_ANNOTATION,
                defaults.heartbeat_interval,
            ),
            lb_pool: annotations
                .get(LB_POOL_ANNOTATION)
                .cloned()
                .unwrap_or(defaults.lb_pool),
            no_chunked_encoding: bool_or(
                annotations,
                NO_CHUNKED_ENCODING_ANNOTATION,
                defaults.no_chunked_encoding,
            ),
            retries: parse_or(annotations, RETRIES_ANNOTATION, defaults.retries),
            grace_period: duration_or(annotations, GRACE_PERIOD_ANNOTATION, defaults.grace_period),
            tags: annotations
                .get(TAG_ANNOTATION)
                .cloned()
                .unwrap_or(defaults.tags),
        }
    }
}

fn parse_or<T: FromStr>(annotations: &BTreeMap<String, String>, key: &str, default: T) -> T {
    match annotations.get(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(annotation = key, value = %raw, "Ignoring unparseable annotation, using default");
            default
        }),
    }
}

fn duration_or(annotations: &BTreeMap<String, String>, key: &str, default: Duration) -> Duration {
    match annotations.get(key) {
        None => default,
        Some(raw) => humantime::parse_duration(raw.trim()).unwrap_or_else(|e| {
            warn!(
                annotation = key,
                value = %raw,
                error = %e,
                "Ignoring invalid duration, using default"
            );
            default
        }),
    }
}

/// Only the literals `"true"` and `"false"` are accepted
fn bool_or(annotations: &BTreeMap<String, String>, key: &str, default: bool) -> bool {
    match annotations.get(key).map(String::as_str) {
        None => default,
        Some("true") => true,
        Some("false") => false,
        Some(raw) => {
            warn!(annotation = key, value = raw, "Expected \"true\" or \"false\", using default");
            default
        }
    }
}
