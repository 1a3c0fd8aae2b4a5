//! Ingress Index - secondary indexes from dependencies back to Ingresses
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          IngressIndex                                 │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Data (Arc<RwLock<IndexState>>)         │  Metrics (Atomics)          │
//! │  ┌──────────────────────────────────┐   │  ┌───────────────────────┐  │
//! │  │ secret  (ns, name) → [ingress]   │   │  │ lookups: AtomicU64    │  │
//! │  │ service (ns, name) → [ingress]   │   │  │ hits: AtomicU64       │  │
//! │  │ ingress (ns, name) → entry       │   │  │ adds: AtomicU64       │  │
//! │  └──────────────────────────────────┘   │  │ removes: AtomicU64    │  │
//! │                                          │  └───────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The per-Ingress entry remembers what an Ingress was last indexed under, so an
//! update or delete only touches its own postings.
//!
//! Endpoints share their Service's `namespace/name` and use the service index.

use crate::apis::ingress::filters::ingress_matches_class;
use crate::apis::ingress::secrets::{tls_hosts, SecretResolver};
use crate::sync::{safe_read, safe_write};
use common::{Kind, ResourceKey};
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

// =============================================================================
// Index functions
// =============================================================================

fn push_unique(keys: &mut Vec<ResourceKey>, key: ResourceKey) {
    if !keys.contains(&key) {
        keys.push(key);
    }
}

/// Secrets a class-matching Ingress depends on, in rule order
pub fn secret_keys(ingress: &Ingress, class: &str, resolver: &SecretResolver) -> Vec<ResourceKey> {
    let mut keys = Vec::new();
    if !ingress_matches_class(ingress, class) {
        return keys;
    }

    let tls = tls_hosts(ingress);
    let rules = ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.rules.as_ref())
        .into_iter()
        .flatten();

    for rule in rules {
        let Some(host) = rule.host.as_deref().filter(|h| !h.is_empty()) else {
            continue;
        };
        if let Some(secret) = resolver.resolve(host, &tls) {
            push_unique(&mut keys, secret);
        }
    }
    keys
}

/// Services a class-matching Ingress routes to, in path order
pub fn service_keys(ingress: &Ingress, class: &str) -> Vec<ResourceKey> {
    let mut keys = Vec::new();
    if !ingress_matches_class(ingress, class) {
        return keys;
    }

    let namespace = ingress.metadata.namespace.as_deref().unwrap_or_default();
    let paths = ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.rules.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|rule| rule.http.as_ref())
        .flat_map(|http| http.paths.iter());

    for path in paths {
        let Some(service) = path.backend.service.as_ref() else {
            continue;
        };
        if service.name.is_empty() {
            continue;
        }
        push_unique(&mut keys, ResourceKey::new(namespace, service.name.as_str()));
    }
    keys
}

// =============================================================================
// IngressIndexMetrics
// =============================================================================

/// Lock-free counters for index operations
#[derive(Debug, Default)]
pub struct IngressIndexMetrics {
    lookups: AtomicU64,
    hits: AtomicU64,
    adds: AtomicU64,
    removes: AtomicU64,
}

impl IngressIndexMetrics {
    #[inline(always)]
    fn record_lookup(&self, hit: bool) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline(always)]
    fn record_add(&self) {
        self.adds.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn adds(&self) -> u64 {
        self.adds.load(Ordering::Relaxed)
    }

    pub fn removes(&self) -> u64 {
        self.removes.load(Ordering::Relaxed)
    }

    /// Calculate hit rate (0.0 - 1.0)
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.lookups();
        if lookups == 0 {
            return 0.0;
        }
        self.hits() as f64 / lookups as f64
    }
}

// =============================================================================
// IngressIndex
// =============================================================================

#[derive(Debug, Default)]
struct IndexEntry {
    secrets: Vec<ResourceKey>,
    services: Vec<ResourceKey>,
}

#[derive(Debug, Default)]
struct IndexState {
    by_secret: HashMap<ResourceKey, Vec<ResourceKey>>,
    by_service: HashMap<ResourceKey, Vec<ResourceKey>>,
    entries: HashMap<ResourceKey, IndexEntry>,
}

impl IndexState {
    fn unlink(&mut self, ingress: &ResourceKey) -> bool {
        let Some(entry) = self.entries.remove(ingress) else {
            return false;
        };
        for secret in &entry.secrets {
            drop_posting(&mut self.by_secret, secret, ingress);
        }
        for service in &entry.services {
            drop_posting(&mut self.by_service, service, ingress);
        }
        true
    }
}

fn drop_posting(
    postings: &mut HashMap<ResourceKey, Vec<ResourceKey>>,
    key: &ResourceKey,
    ingress: &ResourceKey,
) {
    if let Some(ingresses) = postings.get_mut(key) {
        ingresses.retain(|k| k != ingress);
        if ingresses.is_empty() {
            postings.remove(key);
        }
    }
}

/// Thread-safe dependency index over the cached Ingresses
///
/// Clones share the same underlying data.
#[derive(Debug, Clone)]
pub struct IngressIndex {
    inner: Arc<RwLock<IndexState>>,
    ingress_class: String,
    resolver: Arc<SecretResolver>,
    metrics: Arc<IngressIndexMetrics>,
}

impl IngressIndex {
    pub fn new(ingress_class: impl Into<String>, resolver: SecretResolver) -> Self {
        Self {
            inner: Arc::new(RwLock::new(IndexState::default())),
            ingress_class: ingress_class.into(),
            resolver: Arc::new(resolver),
            metrics: Arc::new(IngressIndexMetrics::default()),
        }
    }

    /// Re-index an Ingress after it was added or changed
    pub fn upsert(&self, ingress: &Ingress) {
        let key = ResourceKey::from_meta(
            ingress.metadata.namespace.as_deref(),
            ingress.metadata.name.as_deref(),
        );
        let secrets = secret_keys(ingress, &self.ingress_class, &self.resolver);
        let services = service_keys(ingress, &self.ingress_class);

        let mut inner = safe_write(&self.inner);
        inner.unlink(&key);
        self.metrics.record_add();

        if secrets.is_empty() && services.is_empty() {
            return;
        }
        for secret in &secrets {
            inner.by_secret.entry(secret.clone()).or_default().push(key.clone());
        }
        for service in &services {
            inner.by_service.entry(service.clone()).or_default().push(key.clone());
        }
        debug!(
            "IngressIndex: {} -> {} secret(s), {} service(s)",
            key,
            secrets.len(),
            services.len()
        );
        inner.entries.insert(key, IndexEntry { secrets, services });
    }

    /// Drop an Ingress from both indexes
    pub fn remove(&self, key: &ResourceKey) -> bool {
        let removed = safe_write(&self.inner).unlink(key);
        self.metrics.record_remove();
        if removed {
            debug!("IngressIndex: removed {}", key);
        }
        removed
    }

    pub fn by_secret(&self, secret: &ResourceKey) -> Vec<ResourceKey> {
        self.lookup_in(|state| state.by_secret.get(secret))
    }

    pub fn by_service(&self, service: &ResourceKey) -> Vec<ResourceKey> {
        self.lookup_in(|state| state.by_service.get(service))
    }

    /// Ingress keys affected by a change to `key` of `kind`
    pub fn lookup(&self, kind: Kind, key: &ResourceKey) -> Vec<ResourceKey> {
        match kind {
            Kind::Endpoint | Kind::Service => self.by_service(key),
            Kind::Secret => self.by_secret(key),
            Kind::Ingress => vec![key.clone()],
        }
    }

    fn lookup_in<F>(&self, select: F) -> Vec<ResourceKey>
    where
        F: FnOnce(&IndexState) -> Option<&Vec<ResourceKey>>,
    {
        let inner = safe_read(&self.inner);
        let found = select(&inner).cloned().unwrap_or_default();
        self.metrics.record_lookup(!found.is_empty());
        found
    }

    #[inline]
    pub fn ingress_class(&self) -> &str {
        &self.ingress_class
    }

    pub fn resolver(&self) -> &SecretResolver {
        &self.resolver
    }

    /// Number of indexed Ingresses
    pub fn len(&self) -> usize {
        safe_read(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> &IngressIndexMetrics {
        &self.metrics
    }
}

impl fmt::Display for IngressIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = safe_read(&self.inner);
        write!(
            f,
            "IngressIndex({}): {} ingress(es), {} secret(s), {} service(s)",
            self.ingress_class,
            inner.entries.len(),
            inner.by_secret.len(),
            inner.by_service.len()
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
