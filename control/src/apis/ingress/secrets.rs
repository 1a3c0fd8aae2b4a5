//! Secret resolution for Ingress hosts
//!
//! Order: the Ingress TLS block, then the static host override table, then the
//! controller default secret.

use crate::config::ControllerConfig;
use crate::error::ConfigError;
use common::ResourceKey;
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretResolver {
    default: Option<ResourceKey>,
    overrides: HashMap<String, ResourceKey>,
}

impl SecretResolver {
    pub fn new(default: Option<ResourceKey>, overrides: HashMap<String, ResourceKey>) -> Self {
        Self { default, overrides }
    }

    pub fn from_config(config: &ControllerConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.default_secret_key()?,
            config.secret_override_keys()?,
        ))
    }

    pub fn resolve(
        &self,
        host: &str,
        tls_hosts: &HashMap<String, ResourceKey>,
    ) -> Option<ResourceKey> {
        tls_hosts
            .get(host)
            .or_else(|| self.overrides.get(host))
            .or(self.default.as_ref())
            .cloned()
    }
}

/// Host -> secret table from an Ingress TLS block
///
/// Secrets live in the Ingress namespace. Entries without a secret name are
/// skipped; a host listed twice keeps its first secret.
pub fn tls_hosts(ingress: &Ingress) -> HashMap<String, ResourceKey> {
    let namespace = ingress.metadata.namespace.as_deref().unwrap_or_default();
    let mut hosts = HashMap::new();

    let tls = ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.tls.as_ref())
        .into_iter()
        .flatten();

    for entry in tls {
        let Some(secret_name) = entry.secret_name.as_deref().filter(|s| !s.is_empty()) else {
            continue;
        };
        for host in entry.hosts.iter().flatten() {
            hosts
                .entry(host.clone())
                .or_insert_with(|| ResourceKey::new(namespace, secret_name));
        }
    }

    hosts
}
