//! Tunnel rule identity

use crate::resource::ResourceKey;
use std::fmt;

/// Identity of one tunnel binding: host, service port, backing Service and TLS Secret
///
/// Rules are plain value keys. Certificate bytes and tunnel options are not part of
/// the identity; links compare those separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rule {
    pub host: String,
    pub port: i32,
    pub service: ResourceKey,
    pub secret: Option<ResourceKey>,
}

impl Rule {
    pub fn new(
        host: impl Into<String>,
        port: i32,
        service: ResourceKey,
        secret: Option<ResourceKey>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            service,
            secret,
        }
    }

    /// Origin the tunnel forwards to: `service.namespace:port`
    ///
    /// Never fails; missing parts render as empty strings.
    pub fn origin(&self) -> String {
        format!(
            "{}.{}:{}",
            self.service.name, self.service.namespace, self.port
        )
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.host, self.origin())
    }
}
