//! Resource identity: `(namespace, name)` keys, watched kinds and work-queue keys.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing keys pulled off the work queue
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("unknown resource kind '{0}'")]
    UnknownKind(String),

    #[error("key '{0}' has no kind separator")]
    MissingKind(String),

    #[error("unexpected key format '{0}'")]
    Format(String),
}

// =============================================================================
// ResourceKey
// =============================================================================

/// Key identifying any Kubernetes object: (namespace, name)
///
/// Cluster-scoped objects carry an empty namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    #[inline]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build a key from optional metadata fields
    pub fn from_meta(namespace: Option<&str>, name: Option<&str>) -> Self {
        Self::new(namespace.unwrap_or_default(), name.unwrap_or_default())
    }

    pub fn has_namespace(&self) -> bool {
        !self.namespace.is_empty()
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ResourceKey {
    type Err = KeyError;

    /// Parse `namespace/name` or `name`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new("", *name)),
            [namespace, name] if !name.is_empty() => Ok(Self::new(*namespace, *name)),
            _ => Err(KeyError::Format(s.to_string())),
        }
    }
}

// =============================================================================
// Kind
// =============================================================================

/// Resource kinds watched by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Endpoint,
    Ingress,
    Secret,
    Service,
}

impl Kind {
    pub const ALL: [Kind; 4] = [Kind::Endpoint, Kind::Ingress, Kind::Secret, Kind::Service];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Kind::Endpoint => "endpoint",
            Kind::Ingress => "ingress",
            Kind::Secret => "secret",
            Kind::Service => "service",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "endpoint" => Ok(Kind::Endpoint),
            "ingress" => Ok(Kind::Ingress),
            "secret" => Ok(Kind::Secret),
            "service" => Ok(Kind::Service),
            other => Err(KeyError::UnknownKind(other.to_string())),
        }
    }
}

// =============================================================================
// WorkKey
// =============================================================================

/// Composite queue key: `kind/namespace/name` (or `kind/name`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkKey {
    pub kind: Kind,
    pub key: ResourceKey,
}

impl WorkKey {
    pub fn new(kind: Kind, key: ResourceKey) -> Self {
        Self { kind, key }
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

impl FromStr for WorkKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, meta_key) = s
            .split_once('/')
            .ok_or_else(|| KeyError::MissingKind(s.to_string()))?;
        Ok(Self {
            kind: kind.parse()?,
            key: meta_key.parse()?,
        })
    }
}
