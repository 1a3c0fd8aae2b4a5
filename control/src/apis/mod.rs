//! Kubernetes API integrations
//!
//! Watchers, caches and translation for networking/v1 Ingress and its core/v1
//! dependencies (Service, Endpoints, Secret).

pub mod ingress;
pub mod metrics;
