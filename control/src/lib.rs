//! argot control plane library
//!
//! Kubernetes watchers and translation (`apis`), the work queue and worker pool
//! (`controller`), and the tunnel router and links (`tunnel`).

pub mod apis;
pub mod config;
pub mod controller;
pub mod error;
mod sync;
pub mod tunnel;
