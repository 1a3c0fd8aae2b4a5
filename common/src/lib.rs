//! argot common types
//!
//! Kubernetes-independent data model shared by the controller: resource keys,
//! watched kinds, work-queue keys, tunnel rules, tunnel options and tags.

pub mod options;
pub mod resource;
pub mod rule;
pub mod tags;

pub use options::{TunnelOptions, INGRESS_CLASS_ANNOTATION};
pub use resource::{KeyError, Kind, ResourceKey, WorkKey};
pub use rule::Rule;
pub use tags::{parse_tags, Tag};
