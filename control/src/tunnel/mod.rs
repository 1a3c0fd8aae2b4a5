//! Tunnel side: routes, links, the router that owns them and the daemon boundary

pub mod backoff;
pub mod daemon;
pub mod link;
pub mod route;
pub mod router;

pub use daemon::{CloudflaredDaemon, ConnectedSignal, TunnelConfig, TunnelDaemon};
pub use link::{LinkFactory, LinkState, TunnelLink};
pub use route::Route;
pub use router::Router;
