//! Ingress integration: caches, admission, dependency index and translation

pub mod caches;
pub mod filters;
pub mod index;
pub mod secrets;
pub mod translator;
pub mod watcher;

pub use caches::{CacheWriters, Caches};
pub use filters::Admission;
pub use index::IngressIndex;
pub use secrets::SecretResolver;
pub use translator::Translator;
pub use watcher::{EventHandler, WatchContext, Watched};
