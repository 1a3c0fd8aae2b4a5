//! Router - reconciles desired Routes against live tunnel links
//!
//! Every mutation computes its link changes while holding the route map's write
//! lock, then stops and starts links after releasing it. Stops always complete
//! before starts.
//!
//! Mutations are serialized end to end by an async mutex held until their link
//! changes are applied. Readers only take the map lock and never wait on it.

use crate::sync::{safe_read, safe_write};
use crate::tunnel::link::TunnelLink;
use crate::tunnel::route::Route;
use common::{Kind, ResourceKey, Rule};
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Link starts and stops produced by one map mutation
#[derive(Debug, Default)]
struct LinkChanges {
    stop: Vec<TunnelLink>,
    start: Vec<TunnelLink>,
}

impl LinkChanges {
    /// Replace `old` by `new`, keeping equal links from `old`
    fn replace(&mut self, old: Option<Route>, new: &mut Route) {
        let mut old_links = old.map(|route| route.links).unwrap_or_default();

        for (rule, link) in new.links.iter_mut() {
            match old_links.remove(rule) {
                None => self.start.push(link.clone()),
                Some(old_link) if old_link == *link => {
                    // A link that exited on its own gets another chance
                    if !old_link.is_started() {
                        self.start.push(old_link.clone());
                    }
                    *link = old_link;
                }
                Some(old_link) => {
                    self.stop.push(old_link);
                    self.start.push(link.clone());
                }
            }
        }

        self.stop.extend(old_links.into_values());
    }

    fn is_empty(&self) -> bool {
        self.stop.is_empty() && self.start.is_empty()
    }

    async fn apply(self) {
        if self.is_empty() {
            return;
        }
        debug!(
            "Router: stopping {} link(s), starting {} link(s)",
            self.stop.len(),
            self.start.len()
        );
        join_all(self.stop.iter().map(|link| link.stop())).await;
        for link in &self.start {
            link.start();
        }
    }
}

/// Whether a rule references the given dependency
fn rule_depends_on(rule: &Rule, kind: Kind, resource: &ResourceKey) -> bool {
    match kind {
        Kind::Endpoint | Kind::Service => rule.service == *resource,
        Kind::Secret => rule.secret.as_ref() == Some(resource),
        Kind::Ingress => true,
    }
}

/// Owner of all Routes and their links
///
/// Clones share the same route map.
#[derive(Clone, Default)]
pub struct Router {
    routes: Arc<RwLock<HashMap<ResourceKey, Route>>>,
    // Held from the map swap until the swap's links are stopped and started
    mutation: Arc<Mutex<()>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authoritative replacement of a single Route
    pub async fn update_route(&self, mut route: Route) {
        let _mutation = self.mutation.lock().await;
        let changes = {
            let mut routes = safe_write(&self.routes);
            let mut changes = LinkChanges::default();
            let old = routes.remove(&route.key);
            changes.replace(old, &mut route);
            debug!("Router: {}", route);
            routes.insert(route.key.clone(), route);
            changes
        };
        changes.apply().await;
    }

    /// Replace every Route recomputed after a change to a dependency of `kind`
    ///
    /// Only Routes already in the map are replaced. A Route whose Ingress was
    /// deleted, or left the class, after it was recomputed is not brought back.
    pub async fn update_by_kind_routes(&self, kind: Kind, updated: Vec<Route>) {
        let _mutation = self.mutation.lock().await;
        let changes = {
            let mut routes = safe_write(&self.routes);
            let mut changes = LinkChanges::default();
            for mut route in updated {
                let Some(old) = routes.remove(&route.key) else {
                    debug!(%kind, "Router: skipping {}, route no longer exists", route.key);
                    continue;
                };
                changes.replace(Some(old), &mut route);
                debug!(%kind, "Router: {}", route);
                routes.insert(route.key.clone(), route);
            }
            changes
        };
        changes.apply().await;
    }

    /// Remove a Route and stop all of its links
    pub async fn delete_by_route(&self, key: &ResourceKey) {
        let _mutation = self.mutation.lock().await;
        self.remove_route(key).await;
    }

    async fn remove_route(&self, key: &ResourceKey) {
        let removed = safe_write(&self.routes).remove(key);
        if let Some(route) = removed {
            info!("Router: deleted route {} ({} link(s))", key, route.len());
            LinkChanges {
                stop: route.links.into_values().collect(),
                start: Vec::new(),
            }
            .apply()
            .await;
        }
    }

    /// Drop only the links that reference a deleted dependency
    ///
    /// `route_keys` are the Routes known to depend on `resource`. Other rules in
    /// those Routes, and the Route entries themselves, stay in place. A deleted
    /// Ingress removes its whole Route.
    pub async fn delete_by_kind_keys(
        &self,
        kind: Kind,
        resource: &ResourceKey,
        route_keys: &[ResourceKey],
    ) {
        let _mutation = self.mutation.lock().await;
        if kind == Kind::Ingress {
            for key in route_keys {
                self.remove_route(key).await;
            }
            return;
        }

        let changes = {
            let mut routes = safe_write(&self.routes);
            let mut changes = LinkChanges::default();
            for key in route_keys {
                let Some(route) = routes.get_mut(key) else {
                    continue;
                };
                let doomed: Vec<Rule> = route
                    .links
                    .keys()
                    .filter(|rule| rule_depends_on(rule, kind, resource))
                    .cloned()
                    .collect();
                for rule in doomed {
                    if let Some(link) = route.links.remove(&rule) {
                        info!(%kind, %resource, "Router: removing {} from {}", rule, key);
                        changes.stop.push(link);
                    }
                }
            }
            changes
        };
        changes.apply().await;
    }

    /// Block until shutdown, then halt every link
    pub async fn run(&self, shutdown: CancellationToken) {
        shutdown.cancelled().await;
        self.halt().await;
    }

    /// Drain all Routes and stop every link concurrently
    pub async fn halt(&self) {
        let _mutation = self.mutation.lock().await;
        let drained: Vec<Route> = safe_write(&self.routes).drain().map(|(_, r)| r).collect();
        let links: Vec<TunnelLink> = drained
            .into_iter()
            .flat_map(|route| route.links.into_values())
            .collect();
        info!("Router: halting {} link(s)", links.len());
        join_all(links.iter().map(|link| link.stop())).await;
    }

    /// Route keys in a stable order
    pub fn route_keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> = safe_read(&self.routes).keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn route_rules(&self, key: &ResourceKey) -> Option<Vec<Rule>> {
        safe_read(&self.routes).get(key).map(Route::rules)
    }

    pub fn link(&self, key: &ResourceKey, rule: &Rule) -> Option<TunnelLink> {
        safe_read(&self.routes)
            .get(key)
            .and_then(|route| route.links.get(rule))
            .cloned()
    }

    pub fn len(&self) -> usize {
        safe_read(&self.routes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total links across all Routes
    pub fn link_count(&self) -> usize {
        safe_read(&self.routes).values().map(Route::len).sum()
    }
}

impl fmt::Display for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Router: {} route(s), {} link(s)",
            self.len(),
            self.link_count()
        )
    }
}
