//! Watch loops feeding the caches, the index and the work queue
//!
//! Every event is applied to the kind's reflector writer. Before that, the
//! previous cached object is read back so the handler sees an old/new pair:
//! - identical pairs are dropped
//! - otherwise the key is queued when either side is admitted
//!
//! A re-list (`Init` .. `InitDone`) replaces the cache wholesale. Objects that were
//! cached before but did not show up in the new list are handled as deletions.

use crate::apis::ingress::filters::{
    endpoints_admitted, ingress_matches_class, secret_admitted, service_has_ports, Admission,
};
use crate::apis::ingress::index::IngressIndex;
use crate::controller::queue::WorkQueue;
use common::{Kind, ResourceKey, WorkKey};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Resource;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A kind the controller watches
pub trait Watched:
    Resource<DynamicType = ()>
    + Clone
    + DeserializeOwned
    + Debug
    + PartialEq
    + Send
    + Sync
    + 'static
{
    const KIND: Kind;

    /// Whether a change to this object deserves a work item
    fn admitted(&self, admission: &Admission) -> bool;

    /// Update secondary indexes after the object was applied
    fn index(&self, _index: &IngressIndex) {}

    /// Update secondary indexes after the object went away
    fn unindex(&self, _index: &IngressIndex) {}
}

impl Watched for Endpoints {
    const KIND: Kind = Kind::Endpoint;

    fn admitted(&self, _admission: &Admission) -> bool {
        endpoints_admitted(self)
    }
}

impl Watched for Ingress {
    const KIND: Kind = Kind::Ingress;

    fn admitted(&self, admission: &Admission) -> bool {
        ingress_matches_class(self, &admission.ingress_class)
    }

    fn index(&self, index: &IngressIndex) {
        index.upsert(self);
    }

    fn unindex(&self, index: &IngressIndex) {
        index.remove(&resource_key(self));
    }
}

impl Watched for Secret {
    const KIND: Kind = Kind::Secret;

    fn admitted(&self, _admission: &Admission) -> bool {
        secret_admitted(self)
    }
}

impl Watched for Service {
    const KIND: Kind = Kind::Service;

    fn admitted(&self, admission: &Admission) -> bool {
        !admission.filter_services || service_has_ports(self)
    }
}

pub fn resource_key<K: Resource>(obj: &K) -> ResourceKey {
    let meta = obj.meta();
    ResourceKey::from_meta(meta.namespace.as_deref(), meta.name.as_deref())
}

/// What every watcher shares
#[derive(Clone)]
pub struct WatchContext {
    pub queue: Arc<WorkQueue<String>>,
    pub admission: Admission,
    pub index: IngressIndex,
}

impl WatchContext {
    fn enqueue(&self, kind: Kind, key: ResourceKey) {
        let work = WorkKey::new(kind, key).to_string();
        debug!("Queueing {}", work);
        self.queue.add(work);
    }
}

/// Turns watch events for one kind into cache updates and work items
pub struct EventHandler<K: Watched> {
    writer: Writer<K>,
    store: Store<K>,
    ctx: WatchContext,
    relisted: HashSet<ObjectRef<K>>,
}

impl<K: Watched> EventHandler<K> {
    pub fn new(writer: Writer<K>, ctx: WatchContext) -> Self {
        let store = writer.as_reader();
        Self {
            writer,
            store,
            ctx,
            relisted: HashSet::new(),
        }
    }

    pub fn handle(&mut self, event: watcher::Event<K>) {
        match &event {
            watcher::Event::Apply(obj) => {
                let old = self.store.get(&ObjectRef::from_obj(obj));
                self.writer.apply_watcher_event(&event);
                self.on_change(old.as_deref(), obj);
            }
            watcher::Event::Delete(obj) => {
                self.writer.apply_watcher_event(&event);
                self.on_delete(obj);
            }
            watcher::Event::Init => {
                debug!(kind = %K::KIND, "Re-list started");
                self.relisted.clear();
                self.writer.apply_watcher_event(&event);
            }
            watcher::Event::InitApply(obj) => {
                let obj_ref = ObjectRef::from_obj(obj);
                // The store still holds the pre-list state until InitDone
                let old = self.store.get(&obj_ref);
                self.relisted.insert(obj_ref);
                self.writer.apply_watcher_event(&event);
                self.on_change(old.as_deref(), obj);
            }
            watcher::Event::InitDone => {
                let gone: Vec<Arc<K>> = self
                    .store
                    .state()
                    .into_iter()
                    .filter(|obj| !self.relisted.contains(&ObjectRef::from_obj(obj.as_ref())))
                    .collect();
                self.writer.apply_watcher_event(&event);
                for obj in gone {
                    self.on_delete(&obj);
                }
                self.relisted.clear();
                info!(kind = %K::KIND, "Cache synced ({} object(s))", self.store.len());
            }
        }
    }

    fn on_change(&self, old: Option<&K>, new: &K) {
        new.index(&self.ctx.index);
        if old == Some(new) {
            return;
        }

        let admission = &self.ctx.admission;
        if old.is_some_and(|o| o.admitted(admission)) || new.admitted(admission) {
            self.ctx.enqueue(K::KIND, resource_key(new));
        }
    }

    fn on_delete(&self, last_known: &K) {
        last_known.unindex(&self.ctx.index);
        if last_known.admitted(&self.ctx.admission) {
            self.ctx.enqueue(K::KIND, resource_key(last_known));
        }
    }

    pub fn store(&self) -> &Store<K> {
        &self.store
    }
}

/// Run the watch stream for one kind until shutdown
pub async fn watch_resource<K: Watched>(
    api: Api<K>,
    mut handler: EventHandler<K>,
    shutdown: CancellationToken,
) {
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);

    info!(kind = %K::KIND, "Starting watcher");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(event)) => handler.handle(event),
                Some(Err(e)) => warn!(kind = %K::KIND, "Watcher error: {}", e),
                None => {
                    warn!(kind = %K::KIND, "Watch stream ended");
                    break;
                }
            },
        }
    }

    info!(kind = %K::KIND, "Watcher stopped");
}

/// Periodically re-queue every admitted Ingress
pub async fn resync_ingresses(
    store: Store<Ingress>,
    ctx: WatchContext,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let mut count = 0;
                for ingress in store.state() {
                    if ingress.admitted(&ctx.admission) {
                        ctx.enqueue(Kind::Ingress, resource_key(ingress.as_ref()));
                        count += 1;
                    }
                }
                debug!("Resync queued {} ingress(es)", count);
            }
        }
    }
}
