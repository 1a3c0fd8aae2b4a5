//! Local caches for the four watched kinds
//!
//! Each cache is a kube-runtime reflector store fed by its watcher. Readers look
//! objects up by [`ResourceKey`].

use crate::error::ControllerError;
use common::ResourceKey;
use futures::future::try_join4;
use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::reflector::store::Writer;
use kube::Resource;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn get<K>(store: &Store<K>, key: &ResourceKey) -> Option<Arc<K>>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store.get(&ObjectRef::new(&key.name).within(&key.namespace))
}

/// Read side of the caches
#[derive(Clone)]
pub struct Caches {
    pub endpoints: Store<Endpoints>,
    pub ingresses: Store<Ingress>,
    pub secrets: Store<Secret>,
    pub services: Store<Service>,
}

/// Write side, one writer per watcher
pub struct CacheWriters {
    pub endpoints: Writer<Endpoints>,
    pub ingresses: Writer<Ingress>,
    pub secrets: Writer<Secret>,
    pub services: Writer<Service>,
}

impl Caches {
    pub fn new() -> (Self, CacheWriters) {
        let (endpoints, endpoints_writer) = reflector::store();
        let (ingresses, ingresses_writer) = reflector::store();
        let (secrets, secrets_writer) = reflector::store();
        let (services, services_writer) = reflector::store();
        (
            Self {
                endpoints,
                ingresses,
                secrets,
                services,
            },
            CacheWriters {
                endpoints: endpoints_writer,
                ingresses: ingresses_writer,
                secrets: secrets_writer,
                services: services_writer,
            },
        )
    }

    pub fn endpoints(&self, key: &ResourceKey) -> Option<Arc<Endpoints>> {
        get(&self.endpoints, key)
    }

    pub fn ingress(&self, key: &ResourceKey) -> Option<Arc<Ingress>> {
        get(&self.ingresses, key)
    }

    pub fn secret(&self, key: &ResourceKey) -> Option<Arc<Secret>> {
        get(&self.secrets, key)
    }

    pub fn service(&self, key: &ResourceKey) -> Option<Arc<Service>> {
        get(&self.services, key)
    }

    /// Wait until every cache saw its initial list
    ///
    /// `Ok(false)` when shutdown fired first. A dropped writer is fatal.
    pub async fn wait_for_cache_sync(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<bool, ControllerError> {
        info!("Waiting for caches to sync");
        let ready = try_join4(
            self.endpoints.wait_until_ready(),
            self.ingresses.wait_until_ready(),
            self.secrets.wait_until_ready(),
            self.services.wait_until_ready(),
        );

        tokio::select! {
            _ = shutdown.cancelled() => Ok(false),
            result = ready => {
                result.map_err(|e| ControllerError::CacheSync(e.to_string()))?;
                info!("Caches synced");
                Ok(true)
            }
        }
    }
}
