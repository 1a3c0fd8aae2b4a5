//! Controller assembly
//!
//! Wires the watchers, caches, index, work queue, worker pool, translator and
//! router together and runs them until shutdown.

pub mod queue;
pub mod rate_limiter;
pub mod worker;

use crate::apis::ingress::caches::Caches;
use crate::apis::ingress::filters::Admission;
use crate::apis::ingress::index::IngressIndex;
use crate::apis::ingress::secrets::SecretResolver;
use crate::apis::ingress::translator::Translator;
use crate::apis::ingress::watcher::{
    resync_ingresses, watch_resource, EventHandler, WatchContext, Watched,
};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::tunnel::daemon::{CloudflaredDaemon, TunnelDaemon};
use crate::tunnel::link::LinkFactory;
use crate::tunnel::router::Router;
use futures::future::join_all;
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use queue::WorkQueue;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use worker::WorkerPool;

pub struct Controller {
    config: Arc<ControllerConfig>,
    client: Client,
    daemon: Arc<dyn TunnelDaemon>,
}

impl Controller {
    /// Controller launching `cloudflared` for every link
    pub fn new(config: Arc<ControllerConfig>, client: Client) -> Self {
        let daemon = Arc::new(CloudflaredDaemon::new(
            config.tunnel.cloudflared_path.clone(),
            config.tunnel.cert_dir.clone(),
        ));
        Self {
            config,
            client,
            daemon,
        }
    }

    /// Replace the tunnel daemon
    pub fn with_daemon(mut self, daemon: Arc<dyn TunnelDaemon>) -> Self {
        self.daemon = daemon;
        self
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        match &self.config.watch_namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }

    fn spawn_watcher<K>(
        &self,
        writer: kube::runtime::reflector::store::Writer<K>,
        ctx: &WatchContext,
        shutdown: &CancellationToken,
    ) -> JoinHandle<()>
    where
        K: Watched + Resource<Scope = NamespaceResourceScope>,
    {
        let handler = EventHandler::new(writer, ctx.clone());
        tokio::spawn(watch_resource(self.api::<K>(), handler, shutdown.clone()))
    }

    /// Run until `shutdown` fires or the initial cache sync fails
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let config = &self.config;
        config.validate()?;

        info!(
            ingress_class = %config.ingress_class,
            namespace = config.watch_namespace.as_deref().unwrap_or("<all>"),
            workers = config.workers,
            "Starting controller"
        );

        let resolver = SecretResolver::from_config(config)?;
        let (caches, writers) = Caches::new();
        let queue = Arc::new(WorkQueue::default());
        let index = IngressIndex::new(config.ingress_class.clone(), resolver);
        let router = Router::new();
        let links = LinkFactory::new(Arc::new(config.tunnel.clone()), Arc::clone(&self.daemon));
        let translator = Translator::new(caches.clone(), index.clone(), router.clone(), links);

        let ctx = WatchContext {
            queue: Arc::clone(&queue),
            admission: Admission::from_config(config),
            index,
        };

        let mut tasks = vec![
            self.spawn_watcher(writers.endpoints, &ctx, &shutdown),
            self.spawn_watcher(writers.ingresses, &ctx, &shutdown),
            self.spawn_watcher(writers.secrets, &ctx, &shutdown),
            self.spawn_watcher(writers.services, &ctx, &shutdown),
        ];

        if let Some(period) = config.resync_period() {
            info!("Resyncing ingresses every {:?}", period);
            tasks.push(tokio::spawn(resync_ingresses(
                caches.ingresses.clone(),
                ctx.clone(),
                period,
                shutdown.clone(),
            )));
        }

        tasks.push(tokio::spawn({
            let router = router.clone();
            let shutdown = shutdown.clone();
            async move { router.run(shutdown).await }
        }));

        let pool = WorkerPool::new(
            queue,
            translator,
            caches,
            config.workers,
            config.requeue_limit,
        );
        let result = pool.run(shutdown.clone()).await;
        if let Err(e) = &result {
            error!("Controller failed: {}", e);
            shutdown.cancel();
        }

        for joined in join_all(tasks).await {
            if let Err(e) = joined {
                error!("Controller task failed: {}", e);
            }
        }

        info!("Controller stopped");
        result
    }
}
