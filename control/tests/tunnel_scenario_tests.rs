//! End-to-end tunnel scenarios
//!
//! Watch events go through the real event handlers, work queue, worker,
//! translator and router. Only the tunnel daemon is scripted.
//!
//! Run with: cargo test --test tunnel_scenario_tests

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use async_trait::async_trait;
use common::{ResourceKey, Rule, INGRESS_CLASS_ANNOTATION};
use control::apis::ingress::{
    Admission, Caches, EventHandler, IngressIndex, SecretResolver, Translator, WatchContext,
};
use control::config::TunnelSettings;
use control::controller::queue::WorkQueue;
use control::controller::worker::Worker;
use control::error::DaemonError;
use control::tunnel::{
    ConnectedSignal, LinkFactory, LinkState, Router, TunnelConfig, TunnelDaemon,
};
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointSubset, Endpoints, Secret, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::runtime::watcher::Event;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CLASS: &str = "argo-tunnel";

/// Records every launch and runs until asked to stop
#[derive(Default)]
struct FakeDaemon {
    launched: Mutex<Vec<String>>,
}

#[async_trait]
impl TunnelDaemon for FakeDaemon {
    async fn run(
        &self,
        config: TunnelConfig,
        shutdown: CancellationToken,
        connected: ConnectedSignal,
    ) -> Result<(), DaemonError> {
        self.launched.lock().unwrap().push(config.hostname.clone());
        connected.connected();
        shutdown.cancelled().await;
        Ok(())
    }
}

struct Harness {
    router: Router,
    queue: Arc<WorkQueue<String>>,
    worker: Worker,
    endpoints: EventHandler<Endpoints>,
    ingresses: EventHandler<Ingress>,
    secrets: EventHandler<Secret>,
    services: EventHandler<Service>,
}

impl Harness {
    fn new(daemon: Arc<FakeDaemon>) -> Self {
        let (caches, writers) = Caches::new();
        let queue = Arc::new(WorkQueue::default());
        let index = IngressIndex::new(CLASS, SecretResolver::default());
        let router = Router::new();
        let links = LinkFactory::new(Arc::new(TunnelSettings::default()), daemon);
        let translator = Translator::new(caches, index.clone(), router.clone(), links);

        let ctx = WatchContext {
            queue: Arc::clone(&queue),
            admission: Admission::new(CLASS, false),
            index,
        };

        Self {
            router,
            worker: Worker::new(0, Arc::clone(&queue), translator, 2),
            queue,
            endpoints: EventHandler::new(writers.endpoints, ctx.clone()),
            ingresses: EventHandler::new(writers.ingresses, ctx.clone()),
            secrets: EventHandler::new(writers.secrets, ctx.clone()),
            services: EventHandler::new(writers.services, ctx),
        }
    }

    /// Process queued keys until the queue is empty
    async fn settle(&self) {
        while !self.queue.is_empty() {
            assert!(self.worker.process_next().await);
        }
    }
}

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some("unit".to_string()),
        ..Default::default()
    }
}

fn ingress(class: &str, hosts: &[&str]) -> Ingress {
    let mut metadata = meta("ing");
    metadata.annotations = Some(BTreeMap::from([(
        INGRESS_CLASS_ANNOTATION.to_string(),
        class.to_string(),
    )]));

    Ingress {
        metadata,
        spec: Some(IngressSpec {
            rules: Some(
                hosts
                    .iter()
                    .map(|host| IngressRule {
                        host: Some(host.to_string()),
                        http: Some(HTTPIngressRuleValue {
                            paths: vec![HTTPIngressPath {
                                path: Some("/".to_string()),
                                path_type: "Prefix".to_string(),
                                backend: IngressBackend {
                                    service: Some(IngressServiceBackend {
                                        name: "svc-a".to_string(),
                                        port: Some(ServiceBackendPort {
                                            name: Some("http".to_string()),
                                            number: None,
                                        }),
                                    }),
                                    ..Default::default()
                                },
                            }],
                        }),
                    })
                    .collect(),
            ),
            tls: Some(vec![IngressTLS {
                hosts: Some(hosts.iter().map(|h| h.to_string()).collect()),
                secret_name: Some("sec-a".to_string()),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service() -> Service {
    Service {
        metadata: meta("svc-a"),
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 8080,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn endpoints() -> Endpoints {
    Endpoints {
        metadata: meta("svc-a"),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: "10.0.0.7".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

fn secret() -> Secret {
    Secret {
        metadata: meta("sec-a"),
        data: Some(BTreeMap::from([(
            "cert.pem".to_string(),
            ByteString(b"-----BEGIN CERTIFICATE-----".to_vec()),
        )])),
        ..Default::default()
    }
}

fn rule(host: &str) -> Rule {
    Rule::new(
        host,
        8080,
        ResourceKey::new("unit", "svc-a"),
        Some(ResourceKey::new("unit", "sec-a")),
    )
}

fn ing_key() -> ResourceKey {
    ResourceKey::new("unit", "ing")
}

async fn apply_backend(h: &mut Harness) {
    h.services.handle(Event::Apply(service()));
    h.endpoints.handle(Event::Apply(endpoints()));
    h.secrets.handle(Event::Apply(secret()));
}

#[tokio::test]
async fn test_ingress_becomes_running_tunnel() {
    let daemon = Arc::new(FakeDaemon::default());
    let mut h = Harness::new(daemon.clone());

    apply_backend(&mut h).await;
    h.ingresses.handle(Event::Apply(ingress(CLASS, &["a.unit.com"])));
    h.settle().await;

    assert_eq!(h.router.route_keys(), vec![ing_key()]);
    assert_eq!(h.router.route_rules(&ing_key()).unwrap(), vec![rule("a.unit.com")]);

    let link = h.router.link(&ing_key(), &rule("a.unit.com")).unwrap();
    assert!(link.is_started());
    let mut state = link.subscribe();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == LinkState::Running))
        .await
        .expect("link should connect")
        .unwrap();
    assert_eq!(link.origin(), "svc-a.unit:8080");

    // Deleting the Service drops the link but keeps the Route
    h.services.handle(Event::Delete(service()));
    h.settle().await;

    assert_eq!(h.router.route_keys(), vec![ing_key()]);
    assert_eq!(h.router.route_rules(&ing_key()), Some(vec![]));
    assert!(!link.is_started());
    assert_eq!(link.state(), LinkState::Stopped);

    h.router.halt().await;
}

#[tokio::test]
async fn test_foreign_class_never_routed() {
    let daemon = Arc::new(FakeDaemon::default());
    let mut h = Harness::new(daemon.clone());

    apply_backend(&mut h).await;
    h.ingresses.handle(Event::Apply(ingress("nginx", &["a.unit.com"])));
    h.settle().await;

    assert!(h.router.is_empty());
    assert!(daemon.launched.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_class_change_removes_route() {
    let daemon = Arc::new(FakeDaemon::default());
    let mut h = Harness::new(daemon.clone());

    apply_backend(&mut h).await;
    h.ingresses.handle(Event::Apply(ingress(CLASS, &["a.unit.com"])));
    h.settle().await;
    let link = h.router.link(&ing_key(), &rule("a.unit.com")).unwrap();

    h.ingresses.handle(Event::Apply(ingress("nginx", &["a.unit.com"])));
    h.settle().await;

    assert!(h.router.is_empty());
    assert!(!link.is_started());
}

#[tokio::test]
async fn test_host_change_diffs_links() {
    let daemon = Arc::new(FakeDaemon::default());
    let mut h = Harness::new(daemon.clone());

    apply_backend(&mut h).await;
    h.ingresses
        .handle(Event::Apply(ingress(CLASS, &["a.unit.com", "b.unit.com"])));
    h.settle().await;

    let a = h.router.link(&ing_key(), &rule("a.unit.com")).unwrap();
    let b = h.router.link(&ing_key(), &rule("b.unit.com")).unwrap();

    h.ingresses
        .handle(Event::Apply(ingress(CLASS, &["b.unit.com", "c.unit.com"])));
    h.settle().await;

    assert_eq!(
        h.router.route_rules(&ing_key()).unwrap(),
        vec![rule("b.unit.com"), rule("c.unit.com")]
    );
    assert!(!a.is_started(), "A stopped");
    assert!(b.is_started(), "B untouched");
    assert!(h
        .router
        .link(&ing_key(), &rule("b.unit.com"))
        .unwrap()
        .ptr_eq(&b));
    assert!(h
        .router
        .link(&ing_key(), &rule("c.unit.com"))
        .unwrap()
        .is_started());

    h.router.halt().await;
}

#[tokio::test]
async fn test_ingress_delete_stops_everything() {
    let daemon = Arc::new(FakeDaemon::default());
    let mut h = Harness::new(daemon.clone());

    apply_backend(&mut h).await;
    let ing = ingress(CLASS, &["a.unit.com"]);
    h.ingresses.handle(Event::Apply(ing.clone()));
    h.settle().await;
    let link = h.router.link(&ing_key(), &rule("a.unit.com")).unwrap();

    h.ingresses.handle(Event::Delete(ing));
    h.settle().await;

    assert!(h.router.is_empty());
    assert!(!link.is_started());
}

#[tokio::test]
async fn test_endpoints_drain_and_return() {
    let daemon = Arc::new(FakeDaemon::default());
    let mut h = Harness::new(daemon.clone());

    apply_backend(&mut h).await;
    h.ingresses.handle(Event::Apply(ingress(CLASS, &["a.unit.com"])));
    h.settle().await;

    // No ready subsets left: the rule is dropped from the Route
    h.endpoints.handle(Event::Apply(Endpoints {
        metadata: meta("svc-a"),
        subsets: Some(vec![]),
    }));
    h.settle().await;
    assert_eq!(h.router.route_rules(&ing_key()), Some(vec![]));

    h.endpoints.handle(Event::Apply(endpoints()));
    h.settle().await;
    assert_eq!(h.router.route_rules(&ing_key()).unwrap(), vec![rule("a.unit.com")]);
    assert!(h
        .router
        .link(&ing_key(), &rule("a.unit.com"))
        .unwrap()
        .is_started());

    h.router.halt().await;
}
