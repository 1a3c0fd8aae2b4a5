//! Translator - turns cached Kubernetes state into desired Routes
//!
//! Only root-path rules are supported: one host maps to one backend Service.
//! A rule whose Service, port or Endpoints cannot be resolved is left out of
//! the Route and revisited on the next relevant event.

use crate::apis::ingress::caches::Caches;
use crate::apis::ingress::filters::{endpoints_admitted, ingress_matches_class, CERT_PEM_KEY};
use crate::apis::ingress::index::IngressIndex;
use crate::apis::ingress::secrets::tls_hosts;
use crate::apis::ingress::watcher::resource_key;
use crate::error::TranslateError;
use crate::tunnel::link::LinkFactory;
use crate::tunnel::route::Route;
use crate::tunnel::router::Router;
use common::{Kind, ResourceKey, Rule, TunnelOptions};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{Ingress, ServiceBackendPort};
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Translator {
    caches: Caches,
    index: IngressIndex,
    router: Router,
    links: LinkFactory,
}

impl Translator {
    pub fn new(caches: Caches, index: IngressIndex, router: Router, links: LinkFactory) -> Self {
        Self {
            caches,
            index,
            router,
            links,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Reconcile the Routes affected by a change to `key` of `kind`
    pub async fn handle_resource(
        &self,
        kind: Kind,
        key: &ResourceKey,
    ) -> Result<(), TranslateError> {
        if !key.has_namespace() {
            return Err(TranslateError::MissingNamespace {
                kind,
                key: key.clone(),
            });
        }

        match kind {
            Kind::Ingress => self.handle_ingress(key).await,
            Kind::Endpoint | Kind::Secret | Kind::Service => {
                self.handle_dependency(kind, key).await
            }
        }
        Ok(())
    }

    async fn handle_ingress(&self, key: &ResourceKey) {
        let ingress = self
            .caches
            .ingress(key)
            .filter(|ing| ingress_matches_class(ing, self.index.ingress_class()));

        match self.route_from_ingress(ingress.as_deref()) {
            Some(route) => self.router.update_route(route).await,
            None => {
                debug!("Ingress {} is gone or not ours, deleting route", key);
                self.router.delete_by_route(key).await;
            }
        }
    }

    async fn handle_dependency(&self, kind: Kind, key: &ResourceKey) {
        let ingress_keys = self.index.lookup(kind, key);
        if ingress_keys.is_empty() {
            debug!("No ingress depends on {} {}", kind, key);
            return;
        }

        if !self.dependency_exists(kind, key) {
            self.router
                .delete_by_kind_keys(kind, key, &ingress_keys)
                .await;
            return;
        }

        let class = self.index.ingress_class();
        let routes: Vec<Route> = ingress_keys
            .iter()
            .filter_map(|ingress_key| self.caches.ingress(ingress_key))
            .filter(|ing| ingress_matches_class(ing, class))
            .filter_map(|ing| self.route_from_ingress(Some(&*ing)))
            .collect();
        self.router.update_by_kind_routes(kind, routes).await;
    }

    fn dependency_exists(&self, kind: Kind, key: &ResourceKey) -> bool {
        match kind {
            Kind::Endpoint => self.caches.endpoints(key).is_some(),
            Kind::Secret => self.caches.secret(key).is_some(),
            Kind::Service => self.caches.service(key).is_some(),
            Kind::Ingress => self.caches.ingress(key).is_some(),
        }
    }

    /// Build the Route for an Ingress; `None` for no Ingress
    ///
    /// Links are created but not started.
    pub fn route_from_ingress(&self, ingress: Option<&Ingress>) -> Option<Route> {
        let ingress = ingress?;
        let key = resource_key(ingress);
        let empty = BTreeMap::new();
        let options = TunnelOptions::from_annotations(
            ingress.metadata.annotations.as_ref().unwrap_or(&empty),
        );
        let tls = tls_hosts(ingress);
        let mut route = Route::new(key.clone(), options);

        let rules = ingress
            .spec
            .as_ref()
            .and_then(|spec| spec.rules.as_ref())
            .into_iter()
            .flatten();

        for rule in rules {
            let Some(host) = rule.host.as_deref().filter(|h| !h.is_empty()) else {
                continue;
            };
            let Some(http) = rule.http.as_ref() else {
                continue;
            };

            for path in &http.paths {
                let prefix = path.path.as_deref().unwrap_or_default();
                if !prefix.is_empty() && prefix != "/" {
                    warn!(
                        ingress = %key,
                        host,
                        "Skipping path '{}': only the root path is supported",
                        prefix
                    );
                    continue;
                }
                let Some(backend) = path.backend.service.as_ref().filter(|s| !s.name.is_empty())
                else {
                    warn!(ingress = %key, host, "Skipping path without a backend service");
                    continue;
                };

                let service_key = ResourceKey::new(key.namespace.as_str(), backend.name.as_str());
                let Some(service) = self.caches.service(&service_key) else {
                    warn!(ingress = %key, host, "Service {} not found", service_key);
                    continue;
                };
                let Some(port) = match_port(&service, backend.port.as_ref()) else {
                    warn!(ingress = %key, host, "No matching port on service {}", service_key);
                    continue;
                };
                if !self
                    .caches
                    .endpoints(&service_key)
                    .is_some_and(|ep| endpoints_admitted(&ep))
                {
                    warn!(ingress = %key, host, "Endpoints {} not found or empty", service_key);
                    continue;
                }

                // Same resolution as the secret index, override table included, so a
                // change to an override secret reaches the Routes that use it
                let secret = self.index.resolver().resolve(host, &tls);
                let cert = secret
                    .as_ref()
                    .map(|secret_key| self.certificate(secret_key, host))
                    .unwrap_or_default();

                let rule = Rule::new(host, port, service_key, secret);
                debug!(ingress = %key, "Rule {}", rule);
                let link = self.links.link(rule, cert, route.options.clone());
                route.insert(link);
            }
        }

        Some(route)
    }

    /// Origin certificate bytes; empty when unavailable
    ///
    /// The certificate is not checked against the hostname.
    fn certificate(&self, secret_key: &ResourceKey, host: &str) -> Vec<u8> {
        let Some(secret) = self.caches.secret(secret_key) else {
            warn!(host, "Secret {} not found, using an empty certificate", secret_key);
            return Vec::new();
        };
        match secret.data.as_ref().and_then(|data| data.get(CERT_PEM_KEY)) {
            Some(cert) => cert.0.clone(),
            None => {
                warn!(
                    host,
                    "Secret {} has no {}, using an empty certificate",
                    secret_key,
                    CERT_PEM_KEY
                );
                Vec::new()
            }
        }
    }
}

/// Service port number referenced by an Ingress backend, by number or by name
pub fn match_port(service: &Service, backend_port: Option<&ServiceBackendPort>) -> Option<i32> {
    let backend_port = backend_port?;
    let ports = service.spec.as_ref()?.ports.as_ref()?;

    ports
        .iter()
        .find(|port| match (backend_port.number, backend_port.name.as_deref()) {
            (Some(number), _) if number != 0 => port.port == number,
            (_, Some(name)) if !name.is_empty() => port.name.as_deref() == Some(name),
            _ => false,
        })
        .map(|port| port.port)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::apis::ingress::secrets::SecretResolver;
    use crate::config::TunnelSettings;
    use crate::error::DaemonError;
    use crate::tunnel::daemon::{ConnectedSignal, TunnelConfig, TunnelDaemon};
    use async_trait::async_trait;
    use common::INGRESS_CLASS_ANNOTATION;
    use k8s_openapi::api::core::v1::{EndpointSubset, Endpoints, Secret, ServicePort, ServiceSpec};
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule,
        IngressServiceBackend, IngressSpec, IngressTLS,
    };
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use kube::runtime::watcher::Event;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    const CLASS: &str = "argo-tunnel";

    struct IdleDaemon;

    #[async_trait]
    impl TunnelDaemon for IdleDaemon {
        async fn run(
            &self,
            _config: TunnelConfig,
            shutdown: CancellationToken,
            connected: ConnectedSignal,
        ) -> Result<(), DaemonError> {
            connected.connected();
            shutdown.cancelled().await;
            Ok(())
        }
    }

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("unit".to_string()),
            ..Default::default()
        }
    }

    fn ingress(path: &str, port: ServiceBackendPort) -> Ingress {
        let mut metadata = meta("ing");
        metadata.annotations = Some(BTreeMap::from([(
            INGRESS_CLASS_ANNOTATION.to_string(),
            CLASS.to_string(),
        )]));
        Ingress {
            metadata,
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    host: Some("a.unit.com".to_string()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some(path.to_string()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: "svc-a".to_string(),
                                    port: Some(port),
                                }),
                                ..Default::default()
                            },
                        }],
                    }),
                }]),
                tls: Some(vec![IngressTLS {
                    hosts: Some(vec!["a.unit.com".to_string()]),
                    secret_name: Some("sec-a".to_string()),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn by_name(name: &str) -> ServiceBackendPort {
        ServiceBackendPort {
            name: Some(name.to_string()),
            number: None,
        }
    }

    fn by_number(number: i32) -> ServiceBackendPort {
        ServiceBackendPort {
            name: None,
            number: Some(number),
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

    fn endpoints(subsets: usize) -> Endpoints {
        Endpoints {
            metadata: meta("svc-a"),
            subsets: Some(vec![EndpointSubset::default(); subsets]),
        }
    }

    fn secret(with_cert: bool) -> Secret {
        Secret {
            metadata: meta("sec-a"),
            data: with_cert.then(|| {
                BTreeMap::from([(CERT_PEM_KEY.to_string(), ByteString(b"pem".to_vec()))])
            }),
            ..Default::default()
        }
    }

    struct Fixture {
        translator: Translator,
        writers: crate::apis::ingress::caches::CacheWriters,
    }

    fn fixture() -> Fixture {
        let (caches, writers) = Caches::new();
        let index = IngressIndex::new(CLASS, SecretResolver::default());
        let links = LinkFactory::new(Arc::new(TunnelSettings::default()), Arc::new(IdleDaemon));
        Fixture {
            translator: Translator::new(caches, index, Router::new(), links),
            writers,
        }
    }

    impl Fixture {
        fn with_backend(mut self, subsets: usize, with_cert: bool) -> Self {
            self.writers.services.apply_watcher_event(&Event::Apply(service()));
            self.writers
                .endpoints
                .apply_watcher_event(&Event::Apply(endpoints(subsets)));
            self.writers
                .secrets
                .apply_watcher_event(&Event::Apply(secret(with_cert)));
            self
        }
    }

    #[test]
    fn test_match_port() {
        let svc = service();
        assert_eq!(match_port(&svc, Some(&by_number(8080))), Some(8080));
        assert_eq!(match_port(&svc, Some(&by_name("http"))), Some(8080));
        assert_eq!(match_port(&svc, Some(&by_number(9090))), None);
        assert_eq!(match_port(&svc, Some(&by_name("grpc"))), None);
        assert_eq!(match_port(&svc, None), None);
    }

    #[test]
    fn test_no_ingress_no_route() {
        let f = fixture();
        assert!(f.translator.route_from_ingress(None).is_none());
    }

    #[test]
    fn test_route_from_ingress() {
        let f = fixture().with_backend(1, true);
        let route = f
            .translator
            .route_from_ingress(Some(&ingress("/", by_name("http"))))
            .unwrap();

        assert_eq!(route.key, ResourceKey::new("unit", "ing"));
        let expected = Rule::new(
            "a.unit.com",
            8080,
            ResourceKey::new("unit", "svc-a"),
            Some(ResourceKey::new("unit", "sec-a")),
        );
        assert_eq!(route.rules(), vec![expected.clone()]);

        let link = &route.links[&expected];
        assert_eq!(link.cert(), b"pem");
        assert_eq!(link.origin(), "svc-a.unit:8080");
        assert!(!link.is_started());
    }

    #[test]
    fn test_non_root_path_skipped() {
        let f = fixture().with_backend(1, true);
        let route = f
            .translator
            .route_from_ingress(Some(&ingress("/api", by_number(8080))))
            .unwrap();
        assert!(route.is_empty());
    }

    #[test]
    fn test_unserved_backend_skipped() {
        let f = fixture().with_backend(0, true);
        let route = f
            .translator
            .route_from_ingress(Some(&ingress("", by_number(8080))))
            .unwrap();
        assert!(route.is_empty());
    }

    #[test]
    fn test_missing_service_skipped() {
        let f = fixture();
        let route = f
            .translator
            .route_from_ingress(Some(&ingress("/", by_number(8080))))
            .unwrap();
        assert!(route.is_empty());
    }

    #[test]
    fn test_missing_cert_tolerated() {
        let f = fixture().with_backend(1, false);
        let route = f
            .translator
            .route_from_ingress(Some(&ingress("/", by_number(8080))))
            .unwrap();
        assert_eq!(route.len(), 1);
        assert!(route.links.values().all(|link| link.cert().is_empty()));
    }

    #[tokio::test]
    async fn test_missing_namespace_rejected() {
        let f = fixture();
        let err = f
            .translator
            .handle_resource(Kind::Service, &ResourceKey::new("", "svc-a"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TranslateError::MissingNamespace {
                kind: Kind::Service,
                key: ResourceKey::new("", "svc-a"),
            }
        );
    }

    #[tokio::test]
    async fn test_foreign_class_never_routed() {
        let mut f = fixture().with_backend(1, true);
        let mut ing = ingress("/", by_number(8080));
        ing.metadata.annotations = Some(BTreeMap::from([(
            INGRESS_CLASS_ANNOTATION.to_string(),
            "nginx".to_string(),
        )]));
        f.writers.ingresses.apply_watcher_event(&Event::Apply(ing));

        f.translator
            .handle_resource(Kind::Ingress, &ResourceKey::new("unit", "ing"))
            .await
            .unwrap();
        assert!(f.translator.router().is_empty());
    }

    #[tokio::test]
    async fn test_secret_rotation_restarts_link() {
        let mut f = fixture().with_backend(1, true);
        let ing = ingress("/", by_number(8080));
        f.translator.index.upsert(&ing);
        f.writers.ingresses.apply_watcher_event(&Event::Apply(ing));

        let ing_key = ResourceKey::new("unit", "ing");
        f.translator.handle_resource(Kind::Ingress, &ing_key).await.unwrap();
        let rule = f.translator.router().route_rules(&ing_key).unwrap()[0].clone();
        let before = f.translator.router().link(&ing_key, &rule).unwrap();

        let mut rotated = secret(true);
        rotated.data = Some(BTreeMap::from([(
            CERT_PEM_KEY.to_string(),
            ByteString(b"rotated".to_vec()),
        )]));
        f.writers.secrets.apply_watcher_event(&Event::Apply(rotated));
        f.translator
            .handle_resource(Kind::Secret, &ResourceKey::new("unit", "sec-a"))
            .await
            .unwrap();

        let after = f.translator.router().link(&ing_key, &rule).unwrap();
        assert_eq!(after.cert(), b"rotated");
        assert!(!before.is_started());
        assert!(after.is_started());

        f.translator.router().halt().await;
    }

    #[tokio::test]
    async fn test_unindexed_dependency_is_noop() {
        let f = fixture().with_backend(1, true);
        f.translator
            .handle_resource(Kind::Endpoint, &ResourceKey::new("unit", "svc-a"))
            .await
            .unwrap();
        assert!(f.translator.router().is_empty());
    }
}
