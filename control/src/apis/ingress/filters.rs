//! Event admission
//!
//! Decides which watch events are worth a work item. A change is queued when
//! either side of it (old or new object) is admitted, so a resource that stops
//! being admitted still gets reconciled away.

use crate::config::ControllerConfig;
use common::INGRESS_CLASS_ANNOTATION;
use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;

/// Secret data key holding the tunnel origin certificate
pub const CERT_PEM_KEY: &str = "cert.pem";

/// Admission settings shared by the four watchers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub ingress_class: String,
    /// Apply the Service port filter (off: every Service event is admitted)
    pub filter_services: bool,
}

impl Admission {
    pub fn new(ingress_class: impl Into<String>, filter_services: bool) -> Self {
        Self {
            ingress_class: ingress_class.into(),
            filter_services,
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(config.ingress_class.clone(), config.filter_services)
    }
}

/// Class of an Ingress: the class annotation, else `spec.ingressClassName`
pub fn ingress_class(ingress: &Ingress) -> Option<&str> {
    ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(INGRESS_CLASS_ANNOTATION))
        .map(String::as_str)
        .or_else(|| {
            ingress
                .spec
                .as_ref()
                .and_then(|spec| spec.ingress_class_name.as_deref())
        })
}

pub fn ingress_matches_class(ingress: &Ingress, class: &str) -> bool {
    ingress_class(ingress) == Some(class)
}

pub fn endpoints_admitted(endpoints: &Endpoints) -> bool {
    endpoints
        .subsets
        .as_ref()
        .is_some_and(|subsets| !subsets.is_empty())
}

pub fn secret_admitted(secret: &Secret) -> bool {
    secret
        .data
        .as_ref()
        .is_some_and(|data| data.contains_key(CERT_PEM_KEY))
}

pub fn service_has_ports(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .is_some_and(|ports| !ports.is_empty())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EndpointSubset, ServicePort, ServiceSpec};
    use k8s_openapi::api::networking::v1::IngressSpec;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn ingress(annotation: Option<&str>, class_name: Option<&str>) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("ing".to_string()),
                namespace: Some("unit".to_string()),
                annotations: annotation.map(|class| {
                    BTreeMap::from([(INGRESS_CLASS_ANNOTATION.to_string(), class.to_string())])
                }),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: class_name.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_ingress_class_annotation() {
        assert!(ingress_matches_class(&ingress(Some("argo-tunnel"), None), "argo-tunnel"));
        assert!(!ingress_matches_class(&ingress(Some("nginx"), None), "argo-tunnel"));
        assert!(!ingress_matches_class(&ingress(None, None), "argo-tunnel"));
    }

    #[test]
    fn test_ingress_class_name_fallback() {
        assert!(ingress_matches_class(&ingress(None, Some("argo-tunnel")), "argo-tunnel"));
        // The annotation wins when both are set
        assert!(!ingress_matches_class(
            &ingress(Some("nginx"), Some("argo-tunnel")),
            "argo-tunnel"
        ));
    }

    #[test]
    fn test_endpoints_need_a_subset() {
        assert!(!endpoints_admitted(&Endpoints::default()));
        assert!(!endpoints_admitted(&Endpoints {
            subsets: Some(vec![]),
            ..Default::default()
        }));
        assert!(endpoints_admitted(&Endpoints {
            subsets: Some(vec![EndpointSubset::default()]),
            ..Default::default()
        }));
    }

    #[test]
    fn test_secret_needs_cert_pem() {
        assert!(!secret_admitted(&Secret::default()));
        let secret = Secret {
            data: Some(BTreeMap::from([(
                CERT_PEM_KEY.to_string(),
                ByteString(b"pem".to_vec()),
            )])),
            ..Default::default()
        };
        assert!(secret_admitted(&secret));
    }

    #[test]
    fn test_service_ports() {
        assert!(!service_has_ports(&Service::default()));
        let service = Service {
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port: 8080,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(service_has_ports(&service));
    }
}
