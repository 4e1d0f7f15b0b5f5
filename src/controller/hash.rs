//! Service spec hash used to skip listener updates when nothing changed

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::annotations::{ANNOTATION_PREFIX, SERVICE_HASH_ANNOTATION};
use crate::error::Result;

/// Hex SHA-256 over the parts of a Service that shape its load balancer
pub fn service_hash(svc: &Service) -> Result<String> {
    let spec = svc.spec.as_ref();
    let annotations: BTreeMap<&str, &str> = svc
        .metadata
        .annotations
        .iter()
        .flatten()
        .filter(|(k, _)| k.starts_with(ANNOTATION_PREFIX))
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let canonical = json!({
        "ports": spec.and_then(|s| s.ports.as_ref()),
        "type": spec.and_then(|s| s.type_.as_ref()),
        "externalTrafficPolicy": spec.and_then(|s| s.external_traffic_policy.as_ref()),
        "loadBalancerClass": spec.and_then(|s| s.load_balancer_class.as_ref()),
        "annotations": annotations,
    });
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

pub fn stored_hash(svc: &Service) -> Option<&str> {
    svc.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SERVICE_HASH_ANNOTATION))
        .map(String::as_str)
}

/// Whether the Service changed since the last successful apply
pub fn is_hash_changed(svc: &Service) -> bool {
    match (stored_hash(svc), service_hash(svc)) {
        (Some(stored), Ok(current)) => stored != current,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use kube::api::ObjectMeta;

    fn svc(port: i32, extra: &[(&str, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                annotations: Some(
                    extra
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                ports: Some(vec![ServicePort {
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_hash_ignores_foreign_annotations() {
        let a = service_hash(&svc(80, &[])).unwrap();
        let b = service_hash(&svc(80, &[("team", "web")])).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_hash_tracks_ports_and_controller_annotations() {
        let base = service_hash(&svc(80, &[])).unwrap();
        assert_ne!(base, service_hash(&svc(81, &[])).unwrap());
        let scheduler = annotations::key(annotations::SCHEDULER);
        assert_ne!(base, service_hash(&svc(80, &[(scheduler.as_str(), "wlc")])).unwrap());
    }

    #[test]
    fn test_stored_hash_detection() {
        let plain = svc(80, &[]);
        assert!(is_hash_changed(&plain));
        let hash = service_hash(&plain).unwrap();
        let stamped = svc(80, &[(SERVICE_HASH_ANNOTATION, hash.as_str())]);
        assert!(!is_hash_changed(&stamped));
    }
}
