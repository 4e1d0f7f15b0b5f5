//! Checks applied before a user-supplied load balancer is reused

use crate::error::{Error, Result};
use crate::model::{Tag, TAG_KEY_OWNER};

use super::context::RequestContext;

/// Reject a load balancer created by the controller for another Service, or
/// one whose address differs from what the Service already publishes.
pub fn validate_reuse(
    req: &RequestContext,
    lb_id: &str,
    tags: &[Tag],
    address: Option<&str>,
) -> Result<()> {
    let ours = req.load_balancer_name();
    if let Some(owner) = tags.iter().find(|t| t.key == TAG_KEY_OWNER) {
        if owner.value != ours {
            return Err(Error::ReuseRejected(format!(
                "load balancer {lb_id} was created by the controller for another service ({}={})",
                owner.key, owner.value
            )));
        }
    }

    if let (Some(published), Some(actual)) = (req.status_address(), address) {
        if published != actual {
            return Err(Error::ReuseRejected(format!(
                "service {} already publishes {published}, load balancer {lb_id} has address {actual}",
                req.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ClusterSnapshot;
    use crate::config::ReconcileOptions;
    use crate::controller::events::MemoryRecorder;
    use crate::provider::memory::MemoryCloud;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, Service, ServiceStatus,
    };
    use kube::api::ObjectMeta;
    use std::sync::Arc;

    fn request(ingress_ip: Option<&str>) -> RequestContext {
        let service = Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("1111-2222".to_string()),
                ..Default::default()
            },
            status: ingress_ip.map(|ip| ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some(ip.to_string()),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        RequestContext::new(
            service,
            ClusterSnapshot::default(),
            Arc::new(ReconcileOptions::default()),
            Arc::new(MemoryCloud::new()),
            Arc::new(MemoryRecorder::new()),
        )
    }

    #[test]
    fn test_foreign_owner_tag_is_rejected() {
        let req = request(None);
        let tags = vec![Tag::new(TAG_KEY_OWNER, "aotherservice")];
        let err = validate_reuse(&req, "lb-1", &tags, None).unwrap_err();
        assert!(matches!(err, Error::ReuseRejected(_)));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_own_owner_tag_is_accepted() {
        let req = request(None);
        let tags = vec![Tag::new(TAG_KEY_OWNER, req.load_balancer_name())];
        assert!(validate_reuse(&req, "lb-1", &tags, Some("1.2.3.4")).is_ok());
    }

    #[test]
    fn test_address_mismatch_is_rejected() {
        let req = request(Some("1.1.1.1"));
        assert!(validate_reuse(&req, "lb-1", &[], Some("2.2.2.2")).is_err());
        assert!(validate_reuse(&req, "lb-1", &[], Some("1.1.1.1")).is_ok());
    }
}
