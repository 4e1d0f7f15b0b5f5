//! Per-reconcile request state shared by builders, fetchers and appliers

use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;

use crate::annotations::{self, ServiceAnnotations};
use crate::backend::ClusterSnapshot;
use crate::config::ReconcileOptions;
use crate::model::{load_balancer_name, NamespacedName};
use crate::provider::CloudProvider;

use super::events::{EventRecorder, EventType};
use super::hash;

/// `spec.loadBalancerClass` handled by the NLB pipeline
pub const NLB_CLASS: &str = "alibabacloud.com/nlb";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadBalancerVariant {
    Clb,
    Nlb,
}

/// Which pipeline owns the Service, `None` for a foreign load balancer class
pub fn variant_for(svc: &Service) -> Option<LoadBalancerVariant> {
    match svc.spec.as_ref().and_then(|s| s.load_balancer_class.as_deref()) {
        None => Some(LoadBalancerVariant::Clb),
        Some(NLB_CLASS) => Some(LoadBalancerVariant::Nlb),
        Some(_) => None,
    }
}

pub fn is_load_balancer_type(svc: &Service) -> bool {
    svc.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some("LoadBalancer")
}

/// Live, of type LoadBalancer and of a class handled here
pub fn needs_load_balancer(svc: &Service) -> bool {
    svc.metadata.deletion_timestamp.is_none()
        && is_load_balancer_type(svc)
        && variant_for(svc).is_some()
}

pub struct RequestContext {
    pub service: Service,
    pub name: NamespacedName,
    pub snapshot: ClusterSnapshot,
    pub opts: Arc<ReconcileOptions>,
    pub provider: Arc<dyn CloudProvider>,
    pub recorder: Arc<dyn EventRecorder>,
}

impl RequestContext {
    pub fn new(
        service: Service,
        snapshot: ClusterSnapshot,
        opts: Arc<ReconcileOptions>,
        provider: Arc<dyn CloudProvider>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            name: NamespacedName::from_service(&service),
            service,
            snapshot,
            opts,
            provider,
            recorder,
        }
    }

    pub fn annotations(&self) -> ServiceAnnotations<'_> {
        ServiceAnnotations::new(&self.service)
    }

    /// Ownership tag value of the Service's load balancer
    pub fn load_balancer_name(&self) -> String {
        load_balancer_name(&self.service.uid().unwrap_or_default())
    }

    pub fn cluster_id(&self) -> &str {
        &self.opts.cluster_id
    }

    pub fn needs_load_balancer(&self) -> bool {
        needs_load_balancer(&self.service)
    }

    pub fn is_reused(&self) -> bool {
        self.annotations().has(annotations::LOADBALANCER_ID)
    }

    /// Listener attributes need reconciling on reused load balancers only when asked
    pub fn override_listeners(&self) -> bool {
        self.annotations()
            .is_enabled(annotations::OVERRIDE_LISTENERS)
            .unwrap_or(false)
    }

    pub fn hash_changed(&self) -> bool {
        hash::is_hash_changed(&self.service)
    }

    /// Address the Service currently reports in its status
    pub fn status_address(&self) -> Option<String> {
        self.service
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .and_then(|ingress| ingress.first())
            .and_then(|i| i.ip.clone().or_else(|| i.hostname.clone()))
    }

    pub async fn record(&self, type_: EventType, reason: &str, message: &str) {
        self.recorder
            .record(&self.service, type_, reason, message)
            .await;
    }
}

/// Desired model plus what the resolver learned while building it
#[derive(Clone, Debug)]
pub struct LocalBuild<M> {
    pub model: M,
    pub potentially_ready: bool,
}

/// Result of one Apply
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub load_balancer_id: Option<String>,
    /// IP (CLB) or DNS name (NLB) to publish in the Service status
    pub address: Option<String>,
    /// Requeue soon: some endpoints will become addable
    pub potentially_ready: bool,
    /// The load balancer was deleted or detached
    pub released: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    fn svc(type_: &str, class: Option<&str>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                load_balancer_class: class.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_class_selection() {
        assert_eq!(variant_for(&svc("LoadBalancer", None)), Some(LoadBalancerVariant::Clb));
        assert_eq!(
            variant_for(&svc("LoadBalancer", Some(NLB_CLASS))),
            Some(LoadBalancerVariant::Nlb)
        );
        assert_eq!(variant_for(&svc("LoadBalancer", Some("example.com/lb"))), None);
    }

    #[test]
    fn test_needs_load_balancer() {
        assert!(needs_load_balancer(&svc("LoadBalancer", None)));
        assert!(!needs_load_balancer(&svc("NodePort", None)));
        assert!(!needs_load_balancer(&svc("LoadBalancer", Some("example.com/lb"))));

        let mut deleting = svc("LoadBalancer", None);
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(!needs_load_balancer(&deleting));
    }
}
