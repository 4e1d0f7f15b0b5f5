//! Traffic policy selection and node eligibility

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Service};
use kube::ResourceExt;

use crate::annotations::{self, ServiceAnnotations};
use crate::config::ReconcileOptions;
use crate::error::{Error, Result};
use crate::model::{BackendType, TrafficPolicy};

pub const LABEL_NODE_ROLE_MASTER: &str = "node-role.kubernetes.io/master";
pub const LABEL_NODE_ROLE_CONTROL_PLANE: &str = "node-role.kubernetes.io/control-plane";

// Both generations of each exclusion label are honoured.
pub const LABEL_EXCLUDE_NODE: &str = "service.beta.kubernetes.io/exclude-node";
pub const LABEL_EXCLUDE_NODE_ALIBABA: &str = "service.alibabacloud.com/exclude-node";
pub const LABEL_EXCLUDE_BALANCER: &str = "alpha.service-controller.kubernetes.io/exclude-balancer";
pub const LABEL_EXCLUDE_FROM_LB: &str = "node.kubernetes.io/exclude-from-external-load-balancers";

pub const TAINT_TO_BE_DELETED: &str = "ToBeDeletedByClusterAutoscaler";

pub const LABEL_NODE_TYPE: &str = "type";
pub const VIRTUAL_KUBELET: &str = "virtual-kubelet";

/// Pick the traffic policy for a Service
///
/// An explicit ENI backend type wins over everything, so a ClusterIP Service
/// may still be served through pod ENIs.
pub fn traffic_policy(svc: &Service, opts: &ReconcileOptions) -> Result<TrafficPolicy> {
    let anno = ServiceAnnotations::new(svc);
    let backend_type = match anno.get_parsed::<BackendType>(annotations::BACKEND_TYPE)? {
        Some(t) => t,
        None => opts.default_backend_type,
    };
    if backend_type == BackendType::Eni {
        return Ok(TrafficPolicy::Eni);
    }

    let spec = svc.spec.as_ref();
    if spec.and_then(|s| s.type_.as_deref()) == Some("ClusterIP") {
        return Err(Error::ValidationError(format!(
            "service {} is ClusterIP and only supports the eni backend type",
            svc.name_any()
        )));
    }

    match spec.and_then(|s| s.external_traffic_policy.as_deref()) {
        Some("Local") => Ok(TrafficPolicy::Local),
        _ => Ok(TrafficPolicy::Cluster),
    }
}

pub fn is_virtual_node(node: &Node) -> bool {
    node.labels().get(LABEL_NODE_TYPE).map(String::as_str) == Some(VIRTUAL_KUBELET)
}

pub fn is_master_node(node: &Node) -> bool {
    let labels = node.labels();
    labels.contains_key(LABEL_NODE_ROLE_MASTER) || labels.contains_key(LABEL_NODE_ROLE_CONTROL_PLANE)
}

pub fn is_excluded_node(node: &Node) -> bool {
    let labels = node.labels();
    [
        LABEL_EXCLUDE_NODE,
        LABEL_EXCLUDE_NODE_ALIBABA,
        LABEL_EXCLUDE_BALANCER,
        LABEL_EXCLUDE_FROM_LB,
    ]
    .iter()
    .any(|l| labels.contains_key(*l))
}

pub fn is_to_be_deleted(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .map(|taints| taints.iter().any(|t| t.key == TAINT_TO_BE_DELETED))
        .unwrap_or(false)
}

pub fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status == "True")
        .unwrap_or(false)
}

/// Instance id from `spec.providerID` (`<region>.<instance-id>`)
pub fn instance_id(node: &Node) -> Option<String> {
    let provider_id = node.spec.as_ref()?.provider_id.as_deref()?;
    let id = provider_id.rsplit(['.', '/']).next()?;
    (!id.is_empty()).then(|| id.to_string())
}

/// Per-Service node filter built once per reconcile
#[derive(Clone, Debug, Default)]
pub struct NodeFilter {
    pub remove_unscheduled: bool,
    pub label_selector: BTreeMap<String, String>,
}

impl NodeFilter {
    pub fn for_service(svc: &Service) -> Result<Self> {
        let anno = ServiceAnnotations::new(svc);
        Ok(Self {
            remove_unscheduled: anno.is_enabled(annotations::REMOVE_UNSCHEDULED)?,
            label_selector: anno.backend_labels()?,
        })
    }

    /// Whether the node may ever become a backend of this Service
    pub fn is_candidate(&self, node: &Node) -> bool {
        if is_master_node(node) || is_excluded_node(node) || is_to_be_deleted(node) {
            return false;
        }
        if self.remove_unscheduled && is_unschedulable(node) {
            return false;
        }
        let labels = node.labels();
        if !self
            .label_selector
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
        {
            return false;
        }
        // the pod on a virtual node is the real target
        is_virtual_node(node) || is_node_ready(node)
    }
}
