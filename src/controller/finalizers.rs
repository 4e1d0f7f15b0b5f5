//! Finalizer handling for Services with a cloud load balancer
//!
//! The finalizer keeps a Service around until its load balancer has been
//! deleted or detached.

use k8s_openapi::api::core::v1::Service;
use kube::{
    api::{Api, Patch, PatchParams},
    ResourceExt,
};
use serde_json::json;
use tracing::info;

use crate::error::Result;

/// Finalizer name used to protect Services
pub const SERVICE_FINALIZER: &str = "service.k8s.alibaba/resources";

/// Field manager for every patch the controller sends
pub const FIELD_MANAGER: &str = "lb-controller";

pub fn has_finalizer(svc: &Service) -> bool {
    svc.finalizers().iter().any(|f| f == SERVICE_FINALIZER)
}

/// Drop the finalizer from a live Service that stopped needing a load balancer
///
/// Deleted Services are handled by the kube-rs `finalizer` helper instead.
pub async fn remove_finalizer(api: &Api<Service>, svc: &Service) -> Result<()> {
    let finalizers: Vec<String> = svc
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != SERVICE_FINALIZER)
        .cloned()
        .collect();

    let patch = json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(
        &svc.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;

    info!(service = %svc.name_any(), "removed finalizer");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    #[test]
    fn test_has_finalizer() {
        let mut svc = Service {
            metadata: ObjectMeta {
                finalizers: Some(vec!["other/finalizer".to_string()]),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!has_finalizer(&svc));
        svc.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(SERVICE_FINALIZER.to_string());
        assert!(has_finalizer(&svc));
    }
}
