//! Local model pieces shared by the CLB and NLB builders

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::debug;

use crate::backend::EndpointResolver;
use crate::error::Result;
use crate::model::{Backend, ServicePortRef, TargetPort, TrafficPolicy};

use super::context::RequestContext;
use super::events::{EventType, REASON_SKIPPED_NON_VPC_ENDPOINT, REASON_UNAVAILABLE_BACKENDS};

/// Ports declared on the Service, in declaration order
pub fn service_ports(svc: &Service) -> Vec<ServicePortRef> {
    svc.spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| ServicePortRef {
                    name: p.name.clone().unwrap_or_default(),
                    port: p.port,
                    node_port: p.node_port.unwrap_or(0),
                    target_port: match &p.target_port {
                        Some(IntOrString::Int(n)) => TargetPort::Number(*n),
                        Some(IntOrString::String(s)) => TargetPort::Named(s.clone()),
                        None => TargetPort::Number(p.port),
                    },
                    protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Backends of one group, stamped with `description`
///
/// Skipped endpoints and an empty result are reported as events rather
/// than failing the build.
pub async fn group_backends(
    req: &RequestContext,
    resolver: &EndpointResolver<'_>,
    port: &ServicePortRef,
    policy: TrafficPolicy,
    ip_targets: bool,
    weight: Option<i32>,
    description: &str,
) -> Result<(Vec<Backend>, bool)> {
    let resolved = resolver.resolve(port, policy, ip_targets, weight).await?;

    for skipped in &resolved.skipped {
        req.record(
            EventType::Normal,
            REASON_SKIPPED_NON_VPC_ENDPOINT,
            &format!("endpoint {} skipped: {}", skipped.ip, skipped.reason),
        )
        .await;
    }
    if resolved.backends.is_empty() {
        req.record(
            EventType::Warning,
            REASON_UNAVAILABLE_BACKENDS,
            &format!("service port {} has no available backends", port.port),
        )
        .await;
    }
    debug!(
        service = %req.name,
        port = port.port,
        backends = resolved.backends.len(),
        "resolved group backends"
    );

    let backends = resolved
        .backends
        .into_iter()
        .map(|mut b| {
            b.description = description.to_string();
            b
        })
        .collect();
    Ok((backends, resolved.potentially_ready))
}
