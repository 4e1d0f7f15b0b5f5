//! Controller module for Service load balancer reconciliation
//! This module contains the kube-rs controller loop and the per-variant
//! pipelines that turn a Service into a cloud load balancer.

mod builder;
pub mod clb;
pub mod context;
pub mod events;
pub mod executor;
mod finalizers;
pub mod hash;
pub mod nlb;
mod pipeline;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
mod reuse;
pub mod server_group;

pub use context::{
    needs_load_balancer, variant_for, ApplyOutcome, LoadBalancerVariant, RequestContext,
};
pub use events::{EventRecorder, EventType, KubeEventRecorder, MemoryRecorder};
pub use finalizers::SERVICE_FINALIZER;
pub use reconciler::{run_controller, ControllerState};

use tracing::debug;

use crate::error::Result;

/// Run the pipeline that owns the Service
///
/// Services of a foreign load balancer class are left alone and reported as
/// released.
pub async fn sync_service(req: &RequestContext) -> Result<ApplyOutcome> {
    match variant_for(&req.service) {
        Some(LoadBalancerVariant::Clb) => clb::apply(req).await,
        Some(LoadBalancerVariant::Nlb) => nlb::apply(req).await,
        None => {
            debug!(service = %req.name, "load balancer class is not ours, skipping");
            Ok(ApplyOutcome {
                released: true,
                ..Default::default()
            })
        }
    }
}
