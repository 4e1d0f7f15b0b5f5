//! Main reconciler for Services of type LoadBalancer
//!
//! Implements the controller pattern using kube-rs runtime. Node and
//! endpoint changes are mapped back onto the Services they affect.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, LoadBalancerIngress, Node, Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{self, Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        reflector::ObjectRef,
        watcher::Config,
    },
    ResourceExt,
};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::annotations::SERVICE_HASH_ANNOTATION;
use crate::backend::ClusterSnapshot;
use crate::config::ReconcileOptions;
use crate::error::{Error, Result};
use crate::provider::CloudProvider;

use super::context::{
    is_load_balancer_type, needs_load_balancer, variant_for, ApplyOutcome, LoadBalancerVariant,
    RequestContext,
};
use super::events::{
    EventRecorder, EventType, REASON_DELETED_LOAD_BALANCER, REASON_ENSURED_LOAD_BALANCER,
    REASON_SKIP_SYNC_BACKENDS, REASON_SYNC_FAILED,
};
use super::finalizers::{has_finalizer, remove_finalizer, FIELD_MANAGER, SERVICE_FINALIZER};
use super::hash::service_hash;
use super::sync_service;

/// Label EndpointSlices carry to name their Service
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub provider: Arc<dyn CloudProvider>,
    pub recorder: Arc<dyn EventRecorder>,
    pub opts: Arc<ReconcileOptions>,
    /// Services reconciled in parallel
    pub concurrency: u16,
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let services: Api<Service> = Api::all(client.clone());

    info!(
        cluster_id = %state.opts.cluster_id,
        concurrency = state.concurrency,
        endpoint_slice = state.opts.endpoint_slice_enabled,
        "Starting Service load balancer controller"
    );

    let controller = Controller::new(services, Config::default())
        .with_config(controller::Config::default().concurrency(state.concurrency));

    // Any node change may move backends of every load balancer Service
    let store = controller.store();
    let controller = controller.watches(
        Api::<Node>::all(client.clone()),
        Config::default(),
        move |_node: Node| {
            store
                .state()
                .into_iter()
                .filter(|svc| is_load_balancer_type(svc))
                .map(|svc| ObjectRef::from_obj(&*svc))
                .collect::<Vec<_>>()
        },
    );

    let controller = if state.opts.endpoint_slice_enabled {
        controller.watches(
            Api::<EndpointSlice>::all(client.clone()),
            Config::default(),
            |slice: EndpointSlice| {
                let namespace = slice.namespace();
                slice
                    .labels()
                    .get(SERVICE_NAME_LABEL)
                    .map(|name| service_ref(name, namespace.as_deref()))
            },
        )
    } else {
        controller.watches(
            Api::<Endpoints>::all(client.clone()),
            Config::default(),
            |ep: Endpoints| Some(service_ref(&ep.name_any(), ep.namespace().as_deref())),
        )
    };

    controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(service = %obj, "reconciled"),
                Err(e) => warn!("Reconcile error: {e}"),
            }
        })
        .await;

    Ok(())
}

fn service_ref(name: &str, namespace: Option<&str>) -> ObjectRef<Service> {
    let obj = ObjectRef::new(name);
    match namespace {
        Some(ns) => obj.within(ns),
        None => obj,
    }
}

/// The main reconciliation function
///
/// This function is called whenever:
/// - A Service is created, updated, or deleted
/// - A node, Endpoints or EndpointSlice object changes
/// - The requeue timer expires
#[instrument(skip(ctx), fields(name = %svc.name_any(), namespace = svc.namespace()))]
async fn reconcile(svc: Arc<Service>, ctx: Arc<ControllerState>) -> Result<Action> {
    let namespace = svc.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);

    if variant_for(&svc).is_none() {
        if has_finalizer(&svc) {
            warn!("load balancer class changed to a foreign one, releasing the Service");
            ctx.recorder
                .record(
                    &svc,
                    EventType::Warning,
                    REASON_SKIP_SYNC_BACKENDS,
                    "load balancer class is handled by another controller, skip syncing",
                )
                .await;
            remove_finalizer(&api, &svc).await?;
        }
        return Ok(Action::await_change());
    }
    if !is_load_balancer_type(&svc) && !has_finalizer(&svc) {
        return Ok(Action::await_change());
    }

    finalizer(&api, SERVICE_FINALIZER, svc, |event| async {
        match event {
            FinalizerEvent::Apply(svc) => apply_service(&api, &ctx, &svc).await,
            FinalizerEvent::Cleanup(svc) => cleanup_service(&ctx, &svc).await,
        }
    })
    .await
    .map_err(Error::from)
}

/// Run one pipeline pass under the reconcile deadline, recording failures
/// as Warning events on the Service
async fn sync(req: &RequestContext) -> Result<ApplyOutcome> {
    let result = match tokio::time::timeout(req.opts.reconcile_timeout, sync_service(req)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "reconcile of {} exceeded {:?}",
            req.name, req.opts.reconcile_timeout
        ))),
    };
    if let Err(e) = &result {
        req.record(EventType::Warning, REASON_SYNC_FAILED, &e.to_string())
            .await;
    }
    result
}

fn request(ctx: &ControllerState, svc: &Service, snapshot: ClusterSnapshot) -> RequestContext {
    RequestContext::new(
        svc.clone(),
        snapshot,
        ctx.opts.clone(),
        ctx.provider.clone(),
        ctx.recorder.clone(),
    )
}

async fn apply_service(api: &Api<Service>, ctx: &ControllerState, svc: &Service) -> Result<Action> {
    let snapshot = load_snapshot(&ctx.client, svc, &ctx.opts).await?;
    let req = request(ctx, svc, snapshot);
    let outcome = sync(&req).await?;

    if outcome.released {
        if let Some(id) = &outcome.load_balancer_id {
            req.record(
                EventType::Normal,
                REASON_DELETED_LOAD_BALANCER,
                &format!("released load balancer {id}"),
            )
            .await;
        }
        patch_ingress(api, svc, Vec::new()).await?;
        if has_finalizer(svc) {
            remove_finalizer(api, svc).await?;
        }
        return Ok(Action::await_change());
    }

    patch_ingress(api, svc, desired_ingress(svc, &outcome)).await?;
    patch_hash(api, svc).await?;
    if let Some(id) = &outcome.load_balancer_id {
        req.record(
            EventType::Normal,
            REASON_ENSURED_LOAD_BALANCER,
            &format!("ensured load balancer {id}"),
        )
        .await;
    }
    info!(lb_id = ?outcome.load_balancer_id, address = ?outcome.address, "load balancer in sync");
    Ok(next_action(&outcome, &ctx.opts))
}

/// Release the load balancer of a Service being deleted
#[instrument(skip(ctx, svc), fields(name = %svc.name_any(), namespace = svc.namespace()))]
async fn cleanup_service(ctx: &ControllerState, svc: &Service) -> Result<Action> {
    info!("Cleaning up load balancer of deleted Service");
    let req = request(ctx, svc, ClusterSnapshot::default());
    let outcome = sync(&req).await?;
    if let Some(id) = &outcome.load_balancer_id {
        req.record(
            EventType::Normal,
            REASON_DELETED_LOAD_BALANCER,
            &format!("released load balancer {id}"),
        )
        .await;
    }
    Ok(Action::await_change())
}

/// Requeue soon while targets are still coming up, otherwise wait for a change
pub fn next_action(outcome: &ApplyOutcome, opts: &ReconcileOptions) -> Action {
    if outcome.potentially_ready {
        Action::requeue(opts.requeue_delay)
    } else {
        Action::await_change()
    }
}

/// Shorter retry for errors that are expected to clear on their own
pub fn retry_delay(error: &Error) -> Duration {
    if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    }
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(svc: Arc<Service>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!(
        service = %svc.name_any(),
        kind = error.kind(),
        "Reconciliation error: {error}"
    );
    Action::requeue(retry_delay(error))
}

/// Ingress entries to publish: an IP for CLB, a hostname for NLB
pub fn desired_ingress(svc: &Service, outcome: &ApplyOutcome) -> Vec<LoadBalancerIngress> {
    let Some(address) = outcome.address.clone() else {
        return Vec::new();
    };
    let ingress = match variant_for(svc) {
        Some(LoadBalancerVariant::Nlb) => LoadBalancerIngress {
            hostname: Some(address),
            ..Default::default()
        },
        _ => LoadBalancerIngress {
            ip: Some(address),
            ..Default::default()
        },
    };
    vec![ingress]
}

fn current_ingress(svc: &Service) -> Vec<LoadBalancerIngress> {
    svc.status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.clone())
        .unwrap_or_default()
}

async fn patch_ingress(
    api: &Api<Service>,
    svc: &Service,
    ingress: Vec<LoadBalancerIngress>,
) -> Result<()> {
    if current_ingress(svc) == ingress {
        return Ok(());
    }
    let patch = json!({
        "status": {
            "loadBalancer": {
                "ingress": ingress
            }
        }
    });
    api.patch_status(
        &svc.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    debug!(?ingress, "updated Service status");
    Ok(())
}

/// Stamp the hash of the applied Service so the next pass can skip listener updates
async fn patch_hash(api: &Api<Service>, svc: &Service) -> Result<()> {
    let hash = service_hash(svc)?;
    if svc.annotations().get(SERVICE_HASH_ANNOTATION) == Some(&hash) {
        return Ok(());
    }
    let annotations = BTreeMap::from([(SERVICE_HASH_ANNOTATION, hash)]);
    let patch = json!({
        "metadata": {
            "annotations": annotations
        }
    });
    api.patch(
        &svc.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// `k=v` pairs of the Service selector, `None` when it selects nothing
pub fn selector_string(svc: &Service) -> Option<String> {
    let selector: &BTreeMap<String, String> = svc.spec.as_ref()?.selector.as_ref()?;
    if selector.is_empty() {
        return None;
    }
    Some(
        selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Read the nodes, endpoints and pods one reconcile works from
async fn load_snapshot(
    client: &Client,
    svc: &Service,
    opts: &ReconcileOptions,
) -> Result<ClusterSnapshot> {
    if !needs_load_balancer(svc) {
        return Ok(ClusterSnapshot::default());
    }
    let namespace = svc.namespace().unwrap_or_else(|| "default".to_string());
    let name = svc.name_any();

    let nodes = Api::<Node>::all(client.clone())
        .list(&ListParams::default())
        .await?
        .items;
    let mut snapshot = ClusterSnapshot {
        nodes,
        ..Default::default()
    };

    if opts.endpoint_slice_enabled {
        let slices: Api<EndpointSlice> = Api::namespaced(client.clone(), &namespace);
        snapshot.endpoint_slices = slices
            .list(&ListParams::default().labels(&format!("{SERVICE_NAME_LABEL}={name}")))
            .await?
            .items;
    } else {
        let endpoints: Api<Endpoints> = Api::namespaced(client.clone(), &namespace);
        snapshot.endpoints = endpoints.get_opt(&name).await?;
    }

    if let Some(selector) = selector_string(svc) {
        let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        snapshot.pods = pods
            .list(&ListParams::default().labels(&selector))
            .await?
            .items;
    }

    debug!(
        nodes = snapshot.nodes.len(),
        slices = snapshot.endpoint_slices.len(),
        pods = snapshot.pods.len(),
        "loaded cluster snapshot"
    );
    Ok(snapshot)
}
