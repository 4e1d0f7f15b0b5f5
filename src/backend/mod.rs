//! Endpoint resolution
//!
//! Turns a Service port plus the current Nodes, Pods and Endpoints (or
//! EndpointSlices) into the backend set its server group should hold. Which
//! endpoints count and how they are weighted depends on the
//! [`TrafficPolicy`]:
//!
//! - ENI: every ready pod, registered through its network interface
//! - Local: nodes hosting a ready pod, weighted by pod count
//! - Cluster: every eligible node
//!
//! Pods on virtual nodes are always registered through their ENI since the
//! node has no instance behind it.

pub mod policy;
pub mod weight;

use std::collections::HashSet;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::{Endpoints, Node, ObjectReference, Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::config::ReconcileOptions;
use crate::error::{Error, Result};
use crate::model::{Backend, ServicePortRef, TrafficPolicy};
use crate::provider::VpcProvider;

pub use policy::{traffic_policy, NodeFilter};

/// Prefix of the pod readiness gate owned by the controller; the Service
/// name completes the condition type.
pub const READINESS_GATE_PREFIX: &str = "service.readiness.alibabacloud.com/";

/// Kubernetes state a reconcile works from, as materialised by the watch layer
#[derive(Clone, Debug, Default)]
pub struct ClusterSnapshot {
    pub nodes: Vec<Node>,
    pub endpoints: Option<Endpoints>,
    pub endpoint_slices: Vec<EndpointSlice>,
    pub pods: Vec<Pod>,
}

impl ClusterSnapshot {
    fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name_any() == name)
    }

    fn pod(&self, namespace: &str, name: &str) -> Option<&Pod> {
        self.pods
            .iter()
            .find(|p| p.name_any() == name && p.namespace().as_deref() == Some(namespace))
    }
}

/// Endpoint IP that was left out without failing the reconcile
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedEndpoint {
    pub ip: String,
    pub reason: String,
}

#[derive(Clone, Debug, Default)]
pub struct ResolvedTargets {
    pub backends: Vec<Backend>,
    /// A gated pod was admitted before its endpoint turned ready; requeue instead of waiting for a watch event
    pub potentially_ready: bool,
    pub skipped: Vec<SkippedEndpoint>,
}

/// One usable endpoint address for a Service port
#[derive(Clone, Debug)]
struct EndpointAddress {
    ip: String,
    node_name: Option<String>,
    target_port: i32,
}

pub struct EndpointResolver<'a> {
    svc: &'a Service,
    snapshot: &'a ClusterSnapshot,
    opts: &'a ReconcileOptions,
    vpc: &'a dyn VpcProvider,
    filter: NodeFilter,
    readiness_gate: String,
}

impl<'a> EndpointResolver<'a> {
    pub fn new(
        svc: &'a Service,
        snapshot: &'a ClusterSnapshot,
        opts: &'a ReconcileOptions,
        vpc: &'a dyn VpcProvider,
    ) -> Result<Self> {
        Ok(Self {
            svc,
            snapshot,
            opts,
            vpc,
            filter: NodeFilter::for_service(svc)?,
            readiness_gate: format!("{READINESS_GATE_PREFIX}{}", svc.name_any()),
        })
    }

    /// Backends for one Service port
    ///
    /// `ip_targets` registers pods by raw IP instead of resolving their ENI;
    /// `weight` selects the percentage algorithm.
    pub async fn resolve(
        &self,
        port: &ServicePortRef,
        policy: TrafficPolicy,
        ip_targets: bool,
        weight: Option<i32>,
    ) -> Result<ResolvedTargets> {
        let (addresses, potentially_ready) = self.endpoint_addresses(port);
        debug!(
            port = port.port,
            %policy,
            endpoints = addresses.len(),
            potentially_ready,
            "resolving backends"
        );

        if policy != TrafficPolicy::Eni && port.node_port == 0 {
            return Err(Error::ValidationError(format!(
                "service port {} has no node port, required by the {policy} traffic policy",
                port.port
            )));
        }

        let mut pod_targets = Vec::new();
        let mut backends = Vec::new();
        match policy {
            TrafficPolicy::Eni => pod_targets = addresses,
            TrafficPolicy::Local => {
                for addr in addresses {
                    let Some(node) = self.candidate_node(addr.node_name.as_deref()) else {
                        continue;
                    };
                    if policy::is_virtual_node(node) {
                        pod_targets.push(addr);
                    } else if let Some(id) = policy::instance_id(node) {
                        // one entry per pod, collapsed by the weight pass
                        backends.push(Backend::instance(id, port.node_port, 0));
                    } else {
                        warn!(node = %node.name_any(), "node has no provider id, skipping");
                    }
                }
            }
            TrafficPolicy::Cluster => {
                for node in &self.snapshot.nodes {
                    if !self.filter.is_candidate(node) || policy::is_virtual_node(node) {
                        continue;
                    }
                    match policy::instance_id(node) {
                        Some(id) => backends.push(Backend::instance(id, port.node_port, 0)),
                        None => warn!(node = %node.name_any(), "node has no provider id, skipping"),
                    }
                }
                pod_targets.extend(addresses.into_iter().filter(|addr| {
                    self.candidate_node(addr.node_name.as_deref())
                        .map(policy::is_virtual_node)
                        .unwrap_or(false)
                }));
            }
        }

        let mut skipped = Vec::new();
        if ip_targets {
            backends.extend(
                pod_targets
                    .iter()
                    .map(|a| Backend::ip(a.ip.clone(), a.target_port, 0)),
            );
        } else if !pod_targets.is_empty() {
            let (eni_backends, eni_skipped) = self.resolve_enis(&pod_targets).await?;
            backends.extend(eni_backends);
            skipped = eni_skipped;
        }

        Ok(ResolvedTargets {
            backends: weight::assign_weights(policy, backends, weight),
            potentially_ready,
            skipped,
        })
    }

    fn candidate_node(&self, name: Option<&str>) -> Option<&'a Node> {
        let name = name?;
        match self.snapshot.node(name) {
            Some(node) if self.filter.is_candidate(node) => Some(node),
            Some(_) => None,
            None => {
                warn!(node = name, "endpoint references unknown node");
                None
            }
        }
    }

    async fn resolve_enis(
        &self,
        targets: &[EndpointAddress],
    ) -> Result<(Vec<Backend>, Vec<SkippedEndpoint>)> {
        let ips: Vec<String> = targets.iter().map(|t| t.ip.clone()).collect();
        let enis = self.vpc.resolve_eni_ids(&self.opts.vpc_id, &ips).await?;

        let mut cidrs = None;
        let mut backends = Vec::with_capacity(targets.len());
        let mut skipped = Vec::new();
        for target in targets {
            if let Some(eni) = enis.get(&target.ip) {
                backends.push(Backend::eni(eni.clone(), target.ip.clone(), target.target_port, 0));
                continue;
            }
            if cidrs.is_none() {
                cidrs = Some(self.vpc.describe_vpc_cidrs(&self.opts.vpc_id).await?);
            }
            let in_vpc = match (target.ip.parse::<IpAddr>(), cidrs.as_deref()) {
                (Ok(ip), Some(nets)) => nets.iter().any(|n| n.contains(&ip)),
                _ => false,
            };
            if in_vpc {
                return Err(Error::cloud(
                    "EniNotFound",
                    format!("cannot find network interface for pod ip {}", target.ip),
                ));
            }
            skipped.push(SkippedEndpoint {
                ip: target.ip.clone(),
                reason: format!("ip {} is outside vpc {}", target.ip, self.opts.vpc_id),
            });
        }
        Ok((backends, skipped))
    }

    /// Ready addresses for `port`, plus whether a gated not-ready pod was admitted
    fn endpoint_addresses(&self, port: &ServicePortRef) -> (Vec<EndpointAddress>, bool) {
        let mut out = Vec::new();
        let mut potentially_ready = false;
        let mut seen = HashSet::new();

        let mut push = |addr: EndpointAddress, ready: bool, target: Option<&ObjectReference>| {
            if !self.opts.dual_stack_enabled && addr.ip.contains(':') {
                return;
            }
            if !ready {
                match self.gated_pod_state(target) {
                    GateState::NotGated | GateState::ContainersNotReady => return,
                    GateState::ContainersReady => potentially_ready = true,
                }
            }
            if seen.insert(addr.ip.clone()) {
                out.push(addr);
            }
        };

        if self.opts.endpoint_slice_enabled {
            for slice in &self.snapshot.endpoint_slices {
                match slice.address_type.as_str() {
                    "IPv4" => {}
                    "IPv6" if self.opts.dual_stack_enabled => {}
                    _ => continue,
                }
                let Some(target_port) = slice_port(slice, port) else {
                    continue;
                };
                for ep in &slice.endpoints {
                    let ready = ep
                        .conditions
                        .as_ref()
                        .and_then(|c| c.ready)
                        .unwrap_or(true);
                    for ip in &ep.addresses {
                        let addr = EndpointAddress {
                            ip: ip.clone(),
                            node_name: ep.node_name.clone(),
                            target_port,
                        };
                        push(addr, ready, ep.target_ref.as_ref());
                    }
                }
            }
        } else if let Some(endpoints) = &self.snapshot.endpoints {
            for subset in endpoints.subsets.iter().flatten() {
                let Some(target_port) = subset_port(subset.ports.as_deref(), port) else {
                    continue;
                };
                for (addresses, ready) in [(&subset.addresses, true), (&subset.not_ready_addresses, false)] {
                    for a in addresses.iter().flatten() {
                        let addr = EndpointAddress {
                            ip: a.ip.clone(),
                            node_name: a.node_name.clone(),
                            target_port,
                        };
                        push(addr, ready, a.target_ref.as_ref());
                    }
                }
            }
        }

        (out, potentially_ready)
    }

    fn gated_pod_state(&self, target: Option<&ObjectReference>) -> GateState {
        let pod = target
            .filter(|t| t.kind.as_deref().map(|k| k == "Pod").unwrap_or(true))
            .and_then(|t| {
                let ns = t
                    .namespace
                    .clone()
                    .or_else(|| self.svc.namespace())
                    .unwrap_or_default();
                self.snapshot.pod(&ns, t.name.as_deref()?)
            });
        let Some(pod) = pod else {
            return GateState::NotGated;
        };

        let has_gate = pod
            .spec
            .as_ref()
            .and_then(|s| s.readiness_gates.as_ref())
            .map(|gates| gates.iter().any(|g| g.condition_type == self.readiness_gate))
            .unwrap_or(false);
        if !has_gate {
            return GateState::NotGated;
        }

        let containers_ready = pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|cs| cs.iter().find(|c| c.type_ == "ContainersReady"))
            .map(|c| c.status == "True")
            .unwrap_or(false);
        if containers_ready {
            GateState::ContainersReady
        } else {
            GateState::ContainersNotReady
        }
    }
}

enum GateState {
    NotGated,
    ContainersNotReady,
    ContainersReady,
}

fn port_matches(endpoint_port_name: Option<&str>, total_ports: usize, port: &ServicePortRef) -> bool {
    let name = endpoint_port_name.unwrap_or_default();
    if port.name.is_empty() {
        total_ports == 1 || name.is_empty()
    } else {
        name == port.name
    }
}

fn subset_port(
    ports: Option<&[k8s_openapi::api::core::v1::EndpointPort]>,
    port: &ServicePortRef,
) -> Option<i32> {
    let ports = ports?;
    ports
        .iter()
        .find(|p| port_matches(p.name.as_deref(), ports.len(), port))
        .map(|p| p.port)
}

fn slice_port(slice: &EndpointSlice, port: &ServicePortRef) -> Option<i32> {
    let ports = slice.ports.as_deref()?;
    ports
        .iter()
        .find(|p| port_matches(p.name.as_deref(), ports.len(), port))
        .and_then(|p| p.port)
}
