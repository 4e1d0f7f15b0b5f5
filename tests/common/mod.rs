//! Shared fixtures for the end-to-end reconcile tests
//!
//! Every test drives `sync_service` against the in-memory cloud and inspects
//! the calls it recorded.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cloud_lb_controller::annotations as ann;
use cloud_lb_controller::backend::ClusterSnapshot;
use cloud_lb_controller::config::ReconcileOptions;
use cloud_lb_controller::controller::{sync_service, ApplyOutcome, MemoryRecorder, RequestContext};
use cloud_lb_controller::provider::memory::MemoryCloud;
use cloud_lb_controller::retry::RetryConfig;
use cloud_lb_controller::Result;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Node, NodeCondition, NodeSpec,
    NodeStatus, ObjectReference, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;

pub const CLUSTER: &str = "c-e2e";
pub const NAMESPACE: &str = "default";

pub fn port(port: i32, node_port: i32) -> ServicePort {
    ServicePort {
        port,
        node_port: Some(node_port),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// LoadBalancer Service `name` with annotations given by suffix
pub fn service(name: &str, annotations: &[(&str, &str)], ports: Vec<ServicePort>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some(format!("{name}-0f1e-4c2b")),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (ann::key(k), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn with_class(mut svc: Service, class: &str) -> Service {
    if let Some(spec) = svc.spec.as_mut() {
        spec.load_balancer_class = Some(class.to_string());
    }
    svc
}

pub fn with_local_policy(mut svc: Service) -> Service {
    if let Some(spec) = svc.spec.as_mut() {
        spec.external_traffic_policy = Some("Local".to_string());
    }
    svc
}

pub fn deleting(mut svc: Service) -> Service {
    svc.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    svc
}

pub fn node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            provider_id: Some(format!("cn-hangzhou.i-{name}")),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Pod endpoint `(ip, node)`
pub type Pod<'a> = (&'a str, &'a str);

fn address(ip: &str, node: &str) -> EndpointAddress {
    EndpointAddress {
        ip: ip.to_string(),
        node_name: Some(node.to_string()),
        target_ref: Some(ObjectReference {
            kind: Some("Pod".to_string()),
            name: Some(format!("pod-{}", ip.replace('.', "-"))),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn endpoints(name: &str, ready: &[Pod<'_>], not_ready: &[Pod<'_>]) -> Endpoints {
    let list = |pods: &[Pod<'_>]| {
        (!pods.is_empty()).then(|| pods.iter().map(|(ip, node)| address(ip, node)).collect())
    };
    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: list(ready),
            not_ready_addresses: list(not_ready),
            ports: Some(vec![EndpointPort {
                port: 8080,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
        }]),
    }
}

pub struct Harness {
    pub cloud: Arc<MemoryCloud>,
    pub recorder: Arc<MemoryRecorder>,
    pub opts: Arc<ReconcileOptions>,
    pub nodes: Vec<Node>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_cloud(MemoryCloud::new().with_job_polls(1))
    }

    pub fn with_cloud(cloud: MemoryCloud) -> Self {
        Self {
            cloud: Arc::new(cloud),
            recorder: Arc::new(MemoryRecorder::new()),
            opts: Arc::new(ReconcileOptions {
                cluster_id: CLUSTER.to_string(),
                vpc_id: "vpc-e2e".to_string(),
                job_poll_interval: Duration::from_millis(1),
                conflict_retry: RetryConfig::immediate(3),
                ..Default::default()
            }),
            nodes: vec![node("a"), node("b")],
        }
    }

    pub async fn apply(&self, svc: &Service) -> Result<ApplyOutcome> {
        self.apply_with(svc, None).await
    }

    pub async fn apply_with(&self, svc: &Service, endpoints: Option<Endpoints>) -> Result<ApplyOutcome> {
        let req = RequestContext::new(
            svc.clone(),
            ClusterSnapshot {
                nodes: self.nodes.clone(),
                endpoints,
                ..Default::default()
            },
            self.opts.clone(),
            self.cloud.clone(),
            self.recorder.clone(),
        );
        sync_service(&req).await
    }

    pub async fn mutating_ops(&self) -> Vec<String> {
        self.cloud
            .mutating_calls()
            .await
            .into_iter()
            .map(|c| c.op)
            .collect()
    }
}
