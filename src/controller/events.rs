//! Kubernetes events describing reconcile outcomes

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, ObjectMeta, PostParams},
    client::Client,
    Resource, ResourceExt,
};
use tokio::sync::Mutex;
use tracing::warn;

pub const REASON_ENSURED_LOAD_BALANCER: &str = "EnsuredLoadBalancer";
pub const REASON_SYNC_FAILED: &str = "SyncLoadBalancerFailed";
pub const REASON_DELETED_LOAD_BALANCER: &str = "DeletedLoadBalancer";
pub const REASON_UNAVAILABLE_BACKENDS: &str = "UnAvailableBackends";
pub const REASON_SKIP_SYNC_BACKENDS: &str = "SkipSyncBackends";
pub const REASON_LISTENER_CHANGED: &str = "ListenerChanged";
pub const REASON_SKIPPED_NON_VPC_ENDPOINT: &str = "SkippedNonVpcEndpoint";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

/// Sink for Service events
///
/// Recording never fails the reconcile; implementations log and move on.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, svc: &Service, type_: EventType, reason: &str, message: &str);
}

/// Writes `core/v1` Events through the API server
pub struct KubeEventRecorder {
    client: Client,
    component: String,
}

impl KubeEventRecorder {
    pub fn new(client: Client, component: impl Into<String>) -> Self {
        Self {
            client,
            component: component.into(),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, svc: &Service, type_: EventType, reason: &str, message: &str) {
        let namespace = svc.namespace().unwrap_or_else(|| "default".to_string());
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);

        let time = chrono::Utc::now();
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", svc.name_any())),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            type_: Some(type_.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: svc.object_ref(&()),
            source: Some(k8s_openapi::api::core::v1::EventSource {
                component: Some(self.component.clone()),
                ..Default::default()
            }),
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            ..Default::default()
        };

        if let Err(e) = events.create(&PostParams::default(), &event).await {
            warn!(
                service = %format!("{namespace}/{}", svc.name_any()),
                reason,
                "failed to record event: {e}"
            );
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub service: String,
    pub type_: EventType,
    pub reason: String,
    pub message: String,
}

/// Keeps events in memory; used by dry-run and tests
#[derive(Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().await.clone()
    }

    pub async fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .map(|e| e.reason.clone())
            .collect()
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn record(&self, svc: &Service, type_: EventType, reason: &str, message: &str) {
        tracing::info!(service = %svc.name_any(), %type_, reason, "{message}");
        self.events.lock().await.push(RecordedEvent {
            service: format!(
                "{}/{}",
                svc.namespace().unwrap_or_else(|| "default".to_string()),
                svc.name_any()
            ),
            type_,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}
