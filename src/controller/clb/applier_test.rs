//! Tests for the CLB apply pipeline against the in-memory cloud

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::annotations::{self as ann, SERVICE_HASH_ANNOTATION};
    use crate::backend::ClusterSnapshot;
    use crate::config::ReconcileOptions;
    use crate::controller::context::RequestContext;
    use crate::controller::events::{
        MemoryRecorder, REASON_LISTENER_CHANGED, REASON_SKIP_SYNC_BACKENDS,
    };
    use crate::controller::hash::service_hash;
    use crate::error::Error;
    use crate::model::clb::{ClbAttributes, ClbProtocol};
    use crate::model::{
        Backend, ListenerStatus, NamedKey, NamespacedName, ServerGroup, TAG_KEY_OWNER,
    };
    use crate::provider::memory::MemoryCloud;
    use crate::retry::RetryConfig;
    use k8s_openapi::api::core::v1::{
        Node, NodeCondition, NodeSpec, NodeStatus, Service, ServicePort, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use std::sync::Arc;

    const CLUSTER: &str = "c-1";

    fn port(port: i32, node_port: i32) -> ServicePort {
        ServicePort {
            port,
            node_port: Some(node_port),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }
    }

    fn service(annotations: &[(&str, &str)], ports: Vec<ServicePort>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("7d3c-41aa".to_string()),
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

    fn node(name: &str) -> Node {
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

    struct Harness {
        cloud: Arc<MemoryCloud>,
        recorder: Arc<MemoryRecorder>,
        opts: Arc<ReconcileOptions>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                cloud: Arc::new(MemoryCloud::new()),
                recorder: Arc::new(MemoryRecorder::new()),
                opts: Arc::new(ReconcileOptions {
                    cluster_id: CLUSTER.to_string(),
                    vpc_id: "vpc-1".to_string(),
                    conflict_retry: RetryConfig::immediate(3),
                    ..Default::default()
                }),
            }
        }

        fn request(&self, svc: &Service) -> RequestContext {
            RequestContext::new(
                svc.clone(),
                ClusterSnapshot {
                    nodes: vec![node("a"), node("b")],
                    ..Default::default()
                },
                self.opts.clone(),
                self.cloud.clone(),
                self.recorder.clone(),
            )
        }

        async fn apply(&self, svc: &Service) -> crate::error::Result<crate::controller::context::ApplyOutcome> {
            apply(&self.request(svc)).await
        }
    }

    fn deleting(mut svc: Service) -> Service {
        svc.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        svc
    }

    #[tokio::test]
    async fn test_https_with_http_redirect() {
        let h = Harness::new();
        let svc = service(
            &[
                (ann::PROTOCOL_PORT, "http:80,https:443"),
                (ann::FORWARD_PORT, "80:443"),
                (ann::CERT_ID, "cert-1"),
            ],
            vec![port(80, 30080), port(443, 30443)],
        );
        let outcome = h.apply(&svc).await.unwrap();
        let lb = outcome.load_balancer_id.unwrap();

        let groups = h.cloud.vserver_groups(&lb).await;
        assert_eq!(groups.len(), 1);
        assert_eq!(
            groups[0].name,
            NamedKey::clb(&NamespacedName::new("default", "web"), CLUSTER, 443).key()
        );

        let listeners = h.cloud.clb_listeners(&lb).await;
        assert_eq!(listeners.len(), 2);
        let http = listeners.iter().find(|l| l.protocol == ClbProtocol::Http).unwrap();
        let https = listeners.iter().find(|l| l.protocol == ClbProtocol::Https).unwrap();
        assert_eq!(http.forward_port, Some(443));
        assert_eq!(https.vgroup_id, groups[0].id);
        assert!(listeners.iter().all(|l| l.status == ListenerStatus::Running));
    }

    #[tokio::test]
    async fn test_https_without_certificate_fails() {
        let h = Harness::new();
        let svc = service(&[(ann::PROTOCOL_PORT, "https:443")], vec![port(443, 30443)]);
        let err = h.apply(&svc).await.unwrap_err();
        assert!(err.to_string().contains("certificate"));
    }

    #[tokio::test]
    async fn test_reused_lb_with_user_group() {
        let h = Harness::new();
        let lb = h.cloud.insert_clb(ClbAttributes::default()).await;
        let mut user_backend = Backend::instance("i-user", 8080, 10);
        user_backend.description = "added by hand".to_string();
        let group = h
            .cloud
            .insert_vserver_group(
                &lb,
                ServerGroup {
                    name: "handmade".to_string(),
                    backends: vec![user_backend],
                    ..Default::default()
                },
            )
            .await;

        let vgroup = format!("{group}:80");
        let svc = service(
            &[
                (ann::LOADBALANCER_ID, lb.as_str()),
                (ann::VGROUP_PORT, vgroup.as_str()),
                (ann::WEIGHT, "60"),
            ],
            vec![port(80, 30080)],
        );
        h.apply(&svc).await.unwrap();

        assert_eq!(h.cloud.clb_count().await, 1);
        let groups = h.cloud.vserver_groups(&lb).await;
        assert_eq!(groups.len(), 1);
        let weights: Vec<(String, i32)> = groups[0]
            .backends
            .iter()
            .map(|b| (b.server_id.clone(), b.weight))
            .collect();
        assert!(weights.contains(&("i-user".to_string(), 10)));
        assert!(weights.contains(&("i-a".to_string(), 30)));
        assert!(weights.contains(&("i-b".to_string(), 30)));
        assert_eq!(h.cloud.clb_listeners(&lb).await[0].vgroup_id, group);
        assert!(h.cloud.clb(&lb).await.unwrap().tags.is_empty());
    }

    #[tokio::test]
    async fn test_delete_disables_protection_first() {
        let h = Harness::new();
        let svc = service(&[], vec![port(80, 30080)]);
        let lb = h.apply(&svc).await.unwrap().load_balancer_id.unwrap();
        h.cloud.clear_calls().await;

        let outcome = h.apply(&deleting(svc)).await.unwrap();
        assert!(outcome.released);
        assert!(h.cloud.clb(&lb).await.is_none());
        let ops: Vec<String> = h
            .cloud
            .mutating_calls()
            .await
            .into_iter()
            .map(|c| c.op)
            .collect();
        assert_eq!(ops, vec!["ModifyLoadBalancerAttribute", "DeleteLoadBalancer"]);
    }

    #[tokio::test]
    async fn test_preserve_on_delete_detaches() {
        let h = Harness::new();
        let svc = service(&[(ann::PRESERVE_LB_ON_DELETE, "true")], vec![port(80, 30080)]);
        let lb = h.apply(&svc).await.unwrap().load_balancer_id.unwrap();

        h.apply(&deleting(svc)).await.unwrap();
        let attrs = h.cloud.clb(&lb).await.unwrap();
        assert!(attrs.tags.iter().all(|t| t.key != TAG_KEY_OWNER));
        assert!(h.cloud.clb_listeners(&lb).await.is_empty());
        assert!(h.cloud.vserver_groups(&lb).await.is_empty());
    }

    #[tokio::test]
    async fn test_address_type_is_immutable() {
        let h = Harness::new();
        let svc = service(&[], vec![port(80, 30080)]);
        h.apply(&svc).await.unwrap();

        let changed = service(&[(ann::ADDRESS_TYPE, "intranet")], vec![port(80, 30080)]);
        let err = h.apply(&changed).await.unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_unchanged_hash_skips_listener_updates() {
        let h = Harness::new();
        let svc = service(&[(ann::SCHEDULER, "wlc")], vec![port(80, 30080)]);
        let lb = h.apply(&svc).await.unwrap().load_balancer_id.unwrap();

        let mut drifted = h.cloud.clb_listeners(&lb).await.remove(0);
        drifted.scheduler = Some("rr".to_string());
        h.cloud.insert_clb_listener(&lb, drifted).await;

        let mut stamped = svc.clone();
        let hash = service_hash(&svc).unwrap();
        stamped
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(SERVICE_HASH_ANNOTATION.to_string(), hash);
        h.cloud.clear_calls().await;
        h.apply(&stamped).await.unwrap();
        assert!(h.cloud.mutating_calls().await.is_empty());
        assert!(h
            .recorder
            .reasons()
            .await
            .contains(&REASON_SKIP_SYNC_BACKENDS.to_string()));

        h.apply(&svc).await.unwrap();
        let listener = h.cloud.clb_listeners(&lb).await.remove(0);
        assert_eq!(listener.scheduler.as_deref(), Some("wlc"));
        assert!(h
            .recorder
            .reasons()
            .await
            .contains(&REASON_LISTENER_CHANGED.to_string()));
    }
}
