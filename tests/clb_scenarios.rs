//! End-to-end CLB reconciles against the in-memory cloud
//!
//! Run with: cargo test --test clb_scenarios

mod common;

use cloud_lb_controller::annotations as ann;
use cloud_lb_controller::controller::events::REASON_SKIP_SYNC_BACKENDS;
use cloud_lb_controller::model::clb::{ClbAttributes, ClbListener, ClbProtocol};
use cloud_lb_controller::model::{Backend, NamedKey, NamespacedName, ServerGroup, Tag, TAG_KEY_OWNER};
use cloud_lb_controller::Error;
use common::*;

fn web() -> NamespacedName {
    NamespacedName::new(NAMESPACE, "web")
}

/// New Service, Cluster policy, two ready endpoints on two nodes
#[tokio::test]
async fn test_new_service_creates_one_of_each() {
    let h = Harness::new();
    let svc = service("web", &[], vec![port(80, 30080)]);
    let eps = endpoints("web", &[("10.0.1.1", "a"), ("10.0.2.1", "b")], &[]);

    let outcome = h.apply_with(&svc, Some(eps)).await.unwrap();
    let lb = outcome.load_balancer_id.unwrap();
    assert!(outcome.address.is_some());
    assert_eq!(h.cloud.clb_count().await, 1);

    let groups = h.cloud.vserver_groups(&lb).await;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].name, NamedKey::clb(&web(), CLUSTER, 80).key());
    let mut servers: Vec<&str> = groups[0].backends.iter().map(|b| b.server_id.as_str()).collect();
    servers.sort();
    assert_eq!(servers, vec!["i-a", "i-b"]);
    assert!(groups[0].backends.iter().all(|b| b.weight == 100 && b.port == 30080));

    let listeners = h.cloud.clb_listeners(&lb).await;
    assert_eq!(listeners.len(), 1);
    assert_eq!(listeners[0].protocol, ClbProtocol::Tcp);
    assert_eq!(listeners[0].port, 80);
    assert_eq!(listeners[0].vgroup_id, groups[0].id);
}

/// One endpoint turns not-ready under the Local policy
#[tokio::test]
async fn test_not_ready_endpoint_removes_exactly_one_backend() {
    let h = Harness::new();
    let svc = with_local_policy(service("web", &[], vec![port(80, 30080)]));
    let both = endpoints("web", &[("10.0.1.1", "a"), ("10.0.2.1", "b")], &[]);
    let lb = h
        .apply_with(&svc, Some(both))
        .await
        .unwrap()
        .load_balancer_id
        .unwrap();
    assert_eq!(h.cloud.vserver_groups(&lb).await[0].backends.len(), 2);
    h.cloud.clear_calls().await;

    let one = endpoints("web", &[("10.0.1.1", "a")], &[("10.0.2.1", "b")]);
    h.apply_with(&svc, Some(one)).await.unwrap();

    assert_eq!(h.mutating_ops().await, vec!["RemoveVServerGroupBackendServers"]);
    let group = h.cloud.vserver_groups(&lb).await.remove(0);
    assert_eq!(group.backends.len(), 1);
    assert_eq!(group.backends[0].server_id, "i-a");
}

/// Reusing a load balancer the controller created for another Service
#[tokio::test]
async fn test_reuse_of_foreign_owned_lb_is_rejected() {
    let h = Harness::new();
    let lb = h
        .cloud
        .insert_clb(ClbAttributes {
            address: Some("47.100.9.9".to_string()),
            tags: vec![Tag::new(TAG_KEY_OWNER, "a0123456789abcdef")],
            ..Default::default()
        })
        .await;

    let svc = service("web", &[(ann::LOADBALANCER_ID, lb.as_str())], vec![port(80, 30080)]);
    let err = h.apply(&svc).await.unwrap_err();

    assert!(matches!(err, Error::ReuseRejected(_)), "{err}");
    assert!(h.mutating_ops().await.is_empty());
}

#[tokio::test]
async fn test_second_apply_issues_no_writes() {
    let h = Harness::new();
    let svc = service(
        "web",
        &[
            (ann::SCHEDULER, "wrr"),
            (ann::PERSISTENCE_TIMEOUT, "300"),
            (ann::ADDITIONAL_TAGS, "team=edge,env=prod"),
        ],
        vec![port(80, 30080), port(443, 30443)],
    );
    let eps = endpoints("web", &[("10.0.1.1", "a")], &[]);
    h.apply_with(&svc, Some(eps.clone())).await.unwrap();
    h.cloud.clear_calls().await;

    h.apply_with(&svc, Some(eps)).await.unwrap();
    assert!(h.mutating_ops().await.is_empty());
}

#[tokio::test]
async fn test_foreign_resources_on_reused_lb_are_untouched() {
    let h = Harness::new();
    let lb = h.cloud.insert_clb(ClbAttributes::default()).await;
    let other = NamespacedName::new(NAMESPACE, "other");
    let foreign_group = h
        .cloud
        .insert_vserver_group(
            &lb,
            ServerGroup {
                name: NamedKey::clb(&other, CLUSTER, 8080).key(),
                backends: vec![Backend::instance("i-z", 31000, 100)],
                ..Default::default()
            },
        )
        .await;
    let mut foreign_listener = ClbListener::new(8080, ClbProtocol::Tcp);
    foreign_listener.description = NamedKey::clb(&other, CLUSTER, 8080).key();
    foreign_listener.vgroup_id = foreign_group.clone();
    h.cloud.insert_clb_listener(&lb, foreign_listener).await;

    let svc = service(
        "web",
        &[(ann::LOADBALANCER_ID, lb.as_str()), (ann::OVERRIDE_LISTENERS, "true")],
        vec![port(80, 30080)],
    );
    h.apply(&svc).await.unwrap();

    let groups = h.cloud.vserver_groups(&lb).await;
    assert_eq!(groups.len(), 2);
    let kept = groups.iter().find(|g| g.id == foreign_group).unwrap();
    assert_eq!(kept.backends.len(), 1);
    assert_eq!(kept.backends[0].server_id, "i-z");
    assert_eq!(h.cloud.clb_listeners(&lb).await.len(), 2);

    h.apply(&deleting(svc)).await.unwrap();
    let groups = h.cloud.vserver_groups(&lb).await;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].id, foreign_group);
    let listeners = h.cloud.clb_listeners(&lb).await;
    assert_eq!(listeners.len(), 1);
    assert_eq!(listeners[0].port, 8080);
    assert!(h.cloud.clb(&lb).await.is_some());
}

#[tokio::test]
async fn test_preserved_lb_is_detached_not_deleted() {
    let h = Harness::new();
    let svc = service("web", &[(ann::PRESERVE_LB_ON_DELETE, "on")], vec![port(80, 30080)]);
    let lb = h.apply(&svc).await.unwrap().load_balancer_id.unwrap();

    let outcome = h.apply(&deleting(svc)).await.unwrap();
    assert!(outcome.released);

    let attrs = h.cloud.clb(&lb).await.unwrap();
    assert!(attrs.tags.iter().all(|t| t.key != TAG_KEY_OWNER));
    assert!(h.cloud.clb_listeners(&lb).await.is_empty());
    assert!(h.cloud.vserver_groups(&lb).await.is_empty());
}

#[tokio::test]
async fn test_conflicts_are_retried() {
    let h = Harness::new();
    h.cloud.inject_conflicts("CreateLoadBalancerListener", 2).await;
    let svc = service("web", &[], vec![port(80, 30080)]);
    let lb = h.apply(&svc).await.unwrap().load_balancer_id.unwrap();

    let attempts = h
        .mutating_ops()
        .await
        .iter()
        .filter(|op| op.as_str() == "CreateLoadBalancerListener")
        .count();
    assert_eq!(attempts, 3);
    assert_eq!(h.cloud.clb_listeners(&lb).await.len(), 1);
}

#[tokio::test]
async fn test_type_change_releases_lb() {
    let h = Harness::new();
    let svc = service("web", &[], vec![port(80, 30080)]);
    let lb = h.apply(&svc).await.unwrap().load_balancer_id.unwrap();

    let mut cluster_ip = svc.clone();
    if let Some(spec) = cluster_ip.spec.as_mut() {
        spec.type_ = Some("ClusterIP".to_string());
    }
    let outcome = h.apply(&cluster_ip).await.unwrap();
    assert!(outcome.released);
    assert!(h.cloud.clb(&lb).await.is_none());
}

#[tokio::test]
async fn test_reused_lb_without_override_records_skipped_sync() {
    let h = Harness::new();
    let lb = h.cloud.insert_clb(ClbAttributes::default()).await;
    let svc = service("web", &[(ann::LOADBALANCER_ID, lb.as_str())], vec![port(80, 30080)]);

    h.apply(&svc).await.unwrap();
    assert_eq!(h.cloud.clb_listeners(&lb).await.len(), 1);
    assert!(h
        .recorder
        .reasons()
        .await
        .contains(&REASON_SKIP_SYNC_BACKENDS.to_string()));
}

#[tokio::test]
async fn test_failed_add_batch_still_removes_stale_backends() {
    let h = Harness::new();
    let svc = with_local_policy(service("web", &[], vec![port(80, 30080)]));
    let on_a = endpoints("web", &[("10.0.1.1", "a")], &[]);
    let lb = h
        .apply_with(&svc, Some(on_a))
        .await
        .unwrap()
        .load_balancer_id
        .unwrap();

    h.cloud
        .fail_next("AddVServerGroupBackendServers", "Throttling", "request was denied")
        .await;
    let on_b = endpoints("web", &[("10.0.2.1", "b")], &[]);
    let err = h.apply_with(&svc, Some(on_b.clone())).await.unwrap_err();
    assert!(err.to_string().contains("Throttling"), "{err}");

    let group = h.cloud.vserver_groups(&lb).await.remove(0);
    assert!(group.backends.iter().all(|b| b.server_id != "i-a"));

    h.apply_with(&svc, Some(on_b)).await.unwrap();
    let group = h.cloud.vserver_groups(&lb).await.remove(0);
    assert_eq!(group.backends.len(), 1);
    assert_eq!(group.backends[0].server_id, "i-b");
}
