//! Unit tests for the reconciler helpers
//!
//! These cover the decisions made around the pipeline: status, requeue and
//! snapshot selection. The pipeline itself is tested per variant.

#[cfg(test)]
mod tests {
    use super::super::context::{ApplyOutcome, NLB_CLASS};
    use super::super::reconciler::{
        desired_ingress, next_action, retry_delay, selector_string,
    };
    use crate::config::ReconcileOptions;
    use crate::error::Error;
    use k8s_openapi::api::core::v1::{Service, ServiceSpec};
    use kube::runtime::controller::Action;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn service(class: Option<&str>, selector: &[(&str, &str)]) -> Service {
        Service {
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                load_balancer_class: class.map(str::to_string),
                selector: Some(
                    selector
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn outcome(address: Option<&str>, potentially_ready: bool) -> ApplyOutcome {
        ApplyOutcome {
            load_balancer_id: Some("lb-1".to_string()),
            address: address.map(str::to_string),
            potentially_ready,
            released: false,
        }
    }

    #[test]
    fn test_clb_publishes_ip() {
        let ingress = desired_ingress(&service(None, &[]), &outcome(Some("47.100.0.1"), false));
        assert_eq!(ingress.len(), 1);
        assert_eq!(ingress[0].ip.as_deref(), Some("47.100.0.1"));
        assert!(ingress[0].hostname.is_none());
    }

    #[test]
    fn test_nlb_publishes_hostname() {
        let ingress = desired_ingress(
            &service(Some(NLB_CLASS), &[]),
            &outcome(Some("nlb-1.cn-hangzhou.nlb.aliyuncs.com"), false),
        );
        assert_eq!(
            ingress[0].hostname.as_deref(),
            Some("nlb-1.cn-hangzhou.nlb.aliyuncs.com")
        );
        assert!(ingress[0].ip.is_none());
    }

    #[test]
    fn test_no_address_clears_ingress() {
        assert!(desired_ingress(&service(None, &[]), &outcome(None, false)).is_empty());
    }

    #[test]
    fn test_potentially_ready_requeues() {
        let opts = ReconcileOptions {
            requeue_delay: Duration::from_secs(7),
            ..Default::default()
        };
        assert_eq!(
            next_action(&outcome(None, true), &opts),
            Action::requeue(Duration::from_secs(7))
        );
        assert_eq!(next_action(&outcome(None, false), &opts), Action::await_change());
    }

    #[test]
    fn test_retry_delay_by_error_kind() {
        assert_eq!(
            retry_delay(&Error::Conflict("lb busy".into())),
            Duration::from_secs(15)
        );
        assert_eq!(
            retry_delay(&Error::ValidationError("bad port".into())),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_selector_string_is_sorted() {
        let svc = service(None, &[("tier", "web"), ("app", "shop")]);
        assert_eq!(selector_string(&svc).as_deref(), Some("app=shop,tier=web"));
        assert!(selector_string(&service(None, &[])).is_none());
    }
}
