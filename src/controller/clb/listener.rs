//! CLB listener strategies
//!
//! Each protocol validates its own required settings and decides which
//! attribute differences matter. Only attributes the Service sets are
//! compared, so values the cloud defaults never cause churn.

use async_trait::async_trait;
use std::fmt::Debug;
use tracing::info;

use crate::error::{Error, Result};
use crate::model::clb::{ClbListener, ClbProtocol};
use crate::model::{Backend, ListenerStatus, ServerGroup};
use crate::retry::retry_on_conflict;

use crate::controller::context::RequestContext;
use crate::controller::events::{EventType, REASON_LISTENER_CHANGED};
use crate::controller::executor::{BoundListener, ListenerOps};
use crate::controller::server_group::ServerGroupOps;

use super::MAX_BACKENDS_PER_CALL;

/// Scheduler the cloud applies when none is given
const DEFAULT_SCHEDULER: &str = "wrr";

pub trait ProtocolStrategy: Send + Sync {
    fn validate(&self, _listener: &ClbListener) -> Result<()> {
        Ok(())
    }

    /// Human-readable differences that require an update
    fn changes(&self, remote: &ClbListener, local: &ClbListener) -> Vec<String>;
}

struct TcpStrategy;
struct UdpStrategy;
struct HttpStrategy;
struct HttpsStrategy;

pub fn strategy_for(protocol: ClbProtocol) -> &'static dyn ProtocolStrategy {
    match protocol {
        ClbProtocol::Tcp => &TcpStrategy,
        ClbProtocol::Udp => &UdpStrategy,
        ClbProtocol::Http => &HttpStrategy,
        ClbProtocol::Https => &HttpsStrategy,
    }
}

fn compare<T: PartialEq + Debug>(out: &mut Vec<String>, name: &str, remote: &Option<T>, local: &Option<T>) {
    if let Some(wanted) = local {
        if remote.as_ref() != Some(wanted) {
            out.push(format!("{name} {remote:?} -> {wanted:?}"));
        }
    }
}

fn common_changes(remote: &ClbListener, local: &ClbListener) -> Vec<String> {
    let mut out = Vec::new();
    if !local.is_forwarding() && remote.vgroup_id != local.vgroup_id {
        out.push(format!("vserver group {} -> {}", remote.vgroup_id, local.vgroup_id));
    }
    if let Some(wanted) = &local.scheduler {
        let current = remote.scheduler.as_deref().unwrap_or(DEFAULT_SCHEDULER);
        if !current.eq_ignore_ascii_case(wanted) {
            out.push(format!("scheduler {current} -> {wanted}"));
        }
    }
    compare(&mut out, "bandwidth", &remote.bandwidth, &local.bandwidth);
    compare(&mut out, "acl status", &remote.acl_status, &local.acl_status);
    compare(&mut out, "acl id", &remote.acl_id, &local.acl_id);
    compare(&mut out, "acl type", &remote.acl_type, &local.acl_type);

    let (r, l) = (&remote.health_check, &local.health_check);
    compare(&mut out, "health check", &r.flag, &l.flag);
    compare(&mut out, "health check type", &r.check_type, &l.check_type);
    compare(&mut out, "health check port", &r.connect_port, &l.connect_port);
    compare(&mut out, "health check interval", &r.interval, &l.interval);
    compare(&mut out, "healthy threshold", &r.healthy_threshold, &l.healthy_threshold);
    compare(&mut out, "unhealthy threshold", &r.unhealthy_threshold, &l.unhealthy_threshold);
    out
}

fn layer4_changes(remote: &ClbListener, local: &ClbListener) -> Vec<String> {
    let mut out = common_changes(remote, local);
    let (r, l) = (&remote.health_check, &local.health_check);
    compare(&mut out, "health check connect timeout", &r.connect_timeout, &l.connect_timeout);
    compare(&mut out, "connection drain", &remote.connection_drain, &local.connection_drain);
    compare(
        &mut out,
        "connection drain timeout",
        &remote.connection_drain_timeout,
        &local.connection_drain_timeout,
    );
    out
}

fn layer7_changes(remote: &ClbListener, local: &ClbListener) -> Vec<String> {
    let mut out = common_changes(remote, local);
    let (r, l) = (&remote.health_check, &local.health_check);
    compare(&mut out, "health check uri", &r.uri, &l.uri);
    compare(&mut out, "health check domain", &r.domain, &l.domain);
    compare(&mut out, "health check http code", &r.http_code, &l.http_code);
    compare(&mut out, "health check timeout", &r.timeout, &l.timeout);
    compare(&mut out, "idle timeout", &remote.idle_timeout, &local.idle_timeout);
    compare(&mut out, "request timeout", &remote.request_timeout, &local.request_timeout);
    compare(
        &mut out,
        "x-forwarded-for proto",
        &remote.x_forwarded_for_proto,
        &local.x_forwarded_for_proto,
    );
    compare(&mut out, "sticky session", &remote.sticky_session, &local.sticky_session);
    compare(
        &mut out,
        "sticky session type",
        &remote.sticky_session_type,
        &local.sticky_session_type,
    );
    compare(&mut out, "cookie timeout", &remote.cookie_timeout, &local.cookie_timeout);
    compare(&mut out, "cookie", &remote.cookie, &local.cookie);
    out
}

impl ProtocolStrategy for TcpStrategy {
    fn changes(&self, remote: &ClbListener, local: &ClbListener) -> Vec<String> {
        let mut out = layer4_changes(remote, local);
        compare(
            &mut out,
            "persistence timeout",
            &remote.persistence_timeout,
            &local.persistence_timeout,
        );
        compare(
            &mut out,
            "established timeout",
            &remote.established_timeout,
            &local.established_timeout,
        );
        out
    }
}

impl ProtocolStrategy for UdpStrategy {
    fn changes(&self, remote: &ClbListener, local: &ClbListener) -> Vec<String> {
        let mut out = layer4_changes(remote, local);
        compare(
            &mut out,
            "persistence timeout",
            &remote.persistence_timeout,
            &local.persistence_timeout,
        );
        out
    }
}

impl ProtocolStrategy for HttpStrategy {
    fn validate(&self, listener: &ClbListener) -> Result<()> {
        if listener.sticky_session == Some(true) && listener.sticky_session_type.is_none() {
            return Err(Error::ValidationError(format!(
                "http listener {} enables sticky sessions without a sticky session type",
                listener.port
            )));
        }
        Ok(())
    }

    fn changes(&self, remote: &ClbListener, local: &ClbListener) -> Vec<String> {
        let mut out = if local.is_forwarding() {
            Vec::new()
        } else {
            layer7_changes(remote, local)
        };
        compare(&mut out, "forward port", &remote.forward_port, &local.forward_port);
        out
    }
}

impl ProtocolStrategy for HttpsStrategy {
    fn validate(&self, listener: &ClbListener) -> Result<()> {
        if listener.cert_id.is_none() {
            return Err(Error::ValidationError(format!(
                "https listener {} requires a server certificate id",
                listener.port
            )));
        }
        HttpStrategy.validate(listener)
    }

    fn changes(&self, remote: &ClbListener, local: &ClbListener) -> Vec<String> {
        let mut out = layer7_changes(remote, local);
        compare(&mut out, "certificate", &remote.cert_id, &local.cert_id);
        compare(&mut out, "ca certificate", &remote.ca_cert_id, &local.ca_cert_id);
        compare(
            &mut out,
            "tls cipher policy",
            &remote.tls_cipher_policy,
            &local.tls_cipher_policy,
        );
        out
    }
}

impl BoundListener for ClbListener {
    fn group_name(&self) -> Option<&str> {
        if self.is_forwarding() {
            None
        } else {
            Some(&self.vgroup_name)
        }
    }

    fn set_group_id(&mut self, id: &str) {
        self.vgroup_id = id.to_string();
    }

    fn forward_target(&self) -> Option<(i32, ClbProtocol)> {
        self.forward_port.map(|port| (port, ClbProtocol::Https))
    }
}

pub struct ClbListenerOps<'a> {
    pub req: &'a RequestContext,
    pub lb_id: &'a str,
}

impl ClbListenerOps<'_> {
    async fn start(&self, l: &ClbListener) -> Result<()> {
        retry_on_conflict(&self.req.opts.conflict_retry, "start listener", || {
            self.req.provider.start_clb_listener(self.lb_id, l.port, l.protocol)
        })
        .await
    }
}

#[async_trait]
impl ListenerOps<ClbListener> for ClbListenerOps<'_> {
    async fn create(&self, listener: &ClbListener) -> Result<()> {
        strategy_for(listener.protocol).validate(listener)?;
        info!(lb_id = %self.lb_id, port = listener.port, protocol = %listener.protocol, "creating listener");
        retry_on_conflict(&self.req.opts.conflict_retry, "create listener", || {
            self.req.provider.create_clb_listener(self.lb_id, listener)
        })
        .await?;
        self.start(listener).await
    }

    async fn update(&self, remote: &ClbListener, local: &ClbListener) -> Result<()> {
        let strategy = strategy_for(local.protocol);
        let changes = strategy.changes(remote, local);
        if !changes.is_empty() {
            strategy.validate(local)?;
            let detail = changes.join(", ");
            info!(lb_id = %self.lb_id, port = local.port, protocol = %local.protocol, %detail, "updating listener");

            let mut merged = local.clone();
            merged.description = remote.description.clone();
            retry_on_conflict(&self.req.opts.conflict_retry, "update listener", || {
                self.req.provider.update_clb_listener(self.lb_id, &merged)
            })
            .await?;
            self.req
                .record(
                    EventType::Normal,
                    REASON_LISTENER_CHANGED,
                    &format!("listener {}/{} changed: {detail}", local.protocol, local.port),
                )
                .await;
        }
        if remote.status == ListenerStatus::Stopped {
            self.start(local).await?;
        }
        Ok(())
    }

    async fn delete(&self, listener: &ClbListener) -> Result<()> {
        info!(lb_id = %self.lb_id, port = listener.port, protocol = %listener.protocol, "deleting listener");
        retry_on_conflict(&self.req.opts.conflict_retry, "delete listener", || {
            self.req
                .provider
                .delete_clb_listener(self.lb_id, listener.port, listener.protocol)
        })
        .await
    }
}

/// Virtual server groups of one CLB
pub struct ClbGroupOps<'a> {
    pub req: &'a RequestContext,
    pub lb_id: &'a str,
}

#[async_trait]
impl ServerGroupOps for ClbGroupOps<'_> {
    fn batch_size(&self) -> usize {
        MAX_BACKENDS_PER_CALL
    }

    async fn create_group(&self, group: &ServerGroup) -> Result<String> {
        self.req.provider.create_vserver_group(self.lb_id, &group.name).await
    }

    async fn add_backends(&self, group_id: &str, backends: &[Backend]) -> Result<()> {
        self.req.provider.add_vserver_group_backends(group_id, backends).await
    }

    async fn remove_backends(&self, group_id: &str, backends: &[Backend]) -> Result<()> {
        self.req.provider.remove_vserver_group_backends(group_id, backends).await
    }

    async fn update_backends(&self, group_id: &str, backends: &[Backend]) -> Result<()> {
        self.req.provider.update_vserver_group_backends(group_id, backends).await
    }

    async fn delete_group(&self, group_id: &str) -> Result<()> {
        self.req.provider.delete_vserver_group(group_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener(protocol: ClbProtocol) -> ClbListener {
        let mut l = ClbListener::new(443, protocol);
        l.vgroup_id = "rsp-1".into();
        l
    }

    #[test]
    fn test_unset_attributes_are_ignored() {
        let mut remote = listener(ClbProtocol::Tcp);
        remote.persistence_timeout = Some(30);
        remote.scheduler = Some("wlc".into());
        let local = listener(ClbProtocol::Tcp);
        assert!(strategy_for(ClbProtocol::Tcp).changes(&remote, &local).is_empty());
    }

    #[test]
    fn test_default_scheduler_is_not_a_change() {
        let remote = listener(ClbProtocol::Udp);
        let mut local = listener(ClbProtocol::Udp);
        local.scheduler = Some("wrr".into());
        assert!(strategy_for(ClbProtocol::Udp).changes(&remote, &local).is_empty());
        local.scheduler = Some("wlc".into());
        assert_eq!(strategy_for(ClbProtocol::Udp).changes(&remote, &local).len(), 1);
    }

    #[test]
    fn test_group_rebinding_is_a_change() {
        let remote = listener(ClbProtocol::Http);
        let mut local = listener(ClbProtocol::Http);
        local.vgroup_id = "rsp-2".into();
        let changes = strategy_for(ClbProtocol::Http).changes(&remote, &local);
        assert_eq!(changes, vec!["vserver group rsp-1 -> rsp-2".to_string()]);
    }

    #[test]
    fn test_https_requires_certificate() {
        let mut l = listener(ClbProtocol::Https);
        assert!(strategy_for(ClbProtocol::Https).validate(&l).is_err());
        l.cert_id = Some("cert-1".into());
        assert!(strategy_for(ClbProtocol::Https).validate(&l).is_ok());

        let mut remote = l.clone();
        remote.cert_id = Some("cert-0".into());
        assert_eq!(strategy_for(ClbProtocol::Https).changes(&remote, &l).len(), 1);
    }

    #[test]
    fn test_forwarding_listener_binds_no_group() {
        let mut l = listener(ClbProtocol::Http);
        l.forward_port = Some(443);
        assert_eq!(l.group_name(), None);
        assert_eq!(l.forward_target(), Some((443, ClbProtocol::Https)));
        assert!(strategy_for(ClbProtocol::Http).changes(&l.clone(), &l).is_empty());
    }
}
