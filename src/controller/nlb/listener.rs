//! NLB listener and server group calls

use async_trait::async_trait;
use std::fmt::Debug;
use tracing::info;

use crate::error::{Error, Result};
use crate::model::nlb::{NlbListener, NlbProtocol};
use crate::model::{Backend, PortSpec, ServerGroup, ServerGroupAttributes, Tag};
use crate::retry::retry_on_conflict;

use crate::controller::context::RequestContext;
use crate::controller::events::{EventType, REASON_LISTENER_CHANGED};
use crate::controller::executor::{BoundListener, ListenerOps};
use crate::controller::server_group::ServerGroupOps;

use super::{wait_job, MAX_SERVERS_PER_CALL};

fn validate(listener: &NlbListener) -> Result<()> {
    if listener.protocol == NlbProtocol::TcpSsl && listener.certificate_ids.is_empty() {
        return Err(Error::ValidationError(format!(
            "tcpssl listener {} requires a server certificate id",
            listener.port
        )));
    }
    if listener.protocol != NlbProtocol::TcpSsl && !listener.certificate_ids.is_empty() {
        return Err(Error::ValidationError(format!(
            "{} listener {} cannot carry certificates",
            listener.protocol, listener.port
        )));
    }
    Ok(())
}

fn compare<T: PartialEq + Debug>(out: &mut Vec<String>, name: &str, remote: &Option<T>, local: &Option<T>) {
    if let Some(wanted) = local {
        if remote.as_ref() != Some(wanted) {
            out.push(format!("{name} {remote:?} -> {wanted:?}"));
        }
    }
}

/// Differences that require an update; attributes the Service leaves unset are ignored
pub fn listener_changes(remote: &NlbListener, local: &NlbListener) -> Vec<String> {
    let mut out = Vec::new();
    if remote.server_group_id != local.server_group_id {
        out.push(format!(
            "server group {} -> {}",
            remote.server_group_id, local.server_group_id
        ));
    }
    compare(&mut out, "idle timeout", &remote.idle_timeout, &local.idle_timeout);
    if !local.certificate_ids.is_empty() && remote.certificate_ids != local.certificate_ids {
        out.push(format!(
            "certificates {:?} -> {:?}",
            remote.certificate_ids, local.certificate_ids
        ));
    }
    if !local.ca_certificate_ids.is_empty() && remote.ca_certificate_ids != local.ca_certificate_ids {
        out.push(format!(
            "ca certificates {:?} -> {:?}",
            remote.ca_certificate_ids, local.ca_certificate_ids
        ));
    }
    compare(&mut out, "ca", &remote.ca_enabled, &local.ca_enabled);
    compare(
        &mut out,
        "security policy",
        &remote.security_policy_id,
        &local.security_policy_id,
    );
    compare(
        &mut out,
        "proxy protocol",
        &remote.proxy_protocol_enabled,
        &local.proxy_protocol_enabled,
    );
    compare(&mut out, "cps", &remote.cps, &local.cps);
    out
}

/// Remote group attributes with every value the Service sets laid over them,
/// or `None` when nothing differs
pub fn merged_group_attributes(
    remote: &ServerGroupAttributes,
    local: &ServerGroupAttributes,
) -> Option<ServerGroupAttributes> {
    fn overlay<T: Clone + PartialEq>(target: &mut Option<T>, wanted: &Option<T>, changed: &mut bool) {
        if let Some(w) = wanted {
            if target.as_ref() != Some(w) {
                *target = Some(w.clone());
                *changed = true;
            }
        }
    }

    let mut merged = remote.clone();
    let mut changed = false;
    overlay(&mut merged.scheduler, &local.scheduler, &mut changed);
    overlay(
        &mut merged.connection_drain_enabled,
        &local.connection_drain_enabled,
        &mut changed,
    );
    overlay(
        &mut merged.connection_drain_timeout,
        &local.connection_drain_timeout,
        &mut changed,
    );
    overlay(&mut merged.preserve_client_ip, &local.preserve_client_ip, &mut changed);

    let (hc, wanted) = (&mut merged.health_check, &local.health_check);
    overlay(&mut hc.enabled, &wanted.enabled, &mut changed);
    overlay(&mut hc.check_type, &wanted.check_type, &mut changed);
    overlay(&mut hc.connect_port, &wanted.connect_port, &mut changed);
    overlay(&mut hc.connect_timeout, &wanted.connect_timeout, &mut changed);
    overlay(&mut hc.interval, &wanted.interval, &mut changed);
    overlay(&mut hc.healthy_threshold, &wanted.healthy_threshold, &mut changed);
    overlay(&mut hc.unhealthy_threshold, &wanted.unhealthy_threshold, &mut changed);
    overlay(&mut hc.uri, &wanted.uri, &mut changed);
    overlay(&mut hc.domain, &wanted.domain, &mut changed);

    changed.then_some(merged)
}

impl BoundListener for NlbListener {
    fn group_name(&self) -> Option<&str> {
        Some(&self.server_group_name)
    }

    fn set_group_id(&mut self, id: &str) {
        self.server_group_id = id.to_string();
    }

    fn forward_target(&self) -> Option<(PortSpec, NlbProtocol)> {
        None
    }
}

pub struct NlbListenerOps<'a> {
    pub req: &'a RequestContext,
    pub lb_id: &'a str,
}

#[async_trait]
impl ListenerOps<NlbListener> for NlbListenerOps<'_> {
    async fn create(&self, listener: &NlbListener) -> Result<()> {
        validate(listener)?;
        info!(lb_id = %self.lb_id, port = %listener.port, protocol = %listener.protocol, "creating listener");
        let job = retry_on_conflict(&self.req.opts.conflict_retry, "create listener", || {
            self.req.provider.create_nlb_listener(self.lb_id, listener)
        })
        .await?;
        wait_job(&*self.req.provider, &job, &self.req.opts).await
    }

    async fn update(&self, remote: &NlbListener, local: &NlbListener) -> Result<()> {
        let changes = listener_changes(remote, local);
        if changes.is_empty() {
            return Ok(());
        }
        validate(local)?;
        let detail = changes.join(", ");
        info!(lb_id = %self.lb_id, listener_id = %remote.listener_id, %detail, "updating listener");

        let mut merged = local.clone();
        merged.listener_id = remote.listener_id.clone();
        merged.description = remote.description.clone();
        let job = retry_on_conflict(&self.req.opts.conflict_retry, "update listener", || {
            self.req.provider.update_nlb_listener(&merged)
        })
        .await?;
        wait_job(&*self.req.provider, &job, &self.req.opts).await?;
        self.req
            .record(
                EventType::Normal,
                REASON_LISTENER_CHANGED,
                &format!("listener {}/{} changed: {detail}", local.protocol, local.port),
            )
            .await;
        Ok(())
    }

    async fn delete(&self, listener: &NlbListener) -> Result<()> {
        info!(lb_id = %self.lb_id, listener_id = %listener.listener_id, port = %listener.port, "deleting listener");
        let job = retry_on_conflict(&self.req.opts.conflict_retry, "delete listener", || {
            self.req.provider.delete_nlb_listener(&listener.listener_id)
        })
        .await?;
        wait_job(&*self.req.provider, &job, &self.req.opts).await
    }
}

/// Server groups of one Service, tagged with its ownership tags on creation
pub struct NlbGroupOps<'a> {
    pub req: &'a RequestContext,
    pub tags: &'a [Tag],
}

impl NlbGroupOps<'_> {
    async fn wait(&self, job: String) -> Result<()> {
        wait_job(&*self.req.provider, &job, &self.req.opts).await
    }
}

#[async_trait]
impl ServerGroupOps for NlbGroupOps<'_> {
    fn batch_size(&self) -> usize {
        MAX_SERVERS_PER_CALL
    }

    async fn create_group(&self, group: &ServerGroup) -> Result<String> {
        self.req
            .provider
            .create_nlb_server_group(group, &self.req.opts.vpc_id, self.tags)
            .await
    }

    async fn update_attributes(&self, remote: &ServerGroup, local: &ServerGroup) -> Result<()> {
        if local.is_user_managed {
            return Ok(());
        }
        let Some(merged) = merged_group_attributes(&remote.attributes, &local.attributes) else {
            return Ok(());
        };
        info!(group = %local.name, id = %remote.id, "updating server group attributes");
        let job = self.req.provider.update_nlb_server_group(&remote.id, &merged).await?;
        self.wait(job).await
    }

    async fn add_backends(&self, group_id: &str, backends: &[Backend]) -> Result<()> {
        let job = self.req.provider.add_nlb_servers(group_id, backends).await?;
        self.wait(job).await
    }

    async fn remove_backends(&self, group_id: &str, backends: &[Backend]) -> Result<()> {
        let job = self.req.provider.remove_nlb_servers(group_id, backends).await?;
        self.wait(job).await
    }

    async fn update_backends(&self, group_id: &str, backends: &[Backend]) -> Result<()> {
        let job = self.req.provider.update_nlb_servers(group_id, backends).await?;
        self.wait(job).await
    }

    async fn delete_group(&self, group_id: &str) -> Result<()> {
        let job = self.req.provider.delete_nlb_server_group(group_id).await?;
        self.wait(job).await
    }
}
