//! Apply a desired NLB model

use std::collections::{BTreeSet, HashSet};

use tracing::{info, instrument, warn};

use crate::diff::diff_tags;
use crate::error::{AggregateError, Error, Result};
use crate::model::nlb::{NlbAttributeUpdate, NlbAttributes, ZoneMapping};
use crate::model::{
    default_tags, AddressType, LoadBalancerAttributes, NlbModel, TAG_KEY_OWNER,
};
use crate::provider::ResourceType;
use crate::retry::retry_on_conflict;

use crate::controller::context::{ApplyOutcome, RequestContext};
use crate::controller::events::{EventType, REASON_SKIP_SYNC_BACKENDS};
use crate::controller::pipeline::{apply_children, Children};
use crate::controller::server_group::cleanup_groups;

use super::builder::build_local;
use super::fetcher::build_remote;
use super::listener::{NlbGroupOps, NlbListenerOps};
use super::wait_job;

/// Converge the Service's NLB on the desired state, or release it when the
/// Service no longer needs one
#[instrument(skip(req), fields(service = %req.name))]
pub async fn apply(req: &RequestContext) -> Result<ApplyOutcome> {
    let local = build_local(req).await?;
    let remote = match build_remote(req, &local.model).await {
        Ok(remote) => remote,
        Err(e) if e.is_not_found() && !req.needs_load_balancer() => {
            info!("annotated load balancer is gone, nothing to release");
            return Ok(released(None));
        }
        Err(e) => return Err(e),
    };

    if !req.needs_load_balancer() {
        return release(req, remote).await;
    }

    let existed = remote.exists();
    let remote = if existed {
        if !local.model.attributes.is_user_managed {
            update_attributes(req, &local.model.attributes, &remote.attributes).await?;
        }
        remote
    } else {
        if local.model.attributes.is_user_managed {
            return Err(Error::NotFound(format!(
                "load balancer {} from annotation",
                local.model.attributes.load_balancer_id
            )));
        }
        create(req, &local.model.attributes).await?;
        let remote = build_remote(req, &local.model).await?;
        if !remote.exists() {
            return Err(Error::NotFound(
                "load balancer not found after creation".to_string(),
            ));
        }
        remote
    };

    let lb_id = remote.attributes.load_balancer_id.clone();
    let reused_without_override =
        local.model.attributes.is_user_managed && !req.override_listeners();
    let skip_updates = (existed && !req.hash_changed()) || reused_without_override;
    if skip_updates {
        let message = if reused_without_override {
            format!("reused load balancer {lb_id} without listener override, skip updating listeners")
        } else {
            "service unchanged since last sync, skip updating listeners".to_string()
        };
        req.record(EventType::Normal, REASON_SKIP_SYNC_BACKENDS, &message)
            .await;
    }

    reconcile_children(req, &lb_id, &local.model, &remote, skip_updates).await?;

    Ok(ApplyOutcome {
        load_balancer_id: Some(lb_id),
        address: remote.attributes.dns_name.clone(),
        potentially_ready: local.potentially_ready,
        released: false,
    })
}

fn released(lb_id: Option<String>) -> ApplyOutcome {
    ApplyOutcome {
        load_balancer_id: lb_id,
        released: true,
        ..Default::default()
    }
}

async fn reconcile_children(
    req: &RequestContext,
    lb_id: &str,
    local: &NlbModel,
    remote: &NlbModel,
    skip_updates: bool,
) -> Result<()> {
    let tags = default_tags(&req.load_balancer_name(), req.cluster_id());
    let groups = NlbGroupOps { req, tags: &tags };
    let listeners = NlbListenerOps { req, lb_id };

    let errors = apply_children(
        req,
        &groups,
        &listeners,
        Children {
            remote_groups: &remote.server_groups,
            local_groups: &local.server_groups,
            remote_listeners: &remote.listeners,
            local_listeners: &local.listeners,
        },
        skip_updates,
    )
    .await;
    if !errors.is_empty() {
        warn!(lb_id, failures = errors.len(), "apply stage failed, cleanup deferred");
        return errors.into_result();
    }

    let in_use: HashSet<String> = req
        .provider
        .list_nlb_listeners(lb_id)
        .await?
        .into_iter()
        .map(|l| l.server_group_id)
        .filter(|id| !id.is_empty())
        .collect();
    cleanup_groups(
        &groups,
        &remote.server_groups,
        &local.server_groups,
        &in_use,
        &req.name,
        req.cluster_id(),
        req.opts.server_group_concurrency,
        &req.opts.conflict_retry,
    )
    .await
    .into_result()
}

fn zone_mappings(req: &RequestContext, local: &NlbAttributes) -> Result<Vec<ZoneMapping>> {
    if !local.zone_mappings.is_empty() {
        return Ok(local.zone_mappings.clone());
    }
    match (&req.opts.zone_id, &req.opts.vswitch_id) {
        (Some(zone_id), Some(vswitch_id)) => Ok(vec![ZoneMapping {
            zone_id: zone_id.clone(),
            vswitch_id: vswitch_id.clone(),
            allocation_id: None,
        }]),
        _ => Err(Error::ValidationError(
            "network load balancer needs at least one zone mapping".to_string(),
        )),
    }
}

async fn create(req: &RequestContext, local: &NlbAttributes) -> Result<String> {
    let mut attrs = local.clone();
    attrs.zone_mappings = zone_mappings(req, local)?;
    attrs.address_type.get_or_insert(AddressType::Internet);
    attrs.delete_protection.get_or_insert(true);
    attrs.modification_protection.get_or_insert(true);
    if attrs.vpc_id.is_none() && !req.opts.vpc_id.is_empty() {
        attrs.vpc_id = Some(req.opts.vpc_id.clone());
    }

    let id = retry_on_conflict(&req.opts.conflict_retry, "create load balancer", || {
        req.provider.create_nlb(&attrs)
    })
    .await?;
    info!(lb_id = %id, name = ?attrs.name, zones = attrs.zone_mappings.len(), "created load balancer");
    Ok(id)
}

fn zone_set(zones: &[ZoneMapping]) -> BTreeSet<(&str, &str)> {
    zones
        .iter()
        .map(|z| (z.zone_id.as_str(), z.vswitch_id.as_str()))
        .collect()
}

async fn update_attributes(
    req: &RequestContext,
    local: &NlbAttributes,
    remote: &NlbAttributes,
) -> Result<()> {
    let id = remote.load_balancer_id.as_str();
    if let (Some(wanted), Some(actual)) = (local.address_type, remote.address_type) {
        if wanted != actual {
            return Err(Error::ValidationError(format!(
                "address type of load balancer {id} cannot change from {actual} to {wanted}"
            )));
        }
    }
    if let (Some(wanted), Some(actual)) = (&local.address_ip_version, &remote.address_ip_version) {
        if !wanted.eq_ignore_ascii_case(actual) {
            return Err(Error::ValidationError(format!(
                "ip version of load balancer {id} cannot change from {actual} to {wanted}"
            )));
        }
    }

    let update = NlbAttributeUpdate {
        name: local.name.clone().filter(|n| remote.name.as_ref() != Some(n)),
        delete_protection: local
            .delete_protection
            .filter(|d| remote.delete_protection != Some(*d)),
        modification_protection: local
            .modification_protection
            .filter(|m| remote.modification_protection != Some(*m)),
        zone_mappings: (!local.zone_mappings.is_empty()
            && zone_set(&local.zone_mappings) != zone_set(&remote.zone_mappings))
        .then(|| local.zone_mappings.clone()),
    };
    if !update.is_empty() {
        info!(lb_id = %id, ?update, "updating load balancer attributes");
        let job = retry_on_conflict(&req.opts.conflict_retry, "update load balancer", || {
            req.provider.update_nlb(id, &update)
        })
        .await?;
        wait_job(&*req.provider, &job, &req.opts).await?;
    }

    let tags = diff_tags(remote.tags(), &local.tags);
    let mut errors = AggregateError::new();
    for batch in tags.tag_batches() {
        if let Err(e) = retry_on_conflict(&req.opts.conflict_retry, "tag load balancer", || {
            req.provider.tag_resource(ResourceType::Nlb, id, batch)
        })
        .await
        {
            errors.push(e);
        }
    }
    for batch in tags.untag_batches() {
        if let Err(e) = retry_on_conflict(&req.opts.conflict_retry, "untag load balancer", || {
            req.provider.untag_resource(ResourceType::Nlb, id, batch)
        })
        .await
        {
            errors.push(e);
        }
    }
    errors.into_result()
}

/// Detach from a reused or preserved NLB, otherwise delete it
///
/// Server groups are standalone resources, so they are removed before the
/// load balancer in every case.
async fn release(req: &RequestContext, remote: NlbModel) -> Result<ApplyOutcome> {
    let empty = NlbModel {
        namespaced_name: req.name.clone(),
        ..Default::default()
    };

    if !remote.exists() {
        if !remote.server_groups.is_empty() {
            info!("removing server groups left behind by a deleted load balancer");
            let tags = default_tags(&req.load_balancer_name(), req.cluster_id());
            cleanup_groups(
                &NlbGroupOps { req, tags: &tags },
                &remote.server_groups,
                &[],
                &HashSet::new(),
                &req.name,
                req.cluster_id(),
                req.opts.server_group_concurrency,
                &req.opts.conflict_retry,
            )
            .await
            .into_result()?;
        }
        return Ok(released(None));
    }

    let id = remote.attributes.load_balancer_id.clone();
    let retry = &req.opts.conflict_retry;
    reconcile_children(req, &id, &empty, &remote, true).await?;

    if remote.attributes.is_user_managed || remote.attributes.preserve_on_delete {
        info!(lb_id = %id, reused = remote.attributes.is_user_managed, "detached from load balancer");
        if !remote.attributes.is_user_managed {
            let owner = vec![TAG_KEY_OWNER.to_string()];
            retry_on_conflict(retry, "untag load balancer", || {
                req.provider.untag_resource(ResourceType::Nlb, &id, &owner)
            })
            .await?;
        }
        return Ok(released(Some(id)));
    }

    if remote.attributes.delete_protection == Some(true) {
        let update = NlbAttributeUpdate {
            delete_protection: Some(false),
            ..Default::default()
        };
        let job = retry_on_conflict(retry, "disable delete protection", || {
            req.provider.update_nlb(&id, &update)
        })
        .await?;
        wait_job(&*req.provider, &job, &req.opts).await?;
    }
    let job = retry_on_conflict(retry, "delete load balancer", || req.provider.delete_nlb(&id)).await?;
    wait_job(&*req.provider, &job, &req.opts).await?;
    info!(lb_id = %id, "deleted load balancer");
    Ok(released(Some(id)))
}
