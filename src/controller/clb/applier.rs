//! Apply a desired CLB model

use std::collections::HashSet;

use tracing::{info, instrument, warn};

use crate::diff::diff_tags;
use crate::error::{AggregateError, Error, Result};
use crate::model::clb::{
    ClbAttributeUpdate, ClbAttributes, DEFAULT_CHARGE_TYPE, DEFAULT_CLB_SPEC,
    DEFAULT_MODIFICATION_PROTECTION,
};
use crate::model::{AddressType, ClbModel, LoadBalancerAttributes, TAG_KEY_OWNER};
use crate::provider::ResourceType;
use crate::retry::retry_on_conflict;

use crate::controller::context::{ApplyOutcome, RequestContext};
use crate::controller::events::{EventType, REASON_SKIP_SYNC_BACKENDS};
use crate::controller::pipeline::{apply_children, Children};
use crate::controller::server_group::cleanup_groups;

use super::builder::build_local;
use super::fetcher::build_remote;
use super::listener::{ClbGroupOps, ClbListenerOps};

/// Converge the Service's CLB on the desired state, or release it when the
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
        return release(req, &local.model, remote).await;
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
        address: remote.attributes.address.clone(),
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

/// Groups and listeners, then cleanup of what the Service no longer needs
async fn reconcile_children(
    req: &RequestContext,
    lb_id: &str,
    local: &ClbModel,
    remote: &ClbModel,
    skip_updates: bool,
) -> Result<()> {
    let groups = ClbGroupOps { req, lb_id };
    let listeners = ClbListenerOps { req, lb_id };

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
        .describe_clb_listeners(lb_id)
        .await?
        .into_iter()
        .map(|l| l.vgroup_id)
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

/// Create the CLB with provider defaults for everything the Service leaves unset
async fn create(req: &RequestContext, local: &ClbAttributes) -> Result<String> {
    let mut attrs = local.clone();
    attrs.address_type.get_or_insert(AddressType::Internet);
    attrs.spec.get_or_insert_with(|| DEFAULT_CLB_SPEC.to_string());
    attrs.charge_type.get_or_insert_with(|| DEFAULT_CHARGE_TYPE.to_string());
    attrs.delete_protection.get_or_insert(true);
    attrs
        .modification_protection
        .get_or_insert_with(|| DEFAULT_MODIFICATION_PROTECTION.to_string());
    if attrs.vswitch_id.is_none() && attrs.address_type == Some(AddressType::Intranet) {
        attrs.vswitch_id = req.opts.vswitch_id.clone();
    }

    let id = retry_on_conflict(&req.opts.conflict_retry, "create load balancer", || {
        req.provider.create_clb(&attrs)
    })
    .await?;
    info!(lb_id = %id, name = ?attrs.name, "created load balancer");
    Ok(id)
}

/// Mutable attributes and tags of a controller-created CLB
async fn update_attributes(
    req: &RequestContext,
    local: &ClbAttributes,
    remote: &ClbAttributes,
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

    let changed = |wanted: &Option<String>, actual: &Option<String>| match wanted {
        Some(w) if actual.as_ref() != Some(w) => Some(w.clone()),
        _ => None,
    };
    let update = ClbAttributeUpdate {
        name: changed(&local.name, &remote.name),
        spec: changed(&local.spec, &remote.spec),
        charge_type: changed(&local.charge_type, &remote.charge_type),
        bandwidth: local.bandwidth.filter(|b| remote.bandwidth != Some(*b)),
        delete_protection: local
            .delete_protection
            .filter(|d| remote.delete_protection != Some(*d)),
        modification_protection: changed(
            &local.modification_protection,
            &remote.modification_protection,
        ),
    };
    if !update.is_empty() {
        info!(lb_id = %id, ?update, "updating load balancer attributes");
        retry_on_conflict(&req.opts.conflict_retry, "update load balancer", || {
            req.provider.update_clb(id, &update)
        })
        .await?;
    }

    let tags = diff_tags(remote.tags(), &local.tags);
    let mut errors = AggregateError::new();
    for batch in tags.tag_batches() {
        if let Err(e) = retry_on_conflict(&req.opts.conflict_retry, "tag load balancer", || {
            req.provider.tag_resource(ResourceType::Clb, id, batch)
        })
        .await
        {
            errors.push(e);
        }
    }
    for batch in tags.untag_batches() {
        if let Err(e) = retry_on_conflict(&req.opts.conflict_retry, "untag load balancer", || {
            req.provider.untag_resource(ResourceType::Clb, id, batch)
        })
        .await
        {
            errors.push(e);
        }
    }
    errors.into_result()
}

/// Delete a controller-created CLB, or detach from a reused or preserved one
async fn release(req: &RequestContext, local: &ClbModel, remote: ClbModel) -> Result<ApplyOutcome> {
    if !remote.exists() {
        return Ok(released(None));
    }
    let id = remote.attributes.load_balancer_id.clone();
    let retry = &req.opts.conflict_retry;

    if remote.attributes.is_user_managed || local.attributes.preserve_on_delete {
        info!(lb_id = %id, reused = remote.attributes.is_user_managed, "detaching from load balancer");
        let empty = ClbModel {
            namespaced_name: req.name.clone(),
            ..Default::default()
        };
        reconcile_children(req, &id, &empty, &remote, true).await?;

        if !remote.attributes.is_user_managed {
            let owner = vec![TAG_KEY_OWNER.to_string()];
            retry_on_conflict(retry, "untag load balancer", || {
                req.provider.untag_resource(ResourceType::Clb, &id, &owner)
            })
            .await?;
        }
        return Ok(released(Some(id)));
    }

    if remote.attributes.delete_protection == Some(true) {
        let update = ClbAttributeUpdate {
            delete_protection: Some(false),
            ..Default::default()
        };
        retry_on_conflict(retry, "disable delete protection", || {
            req.provider.update_clb(&id, &update)
        })
        .await?;
    }
    retry_on_conflict(retry, "delete load balancer", || req.provider.delete_clb(&id)).await?;
    info!(lb_id = %id, "deleted load balancer");
    Ok(released(Some(id)))
}
