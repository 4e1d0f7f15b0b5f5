//! Actual NLB state read back from the cloud

use std::collections::HashMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::model::named_key::is_owned_description;
use crate::model::nlb::NlbAttributes;
use crate::model::{
    Delimiter, LoadBalancer, LoadBalancerAttributes, NamedKey, NlbModel, ServerGroup, Tag,
    TAG_KEY_OWNER,
};
use crate::provider::ResourceType;

use crate::controller::context::RequestContext;
use crate::controller::reuse::validate_reuse;

/// Locate the Service's NLB and read everything attached to it
///
/// Server groups are not children of the load balancer: they are gathered
/// from the ownership tag, the user-managed groups the Service names and
/// whatever the remote listeners point at.
pub async fn build_remote(req: &RequestContext, local: &NlbModel) -> Result<NlbModel> {
    let provider = &req.provider;
    let owner = [Tag::new(TAG_KEY_OWNER, req.load_balancer_name())];
    let reused_id = local
        .attributes
        .is_user_managed
        .then(|| local.attributes.load_balancer_id.clone());

    let found = match &reused_id {
        Some(id) => Some(
            provider
                .find_nlb_by_id(id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("load balancer {id} from annotation")))?,
        ),
        None => provider.find_nlb_by_tags(&owner).await?,
    };

    let mut groups: Vec<ServerGroup> = provider.list_nlb_server_groups(&owner).await?;

    let Some(mut attributes) = found else {
        // groups can outlive a deleted load balancer
        let mut model = LoadBalancer {
            namespaced_name: req.name.clone(),
            attributes: NlbAttributes {
                is_user_managed: local.attributes.is_user_managed,
                preserve_on_delete: local.attributes.preserve_on_delete,
                ..Default::default()
            },
            server_groups: groups,
            listeners: Vec::new(),
        };
        mark_ownership(req, &mut model.server_groups);
        return Ok(model);
    };

    let id = attributes.load_balancer_id.clone();
    attributes.is_user_managed = local.attributes.is_user_managed;
    attributes.preserve_on_delete = local.attributes.preserve_on_delete;
    attributes.tags = provider.list_tags(ResourceType::Nlb, &id).await?;

    if attributes.is_user_managed {
        validate_reuse(req, &id, attributes.tags(), attributes.address())?;
    }

    let mut listeners = provider.list_nlb_listeners(&id).await?;

    let wanted = local
        .server_groups
        .iter()
        .filter(|g| g.is_user_managed)
        .map(|g| g.id.clone())
        .chain(listeners.iter().map(|l| l.server_group_id.clone()))
        .filter(|gid| !gid.is_empty());
    for gid in wanted.collect::<Vec<_>>() {
        if groups.iter().any(|g| g.id == gid) {
            continue;
        }
        if let Some(group) = provider.get_nlb_server_group(&gid).await? {
            groups.push(group);
        }
    }
    mark_ownership(req, &mut groups);

    let group_names: HashMap<&str, &str> = groups
        .iter()
        .map(|g| (g.id.as_str(), g.name.as_str()))
        .collect();
    for listener in &mut listeners {
        listener.named_key = NamedKey::try_parse(&listener.description, Delimiter::Dot);
        listener.server_group_name = group_names
            .get(listener.server_group_id.as_str())
            .map(|n| n.to_string())
            .unwrap_or_default();
    }

    debug!(
        service = %req.name,
        lb_id = %id,
        groups = groups.len(),
        listeners = listeners.len(),
        "fetched remote nlb model"
    );
    Ok(LoadBalancer {
        namespaced_name: req.name.clone(),
        attributes,
        server_groups: groups,
        listeners,
    })
}

fn mark_ownership(req: &RequestContext, groups: &mut [ServerGroup]) {
    let cluster_id = req.cluster_id();
    for group in groups {
        group.named_key = NamedKey::try_parse(&group.name, Delimiter::Dot);
        group.is_user_managed = !group.is_owned_by(&req.name, cluster_id);
        for backend in &mut group.backends {
            backend.is_user_managed =
                !is_owned_description(&backend.description, Delimiter::Dot, &req.name, cluster_id);
        }
    }
}
