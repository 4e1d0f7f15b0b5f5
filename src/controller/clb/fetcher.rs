//! Actual CLB state read back from the cloud

use std::collections::HashMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::model::clb::ClbAttributes;
use crate::model::named_key::is_owned_description;
use crate::model::{
    ClbModel, Delimiter, LoadBalancer, LoadBalancerAttributes, NamedKey, Tag, TAG_KEY_OWNER,
};
use crate::provider::ResourceType;

use crate::controller::context::RequestContext;
use crate::controller::reuse::validate_reuse;

/// Locate the Service's CLB and read everything attached to it
///
/// The id annotation wins over the ownership tag; an annotated id that does
/// not exist is an error. A missing controller-created CLB yields an empty
/// model.
pub async fn build_remote(req: &RequestContext, local: &ClbModel) -> Result<ClbModel> {
    let provider = &req.provider;
    let reused_id = local.attributes.is_user_managed.then(|| local.attributes.load_balancer_id.clone());

    let found = match &reused_id {
        Some(id) => Some(
            provider
                .find_clb_by_id(id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("load balancer {id} from annotation")))?,
        ),
        None => {
            provider
                .find_clb_by_tags(&[Tag::new(TAG_KEY_OWNER, req.load_balancer_name())])
                .await?
        }
    };

    let Some(mut attributes) = found else {
        return Ok(LoadBalancer {
            namespaced_name: req.name.clone(),
            attributes: ClbAttributes {
                is_user_managed: local.attributes.is_user_managed,
                preserve_on_delete: local.attributes.preserve_on_delete,
                ..Default::default()
            },
            server_groups: Vec::new(),
            listeners: Vec::new(),
        });
    };

    let id = attributes.load_balancer_id.clone();
    attributes.is_user_managed = local.attributes.is_user_managed;
    attributes.preserve_on_delete = local.attributes.preserve_on_delete;
    attributes.tags = provider.list_tags(ResourceType::Clb, &id).await?;

    if attributes.is_user_managed {
        validate_reuse(req, &id, attributes.tags(), attributes.address())?;
    }

    let cluster_id = req.cluster_id();
    let mut server_groups = provider.describe_vserver_groups(&id).await?;
    for group in &mut server_groups {
        group.named_key = NamedKey::try_parse(&group.name, Delimiter::Slash);
        group.is_user_managed = !group.is_owned_by(&req.name, cluster_id);
        for backend in &mut group.backends {
            backend.is_user_managed =
                !is_owned_description(&backend.description, Delimiter::Slash, &req.name, cluster_id);
        }
    }

    let group_names: HashMap<&str, &str> = server_groups
        .iter()
        .map(|g| (g.id.as_str(), g.name.as_str()))
        .collect();
    let mut listeners = provider.describe_clb_listeners(&id).await?;
    for listener in &mut listeners {
        listener.named_key = NamedKey::try_parse(&listener.description, Delimiter::Slash);
        listener.vgroup_name = group_names
            .get(listener.vgroup_id.as_str())
            .map(|n| n.to_string())
            .unwrap_or_default();
    }

    debug!(
        service = %req.name,
        lb_id = %id,
        groups = server_groups.len(),
        listeners = listeners.len(),
        "fetched remote clb model"
    );
    Ok(LoadBalancer {
        namespaced_name: req.name.clone(),
        attributes,
        server_groups,
        listeners,
    })
}
