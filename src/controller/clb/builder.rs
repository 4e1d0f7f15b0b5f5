//! Desired CLB model from a Service

use tracing::debug;

use crate::annotations::{self as ann, ServiceAnnotations};
use crate::backend::{traffic_policy, EndpointResolver};
use crate::error::{Error, Result};
use crate::model::clb::{ClbAttributes, ClbHealthCheck, ClbListener, ClbProtocol};
use crate::model::{default_tags, ClbModel, LoadBalancer, NamedKey, ServerGroup, ServicePortRef};

use crate::controller::builder::{group_backends, service_ports};
use crate::controller::context::{LocalBuild, RequestContext};

/// Build the desired model
///
/// A Service that no longer needs a load balancer yields a model with
/// attributes only, enough for the applier to choose between delete and
/// detach.
pub async fn build_local(req: &RequestContext) -> Result<LocalBuild<ClbModel>> {
    let annotations = req.annotations();
    let attributes = attributes(req, &annotations)?;

    let mut model = LoadBalancer {
        namespaced_name: req.name.clone(),
        attributes,
        server_groups: Vec::new(),
        listeners: Vec::new(),
    };
    if !req.needs_load_balancer() {
        return Ok(LocalBuild {
            model,
            potentially_ready: false,
        });
    }

    let policy = traffic_policy(&req.service, &req.opts)?;
    let resolver = EndpointResolver::new(
        &req.service,
        &req.snapshot,
        &req.opts,
        req.provider.as_vpc(),
    )?;

    let protocol_ports = annotations.protocol_ports()?;
    let forward_ports = annotations.forward_ports()?;
    let vgroup_ports = annotations.vgroup_ports()?;
    let weight = annotations.get_i32(ann::WEIGHT)?;
    let ignore_weight_update = annotations.is_enabled(ann::IGNORE_WEIGHT_UPDATE)?;

    let mut potentially_ready = false;
    for port in service_ports(&req.service) {
        let key = NamedKey::clb(&req.name, req.cluster_id(), port.port);
        let protocol = match protocol_ports.get(&port.port) {
            Some(p) => p.parse::<ClbProtocol>()?,
            None => port.protocol.parse::<ClbProtocol>()?,
        };

        let mut listener = listener(&annotations, &port, protocol, &key)?;
        if let Some(target) = forward_ports.get(&port.port) {
            if protocol != ClbProtocol::Http {
                return Err(Error::ValidationError(format!(
                    "port {} forwards to {target} but is not an http listener",
                    port.port
                )));
            }
            listener.forward_port = Some(*target);
            model.listeners.push(listener);
            continue;
        }

        let user_group = vgroup_ports.iter().find(|(_, p)| *p == port.port);
        let group = match user_group {
            Some((id, _)) => {
                let (backends, ready) =
                    group_backends(req, &resolver, &port, policy, false, weight, &key.key()).await?;
                potentially_ready |= ready;
                ServerGroup {
                    id: id.clone(),
                    name: id.clone(),
                    named_key: None,
                    service_port: Some(port.clone()),
                    backends,
                    is_user_managed: true,
                    weight,
                    ignore_weight_update,
                    attributes: Default::default(),
                }
            }
            None => {
                let (backends, ready) =
                    group_backends(req, &resolver, &port, policy, false, None, &key.key()).await?;
                potentially_ready |= ready;
                ServerGroup {
                    id: String::new(),
                    name: key.key(),
                    named_key: Some(key.clone()),
                    service_port: Some(port.clone()),
                    backends,
                    is_user_managed: false,
                    weight: None,
                    ignore_weight_update,
                    attributes: Default::default(),
                }
            }
        };
        listener.vgroup_name = group.name.clone();
        model.server_groups.push(group);
        model.listeners.push(listener);
    }

    debug!(
        service = %req.name,
        %policy,
        groups = model.server_groups.len(),
        listeners = model.listeners.len(),
        "built local clb model"
    );
    Ok(LocalBuild {
        model,
        potentially_ready,
    })
}

fn attributes(req: &RequestContext, annotations: &ServiceAnnotations<'_>) -> Result<ClbAttributes> {
    let mut tags = default_tags(&req.load_balancer_name(), req.cluster_id());
    tags.extend(annotations.tags()?);

    Ok(ClbAttributes {
        load_balancer_id: annotations.get_string(ann::LOADBALANCER_ID).unwrap_or_default(),
        name: Some(
            annotations
                .get_string(ann::LOADBALANCER_NAME)
                .unwrap_or_else(|| req.load_balancer_name()),
        ),
        address: None,
        address_type: annotations.get_parsed(ann::ADDRESS_TYPE)?,
        address_ip_version: annotations.get_string(ann::IP_VERSION),
        spec: annotations.get_string(ann::SPEC),
        charge_type: annotations.get_string(ann::CHARGE_TYPE),
        bandwidth: annotations.get_i32(ann::BANDWIDTH)?,
        vswitch_id: annotations.get_string(ann::VSWITCH_ID),
        master_zone_id: annotations.get_string(ann::MASTER_ZONE_ID),
        slave_zone_id: annotations.get_string(ann::SLAVE_ZONE_ID),
        resource_group_id: annotations.get_string(ann::RESOURCE_GROUP_ID),
        delete_protection: annotations.get_bool(ann::DELETE_PROTECTION)?,
        modification_protection: annotations.get_string(ann::MODIFICATION_PROTECTION),
        tags,
        is_user_managed: req.is_reused(),
        preserve_on_delete: annotations.is_enabled(ann::PRESERVE_LB_ON_DELETE)?,
    })
}

fn listener(
    annotations: &ServiceAnnotations<'_>,
    port: &ServicePortRef,
    protocol: ClbProtocol,
    key: &NamedKey,
) -> Result<ClbListener> {
    let mut l = ClbListener::new(port.port, protocol);
    l.named_key = Some(key.clone());
    l.description = key.key();
    l.scheduler = annotations.get_string(ann::SCHEDULER);
    l.persistence_timeout = annotations.get_i32(ann::PERSISTENCE_TIMEOUT)?;
    l.established_timeout = annotations.get_i32(ann::ESTABLISHED_TIMEOUT)?;
    l.idle_timeout = annotations.get_i32(ann::IDLE_TIMEOUT)?;
    l.request_timeout = annotations.get_i32(ann::REQUEST_TIMEOUT)?;
    l.cert_id = annotations.get_string(ann::CERT_ID);
    l.ca_cert_id = annotations.get_string(ann::CA_CERT_ID);
    l.tls_cipher_policy = annotations.get_string(ann::TLS_CIPHER_POLICY);
    l.health_check = ClbHealthCheck {
        flag: annotations.get_bool(ann::HEALTH_CHECK_FLAG)?,
        check_type: annotations.get_string(ann::HEALTH_CHECK_TYPE),
        connect_port: annotations.get_i32(ann::HEALTH_CHECK_CONNECT_PORT)?,
        uri: annotations.get_string(ann::HEALTH_CHECK_URI),
        domain: annotations.get_string(ann::HEALTH_CHECK_DOMAIN),
        http_code: annotations.get_string(ann::HEALTH_CHECK_HTTP_CODE),
        interval: annotations.get_i32(ann::HEALTH_CHECK_INTERVAL)?,
        timeout: annotations.get_i32(ann::HEALTH_CHECK_TIMEOUT)?,
        connect_timeout: annotations.get_i32(ann::HEALTH_CHECK_CONNECT_TIMEOUT)?,
        healthy_threshold: annotations.get_i32(ann::HEALTHY_THRESHOLD)?,
        unhealthy_threshold: annotations.get_i32(ann::UNHEALTHY_THRESHOLD)?,
    };
    l.connection_drain = annotations.get_bool(ann::CONNECTION_DRAIN)?;
    l.connection_drain_timeout = annotations.get_i32(ann::CONNECTION_DRAIN_TIMEOUT)?;
    l.acl_status = annotations.get_bool(ann::ACL_STATUS)?;
    l.acl_id = annotations.get_string(ann::ACL_ID);
    l.acl_type = annotations.get_string(ann::ACL_TYPE);
    l.x_forwarded_for_proto = annotations.get_bool(ann::X_FORWARDED_FOR_PROTO)?;
    l.sticky_session = annotations.get_bool(ann::STICKY_SESSION)?;
    l.sticky_session_type = annotations.get_string(ann::STICKY_SESSION_TYPE);
    l.cookie_timeout = annotations.get_i32(ann::COOKIE_TIMEOUT)?;
    l.cookie = annotations.get_string(ann::COOKIE);
    Ok(l)
}
