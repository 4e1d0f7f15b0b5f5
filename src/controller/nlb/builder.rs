//! Desired NLB model from a Service

use tracing::debug;

use crate::annotations::{self as ann, ServiceAnnotations};
use crate::backend::{traffic_policy, EndpointResolver};
use crate::error::{Error, Result};
use crate::model::nlb::{NlbAttributes, NlbListener, NlbProtocol};
use crate::model::{
    default_tags, GroupHealthCheck, LoadBalancer, NamedKey, NlbModel, PortSpec, ServerGroup,
    ServerGroupAttributes, ServerGroupType, TrafficPolicy,
};

use crate::controller::builder::{group_backends, service_ports};
use crate::controller::context::{LocalBuild, RequestContext};

/// Build the desired model
///
/// One server group per Service port; its listener listens on the port or
/// on the range `listener-port-range` maps to it.
pub async fn build_local(req: &RequestContext) -> Result<LocalBuild<NlbModel>> {
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

    let group_type = server_group_type(&annotations)?;
    let ip_targets = group_type == ServerGroupType::Ip;
    let policy = if ip_targets {
        TrafficPolicy::Eni
    } else {
        traffic_policy(&req.service, &req.opts)?
    };
    let resolver = EndpointResolver::new(
        &req.service,
        &req.snapshot,
        &req.opts,
        req.provider.as_vpc(),
    )?;

    let protocol_ports = annotations.protocol_ports()?;
    let port_ranges = annotations.listener_port_ranges()?;
    let vgroup_ports = annotations.vgroup_ports()?;
    let weight = annotations.get_i32(ann::WEIGHT)?;
    let ignore_weight_update = annotations.is_enabled(ann::IGNORE_WEIGHT_UPDATE)?;

    let mut potentially_ready = false;
    for port in service_ports(&req.service) {
        let protocol = match protocol_ports.get(&port.port) {
            Some(p) => p.parse::<NlbProtocol>()?,
            None => port.protocol.parse::<NlbProtocol>()?,
        };
        let listen_on = port_ranges
            .get(&port.port)
            .copied()
            .unwrap_or(PortSpec::Single(port.port));
        let any_port = matches!(listen_on, PortSpec::Range { .. });

        let group_protocol = protocol.server_group_protocol();
        let group_key = NamedKey::nlb(
            &req.name,
            req.cluster_id(),
            &group_protocol.to_string(),
            PortSpec::Single(port.port),
        );
        let listener_key = NamedKey::nlb(&req.name, req.cluster_id(), &protocol.to_string(), listen_on);

        let user_group = vgroup_ports.iter().find(|(_, p)| *p == port.port);
        let group_weight = user_group.and(weight);
        let (mut backends, ready) = group_backends(
            req,
            &resolver,
            &port,
            policy,
            ip_targets,
            group_weight,
            &group_key.key(),
        )
        .await?;
        potentially_ready |= ready;
        if any_port {
            // servers of an any-port group take whatever port the listener matched
            for b in &mut backends {
                b.port = 0;
            }
        }

        let mut group = match user_group {
            Some((id, _)) => ServerGroup {
                id: id.clone(),
                name: id.clone(),
                is_user_managed: true,
                weight: group_weight,
                ..Default::default()
            },
            None => ServerGroup {
                name: group_key.key(),
                named_key: Some(group_key.clone()),
                ..Default::default()
            },
        };
        group.service_port = Some(port.clone());
        group.backends = backends;
        group.ignore_weight_update = ignore_weight_update;
        group.attributes = group_attributes(&annotations, group_protocol, group_type, any_port)?;

        let mut listener = NlbListener::new(listen_on, protocol);
        listener.named_key = Some(listener_key.clone());
        listener.description = listener_key.key();
        listener.server_group_name = group.name.clone();
        listener.idle_timeout = annotations.get_i32(ann::IDLE_TIMEOUT)?;
        if protocol == NlbProtocol::TcpSsl {
            listener.certificate_ids = id_list(&annotations, ann::CERT_ID);
            listener.ca_certificate_ids = id_list(&annotations, ann::CA_CERT_ID);
            listener.ca_enabled = (!listener.ca_certificate_ids.is_empty()).then_some(true);
        }
        listener.security_policy_id = annotations.get_string(ann::SECURITY_POLICY_ID);
        listener.proxy_protocol_enabled = annotations.get_bool(ann::PROXY_PROTOCOL)?;
        listener.cps = annotations.get_i32(ann::CPS)?;

        model.server_groups.push(group);
        model.listeners.push(listener);
    }

    debug!(
        service = %req.name,
        %policy,
        groups = model.server_groups.len(),
        listeners = model.listeners.len(),
        "built local nlb model"
    );
    Ok(LocalBuild {
        model,
        potentially_ready,
    })
}

fn attributes(req: &RequestContext, annotations: &ServiceAnnotations<'_>) -> Result<NlbAttributes> {
    let mut tags = default_tags(&req.load_balancer_name(), req.cluster_id());
    tags.extend(annotations.tags()?);

    let modification_protection = annotations
        .get(ann::MODIFICATION_PROTECTION)
        .map(|v| match v {
            "ConsoleProtection" => Ok(true),
            "NonProtection" => Ok(false),
            other => Err(Error::ValidationError(format!(
                "annotation {} value {other:?} is invalid: expected ConsoleProtection or NonProtection",
                ann::key(ann::MODIFICATION_PROTECTION)
            ))),
        })
        .transpose()?;

    Ok(NlbAttributes {
        load_balancer_id: annotations.get_string(ann::LOADBALANCER_ID).unwrap_or_default(),
        name: Some(
            annotations
                .get_string(ann::LOADBALANCER_NAME)
                .unwrap_or_else(|| req.load_balancer_name()),
        ),
        address_type: annotations.get_parsed(ann::ADDRESS_TYPE)?,
        address_ip_version: annotations.get_string(ann::IP_VERSION),
        dns_name: None,
        vpc_id: (!req.opts.vpc_id.is_empty()).then(|| req.opts.vpc_id.clone()),
        zone_mappings: annotations.zone_mappings()?,
        resource_group_id: annotations.get_string(ann::RESOURCE_GROUP_ID),
        delete_protection: annotations.get_bool(ann::DELETE_PROTECTION)?,
        modification_protection,
        tags,
        is_user_managed: req.is_reused(),
        preserve_on_delete: annotations.is_enabled(ann::PRESERVE_LB_ON_DELETE)?,
    })
}

fn server_group_type(annotations: &ServiceAnnotations<'_>) -> Result<ServerGroupType> {
    match annotations.get(ann::SERVER_GROUP_TYPE).map(str::to_ascii_lowercase).as_deref() {
        None | Some("instance") => Ok(ServerGroupType::Instance),
        Some("ip") => Ok(ServerGroupType::Ip),
        Some(other) => Err(Error::ValidationError(format!(
            "annotation {} value {other:?} is invalid: expected instance or ip",
            ann::key(ann::SERVER_GROUP_TYPE)
        ))),
    }
}

fn group_attributes(
    annotations: &ServiceAnnotations<'_>,
    protocol: NlbProtocol,
    group_type: ServerGroupType,
    any_port: bool,
) -> Result<ServerGroupAttributes> {
    Ok(ServerGroupAttributes {
        protocol: Some(protocol.to_string()),
        scheduler: annotations.get_string(ann::SCHEDULER),
        connection_drain_enabled: annotations.get_bool(ann::CONNECTION_DRAIN)?,
        connection_drain_timeout: annotations.get_i32(ann::CONNECTION_DRAIN_TIMEOUT)?,
        preserve_client_ip: annotations.get_bool(ann::PRESERVE_CLIENT_IP)?,
        any_port_enabled: any_port,
        group_type,
        health_check: GroupHealthCheck {
            enabled: annotations.get_bool(ann::HEALTH_CHECK_FLAG)?,
            check_type: annotations.get_string(ann::HEALTH_CHECK_TYPE),
            connect_port: annotations.get_i32(ann::HEALTH_CHECK_CONNECT_PORT)?,
            connect_timeout: annotations.get_i32(ann::HEALTH_CHECK_CONNECT_TIMEOUT)?,
            interval: annotations.get_i32(ann::HEALTH_CHECK_INTERVAL)?,
            healthy_threshold: annotations.get_i32(ann::HEALTHY_THRESHOLD)?,
            unhealthy_threshold: annotations.get_i32(ann::UNHEALTHY_THRESHOLD)?,
            uri: annotations.get_string(ann::HEALTH_CHECK_URI),
            domain: annotations.get_string(ann::HEALTH_CHECK_DOMAIN),
        },
    })
}

/// Comma-separated certificate ids
fn id_list(annotations: &ServiceAnnotations<'_>, suffix: &str) -> Vec<String> {
    annotations
        .get(suffix)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
