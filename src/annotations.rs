//! Service annotations understood by the controller
//!
//! Every key lives under [`ANNOTATION_PREFIX`]; the constants below hold the
//! suffix only. [`ServiceAnnotations`] gives typed access and turns malformed
//! values into validation errors.

use std::collections::BTreeMap;
use std::str::FromStr;

use k8s_openapi::api::core::v1::Service;

use crate::error::{Error, Result};
use crate::model::nlb::ZoneMapping;
use crate::model::{PortSpec, Tag};

pub const ANNOTATION_PREFIX: &str = "service.beta.kubernetes.io/alibaba-cloud-loadbalancer-";

/// Hash of the last applied spec, written back after a successful apply
pub const SERVICE_HASH_ANNOTATION: &str = "service.beta.kubernetes.io/hash";

pub const LOADBALANCER_ID: &str = "id";
pub const OVERRIDE_LISTENERS: &str = "force-override-listeners";
pub const ADDRESS_TYPE: &str = "address-type";
pub const SPEC: &str = "spec";
pub const CHARGE_TYPE: &str = "charge-type";
pub const BANDWIDTH: &str = "bandwidth";
pub const VSWITCH_ID: &str = "vswitch-id";
pub const MASTER_ZONE_ID: &str = "master-zoneid";
pub const SLAVE_ZONE_ID: &str = "slave-zoneid";
pub const LOADBALANCER_NAME: &str = "name";
pub const RESOURCE_GROUP_ID: &str = "resource-group-id";
pub const DELETE_PROTECTION: &str = "delete-protection";
pub const MODIFICATION_PROTECTION: &str = "modification-protection";
pub const ADDITIONAL_TAGS: &str = "additional-resource-tags";
pub const IP_VERSION: &str = "ip-version";
pub const PRESERVE_LB_ON_DELETE: &str = "preserve-lb-on-delete";
pub const BACKEND_TYPE: &str = "backend-type";
pub const BACKEND_LABEL: &str = "backend-label";
pub const REMOVE_UNSCHEDULED: &str = "remove-unscheduled-backend";
pub const VGROUP_PORT: &str = "vgroup-port";
pub const WEIGHT: &str = "weight";
pub const IGNORE_WEIGHT_UPDATE: &str = "ignore-weight-update";
pub const PROTOCOL_PORT: &str = "protocol-port";
pub const SCHEDULER: &str = "scheduler";
pub const PERSISTENCE_TIMEOUT: &str = "persistence-timeout";
pub const ESTABLISHED_TIMEOUT: &str = "established-timeout";
pub const IDLE_TIMEOUT: &str = "idle-timeout";
pub const REQUEST_TIMEOUT: &str = "request-timeout";
pub const CERT_ID: &str = "cert-id";
pub const CA_CERT_ID: &str = "ca-cert-id";
pub const TLS_CIPHER_POLICY: &str = "tls-cipher-policy";
pub const FORWARD_PORT: &str = "forward-port";
pub const HEALTH_CHECK_FLAG: &str = "health-check-flag";
pub const HEALTH_CHECK_TYPE: &str = "health-check-type";
pub const HEALTH_CHECK_CONNECT_PORT: &str = "health-check-connect-port";
pub const HEALTH_CHECK_URI: &str = "health-check-uri";
pub const HEALTH_CHECK_DOMAIN: &str = "health-check-domain";
pub const HEALTH_CHECK_HTTP_CODE: &str = "health-check-httpcode";
pub const HEALTH_CHECK_INTERVAL: &str = "health-check-interval";
pub const HEALTH_CHECK_TIMEOUT: &str = "health-check-timeout";
pub const HEALTH_CHECK_CONNECT_TIMEOUT: &str = "health-check-connect-timeout";
pub const HEALTHY_THRESHOLD: &str = "healthy-threshold";
pub const UNHEALTHY_THRESHOLD: &str = "unhealthy-threshold";
pub const CONNECTION_DRAIN: &str = "connection-drain";
pub const CONNECTION_DRAIN_TIMEOUT: &str = "connection-drain-timeout";
pub const ACL_STATUS: &str = "acl-status";
pub const ACL_ID: &str = "acl-id";
pub const ACL_TYPE: &str = "acl-type";
pub const X_FORWARDED_FOR_PROTO: &str = "x-forwarded-for-proto";
pub const STICKY_SESSION: &str = "sticky-session";
pub const STICKY_SESSION_TYPE: &str = "sticky-session-type";
pub const COOKIE_TIMEOUT: &str = "cookie-timeout";
pub const COOKIE: &str = "cookie";
pub const ZONE_MAPS: &str = "zone-maps";
pub const SERVER_GROUP_TYPE: &str = "server-group-type";
pub const PRESERVE_CLIENT_IP: &str = "preserve-client-ip";
pub const PROXY_PROTOCOL: &str = "proxy-protocol";
pub const LISTENER_PORT_RANGE: &str = "listener-port-range";
pub const CPS: &str = "cps";
pub const SECURITY_POLICY_ID: &str = "security-policy-id";

/// Full annotation key for a suffix
pub fn key(suffix: &str) -> String {
    format!("{ANNOTATION_PREFIX}{suffix}")
}

/// Typed view over the annotations of one Service
#[derive(Clone, Copy, Debug)]
pub struct ServiceAnnotations<'a> {
    map: Option<&'a BTreeMap<String, String>>,
}

impl<'a> ServiceAnnotations<'a> {
    pub fn new(svc: &'a Service) -> Self {
        Self {
            map: svc.metadata.annotations.as_ref(),
        }
    }

    /// Trimmed, non-empty value of `prefix + suffix`
    pub fn get(&self, suffix: &str) -> Option<&'a str> {
        self.map
            .and_then(|m| m.get(&key(suffix)))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn get_string(&self, suffix: &str) -> Option<String> {
        self.get(suffix).map(str::to_string)
    }

    pub fn has(&self, suffix: &str) -> bool {
        self.get(suffix).is_some()
    }

    /// `on`/`true` and `off`/`false`, case-insensitive
    pub fn get_bool(&self, suffix: &str) -> Result<Option<bool>> {
        self.get(suffix)
            .map(|v| match v.to_ascii_lowercase().as_str() {
                "on" | "true" => Ok(true),
                "off" | "false" => Ok(false),
                other => Err(invalid(suffix, other, "expected on or off")),
            })
            .transpose()
    }

    /// Absent means `false`
    pub fn is_enabled(&self, suffix: &str) -> Result<bool> {
        Ok(self.get_bool(suffix)?.unwrap_or(false))
    }

    pub fn get_i32(&self, suffix: &str) -> Result<Option<i32>> {
        self.get(suffix)
            .map(|v| {
                v.parse::<i32>()
                    .map_err(|e| invalid(suffix, v, &e.to_string()))
            })
            .transpose()
    }

    pub fn get_parsed<T>(&self, suffix: &str) -> Result<Option<T>>
    where
        T: FromStr<Err = Error>,
    {
        self.get(suffix).map(str::parse).transpose()
    }

    /// `k1=v1,k2=v2`
    pub fn tags(&self) -> Result<Vec<Tag>> {
        self.get(ADDITIONAL_TAGS)
            .map(|v| parse_pairs(ADDITIONAL_TAGS, v, '='))
            .transpose()
            .map(|pairs| {
                pairs
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| Tag::new(k, v))
                    .collect()
            })
    }

    /// Node label selector, `k1=v1,k2=v2`
    pub fn backend_labels(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .get(BACKEND_LABEL)
            .map(|v| parse_pairs(BACKEND_LABEL, v, '='))
            .transpose()?
            .unwrap_or_default()
            .into_iter()
            .collect())
    }

    /// User-managed groups, `groupId:port,...`
    pub fn vgroup_ports(&self) -> Result<Vec<(String, i32)>> {
        let Some(value) = self.get(VGROUP_PORT) else {
            return Ok(Vec::new());
        };
        parse_pairs(VGROUP_PORT, value, ':')?
            .into_iter()
            .map(|(id, port)| {
                let port = port
                    .parse::<i32>()
                    .map_err(|e| invalid(VGROUP_PORT, value, &e.to_string()))?;
                Ok((id, port))
            })
            .collect()
    }

    /// Listener protocol per service port, `https:443,http:80`
    pub fn protocol_ports(&self) -> Result<BTreeMap<i32, String>> {
        let Some(value) = self.get(PROTOCOL_PORT) else {
            return Ok(BTreeMap::new());
        };
        parse_pairs(PROTOCOL_PORT, value, ':')?
            .into_iter()
            .map(|(protocol, port)| {
                let port = port
                    .parse::<i32>()
                    .map_err(|e| invalid(PROTOCOL_PORT, value, &e.to_string()))?;
                Ok((port, protocol.to_ascii_lowercase()))
            })
            .collect()
    }

    /// HTTP port redirected to an HTTPS port, `80:443`
    pub fn forward_ports(&self) -> Result<BTreeMap<i32, i32>> {
        let Some(value) = self.get(FORWARD_PORT) else {
            return Ok(BTreeMap::new());
        };
        parse_pairs(FORWARD_PORT, value, ':')?
            .into_iter()
            .map(|(from, to)| {
                let from = from
                    .parse::<i32>()
                    .map_err(|e| invalid(FORWARD_PORT, value, &e.to_string()))?;
                let to = to
                    .parse::<i32>()
                    .map_err(|e| invalid(FORWARD_PORT, value, &e.to_string()))?;
                Ok((from, to))
            })
            .collect()
    }

    /// NLB zone placement, `zone:vswitch,...`
    pub fn zone_mappings(&self) -> Result<Vec<ZoneMapping>> {
        let Some(value) = self.get(ZONE_MAPS) else {
            return Ok(Vec::new());
        };
        Ok(parse_pairs(ZONE_MAPS, value, ':')?
            .into_iter()
            .map(|(zone_id, vswitch_id)| ZoneMapping {
                zone_id,
                vswitch_id,
                allocation_id: None,
            })
            .collect())
    }

    /// NLB listener port ranges keyed by service port, `start-end:servicePort,...`
    pub fn listener_port_ranges(&self) -> Result<BTreeMap<i32, PortSpec>> {
        let Some(value) = self.get(LISTENER_PORT_RANGE) else {
            return Ok(BTreeMap::new());
        };
        parse_pairs(LISTENER_PORT_RANGE, value, ':')?
            .into_iter()
            .map(|(range, port)| {
                let bad = |why: &str| invalid(LISTENER_PORT_RANGE, value, why);
                let (start, end) = range
                    .split_once('-')
                    .ok_or_else(|| bad("range must be start-end"))?;
                let start = start.trim().parse::<i32>().map_err(|e| bad(&e.to_string()))?;
                let end = end.trim().parse::<i32>().map_err(|e| bad(&e.to_string()))?;
                if !(1..=65535).contains(&start) || end < start || end > 65535 {
                    return Err(bad("range must satisfy 1 <= start <= end <= 65535"));
                }
                let port = port.parse::<i32>().map_err(|e| bad(&e.to_string()))?;
                Ok((port, PortSpec::Range { start, end }))
            })
            .collect()
    }
}

fn invalid(suffix: &str, value: &str, why: &str) -> Error {
    Error::ValidationError(format!("annotation {} value {value:?} is invalid: {why}", key(suffix)))
}

fn parse_pairs(suffix: &str, value: &str, sep: char) -> Result<Vec<(String, String)>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once(sep) {
            Some((k, v)) if !k.trim().is_empty() && !v.trim().is_empty() => {
                Ok((k.trim().to_string(), v.trim().to_string()))
            }
            _ => Err(invalid(suffix, value, &format!("item {item:?} is not k{sep}v"))),
        })
        .collect()
}
