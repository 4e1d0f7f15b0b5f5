//! Classic load balancer (CLB) attributes and listeners

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::model::{
    AddressType, ListenerIdentity, ListenerStatus, LoadBalancerAttributes, NamedKey, Tag,
};

pub const DEFAULT_CLB_SPEC: &str = "slb.s1.small";
pub const DEFAULT_CHARGE_TYPE: &str = "paybytraffic";
pub const DEFAULT_MODIFICATION_PROTECTION: &str = "ConsoleProtection";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClbAttributes {
    /// Empty until created
    pub load_balancer_id: String,
    pub name: Option<String>,
    /// Assigned by the cloud
    pub address: Option<String>,
    pub address_type: Option<AddressType>,
    pub address_ip_version: Option<String>,
    pub spec: Option<String>,
    pub charge_type: Option<String>,
    pub bandwidth: Option<i32>,
    pub vswitch_id: Option<String>,
    pub master_zone_id: Option<String>,
    pub slave_zone_id: Option<String>,
    pub resource_group_id: Option<String>,
    pub delete_protection: Option<bool>,
    pub modification_protection: Option<String>,
    pub tags: Vec<Tag>,
    pub is_user_managed: bool,
    pub preserve_on_delete: bool,
}

impl LoadBalancerAttributes for ClbAttributes {
    fn load_balancer_id(&self) -> &str {
        &self.load_balancer_id
    }

    fn is_user_managed(&self) -> bool {
        self.is_user_managed
    }

    fn preserve_on_delete(&self) -> bool {
        self.preserve_on_delete
    }

    fn tags(&self) -> &[Tag] {
        &self.tags
    }

    fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClbProtocol {
    Tcp,
    Udp,
    Http,
    Https,
}

impl fmt::Display for ClbProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClbProtocol::Tcp => write!(f, "tcp"),
            ClbProtocol::Udp => write!(f, "udp"),
            ClbProtocol::Http => write!(f, "http"),
            ClbProtocol::Https => write!(f, "https"),
        }
    }
}

impl FromStr for ClbProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(ClbProtocol::Tcp),
            "udp" => Ok(ClbProtocol::Udp),
            "http" => Ok(ClbProtocol::Http),
            "https" => Ok(ClbProtocol::Https),
            other => Err(Error::ValidationError(format!(
                "unsupported listener protocol {other:?}"
            ))),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClbHealthCheck {
    pub flag: Option<bool>,
    pub check_type: Option<String>,
    pub connect_port: Option<i32>,
    pub uri: Option<String>,
    pub domain: Option<String>,
    pub http_code: Option<String>,
    pub interval: Option<i32>,
    pub timeout: Option<i32>,
    pub connect_timeout: Option<i32>,
    pub healthy_threshold: Option<i32>,
    pub unhealthy_threshold: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClbListener {
    pub port: i32,
    pub protocol: ClbProtocol,
    /// Resolved from `vgroup_name` at apply time
    pub vgroup_id: String,
    pub vgroup_name: String,
    pub named_key: Option<NamedKey>,
    pub description: String,
    pub status: ListenerStatus,
    pub bandwidth: Option<i32>,
    pub scheduler: Option<String>,
    pub persistence_timeout: Option<i32>,
    pub established_timeout: Option<i32>,
    pub idle_timeout: Option<i32>,
    pub request_timeout: Option<i32>,
    pub cert_id: Option<String>,
    pub ca_cert_id: Option<String>,
    pub tls_cipher_policy: Option<String>,
    pub health_check: ClbHealthCheck,
    pub connection_drain: Option<bool>,
    pub connection_drain_timeout: Option<i32>,
    pub acl_status: Option<bool>,
    pub acl_id: Option<String>,
    pub acl_type: Option<String>,
    pub x_forwarded_for_proto: Option<bool>,
    pub sticky_session: Option<bool>,
    pub sticky_session_type: Option<String>,
    pub cookie_timeout: Option<i32>,
    pub cookie: Option<String>,
    /// HTTP listener that redirects to this HTTPS port instead of serving
    pub forward_port: Option<i32>,
}

impl ClbListener {
    pub fn new(port: i32, protocol: ClbProtocol) -> Self {
        Self {
            port,
            protocol,
            vgroup_id: String::new(),
            vgroup_name: String::new(),
            named_key: None,
            description: String::new(),
            status: ListenerStatus::Running,
            bandwidth: None,
            scheduler: None,
            persistence_timeout: None,
            established_timeout: None,
            idle_timeout: None,
            request_timeout: None,
            cert_id: None,
            ca_cert_id: None,
            tls_cipher_policy: None,
            health_check: ClbHealthCheck::default(),
            connection_drain: None,
            connection_drain_timeout: None,
            acl_status: None,
            acl_id: None,
            acl_type: None,
            x_forwarded_for_proto: None,
            sticky_session: None,
            sticky_session_type: None,
            cookie_timeout: None,
            cookie: None,
            forward_port: None,
        }
    }

    pub fn is_forwarding(&self) -> bool {
        self.forward_port.is_some()
    }
}

impl ListenerIdentity for ClbListener {
    type Key = (i32, ClbProtocol);

    fn match_key(&self) -> Self::Key {
        (self.port, self.protocol)
    }

    fn named_key(&self) -> Option<&NamedKey> {
        self.named_key.as_ref()
    }
}

/// Partial attribute update for an existing CLB
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClbAttributeUpdate {
    pub name: Option<String>,
    pub spec: Option<String>,
    pub charge_type: Option<String>,
    pub bandwidth: Option<i32>,
    pub delete_protection: Option<bool>,
    pub modification_protection: Option<String>,
}

impl ClbAttributeUpdate {
    pub fn is_empty(&self) -> bool {
        *self == ClbAttributeUpdate::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parse() {
        assert_eq!("HTTPS".parse::<ClbProtocol>().unwrap(), ClbProtocol::Https);
        assert!("sctp".parse::<ClbProtocol>().is_err());
    }

    #[test]
    fn test_listener_identity() {
        let l = ClbListener::new(443, ClbProtocol::Https);
        assert_eq!(l.match_key(), (443, ClbProtocol::Https));
        assert!(!l.is_forwarding());
    }
}
